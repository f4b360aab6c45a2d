//! Command-line interface for watermark-sync
//!
//! # Usage Examples
//!
//! ```bash
//! # First load of a table
//! watermark-sync run orders orders warehouse initial
//!
//! # Regular incremental load
//! watermark-sync run orders orders warehouse delta
//!
//! # Take over a table left RUNNING by a killed run
//! watermark-sync run orders orders warehouse delta --recover-stale
//!
//! # Forget a table's watermark
//! watermark-sync reset orders warehouse
//! ```
//!
//! The configuration file defaults to `watermark-sync.toml` and can be set
//! with `--config` or `WATERMARK_SYNC_CONFIG`.

use std::path::PathBuf;

use anyhow::Context;
use checkpoint::{LoadMode, LoadStateTracker};
use chrono::Local;
use clap::{Parser, Subcommand, ValueEnum};
use tracing::info;
use watermark_sync::notify::{self, FailureNotice};
use watermark_sync::{logging, Config, RunController, RunIdentity, RunRequest, RunSettings};
use watermark_sync_postgresql::{list_states, PostgresConnector, PostgresLedger};

#[derive(Parser)]
#[command(name = "watermark-sync")]
#[command(about = "Incremental watermark-based PostgreSQL to PostgreSQL replication")]
#[command(long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Replicate one table
    Run {
        /// Table in the source schema
        source_table: String,

        /// Table in the target schema
        target_table: String,

        /// Target alias from the `[targets]` section of the config
        database_alias: String,

        #[arg(value_enum)]
        load_mode: CliLoadMode,

        /// Procedure to call on the target after the load (`proc` or `schema.proc`)
        stored_procedure: Option<String>,

        #[arg(long, env = "WATERMARK_SYNC_CONFIG", default_value = "watermark-sync.toml")]
        config: PathBuf,

        /// Start even if the table is still marked RUNNING
        #[arg(long)]
        recover_stale: bool,
    },

    /// Create the ledger schema and tables if missing
    InitLedger {
        database_alias: String,

        #[arg(long, env = "WATERMARK_SYNC_CONFIG", default_value = "watermark-sync.toml")]
        config: PathBuf,
    },

    /// Drop a table's load state so its next run is an initial load
    Reset {
        source_table: String,

        database_alias: String,

        #[arg(long, env = "WATERMARK_SYNC_CONFIG", default_value = "watermark-sync.toml")]
        config: PathBuf,

        /// Reset even if the table is still marked RUNNING
        #[arg(long)]
        recover_stale: bool,
    },

    /// Print the load state of every tracked table
    Status {
        database_alias: String,

        #[arg(long, env = "WATERMARK_SYNC_CONFIG", default_value = "watermark-sync.toml")]
        config: PathBuf,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum CliLoadMode {
    Initial,
    Delta,
}

impl From<CliLoadMode> for LoadMode {
    fn from(mode: CliLoadMode) -> Self {
        match mode {
            CliLoadMode::Initial => LoadMode::Initial,
            CliLoadMode::Delta => LoadMode::Delta,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = run().await {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
    Ok(())
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            source_table,
            target_table,
            database_alias,
            load_mode,
            stored_procedure,
            config,
            recover_stale,
        } => {
            let request = RunRequest {
                source_table,
                target_table,
                mode: load_mode.into(),
                stored_procedure,
                recover_stale,
            };
            run_table(request, &database_alias, &config).await
        }
        Commands::InitLedger {
            database_alias,
            config,
        } => {
            logging::init(None)?;
            let config = Config::load(&config)?;
            let ledger = connect_ledger(&config, &database_alias).await?;
            ledger.ensure_schema().await?;
            info!("Ledger tables ready for {database_alias}");
            Ok(())
        }
        Commands::Reset {
            source_table,
            database_alias,
            config,
            recover_stale,
        } => {
            logging::init(None)?;
            let config = Config::load(&config)?;
            let ledger = connect_ledger(&config, &database_alias).await?;
            LoadStateTracker::new(&ledger)
                .reset(&source_table, recover_stale)
                .await?;
            info!("Load state for {source_table} reset; next run is an initial load");
            Ok(())
        }
        Commands::Status {
            database_alias,
            config,
        } => {
            logging::init(None)?;
            let config = Config::load(&config)?;
            let ledger = connect_ledger(&config, &database_alias).await?;
            for state in list_states(&ledger).await? {
                println!(
                    "{:<32} {:<10} {:<22} watermark {} last end {}",
                    state.table_name,
                    state.status.as_str(),
                    state.load_id,
                    state.watermark,
                    state.end_time
                );
            }
            Ok(())
        }
    }
}

async fn connect_ledger(config: &Config, alias: &str) -> anyhow::Result<PostgresLedger> {
    let opts = config
        .ledger_store(alias)?
        .connect_opts(config.run.statement_timeout()?)?;
    PostgresLedger::connect(&opts)
        .await
        .with_context(|| format!("Failed to connect to ledger {}", opts.display_name()))
}

async fn run_table(
    request: RunRequest,
    alias: &str,
    config_path: &std::path::Path,
) -> anyhow::Result<()> {
    let identity = RunIdentity::new(&request.target_table, Local::now().naive_local());
    let config = Config::load(config_path)?;

    let log_path = logging::log_path(&config.run.log_dir, &request.source_table, &identity.run_id);
    logging::init(Some(&log_path))?;
    info!("Logging run {} to {}", identity.run_id, log_path.display());

    let settings = RunSettings::from_config(&config, Some(log_path));
    let notifier = notify::from_config(&config.notification);

    let statement_timeout = config.run.statement_timeout()?;
    let connector = PostgresConnector::new(
        config.source.store.connect_opts(statement_timeout)?,
        config.target(alias)?.connect_opts(statement_timeout)?,
    );

    let ledger = match connect_ledger(&config, alias).await {
        Ok(ledger) => ledger,
        Err(err) => {
            let notice = FailureNotice {
                environment: settings.environment.clone(),
                table_name: request.source_table.clone(),
                run_id: identity.run_id.clone(),
                error: format!("{err:#}"),
                log_path: settings.log_path.clone(),
                recipients: settings.recipients.clone(),
                occurred_at: identity.started_at,
            };
            if let Err(e) = notifier.notify(&notice).await {
                tracing::error!("Failed to send failure notice: {e:#}");
            }
            return Err(err);
        }
    };

    let mut controller = RunController::new(&connector, &ledger, notifier.as_ref(), settings);
    let outcome = controller.execute(&request, &identity).await?;
    info!(
        "{} load of {} finished: {} rows, reconciliation diff {}",
        outcome.mode, request.source_table, outcome.rows_loaded, outcome.reconciliation.diff
    );
    Ok(())
}
