//! Run controller: drives one table through a complete replication run.
//!
//! ```text
//! Extracting → Loading(batch 1..n) → Reconciling → Complete
//!      └────────────┴──────────────────────┴──→ Failed
//! ```
//!
//! The controller is the only place that marks a run FAILED, rolls back the
//! load state and sends a failure notice. Each of those happens at most once
//! per run.

use std::path::PathBuf;
use std::time::Instant;

use anyhow::Context;
use async_trait::async_trait;
use checkpoint::{
    AuditLedger, LoadMode, LoadRunAudit, LoadStateStore, LoadStateTracker, ReconciliationRecord,
    RunWindow,
};
use chrono::NaiveDateTime;
use sha2::{Digest, Sha256};
use sync_core::identifier::{split_qualified, validate_identifier};
use sync_core::{ChangeColumns, CoercionStats, Connector, LoadCondition, TargetStore, UpsertStatement};
use tracing::{error, info, warn};

use crate::config::Config;
use crate::extract::extract_to_staging;
use crate::load::{BatchLoader, BatchObserver};
use crate::notify::{FailureNotice, Notifier};
use crate::reconcile::Reconciliation;
use crate::staging::{self, StagingReader};

/// What to replicate and how.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunRequest {
    pub source_table: String,
    pub target_table: String,
    pub mode: LoadMode,
    /// Called on the target after the load, before reconciliation
    pub stored_procedure: Option<String>,
    /// Take over a table left RUNNING by a dead run
    pub recover_stale: bool,
}

/// Stable per-table number plus a per-run id derived from it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunIdentity {
    /// `sha256(upper(target_table))`, first 20 bits, mod 10000
    pub load_number: u32,
    /// `%m%d%Y%H%M%S_<load_number>`
    pub run_id: String,
    pub started_at: NaiveDateTime,
}

impl RunIdentity {
    pub fn new(target_table: &str, started_at: NaiveDateTime) -> Self {
        let load_number = load_number(target_table);
        Self {
            load_number,
            run_id: format!("{}_{load_number}", started_at.format("%m%d%Y%H%M%S")),
            started_at,
        }
    }
}

pub fn load_number(target_table: &str) -> u32 {
    let digest = Sha256::digest(target_table.to_uppercase().as_bytes());
    let prefix =
        (u32::from(digest[0]) << 12) | (u32::from(digest[1]) << 4) | (u32::from(digest[2]) >> 4);
    prefix % 10_000
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    Starting,
    Extracting,
    /// `batch` is 0 while metadata is resolved, then the batch in flight
    Loading { batch: usize },
    Reconciling,
    Complete,
    Failed,
}

impl std::fmt::Display for RunPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunPhase::Starting => f.write_str("starting"),
            RunPhase::Extracting => f.write_str("extracting"),
            RunPhase::Loading { batch: 0 } => f.write_str("preparing load"),
            RunPhase::Loading { batch } => write!(f, "loading batch {batch}"),
            RunPhase::Reconciling => f.write_str("reconciling"),
            RunPhase::Complete => f.write_str("complete"),
            RunPhase::Failed => f.write_str("failed"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunSettings {
    pub batch_size: usize,
    pub timezone_offset_hours: i64,
    pub data_dir: PathBuf,
    pub keep_staging: bool,
    pub change_columns: ChangeColumns,
    pub environment: String,
    pub recipients: Vec<String>,
    /// Log artifact referenced by failure notices
    pub log_path: Option<PathBuf>,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            batch_size: sync_core::DEFAULT_BATCH_CAPACITY,
            timezone_offset_hours: 0,
            data_dir: PathBuf::from("data"),
            keep_staging: false,
            change_columns: ChangeColumns::default(),
            environment: "DEV".to_string(),
            recipients: Vec::new(),
            log_path: None,
        }
    }
}

impl RunSettings {
    pub fn from_config(config: &Config, log_path: Option<PathBuf>) -> Self {
        Self {
            batch_size: config.run.batch_size,
            timezone_offset_hours: config.run.timezone_offset_hours,
            data_dir: config.run.data_dir.clone(),
            keep_staging: config.run.keep_staging,
            change_columns: config.source.change_columns(),
            environment: config.notification.environment.clone(),
            recipients: config.notification.recipients.clone(),
            log_path,
        }
    }
}

/// Summary of a successful run.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub run_id: String,
    pub mode: LoadMode,
    pub watermark: NaiveDateTime,
    /// Rows staged by extraction
    pub rows_extracted: u64,
    /// Rows matching the load condition per the post-extraction recount
    pub rows_counted: u64,
    pub rows_loaded: u64,
    pub batches_committed: usize,
    pub reconciliation: ReconciliationRecord,
    pub coercions: CoercionStats,
}

/// What has to be undone if the run fails.
#[derive(Default)]
struct Progress {
    window: Option<RunWindow>,
    audit: Option<LoadRunAudit>,
}

/// Records committed batches in the audit row and tracks the load phase.
struct AuditProgress<'r> {
    ledger: &'r dyn AuditLedger,
    audit: &'r mut LoadRunAudit,
    phase: &'r mut RunPhase,
}

#[async_trait]
impl BatchObserver for AuditProgress<'_> {
    fn batch_started(&mut self, number: usize) {
        *self.phase = RunPhase::Loading { batch: number };
    }

    async fn batch_committed(&mut self, number: usize, _rows: usize) -> anyhow::Result<()> {
        self.audit.batches_committed = number as u64;
        self.ledger
            .update_run(self.audit)
            .await
            .with_context(|| format!("Failed to record commit of batch {number}"))
    }
}

pub struct RunController<'a, C, L>
where
    C: Connector,
    L: LoadStateStore + AuditLedger,
{
    connector: &'a C,
    ledger: &'a L,
    notifier: &'a dyn Notifier,
    settings: RunSettings,
    phase: RunPhase,
}

impl<'a, C, L> RunController<'a, C, L>
where
    C: Connector,
    L: LoadStateStore + AuditLedger,
{
    pub fn new(
        connector: &'a C,
        ledger: &'a L,
        notifier: &'a dyn Notifier,
        settings: RunSettings,
    ) -> Self {
        Self {
            connector,
            ledger,
            notifier,
            settings,
            phase: RunPhase::Starting,
        }
    }

    pub fn phase(&self) -> RunPhase {
        self.phase
    }

    fn tracker(&self) -> LoadStateTracker<'a, L> {
        LoadStateTracker::new(self.ledger).with_timezone_offset(self.settings.timezone_offset_hours)
    }

    /// Run the request to completion.
    ///
    /// On error the load state is rolled back, the audit row (if opened) is
    /// marked FAILED, exactly one failure notice is sent, and the original
    /// error is returned.
    pub async fn execute(
        &mut self,
        request: &RunRequest,
        identity: &RunIdentity,
    ) -> anyhow::Result<RunOutcome> {
        let started = Instant::now();
        let mut progress = Progress::default();

        info!(
            "Run {} started: {} → {} ({} requested)",
            identity.run_id, request.source_table, request.target_table, request.mode
        );

        match self.run_phases(request, identity, started, &mut progress).await {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                self.fail(request, identity, started, progress, &err).await;
                Err(err)
            }
        }
    }

    async fn run_phases(
        &mut self,
        request: &RunRequest,
        identity: &RunIdentity,
        started: Instant,
        progress: &mut Progress,
    ) -> anyhow::Result<RunOutcome> {
        validate_identifier(&request.source_table).context("Invalid source table name")?;
        validate_identifier(&request.target_table).context("Invalid target table name")?;
        if let Some(procedure) = &request.stored_procedure {
            split_qualified(procedure).context("Invalid stored procedure name")?;
        }

        let tracker = self.tracker();
        let table = request.source_table.as_str();

        let mode = match (request.mode, tracker.run_count(table).await?) {
            (LoadMode::Delta, 0) => {
                warn!("{table} has no load state; running an initial load instead of delta");
                LoadMode::Initial
            }
            (LoadMode::Initial, n) if n > 0 => {
                info!("Initial load requested for {table}; existing load state will be reset");
                LoadMode::Initial
            }
            (mode, _) => mode,
        };

        let window = tracker
            .begin_run(
                table,
                mode,
                &identity.run_id,
                identity.started_at,
                request.recover_stale,
            )
            .await?;
        progress.window = Some(window.clone());

        let opened = LoadRunAudit::running(
            identity.run_id.as_str(),
            request.target_table.as_str(),
            identity.started_at,
        );
        self.ledger
            .open_run(&opened)
            .await
            .context("Failed to open audit row")?;
        let audit = progress.audit.insert(opened);

        // Extraction
        self.phase = RunPhase::Extracting;
        let condition = match window.mode {
            LoadMode::Initial => LoadCondition::All,
            LoadMode::Delta => {
                LoadCondition::changed_since(window.watermark, self.settings.change_columns.clone())
            }
        };
        info!("{} load of {table}: {condition}", window.mode);
        let staging_path = staging::staging_path(&self.settings.data_dir, table, &identity.run_id);
        let extraction = extract_to_staging(self.connector, table, &condition, &staging_path)
            .await
            .context("Extraction failed")?;
        audit.row_count = Some(extraction.matching_rows);

        // Metadata and statement are ready before the target is modified.
        self.phase = RunPhase::Loading { batch: 0 };
        let mut target = self
            .connector
            .connect_target()
            .await
            .context("Failed to connect to target")?;
        let metadata = target
            .resolve_metadata(&request.target_table)
            .await
            .context("Failed to resolve target metadata")?;
        let statement = UpsertStatement::generate(&metadata)
            .with_context(|| format!("Cannot build upsert for {}", request.target_table))?;
        let reader = StagingReader::open(&extraction.staging_path)?;

        let report = {
            let mut observer = AuditProgress {
                ledger: self.ledger,
                audit: &mut *audit,
                phase: &mut self.phase,
            };
            BatchLoader::new(&mut target, &metadata, &statement, self.settings.batch_size)
                .load(reader, &mut observer)
                .await?
        };

        if let Some(procedure) = &request.stored_procedure {
            target
                .call_procedure(procedure)
                .await
                .with_context(|| format!("Stored procedure {procedure} failed"))?;
        }

        // Reconciliation
        self.phase = RunPhase::Reconciling;
        let reconciliation = Reconciliation {
            source_table: table,
            target_table: &request.target_table,
            run_id: &identity.run_id,
        }
        .run(
            self.connector,
            &mut target,
            self.ledger,
            wall_clock(identity, started),
        )
        .await?;
        drop(target);

        audit.complete(
            wall_clock(identity, started),
            extraction.matching_rows,
            started.elapsed(),
        );
        self.ledger
            .update_run(audit)
            .await
            .context("Failed to close audit row")?;

        // Watermark advance is the final commit of the run.
        tracker.complete_run(&window).await?;
        self.phase = RunPhase::Complete;

        if self.settings.keep_staging {
            info!("Keeping staging artifact {}", staging_path.display());
        } else {
            staging::discard(&staging_path);
        }

        info!(
            "Run {} complete: {} rows extracted, {} loaded in {} batches, watermark now {}",
            identity.run_id,
            extraction.rows_written,
            report.rows_loaded,
            report.batches_committed,
            window.capture_time
        );

        Ok(RunOutcome {
            run_id: identity.run_id.clone(),
            mode: window.mode,
            watermark: window.watermark,
            rows_extracted: extraction.rows_written,
            rows_counted: extraction.matching_rows,
            rows_loaded: report.rows_loaded,
            batches_committed: report.batches_committed,
            reconciliation,
            coercions: report.coercions,
        })
    }

    async fn fail(
        &mut self,
        request: &RunRequest,
        identity: &RunIdentity,
        started: Instant,
        progress: Progress,
        err: &anyhow::Error,
    ) {
        let failed_during = self.phase;
        self.phase = RunPhase::Failed;
        let now = wall_clock(identity, started);
        error!(
            "Run {} for {} failed while {failed_during}: {err:#}",
            identity.run_id, request.source_table
        );

        if let Some(window) = &progress.window {
            if let Err(e) = self.tracker().fail_run(window).await {
                error!("Failed to roll back load state for {}: {e:#}", window.table_name);
            }
        }

        if let Some(mut audit) = progress.audit {
            audit.fail(now, started.elapsed());
            if let Err(e) = self.ledger.update_run(&audit).await {
                error!("Failed to mark audit row FAILED for {}: {e:#}", audit.load_id);
            }
        }

        let notice = FailureNotice {
            environment: self.settings.environment.clone(),
            table_name: request.source_table.clone(),
            run_id: identity.run_id.clone(),
            error: format!("{err:#}"),
            log_path: self.settings.log_path.clone(),
            recipients: self.settings.recipients.clone(),
            occurred_at: now,
        };
        if let Err(e) = self.notifier.notify(&notice).await {
            error!("Failed to send failure notice: {e:#}");
        }
    }
}

/// Run start plus elapsed monotonic time.
fn wall_clock(identity: &RunIdentity, started: Instant) -> NaiveDateTime {
    let elapsed =
        chrono::Duration::from_std(started.elapsed()).unwrap_or_else(|_| chrono::Duration::zero());
    identity.started_at + elapsed
}
