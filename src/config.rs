//! TOML configuration for watermark-sync.
//!
//! ```toml
//! [source]
//! host = "pg-source.internal"
//! user = "etl"
//! password_env = "SOURCE_PG_PASSWORD"
//! dbname = "ods"
//! schema = "public"
//!
//! [targets.warehouse]
//! host = "pg-target.internal"
//! user = "loader"
//! password_env = "WAREHOUSE_PG_PASSWORD"
//! dbname = "dw"
//! schema = "stage"
//!
//! [run]
//! batch_size = 10000
//! timezone_offset_hours = 5
//! statement_timeout = "15m"
//!
//! [notification]
//! kind = "outbox"
//! environment = "PROD"
//! recipients = ["dataops@example.com"]
//! ```
//!
//! Passwords are never stored in the file; `password_env` names the
//! environment variable that holds them.

pub mod duration;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context};
use serde::Deserialize;
use sync_core::identifier::validate_identifier;
use sync_core::ChangeColumns;
use watermark_sync_postgresql::ConnectOpts;

pub use duration::parse_duration;

/// Complete configuration, loaded once per invocation.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub source: SourceConfig,
    /// Target stores keyed by database alias
    #[serde(default)]
    pub targets: BTreeMap<String, StoreConfig>,
    /// Ledger store; defaults to the run's target store
    #[serde(default)]
    pub ledger: Option<StoreConfig>,
    #[serde(default)]
    pub run: RunConfig,
    #[serde(default)]
    pub notification: NotificationConfig,
}

/// Connection settings for one PostgreSQL store.
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub user: String,
    /// Environment variable holding the password
    #[serde(default)]
    pub password_env: Option<String>,
    pub dbname: String,
    #[serde(default = "default_schema")]
    pub schema: String,
    #[serde(default)]
    pub connect_timeout: Option<String>,
}

fn default_port() -> u16 {
    5432
}

fn default_schema() -> String {
    "public".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    #[serde(flatten)]
    pub store: StoreConfig,
    /// Column set when a row is first loaded into the source
    #[serde(default = "default_load_column")]
    pub load_timestamp_column: String,
    /// Column set when a source row is modified
    #[serde(default = "default_modify_column")]
    pub modify_timestamp_column: String,
}

fn default_load_column() -> String {
    ChangeColumns::default().load
}

fn default_modify_column() -> String {
    ChangeColumns::default().modify
}

impl SourceConfig {
    pub fn change_columns(&self) -> ChangeColumns {
        ChangeColumns {
            load: self.load_timestamp_column.clone(),
            modify: self.modify_timestamp_column.clone(),
        }
    }
}

/// Per-run behavior.
#[derive(Debug, Clone, Deserialize)]
pub struct RunConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Hours subtracted from local time to get the capture time
    #[serde(default)]
    pub timezone_offset_hours: i64,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// Keep the staging CSV after a successful run
    #[serde(default)]
    pub keep_staging: bool,
    #[serde(default)]
    pub statement_timeout: Option<String>,
}

fn default_batch_size() -> usize {
    sync_core::DEFAULT_BATCH_CAPACITY
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("log")
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            timezone_offset_hours: 0,
            data_dir: default_data_dir(),
            log_dir: default_log_dir(),
            keep_staging: false,
            statement_timeout: None,
        }
    }
}

impl RunConfig {
    pub fn statement_timeout(&self) -> anyhow::Result<Option<Duration>> {
        self.statement_timeout
            .as_deref()
            .map(parse_duration)
            .transpose()
            .context("Invalid run.statement_timeout")
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotifierKind {
    /// Failure notices go to the error log only
    #[default]
    Log,
    /// Failure notices are also written as JSON files for a mail relay
    Outbox,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NotificationConfig {
    #[serde(default)]
    pub kind: NotifierKind,
    #[serde(default = "default_outbox_dir")]
    pub outbox_dir: PathBuf,
    #[serde(default = "default_environment")]
    pub environment: String,
    #[serde(default)]
    pub recipients: Vec<String>,
}

fn default_outbox_dir() -> PathBuf {
    PathBuf::from("outbox")
}

fn default_environment() -> String {
    "DEV".to_string()
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            kind: NotifierKind::default(),
            outbox_dir: default_outbox_dir(),
            environment: default_environment(),
            recipients: Vec::new(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_toml_str(&content)
            .with_context(|| format!("Invalid config file {}", path.display()))
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let config: Config = toml::from_str(content).context("Failed to parse TOML")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.run.batch_size == 0 {
            bail!("run.batch_size must be greater than zero");
        }
        validate_identifier(&self.source.load_timestamp_column)?;
        validate_identifier(&self.source.modify_timestamp_column)?;
        validate_identifier(&self.source.store.schema)?;
        for (alias, target) in &self.targets {
            validate_identifier(&target.schema)
                .with_context(|| format!("Invalid schema for target {alias}"))?;
        }
        if let Some(ledger) = &self.ledger {
            validate_identifier(&ledger.schema).context("Invalid ledger schema")?;
        }
        self.run.statement_timeout()?;
        Ok(())
    }

    pub fn target(&self, alias: &str) -> anyhow::Result<&StoreConfig> {
        self.targets.get(alias).with_context(|| {
            let known: Vec<&str> = self.targets.keys().map(String::as_str).collect();
            format!("Unknown database alias {alias}; configured: {known:?}")
        })
    }

    /// Ledger store for runs against `alias`.
    pub fn ledger_store(&self, alias: &str) -> anyhow::Result<&StoreConfig> {
        match &self.ledger {
            Some(ledger) => Ok(ledger),
            None => self.target(alias),
        }
    }
}

impl StoreConfig {
    /// Resolve the password and timeouts into driver options.
    pub fn connect_opts(&self, statement_timeout: Option<Duration>) -> anyhow::Result<ConnectOpts> {
        let password = match &self.password_env {
            Some(var) => Some(std::env::var(var).with_context(|| {
                format!("Password variable {var} for {}@{} is not set", self.user, self.host)
            })?),
            None => None,
        };
        let connect_timeout = self
            .connect_timeout
            .as_deref()
            .map(parse_duration)
            .transpose()
            .context("Invalid connect_timeout")?;
        Ok(ConnectOpts {
            host: self.host.clone(),
            port: self.port,
            user: self.user.clone(),
            password,
            dbname: self.dbname.clone(),
            schema: self.schema.clone(),
            statement_timeout,
            connect_timeout,
        })
    }
}
