//! Failure notifications.
//!
//! Delivery (SMTP, chat, paging) is outside this tool. A notifier either
//! logs the notice or drops it as a JSON file into an outbox directory that a
//! relay picks up.

use std::path::PathBuf;

use anyhow::Context;
use async_trait::async_trait;
use chrono::NaiveDateTime;
use serde::Serialize;
use tracing::{error, info};

use crate::config::{NotificationConfig, NotifierKind};

/// Everything needed to tell an operator that a run failed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailureNotice {
    pub environment: String,
    pub table_name: String,
    pub run_id: String,
    pub error: String,
    pub log_path: Option<PathBuf>,
    pub recipients: Vec<String>,
    pub occurred_at: NaiveDateTime,
}

impl FailureNotice {
    /// `<env> | Error | <dd-Mon-yyyy> | <table>`
    pub fn subject(&self) -> String {
        format!(
            "{} | Error | {} | {}",
            self.environment,
            self.occurred_at.format("%d-%b-%Y"),
            self.table_name
        )
    }

    pub fn body(&self) -> String {
        let rule = "+".repeat(45);
        let log = self
            .log_path
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(no log file)".to_string());
        format!(
            "watermark-sync failed for {} with run id {}:\n\n{rule}\nError: {}\n\n{rule}\n\
             Detailed logs: {log}\n{rule}",
            self.table_name, self.run_id, self.error
        )
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notice: &FailureNotice) -> anyhow::Result<()>;
}

/// Writes the notice to the error log.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, notice: &FailureNotice) -> anyhow::Result<()> {
        error!("{}\n{}", notice.subject(), notice.body());
        Ok(())
    }
}

/// Writes `<outbox_dir>/<run_id>.json` and logs the notice.
pub struct OutboxNotifier {
    dir: PathBuf,
}

#[derive(Serialize)]
struct OutboxMessage<'a> {
    subject: String,
    body: String,
    recipients: &'a [String],
    notice: &'a FailureNotice,
}

impl OutboxNotifier {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn message_path(&self, notice: &FailureNotice) -> PathBuf {
        self.dir.join(format!("{}_{}.json", notice.table_name, notice.run_id))
    }
}

#[async_trait]
impl Notifier for OutboxNotifier {
    async fn notify(&self, notice: &FailureNotice) -> anyhow::Result<()> {
        error!("{}\n{}", notice.subject(), notice.body());

        let message = OutboxMessage {
            subject: notice.subject(),
            body: notice.body(),
            recipients: &notice.recipients,
            notice,
        };
        let json = serde_json::to_string_pretty(&message)?;
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("Failed to create outbox {}", self.dir.display()))?;
        let path = self.message_path(notice);
        tokio::fs::write(&path, json)
            .await
            .with_context(|| format!("Failed to write notice {}", path.display()))?;
        info!("Failure notice queued at {}", path.display());
        Ok(())
    }
}

pub fn from_config(config: &NotificationConfig) -> Box<dyn Notifier> {
    match config.kind {
        NotifierKind::Log => Box::new(LogNotifier),
        NotifierKind::Outbox => Box::new(OutboxNotifier::new(config.outbox_dir.clone())),
    }
}
