//! Watermark state and run audit for watermark-sync
//!
//! Tracks, per replicated table, how far replication has progressed and
//! whether the most recent run succeeded.
//!
//! # Architecture
//!
//! - [`TableLoadState`] - one row per table: load id, window, status, watermark
//! - [`LoadStateTracker`] - the state machine (`begin_run`, `complete_run`,
//!   `fail_run`) on top of any [`LoadStateStore`]
//! - [`AuditLedger`] - per-run audit rows and the reconciliation ledger
//! - [`MemoryLedger`] - in-process implementation of both store traits
//!
//! The watermark only moves forward when a run completes. A failed initial
//! load leaves no state behind; a failed delta pins the window back to its
//! own watermark so the next run retries the same range.

mod audit;
mod memory;
pub mod store;
mod tracker;


use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

pub use audit::{LoadRunAudit, ReconciliationRecord};
pub use memory::MemoryLedger;
pub use store::{AuditLedger, LoadStateStore};
pub use tracker::{LoadStateTracker, RunWindow};

/// Lower bound of the very first run for every table.
pub fn initial_watermark() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(1990, 2, 17)
        .and_then(|d| d.and_hms_opt(10, 14, 59))
        .unwrap_or_default()
}

/// Whether a run replicates the whole table or only changes since the watermark.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadMode {
    Initial,
    Delta,
}

impl LoadMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoadMode::Initial => "initial",
            LoadMode::Delta => "delta",
        }
    }
}

impl std::fmt::Display for LoadMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a table's state row and of a run's audit row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LoadStatus {
    Running,
    Complete,
    Failed,
}

impl LoadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoadStatus::Running => "RUNNING",
            LoadStatus::Complete => "COMPLETE",
            LoadStatus::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> anyhow::Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "RUNNING" => Ok(LoadStatus::Running),
            "COMPLETE" => Ok(LoadStatus::Complete),
            "FAILED" => Ok(LoadStatus::Failed),
            other => Err(anyhow::anyhow!("Unknown load status: {other}")),
        }
    }
}

impl std::fmt::Display for LoadStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Replication progress of one table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableLoadState {
    pub table_name: String,
    /// Identifier of the run that last touched this row
    pub load_id: String,
    /// Lower bound of the first-ever run; never changes afterwards
    pub start_time: NaiveDateTime,
    /// Capture time of the latest run; becomes the watermark once COMPLETE
    pub end_time: NaiveDateTime,
    pub status: LoadStatus,
    /// Lower bound the latest run extracted from
    pub watermark: NaiveDateTime,
}

impl TableLoadState {
    /// Lower bound for the next run.
    ///
    /// COMPLETE rows advance to their capture time. FAILED rows already have
    /// `end_time` pinned back to their own watermark. A RUNNING row that is
    /// being recovered after a crash never advances.
    pub fn next_watermark(&self) -> NaiveDateTime {
        match self.status {
            LoadStatus::Complete | LoadStatus::Failed => self.end_time,
            LoadStatus::Running => self.watermark,
        }
    }
}
