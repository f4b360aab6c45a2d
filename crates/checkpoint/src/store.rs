//! Storage traits for load state and audit rows.
//!
//! Both traits are implemented by the PostgreSQL ledger (tables in a control
//! schema) and by [`MemoryLedger`](crate::MemoryLedger).

use anyhow::Result;
use async_trait::async_trait;

use crate::{LoadRunAudit, ReconciliationRecord, TableLoadState};

/// Persistence for [`TableLoadState`] rows, one per table.
#[async_trait]
pub trait LoadStateStore: Send + Sync {
    /// Number of state rows recorded for `table` (0 or 1).
    async fn count_states(&self, table: &str) -> Result<u64>;

    async fn read_state(&self, table: &str) -> Result<Option<TableLoadState>>;

    async fn insert_state(&self, state: &TableLoadState) -> Result<()>;

    /// Overwrite the row for `state.table_name`.
    async fn update_state(&self, state: &TableLoadState) -> Result<()>;

    async fn delete_state(&self, table: &str) -> Result<()>;
}

/// Append/update-only ledger of runs and reconciliations.
#[async_trait]
pub trait AuditLedger: Send + Sync {
    /// Record a new run in RUNNING state.
    async fn open_run(&self, audit: &LoadRunAudit) -> Result<()>;

    /// Overwrite the audit row identified by `audit.load_id`.
    async fn update_run(&self, audit: &LoadRunAudit) -> Result<()>;

    async fn append_reconciliation(&self, record: &ReconciliationRecord) -> Result<()>;
}
