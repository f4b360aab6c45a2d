//! Post-load source/target row-count reconciliation.

use anyhow::Context;
use checkpoint::{AuditLedger, ReconciliationRecord};
use chrono::NaiveDateTime;
use sync_core::{Connector, LoadCondition, SourceStore, TargetStore};
use tracing::{info, warn};

/// Tables and run being reconciled.
#[derive(Debug, Clone, Copy)]
pub struct Reconciliation<'a> {
    pub source_table: &'a str,
    pub target_table: &'a str,
    pub run_id: &'a str,
}

impl Reconciliation<'_> {
    /// Count both tables in full, record the drift, and return it.
    ///
    /// A fresh source connection is opened for the count and dropped before
    /// returning. The target count uses the run's existing connection.
    pub async fn run<C: Connector>(
        &self,
        connector: &C,
        target: &mut C::Target,
        ledger: &dyn AuditLedger,
        now: NaiveDateTime,
    ) -> anyhow::Result<ReconciliationRecord> {
        let source_count = {
            let mut source = connector.connect_source().await?;
            source
                .count(self.source_table, &LoadCondition::All)
                .await
                .with_context(|| format!("Failed to count source table {}", self.source_table))?
        };
        let target_count = target
            .count(self.target_table)
            .await
            .with_context(|| format!("Failed to count target table {}", self.target_table))?;

        let record = ReconciliationRecord::new(
            self.source_table,
            source_count,
            target_count,
            self.run_id,
            now,
        );
        ledger
            .append_reconciliation(&record)
            .await
            .context("Failed to record reconciliation")?;

        if record.is_balanced() {
            info!(
                "Reconciled {} ({} rows) with {}",
                self.source_table, source_count, self.target_table
            );
        } else {
            warn!(
                "{} has {} rows, {} has {} (diff {})",
                self.source_table, source_count, self.target_table, target_count, record.diff
            );
        }
        Ok(record)
    }
}
