//! Load state and audit tables kept in a PostgreSQL schema.
//!
//! Three tables, created by [`PostgresLedger::ensure_schema`]:
//!
//! - `last_load_status` - one [`TableLoadState`] row per replicated table
//! - `load_status` - one [`LoadRunAudit`] row per run
//! - `table_compare` - append-only [`ReconciliationRecord`] rows

use anyhow::{Context, Result};
use async_trait::async_trait;
use checkpoint::{
    AuditLedger, LoadRunAudit, LoadStateStore, LoadStatus, ReconciliationRecord, TableLoadState,
};
use sync_core::identifier::quote_identifier;
use tokio_postgres::{Client, Row};
use tracing::info;

use crate::client::{connect, ConnectOpts};

/// Ledger tables inside a dedicated schema.
pub struct PostgresLedger {
    client: Client,
    schema: String,
}

impl PostgresLedger {
    pub async fn connect(opts: &ConnectOpts) -> Result<Self> {
        let client = connect(opts, "ledger").await?;
        Self::new(client, &opts.schema)
    }

    pub fn new(client: Client, schema: &str) -> Result<Self> {
        Ok(Self {
            client,
            schema: quote_identifier(schema)?,
        })
    }

    /// Create the schema and the three ledger tables if they are missing.
    pub async fn ensure_schema(&self) -> Result<()> {
        let ddl = ledger_ddl(&self.schema);
        self.client
            .batch_execute(&ddl)
            .await
            .with_context(|| format!("Failed to create ledger tables in schema {}", self.schema))?;
        info!("Ledger tables ready in schema {}", self.schema);
        Ok(())
    }

    fn table(&self, name: &str) -> String {
        format!("{}.{name}", self.schema)
    }
}

/// DDL for the ledger tables in the already-quoted `schema`.
pub(crate) fn ledger_ddl(schema: &str) -> String {
    format!(
        "CREATE SCHEMA IF NOT EXISTS {schema};
         CREATE TABLE IF NOT EXISTS {schema}.last_load_status (
             table_name text PRIMARY KEY,
             load_id text NOT NULL,
             start_time timestamp NOT NULL,
             end_time timestamp NOT NULL,
             status text NOT NULL,
             watermark timestamp NOT NULL
         );
         CREATE TABLE IF NOT EXISTS {schema}.load_status (
             load_id text NOT NULL,
             table_name text NOT NULL,
             load_date date NOT NULL,
             start_time timestamp NOT NULL,
             end_time timestamp,
             status text NOT NULL,
             row_count bigint,
             execution_time_ms bigint,
             batches_committed bigint NOT NULL DEFAULT 0,
             PRIMARY KEY (load_id, table_name, start_time)
         );
         CREATE TABLE IF NOT EXISTS {schema}.table_compare (
             table_name text NOT NULL,
             target_count bigint NOT NULL,
             source_count bigint NOT NULL,
             diff bigint NOT NULL,
             diff_percent double precision NOT NULL,
             load_id text NOT NULL,
             compared_at timestamp NOT NULL
         );"
    )
}

fn state_from_row(row: &Row) -> Result<TableLoadState> {
    Ok(TableLoadState {
        table_name: row.try_get("table_name")?,
        load_id: row.try_get("load_id")?,
        start_time: row.try_get("start_time")?,
        end_time: row.try_get("end_time")?,
        status: LoadStatus::parse(row.try_get::<_, &str>("status")?)?,
        watermark: row.try_get("watermark")?,
    })
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

#[async_trait]
impl LoadStateStore for PostgresLedger {
    async fn count_states(&self, table: &str) -> Result<u64> {
        let sql = format!(
            "SELECT COUNT(*) FROM {} WHERE table_name = $1",
            self.table("last_load_status")
        );
        let row = self
            .client
            .query_one(sql.as_str(), &[&table])
            .await
            .context("Failed to count load state")?;
        Ok(u64::try_from(row.get::<_, i64>(0)).unwrap_or_default())
    }

    async fn read_state(&self, table: &str) -> Result<Option<TableLoadState>> {
        let sql = format!(
            "SELECT table_name, load_id, start_time, end_time, status, watermark \
             FROM {} WHERE table_name = $1",
            self.table("last_load_status")
        );
        let row = self
            .client
            .query_opt(sql.as_str(), &[&table])
            .await
            .context("Failed to read load state")?;
        row.as_ref().map(state_from_row).transpose()
    }

    async fn insert_state(&self, state: &TableLoadState) -> Result<()> {
        let sql = format!(
            "INSERT INTO {} (table_name, load_id, start_time, end_time, status, watermark) \
             VALUES ($1, $2, $3, $4, $5, $6)",
            self.table("last_load_status")
        );
        self.client
            .execute(
                sql.as_str(),
                &[
                    &state.table_name,
                    &state.load_id,
                    &state.start_time,
                    &state.end_time,
                    &state.status.as_str(),
                    &state.watermark,
                ],
            )
            .await
            .context("Failed to insert load state")?;
        Ok(())
    }

    async fn update_state(&self, state: &TableLoadState) -> Result<()> {
        let sql = format!(
            "UPDATE {} SET load_id = $2, start_time = $3, end_time = $4, status = $5, \
             watermark = $6 WHERE table_name = $1",
            self.table("last_load_status")
        );
        let updated = self
            .client
            .execute(
                sql.as_str(),
                &[
                    &state.table_name,
                    &state.load_id,
                    &state.start_time,
                    &state.end_time,
                    &state.status.as_str(),
                    &state.watermark,
                ],
            )
            .await
            .context("Failed to update load state")?;
        if updated == 0 {
            anyhow::bail!("No load state row for {}", state.table_name);
        }
        Ok(())
    }

    async fn delete_state(&self, table: &str) -> Result<()> {
        let sql = format!(
            "DELETE FROM {} WHERE table_name = $1",
            self.table("last_load_status")
        );
        self.client
            .execute(sql.as_str(), &[&table])
            .await
            .context("Failed to delete load state")?;
        Ok(())
    }
}

#[async_trait]
impl AuditLedger for PostgresLedger {
    async fn open_run(&self, audit: &LoadRunAudit) -> Result<()> {
        let sql = format!(
            "INSERT INTO {} (load_id, table_name, load_date, start_time, status, batches_committed) \
             VALUES ($1, $2, $3, $4, $5, $6)",
            self.table("load_status")
        );
        self.client
            .execute(
                sql.as_str(),
                &[
                    &audit.load_id,
                    &audit.table_name,
                    &audit.load_date,
                    &audit.start_time,
                    &audit.status.as_str(),
                    &to_i64(audit.batches_committed),
                ],
            )
            .await
            .context("Failed to open audit row")?;
        Ok(())
    }

    async fn update_run(&self, audit: &LoadRunAudit) -> Result<()> {
        let sql = format!(
            "UPDATE {} SET end_time = $4, status = $5, row_count = $6, \
             execution_time_ms = $7, batches_committed = $8 \
             WHERE load_id = $1 AND table_name = $2 AND start_time = $3",
            self.table("load_status")
        );
        let row_count = audit.row_count.map(to_i64);
        let execution_ms = audit.execution_millis();
        let updated = self
            .client
            .execute(
                sql.as_str(),
                &[
                    &audit.load_id,
                    &audit.table_name,
                    &audit.start_time,
                    &audit.end_time,
                    &audit.status.as_str(),
                    &row_count,
                    &execution_ms,
                    &to_i64(audit.batches_committed),
                ],
            )
            .await
            .context("Failed to update audit row")?;
        if updated == 0 {
            anyhow::bail!(
                "No audit row for load {} of {} started {}",
                audit.load_id,
                audit.table_name,
                audit.start_time
            );
        }
        Ok(())
    }

    async fn append_reconciliation(&self, record: &ReconciliationRecord) -> Result<()> {
        let sql = format!(
            "INSERT INTO {} (table_name, target_count, source_count, diff, diff_percent, \
             load_id, compared_at) VALUES ($1, $2, $3, $4, $5, $6, $7)",
            self.table("table_compare")
        );
        self.client
            .execute(
                sql.as_str(),
                &[
                    &record.table_name,
                    &record.target_count,
                    &record.source_count,
                    &record.diff,
                    &record.diff_percent,
                    &record.load_id,
                    &record.timestamp,
                ],
            )
            .await
            .context("Failed to append reconciliation record")?;
        Ok(())
    }
}

/// Load-state rows for every table, newest capture first.
pub async fn list_states(ledger: &PostgresLedger) -> Result<Vec<TableLoadState>> {
    let sql = format!(
        "SELECT table_name, load_id, start_time, end_time, status, watermark \
         FROM {} ORDER BY end_time DESC",
        ledger.table("last_load_status")
    );
    let rows = ledger
        .client
        .query(sql.as_str(), &[])
        .await
        .context("Failed to list load state")?;
    rows.iter().map(state_from_row).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ddl_uses_quoted_schema() {
        let ddl = ledger_ddl("\"etl_control\"");
        assert!(ddl.contains("CREATE SCHEMA IF NOT EXISTS \"etl_control\";"));
        assert!(ddl.contains("\"etl_control\".last_load_status"));
        assert!(ddl.contains("\"etl_control\".load_status"));
        assert!(ddl.contains("\"etl_control\".table_compare"));
        assert!(ddl.contains("PRIMARY KEY (load_id, table_name, start_time)"));
    }

    #[test]
    fn test_to_i64_saturates() {
        assert_eq!(to_i64(7), 7);
        assert_eq!(to_i64(u64::MAX), i64::MAX);
    }
}
