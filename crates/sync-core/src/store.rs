//! Store traits the pipeline runs against.
//!
//! The pipeline only ever talks to a source and a target through these
//! traits, so the PostgreSQL implementations and the in-memory test stores
//! are interchangeable. Connections are acquired through a [`Connector`] and
//! released when the returned store is dropped.

use async_trait::async_trait;
use chrono::NaiveDateTime;

use crate::error::Result;
use crate::types::TableMetadata;
use crate::upsert::UpsertStatement;
use crate::values::{StagedRow, TransformedRow};

/// Source columns carrying the load and last-modification timestamps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeColumns {
    pub load: String,
    pub modify: String,
}

impl Default for ChangeColumns {
    fn default() -> Self {
        Self {
            load: "pg_load_dt".to_string(),
            modify: "pg_modify_dt".to_string(),
        }
    }
}

/// Row filter applied to the source table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadCondition {
    /// Initial load: every row
    All,
    /// Delta load: rows loaded or modified at or after the watermark
    ChangedSince {
        watermark: NaiveDateTime,
        columns: ChangeColumns,
    },
}

impl LoadCondition {
    pub fn changed_since(watermark: NaiveDateTime, columns: ChangeColumns) -> Self {
        LoadCondition::ChangedSince { watermark, columns }
    }

    pub fn is_unconditional(&self) -> bool {
        matches!(self, LoadCondition::All)
    }

    pub fn watermark(&self) -> Option<NaiveDateTime> {
        match self {
            LoadCondition::All => None,
            LoadCondition::ChangedSince { watermark, .. } => Some(*watermark),
        }
    }
}

impl std::fmt::Display for LoadCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoadCondition::All => f.write_str("all rows"),
            LoadCondition::ChangedSince { watermark, columns } => write!(
                f,
                "{} >= '{watermark}' OR {} >= '{watermark}'",
                columns.load, columns.modify
            ),
        }
    }
}

/// Destination for extracted rows, e.g. the staging artifact writer.
pub trait RowSink: Send {
    fn write_row(&mut self, row: &StagedRow) -> Result<()>;
}

/// Read side of a replication run.
#[async_trait]
pub trait SourceStore: Send {
    /// Column names of the source table in catalog order.
    async fn columns(&mut self, table: &str) -> Result<Vec<String>>;

    /// Stream every row matching `condition` into `sink`, values as text in
    /// [`columns`](SourceStore::columns) order. Returns the number written.
    async fn extract(
        &mut self,
        table: &str,
        condition: &LoadCondition,
        sink: &mut dyn RowSink,
    ) -> Result<u64>;

    /// Count rows matching `condition`.
    async fn count(&mut self, table: &str, condition: &LoadCondition) -> Result<i64>;
}

/// Write side of a replication run.
#[async_trait]
pub trait TargetStore: Send {
    /// Introspect columns, types and primary key of `table`. Never cached.
    async fn resolve_metadata(&mut self, table: &str) -> Result<TableMetadata>;

    /// Run `statement` once per row inside a single transaction and commit.
    /// Nothing from the batch is visible if this returns an error.
    async fn execute_batch(
        &mut self,
        statement: &UpsertStatement,
        rows: &[TransformedRow],
    ) -> Result<u64>;

    /// Full-table row count.
    async fn count(&mut self, table: &str) -> Result<i64>;

    /// Invoke a post-load stored procedure without arguments.
    async fn call_procedure(&mut self, name: &str) -> Result<()>;
}

/// Opens run-scoped connections to both stores.
#[async_trait]
pub trait Connector: Send + Sync {
    type Source: SourceStore;
    type Target: TargetStore;

    async fn connect_source(&self) -> Result<Self::Source>;

    async fn connect_target(&self) -> Result<Self::Target>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_condition_display() {
        let watermark =
            NaiveDateTime::parse_from_str("2024-01-07 10:00:00", "%Y-%m-%d %H:%M:%S").unwrap();
        let cond = LoadCondition::changed_since(watermark, ChangeColumns::default());

        assert_eq!(
            cond.to_string(),
            "pg_load_dt >= '2024-01-07 10:00:00' OR pg_modify_dt >= '2024-01-07 10:00:00'"
        );
        assert_eq!(cond.watermark(), Some(watermark));
        assert!(!cond.is_unconditional());
        assert!(LoadCondition::All.is_unconditional());
        assert_eq!(LoadCondition::All.to_string(), "all rows");
    }
}
