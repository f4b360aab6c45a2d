//! Batch loader: staging artifact → target, one transaction per batch.
//!
//! Batches are committed independently. A failing batch aborts the load
//! immediately; batches committed before it stay committed and later batches
//! are never attempted. Progress is reported through [`BatchObserver`] after
//! every commit so the audit trail shows how far a failed load got.

use anyhow::Context;
use async_trait::async_trait;
use sync_core::{
    Batch, CoercionStats, RowTransformer, TableMetadata, TargetStore, UpsertStatement,
};
use tracing::{debug, info, warn};

use crate::staging::StagingReader;

/// Receives load progress.
#[async_trait]
pub trait BatchObserver: Send {
    /// Called before batch `number` (1-based) is sent to the target.
    fn batch_started(&mut self, _number: usize) {}

    /// Called after batch `number` committed `rows` rows.
    async fn batch_committed(&mut self, number: usize, rows: usize) -> anyhow::Result<()>;
}

/// Result of a completed load.
#[derive(Debug, Clone, Default)]
pub struct LoadReport {
    pub rows_loaded: u64,
    pub batches_committed: usize,
    /// Values replaced by defaults, per column
    pub coercions: CoercionStats,
}

pub struct BatchLoader<'a, T: TargetStore + ?Sized> {
    target: &'a mut T,
    metadata: &'a TableMetadata,
    statement: &'a UpsertStatement,
    capacity: usize,
}

impl<'a, T: TargetStore + ?Sized> BatchLoader<'a, T> {
    pub fn new(
        target: &'a mut T,
        metadata: &'a TableMetadata,
        statement: &'a UpsertStatement,
        capacity: usize,
    ) -> Self {
        Self {
            target,
            metadata,
            statement,
            capacity,
        }
    }

    /// Transform and load every staged row.
    pub async fn load(
        mut self,
        mut reader: StagingReader,
        observer: &mut dyn BatchObserver,
    ) -> anyhow::Result<LoadReport> {
        let table = self.statement.table().to_string();
        let mut transformer = RowTransformer::new(self.metadata, reader.headers());

        let missing = transformer.missing_columns();
        if !missing.is_empty() {
            warn!("{table}: target columns absent from staging, loaded as null/default: {missing:?}");
        }
        if !transformer.ignored_headers().is_empty() {
            debug!(
                "{table}: staged columns not in target: {:?}",
                transformer.ignored_headers()
            );
        }

        let mut batch = Batch::with_capacity(self.capacity);
        let mut report = LoadReport::default();

        while let Some(row) = reader.next_row()? {
            batch.push(transformer.transform(&row));
            if batch.is_full() {
                self.flush(&mut batch, &mut report, observer).await?;
            }
        }
        if !batch.is_empty() {
            self.flush(&mut batch, &mut report, observer).await?;
        }

        report.coercions = transformer.into_stats();
        if !report.coercions.is_empty() {
            for (column, count) in report.coercions.iter() {
                warn!("{table}.{column}: {count} values could not be converted and were defaulted");
            }
        }
        info!(
            "Loaded {} rows into {} in {} batches",
            report.rows_loaded, table, report.batches_committed
        );
        Ok(report)
    }

    async fn flush(
        &mut self,
        batch: &mut Batch,
        report: &mut LoadReport,
        observer: &mut dyn BatchObserver,
    ) -> anyhow::Result<()> {
        let number = batch.number();
        let rows = batch.len();
        observer.batch_started(number);

        self.target
            .execute_batch(self.statement, batch.rows())
            .await
            .with_context(|| format!("Batch {number} ({rows} rows) failed"))?;

        report.rows_loaded += rows as u64;
        report.batches_committed += 1;
        debug!("Committed batch {number} ({rows} rows)");
        observer.batch_committed(number, rows).await?;

        batch.advance();
        Ok(())
    }
}
