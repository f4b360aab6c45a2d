use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use sync_core::transform::parse_timestamp;
use sync_core::{
    Connector, LoadCondition, Result, RowSink, SourceStore, StagedRow, SyncError, TableMetadata,
    TargetStore, TransformedRow, UpsertStatement,
};

const SOURCE: &str = "memory source";
const TARGET: &str = "memory target";

struct SourceTable {
    columns: Vec<String>,
    rows: Vec<StagedRow>,
}

impl SourceTable {
    fn position(&self, column: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|c| c.eq_ignore_ascii_case(column))
    }

    fn matches(&self, row: &StagedRow, condition: &LoadCondition) -> bool {
        let LoadCondition::ChangedSince { watermark, columns } = condition else {
            return true;
        };
        [&columns.load, &columns.modify].into_iter().any(|column| {
            self.position(column)
                .and_then(|i| row.get(i).cloned().flatten())
                .and_then(|v| parse_timestamp(&v))
                .is_some_and(|t| t >= *watermark)
        })
    }
}

struct TargetTable {
    metadata: TableMetadata,
    /// Key column values → full row, both as text
    rows: BTreeMap<Vec<Option<String>>, Vec<Option<String>>>,
}

#[derive(Default)]
struct MemoryDatabase {
    sources: BTreeMap<String, SourceTable>,
    targets: BTreeMap<String, TargetTable>,
    fail_on_batch: Option<usize>,
    source_unreachable: bool,
    target_unreachable: bool,
    /// Added to every source count, as if rows arrived after the stream
    count_drift: i64,
    batch_attempts: usize,
    commits: Vec<usize>,
    open_connections: usize,
    procedures_called: Vec<String>,
}

impl MemoryDatabase {
    fn source(&self, table: &str) -> Result<&SourceTable> {
        self.sources
            .get(&table.to_lowercase())
            .ok_or_else(|| missing_relation(SOURCE, table))
    }

    fn target(&mut self, table: &str) -> Result<&mut TargetTable> {
        self.targets
            .get_mut(&table.to_lowercase())
            .ok_or_else(|| missing_relation(TARGET, table))
    }
}

fn missing_relation(store: &str, table: &str) -> SyncError {
    SyncError::statement(store, format!("relation \"{table}\" does not exist"))
}

/// Source and target held in one shared in-memory database.
#[derive(Clone, Default)]
pub struct MemoryConnector {
    db: Arc<Mutex<MemoryDatabase>>,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryDatabase> {
        self.db.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn add_source_table(&self, table: &str, columns: &[&str]) {
        self.lock().sources.insert(
            table.to_lowercase(),
            SourceTable {
                columns: columns.iter().map(|c| c.to_string()).collect(),
                rows: Vec::new(),
            },
        );
    }

    /// Append a row; `None` is NULL.
    pub fn insert_source_row(&self, table: &str, values: &[Option<&str>]) {
        let row = values.iter().map(|v| v.map(str::to_string)).collect();
        if let Some(source) = self.lock().sources.get_mut(&table.to_lowercase()) {
            source.rows.push(row);
        }
    }

    /// Replace every value of `column` in rows where `key_column == key`.
    pub fn update_source_row(
        &self,
        table: &str,
        key_column: &str,
        key: &str,
        column: &str,
        value: Option<&str>,
    ) {
        let mut db = self.lock();
        let Some(source) = db.sources.get_mut(&table.to_lowercase()) else {
            return;
        };
        let (Some(k), Some(c)) = (source.position(key_column), source.position(column)) else {
            return;
        };
        for row in source.rows.iter_mut() {
            if row.get(k).cloned().flatten().as_deref() == Some(key) {
                row[c] = value.map(str::to_string);
            }
        }
    }

    pub fn add_target_table(&self, metadata: TableMetadata) {
        self.lock().targets.insert(
            metadata.table_name.to_lowercase(),
            TargetTable {
                metadata,
                rows: BTreeMap::new(),
            },
        );
    }

    /// Target rows in key order, values as text.
    pub fn target_rows(&self, table: &str) -> Vec<Vec<Option<String>>> {
        self.lock()
            .targets
            .get(&table.to_lowercase())
            .map(|t| t.rows.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Make the `n`th batch (1-based, counted across all runs) fail.
    pub fn fail_on_batch(&self, n: usize) {
        self.lock().fail_on_batch = Some(n);
    }

    pub fn set_source_unreachable(&self, unreachable: bool) {
        self.lock().source_unreachable = unreachable;
    }

    pub fn set_target_unreachable(&self, unreachable: bool) {
        self.lock().target_unreachable = unreachable;
    }

    /// Make every source count report `drift` more rows than were streamed.
    pub fn set_source_count_drift(&self, drift: i64) {
        self.lock().count_drift = drift;
    }

    /// Batches sent to the target, including failed ones.
    pub fn batch_attempts(&self) -> usize {
        self.lock().batch_attempts
    }

    /// Row count of each committed batch, in commit order.
    pub fn commits(&self) -> Vec<usize> {
        self.lock().commits.clone()
    }

    pub fn open_connections(&self) -> usize {
        self.lock().open_connections
    }

    pub fn procedures_called(&self) -> Vec<String> {
        self.lock().procedures_called.clone()
    }

    fn open(&self) {
        self.lock().open_connections += 1;
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    type Source = MemorySource;
    type Target = MemoryTarget;

    async fn connect_source(&self) -> Result<MemorySource> {
        if self.lock().source_unreachable {
            return Err(SyncError::connectivity(SOURCE, "connection refused"));
        }
        self.open();
        Ok(MemorySource { db: self.clone() })
    }

    async fn connect_target(&self) -> Result<MemoryTarget> {
        if self.lock().target_unreachable {
            return Err(SyncError::connectivity(TARGET, "connection refused"));
        }
        self.open();
        Ok(MemoryTarget { db: self.clone() })
    }
}

/// Open source connection; released on drop.
pub struct MemorySource {
    db: MemoryConnector,
}

impl Drop for MemorySource {
    fn drop(&mut self) {
        let mut db = self.db.lock();
        db.open_connections = db.open_connections.saturating_sub(1);
    }
}

#[async_trait]
impl SourceStore for MemorySource {
    async fn columns(&mut self, table: &str) -> Result<Vec<String>> {
        Ok(self.db.lock().source(table)?.columns.clone())
    }

    async fn extract(
        &mut self,
        table: &str,
        condition: &LoadCondition,
        sink: &mut dyn RowSink,
    ) -> Result<u64> {
        let rows: Vec<StagedRow> = {
            let db = self.db.lock();
            let source = db.source(table)?;
            source
                .rows
                .iter()
                .filter(|row| source.matches(row, condition))
                .cloned()
                .collect()
        };
        for row in &rows {
            sink.write_row(row)?;
        }
        Ok(rows.len() as u64)
    }

    async fn count(&mut self, table: &str, condition: &LoadCondition) -> Result<i64> {
        let db = self.db.lock();
        let source = db.source(table)?;
        let matching = source
            .rows
            .iter()
            .filter(|row| source.matches(row, condition))
            .count() as i64;
        Ok(matching + db.count_drift)
    }
}

/// Open target connection; released on drop.
pub struct MemoryTarget {
    db: MemoryConnector,
}

impl Drop for MemoryTarget {
    fn drop(&mut self) {
        let mut db = self.db.lock();
        db.open_connections = db.open_connections.saturating_sub(1);
    }
}

#[async_trait]
impl TargetStore for MemoryTarget {
    async fn resolve_metadata(&mut self, table: &str) -> Result<TableMetadata> {
        Ok(self.db.lock().target(table)?.metadata.clone())
    }

    async fn execute_batch(
        &mut self,
        statement: &UpsertStatement,
        rows: &[TransformedRow],
    ) -> Result<u64> {
        let mut db = self.db.lock();
        db.batch_attempts += 1;
        if db.fail_on_batch == Some(db.batch_attempts) {
            return Err(SyncError::statement(
                TARGET,
                format!("batch {} rejected", db.batch_attempts),
            ));
        }

        let key_positions: Vec<usize> = statement
            .key_columns()
            .iter()
            .filter_map(|k| statement.columns().iter().position(|c| c == k))
            .collect();

        let target = db.target(statement.table())?;
        for row in rows {
            let values: Vec<Option<String>> = row.iter().map(|v| v.as_text()).collect();
            let key = key_positions.iter().map(|&i| values[i].clone()).collect();
            target.rows.insert(key, values);
        }
        db.commits.push(rows.len());
        Ok(rows.len() as u64)
    }

    async fn count(&mut self, table: &str) -> Result<i64> {
        Ok(self.db.lock().target(table)?.rows.len() as i64)
    }

    async fn call_procedure(&mut self, name: &str) -> Result<()> {
        self.db.lock().procedures_called.push(name.to_string());
        Ok(())
    }
}
