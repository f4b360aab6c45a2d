//! Audit records written once per run.

use std::time::Duration;

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

use crate::LoadStatus;

/// Audit row for one run of one table.
///
/// Opened as RUNNING before extraction, updated after every committed batch,
/// and closed as COMPLETE or FAILED.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadRunAudit {
    pub load_id: String,
    pub table_name: String,
    pub load_date: NaiveDate,
    pub start_time: NaiveDateTime,
    pub end_time: Option<NaiveDateTime>,
    pub status: LoadStatus,
    /// Rows extracted from the source
    pub row_count: Option<u64>,
    #[serde(with = "duration_millis")]
    pub execution_time: Option<Duration>,
    /// Batches committed to the target so far
    pub batches_committed: u64,
}

impl LoadRunAudit {
    pub fn running(
        load_id: impl Into<String>,
        table_name: impl Into<String>,
        start_time: NaiveDateTime,
    ) -> Self {
        Self {
            load_id: load_id.into(),
            table_name: table_name.into(),
            load_date: start_time.date(),
            start_time,
            end_time: None,
            status: LoadStatus::Running,
            row_count: None,
            execution_time: None,
            batches_committed: 0,
        }
    }

    pub fn complete(&mut self, end_time: NaiveDateTime, row_count: u64, elapsed: Duration) {
        self.status = LoadStatus::Complete;
        self.end_time = Some(end_time);
        self.row_count = Some(row_count);
        self.execution_time = Some(elapsed);
    }

    /// Row count is kept if extraction got far enough to record it.
    pub fn fail(&mut self, end_time: NaiveDateTime, elapsed: Duration) {
        self.status = LoadStatus::Failed;
        self.end_time = Some(end_time);
        self.execution_time = Some(elapsed);
    }

    /// Audit rows are keyed by load id, table and start time; the load id
    /// alone repeats across runs of the same table.
    pub fn same_run(&self, other: &LoadRunAudit) -> bool {
        self.load_id == other.load_id
            && self.table_name == other.table_name
            && self.start_time == other.start_time
    }

    pub fn execution_millis(&self) -> Option<i64> {
        self.execution_time
            .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
    }
}

/// Source/target drift measured after a load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconciliationRecord {
    pub table_name: String,
    pub target_count: i64,
    pub source_count: i64,
    /// `source_count - target_count`
    pub diff: i64,
    /// `diff / 100`
    pub diff_percent: f64,
    pub load_id: String,
    pub timestamp: NaiveDateTime,
}

impl ReconciliationRecord {
    pub fn new(
        table_name: impl Into<String>,
        source_count: i64,
        target_count: i64,
        load_id: impl Into<String>,
        timestamp: NaiveDateTime,
    ) -> Self {
        let diff = source_count - target_count;
        Self {
            table_name: table_name.into(),
            target_count,
            source_count,
            diff,
            // Not a true percentage: existing ledger rows store diff/100.
            diff_percent: diff as f64 / 100.0,
            load_id: load_id.into(),
            timestamp,
        }
    }

    pub fn is_balanced(&self) -> bool {
        self.diff == 0
    }
}

mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        value
            .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
            .serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
    }
}
