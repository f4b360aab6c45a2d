//! Row representations between extraction and load.

use serde::{Deserialize, Serialize};

/// Raw textual values of one extracted record, aligned to the staging header.
///
/// `None` stands for a SQL NULL or an empty staged field; the staging file
/// does not distinguish the two.
pub type StagedRow = Vec<Option<String>>;

/// A staged value coerced for its target column.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransformedValue {
    /// Canonical `YYYY-MM-DD HH:MM:SS` text, or null
    Timestamp(Option<String>),
    /// Numeric columns never carry null; malformed input is already zero
    Integer(i64),
    Text(Option<String>),
}

impl TransformedValue {
    pub fn is_null(&self) -> bool {
        match self {
            TransformedValue::Timestamp(v) | TransformedValue::Text(v) => v.is_none(),
            TransformedValue::Integer(_) => false,
        }
    }

    /// Text form used for key comparison and diagnostics.
    pub fn as_text(&self) -> Option<String> {
        match self {
            TransformedValue::Timestamp(v) | TransformedValue::Text(v) => v.clone(),
            TransformedValue::Integer(n) => Some(n.to_string()),
        }
    }
}

/// Typed values aligned to target column order.
pub type TransformedRow = Vec<TransformedValue>;

/// Default number of rows committed per target transaction.
pub const DEFAULT_BATCH_CAPACITY: usize = 10_000;

/// Bounded, ordered group of rows committed as one target transaction.
#[derive(Debug, Clone)]
pub struct Batch {
    number: usize,
    capacity: usize,
    rows: Vec<TransformedRow>,
}

impl Batch {
    /// Start the first batch. A zero capacity is raised to one.
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            number: 1,
            capacity,
            rows: Vec::with_capacity(capacity.min(DEFAULT_BATCH_CAPACITY)),
        }
    }

    /// 1-based position of this batch within the run.
    pub fn number(&self) -> usize {
        self.number
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn push(&mut self, row: TransformedRow) {
        self.rows.push(row);
    }

    pub fn is_full(&self) -> bool {
        self.rows.len() >= self.capacity
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn rows(&self) -> &[TransformedRow] {
        &self.rows
    }

    /// Drop the current rows and move on to the next batch number.
    pub fn advance(&mut self) {
        self.rows.clear();
        self.number += 1;
    }
}
