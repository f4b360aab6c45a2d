//! Best-effort coercion of staged text into target-typed values.
//!
//! Malformed input never fails a row. It degrades to a fixed default:
//! unparseable timestamps become [`EPOCH_FALLBACK`] and non-integer numerics
//! become zero. Every substitution made for non-empty input is counted in
//! [`CoercionStats`] so the run can report what it laundered.

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use std::collections::{BTreeMap, HashMap};

use crate::types::{ColumnType, TableMetadata};
use crate::values::{StagedRow, TransformedRow, TransformedValue};

/// Output format of every coerced timestamp.
pub const CANONICAL_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Substituted for timestamp text that no accepted format can parse.
pub const EPOCH_FALLBACK: &str = "1970-01-01 00:00:00";

/// Result of coercing a single value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Coercion<T> {
    /// Input was absent, empty or well-formed
    Clean(T),
    /// Input was present but malformed; a default was substituted
    Defaulted(T),
}

impl<T> Coercion<T> {
    pub fn into_inner(self) -> T {
        match self {
            Coercion::Clean(v) | Coercion::Defaulted(v) => v,
        }
    }

    pub fn is_defaulted(&self) -> bool {
        matches!(self, Coercion::Defaulted(_))
    }
}

/// Parse timestamp text, keeping the wall-clock time.
///
/// ISO-8601 input (anything containing `T`) has a trailing `Z` stripped, and
/// an explicit UTC offset is accepted but not applied. Non-ISO input must be
/// `YYYY-MM-DD HH:MM:SS` with optional fractional seconds and offset, or a
/// bare date.
pub fn parse_timestamp(value: &str) -> Option<NaiveDateTime> {
    let value = value.trim();

    if value.contains('T') {
        let naive = value.trim_end_matches(['Z', 'z']);
        if let Ok(ts) = NaiveDateTime::parse_from_str(naive, "%Y-%m-%dT%H:%M:%S%.f") {
            return Some(ts);
        }
        if let Ok(ts) = NaiveDateTime::parse_from_str(naive, "%Y-%m-%dT%H:%M") {
            return Some(ts);
        }
        if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
            return Some(ts.naive_local());
        }
    }

    NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S%.f")
        .ok()
        .or_else(|| {
            DateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S%.f%#z")
                .ok()
                .map(|ts| ts.naive_local())
        })
        .or_else(|| {
            NaiveDate::parse_from_str(value, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
}

/// Timestamp/date coercion: empty or absent is null, unparseable is epoch.
pub fn coerce_timestamp(raw: Option<&str>) -> Coercion<Option<String>> {
    match raw {
        None => Coercion::Clean(None),
        Some(v) if v.is_empty() => Coercion::Clean(None),
        Some(v) => match parse_timestamp(v) {
            Some(ts) => Coercion::Clean(Some(ts.format(CANONICAL_TIMESTAMP_FORMAT).to_string())),
            None => Coercion::Defaulted(Some(EPOCH_FALLBACK.to_string())),
        },
    }
}

/// Numeric coercion: only unsigned digit strings parse, everything else is 0.
pub fn coerce_numeric(raw: Option<&str>) -> Coercion<i64> {
    match raw {
        None => Coercion::Clean(0),
        Some(v) if v.is_empty() => Coercion::Clean(0),
        Some(v) if v.bytes().all(|b| b.is_ascii_digit()) => match v.parse::<i64>() {
            Ok(n) => Coercion::Clean(n),
            Err(_) => Coercion::Defaulted(0),
        },
        Some(_) => Coercion::Defaulted(0),
    }
}

/// Text coercion: empty becomes null, anything else passes through.
pub fn coerce_text(raw: Option<&str>) -> Option<String> {
    match raw {
        Some(v) if !v.is_empty() => Some(v.to_string()),
        _ => None,
    }
}

/// Coerce one raw value according to its normalized column type.
pub fn transform_value(column_type: ColumnType, raw: Option<&str>) -> Coercion<TransformedValue> {
    match column_type {
        ColumnType::Timestamp => match coerce_timestamp(raw) {
            Coercion::Clean(v) => Coercion::Clean(TransformedValue::Timestamp(v)),
            Coercion::Defaulted(v) => Coercion::Defaulted(TransformedValue::Timestamp(v)),
        },
        ColumnType::Numeric => match coerce_numeric(raw) {
            Coercion::Clean(v) => Coercion::Clean(TransformedValue::Integer(v)),
            Coercion::Defaulted(v) => Coercion::Defaulted(TransformedValue::Integer(v)),
        },
        ColumnType::Character | ColumnType::Other => {
            Coercion::Clean(TransformedValue::Text(coerce_text(raw)))
        }
    }
}

/// Per-column counts of values replaced by a default.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CoercionStats {
    defaulted: BTreeMap<String, u64>,
}

impl CoercionStats {
    pub fn record(&mut self, column: &str) {
        *self.defaulted.entry(column.to_string()).or_insert(0) += 1;
    }

    pub fn total(&self) -> u64 {
        self.defaulted.values().sum()
    }

    pub fn is_empty(&self) -> bool {
        self.defaulted.is_empty()
    }

    pub fn for_column(&self, column: &str) -> u64 {
        self.defaulted.get(column).copied().unwrap_or(0)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> {
        self.defaulted.iter().map(|(k, v)| (k.as_str(), *v))
    }
}

/// Maps staged rows onto target column order and coerces every value.
///
/// Staging headers are matched to target columns case-insensitively. A
/// target column with no staged counterpart is coerced from an absent value;
/// staged columns unknown to the target are ignored.
pub struct RowTransformer<'a> {
    metadata: &'a TableMetadata,
    positions: Vec<Option<usize>>,
    ignored_headers: Vec<String>,
    stats: CoercionStats,
}

impl<'a> RowTransformer<'a> {
    pub fn new(metadata: &'a TableMetadata, staged_headers: &[String]) -> Self {
        let index: HashMap<String, usize> = staged_headers
            .iter()
            .enumerate()
            .map(|(i, h)| (h.to_ascii_lowercase(), i))
            .collect();

        let positions = metadata
            .columns
            .iter()
            .map(|c| index.get(&c.name.to_ascii_lowercase()).copied())
            .collect();

        let ignored_headers = staged_headers
            .iter()
            .filter(|h| metadata.column(h).is_none())
            .cloned()
            .collect();

        Self {
            metadata,
            positions,
            ignored_headers,
            stats: CoercionStats::default(),
        }
    }

    /// Target columns that have no staged counterpart.
    pub fn missing_columns(&self) -> Vec<&str> {
        self.metadata
            .columns
            .iter()
            .zip(&self.positions)
            .filter(|(_, pos)| pos.is_none())
            .map(|(c, _)| c.name.as_str())
            .collect()
    }

    /// Staged columns that the target table does not have.
    pub fn ignored_headers(&self) -> &[String] {
        &self.ignored_headers
    }

    pub fn transform(&mut self, row: &StagedRow) -> TransformedRow {
        let mut out = Vec::with_capacity(self.metadata.columns.len());
        for (column, pos) in self.metadata.columns.iter().zip(&self.positions) {
            let raw = pos
                .and_then(|i| row.get(i))
                .and_then(|v| v.as_deref());
            let coerced = transform_value(column.column_type, raw);
            if coerced.is_defaulted() {
                self.stats.record(&column.name);
            }
            out.push(coerced.into_inner());
        }
        out
    }

    pub fn stats(&self) -> &CoercionStats {
        &self.stats
    }

    pub fn into_stats(self) -> CoercionStats {
        self.stats
    }
}
