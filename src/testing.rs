//! In-memory stores and notifiers for exercising the pipeline without a
//! database.
//!
//! [`MemoryConnector`] stands in for a source and a target PostgreSQL
//! instance and can be told to fail in the ways a real run fails: an
//! unreachable store or a batch rejected mid-load. It also counts open
//! connections so tests can check that every run releases what it opened.

pub mod notifier;
pub mod store;

pub use notifier::RecordingNotifier;
pub use store::{MemoryConnector, MemorySource, MemoryTarget};

use chrono::NaiveDateTime;

/// `YYYY-MM-DD HH:MM:SS` → timestamp; panics on malformed input.
pub fn ts(value: &str) -> NaiveDateTime {
    NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S")
        .unwrap_or_else(|e| panic!("bad test timestamp {value}: {e}"))
}
