//! Core types for the watermark-sync pipeline.
//!
//! This crate holds everything that does not depend on a particular store:
//!
//! - [`TableMetadata`] / [`ColumnType`] - target table shape, types normalized
//!   to a closed set
//! - [`RowTransformer`] - best-effort coercion of staged text into typed values
//! - [`UpsertStatement`] - parameterized MERGE generation
//! - [`SourceStore`] / [`TargetStore`] / [`Connector`] - the seams the
//!   pipeline runs against
//! - [`SyncError`] - the fatal error taxonomy
//!
//! # Architecture
//!
//! ```text
//! sync-core (this crate)
//!    │
//!    ├─── checkpoint                  (load state + audit ledger)
//!    ├─── watermark-sync-postgresql   (implements the store traits)
//!    └─── watermark-sync              (pipeline, CLI)
//! ```

pub mod error;
pub mod identifier;
pub mod store;
pub mod transform;
pub mod types;
pub mod upsert;
pub mod values;

pub use error::{Result, SyncError};
pub use store::{ChangeColumns, Connector, LoadCondition, RowSink, SourceStore, TargetStore};
pub use transform::{
    coerce_numeric, coerce_text, coerce_timestamp, transform_value, Coercion, CoercionStats,
    RowTransformer, CANONICAL_TIMESTAMP_FORMAT, EPOCH_FALLBACK,
};
pub use types::{Column, ColumnType, TableMetadata};
pub use upsert::UpsertStatement;
pub use values::{Batch, StagedRow, TransformedRow, TransformedValue, DEFAULT_BATCH_CAPACITY};
