//! watermark-sync
//!
//! Incremental replication of PostgreSQL tables into another PostgreSQL
//! database, driven by a per-table watermark.
//!
//! A run extracts every source row loaded or modified since the table's
//! watermark into a CSV staging artifact, merges the staged rows into the
//! target in independently committed batches, reconciles row counts, and
//! only then advances the watermark. A failed run leaves the watermark where
//! it was, so the next run re-extracts the same window.
//!
//! # Crates
//!
//! - `sync-core` - metadata, row transformation, MERGE generation, store traits
//! - `checkpoint` - load state tracker and audit ledger
//! - `watermark-sync-postgresql` - PostgreSQL source, target and ledger
//!
//! # CLI Usage
//!
//! ```bash
//! # Initial load of ods.orders into the "warehouse" target
//! watermark-sync run orders orders warehouse initial --config sync.toml
//!
//! # Delta load, calling a post-load procedure
//! watermark-sync run orders orders warehouse delta stage.refresh_orders
//!
//! # Create the ledger tables / show load state
//! watermark-sync init-ledger warehouse
//! watermark-sync status warehouse
//! ```

pub mod config;
pub mod extract;
pub mod load;
pub mod logging;
pub mod notify;
pub mod reconcile;
pub mod run;
pub mod staging;
pub mod testing;

pub use config::Config;
pub use run::{RunController, RunIdentity, RunOutcome, RunPhase, RunRequest, RunSettings};
