//! PostgreSQL stores for watermark-sync
//!
//! - [`PostgresSource`] - watermark-filtered extraction, streamed row by row
//! - [`PostgresTarget`] - catalog introspection and batched MERGE execution
//! - [`PostgresLedger`] - load state, run audit and reconciliation tables
//!
//! Every store owns exactly one `tokio_postgres::Client`; dropping the store
//! closes its connection.

mod client;
mod ledger;
mod source;
mod target;

use async_trait::async_trait;
use sync_core::{Connector, Result};

pub use client::{connect, ConnectOpts};
pub use ledger::{list_states, PostgresLedger};
pub use source::PostgresSource;
pub use target::PostgresTarget;

/// Opens run-scoped source and target connections from fixed options.
#[derive(Clone, Debug)]
pub struct PostgresConnector {
    source: ConnectOpts,
    target: ConnectOpts,
}

impl PostgresConnector {
    pub fn new(source: ConnectOpts, target: ConnectOpts) -> Self {
        Self { source, target }
    }
}

#[async_trait]
impl Connector for PostgresConnector {
    type Source = PostgresSource;
    type Target = PostgresTarget;

    async fn connect_source(&self) -> Result<PostgresSource> {
        PostgresSource::connect(&self.source).await
    }

    async fn connect_target(&self) -> Result<PostgresTarget> {
        PostgresTarget::connect(&self.target).await
    }
}
