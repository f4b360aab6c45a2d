//! Connection setup shared by the source, target and ledger stores.

use std::time::Duration;

use sync_core::{identifier::validate_identifier, Result, SyncError};
use tokio_postgres::{Client, NoTls};
use tracing::{debug, error};

/// PostgreSQL connection options
#[derive(Clone, Debug)]
pub struct ConnectOpts {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: Option<String>,
    pub dbname: String,
    /// Schema holding the replicated (or ledger) tables
    pub schema: String,
    /// Server-side `statement_timeout` for every statement on this connection
    pub statement_timeout: Option<Duration>,
    pub connect_timeout: Option<Duration>,
}

impl ConnectOpts {
    /// Human-readable `user@host:port/db` for logs and error messages.
    pub fn display_name(&self) -> String {
        format!("{}@{}:{}/{}", self.user, self.host, self.port, self.dbname)
    }

    fn to_config(&self) -> tokio_postgres::Config {
        let mut config = tokio_postgres::Config::new();
        config
            .host(&self.host)
            .port(self.port)
            .user(&self.user)
            .dbname(&self.dbname)
            .application_name("watermark-sync");
        if let Some(password) = &self.password {
            config.password(password);
        }
        if let Some(timeout) = self.connect_timeout {
            config.connect_timeout(timeout);
        }
        if let Some(timeout) = self.statement_timeout {
            config.options(&format!("-c statement_timeout={}", timeout.as_millis()));
        }
        config
    }
}

/// Open a connection and spawn its driver task.
///
/// The task ends when the returned [`Client`] is dropped, which is how every
/// store releases its connection.
pub async fn connect(opts: &ConnectOpts, store: &str) -> Result<Client> {
    validate_identifier(&opts.schema)?;

    debug!("Connecting to {} store at {}", store, opts.display_name());
    let (client, connection) = opts
        .to_config()
        .connect(NoTls)
        .await
        .map_err(|e| SyncError::connectivity(store, format!("{}: {e}", opts.display_name())))?;

    let store_name = store.to_string();
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            error!("PostgreSQL connection error on {store_name} store: {e}");
        }
    });

    Ok(client)
}

/// Map a driver error to the pipeline taxonomy.
///
/// A closed connection is a connectivity failure; anything the server
/// rejected is a statement failure.
pub(crate) fn classify(store: &str, err: tokio_postgres::Error) -> SyncError {
    if err.is_closed() {
        SyncError::connectivity(store, err)
    } else {
        match err.as_db_error() {
            Some(db) => SyncError::statement(
                store,
                format!("{} ({})", db.message(), db.code().code()),
            ),
            None => SyncError::statement(store, err),
        }
    }
}

/// Find the catalog spelling of `table` in `schema`, matching case-insensitively.
pub(crate) async fn resolve_table_name(
    client: &Client,
    store: &str,
    schema: &str,
    table: &str,
) -> Result<String> {
    let rows = client
        .query(
            "SELECT table_name::text FROM information_schema.tables \
             WHERE table_schema = $1 AND lower(table_name) = lower($2) \
             ORDER BY (table_name = $2) DESC",
            &[&schema, &table],
        )
        .await
        .map_err(|e| classify(store, e))?;

    match rows.first() {
        Some(row) => Ok(row.get(0)),
        None => Err(SyncError::Configuration(format!(
            "Table {schema}.{table} not found in {store} store"
        ))),
    }
}

/// Column names of a table in ordinal order.
pub(crate) async fn ordered_columns(
    client: &Client,
    store: &str,
    schema: &str,
    table: &str,
) -> Result<Vec<String>> {
    let rows = client
        .query(
            "SELECT column_name::text FROM information_schema.columns \
             WHERE table_schema = $1 AND table_name = $2 \
             ORDER BY ordinal_position",
            &[&schema, &table],
        )
        .await
        .map_err(|e| classify(store, e))?;
    Ok(rows.iter().map(|row| row.get::<_, String>(0)).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts() -> ConnectOpts {
        ConnectOpts {
            host: "db.internal".to_string(),
            port: 5433,
            user: "etl".to_string(),
            password: Some("secret".to_string()),
            dbname: "warehouse".to_string(),
            schema: "stage".to_string(),
            statement_timeout: Some(Duration::from_secs(30)),
            connect_timeout: None,
        }
    }

    #[test]
    fn test_display_name_omits_password() {
        let name = opts().display_name();
        assert_eq!(name, "etl@db.internal:5433/warehouse");
        assert!(!name.contains("secret"));
    }

    #[test]
    fn test_config_carries_statement_timeout() {
        let config = opts().to_config();
        assert_eq!(config.get_options(), Some("-c statement_timeout=30000"));
        assert_eq!(config.get_ports(), &[5433]);
        assert_eq!(config.get_dbname(), Some("warehouse"));
    }
}
