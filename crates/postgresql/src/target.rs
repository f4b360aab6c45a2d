//! Metadata resolution and batched MERGE execution against the target.

use std::collections::HashMap;

use async_trait::async_trait;
use sync_core::identifier::{qualify, split_qualified};
use sync_core::{
    Result, TableMetadata, TargetStore, TransformedRow, TransformedValue, UpsertStatement,
};
use tokio_postgres::types::ToSql;
use tokio_postgres::Client;
use tracing::{debug, info};

use crate::client::{classify, connect, ordered_columns, resolve_table_name, ConnectOpts};

const STORE: &str = "target";

const COLUMN_TYPES_QUERY: &str = "SELECT column_name::text, \
     CASE WHEN data_type IN ('USER-DEFINED', 'ARRAY') THEN udt_name::text \
          ELSE data_type::text END \
     FROM information_schema.columns \
     WHERE table_schema = $1 AND table_name = $2";

const PRIMARY_KEY_QUERY: &str = "SELECT kcu.column_name::text \
     FROM information_schema.table_constraints tc \
     JOIN information_schema.key_column_usage kcu \
       ON tc.constraint_name = kcu.constraint_name \
      AND tc.table_schema = kcu.table_schema \
      AND tc.table_name = kcu.table_name \
     WHERE tc.constraint_type = 'PRIMARY KEY' \
       AND tc.table_schema = $1 AND tc.table_name = $2 \
     ORDER BY kcu.ordinal_position";

/// Write side of a run, holding one connection for its lifetime.
pub struct PostgresTarget {
    client: Client,
    schema: String,
}

impl PostgresTarget {
    pub async fn connect(opts: &ConnectOpts) -> Result<Self> {
        let client = connect(opts, STORE).await?;
        Ok(Self::new(client, opts.schema.clone()))
    }

    pub fn new(client: Client, schema: impl Into<String>) -> Self {
        Self {
            client,
            schema: schema.into(),
        }
    }
}

/// Positional parameters for one transformed row.
pub(crate) fn bind_row(row: &TransformedRow) -> Vec<Box<dyn ToSql + Sync + Send>> {
    row.iter()
        .map(|value| -> Box<dyn ToSql + Sync + Send> {
            match value {
                TransformedValue::Timestamp(v) | TransformedValue::Text(v) => Box::new(v.clone()),
                TransformedValue::Integer(n) => Box::new(*n),
            }
        })
        .collect()
}

/// `CALL` statement for a post-load procedure, unqualified names resolved
/// through `default_schema`.
pub(crate) fn call_statement(default_schema: &str, name: &str) -> Result<String> {
    let (schema, routine) = split_qualified(name)?;
    let schema = schema.unwrap_or(default_schema);
    Ok(format!("CALL {}()", qualify(schema, routine)?))
}

#[async_trait]
impl TargetStore for PostgresTarget {
    async fn resolve_metadata(&mut self, table: &str) -> Result<TableMetadata> {
        let table = resolve_table_name(&self.client, STORE, &self.schema, table).await?;

        let columns = ordered_columns(&self.client, STORE, &self.schema, &table).await?;

        let types: HashMap<String, String> = self
            .client
            .query(COLUMN_TYPES_QUERY, &[&self.schema, &table])
            .await
            .map_err(|e| classify(STORE, e))?
            .iter()
            .map(|row| (row.get(0), row.get(1)))
            .collect();

        let primary_key: Vec<String> = self
            .client
            .query(PRIMARY_KEY_QUERY, &[&self.schema, &table])
            .await
            .map_err(|e| classify(STORE, e))?
            .iter()
            .map(|row| row.get(0))
            .collect();

        debug!(
            "Resolved {}.{}: {} columns, primary key {:?}",
            self.schema,
            table,
            columns.len(),
            primary_key
        );

        Ok(TableMetadata::from_catalog(
            self.schema.clone(),
            table,
            columns,
            &types,
            primary_key,
        ))
    }

    async fn execute_batch(
        &mut self,
        statement: &UpsertStatement,
        rows: &[TransformedRow],
    ) -> Result<u64> {
        let tx = self
            .client
            .transaction()
            .await
            .map_err(|e| classify(STORE, e))?;
        let prepared = tx
            .prepare(statement.sql())
            .await
            .map_err(|e| classify(STORE, e))?;

        let mut affected = 0u64;
        for row in rows {
            let params = bind_row(row);
            let refs: Vec<&(dyn ToSql + Sync)> = params
                .iter()
                .map(|p| p.as_ref() as &(dyn ToSql + Sync))
                .collect();
            affected += tx
                .execute(&prepared, &refs)
                .await
                .map_err(|e| classify(STORE, e))?;
        }

        // Dropping the transaction on any error above rolls it back.
        tx.commit().await.map_err(|e| classify(STORE, e))?;
        Ok(affected)
    }

    async fn count(&mut self, table: &str) -> Result<i64> {
        let table = resolve_table_name(&self.client, STORE, &self.schema, table).await?;
        let sql = format!("SELECT COUNT(*) FROM {}", qualify(&self.schema, &table)?);
        let row = self
            .client
            .query_one(sql.as_str(), &[])
            .await
            .map_err(|e| classify(STORE, e))?;
        Ok(row.get(0))
    }

    async fn call_procedure(&mut self, name: &str) -> Result<()> {
        let sql = call_statement(&self.schema, name)?;
        info!("Running post-load procedure: {sql}");
        self.client
            .batch_execute(&sql)
            .await
            .map_err(|e| classify(STORE, e))
    }
}
