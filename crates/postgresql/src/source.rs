//! Watermark-filtered extraction from a PostgreSQL source table.

use async_trait::async_trait;
use chrono::NaiveDateTime;
use futures::{pin_mut, TryStreamExt};
use sync_core::identifier::{qualify, quote_identifier};
use sync_core::{LoadCondition, Result, RowSink, SourceStore, StagedRow};
use tokio_postgres::types::ToSql;
use tokio_postgres::Client;
use tracing::{debug, info};

use crate::client::{classify, connect, ordered_columns, resolve_table_name, ConnectOpts};

const STORE: &str = "source";

/// Read side of a run, holding one connection for its lifetime.
pub struct PostgresSource {
    client: Client,
    schema: String,
}

impl PostgresSource {
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

    async fn resolve(&self, table: &str) -> Result<String> {
        resolve_table_name(&self.client, STORE, &self.schema, table).await
    }
}

/// `WHERE` clause and its single timestamp parameter for a load condition.
pub(crate) fn condition_clause(
    condition: &LoadCondition,
) -> Result<(String, Option<NaiveDateTime>)> {
    match condition {
        LoadCondition::All => Ok((String::new(), None)),
        LoadCondition::ChangedSince { watermark, columns } => {
            let load = quote_identifier(&columns.load)?;
            let modify = quote_identifier(&columns.modify)?;
            Ok((
                format!(" WHERE {load} >= $1::timestamp OR {modify} >= $1::timestamp"),
                Some(*watermark),
            ))
        }
    }
}

/// `SELECT` with every column cast to text so staging never depends on
/// driver type support.
pub(crate) fn extract_query(
    schema: &str,
    table: &str,
    columns: &[String],
    condition: &LoadCondition,
) -> Result<(String, Option<NaiveDateTime>)> {
    let projection = columns
        .iter()
        .map(|c| Ok(format!("{}::text", quote_identifier(c)?)))
        .collect::<Result<Vec<_>>>()?
        .join(", ");
    let (clause, param) = condition_clause(condition)?;
    Ok((
        format!("SELECT {projection} FROM {}{clause}", qualify(schema, table)?),
        param,
    ))
}

pub(crate) fn count_query(
    schema: &str,
    table: &str,
    condition: &LoadCondition,
) -> Result<(String, Option<NaiveDateTime>)> {
    let (clause, param) = condition_clause(condition)?;
    Ok((
        format!("SELECT COUNT(*) FROM {}{clause}", qualify(schema, table)?),
        param,
    ))
}

#[async_trait]
impl SourceStore for PostgresSource {
    async fn columns(&mut self, table: &str) -> Result<Vec<String>> {
        let table = self.resolve(table).await?;
        ordered_columns(&self.client, STORE, &self.schema, &table).await
    }

    async fn extract(
        &mut self,
        table: &str,
        condition: &LoadCondition,
        sink: &mut dyn RowSink,
    ) -> Result<u64> {
        let table = self.resolve(table).await?;
        let columns = ordered_columns(&self.client, STORE, &self.schema, &table).await?;
        let (sql, watermark) = extract_query(&self.schema, &table, &columns, condition)?;

        info!("Extracting {}.{} where {}", self.schema, table, condition);
        debug!("Extraction query: {sql}");

        let params: Vec<&(dyn ToSql + Sync)> = match &watermark {
            Some(w) => vec![w as &(dyn ToSql + Sync)],
            None => Vec::new(),
        };
        let stream = self
            .client
            .query_raw(sql.as_str(), params)
            .await
            .map_err(|e| classify(STORE, e))?;
        pin_mut!(stream);

        let mut written = 0u64;
        while let Some(row) = stream.try_next().await.map_err(|e| classify(STORE, e))? {
            let staged: StagedRow = (0..row.len())
                .map(|i| row.get::<_, Option<String>>(i))
                .collect();
            sink.write_row(&staged)?;
            written += 1;
            if written % 100_000 == 0 {
                debug!("Extracted {written} rows from {table} so far");
            }
        }

        Ok(written)
    }

    async fn count(&mut self, table: &str, condition: &LoadCondition) -> Result<i64> {
        let table = self.resolve(table).await?;
        let (sql, watermark) = count_query(&self.schema, &table, condition)?;
        let row = match &watermark {
            Some(w) => self.client.query_one(sql.as_str(), &[w]).await,
            None => self.client.query_one(sql.as_str(), &[]).await,
        }
        .map_err(|e| classify(STORE, e))?;
        Ok(row.get(0))
    }
}
