//! Parameterized MERGE generation from resolved table metadata.
//!
//! The generated statement binds one positional parameter per target column,
//! in column order, matching the layout produced by
//! [`RowTransformer`](crate::transform::RowTransformer):
//!
//! ```text
//! MERGE INTO "stage"."orders" AS tgt
//! USING (SELECT COALESCE($1::bigint, 0) AS "id",
//!               TO_TIMESTAMP($2::text, 'YYYY-MM-DD HH24:MI:SS')::timestamp AS "placed_at",
//!               $3::text AS "note") AS src
//! ON (tgt."id" = src."id")
//! WHEN MATCHED THEN UPDATE SET "placed_at" = src."placed_at", "note" = src."note"
//! WHEN NOT MATCHED THEN INSERT ("id", "placed_at", "note")
//!     VALUES (src."id", src."placed_at", src."note")
//! ```

use crate::error::{Result, SyncError};
use crate::identifier::{qualify, quote_identifier, validate_type_name};
use crate::types::{Column, ColumnType, TableMetadata};

/// Database-side format matching [`CANONICAL_TIMESTAMP_FORMAT`](crate::transform::CANONICAL_TIMESTAMP_FORMAT).
pub const SQL_TIMESTAMP_FORMAT: &str = "YYYY-MM-DD HH24:MI:SS";

/// A generated upsert statement together with the column layout it binds.
#[derive(Debug, Clone, PartialEq)]
pub struct UpsertStatement {
    table: String,
    sql: String,
    columns: Vec<String>,
    key_columns: Vec<String>,
    update_columns: Vec<String>,
}

impl UpsertStatement {
    /// Build the MERGE statement for a table.
    ///
    /// Fails before anything is executed when the table has no columns, no
    /// primary key, a key column that is not among the table's columns, or
    /// any identifier rejected by the allow-list. A keyless MERGE would
    /// match every row, so it is never generated.
    pub fn generate(metadata: &TableMetadata) -> Result<Self> {
        let table = &metadata.table_name;

        if metadata.columns.is_empty() {
            return Err(SyncError::Configuration(format!(
                "Table {table} resolved without any columns"
            )));
        }
        if metadata.primary_key_columns.is_empty() {
            return Err(SyncError::NoPrimaryKey(table.clone()));
        }

        let mut key_columns = Vec::with_capacity(metadata.primary_key_columns.len());
        for key in &metadata.primary_key_columns {
            let column = metadata.column(key).ok_or_else(|| {
                SyncError::Configuration(format!(
                    "Primary key column {key} is not a column of table {table}"
                ))
            })?;
            key_columns.push(column.name.clone());
        }

        let target = qualify(&metadata.schema, table)?;

        let mut projection = Vec::with_capacity(metadata.columns.len());
        let mut quoted = Vec::with_capacity(metadata.columns.len());
        let mut update_columns = Vec::new();

        for (i, column) in metadata.columns.iter().enumerate() {
            let name = quote_identifier(&column.name)?;
            projection.push(format!("{} AS {name}", source_expression(i + 1, column)?));
            if !metadata.is_key_column(&column.name) {
                update_columns.push(column.name.clone());
            }
            quoted.push(name);
        }

        let on_clause = key_columns
            .iter()
            .map(|k| {
                let k = quote_identifier(k)?;
                Ok(format!("tgt.{k} = src.{k}"))
            })
            .collect::<Result<Vec<_>>>()?
            .join(" AND ");

        let matched_clause = if update_columns.is_empty() {
            "WHEN MATCHED THEN DO NOTHING".to_string()
        } else {
            let set = update_columns
                .iter()
                .map(|c| {
                    let c = quote_identifier(c)?;
                    Ok(format!("{c} = src.{c}"))
                })
                .collect::<Result<Vec<_>>>()?
                .join(", ");
            format!("WHEN MATCHED THEN UPDATE SET {set}")
        };

        let insert_values = quoted
            .iter()
            .map(|c| format!("src.{c}"))
            .collect::<Vec<_>>()
            .join(", ");

        let sql = format!(
            "MERGE INTO {target} AS tgt \
             USING (SELECT {}) AS src \
             ON ({on_clause}) \
             {matched_clause} \
             WHEN NOT MATCHED THEN INSERT ({}) VALUES ({insert_values})",
            projection.join(", "),
            quoted.join(", "),
        );

        Ok(Self {
            table: table.clone(),
            sql,
            columns: metadata.columns.iter().map(|c| c.name.clone()).collect(),
            key_columns,
            update_columns,
        })
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// Bound columns, in parameter order.
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Columns used only for matching; never updated.
    pub fn key_columns(&self) -> &[String] {
        &self.key_columns
    }

    /// Non-key columns overwritten on match.
    pub fn update_columns(&self) -> &[String] {
        &self.update_columns
    }

    pub fn parameter_count(&self) -> usize {
        self.columns.len()
    }
}

/// Type-specific cast applied to positional parameter `$index`.
fn source_expression(index: usize, column: &Column) -> Result<String> {
    Ok(match column.column_type {
        ColumnType::Timestamp => {
            format!("TO_TIMESTAMP(${index}::text, '{SQL_TIMESTAMP_FORMAT}')::timestamp")
        }
        ColumnType::Numeric => format!("COALESCE(${index}::bigint, 0)"),
        ColumnType::Character => format!("${index}::text"),
        ColumnType::Other => {
            validate_type_name(&column.declared_type)?;
            format!("CAST(${index}::text AS {})", column.declared_type.trim())
        }
    })
}
