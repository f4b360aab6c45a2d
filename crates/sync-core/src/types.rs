//! Target-table metadata as resolved from the catalog.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Closed set that declared catalog types are normalized into.
///
/// The normalized type decides both how a staged value is coerced and which
/// cast the upsert statement applies to the bound parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ColumnType {
    /// `date`, `timestamp`, `timestamp with time zone`
    Timestamp,
    /// Integer-valued numerics (`numeric`, `integer`, `bigint`, ...)
    Numeric,
    /// `text`, `character varying`, `character`
    Character,
    /// Everything else; bound as text and cast to the declared type
    Other,
}

impl ColumnType {
    /// Normalize a declared catalog type name.
    ///
    /// Floating point types are classified as [`ColumnType::Other`] so they are
    /// cast from text instead of being forced through integer coercion.
    pub fn classify(declared: &str) -> Self {
        let t = declared.trim().to_ascii_lowercase();
        let base = t.split('(').next().unwrap_or_default().trim();

        match base {
            "date" => ColumnType::Timestamp,
            b if b.starts_with("timestamp") => ColumnType::Timestamp,
            "numeric" | "decimal" | "number" | "integer" | "int" | "int2" | "int4" | "int8"
            | "bigint" | "smallint" => ColumnType::Numeric,
            "text" | "varchar" | "varchar2" | "char" | "bpchar" | "nvarchar2" => {
                ColumnType::Character
            }
            b if b.starts_with("character") => ColumnType::Character,
            _ => ColumnType::Other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ColumnType::Timestamp => "timestamp",
            ColumnType::Numeric => "numeric",
            ColumnType::Character => "character",
            ColumnType::Other => "other",
        }
    }
}

impl std::fmt::Display for ColumnType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One column of a target table, in catalog order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    /// Type name as the catalog reports it, used for `CAST` of other-typed columns
    pub declared_type: String,
    pub column_type: ColumnType,
}

impl Column {
    pub fn new(name: impl Into<String>, declared_type: impl Into<String>) -> Self {
        let declared_type = declared_type.into();
        Self {
            name: name.into(),
            column_type: ColumnType::classify(&declared_type),
            declared_type,
        }
    }
}

/// Column list, type map and primary key of a target table.
///
/// Resolved fresh on every run and never persisted: the target catalog owns
/// this information and the schema may change between runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableMetadata {
    pub schema: String,
    pub table_name: String,
    pub columns: Vec<Column>,
    pub primary_key_columns: Vec<String>,
}

impl TableMetadata {
    pub fn new(
        schema: impl Into<String>,
        table_name: impl Into<String>,
        columns: Vec<Column>,
        primary_key_columns: Vec<String>,
    ) -> Self {
        Self {
            schema: schema.into(),
            table_name: table_name.into(),
            columns,
            primary_key_columns,
        }
    }

    /// Assemble metadata from the three separate catalog lookups.
    ///
    /// Columns missing from `types` are treated as [`ColumnType::Other`] with
    /// an empty declared type and will be rejected by statement generation.
    pub fn from_catalog(
        schema: impl Into<String>,
        table_name: impl Into<String>,
        column_names: Vec<String>,
        types: &HashMap<String, String>,
        primary_key_columns: Vec<String>,
    ) -> Self {
        let columns = column_names
            .into_iter()
            .map(|name| {
                let declared = types.get(&name).cloned().unwrap_or_default();
                Column::new(name, declared)
            })
            .collect();
        Self::new(schema, table_name, columns, primary_key_columns)
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    /// Column name to normalized type.
    pub fn type_map(&self) -> HashMap<&str, ColumnType> {
        self.columns
            .iter()
            .map(|c| (c.name.as_str(), c.column_type))
            .collect()
    }

    pub fn is_key_column(&self, name: &str) -> bool {
        self.primary_key_columns
            .iter()
            .any(|k| k.eq_ignore_ascii_case(name))
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(name))
    }
}
