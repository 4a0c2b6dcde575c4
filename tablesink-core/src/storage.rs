//! Storage driver boundary. Table and column names come from destination keys and from record
//! keys, so they are never trusted: every name is wrapped in an [Identifier] and only reaches the
//! driver quoted, while values are always bound as statement parameters.

use std::fmt::{Display, Formatter};

use async_trait::async_trait;
use serde_json::Value;

use crate::Result;
use crate::message::Record;

/// A table or column name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identifier(String);

impl Identifier {
    pub fn new(raw: impl Into<String>) -> Self {
        // NUL can never be part of an identifier
        Identifier(raw.into().replace('\0', ""))
    }

    pub fn raw(&self) -> &str {
        &self.0
    }

    /// The name as a double-quoted SQL identifier, embedded quotes doubled.
    pub fn quoted(&self) -> String {
        format!("\"{}\"", self.0.replace('"', "\"\""))
    }
}

impl Display for Identifier {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.quoted())
    }
}

/// One row to insert, column name to textual value (`None` is SQL `NULL`).
pub type Row = Vec<(Identifier, Option<String>)>;

/// Derives the physical table name of a destination. Pure, the same key and suffix always give
/// the same name.
pub fn table_name(destination: &str, suffix: Option<&str>) -> Identifier {
    match suffix {
        Some(suffix) if !suffix.is_empty() => Identifier::new(format!("{destination}_{suffix}")),
        _ => Identifier::new(destination),
    }
}

/// Converts a record into a row, columns in record order. Columns are free-text typed so scalars
/// are stored in their textual form and nested values as JSON text.
pub fn to_row(record: &Record) -> Row {
    record
        .iter()
        .map(|(key, value)| (Identifier::new(key.as_str()), column_value(value)))
        .collect()
}

fn column_value(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        nested => Some(nested.to_string()),
    }
}

/// `CREATE TABLE IF NOT EXISTS` with every column typed `TEXT`.
pub fn create_table_sql(table: &Identifier, columns: &[Identifier]) -> String {
    let columns = columns
        .iter()
        .map(|column| format!("{column} TEXT"))
        .collect::<Vec<_>>()
        .join(", ");
    format!("CREATE TABLE IF NOT EXISTS {table} ({columns})")
}

/// Parameterized `INSERT` for the given columns, values are bound as `$1..$n` in column order.
pub fn insert_sql(table: &Identifier, columns: &[&Identifier]) -> String {
    if columns.is_empty() {
        return format!("INSERT INTO {table} DEFAULT VALUES");
    }
    let names = columns
        .iter()
        .map(|column| column.quoted())
        .collect::<Vec<_>>()
        .join(", ");
    let placeholders = (1..=columns.len())
        .map(|i| format!("${i}"))
        .collect::<Vec<_>>()
        .join(", ");
    format!("INSERT INTO {table} ({names}) VALUES ({placeholders})")
}

/// Raw execution of table creation and row inserts against the relational store.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Idempotent, creating a table that already exists succeeds without touching it.
    async fn create_table_if_not_exists(&self, table: &Identifier, columns: &[Identifier])
    -> Result<()>;

    async fn insert_row(&self, table: &Identifier, row: &[(Identifier, Option<String>)])
    -> Result<()>;
}
