//! TableBackend trait: the database the tabular strategy queries.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::chunk::Row;
use crate::error::TableError;

/// One column of a table schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub name: String,
    pub data_type: String,
}

#[async_trait]
pub trait TableBackend: Send + Sync {
    /// Column names and types of `table`.
    async fn describe(&self, table: &str) -> Result<Vec<ColumnInfo>, TableError>;

    /// Validate `sql` without running it.
    async fn explain(&self, sql: &str) -> Result<(), TableError>;

    /// Run `sql` and return every row as a JSON object.
    async fn query(&self, sql: &str) -> Result<Vec<Row>, TableError>;
}

/// Render a schema as `name (type)` lines for prompts.
pub fn format_schema(table: &str, columns: &[ColumnInfo]) -> String {
    let mut out = format!("Table: {table}\nColumns:\n");
    for col in columns {
        out.push_str(&format!("- {} ({})\n", col.name, col.data_type));
    }
    out
}
