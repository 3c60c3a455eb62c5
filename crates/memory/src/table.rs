//! SQLite table backend for the tabular strategy.
//!
//! Schema comes from `pragma_table_info`, validation from `EXPLAIN`, and
//! result rows are decoded into JSON objects column by column.

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Column, Row, SqlitePool, ValueRef};
use std::str::FromStr;
use threadloom_core::chunk::Row as JsonRow;
use threadloom_core::error::TableError;
use threadloom_core::{ColumnInfo, TableBackend};
use tracing::debug;

pub struct SqliteTableBackend {
    pool: SqlitePool,
}

impl SqliteTableBackend {
    pub async fn connect(url: &str) -> Result<Self, TableError> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(|e| TableError::Unavailable(format!("Invalid SQLite url: {e}")))?
            .read_only(!url.contains(":memory:"));
        let pool = SqlitePoolOptions::new()
            .max_connections(if url.contains(":memory:") { 1 } else { 4 })
            .connect_with(options)
            .await
            .map_err(|e| TableError::Unavailable(e.to_string()))?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

/// Only single read statements may reach the database. Returns the
/// statement without its trailing semicolon.
fn ensure_read_only(sql: &str) -> Result<&str, TableError> {
    let trimmed = sql.trim().trim_end_matches(';').trim_end();
    let first = trimmed
        .split_whitespace()
        .next()
        .unwrap_or_default()
        .to_ascii_uppercase();
    if !matches!(first.as_str(), "SELECT" | "WITH") {
        return Err(TableError::InvalidQuery(format!(
            "only SELECT statements are allowed, got '{first}'"
        )));
    }
    if trimmed.contains(';') {
        return Err(TableError::InvalidQuery("multiple statements are not allowed".into()));
    }
    Ok(trimmed)
}

fn decode_row(row: &SqliteRow) -> JsonRow {
    let mut out = JsonRow::new();
    for (i, column) in row.columns().iter().enumerate() {
        let is_null = row.try_get_raw(i).map(|v| v.is_null()).unwrap_or(true);
        let value = if is_null {
            serde_json::Value::Null
        } else if let Ok(v) = row.try_get::<i64, _>(i) {
            v.into()
        } else if let Ok(v) = row.try_get::<f64, _>(i) {
            v.into()
        } else if let Ok(v) = row.try_get::<String, _>(i) {
            v.into()
        } else if let Ok(v) = row.try_get::<Vec<u8>, _>(i) {
            format!("<{} bytes>", v.len()).into()
        } else {
            serde_json::Value::Null
        };
        out.insert(column.name().to_string(), value);
    }
    out
}

#[async_trait]
impl TableBackend for SqliteTableBackend {
    async fn describe(&self, table: &str) -> Result<Vec<ColumnInfo>, TableError> {
        let rows = sqlx::query("SELECT name, type FROM pragma_table_info(?1)")
            .bind(table)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| TableError::ExecutionFailed(e.to_string()))?;
        if rows.is_empty() {
            return Err(TableError::NotFound(table.to_string()));
        }
        rows.iter()
            .map(|row| {
                Ok(ColumnInfo {
                    name: row.try_get("name").map_err(|e| TableError::ExecutionFailed(e.to_string()))?,
                    data_type: row.try_get("type").map_err(|e| TableError::ExecutionFailed(e.to_string()))?,
                })
            })
            .collect()
    }

    async fn explain(&self, sql: &str) -> Result<(), TableError> {
        let sql = ensure_read_only(sql)?;
        sqlx::query(&format!("EXPLAIN {sql}"))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| TableError::InvalidQuery(e.to_string()))?;
        Ok(())
    }

    async fn query(&self, sql: &str) -> Result<Vec<JsonRow>, TableError> {
        let sql = ensure_read_only(sql)?;
        let rows = sqlx::query(sql)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| TableError::ExecutionFailed(e.to_string()))?;
        debug!(rows = rows.len(), "Table query executed");
        Ok(rows.iter().map(decode_row).collect())
    }
}
