//! Tabular question answering: route, generate SQL, validate, run, render.
//!
//! The reply is a table or bar chart block built from the query result,
//! or streamed text when the question does not fit the table or the result
//! is empty.

use async_trait::async_trait;
use std::sync::Arc;
use threadloom_core::oracle::{ModelSettings, Oracle, invoke_text, strip_code_fences};
use threadloom_core::error::OracleError;
use threadloom_core::table::format_schema;
use threadloom_core::{Message, ResponseChunk, Result, Row, SessionContext, StrategyKind, TableBackend, Turn};
use tracing::{info, warn};

use crate::strategy::{ChunkSender, Strategy, StrategyStream, chunk_channel, stream_oracle_text, summarize_with_oracle};

#[derive(Clone)]
struct Inner {
    oracle: Arc<dyn Oracle>,
    backend: Arc<dyn TableBackend>,
    table: String,
    settings: ModelSettings,
    data_description: String,
    examples: String,
    max_attempts: usize,
}

pub struct TabularStrategy {
    inner: Inner,
}

impl TabularStrategy {
    pub fn new(
        oracle: Arc<dyn Oracle>,
        backend: Arc<dyn TableBackend>,
        table: impl Into<String>,
        settings: ModelSettings,
    ) -> Self {
        Self {
            inner: Inner {
                oracle,
                backend,
                table: table.into(),
                settings,
                data_description: String::new(),
                examples: String::new(),
                max_attempts: 3,
            },
        }
    }

    /// Set the `data_description` and `examples` prompt fragments.
    pub fn with_prompts(mut self, data_description: impl Into<String>, examples: impl Into<String>) -> Self {
        self.inner.data_description = data_description.into();
        self.inner.examples = examples.into();
        self
    }

    pub fn with_max_attempts(mut self, attempts: usize) -> Self {
        self.inner.max_attempts = attempts.max(1);
        self
    }
}

/// Strip code fences and quotes, and drop anything after the first `;`.
pub fn clean_sql(raw: &str) -> String {
    let body = strip_code_fences(raw).trim_matches(|c| c == '"' || c == '\'' || c == '`');
    match body.find(';') {
        Some(idx) => body[..=idx].trim().to_string(),
        None => body.trim().to_string(),
    }
}

/// How a query result should be rendered.
#[derive(Debug, Clone, PartialEq)]
pub enum ChartKind {
    Table,
    Barchart { x_axis: String, y_axis: String },
}

/// A bar chart when the first row has a text column and a numeric column,
/// otherwise a table.
pub fn detect_chart(rows: &[Row]) -> ChartKind {
    let Some(first) = rows.first() else {
        return ChartKind::Table;
    };
    let x_axis = first.iter().find(|(_, v)| v.is_string()).map(|(k, _)| k.clone());
    let y_axis = first.iter().find(|(_, v)| v.is_number()).map(|(k, _)| k.clone());
    match (x_axis, y_axis) {
        (Some(x_axis), Some(y_axis)) => ChartKind::Barchart { x_axis, y_axis },
        _ => ChartKind::Table,
    }
}

impl Inner {
    async fn ask(&self, prompt: &str) -> std::result::Result<String, OracleError> {
        invoke_text(self.oracle.as_ref(), &self.settings, prompt).await
    }

    async fn stream_prompt(&self, prompt: String, tx: &ChunkSender) {
        stream_oracle_text(self.oracle.clone(), &self.settings, vec![Message::user(prompt)], tx).await;
    }

    async fn is_relevant(&self, schema: &str, query: &str) -> std::result::Result<bool, OracleError> {
        let prompt = format!(
            "{schema}\n\nQuestions that can be answered with SQL against this table are relevant. \
             Ignore dates; the data may be newer than your training data. If the question cannot \
             be turned into SQL or has nothing to do with the table, reply with just \"NO\".\n\n\
             Question:\n{query}"
        );
        let reply = self.ask(&prompt).await?;
        Ok(!reply.trim().eq_ignore_ascii_case("no"))
    }

    fn sql_prompt(&self, schema: &str, query: &str, errors: &[String]) -> String {
        let mut prompt = format!(
            "{schema}\n\nGiven the schema above for {table}, write one valid SQL SELECT query that \
             answers the user's question. Reply with the query only.\n",
            table = self.table
        );
        if !self.data_description.is_empty() {
            prompt.push_str(&format!("\nKeep the following in mind: {}\n", self.data_description));
        }
        if !self.examples.is_empty() {
            prompt.push_str(&format!("\nExamples of questions and valid queries:\n{}\n", self.examples));
        }
        if !errors.is_empty() {
            prompt.push_str("\nAvoid the following errors in your query:\n");
            for e in errors {
                prompt.push_str(&format!("- {e}\n"));
            }
        }
        prompt.push_str(&format!("\nUser Query: {query}\nSQL Query:"));
        prompt
    }

    /// Generate a query that passes `EXPLAIN`, feeding errors back each attempt.
    async fn generate_sql(&self, schema: &str, query: &str) -> Option<String> {
        let mut errors: Vec<String> = Vec::new();
        for attempt in 1..=self.max_attempts {
            let sql = match self.ask(&self.sql_prompt(schema, query, &errors)).await {
                Ok(raw) => clean_sql(&raw),
                Err(e) => {
                    warn!(attempt, error = %e, "SQL generation failed");
                    errors.push(e.to_string());
                    continue;
                }
            };
            info!(attempt, sql = %sql, "Generated SQL");
            match self.backend.explain(&sql).await {
                Ok(()) => return Some(sql),
                Err(e) => {
                    warn!(attempt, error = %e, "SQL validation failed");
                    errors.push(e.to_string());
                }
            }
        }
        None
    }

    async fn describe_rows(&self, rows: &[Row]) -> (String, String) {
        let sample = serde_json::to_string(&rows.iter().take(20).collect::<Vec<_>>()).unwrap_or_default();
        let title = self
            .ask(&format!(
                "Given the following SQL query results\n{sample}\ncreate a 1-3 word title for a chart \
                 that would best represent the data. Return only the title."
            ))
            .await
            .map(|t| t.trim().to_string())
            .unwrap_or_else(|_| self.table.clone());
        let description = self
            .ask(&format!(
                "Given the following SQL query results\n{sample}\ncreate a 1 sentence description of \
                 the data. Return only the sentence."
            ))
            .await
            .map(|d| d.trim().to_string())
            .unwrap_or_default();
        (title, description)
    }

    async fn explain_query(&self, sql: &str) -> String {
        let description = self
            .ask(&format!(
                "Provide a concise description of the following SQL query:\n\nSQL Query: {sql}\n\nDescription:"
            ))
            .await
            .unwrap_or_default();
        format!("{}\n\n```sql\n{sql}\n```", description.trim()).trim().to_string()
    }

    async fn run(&self, query: String, tx: ChunkSender) {
        let columns = match self.backend.describe(&self.table).await {
            Ok(columns) => columns,
            Err(e) => {
                let _ = tx.send(Ok(ResponseChunk::error(format!("Could not read table schema: {e}")))).await;
                return;
            }
        };
        let schema = format_schema(&self.table, &columns);

        match self.is_relevant(&schema, &query).await {
            Ok(true) => {}
            Ok(false) => {
                info!(table = %self.table, "Question is not relevant to the table");
                self.stream_prompt(
                    format!(
                        "{query}\n\nThis question is not relevant to the {table} table. Briefly explain \
                         why, and reassure the user that it is not their fault.",
                        table = self.table
                    ),
                    &tx,
                )
                .await;
                return;
            }
            Err(e) => {
                let _ = tx.send(Ok(ResponseChunk::error(e.to_string()))).await;
                return;
            }
        }

        let Some(sql) = self.generate_sql(&schema, &query).await else {
            let _ = tx
                .send(Ok(ResponseChunk::error(format!(
                    "Could not generate a valid SQL query after {} attempts.",
                    self.max_attempts
                ))))
                .await;
            return;
        };

        let rows = match self.backend.query(&sql).await {
            Ok(rows) => rows,
            Err(e) => {
                let _ = tx.send(Ok(ResponseChunk::error(format!("Error executing SQL query: {e}")))).await;
                return;
            }
        };

        if rows.is_empty() {
            self.stream_prompt(
                format!(
                    "The user asked: \"{query}\"\nThe generated SQL query was: \"{sql}\"\nThe query \
                     returned no results.\n\nBriefly explain why the query might have returned no \
                     results. Be conservative in your reasoning. Only give the explanation."
                ),
                &tx,
            )
            .await;
            return;
        }

        let _ = tx
            .send(Ok(ResponseChunk::status(format!("Query returned {} rows", rows.len()))))
            .await;

        let (title, description) = self.describe_rows(&rows).await;
        let chunk = match detect_chart(&rows) {
            ChartKind::Barchart { x_axis, y_axis } => ResponseChunk::Barchart {
                explanation: self.explain_query(&sql).await,
                rows,
                title,
                description,
                x_axis,
                y_axis,
            },
            ChartKind::Table => ResponseChunk::Table {
                rows,
                title,
                description,
            },
        };
        let _ = tx.send(Ok(chunk)).await;
    }
}

#[async_trait]
impl Strategy for TabularStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Tabular
    }

    async fn respond(&self, turn: &Turn, _ctx: &SessionContext) -> Result<StrategyStream> {
        let (tx, stream) = chunk_channel();
        let inner = self.inner.clone();
        let query = turn.user_content.clone();
        tokio::spawn(async move { inner.run(query, tx).await });
        Ok(stream)
    }

    async fn summarize(&self, turn: &Turn) -> Result<String> {
        summarize_with_oracle(self.inner.oracle.as_ref(), &self.inner.settings, turn).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::*;
    use serde_json::json;
    use threadloom_memory::SqliteTableBackend;

    async fn sales() -> Arc<SqliteTableBackend> {
        let backend = SqliteTableBackend::connect("sqlite::memory:").await.unwrap();
        sqlx_exec(&backend, "CREATE TABLE sales (city TEXT, amount INTEGER)").await;
        sqlx_exec(&backend, "INSERT INTO sales VALUES ('Oslo', 12), ('Lima', 7)").await;
        Arc::new(backend)
    }

    async fn sqlx_exec(backend: &SqliteTableBackend, sql: &str) {
        sqlx::query(sql).execute(backend.pool()).await.unwrap();
    }

    fn strategy(oracle: Arc<ScriptedOracle>, backend: Arc<SqliteTableBackend>) -> TabularStrategy {
        TabularStrategy::new(oracle, backend, "sales", ModelSettings::new("m"))
    }

    async fn respond(strategy: &TabularStrategy, q: &str) -> Vec<ResponseChunk> {
        collect_chunks(strategy.respond(&turn_fixture(q), &context_fixture()).await.unwrap()).await
    }

    #[test]
    fn sql_is_cleaned() {
        assert_eq!(clean_sql("```sql\nSELECT 1;\n```"), "SELECT 1;");
        assert_eq!(clean_sql("\"SELECT city FROM sales; -- done\""), "SELECT city FROM sales;");
        assert_eq!(clean_sql("  SELECT 2  "), "SELECT 2");
    }

    #[test]
    fn chart_detection_uses_first_row() {
        let row = |v: serde_json::Value| v.as_object().unwrap().clone();
        assert_eq!(
            detect_chart(&[row(json!({"city": "Oslo", "n": 3, "m": 4}))]),
            ChartKind::Barchart {
                x_axis: "city".into(),
                y_axis: "n".into()
            }
        );
        assert_eq!(detect_chart(&[row(json!({"a": 1, "b": 2}))]), ChartKind::Table);
        assert_eq!(detect_chart(&[]), ChartKind::Table);
    }

    #[tokio::test]
    async fn string_and_number_columns_make_a_barchart() {
        let oracle = Arc::new(
            ScriptedOracle::new()
                .reply("YES")
                .reply("```sql\nSELECT city, amount FROM sales ORDER BY amount DESC;\n```")
                .reply("Sales by city")
                .reply("Total sales per city.")
                .reply("Lists cities by sales."),
        );
        let chunks = respond(&strategy(oracle, sales().await), "sales per city?").await;

        assert_eq!(chunks[0], ResponseChunk::status("Query returned 2 rows"));
        match &chunks[1] {
            ResponseChunk::Barchart {
                rows,
                title,
                x_axis,
                y_axis,
                explanation,
                ..
            } => {
                assert_eq!(rows.len(), 2);
                assert_eq!(rows[0]["city"], "Oslo");
                assert_eq!(title, "Sales by city");
                assert_eq!((x_axis.as_str(), y_axis.as_str()), ("city", "amount"));
                assert!(explanation.starts_with("Lists cities by sales."));
                assert!(explanation.contains("```sql\nSELECT city, amount FROM sales ORDER BY amount DESC;\n```"));
            }
            other => panic!("expected barchart, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn numeric_only_result_is_a_table() {
        let oracle = Arc::new(
            ScriptedOracle::new()
                .reply("yes")
                .reply("SELECT SUM(amount) AS total FROM sales")
                .reply("Total")
                .reply("Sum of all sales."),
        );
        let chunks = respond(&strategy(oracle, sales().await), "total sales?").await;
        match &chunks[1] {
            ResponseChunk::Table { rows, title, .. } => {
                assert_eq!(rows[0]["total"], 19);
                assert_eq!(title, "Total");
            }
            other => panic!("expected table, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn irrelevant_question_streams_explanation() {
        let oracle = Arc::new(
            ScriptedOracle::new()
                .reply(" No ")
                .stream(ScriptedStream::fragments(&["That is about weather."])),
        );
        let chunks = respond(&strategy(oracle.clone(), sales().await), "will it rain?").await;
        assert_eq!(text_of(&chunks), "That is about weather.");
        assert_eq!(oracle.complete_count(), 1);
    }

    #[tokio::test]
    async fn invalid_queries_are_retried_with_errors() {
        let oracle = Arc::new(
            ScriptedOracle::new()
                .reply("yes")
                .reply("SELECT nope FROM sales")
                .reply("SELECT city, amount FROM sales")
                .reply("t")
                .reply("d")
                .reply("e"),
        );
        let chunks = respond(&strategy(oracle.clone(), sales().await), "q").await;
        assert!(matches!(chunks[1], ResponseChunk::Barchart { .. }));
        let second_attempt = &oracle.prompts()[2];
        assert!(second_attempt.contains("Avoid the following errors"));
        assert!(second_attempt.contains("nope"));
    }

    #[tokio::test]
    async fn attempts_run_out() {
        let oracle = Arc::new(
            ScriptedOracle::new()
                .reply("yes")
                .reply("DELETE FROM sales")
                .reply("SELECT nope FROM sales"),
        );
        let strategy = strategy(oracle.clone(), sales().await).with_max_attempts(2);
        let chunks = respond(&strategy, "q").await;
        assert_eq!(
            chunks,
            vec![ResponseChunk::error("Could not generate a valid SQL query after 2 attempts.")]
        );
        assert_eq!(oracle.complete_count(), 3);
    }

    #[tokio::test]
    async fn empty_result_streams_explanation() {
        let oracle = Arc::new(
            ScriptedOracle::new()
                .reply("yes")
                .reply("SELECT city FROM sales WHERE amount > 100")
                .stream(ScriptedStream::fragments(&["No city sold that much."])),
        );
        let chunks = respond(&strategy(oracle, sales().await), "q").await;
        assert_eq!(chunks, vec![ResponseChunk::text("No city sold that much.")]);
    }

    #[tokio::test]
    async fn missing_table_is_an_error_chunk() {
        let oracle = Arc::new(ScriptedOracle::new());
        let backend = Arc::new(SqliteTableBackend::connect("sqlite::memory:").await.unwrap());
        let chunks = respond(&strategy(oracle, backend), "q").await;
        assert!(matches!(&chunks[0], ResponseChunk::Error { message } if message.contains("schema")));
    }
}
