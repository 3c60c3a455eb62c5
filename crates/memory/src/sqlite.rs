//! SQLite conversation store.
//!
//! One database file with four tables:
//! - `assistants`: assistant definitions, stored as JSON
//! - `sessions`: owner, assistant and title per session
//! - `turns`: finished turns with their blocks as JSON
//! - `run_logs`: agent run transcripts, appended once per turn

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use threadloom_core::error::PersistenceError;
use threadloom_core::{AgentRunLog, Assistant, AssistantId, ConversationStore, Session, SessionId, Turn};
use tracing::{debug, info};

pub struct SqliteStore {
    pool: SqlitePool,
}

fn storage(context: &str) -> impl Fn(sqlx::Error) -> PersistenceError + '_ {
    move |e| PersistenceError::QueryFailed(format!("{context}: {e}"))
}

fn parse_time(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

impl SqliteStore {
    /// Open (or create) the database at `path`.
    ///
    /// Pass `":memory:"` for an in-process ephemeral database (useful for tests).
    pub async fn new(path: &str) -> Result<Self, PersistenceError> {
        let options = SqliteConnectOptions::from_str(path)
            .map_err(|e| PersistenceError::Storage(format!("Invalid SQLite path: {e}")))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal);

        // A private in-memory database only exists on its own connection
        let max_connections = if path.contains(":memory:") { 1 } else { 4 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .map_err(|e| PersistenceError::Storage(format!("Failed to open SQLite: {e}")))?;

        let store = Self { pool };
        store.run_migrations().await?;
        info!("SQLite conversation store initialized at {path}");
        Ok(store)
    }

    /// Create from an existing pool (useful for testing).
    pub async fn from_pool(pool: SqlitePool) -> Result<Self, PersistenceError> {
        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    async fn run_migrations(&self) -> Result<(), PersistenceError> {
        let statements = [
            (
                "assistants table",
                r#"
                CREATE TABLE IF NOT EXISTS assistants (
                    id    TEXT PRIMARY KEY,
                    body  TEXT NOT NULL
                )
                "#,
            ),
            (
                "sessions table",
                r#"
                CREATE TABLE IF NOT EXISTS sessions (
                    id            TEXT PRIMARY KEY,
                    user_id       TEXT NOT NULL,
                    account_id    TEXT NOT NULL,
                    assistant_id  TEXT NOT NULL,
                    title         TEXT,
                    created_at    TEXT NOT NULL
                )
                "#,
            ),
            (
                "turns table",
                r#"
                CREATE TABLE IF NOT EXISTS turns (
                    iid           INTEGER PRIMARY KEY AUTOINCREMENT,
                    id            TEXT UNIQUE NOT NULL,
                    session_id    TEXT NOT NULL,
                    user_id       TEXT NOT NULL,
                    account_id    TEXT NOT NULL,
                    assistant_id  TEXT NOT NULL,
                    user_content  TEXT NOT NULL,
                    ai_content    TEXT NOT NULL,
                    blocks        TEXT NOT NULL DEFAULT '[]',
                    created_at    TEXT NOT NULL
                )
                "#,
            ),
            (
                "run_logs table",
                r#"
                CREATE TABLE IF NOT EXISTS run_logs (
                    iid         INTEGER PRIMARY KEY AUTOINCREMENT,
                    session_id  TEXT NOT NULL,
                    entries     TEXT NOT NULL,
                    created_at  TEXT NOT NULL
                )
                "#,
            ),
            (
                "turns index",
                "CREATE INDEX IF NOT EXISTS idx_turns_session ON turns(session_id, iid)",
            ),
            (
                "run_logs index",
                "CREATE INDEX IF NOT EXISTS idx_run_logs_session ON run_logs(session_id, iid)",
            ),
        ];

        for (what, sql) in statements {
            sqlx::query(sql)
                .execute(&self.pool)
                .await
                .map_err(|e| PersistenceError::MigrationFailed(format!("{what}: {e}")))?;
        }

        debug!("SQLite migrations complete");
        Ok(())
    }

    pub async fn insert_assistant(&self, assistant: &Assistant) -> Result<(), PersistenceError> {
        let body = serde_json::to_string(assistant).map_err(|e| PersistenceError::Storage(e.to_string()))?;
        sqlx::query("INSERT INTO assistants (id, body) VALUES (?1, ?2) ON CONFLICT(id) DO UPDATE SET body = excluded.body")
            .bind(assistant.id.as_str())
            .bind(body)
            .execute(&self.pool)
            .await
            .map_err(storage("insert assistant"))?;
        Ok(())
    }

    pub async fn insert_session(&self, session: &Session) -> Result<(), PersistenceError> {
        sqlx::query(
            "INSERT INTO sessions (id, user_id, account_id, assistant_id, title, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )
        .bind(session.id.as_str())
        .bind(session.user_id.as_str())
        .bind(session.account_id.as_str())
        .bind(session.assistant_id.as_str())
        .bind(session.title.as_deref())
        .bind(session.created_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(storage("insert session"))?;
        Ok(())
    }

    fn row_to_turn(row: &SqliteRow) -> Result<Turn, PersistenceError> {
        let get = |col: &str| -> Result<String, PersistenceError> {
            row.try_get::<String, _>(col)
                .map_err(|e| PersistenceError::QueryFailed(format!("{col} column: {e}")))
        };
        let blocks = serde_json::from_str(&get("blocks")?)
            .map_err(|e| PersistenceError::QueryFailed(format!("blocks column: {e}")))?;

        Ok(Turn {
            id: get("id")?.into(),
            session_id: get("session_id")?.into(),
            user_id: get("user_id")?.into(),
            account_id: get("account_id")?.into(),
            assistant_id: get("assistant_id")?.into(),
            user_content: get("user_content")?,
            ai_content: get("ai_content")?,
            blocks,
            created_at: parse_time(&get("created_at")?),
        })
    }
}

#[async_trait]
impl ConversationStore for SqliteStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn get_session(&self, id: &SessionId) -> Result<Option<Session>, PersistenceError> {
        let row = sqlx::query("SELECT id, user_id, account_id, assistant_id, title, created_at FROM sessions WHERE id = ?1")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(storage("get session"))?;

        row.map(|row| -> Result<Session, sqlx::Error> {
            Ok(Session {
                id: row.try_get::<String, _>("id")?.into(),
                user_id: row.try_get::<String, _>("user_id")?.into(),
                account_id: row.try_get::<String, _>("account_id")?.into(),
                assistant_id: row.try_get::<String, _>("assistant_id")?.into(),
                title: row.try_get("title")?,
                created_at: parse_time(&row.try_get::<String, _>("created_at")?),
            })
        })
        .transpose()
        .map_err(storage("session row"))
    }

    async fn get_assistant(&self, id: &AssistantId) -> Result<Option<Assistant>, PersistenceError> {
        let body: Option<String> = sqlx::query_scalar("SELECT body FROM assistants WHERE id = ?1")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(storage("get assistant"))?;

        body.map(|b| serde_json::from_str(&b))
            .transpose()
            .map_err(|e| PersistenceError::QueryFailed(format!("assistant body: {e}")))
    }

    async fn has_title(&self, id: &SessionId) -> Result<bool, PersistenceError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sessions WHERE id = ?1 AND title IS NOT NULL")
            .bind(id.as_str())
            .fetch_one(&self.pool)
            .await
            .map_err(storage("has title"))?;
        Ok(count > 0)
    }

    async fn set_title(&self, id: &SessionId, title: &str) -> Result<(), PersistenceError> {
        let result = sqlx::query("UPDATE sessions SET title = ?1 WHERE id = ?2 AND title IS NULL")
            .bind(title)
            .bind(id.as_str())
            .execute(&self.pool)
            .await
            .map_err(storage("set title"))?;
        if result.rows_affected() == 0 && self.get_session(id).await?.is_none() {
            return Err(PersistenceError::QueryFailed(format!("no session {id}")));
        }
        Ok(())
    }

    async fn save_turn(&self, turn: &Turn) -> Result<(), PersistenceError> {
        let blocks = serde_json::to_string(&turn.blocks).map_err(|e| PersistenceError::Storage(e.to_string()))?;
        sqlx::query(
            r#"
            INSERT INTO turns (id, session_id, user_id, account_id, assistant_id, user_content, ai_content, blocks, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
        )
        .bind(turn.id.as_str())
        .bind(turn.session_id.as_str())
        .bind(turn.user_id.as_str())
        .bind(turn.account_id.as_str())
        .bind(turn.assistant_id.as_str())
        .bind(&turn.user_content)
        .bind(&turn.ai_content)
        .bind(blocks)
        .bind(turn.created_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(storage("save turn"))?;

        debug!(turn_id = %turn.id, session_id = %turn.session_id, "Turn saved");
        Ok(())
    }

    async fn recent_turns(&self, id: &SessionId, limit: usize) -> Result<Vec<Turn>, PersistenceError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM (
                SELECT * FROM turns WHERE session_id = ?1 ORDER BY iid DESC LIMIT ?2
            ) ORDER BY iid ASC
            "#,
        )
        .bind(id.as_str())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(storage("recent turns"))?;

        rows.iter().map(Self::row_to_turn).collect()
    }

    async fn append_run_log(&self, log: &AgentRunLog) -> Result<(), PersistenceError> {
        let entries = serde_json::to_string(&log.entries).map_err(|e| PersistenceError::Storage(e.to_string()))?;
        sqlx::query("INSERT INTO run_logs (session_id, entries, created_at) VALUES (?1, ?2, ?3)")
            .bind(log.session_id.as_str())
            .bind(entries)
            .bind(log.created_at.to_rfc3339())
            .execute(&self.pool)
            .await
            .map_err(storage("append run log"))?;
        Ok(())
    }

    async fn load_prior_run_log(&self, id: &SessionId) -> Result<Option<AgentRunLog>, PersistenceError> {
        let rows = sqlx::query("SELECT entries, created_at FROM run_logs WHERE session_id = ?1 ORDER BY iid ASC")
            .bind(id.as_str())
            .fetch_all(&self.pool)
            .await
            .map_err(storage("load run logs"))?;

        let mut logs = Vec::with_capacity(rows.len());
        for row in rows {
            let raw: String = row.try_get("entries").map_err(storage("entries column"))?;
            let created: String = row.try_get("created_at").map_err(storage("created_at column"))?;
            let entries = serde_json::from_str(&raw)
                .map_err(|e| PersistenceError::QueryFailed(format!("run log entries: {e}")))?;
            logs.push(AgentRunLog {
                session_id: id.clone(),
                entries,
                created_at: parse_time(&created),
            });
        }
        Ok(AgentRunLog::concat(id.clone(), logs))
    }
}
