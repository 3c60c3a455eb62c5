//! ConversationStore trait: durable sessions, turns, titles, and run logs.
//!
//! Implementations: in-memory (for tests and the CLI) and SQLite.

use async_trait::async_trait;

use crate::assistant::Assistant;
use crate::error::PersistenceError;
use crate::ids::{AssistantId, SessionId};
use crate::session::{AgentRunLog, Session};
use crate::turn::Turn;

/// Persistence collaborator used by the orchestrator and the strategies.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// The backend name (e.g., "memory", "sqlite").
    fn name(&self) -> &str;

    async fn get_session(&self, id: &SessionId) -> Result<Option<Session>, PersistenceError>;

    async fn get_assistant(&self, id: &AssistantId) -> Result<Option<Assistant>, PersistenceError>;

    async fn has_title(&self, id: &SessionId) -> Result<bool, PersistenceError>;

    /// Set the session title unless it already has one. An existing title
    /// is kept and the call still succeeds.
    async fn set_title(&self, id: &SessionId, title: &str) -> Result<(), PersistenceError>;

    /// Persist a finished turn.
    async fn save_turn(&self, turn: &Turn) -> Result<(), PersistenceError>;

    /// The most recent `limit` turns of a session, oldest first.
    async fn recent_turns(&self, id: &SessionId, limit: usize) -> Result<Vec<Turn>, PersistenceError>;

    async fn append_run_log(&self, log: &AgentRunLog) -> Result<(), PersistenceError>;

    /// Every prior run log of the session concatenated in order, or `None`
    /// when the session has none.
    async fn load_prior_run_log(&self, id: &SessionId) -> Result<Option<AgentRunLog>, PersistenceError>;
}
