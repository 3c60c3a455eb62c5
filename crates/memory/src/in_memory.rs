//! In-memory conversation store, for tests and ephemeral CLI sessions.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use threadloom_core::error::PersistenceError;
use threadloom_core::{AgentRunLog, Assistant, AssistantId, ConversationStore, Session, SessionId, Turn};
use tokio::sync::RwLock;

#[derive(Default)]
struct State {
    sessions: HashMap<SessionId, Session>,
    assistants: HashMap<AssistantId, Assistant>,
    turns: HashMap<SessionId, Vec<Turn>>,
    run_logs: HashMap<SessionId, Vec<AgentRunLog>>,
}

/// A store that keeps everything in process memory.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    state: Arc<RwLock<State>>,
    saves: Arc<AtomicUsize>,
    title_writes: Arc<AtomicUsize>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_session(&self, session: Session) {
        self.state.write().await.sessions.insert(session.id.clone(), session);
    }

    pub async fn insert_assistant(&self, assistant: Assistant) {
        self.state
            .write()
            .await
            .assistants
            .insert(assistant.id.clone(), assistant);
    }

    /// Number of `save_turn` calls so far.
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    /// Number of titles actually written so far.
    pub fn title_write_count(&self) -> usize {
        self.title_writes.load(Ordering::SeqCst)
    }

    pub async fn turns(&self, session: &SessionId) -> Vec<Turn> {
        self.state
            .read()
            .await
            .turns
            .get(session)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn title(&self, session: &SessionId) -> Option<String> {
        self.state
            .read()
            .await
            .sessions
            .get(session)
            .and_then(|s| s.title.clone())
    }
}

#[async_trait]
impl ConversationStore for InMemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn get_session(&self, id: &SessionId) -> Result<Option<Session>, PersistenceError> {
        Ok(self.state.read().await.sessions.get(id).cloned())
    }

    async fn get_assistant(&self, id: &AssistantId) -> Result<Option<Assistant>, PersistenceError> {
        Ok(self.state.read().await.assistants.get(id).cloned())
    }

    async fn has_title(&self, id: &SessionId) -> Result<bool, PersistenceError> {
        Ok(self
            .state
            .read()
            .await
            .sessions
            .get(id)
            .is_some_and(|s| s.title.is_some()))
    }

    async fn set_title(&self, id: &SessionId, title: &str) -> Result<(), PersistenceError> {
        let mut state = self.state.write().await;
        let session = state
            .sessions
            .get_mut(id)
            .ok_or_else(|| PersistenceError::QueryFailed(format!("no session {id}")))?;
        if session.title.is_some() {
            return Ok(());
        }
        session.title = Some(title.to_string());
        self.title_writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn save_turn(&self, turn: &Turn) -> Result<(), PersistenceError> {
        self.saves.fetch_add(1, Ordering::SeqCst);
        self.state
            .write()
            .await
            .turns
            .entry(turn.session_id.clone())
            .or_default()
            .push(turn.clone());
        Ok(())
    }

    async fn recent_turns(&self, id: &SessionId, limit: usize) -> Result<Vec<Turn>, PersistenceError> {
        let state = self.state.read().await;
        let turns = state.turns.get(id).map(Vec::as_slice).unwrap_or_default();
        let skip = turns.len().saturating_sub(limit);
        Ok(turns[skip..].to_vec())
    }

    async fn append_run_log(&self, log: &AgentRunLog) -> Result<(), PersistenceError> {
        self.state
            .write()
            .await
            .run_logs
            .entry(log.session_id.clone())
            .or_default()
            .push(log.clone());
        Ok(())
    }

    async fn load_prior_run_log(&self, id: &SessionId) -> Result<Option<AgentRunLog>, PersistenceError> {
        let state = self.state.read().await;
        let logs = state.run_logs.get(id).cloned().unwrap_or_default();
        Ok(AgentRunLog::concat(id.clone(), logs))
    }
}
