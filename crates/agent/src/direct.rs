//! Direct completion: system prompt, recent history and the user message,
//! streamed straight from the oracle.

use async_trait::async_trait;
use std::sync::Arc;
use threadloom_core::oracle::{ModelSettings, Oracle};
use threadloom_core::{ConversationStore, Message, Result, SessionContext, SessionId, StrategyKind, Turn};
use tracing::{debug, warn};

use crate::strategy::{Strategy, StrategyStream, chunk_channel, format_history, stream_oracle_text, summarize_with_oracle};

pub struct DirectStrategy {
    oracle: Arc<dyn Oracle>,
    store: Arc<dyn ConversationStore>,
    settings: ModelSettings,
    system_prompt: String,
    history_limit: usize,
}

impl DirectStrategy {
    pub fn new(oracle: Arc<dyn Oracle>, store: Arc<dyn ConversationStore>, settings: ModelSettings) -> Self {
        Self {
            oracle,
            store,
            settings,
            system_prompt: String::new(),
            history_limit: 10,
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit;
        self
    }
}

/// Recent turns of a session, or none if the store fails.
pub(crate) async fn load_history(store: &dyn ConversationStore, session_id: &SessionId, limit: usize) -> Vec<Turn> {
    if limit == 0 {
        return Vec::new();
    }
    match store.recent_turns(session_id, limit).await {
        Ok(turns) => {
            debug!(session_id = %session_id, turns = turns.len(), "Loaded chat history");
            turns
        }
        Err(e) => {
            warn!(session_id = %session_id, error = %e, "Could not load chat history");
            Vec::new()
        }
    }
}

fn build_prompt(system: &str, history: &[Turn], query: &str) -> String {
    let mut prompt = String::new();
    if !system.is_empty() {
        prompt.push_str(system);
        prompt.push_str("\n\n");
    }
    if !history.is_empty() {
        prompt.push_str("Below is the history of your previous interaction with the user:\n");
        prompt.push_str(&format_history(history));
        prompt.push_str("\n\n");
    }
    prompt.push_str(&format!("User Query: {query}"));
    prompt
}

#[async_trait]
impl Strategy for DirectStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Direct
    }

    async fn respond(&self, turn: &Turn, ctx: &SessionContext) -> Result<StrategyStream> {
        let (tx, stream) = chunk_channel();
        let oracle = self.oracle.clone();
        let store = self.store.clone();
        let settings = self.settings.clone();
        let system = self.system_prompt.clone();
        let limit = self.history_limit;
        let session_id = ctx.session_id.clone();
        let query = turn.user_content.clone();

        tokio::spawn(async move {
            let history = load_history(store.as_ref(), &session_id, limit).await;
            let prompt = build_prompt(&system, &history, &query);
            stream_oracle_text(oracle, &settings, vec![Message::user(prompt)], &tx).await;
        });
        Ok(stream)
    }

    async fn summarize(&self, turn: &Turn) -> Result<String> {
        summarize_with_oracle(self.oracle.as_ref(), &self.settings, turn).await
    }
}
