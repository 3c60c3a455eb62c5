//! Retrieval-augmented completion: embed the question, pull the closest
//! knowledge-base chunks, and answer with them as context.

use async_trait::async_trait;
use std::sync::Arc;
use threadloom_core::error::RetrievalError;
use threadloom_core::oracle::{EmbeddingRequest, ModelSettings, Oracle};
use threadloom_core::{
    ConversationStore, KnowledgeBaseId, Message, Result, Retriever, SessionContext, StrategyKind, Turn,
};
use tracing::{info, warn};

use crate::direct::load_history;
use crate::strategy::{Strategy, StrategyStream, chunk_channel, format_history, stream_oracle_text, summarize_with_oracle};

pub struct RetrievalStrategy {
    oracle: Arc<dyn Oracle>,
    store: Arc<dyn ConversationStore>,
    retriever: Arc<dyn Retriever>,
    knowledge_base: KnowledgeBaseId,
    settings: ModelSettings,
    embedding_model: String,
    top_k: usize,
    system_prompt: String,
    history_limit: usize,
}

impl RetrievalStrategy {
    pub fn new(
        oracle: Arc<dyn Oracle>,
        store: Arc<dyn ConversationStore>,
        retriever: Arc<dyn Retriever>,
        knowledge_base: KnowledgeBaseId,
        settings: ModelSettings,
    ) -> Self {
        Self {
            oracle,
            store,
            retriever,
            knowledge_base,
            settings,
            embedding_model: "text-embedding-3-small".into(),
            top_k: 5,
            system_prompt: String::new(),
            history_limit: 10,
        }
    }

    pub fn with_embedding_model(mut self, model: impl Into<String>) -> Self {
        self.embedding_model = model.into();
        self
    }

    pub fn with_top_k(mut self, k: usize) -> Self {
        self.top_k = k;
        self
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

/// Embed `query` and return the matching chunk texts joined by blank lines.
async fn retrieve_context(
    oracle: &dyn Oracle,
    retriever: &dyn Retriever,
    kb: &KnowledgeBaseId,
    embedding_model: &str,
    query: &str,
    k: usize,
) -> std::result::Result<String, RetrievalError> {
    let response = oracle
        .embed(EmbeddingRequest {
            model: embedding_model.to_string(),
            inputs: vec![query.to_string()],
        })
        .await
        .map_err(|e| RetrievalError::SearchFailed(format!("embedding failed: {e}")))?;
    let embedding = response
        .embeddings
        .into_iter()
        .next()
        .ok_or_else(|| RetrievalError::SearchFailed("no embedding returned".into()))?;

    let chunks = retriever.search(kb, &embedding, k).await?;
    info!(kb = %kb, chunks = chunks.len(), "Retrieved knowledge-base context");
    Ok(chunks
        .into_iter()
        .map(|c| c.content)
        .collect::<Vec<_>>()
        .join("\n\n"))
}

fn build_prompt(system: &str, history: &[Turn], context: &str, query: &str) -> String {
    format!(
        "System: {system}\n\n\
         Chat History:\n{}\n\n\
         Relevant Context:\n{context}\n\n\
         User Query: {query}\n\n\
         Instructions:\n\
         1. Answer the query using the relevant context where it applies.\n\
         2. Keep continuity with the conversation so far and follow the system prompt.\n\
         3. If the context does not fully answer the query, say so and give the best answer you can.\n\
         4. Be concise.",
        format_history(history)
    )
}

#[async_trait]
impl Strategy for RetrievalStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Retrieval
    }

    async fn respond(&self, turn: &Turn, ctx: &SessionContext) -> Result<StrategyStream> {
        let (tx, stream) = chunk_channel();
        let oracle = self.oracle.clone();
        let store = self.store.clone();
        let retriever = self.retriever.clone();
        let kb = self.knowledge_base.clone();
        let settings = self.settings.clone();
        let embedding_model = self.embedding_model.clone();
        let top_k = self.top_k;
        let system = self.system_prompt.clone();
        let limit = self.history_limit;
        let session_id = ctx.session_id.clone();
        let query = turn.user_content.clone();

        tokio::spawn(async move {
            let context = retrieve_context(oracle.as_ref(), retriever.as_ref(), &kb, &embedding_model, &query, top_k)
                .await
                .unwrap_or_else(|e| {
                    warn!(kb = %kb, error = %e, "Retrieval failed, answering without context");
                    String::new()
                });
            let history = load_history(store.as_ref(), &session_id, limit).await;
            let prompt = build_prompt(&system, &history, &context, &query);
            stream_oracle_text(oracle, &settings, vec![Message::user(prompt)], &tx).await;
        });
        Ok(stream)
    }

    async fn summarize(&self, turn: &Turn) -> Result<String> {
        summarize_with_oracle(self.oracle.as_ref(), &self.settings, turn).await
    }
}
