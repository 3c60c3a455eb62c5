//! Retriever trait: ranked knowledge-base search by embedding.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::RetrievalError;
use crate::ids::KnowledgeBaseId;

/// One retrieved passage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievedChunk {
    pub id: String,
    pub content: String,
    /// Similarity to the query (cosine, higher is closer).
    #[serde(default)]
    pub score: f32,
}

#[async_trait]
pub trait Retriever: Send + Sync {
    /// Return up to `k` chunks of `kb`, best first.
    async fn search(
        &self,
        kb: &KnowledgeBaseId,
        query_embedding: &[f32],
        k: usize,
    ) -> Result<Vec<RetrievedChunk>, RetrievalError>;
}
