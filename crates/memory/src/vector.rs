//! Vector similarity search with maximal-marginal-relevance selection.
//!
//! Pure-Rust implementations of:
//! - Cosine similarity
//! - MMR selection over a candidate pool
//! - [`VectorIndex`], an in-memory [`Retriever`] over embedded chunks

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use threadloom_core::error::RetrievalError;
use threadloom_core::{KnowledgeBaseId, RetrievedChunk, Retriever};
use tokio::sync::RwLock;
use tracing::debug;

/// Compute cosine similarity between two vectors.
///
/// Returns a value in [-1, 1] where 1 = identical, 0 = orthogonal, -1 = opposite.
/// Returns 0.0 if either vector is zero-length or empty.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let (mut dot, mut norm_a, mut norm_b) = (0.0f64, 0.0f64, 0.0f64);
    for (x, y) in a.iter().zip(b) {
        let (x, y) = (*x as f64, *y as f64);
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < 1e-10 {
        return 0.0;
    }
    (dot / denom) as f32
}

/// Pick `k` candidate indices by maximal marginal relevance.
///
/// The first pick is the candidate closest to the query. Each later pick
/// maximizes `lambda * sim(query, c) - (1 - lambda) * max sim(c, picked)`.
/// Indices come back in selection order.
pub fn mmr_select(query: &[f32], candidates: &[&[f32]], k: usize, lambda: f32) -> Vec<usize> {
    if candidates.is_empty() || k == 0 {
        return Vec::new();
    }

    let to_query: Vec<f32> = candidates.iter().map(|c| cosine_similarity(query, c)).collect();
    let mut remaining: Vec<usize> = (0..candidates.len()).collect();
    let mut selected: Vec<usize> = Vec::with_capacity(k.min(candidates.len()));

    while selected.len() < k && !remaining.is_empty() {
        let score = |i: usize| -> f32 {
            if selected.is_empty() {
                return to_query[i];
            }
            let redundancy = selected
                .iter()
                .map(|&j| cosine_similarity(candidates[i], candidates[j]))
                .fold(f32::MIN, f32::max);
            lambda * to_query[i] - (1.0 - lambda) * redundancy
        };

        let (pos, _) = remaining
            .iter()
            .enumerate()
            .map(|(pos, &i)| (pos, score(i)))
            .fold((0, f32::MIN), |best, cur| if cur.1 > best.1 { cur } else { best });
        selected.push(remaining.remove(pos));
    }
    selected
}

#[derive(Debug, Clone)]
struct IndexedChunk {
    id: String,
    content: String,
    embedding: Vec<f32>,
}

/// In-memory embedded chunks grouped by knowledge base.
///
/// Search takes the `fetch_k` nearest chunks by cosine similarity, then
/// chooses `k` of them with MMR.
#[derive(Clone)]
pub struct VectorIndex {
    chunks: Arc<RwLock<HashMap<KnowledgeBaseId, Vec<IndexedChunk>>>>,
    fetch_k: usize,
    lambda: f32,
}

impl VectorIndex {
    pub fn new(fetch_k: usize, lambda: f32) -> Self {
        Self {
            chunks: Arc::new(RwLock::new(HashMap::new())),
            fetch_k,
            lambda,
        }
    }

    /// Add an embedded chunk to a knowledge base.
    pub async fn insert(
        &self,
        kb: &KnowledgeBaseId,
        id: impl Into<String>,
        content: impl Into<String>,
        embedding: Vec<f32>,
    ) -> Result<(), RetrievalError> {
        let mut all = self.chunks.write().await;
        let entries = all.entry(kb.clone()).or_default();
        if let Some(first) = entries.first()
            && first.embedding.len() != embedding.len()
        {
            return Err(RetrievalError::DimensionMismatch {
                expected: first.embedding.len(),
                actual: embedding.len(),
            });
        }
        entries.push(IndexedChunk {
            id: id.into(),
            content: content.into(),
            embedding,
        });
        Ok(())
    }

    pub async fn len(&self, kb: &KnowledgeBaseId) -> usize {
        self.chunks.read().await.get(kb).map_or(0, Vec::len)
    }
}

#[async_trait]
impl Retriever for VectorIndex {
    async fn search(
        &self,
        kb: &KnowledgeBaseId,
        query_embedding: &[f32],
        k: usize,
    ) -> Result<Vec<RetrievedChunk>, RetrievalError> {
        let all = self.chunks.read().await;
        let entries = all
            .get(kb)
            .ok_or_else(|| RetrievalError::KnowledgeBaseNotFound(kb.to_string()))?;

        if let Some(first) = entries.first()
            && first.embedding.len() != query_embedding.len()
        {
            return Err(RetrievalError::DimensionMismatch {
                expected: first.embedding.len(),
                actual: query_embedding.len(),
            });
        }

        let mut scored: Vec<(f32, &IndexedChunk)> = entries
            .iter()
            .map(|c| (cosine_similarity(&c.embedding, query_embedding), c))
            .collect();
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(self.fetch_k.max(k));

        let vectors: Vec<&[f32]> = scored.iter().map(|(_, c)| c.embedding.as_slice()).collect();
        let picked = mmr_select(query_embedding, &vectors, k, self.lambda);
        debug!(kb = %kb, candidates = scored.len(), picked = picked.len(), "MMR search");

        Ok(picked
            .into_iter()
            .map(|i| {
                let (score, chunk) = scored[i];
                RetrievedChunk {
                    id: chunk.id.clone(),
                    content: chunk.content.clone(),
                    score,
                }
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cosine_identical_vectors() {
        let v = [1.0, 2.0, 3.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn cosine_orthogonal_and_degenerate() {
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);
    }

    #[test]
    fn mmr_prefers_diverse_second_pick() {
        let query = [1.0, 0.0];
        let near = [1.0, 0.05];
        let near_duplicate = [1.0, 0.06];
        let different = [0.7, 0.7];
        let candidates: Vec<&[f32]> = vec![&near, &near_duplicate, &different];

        let picked = mmr_select(&query, &candidates, 2, 0.3);
        assert_eq!(picked, vec![0, 2]);

        // Pure relevance keeps the duplicate
        let picked = mmr_select(&query, &candidates, 2, 1.0);
        assert_eq!(picked, vec![0, 1]);
    }

    #[test]
    fn mmr_handles_small_pools() {
        let only = [1.0, 0.0];
        assert_eq!(mmr_select(&[1.0, 0.0], &[&only], 5, 0.5), vec![0]);
        assert!(mmr_select(&[1.0, 0.0], &[], 5, 0.5).is_empty());
    }

    #[tokio::test]
    async fn index_search_returns_k_chunks() {
        let index = VectorIndex::new(20, 0.5);
        let kb = KnowledgeBaseId::from("kb1");
        index.insert(&kb, "c1", "rust ownership", vec![1.0, 0.0, 0.0]).await.unwrap();
        index.insert(&kb, "c2", "rust borrowing", vec![0.9, 0.1, 0.0]).await.unwrap();
        index.insert(&kb, "c3", "gardening", vec![0.0, 0.0, 1.0]).await.unwrap();

        let hits = index.search(&kb, &[1.0, 0.0, 0.0], 2).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].id, "c1");
        assert_eq!(index.len(&kb).await, 3);
    }

    #[tokio::test]
    async fn index_rejects_unknown_kb_and_bad_dimensions() {
        let index = VectorIndex::new(20, 0.5);
        let kb = KnowledgeBaseId::from("kb1");
        assert!(matches!(
            index.search(&kb, &[1.0], 1).await,
            Err(RetrievalError::KnowledgeBaseNotFound(_))
        ));

        index.insert(&kb, "c1", "x", vec![1.0, 0.0]).await.unwrap();
        assert!(matches!(
            index.insert(&kb, "c2", "y", vec![1.0]).await,
            Err(RetrievalError::DimensionMismatch { .. })
        ));
        assert!(index.search(&kb, &[1.0, 0.0, 0.0], 1).await.is_err());
    }
}
