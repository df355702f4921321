//! The cross-encoder rerank model collaborator.

use kbretrieve_common::errors::Result;
use kbretrieve_types::ChunkId;

/// A candidate passed into the reranker alongside its text.
#[derive(Debug, Clone)]
pub struct RerankCandidate {
    pub chunk_id: ChunkId,
    pub content: String,
}

/// A reranked candidate with the model's relevance score.
#[derive(Debug, Clone)]
pub struct RerankedHit {
    pub chunk_id: ChunkId,
    pub score: f32,
}

/// Cross-encoder style reranker: scores `(query, candidate)` pairs directly
/// rather than comparing precomputed vectors.
#[async_trait::async_trait]
pub trait Reranker: Send + Sync {
    async fn rerank(&self, query: &str, candidates: Vec<RerankCandidate>) -> Result<Vec<RerankedHit>>;
}
