//! The dense vector index collaborator.

use kbretrieve_common::errors::Result;
use kbretrieve_types::{KbId, VectorId};
use std::collections::HashMap;

/// Metadata filter applied to a dense search, matched by equality against
/// the metadata stored alongside each vector at upsert time.
pub type VectorFilter = HashMap<String, serde_json::Value>;

/// A single dense-search match.
#[derive(Debug, Clone)]
pub struct VectorMatch {
    pub vector_id: VectorId,
    pub score: f32,
    pub metadata: HashMap<String, serde_json::Value>,
}

/// A vector to be (re)indexed.
#[derive(Debug, Clone, Default)]
pub struct VectorRecord {
    pub vector_id: VectorId,
    pub embedding: Vec<f32>,
    pub metadata: HashMap<String, serde_json::Value>,
}

/// Abstraction over a dense vector index (pgvector, a managed vector DB,
/// an in-memory ANN index, ...). Scoped per knowledge base for isolation.
#[async_trait::async_trait]
pub trait VectorStore: Send + Sync {
    /// Create the backing collection for a knowledge base with the given
    /// embedding dimension. Idempotent: creating an existing collection is
    /// not an error.
    async fn create_collection(&self, name: &str, dim: usize) -> Result<()>;

    /// Drop a knowledge base's collection and every vector in it.
    async fn delete_collection(&self, name: &str) -> Result<()>;

    /// Return the `top_k` nearest neighbors of `query` within `kb_id`,
    /// optionally restricted to vectors whose metadata matches every entry
    /// in `filter`.
    async fn search(
        &self,
        kb_id: &KbId,
        query: &[f32],
        top_k: usize,
        filter: Option<&VectorFilter>,
    ) -> Result<Vec<VectorMatch>>;

    /// Insert or overwrite vectors for `kb_id`.
    async fn upsert(&self, kb_id: &KbId, records: Vec<VectorRecord>) -> Result<()>;

    /// Remove vectors by id from `kb_id`.
    async fn delete(&self, kb_id: &KbId, vector_ids: &[VectorId]) -> Result<()>;
}
