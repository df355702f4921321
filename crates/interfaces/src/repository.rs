//! The persistent metadata store collaborator.
//!
//! Owns the canonical record of knowledge bases, documents, and chunks. The
//! retrieval core never writes SQL against this directly; it only calls
//! through this trait, and only for the handful of operations it actually
//! needs (lookups for the search path, listings for BM25 rebuild and
//! reconciliation).

use kbretrieve_common::errors::Result;
use kbretrieve_types::{Chunk, DocumentId, DocumentStatus, KbId, KnowledgeBase, VectorId};

#[async_trait::async_trait]
pub trait Repository: Send + Sync {
    async fn get_kb(&self, kb_id: &KbId) -> Result<Option<KnowledgeBase>>;

    /// All knowledge bases considered for BM25 `rebuild_all()` at startup.
    async fn list_active_kb_ids(&self) -> Result<Vec<KbId>>;

    async fn update_document_status(&self, document_id: &DocumentId, status: DocumentStatus) -> Result<()>;

    /// Insert chunks and return the backend-canonical `VectorId` assigned to
    /// each, in the same order as `chunks`.
    async fn insert_chunks(&self, chunks: Vec<Chunk>) -> Result<Vec<VectorId>>;

    /// All chunks currently on record for a KB, used to rebuild the BM25
    /// index and to reconcile it against the vector store.
    async fn list_chunks(&self, kb_id: &KbId) -> Result<Vec<Chunk>>;

    async fn delete_chunks_by_document(&self, document_id: &DocumentId) -> Result<Vec<VectorId>>;
}
