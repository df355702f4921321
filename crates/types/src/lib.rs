//! Core entities shared across the retrieval core.
//!
//! These are plain data types; persistence, validation against a schema,
//! and ownership of the canonical record all live with the external
//! repository collaborator (see `kbretrieve-interfaces::Repository`).

use chrono::{DateTime, Utc};
use kbretrieve_common::errors::{RetrievalError, Result};
use serde::{Deserialize, Serialize};

macro_rules! opaque_id {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(pub String);

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }
    };
}

opaque_id!(KbId);
opaque_id!(DocumentId);
opaque_id!(ChunkId);
/// Distinct from `ChunkId`: the identifier the vector store assigns, which
/// may differ from the chunk's own identity (see SPEC_FULL.md Open Questions).
opaque_id!(VectorId);

/// A tenant-scoped collection of documents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeBase {
    pub id: KbId,
    pub name: String,
    pub active: bool,
    pub embedding_dimension: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Lifecycle state of a document within a knowledge base.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum DocumentStatus {
    Pending,
    Processing,
    Indexed,
    Failed { reason: String },
}

impl DocumentStatus {
    fn discriminant(&self) -> &'static str {
        match self {
            DocumentStatus::Pending => "pending",
            DocumentStatus::Processing => "processing",
            DocumentStatus::Indexed => "indexed",
            DocumentStatus::Failed { .. } => "failed",
        }
    }

    /// Whether `self -> next` is a legal transition.
    ///
    /// pending -> processing -> indexed
    ///               \-> failed -> pending (retry)
    pub fn can_transition_to(&self, next: &DocumentStatus) -> bool {
        use DocumentStatus::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (Processing, Indexed)
                | (Processing, Failed { .. })
                | (Failed { .. }, Pending)
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: DocumentId,
    pub kb_id: KbId,
    pub title: String,
    pub status: DocumentStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Document {
    /// Apply a checked state transition, returning an error on an illegal move.
    pub fn transition_to(&mut self, next: DocumentStatus) -> Result<()> {
        if !self.status.can_transition_to(&next) {
            return Err(RetrievalError::InvalidStateTransition {
                from: self.status.discriminant().to_string(),
                to: next.discriminant().to_string(),
            });
        }
        self.status = next;
        Ok(())
    }
}

/// A unit of retrievable text within a document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub id: ChunkId,
    pub document_id: DocumentId,
    pub kb_id: KbId,
    pub vector_id: Option<VectorId>,
    pub content: String,
    pub chunk_index: u32,
    pub token_count: usize,
    /// Source page number, when the document format carries one.
    pub page: Option<u32>,
    /// Enclosing section heading, when the document format carries one.
    pub section_title: Option<String>,
}

/// One turn of a multi-turn conversation, used by the query rewriter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: TurnRole,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnRole {
    User,
    Assistant,
}

/// Output of the query rewriter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RewriteResult {
    pub rewritten: String,
    pub variants: Vec<String>,
    pub confidence: f32,
    /// True if the rewriter fell back to the identity transform.
    pub degraded: bool,
}

impl RewriteResult {
    /// Identity rewrite used whenever there is no history, or the LLM call
    /// degrades.
    pub fn identity(query: &str) -> Self {
        Self {
            rewritten: query.to_string(),
            variants: Vec::new(),
            confidence: 0.0,
            degraded: false,
        }
    }
}

/// A scored retrieval result, produced by the hybrid retrieval engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    pub chunk_id: ChunkId,
    pub document_id: DocumentId,
    pub kb_id: KbId,
    /// The chunk's position within its document; together with
    /// `document_id` this is the identity cross-KB dedup keys on (two
    /// physically distinct chunks may coincidentally share text).
    pub chunk_index: u32,
    pub content: String,
    /// Final fused (and possibly reranked) score.
    pub score: f32,
    pub dense_score: Option<f32>,
    pub sparse_score: Option<f32>,
    pub rerank_score: Option<f32>,
    pub page: Option<u32>,
    pub section: Option<String>,
    /// Set when this hit was produced under degraded conditions (e.g. a
    /// missing sparse index, or an open circuit on the dense path).
    pub degraded: bool,
}

/// Circuit breaker state, exposed for observability and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(status: DocumentStatus) -> Document {
        Document {
            id: DocumentId::from("d1"),
            kb_id: KbId::from("kb1"),
            title: "t".into(),
            status,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn legal_transition_succeeds() {
        let mut d = doc(DocumentStatus::Pending);
        assert!(d.transition_to(DocumentStatus::Processing).is_ok());
        assert_eq!(d.status, DocumentStatus::Processing);
    }

    #[test]
    fn illegal_transition_is_rejected() {
        let mut d = doc(DocumentStatus::Pending);
        let err = d.transition_to(DocumentStatus::Indexed).unwrap_err();
        assert!(matches!(err, RetrievalError::InvalidStateTransition { .. }));
        assert_eq!(d.status, DocumentStatus::Pending);
    }

    #[test]
    fn failed_can_retry_to_pending() {
        let mut d = doc(DocumentStatus::Failed {
            reason: "boom".into(),
        });
        assert!(d.transition_to(DocumentStatus::Pending).is_ok());
    }

    #[test]
    fn vector_id_and_chunk_id_are_distinct_types() {
        let chunk_id = ChunkId::from("c1");
        let vector_id = VectorId::from("c1");
        assert_eq!(chunk_id.as_str(), vector_id.as_str());
    }
}
