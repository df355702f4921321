//! Error taxonomy for the retrieval core.
//!
//! Every external-facing failure collapses into [`RetrievalError`], tagged
//! with a [`Severity`] that downstream callers (the resilience layer, the
//! retrieval engine's degradation paths) use to decide whether to retry,
//! trip a circuit, or surface the failure untouched.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, RetrievalError>;

/// Machine-readable error codes, stable across releases.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Input errors (1xxx)
    InvalidQuery,
    KbNotFound,
    KbInactive,
    DimensionMismatch,

    // Upstream transient (2xxx) - retryable
    EmbeddingTransient,
    VectorStoreTransient,
    RerankTransient,
    LlmTransient,

    // Upstream permanent (3xxx) - not retryable
    EmbeddingPermanent,
    VectorStorePermanent,
    RerankPermanent,
    LlmPermanent,

    // Circuit open (4xxx)
    CircuitOpen,

    // State errors (5xxx)
    IndexCorrupt,
    InvalidStateTransition,
    ReconciliationFailed,

    // Fatal (9xxx)
    Configuration,
    Internal,
    ServiceUnavailable,
}

impl ErrorCode {
    /// Numeric code for this error, stable for logs/dashboards.
    pub fn as_code(&self) -> u16 {
        match self {
            ErrorCode::InvalidQuery => 1001,
            ErrorCode::KbNotFound => 1002,
            ErrorCode::KbInactive => 1003,
            ErrorCode::DimensionMismatch => 1004,

            ErrorCode::EmbeddingTransient => 2001,
            ErrorCode::VectorStoreTransient => 2002,
            ErrorCode::RerankTransient => 2003,
            ErrorCode::LlmTransient => 2004,

            ErrorCode::EmbeddingPermanent => 3001,
            ErrorCode::VectorStorePermanent => 3002,
            ErrorCode::RerankPermanent => 3003,
            ErrorCode::LlmPermanent => 3004,

            ErrorCode::CircuitOpen => 4001,

            ErrorCode::IndexCorrupt => 5001,
            ErrorCode::InvalidStateTransition => 5002,
            ErrorCode::ReconciliationFailed => 5003,

            ErrorCode::Configuration => 9001,
            ErrorCode::Internal => 9002,
            ErrorCode::ServiceUnavailable => 9999,
        }
    }
}

/// Coarse classification used by the resilience layer to decide retry and
/// circuit-accounting policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Caller supplied bad input; never retried, never counted against a circuit.
    Input,
    /// Upstream call failed in a way likely to succeed on retry.
    UpstreamTransient,
    /// Upstream call failed in a way unlikely to succeed on retry.
    UpstreamPermanent,
    /// A circuit breaker is already open for the target service.
    CircuitOpen,
    /// Local state is inconsistent (corrupt index, illegal transition).
    State,
    /// Unrecoverable; surfaces all the way to the caller.
    Fatal,
}

/// The retrieval core's unified error type.
#[derive(Error, Debug)]
pub enum RetrievalError {
    #[error("invalid query: {message}")]
    InvalidQuery { message: String },

    #[error("knowledge base not found: {kb_id}")]
    KbNotFound { kb_id: String },

    #[error("knowledge base inactive: {kb_id}")]
    KbInactive { kb_id: String },

    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("{service} call failed (transient): {message}")]
    UpstreamTransient { service: String, message: String },

    #[error("{service} call failed (permanent): {message}")]
    UpstreamPermanent { service: String, message: String },

    #[error("circuit open for service: {service}")]
    CircuitOpen { service: String },

    #[error("BM25 index corrupt for {kb_id}: {message}")]
    IndexCorrupt { kb_id: String, message: String },

    #[error("illegal state transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("reconciliation failed for {kb_id}: {message}")]
    ReconciliationFailed { kb_id: String, message: String },

    #[error("configuration error: {message}")]
    Configuration { message: String },

    #[error("internal error: {message}")]
    Internal { message: String },

    #[error("service unavailable: {message}")]
    ServiceUnavailable { message: String },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl RetrievalError {
    /// Machine-readable code for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            RetrievalError::InvalidQuery { .. } => ErrorCode::InvalidQuery,
            RetrievalError::KbNotFound { .. } => ErrorCode::KbNotFound,
            RetrievalError::KbInactive { .. } => ErrorCode::KbInactive,
            RetrievalError::DimensionMismatch { .. } => ErrorCode::DimensionMismatch,
            RetrievalError::UpstreamTransient { service, .. } => match service.as_str() {
                "embedding" => ErrorCode::EmbeddingTransient,
                "vector_store" => ErrorCode::VectorStoreTransient,
                "rerank" => ErrorCode::RerankTransient,
                _ => ErrorCode::LlmTransient,
            },
            RetrievalError::UpstreamPermanent { service, .. } => match service.as_str() {
                "embedding" => ErrorCode::EmbeddingPermanent,
                "vector_store" => ErrorCode::VectorStorePermanent,
                "rerank" => ErrorCode::RerankPermanent,
                _ => ErrorCode::LlmPermanent,
            },
            RetrievalError::CircuitOpen { .. } => ErrorCode::CircuitOpen,
            RetrievalError::IndexCorrupt { .. } => ErrorCode::IndexCorrupt,
            RetrievalError::InvalidStateTransition { .. } => ErrorCode::InvalidStateTransition,
            RetrievalError::ReconciliationFailed { .. } => ErrorCode::ReconciliationFailed,
            RetrievalError::Configuration { .. } => ErrorCode::Configuration,
            RetrievalError::Internal { .. } => ErrorCode::Internal,
            RetrievalError::ServiceUnavailable { .. } => ErrorCode::ServiceUnavailable,
            RetrievalError::Serialization(_) => ErrorCode::Internal,
        }
    }

    /// Severity used by the resilience layer's retry/circuit accounting.
    pub fn severity(&self) -> Severity {
        match self {
            RetrievalError::InvalidQuery { .. }
            | RetrievalError::KbNotFound { .. }
            | RetrievalError::KbInactive { .. }
            | RetrievalError::DimensionMismatch { .. } => Severity::Input,

            RetrievalError::UpstreamTransient { .. } => Severity::UpstreamTransient,
            RetrievalError::UpstreamPermanent { .. } => Severity::UpstreamPermanent,
            RetrievalError::CircuitOpen { .. } => Severity::CircuitOpen,

            RetrievalError::IndexCorrupt { .. }
            | RetrievalError::InvalidStateTransition { .. }
            | RetrievalError::ReconciliationFailed { .. } => Severity::State,

            RetrievalError::Configuration { .. }
            | RetrievalError::Internal { .. }
            | RetrievalError::ServiceUnavailable { .. }
            | RetrievalError::Serialization(_) => Severity::Fatal,
        }
    }

    /// Whether a resilient caller should attempt a retry after this error.
    pub fn retryable(&self) -> bool {
        matches!(self.severity(), Severity::UpstreamTransient)
    }

    /// Whether this error should count against a circuit breaker's failure tally.
    pub fn counts_against_circuit(&self) -> bool {
        matches!(
            self.severity(),
            Severity::UpstreamTransient | Severity::UpstreamPermanent
        )
    }
}
