//! The dense embedding model collaborator.

use kbretrieve_common::errors::Result;

/// Produces dense vector embeddings for text.
///
/// Implementations talk to whatever embedding model backs the deployment
/// (a hosted API, a local ONNX runtime, ...). They are expected to return
/// `Err` on transport/API failures so the resilience layer can classify and
/// retry them; they are not expected to implement their own retry loops.
#[async_trait::async_trait]
pub trait Embedder: Send + Sync {
    /// Embed a batch of texts, preserving input order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Output vector dimension, used to validate against a KB's configured
    /// dimension before any call is made.
    fn dimension(&self) -> usize;

    /// Stable identifier used in cache keys and metrics labels.
    fn model_name(&self) -> &str;
}
