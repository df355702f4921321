//! The LLM provider collaborator, used by the query rewriter.

use kbretrieve_common::errors::Result;

/// A chat-completion style LLM provider. One concrete implementation exists
/// per entry in `llm.provider_priority`; the resilience layer's failover
/// picks among them.
#[async_trait::async_trait]
pub trait LlmProvider: Send + Sync {
    /// Stable name matching an entry in `llm.provider_priority`.
    fn name(&self) -> &str;

    /// Issue a single-turn completion request and return the raw text.
    async fn complete(&self, prompt: &str) -> Result<String>;
}
