//! Multi-turn query rewriting over an [`LlmProvider`], wrapped in the
//! resilience layer and falling back to the identity transform whenever
//! the call or the response parsing fails.

use crate::prompt::build_prompt;
use crate::similarity::similarity;
use kbretrieve_common::config::{RewriteConfig, ServiceResilienceConfig};
use kbretrieve_interfaces::LlmProvider;
use kbretrieve_resilience::CircuitBreaker;
use kbretrieve_types::{ConversationTurn, RewriteResult};
use serde::Deserialize;
use std::sync::Arc;

#[derive(Debug, Deserialize)]
struct RawRewrite {
    rewritten: String,
    #[serde(default)]
    variants: Vec<String>,
    #[serde(default)]
    confidence: f32,
}

pub struct Rewriter {
    llm: Arc<dyn LlmProvider>,
    breaker: Arc<CircuitBreaker>,
    resilience: ServiceResilienceConfig,
    config: RewriteConfig,
}

impl Rewriter {
    pub fn new(
        llm: Arc<dyn LlmProvider>,
        breaker: Arc<CircuitBreaker>,
        resilience: ServiceResilienceConfig,
        config: RewriteConfig,
    ) -> Self {
        Self {
            llm,
            breaker,
            resilience,
            config,
        }
    }

    /// Rewrite `query` given bounded conversation `history`. Never fails:
    /// any upstream or parse error degrades to [`RewriteResult::identity`]
    /// with `degraded = true`.
    pub async fn rewrite(&self, query: &str, history: &[ConversationTurn]) -> RewriteResult {
        if !self.config.enabled || history.is_empty() {
            return RewriteResult::identity(query);
        }

        let window_start = history.len().saturating_sub(self.config.history_window);
        let bounded_history = &history[window_start..];
        let prompt = build_prompt(bounded_history, query);

        let llm = self.llm.clone();
        let response = kbretrieve_resilience::call("llm", &self.breaker, &self.resilience, move || {
            let llm = llm.clone();
            let prompt = prompt.clone();
            async move { llm.complete(&prompt).await }
        })
        .await;

        let result = match response {
            Ok(raw) => self.parse_response(&raw, query),
            Err(err) => {
                tracing::warn!(error = %err, "query rewrite degraded to identity transform");
                let mut result = RewriteResult::identity(query);
                result.degraded = true;
                result
            }
        };
        kbretrieve_common::metrics::record_rewrite(result.degraded);
        result
    }

    fn parse_response(&self, raw: &str, query: &str) -> RewriteResult {
        let parsed: RawRewrite = match serde_json::from_str(raw) {
            Ok(parsed) => parsed,
            Err(err) => {
                tracing::warn!(error = %err, "rewrite response did not parse, falling back to identity");
                let mut result = RewriteResult::identity(query);
                result.degraded = true;
                return result;
            }
        };

        let variants = self.dedup_variants(&parsed.rewritten, parsed.variants);

        RewriteResult {
            rewritten: parsed.rewritten,
            variants,
            confidence: parsed.confidence.clamp(0.0, 1.0),
            degraded: false,
        }
    }

    /// Drop variants that are near-duplicates of the rewritten query or of
    /// an already-kept variant, then cap to `max_variants`.
    fn dedup_variants(&self, rewritten: &str, candidates: Vec<String>) -> Vec<String> {
        let mut kept: Vec<String> = Vec::new();
        for candidate in candidates {
            let too_similar_to_rewritten =
                similarity(&candidate, rewritten) >= self.config.variant_similarity_threshold;
            let too_similar_to_kept = kept
                .iter()
                .any(|k| similarity(&candidate, k) >= self.config.variant_similarity_threshold);
            if !too_similar_to_rewritten && !too_similar_to_kept {
                kept.push(candidate);
            }
            if kept.len() >= self.config.max_variants {
                break;
            }
        }
        kept
    }
}
