//! Extractive compression: fit a hit set inside a token budget by greedily
//! keeping the highest-scoring hits and, within each, the sentences most
//! similar to the query embedding.

use crate::attribution::score_relevance;
use crate::sentence::{estimate_tokens, split_sentences};
use kbretrieve_common::config::ServiceResilienceConfig;
use kbretrieve_interfaces::Embedder;
use kbretrieve_resilience::CircuitBreaker;
use kbretrieve_types::SearchHit;
use std::sync::Arc;

const SENTENCE_SIMILARITY_THRESHOLD: f32 = 0.35;

pub struct Compression {
    embedder: Arc<dyn Embedder>,
    breaker: Arc<CircuitBreaker>,
    resilience: ServiceResilienceConfig,
}

impl Compression {
    pub fn new(embedder: Arc<dyn Embedder>, breaker: Arc<CircuitBreaker>, resilience: ServiceResilienceConfig) -> Self {
        Self {
            embedder,
            breaker,
            resilience,
        }
    }

    /// Compress `hits` (assumed score-descending) to fit within
    /// `max_tokens` total. Each kept hit gets an equal share of the
    /// budget; within that share it keeps the sentences most similar to
    /// the query, falling back to a plain character truncation if the
    /// embedding call fails.
    pub async fn compress(&self, hits: Vec<SearchHit>, query: &str, max_tokens: usize) -> Vec<SearchHit> {
        if hits.is_empty() || max_tokens == 0 {
            return hits;
        }

        let kept = self.select_within_budget(&hits, max_tokens);
        let per_hit_cap = (max_tokens / kept.max(1)).max(1);

        let query_embedding = self.embed_one(query).await;

        let mut compressed = Vec::with_capacity(kept);
        for mut hit in hits.into_iter().take(kept) {
            hit = self.compress_hit(hit, query_embedding.as_deref(), per_hit_cap).await;
            compressed.push(hit);
        }
        compressed
    }

    /// How many leading hits (by score order) fit in `max_tokens` at one
    /// sentence's worth of content each, at minimum one hit.
    fn select_within_budget(&self, hits: &[SearchHit], max_tokens: usize) -> usize {
        let mut total = 0usize;
        let mut count = 0usize;
        for hit in hits {
            let cost = estimate_tokens(&hit.content).min(max_tokens.max(1));
            if count > 0 && total + cost > max_tokens {
                break;
            }
            total += cost;
            count += 1;
        }
        count.max(1)
    }

    async fn embed_one(&self, text: &str) -> Option<Vec<f32>> {
        let embedder = self.embedder.clone();
        let text = text.to_string();
        let result = kbretrieve_resilience::call("embedding", &self.breaker, &self.resilience, move || {
            let embedder = embedder.clone();
            let text = text.clone();
            async move { embedder.embed(&[text]).await }
        })
        .await;
        result.ok().and_then(|mut v| v.pop())
    }

    async fn compress_hit(&self, mut hit: SearchHit, query_embedding: Option<&[f32]>, token_cap: usize) -> SearchHit {
        let Some(query_embedding) = query_embedding else {
            hit.content = truncate_to_tokens(&hit.content, token_cap);
            hit.degraded = true;
            return hit;
        };

        let sentences = split_sentences(&hit.content);
        if sentences.is_empty() {
            return hit;
        }

        let embedder = self.embedder.clone();
        let texts = sentences.clone();
        let result = kbretrieve_resilience::call("embedding", &self.breaker, &self.resilience, move || {
            let embedder = embedder.clone();
            let texts = texts.clone();
            async move { embedder.embed(&texts).await }
        })
        .await;

        let Ok(sentence_embeddings) = result else {
            hit.content = truncate_to_tokens(&hit.content, token_cap);
            hit.degraded = true;
            return hit;
        };

        let mut selected = Vec::new();
        let mut used_tokens = 0usize;
        for (sentence, embedding) in sentences.iter().zip(sentence_embeddings.iter()) {
            if score_relevance(query_embedding, embedding) <= SENTENCE_SIMILARITY_THRESHOLD {
                continue;
            }
            let cost = estimate_tokens(sentence);
            if used_tokens + cost > token_cap && !selected.is_empty() {
                break;
            }
            used_tokens += cost;
            selected.push(sentence.clone());
        }

        if selected.is_empty() {
            hit.content = truncate_to_tokens(&hit.content, token_cap);
        } else {
            hit.content = selected.join(". ");
        }
        hit
    }
}

fn truncate_to_tokens(text: &str, token_cap: usize) -> String {
    let char_cap = token_cap.saturating_mul(4).max(1);
    if text.len() <= char_cap {
        text.to_string()
    } else {
        text.chars().take(char_cap).collect()
    }
}
