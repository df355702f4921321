//! Relevance scoring, citation extraction, and source attribution for
//! fused search hits against a candidate answer.

use kbretrieve_common::config::ServiceResilienceConfig;
use kbretrieve_common::errors::Result;
use kbretrieve_interfaces::Embedder;
use kbretrieve_resilience::CircuitBreaker;
use kbretrieve_types::{ChunkId, DocumentId, SearchHit};
use regex_lite::Regex;
use std::sync::Arc;
use std::sync::OnceLock;

/// A hit's best-matching sentence against a reference text (a query or a
/// candidate answer), used as its citation excerpt.
#[derive(Debug, Clone, PartialEq)]
pub struct Citation {
    pub chunk_id: kbretrieve_types::ChunkId,
    pub quote: String,
    pub overlap: f32,
}

/// A hit aligned to a candidate answer: a relevance score and a quoted
/// excerpt that supports it.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceReference {
    pub chunk_id: ChunkId,
    pub document_id: DocumentId,
    pub citation: String,
    pub relevance: f32,
}

fn word_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\w+").unwrap())
}

fn words(text: &str) -> Vec<String> {
    word_pattern()
        .find_iter(text)
        .map(|m| m.as_str().to_lowercase())
        .collect()
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 {
        0.0
    } else {
        dot / (na * nb)
    }
}

/// Cosine similarity between a query and a chunk embedding, used as the
/// dense relevance signal.
pub fn score_relevance(query_embedding: &[f32], chunk_embedding: &[f32]) -> f32 {
    cosine(query_embedding, chunk_embedding)
}

/// For a hit's content, find the sentence with the highest query-word
/// overlap fraction and return it as a citation excerpt.
pub fn extract_citation(query: &str, hit: &SearchHit) -> Citation {
    let query_words = words(query);
    let mut best_sentence = hit.content.clone();
    let mut best_overlap = 0.0f32;

    if !query_words.is_empty() {
        for sentence in crate::sentence::split_sentences(&hit.content) {
            let sentence_words: std::collections::HashSet<String> = words(&sentence).into_iter().collect();
            let matches = query_words.iter().filter(|w| sentence_words.contains(*w)).count();
            let overlap = matches as f32 / query_words.len() as f32;
            if overlap > best_overlap {
                best_overlap = overlap;
                best_sentence = sentence;
            }
        }
    }

    Citation {
        chunk_id: hit.chunk_id.clone(),
        quote: best_sentence,
        overlap: best_overlap,
    }
}

/// Mean of `relevances` scoring above `0.4`; `0.0` when none clears that
/// bar, signalling a low-confidence attribution.
pub fn confidence(relevances: &[f32]) -> f32 {
    const THRESHOLD: f32 = 0.4;
    let relevant: Vec<f32> = relevances.iter().copied().filter(|&s| s > THRESHOLD).collect();
    if relevant.is_empty() {
        return 0.0;
    }
    relevant.iter().sum::<f32>() / relevant.len() as f32
}

/// Aligns a candidate answer to the retrieval hits that support it,
/// producing one [`SourceReference`] per hit with a cosine-similarity
/// `relevance` and a quoted citation.
///
/// Degrades gracefully if the embedding service is open-circuited:
/// relevance falls back to the hit's own retrieval score and overall
/// confidence reports `0.0`, per the attribution degradation policy.
pub struct Attribution {
    embedder: Arc<dyn Embedder>,
    breaker: Arc<CircuitBreaker>,
    resilience: ServiceResilienceConfig,
}

impl Attribution {
    pub fn new(embedder: Arc<dyn Embedder>, breaker: Arc<CircuitBreaker>, resilience: ServiceResilienceConfig) -> Self {
        Self {
            embedder,
            breaker,
            resilience,
        }
    }

    /// Produce a [`SourceReference`] for every hit plus an overall
    /// confidence (mean relevance of hits above `0.4`).
    pub async fn attribute(&self, answer: &str, hits: &[SearchHit]) -> (Vec<SourceReference>, f32) {
        if hits.is_empty() {
            return (Vec::new(), 0.0);
        }

        let answer_sentences = crate::sentence::split_sentences(answer);
        if answer_sentences.is_empty() {
            return (self.degraded_references(answer, hits), 0.0);
        }

        let mut texts = answer_sentences.clone();
        texts.extend(hits.iter().map(|h| h.content.clone()));

        match self.embed_batch(texts).await {
            Ok(embeddings) => {
                let (answer_embeddings, hit_embeddings) = embeddings.split_at(answer_sentences.len());
                let mut references = Vec::with_capacity(hits.len());
                let mut relevances = Vec::with_capacity(hits.len());
                for (hit, hit_embedding) in hits.iter().zip(hit_embeddings) {
                    let relevance = answer_embeddings
                        .iter()
                        .map(|a| score_relevance(a, hit_embedding))
                        .fold(f32::MIN, f32::max);
                    relevances.push(relevance);
                    references.push(SourceReference {
                        chunk_id: hit.chunk_id.clone(),
                        document_id: hit.document_id.clone(),
                        citation: extract_citation(answer, hit).quote,
                        relevance,
                    });
                }
                (references, confidence(&relevances))
            }
            Err(err) => {
                tracing::warn!(error = %err, "attribution degraded to raw retrieval scores");
                (self.degraded_references(answer, hits), 0.0)
            }
        }
    }

    fn degraded_references(&self, answer: &str, hits: &[SearchHit]) -> Vec<SourceReference> {
        hits.iter()
            .map(|hit| SourceReference {
                chunk_id: hit.chunk_id.clone(),
                document_id: hit.document_id.clone(),
                citation: extract_citation(answer, hit).quote,
                relevance: hit.score,
            })
            .collect()
    }

    async fn embed_batch(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>> {
        let embedder = self.embedder.clone();
        kbretrieve_resilience::call("embedding", &self.breaker, &self.resilience, move || {
            let embedder = embedder.clone();
            let texts = texts.clone();
            async move { embedder.embed(&texts).await }
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kbretrieve_types::{ChunkId, DocumentId, KbId};

    fn hit(content: &str, score: f32) -> SearchHit {
        SearchHit {
            chunk_id: ChunkId::from("c1"),
            document_id: DocumentId::from("d1"),
            kb_id: KbId::from("kb1"),
            chunk_index: 0,
            content: content.to_string(),
            score,
            dense_score: None,
            sparse_score: None,
            rerank_score: None,
            page: None,
            section: None,
            degraded: false,
        }
    }

    #[test]
    fn cosine_identical_vectors_is_one() {
        assert!((score_relevance(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn citation_picks_the_most_overlapping_sentence() {
        let h = hit(
            "BM25 uses term frequency and inverse document frequency. The fusion layer blends dense and sparse scores.",
            0.8,
        );
        let citation = extract_citation("how does bm25 use document frequency", &h);
        assert!(citation.quote.contains("BM25"));
    }

    #[test]
    fn confidence_ignores_low_scoring_relevances() {
        let c = confidence(&[0.9, 0.1]);
        assert!((c - 0.9).abs() < 1e-6);
    }

    #[test]
    fn confidence_is_zero_when_nothing_clears_the_bar() {
        assert_eq!(confidence(&[0.1, 0.2]), 0.0);
    }

    fn attribution_with(embedder: Arc<kbretrieve_interfaces::mock::MockEmbedder>) -> Attribution {
        Attribution::new(embedder, Arc::new(CircuitBreaker::new("embedding", ServiceResilienceConfig::default())), ServiceResilienceConfig::default())
    }

    #[tokio::test]
    async fn attribute_produces_a_reference_per_hit_with_cosine_relevance() {
        let attribution = attribution_with(Arc::new(kbretrieve_interfaces::mock::MockEmbedder::new(32)));
        let hits = vec![
            hit("bm25 scores terms by frequency", 0.5),
            hit("completely unrelated sentence about gardening", 0.5),
        ];
        let (refs, _confidence) = attribution.attribute("how does bm25 score terms", &hits).await;
        assert_eq!(refs.len(), 2);
        assert!(refs[0].relevance > refs[1].relevance);
        assert!(!refs[0].citation.is_empty());
    }

    #[tokio::test]
    async fn attribute_degrades_to_retrieval_scores_when_embedding_fails() {
        let embedder = Arc::new(kbretrieve_interfaces::mock::MockEmbedder::new(32));
        embedder.fail_next.store(true, std::sync::atomic::Ordering::SeqCst);
        let no_retry = ServiceResilienceConfig {
            max_retries: 0,
            ..ServiceResilienceConfig::default()
        };
        let attribution = Attribution::new(embedder, Arc::new(CircuitBreaker::new("embedding", no_retry.clone())), no_retry);
        let hits = vec![hit("a", 0.7), hit("b", 0.2)];
        let (refs, confidence) = attribution.attribute("anything", &hits).await;
        assert_eq!(refs.len(), 2);
        assert_eq!(refs[0].relevance, 0.7);
        assert_eq!(refs[1].relevance, 0.2);
        assert_eq!(confidence, 0.0);
    }

    #[tokio::test]
    async fn attribute_returns_empty_for_no_hits() {
        let attribution = attribution_with(Arc::new(kbretrieve_interfaces::mock::MockEmbedder::new(32)));
        let (refs, confidence) = attribution.attribute("anything", &[]).await;
        assert!(refs.is_empty());
        assert_eq!(confidence, 0.0);
    }
}
