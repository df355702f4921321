//! Hybrid search orchestration: rewrite the query, expand it into variants,
//! run the dense and sparse passes concurrently per knowledge base and per
//! variant, fuse, rerank a capped candidate set, dedup across knowledge
//! bases, and return a capped, score-ordered hit list.

use crate::dedup::dedup_by_identity;
use crate::fusion::{self, FusionInput};
use crate::session::SessionStore;
use futures::StreamExt;
use kbretrieve_bm25::Bm25Manager;
use kbretrieve_common::config::{ResilienceConfig, RetrievalConfig};
use kbretrieve_common::errors::{RetrievalError, Result};
use kbretrieve_interfaces::reranker::RerankCandidate;
use kbretrieve_interfaces::vector_store::{VectorFilter, VectorMatch};
use kbretrieve_interfaces::{Embedder, Reranker, Repository, VectorStore};
use kbretrieve_resilience::CircuitBreaker;
use kbretrieve_rewriter::Rewriter;
use kbretrieve_types::{Chunk, ChunkId, ConversationTurn, KbId, RewriteResult, SearchHit, VectorId};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

const MISSING_INDEX_LOG_INTERVAL: Duration = Duration::from_secs(60);
const MIN_QUERY_LEN: usize = 1;
const MAX_QUERY_LEN: usize = 1000;
const MIN_TOP_K: usize = 1;
const MAX_TOP_K: usize = 200;
/// Hits scoring at or below this floor don't count toward
/// [`SearchResponse::confidence`] — same low-confidence-floor idea as
/// `kbretrieve_attribution::confidence`, just applied to retrieval score
/// rather than answer relevance, since the engine never sees an answer.
const RETRIEVAL_CONFIDENCE_FLOOR: f32 = 0.0;

/// Which passes contribute to the fused score, and with what weight.
/// `Dense`/`Sparse` are shorthand for `Hybrid` at `alpha = 1.0` / `0.0` —
/// both passes still run either way, so a hit absent from the
/// zero-weighted pass still participates in cross-KB dedup exactly as it
/// would under hybrid fusion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SearchMode {
    Dense,
    Sparse,
    #[default]
    Hybrid,
}

/// Per-request overrides for the public search contract. `None` fields
/// fall back to the service's [`RetrievalConfig`] defaults.
#[derive(Debug, Clone, Default)]
pub struct SearchOptions {
    pub mode: SearchMode,
    /// Fusion weight; only consulted under [`SearchMode::Hybrid`] — `Dense`
    /// and `Sparse` force `alpha` to `1.0`/`0.0` regardless of this value.
    pub alpha: Option<f32>,
    pub use_rerank: Option<bool>,
    pub use_query_rewrite: Option<bool>,
    /// When set and `history` is empty, prior turns are loaded from the
    /// engine's session store instead; the current query is then appended
    /// to that conversation's history for future requests.
    pub conversation_id: Option<String>,
    pub filters: Option<VectorFilter>,
}

/// A single knowledge base's request parameters, fanned out and fused by
/// [`SearchEngine::search`].
#[derive(Debug, Clone)]
pub struct SearchRequest {
    pub kb_ids: Vec<KbId>,
    pub query: String,
    pub history: Vec<ConversationTurn>,
    pub top_k: Option<usize>,
    pub options: SearchOptions,
}

#[derive(Debug, Clone)]
pub struct SearchResponse {
    pub hits: Vec<SearchHit>,
    pub rewritten_query: String,
    /// Mean retrieval score over hits clearing [`RETRIEVAL_CONFIDENCE_FLOOR`];
    /// `0.0` for a low-confidence set or an empty one. This reflects how
    /// strongly retrieval supports its own ranking, not how well an answer
    /// is grounded in it — that's `kbretrieve_attribution::Attribution`'s
    /// job, once an answer exists to compare against.
    pub confidence: f32,
    /// Set if any part of the request (rewrite, a dense pass, a sparse
    /// pass, a rerank pass) fell back to a degraded path.
    pub degraded: bool,
}

struct KbOutcome {
    hits: Vec<SearchHit>,
    degraded: bool,
    total_failure: bool,
}

fn retrieval_confidence(hits: &[SearchHit]) -> f32 {
    let scoring: Vec<f32> = hits.iter().map(|h| h.score).filter(|&s| s > RETRIEVAL_CONFIDENCE_FLOOR).collect();
    if scoring.is_empty() {
        return 0.0;
    }
    scoring.iter().sum::<f32>() / scoring.len() as f32
}

pub struct SearchEngine {
    repository: Arc<dyn Repository>,
    embedder: Arc<dyn Embedder>,
    vector_store: Arc<dyn VectorStore>,
    reranker: Arc<dyn Reranker>,
    bm25: Arc<Bm25Manager>,
    rewriter: Arc<Rewriter>,
    sessions: Arc<SessionStore>,
    embedding_breaker: Arc<CircuitBreaker>,
    vector_store_breaker: Arc<CircuitBreaker>,
    rerank_breaker: Arc<CircuitBreaker>,
    resilience: ResilienceConfig,
    config: RetrievalConfig,
    missing_index_logged_at: Mutex<HashMap<KbId, Instant>>,
}

impl SearchEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        repository: Arc<dyn Repository>,
        embedder: Arc<dyn Embedder>,
        vector_store: Arc<dyn VectorStore>,
        reranker: Arc<dyn Reranker>,
        bm25: Arc<Bm25Manager>,
        rewriter: Arc<Rewriter>,
        embedding_breaker: Arc<CircuitBreaker>,
        vector_store_breaker: Arc<CircuitBreaker>,
        rerank_breaker: Arc<CircuitBreaker>,
        resilience: ResilienceConfig,
        config: RetrievalConfig,
    ) -> Self {
        Self {
            repository,
            embedder,
            vector_store,
            reranker,
            bm25,
            rewriter,
            sessions: Arc::new(SessionStore::new()),
            embedding_breaker,
            vector_store_breaker,
            rerank_breaker,
            resilience,
            config,
            missing_index_logged_at: Mutex::new(HashMap::new()),
        }
    }

    pub async fn search(&self, request: SearchRequest) -> Result<SearchResponse> {
        self.validate(&request)?;
        for kb_id in &request.kb_ids {
            self.ensure_kb_usable(kb_id).await?;
        }

        let started_at = Instant::now();
        let options = &request.options;

        let history = if request.history.is_empty() {
            match &options.conversation_id {
                Some(conversation_id) => self.sessions.history(conversation_id),
                None => Vec::new(),
            }
        } else {
            request.history.clone()
        };

        let rewrite = if options.use_query_rewrite.unwrap_or(true) {
            self.rewriter.rewrite(&request.query, &history).await
        } else {
            RewriteResult::identity(&request.query)
        };

        if let Some(conversation_id) = &options.conversation_id {
            self.sessions.record_query(conversation_id, &request.query);
        }

        let top_k = request.top_k.unwrap_or(self.config.default_top_k);
        let candidate_pool = self.config.candidate_pool;
        let alpha = match options.mode {
            SearchMode::Dense => 1.0,
            SearchMode::Sparse => 0.0,
            SearchMode::Hybrid => options.alpha.unwrap_or(self.config.alpha),
        };
        let rerank_enabled = options.use_rerank.unwrap_or(self.config.rerank_enabled);

        let mut queries = vec![rewrite.rewritten.clone()];
        queries.extend(rewrite.variants.iter().cloned());

        let query_embeddings = self.embed_queries(&queries).await;
        let mut degraded = rewrite.degraded || query_embeddings.iter().all(|e| e.is_none());

        let filter = options.filters.clone();
        let outcomes = futures::stream::iter(request.kb_ids.iter().cloned().map(|kb_id| {
            let queries = queries.clone();
            let query_embeddings = query_embeddings.clone();
            let filter = filter.clone();
            async move {
                self.search_one_kb(kb_id, &queries, &query_embeddings, candidate_pool, alpha, filter.as_ref())
                    .await
            }
        }))
        .buffer_unordered(self.config.max_concurrent_upstream_calls_per_request)
        .collect::<Vec<KbOutcome>>()
        .await;

        let all_failed = outcomes.iter().all(|o| o.total_failure);
        if all_failed {
            return Err(RetrievalError::ServiceUnavailable {
                message: "both dense and sparse passes failed for every requested knowledge base".to_string(),
            });
        }

        let mut hits = Vec::new();
        for outcome in outcomes {
            degraded = degraded || outcome.degraded;
            hits.extend(outcome.hits);
        }
        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));

        if rerank_enabled && !hits.is_empty() {
            let cap = self.config.rerank_batch_cap.min(4 * top_k.max(1));
            let split = cap.min(hits.len());
            let rest = hits.split_off(split);
            hits = self.rerank(&rewrite.rewritten, hits, &mut degraded).await;
            hits.extend(rest);
        }

        let mut hits = dedup_by_identity(hits);
        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(top_k);
        let confidence = retrieval_confidence(&hits);

        let mode_label = match options.mode {
            SearchMode::Dense => "dense",
            SearchMode::Sparse => "sparse",
            SearchMode::Hybrid => "hybrid",
        };
        kbretrieve_common::metrics::record_search(
            started_at.elapsed().as_secs_f64(),
            mode_label,
            hits.len(),
            degraded,
        );

        Ok(SearchResponse {
            hits,
            rewritten_query: rewrite.rewritten,
            confidence,
            degraded,
        })
    }

    fn validate(&self, request: &SearchRequest) -> Result<()> {
        if request.kb_ids.is_empty() {
            return Err(RetrievalError::InvalidQuery {
                message: "at least one knowledge base must be requested".to_string(),
            });
        }
        if request.query.trim().is_empty() {
            return Err(RetrievalError::InvalidQuery {
                message: "query must not be empty".to_string(),
            });
        }
        let query_len = request.query.chars().count();
        if !(MIN_QUERY_LEN..=MAX_QUERY_LEN).contains(&query_len) {
            return Err(RetrievalError::InvalidQuery {
                message: format!("query must be between {MIN_QUERY_LEN} and {MAX_QUERY_LEN} characters, got {query_len}"),
            });
        }
        if let Some(top_k) = request.top_k {
            if !(MIN_TOP_K..=MAX_TOP_K).contains(&top_k) {
                return Err(RetrievalError::InvalidQuery {
                    message: format!("top_k must be between {MIN_TOP_K} and {MAX_TOP_K}, got {top_k}"),
                });
            }
        }
        Ok(())
    }

    async fn ensure_kb_usable(&self, kb_id: &KbId) -> Result<()> {
        match self.repository.get_kb(kb_id).await? {
            None => Err(RetrievalError::KbNotFound {
                kb_id: kb_id.as_str().to_string(),
            }),
            Some(kb) if !kb.active => Err(RetrievalError::KbInactive {
                kb_id: kb_id.as_str().to_string(),
            }),
            Some(_) => Ok(()),
        }
    }

    /// Embed every query (the rewritten primary query plus every variant)
    /// in one batched call. Reusing the primary query's embedding for
    /// variants is not valid: each variant is a distinct reformulation and
    /// must be scored against its own embedding.
    async fn embed_queries(&self, queries: &[String]) -> Vec<Option<Vec<f32>>> {
        let embedder = self.embedder.clone();
        let texts = queries.to_vec();
        let result = kbretrieve_resilience::call(
            "embedding",
            &self.embedding_breaker,
            &self.resilience.embedding,
            move || {
                let embedder = embedder.clone();
                let texts = texts.clone();
                async move { embedder.embed(&texts).await }
            },
        )
        .await;
        match result {
            Ok(vectors) => vectors.into_iter().map(Some).collect(),
            Err(err) => {
                tracing::warn!(error = %err, "query embedding unavailable, degrading to sparse-only");
                vec![None; queries.len()]
            }
        }
    }

    async fn search_one_kb(
        &self,
        kb_id: KbId,
        queries: &[String],
        query_embeddings: &[Option<Vec<f32>>],
        candidate_pool: usize,
        alpha: f32,
        filter: Option<&VectorFilter>,
    ) -> KbOutcome {
        let chunks = match self.repository.list_chunks(&kb_id).await {
            Ok(chunks) => chunks,
            Err(err) => {
                tracing::warn!(kb_id = %kb_id, error = %err, "failed to load chunk metadata for search");
                return KbOutcome {
                    hits: Vec::new(),
                    degraded: true,
                    total_failure: true,
                };
            }
        };
        let by_chunk_id: HashMap<ChunkId, &Chunk> = chunks.iter().map(|c| (c.id.clone(), c)).collect();
        let by_vector_id: HashMap<VectorId, &Chunk> = chunks
            .iter()
            .filter_map(|c| c.vector_id.clone().map(|v| (v, c)))
            .collect();

        let mut dense_failed = false;
        let mut any_embedding = false;
        let mut dense_best: HashMap<ChunkId, f32> = HashMap::new();
        for embedding in query_embeddings.iter().flatten() {
            any_embedding = true;
            match self.dense_search(&kb_id, embedding, candidate_pool, filter).await {
                Ok(matches) => merge_best(&mut dense_best, dense_matches_by_chunk(&matches, &by_vector_id)),
                Err(err) => {
                    tracing::warn!(kb_id = %kb_id, error = %err, "dense pass unavailable for this request");
                    dense_failed = true;
                }
            }
        }
        let dense_scored: Vec<(ChunkId, f32)> = dense_best.into_iter().collect();

        let mut sparse_failed = false;
        let mut sparse_best: HashMap<ChunkId, f32> = HashMap::new();
        for query in queries {
            match self.bm25.search(&kb_id, query, candidate_pool).await {
                Ok(scored) => merge_best(&mut sparse_best, scored),
                Err(err) => {
                    tracing::warn!(kb_id = %kb_id, error = %err, "sparse pass unavailable for this request");
                    sparse_failed = true;
                }
            }
        }
        let sparse_scored: Vec<(ChunkId, f32)> = sparse_best.into_iter().collect();

        if dense_scored.is_empty() && sparse_scored.is_empty() && !self.bm25.has_index(&kb_id).await {
            self.log_missing_index_once(&kb_id).await;
        }

        let mut fused = fusion::fuse(&dense_scored, &sparse_scored, alpha);
        fused.truncate(candidate_pool);

        let kb_degraded = dense_failed || sparse_failed || !any_embedding;
        let hits = fused
            .into_iter()
            .filter_map(|input| self.to_hit(&kb_id, input, alpha, &by_chunk_id, kb_degraded))
            .collect();

        KbOutcome {
            hits,
            degraded: kb_degraded,
            total_failure: dense_failed && sparse_failed,
        }
    }

    async fn dense_search(
        &self,
        kb_id: &KbId,
        query_embedding: &[f32],
        top_k: usize,
        filter: Option<&VectorFilter>,
    ) -> Result<Vec<VectorMatch>> {
        let vector_store = self.vector_store.clone();
        let kb_id = kb_id.clone();
        let query_embedding = query_embedding.to_vec();
        let filter = filter.cloned();
        kbretrieve_resilience::call(
            "vector_store",
            &self.vector_store_breaker,
            &self.resilience.vector_store,
            move || {
                let vector_store = vector_store.clone();
                let kb_id = kb_id.clone();
                let query_embedding = query_embedding.clone();
                let filter = filter.clone();
                async move { vector_store.search(&kb_id, &query_embedding, top_k, filter.as_ref()).await }
            },
        )
        .await
    }

    fn to_hit(
        &self,
        kb_id: &KbId,
        input: FusionInput,
        alpha: f32,
        by_chunk_id: &HashMap<ChunkId, &Chunk>,
        degraded: bool,
    ) -> Option<SearchHit> {
        let chunk = by_chunk_id.get(&input.chunk_id)?;
        let score = fusion::blended_score(&input, alpha);
        Some(SearchHit {
            chunk_id: input.chunk_id,
            document_id: chunk.document_id.clone(),
            kb_id: kb_id.clone(),
            chunk_index: chunk.chunk_index,
            content: chunk.content.clone(),
            score,
            dense_score: input.dense,
            sparse_score: input.sparse,
            rerank_score: None,
            page: chunk.page,
            section: chunk.section_title.clone(),
            degraded,
        })
    }

    async fn rerank(&self, query: &str, hits: Vec<SearchHit>, degraded: &mut bool) -> Vec<SearchHit> {
        let candidates: Vec<RerankCandidate> = hits
            .iter()
            .map(|h| RerankCandidate {
                chunk_id: h.chunk_id.clone(),
                content: h.content.clone(),
            })
            .collect();

        let reranker = self.reranker.clone();
        let query_owned = query.to_string();
        let result = kbretrieve_resilience::call(
            "rerank",
            &self.rerank_breaker,
            &self.resilience.rerank,
            move || {
                let reranker = reranker.clone();
                let query = query_owned.clone();
                let candidates = candidates.clone();
                async move { reranker.rerank(&query, candidates).await }
            },
        )
        .await;

        match result {
            Ok(reranked) => {
                let scores: HashMap<ChunkId, f32> = reranked.into_iter().map(|r| (r.chunk_id, r.score)).collect();
                hits.into_iter()
                    .map(|mut hit| {
                        if let Some(score) = scores.get(&hit.chunk_id) {
                            hit.rerank_score = Some(*score);
                            hit.score = *score;
                        }
                        hit
                    })
                    .collect()
            }
            Err(err) => {
                tracing::warn!(error = %err, "rerank pass unavailable, keeping fused order");
                *degraded = true;
                hits
            }
        }
    }

    async fn log_missing_index_once(&self, kb_id: &KbId) {
        let mut logged = self.missing_index_logged_at.lock().await;
        let now = Instant::now();
        let should_log = match logged.get(kb_id) {
            Some(last) => now.duration_since(*last) >= MISSING_INDEX_LOG_INTERVAL,
            None => true,
        };
        if should_log {
            tracing::warn!(kb_id = %kb_id, "no sparse index for this knowledge base, scoring sparse pass as zero");
            logged.insert(kb_id.clone(), now);
        }
    }
}

fn dense_matches_by_chunk(matches: &[VectorMatch], by_vector_id: &HashMap<VectorId, &Chunk>) -> Vec<(ChunkId, f32)> {
    matches
        .iter()
        .filter_map(|m| by_vector_id.get(&m.vector_id).map(|c| (c.id.clone(), m.score)))
        .collect()
}

/// Fold `scored` into `best`, keeping the highest score seen per chunk —
/// used to dedup a chunk hit by more than one query variant.
fn merge_best(best: &mut HashMap<ChunkId, f32>, scored: Vec<(ChunkId, f32)>) {
    for (chunk_id, score) in scored {
        best.entry(chunk_id)
            .and_modify(|existing| {
                if score > *existing {
                    *existing = score;
                }
            })
            .or_insert(score);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kbretrieve_common::config::{Bm25Config, RewriteConfig, ServiceResilienceConfig};
    use kbretrieve_interfaces::mock::{MockEmbedder, MockLlmProvider, MockReranker, MockRepository, MockVectorStore};
    use kbretrieve_interfaces::vector_store::VectorRecord;
    use kbretrieve_types::{DocumentId, KnowledgeBase, TurnRole};

    fn chunk(id: &str, kb_id: &str, vector_id: &str, content: &str) -> Chunk {
        Chunk {
            id: ChunkId::from(id),
            document_id: DocumentId::from("doc-1"),
            kb_id: KbId::from(kb_id),
            vector_id: Some(VectorId::from(vector_id)),
            content: content.to_string(),
            chunk_index: 0,
            token_count: content.split_whitespace().count(),
            page: None,
            section_title: None,
        }
    }

    fn active_kb(kb_id: &str) -> KnowledgeBase {
        KnowledgeBase {
            id: KbId::from(kb_id),
            name: kb_id.to_string(),
            active: true,
            embedding_dimension: 16,
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        }
    }

    struct Fixture {
        engine: SearchEngine,
        embedder: Arc<MockEmbedder>,
        vector_store: Arc<MockVectorStore>,
        repository: Arc<MockRepository>,
        _dir: tempfile::TempDir,
    }

    fn build(rerank_enabled: bool) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let repository = Arc::new(MockRepository::new());
        let embedder = Arc::new(MockEmbedder::new(16));
        let vector_store = Arc::new(MockVectorStore::new());
        let reranker: Arc<dyn Reranker> = Arc::new(MockReranker::default());

        let bm25_config = Bm25Config {
            k1: 1.5,
            b: 0.75,
            index_dir: dir.path().to_string_lossy().to_string(),
            batch_write_size: 256,
            flush_interval_secs: 60,
            tokenizer_version: 1,
        };
        let bm25 = Arc::new(Bm25Manager::new(bm25_config, repository.clone() as Arc<dyn Repository>));

        let rewriter = Arc::new(Rewriter::new(
            Arc::new(MockLlmProvider::new("primary")),
            Arc::new(CircuitBreaker::new("llm", ServiceResilienceConfig::default())),
            ServiceResilienceConfig::default(),
            RewriteConfig {
                enabled: true,
                history_window: 6,
                max_variants: 3,
                variant_similarity_threshold: 0.95,
            },
        ));

        let engine = SearchEngine::new(
            repository.clone() as Arc<dyn Repository>,
            embedder.clone() as Arc<dyn Embedder>,
            vector_store.clone() as Arc<dyn VectorStore>,
            reranker,
            bm25,
            rewriter,
            Arc::new(CircuitBreaker::new("embedding", ServiceResilienceConfig::default())),
            Arc::new(CircuitBreaker::new("vector_store", ServiceResilienceConfig::default())),
            Arc::new(CircuitBreaker::new("rerank", ServiceResilienceConfig::default())),
            ResilienceConfig::default(),
            RetrievalConfig {
                alpha: 0.5,
                default_top_k: 10,
                candidate_pool: 50,
                rerank_enabled,
                max_concurrent_upstream_calls_per_request: 4,
                max_concurrent_requests: 256,
                rerank_batch_cap: 50,
            },
        );

        Fixture {
            engine,
            embedder,
            vector_store,
            repository,
            _dir: dir,
        }
    }

    fn request(kb_ids: &[&str], query: &str) -> SearchRequest {
        SearchRequest {
            kb_ids: kb_ids.iter().map(|s| KbId::from(*s)).collect(),
            query: query.to_string(),
            history: Vec::new(),
            top_k: None,
            options: SearchOptions::default(),
        }
    }

    #[tokio::test]
    async fn finds_a_chunk_present_in_both_passes() {
        let fixture = build(false);
        let kb = KbId::from("kb-1");
        fixture.repository.insert_kb(active_kb("kb-1"));
        let c = chunk("c1", "kb-1", "v1", "the quick brown fox jumps");
        fixture.repository.seed_chunks(&kb, vec![c.clone()]);
        fixture
            .vector_store
            .upsert(
                &kb,
                vec![VectorRecord {
                    vector_id: VectorId::from("v1"),
                    embedding: fixture.embedder.embed(&["the quick brown fox jumps".to_string()]).await.unwrap()[0].clone(),
                    metadata: HashMap::new(),
                }],
            )
            .await
            .unwrap();
        fixture.engine.bm25.add_chunks(&kb, &[c]).await.unwrap();

        let response = fixture.engine.search(request(&["kb-1"], "quick fox")).await.unwrap();
        assert_eq!(response.hits.len(), 1);
        assert_eq!(response.hits[0].chunk_id.as_str(), "c1");
        assert!(!response.degraded);
    }

    #[tokio::test]
    async fn embedding_failure_degrades_to_sparse_only() {
        let fixture = build(false);
        let kb = KbId::from("kb-1");
        fixture.repository.insert_kb(active_kb("kb-1"));
        let c = chunk("c1", "kb-1", "v1", "quick fox");
        fixture.repository.seed_chunks(&kb, vec![c.clone()]);
        fixture.engine.bm25.add_chunks(&kb, &[c]).await.unwrap();
        fixture.embedder.fail_next.store(true, std::sync::atomic::Ordering::SeqCst);

        let response = fixture.engine.search(request(&["kb-1"], "quick fox")).await.unwrap();
        assert_eq!(response.hits.len(), 1);
        assert!(response.degraded);
        assert!(response.hits[0].dense_score.is_none());
    }

    #[tokio::test]
    async fn missing_knowledge_base_fails_with_kb_not_found() {
        let fixture = build(false);
        let err = fixture.engine.search(request(&["ghost"], "anything")).await.unwrap_err();
        assert!(matches!(err, RetrievalError::KbNotFound { kb_id } if kb_id == "ghost"));
    }

    #[tokio::test]
    async fn inactive_knowledge_base_fails_with_kb_inactive() {
        let fixture = build(false);
        let mut kb = active_kb("kb-1");
        kb.active = false;
        fixture.repository.insert_kb(kb);
        let err = fixture.engine.search(request(&["kb-1"], "anything")).await.unwrap_err();
        assert!(matches!(err, RetrievalError::KbInactive { kb_id } if kb_id == "kb-1"));
    }

    #[tokio::test]
    async fn query_over_the_length_limit_is_rejected() {
        let fixture = build(false);
        let long_query = "a".repeat(MAX_QUERY_LEN + 1);
        let err = fixture.engine.search(request(&["kb-1"], &long_query)).await.unwrap_err();
        assert!(matches!(err, RetrievalError::InvalidQuery { .. }));
    }

    #[tokio::test]
    async fn top_k_outside_bounds_is_rejected() {
        let fixture = build(false);
        let mut req = request(&["kb-1"], "anything");
        req.top_k = Some(MAX_TOP_K + 1);
        let err = fixture.engine.search(req).await.unwrap_err();
        assert!(matches!(err, RetrievalError::InvalidQuery { .. }));
    }

    #[tokio::test]
    async fn cross_kb_duplicate_identity_keeps_the_higher_scorer() {
        let fixture = build(false);
        let kb_a = KbId::from("kb-a");
        let kb_b = KbId::from("kb-b");
        fixture.repository.insert_kb(active_kb("kb-a"));
        fixture.repository.insert_kb(active_kb("kb-b"));
        let shared = "the exact same boilerplate policy text";
        fixture.repository.seed_chunks(&kb_a, vec![chunk("c1", "kb-a", "v1", shared)]);
        fixture.repository.seed_chunks(&kb_b, vec![chunk("c2", "kb-b", "v2", shared)]);
        fixture
            .engine
            .bm25
            .add_chunks(&kb_a, &[chunk("c1", "kb-a", "v1", shared)])
            .await
            .unwrap();
        fixture
            .engine
            .bm25
            .add_chunks(&kb_b, &[chunk("c2", "kb-b", "v2", shared)])
            .await
            .unwrap();

        let response = fixture
            .engine
            .search(request(&["kb-a", "kb-b"], "boilerplate policy"))
            .await
            .unwrap();
        // Same document id and chunk index as each other's own KB-scoped
        // chunk, but different documents entirely — dedup must not merge
        // them just because their text happens to match.
        assert_eq!(response.hits.iter().filter(|h| h.content == shared).count(), 2);
    }

    #[tokio::test]
    async fn cross_kb_same_document_identity_keeps_the_higher_scorer() {
        let fixture = build(false);
        let kb_a = KbId::from("kb-a");
        let kb_b = KbId::from("kb-b");
        fixture.repository.insert_kb(active_kb("kb-a"));
        fixture.repository.insert_kb(active_kb("kb-b"));
        let shared = "the exact same boilerplate policy text";
        let mut c1 = chunk("c1", "kb-a", "v1", shared);
        c1.document_id = DocumentId::from("doc-shared");
        let mut c2 = chunk("c2", "kb-b", "v2", shared);
        c2.document_id = DocumentId::from("doc-shared");
        fixture.repository.seed_chunks(&kb_a, vec![c1.clone()]);
        fixture.repository.seed_chunks(&kb_b, vec![c2.clone()]);
        fixture.engine.bm25.add_chunks(&kb_a, &[c1]).await.unwrap();
        fixture.engine.bm25.add_chunks(&kb_b, &[c2]).await.unwrap();

        let response = fixture
            .engine
            .search(request(&["kb-a", "kb-b"], "boilerplate policy"))
            .await
            .unwrap();
        assert_eq!(response.hits.iter().filter(|h| h.content == shared).count(), 1);
    }

    #[tokio::test]
    async fn empty_query_is_rejected() {
        let fixture = build(false);
        let err = fixture.engine.search(request(&["kb-1"], "   ")).await.unwrap_err();
        assert!(matches!(err, RetrievalError::InvalidQuery { .. }));
    }

    #[tokio::test]
    async fn rerank_reorders_by_reranker_score() {
        let fixture = build(true);
        let kb = KbId::from("kb-1");
        fixture.repository.insert_kb(active_kb("kb-1"));
        let chunks = vec![
            chunk("c1", "kb-1", "v1", "irrelevant filler content"),
            chunk("c2", "kb-1", "v2", "banana banana banana banana"),
        ];
        fixture.repository.seed_chunks(&kb, chunks.clone());
        fixture.engine.bm25.add_chunks(&kb, &chunks).await.unwrap();

        let response = fixture.engine.search(request(&["kb-1"], "banana")).await.unwrap();
        assert_eq!(response.hits[0].chunk_id.as_str(), "c2");
        assert!(response.hits[0].rerank_score.is_some());
    }

    #[tokio::test]
    async fn history_triggers_rewrite_through_the_llm() {
        let fixture = build(false);
        let kb = KbId::from("kb-1");
        fixture.repository.insert_kb(active_kb("kb-1"));
        let c = chunk("c1", "kb-1", "v1", "bm25 scoring details");
        fixture.repository.seed_chunks(&kb, vec![c.clone()]);
        fixture.engine.bm25.add_chunks(&kb, &[c]).await.unwrap();

        let mut req = request(&["kb-1"], "tell me more");
        req.history = vec![ConversationTurn {
            role: TurnRole::User,
            content: "what is bm25?".to_string(),
            timestamp: chrono::Utc::now(),
        }];
        let response = fixture.engine.search(req).await.unwrap();
        assert!(!response.rewritten_query.is_empty());
    }

    #[tokio::test]
    async fn conversation_id_recalls_history_without_resending_it() {
        let fixture = build(false);
        let kb = KbId::from("kb-1");
        fixture.repository.insert_kb(active_kb("kb-1"));
        let c = chunk("c1", "kb-1", "v1", "bm25 scoring details");
        fixture.repository.seed_chunks(&kb, vec![c.clone()]);
        fixture.engine.bm25.add_chunks(&kb, &[c]).await.unwrap();

        let mut first = request(&["kb-1"], "what is bm25?");
        first.options.conversation_id = Some("conv-1".to_string());
        fixture.engine.search(first).await.unwrap();

        assert_eq!(fixture.engine.sessions.history("conv-1").len(), 1);

        let mut second = request(&["kb-1"], "tell me more");
        second.options.conversation_id = Some("conv-1".to_string());
        let response = fixture.engine.search(second).await.unwrap();
        assert!(!response.rewritten_query.is_empty());
    }

    #[tokio::test]
    async fn dense_mode_matches_hybrid_at_alpha_one() {
        let fixture = build(false);
        let kb = KbId::from("kb-1");
        fixture.repository.insert_kb(active_kb("kb-1"));
        let chunks = vec![
            chunk("c1", "kb-1", "v1", "quick brown fox"),
            chunk("c2", "kb-1", "v2", "lazy sleepy dog"),
        ];
        fixture.repository.seed_chunks(&kb, chunks.clone());
        for c in &chunks {
            fixture
                .vector_store
                .upsert(
                    &kb,
                    vec![VectorRecord {
                        vector_id: c.vector_id.clone().unwrap(),
                        embedding: fixture.embedder.embed(&[c.content.clone()]).await.unwrap()[0].clone(),
                        metadata: HashMap::new(),
                    }],
                )
                .await
                .unwrap();
        }
        fixture.engine.bm25.add_chunks(&kb, &chunks).await.unwrap();

        let mut dense_request = request(&["kb-1"], "quick fox");
        dense_request.options.mode = SearchMode::Dense;
        let dense_response = fixture.engine.search(dense_request).await.unwrap();

        let mut hybrid_request = request(&["kb-1"], "quick fox");
        hybrid_request.options.mode = SearchMode::Hybrid;
        hybrid_request.options.alpha = Some(1.0);
        let hybrid_response = fixture.engine.search(hybrid_request).await.unwrap();

        let dense_ids: Vec<&str> = dense_response.hits.iter().map(|h| h.chunk_id.as_str()).collect();
        let hybrid_ids: Vec<&str> = hybrid_response.hits.iter().map(|h| h.chunk_id.as_str()).collect();
        assert_eq!(dense_ids, hybrid_ids);
    }

    #[tokio::test]
    async fn rerank_batch_cap_limits_candidates_sent_to_the_reranker() {
        let fixture = build(true);
        let kb = KbId::from("kb-1");
        fixture.repository.insert_kb(active_kb("kb-1"));
        let chunks: Vec<Chunk> = (0..5)
            .map(|i| chunk(&format!("c{i}"), "kb-1", &format!("v{i}"), "banana content repeated"))
            .collect();
        fixture.repository.seed_chunks(&kb, chunks.clone());
        fixture.engine.bm25.add_chunks(&kb, &chunks).await.unwrap();

        let mut req = request(&["kb-1"], "banana");
        req.top_k = Some(2);
        let response = fixture.engine.search(req).await.unwrap();
        assert_eq!(response.hits.len(), 2);
    }
}
