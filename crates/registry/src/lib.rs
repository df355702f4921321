//! Service registry: the single place that owns every external
//! collaborator, circuit breaker, and lifecycle manager the retrieval core
//! needs, and wires them into a [`SearchEngine`].
//!
//! Construction is a one-shot [`ServiceRegistry::bootstrap`] — analogous to
//! a gateway's `DbPool::new` + `AppState` composition, just with more
//! collaborators to assemble. Teardown runs in reverse dependency order:
//! stop accepting new work, flush BM25 to disk, then drop the collaborator
//! handles.

pub mod llm_failover;

use kbretrieve_attribution::Compression;
use kbretrieve_bm25::Bm25Manager;
use kbretrieve_common::cache::EmbeddingCache;
use kbretrieve_common::config::AppConfig;
use kbretrieve_common::errors::Result;
use kbretrieve_interfaces::{Embedder, LlmProvider, Reranker, Repository, VectorStore};
use kbretrieve_resilience::{CircuitBreaker, Failover};
use kbretrieve_retrieval::SearchEngine;
use kbretrieve_rewriter::Rewriter;
use llm_failover::FailoverLlmProvider;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;

/// One entry per named LLM provider, as configured in `llm.provider_priority`.
pub struct LlmProviderEntry {
    pub name: String,
    pub provider: Arc<dyn LlmProvider>,
}

/// Everything the retrieval core needs to serve a request, assembled once
/// at startup and shared behind `Arc` for the life of the process.
pub struct ServiceRegistry {
    pub config: Arc<AppConfig>,
    pub repository: Arc<dyn Repository>,
    pub bm25: Arc<Bm25Manager>,
    pub search_engine: Arc<SearchEngine>,
    pub compression: Arc<Compression>,
    pub embedding_cache: Arc<EmbeddingCache>,
    pub embedding_breaker: Arc<CircuitBreaker>,
    pub vector_store_breaker: Arc<CircuitBreaker>,
    pub rerank_breaker: Arc<CircuitBreaker>,
    flush_task: Mutex<Option<JoinHandle<()>>>,
}

/// Process-wide singleton slot for [`ServiceRegistry::get_or_init`].
/// A plain `Mutex`, not a lock-free `OnceCell`: the spec calls for
/// double-checked initialization under a mutex specifically, since
/// bootstrap is async and fallible and a lock-free singleton can't express
/// "retry construction if the first attempt failed."
static REGISTRY: Mutex<Option<Arc<ServiceRegistry>>> = Mutex::new(None);

impl ServiceRegistry {
    /// Idempotent entry point for process startup: the first caller builds
    /// the registry via [`Self::bootstrap`]; every later caller (or a
    /// caller racing the first) observes the already-built instance.
    /// Checks the slot once before bootstrapping (fast path once
    /// initialized) and again after, under the same lock, before
    /// committing — the second check is what makes two concurrent callers
    /// converge on one registry instead of each bootstrapping their own.
    /// A failed bootstrap is not cached, so a later call can retry.
    #[allow(clippy::too_many_arguments)]
    pub async fn get_or_init(
        config: AppConfig,
        repository: Arc<dyn Repository>,
        embedder: Arc<dyn Embedder>,
        vector_store: Arc<dyn VectorStore>,
        reranker: Arc<dyn Reranker>,
        llm_providers: Vec<LlmProviderEntry>,
    ) -> Result<Arc<Self>> {
        if let Some(existing) = REGISTRY.lock().unwrap().clone() {
            return Ok(existing);
        }

        let registry = Self::bootstrap(config, repository, embedder, vector_store, reranker, llm_providers).await?;

        let mut slot = REGISTRY.lock().unwrap();
        if let Some(existing) = slot.clone() {
            return Ok(existing);
        }
        *slot = Some(registry.clone());
        Ok(registry)
    }

    /// Drop the process-wide singleton, so a subsequent [`Self::get_or_init`]
    /// call bootstraps a fresh registry. Test-only: production shutdown goes
    /// through [`Self::shutdown`] on the held `Arc`, which doesn't need to
    /// touch the slot since the process is exiting anyway.
    #[cfg(test)]
    fn reset_singleton() {
        *REGISTRY.lock().unwrap() = None;
    }

    /// Wire every collaborator together, rebuild every active knowledge
    /// base's BM25 index from the repository, and start the background
    /// BM25 flush loop. Always constructs a fresh registry — callers that
    /// want at-most-once initialization across concurrent callers should
    /// use [`Self::get_or_init`] instead.
    #[allow(clippy::too_many_arguments)]
    pub async fn bootstrap(
        config: AppConfig,
        repository: Arc<dyn Repository>,
        embedder: Arc<dyn Embedder>,
        vector_store: Arc<dyn VectorStore>,
        reranker: Arc<dyn Reranker>,
        llm_providers: Vec<LlmProviderEntry>,
    ) -> Result<Arc<Self>> {
        let config = Arc::new(config);

        install_metrics_recorder(config.observability.metrics_port);
        kbretrieve_common::metrics::register_metrics();

        let embedding_breaker = Arc::new(CircuitBreaker::new("embedding", config.resilience.embedding.clone()));
        let vector_store_breaker = Arc::new(CircuitBreaker::new("vector_store", config.resilience.vector_store.clone()));
        let rerank_breaker = Arc::new(CircuitBreaker::new("rerank", config.resilience.rerank.clone()));

        let mut failover: Failover<dyn LlmProvider> = Failover::new(config.llm.provider_priority.clone());
        for entry in llm_providers {
            let circuit = Arc::new(CircuitBreaker::new(entry.name.clone(), config.resilience.llm.clone()));
            failover.register(entry.name, entry.provider, circuit);
        }
        let llm: Arc<dyn LlmProvider> = Arc::new(FailoverLlmProvider::new(failover));
        let llm_breaker = Arc::new(CircuitBreaker::new("llm", config.resilience.llm.clone()));
        let rewriter = Arc::new(Rewriter::new(
            llm,
            llm_breaker,
            config.resilience.llm.clone(),
            config.rewrite.clone(),
        ));

        let bm25 = Arc::new(Bm25Manager::new(config.bm25.clone(), repository.clone()));

        let compression = Arc::new(Compression::new(
            embedder.clone(),
            embedding_breaker.clone(),
            config.resilience.embedding.clone(),
        ));

        let search_engine = Arc::new(SearchEngine::new(
            repository.clone(),
            embedder.clone(),
            vector_store,
            reranker,
            bm25.clone(),
            rewriter,
            embedding_breaker.clone(),
            vector_store_breaker.clone(),
            rerank_breaker.clone(),
            config.resilience.clone(),
            config.retrieval.clone(),
        ));

        let embedding_cache = Arc::new(EmbeddingCache::new(config.embedding.cache_max));

        let registry = Arc::new(Self {
            config,
            repository,
            bm25,
            search_engine,
            compression,
            embedding_cache,
            embedding_breaker,
            vector_store_breaker,
            rerank_breaker,
            flush_task: Mutex::new(None),
        });

        registry.bm25.rebuild_all().await?;
        registry.spawn_flush_loop();
        Ok(registry)
    }

    fn spawn_flush_loop(self: &Arc<Self>) {
        let registry = self.clone();
        let interval = registry.bm25.flush_interval();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // first tick fires immediately, skip it
            loop {
                ticker.tick().await;
                if let Err(err) = registry.bm25.flush_dirty().await {
                    tracing::warn!(error = %err, "periodic bm25 flush failed");
                }
            }
        });
        *self.flush_task.lock().unwrap() = Some(handle);
    }

    /// Tear down in reverse dependency order: stop the flush loop, flush
    /// whatever is still dirty, then return. Collaborator handles are
    /// dropped by the caller discarding its last `Arc<ServiceRegistry>`.
    pub async fn shutdown(&self) -> Result<()> {
        if let Some(handle) = self.flush_task.lock().unwrap().take() {
            handle.abort();
        }
        self.bm25.flush_dirty().await?;
        tracing::info!("service registry shut down");
        Ok(())
    }
}

fn install_metrics_recorder(port: u16) {
    use metrics_exporter_prometheus::PrometheusBuilder;
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    if let Err(err) = PrometheusBuilder::new().with_http_listener(addr).install() {
        tracing::warn!(error = %err, "failed to install prometheus metrics recorder");
    }
}
