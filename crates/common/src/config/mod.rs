//! Layered configuration for the retrieval core.
//!
//! Loaded from (in increasing precedence): built-in defaults, `config/default.*`,
//! `config/{APP_ENV}.*`, `config/local.*`, then environment variables prefixed
//! `APP__` with `__` as the nesting separator (e.g. `APP__BM25__K1=1.5`).

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Root configuration object.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AppConfig {
    pub retrieval: RetrievalConfig,
    pub bm25: Bm25Config,
    pub rewrite: RewriteConfig,
    pub embedding: EmbeddingConfig,
    pub resilience: ResilienceConfig,
    pub llm: LlmConfig,
    pub observability: ObservabilityConfig,
}

/// Hybrid retrieval / fusion / rerank tuning.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetrievalConfig {
    /// Fusion weight applied to the normalized dense score (0.0-1.0).
    #[serde(default = "default_alpha")]
    pub alpha: f32,
    /// Default number of hits returned when the caller doesn't specify one.
    #[serde(default = "default_top_k")]
    pub default_top_k: usize,
    /// Candidates pulled from each of the dense/sparse passes before fusion.
    #[serde(default = "default_candidate_pool")]
    pub candidate_pool: usize,
    /// Whether reranking is applied after fusion.
    #[serde(default = "default_true")]
    pub rerank_enabled: bool,
    /// Maximum concurrent upstream calls issued by a single search request.
    #[serde(default = "default_max_concurrent_upstream")]
    pub max_concurrent_upstream_calls_per_request: usize,
    /// Maximum in-flight search requests across the process.
    #[serde(default = "default_max_concurrent_requests")]
    pub max_concurrent_requests: usize,
    /// Upper bound on fused candidates handed to the reranker, before the
    /// `4 * top_k` per-request cap is also applied.
    #[serde(default = "default_rerank_batch_cap")]
    pub rerank_batch_cap: usize,
}

/// BM25 index lifecycle tuning.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Bm25Config {
    #[serde(default = "default_k1")]
    pub k1: f32,
    #[serde(default = "default_b")]
    pub b: f32,
    /// Directory holding the persisted per-KB index segments.
    #[serde(default = "default_index_dir")]
    pub index_dir: String,
    /// Chunks per batched write.
    #[serde(default = "default_batch_write_size")]
    pub batch_write_size: usize,
    /// Dirty-flag flush interval.
    #[serde(default = "default_flush_interval_secs")]
    pub flush_interval_secs: u64,
    /// Bumped whenever tokenization rules change; forces a rebuild on mismatch.
    #[serde(default = "default_tokenizer_version")]
    pub tokenizer_version: u32,
}

/// Multi-turn query rewriter tuning.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RewriteConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Max prior turns folded into the rewrite prompt.
    #[serde(default = "default_history_window")]
    pub history_window: usize,
    /// Max expansion variants returned alongside the rewritten query.
    #[serde(default = "default_max_variants")]
    pub max_variants: usize,
    /// Variants whose edit-distance similarity to the rewritten query exceeds
    /// this threshold are dropped as duplicates.
    #[serde(default = "default_variant_similarity_threshold")]
    pub variant_similarity_threshold: f32,
}

/// Embedding cache + dimension expectations.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EmbeddingConfig {
    #[serde(default = "default_embedding_dimension")]
    pub dimension: usize,
    /// Max entries held by the in-process LRU embedding cache.
    #[serde(default = "default_cache_max")]
    pub cache_max: usize,
}

/// Per-service resilience policy. One instance per upstream collaborator
/// (embedding, vector_store, rerank, llm).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServiceResilienceConfig {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
    #[serde(default = "default_recovery_timeout_secs")]
    pub recovery_timeout_secs: u64,
    #[serde(default = "default_half_open_max_concurrent")]
    pub half_open_max_concurrent: u32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_backoff_exponent")]
    pub backoff_exponent: f64,
    #[serde(default = "default_jitter")]
    pub jitter: f64,
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
}

impl Default for ServiceResilienceConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            success_threshold: default_success_threshold(),
            recovery_timeout_secs: default_recovery_timeout_secs(),
            half_open_max_concurrent: default_half_open_max_concurrent(),
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_exponent: default_backoff_exponent(),
            jitter: default_jitter(),
            call_timeout_ms: default_call_timeout_ms(),
        }
    }
}

impl ServiceResilienceConfig {
    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_secs(self.recovery_timeout_secs)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }
}

/// One [`ServiceResilienceConfig`] per upstream collaborator.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ResilienceConfig {
    #[serde(default)]
    pub embedding: ServiceResilienceConfig,
    #[serde(default)]
    pub vector_store: ServiceResilienceConfig,
    #[serde(default)]
    pub rerank: ServiceResilienceConfig,
    #[serde(default)]
    pub llm: ServiceResilienceConfig,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            embedding: ServiceResilienceConfig::default(),
            vector_store: ServiceResilienceConfig::default(),
            rerank: ServiceResilienceConfig::default(),
            llm: ServiceResilienceConfig::default(),
        }
    }
}

/// LLM provider failover ordering.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LlmConfig {
    /// Providers tried in order; the first whose circuit is closed wins.
    #[serde(default = "default_provider_priority")]
    pub provider_priority: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ObservabilityConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_json_logging")]
    pub json_logging: bool,
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
    #[serde(default = "default_service_name")]
    pub service_name: String,
}

fn default_alpha() -> f32 {
    0.5
}
fn default_top_k() -> usize {
    10
}
fn default_candidate_pool() -> usize {
    100
}
fn default_true() -> bool {
    true
}
fn default_max_concurrent_upstream() -> usize {
    4
}
fn default_max_concurrent_requests() -> usize {
    256
}
fn default_rerank_batch_cap() -> usize {
    50
}
fn default_k1() -> f32 {
    1.5
}
fn default_b() -> f32 {
    0.75
}
fn default_index_dir() -> String {
    "data/bm25".to_string()
}
fn default_batch_write_size() -> usize {
    256
}
fn default_flush_interval_secs() -> u64 {
    60
}
fn default_tokenizer_version() -> u32 {
    1
}
fn default_history_window() -> usize {
    6
}
fn default_max_variants() -> usize {
    3
}
fn default_variant_similarity_threshold() -> f32 {
    0.95
}
fn default_embedding_dimension() -> usize {
    768
}
fn default_cache_max() -> usize {
    10_000
}
fn default_failure_threshold() -> u32 {
    5
}
fn default_success_threshold() -> u32 {
    2
}
fn default_recovery_timeout_secs() -> u64 {
    30
}
fn default_half_open_max_concurrent() -> u32 {
    1
}
fn default_max_retries() -> u32 {
    3
}
fn default_base_delay_ms() -> u64 {
    100
}
fn default_max_delay_ms() -> u64 {
    5_000
}
fn default_backoff_exponent() -> f64 {
    2.0
}
fn default_jitter() -> f64 {
    0.5
}
fn default_call_timeout_ms() -> u64 {
    2_000
}
fn default_provider_priority() -> Vec<String> {
    vec!["primary".to_string(), "secondary".to_string()]
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_json_logging() -> bool {
    true
}
fn default_metrics_port() -> u16 {
    9090
}
fn default_service_name() -> String {
    "kbretrieve".to_string()
}

impl AppConfig {
    /// Load configuration from environment and files.
    pub fn load() -> Result<Self, ConfigError> {
        let env = std::env::var("APP_ENV").unwrap_or_else(|_| "development".to_string());

        let config = Config::builder()
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", env)).required(false))
            .add_source(File::with_name("config/local").required(false))
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            retrieval: RetrievalConfig {
                alpha: default_alpha(),
                default_top_k: default_top_k(),
                candidate_pool: default_candidate_pool(),
                rerank_enabled: default_true(),
                max_concurrent_upstream_calls_per_request: default_max_concurrent_upstream(),
                max_concurrent_requests: default_max_concurrent_requests(),
                rerank_batch_cap: default_rerank_batch_cap(),
            },
            bm25: Bm25Config {
                k1: default_k1(),
                b: default_b(),
                index_dir: default_index_dir(),
                batch_write_size: default_batch_write_size(),
                flush_interval_secs: default_flush_interval_secs(),
                tokenizer_version: default_tokenizer_version(),
            },
            rewrite: RewriteConfig {
                enabled: default_true(),
                history_window: default_history_window(),
                max_variants: default_max_variants(),
                variant_similarity_threshold: default_variant_similarity_threshold(),
            },
            embedding: EmbeddingConfig {
                dimension: default_embedding_dimension(),
                cache_max: default_cache_max(),
            },
            resilience: ResilienceConfig::default(),
            llm: LlmConfig {
                provider_priority: default_provider_priority(),
            },
            observability: ObservabilityConfig {
                log_level: default_log_level(),
                json_logging: default_json_logging(),
                metrics_port: default_metrics_port(),
                service_name: default_service_name(),
            },
        }
    }
}
