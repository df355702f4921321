//! Prometheus metrics for the retrieval core.
//!
//! SLO-aligned histogram buckets and standardized naming, following the same
//! shape as the rest of the metrics-rs ecosystem usage in this workspace.

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram, Unit};
use std::time::Instant;

pub const METRICS_PREFIX: &str = "kbretrieve";

/// Request latency buckets (seconds). P50 < 50ms, P99 < 300ms target.
pub const LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.010, 0.025, 0.050, 0.075, 0.100, 0.150, 0.300, 0.500, 1.000, 2.500, 5.000,
];

/// Upstream call latency buckets (seconds), allows for slower LLM calls.
pub const UPSTREAM_BUCKETS: &[f64] = &[
    0.050, 0.100, 0.250, 0.500, 1.000, 2.000, 5.000, 10.00, 30.00,
];

/// Register all metric descriptions. Call once at process start.
pub fn register_metrics() {
    describe_counter!(
        format!("{}_search_queries_total", METRICS_PREFIX),
        Unit::Count,
        "Total number of search() invocations"
    );
    describe_histogram!(
        format!("{}_search_duration_seconds", METRICS_PREFIX),
        Unit::Seconds,
        "End-to-end search latency"
    );
    describe_gauge!(
        format!("{}_search_results_count", METRICS_PREFIX),
        Unit::Count,
        "Number of hits returned from the last search"
    );

    describe_counter!(
        format!("{}_bm25_rebuild_total", METRICS_PREFIX),
        Unit::Count,
        "Total BM25 index rebuilds"
    );
    describe_histogram!(
        format!("{}_bm25_query_duration_seconds", METRICS_PREFIX),
        Unit::Seconds,
        "BM25 query latency"
    );

    describe_counter!(
        format!("{}_rewrite_total", METRICS_PREFIX),
        Unit::Count,
        "Total query rewrite invocations"
    );
    describe_counter!(
        format!("{}_rewrite_degraded_total", METRICS_PREFIX),
        Unit::Count,
        "Total rewrites that fell back to the identity transform"
    );

    describe_counter!(
        format!("{}_circuit_state_transitions_total", METRICS_PREFIX),
        Unit::Count,
        "Circuit breaker state transitions, labeled by service and to-state"
    );
    describe_histogram!(
        format!("{}_upstream_call_duration_seconds", METRICS_PREFIX),
        Unit::Seconds,
        "Upstream collaborator call latency, labeled by service"
    );
    describe_counter!(
        format!("{}_upstream_retries_total", METRICS_PREFIX),
        Unit::Count,
        "Total retry attempts issued by the resilience layer"
    );

    describe_counter!(
        format!("{}_cache_hits_total", METRICS_PREFIX),
        Unit::Count,
        "Embedding cache hits"
    );
    describe_counter!(
        format!("{}_cache_misses_total", METRICS_PREFIX),
        Unit::Count,
        "Embedding cache misses"
    );

    tracing::info!("metrics registered");
}

/// RAII-style timer for recording a labeled request duration.
pub struct RequestTimer {
    start: Instant,
    metric: &'static str,
    label_key: &'static str,
    label_value: String,
}

impl RequestTimer {
    pub fn start(metric: &'static str, label_key: &'static str, label_value: impl Into<String>) -> Self {
        Self {
            start: Instant::now(),
            metric,
            label_key,
            label_value: label_value.into(),
        }
    }

    pub fn finish(self) {
        let duration = self.start.elapsed().as_secs_f64();
        histogram!(self.metric, self.label_key => self.label_value).record(duration);
    }
}

pub fn record_search(duration_secs: f64, mode: &str, result_count: usize, degraded: bool) {
    counter!(
        format!("{}_search_queries_total", METRICS_PREFIX),
        "mode" => mode.to_string(),
        "degraded" => degraded.to_string()
    )
    .increment(1);

    histogram!(
        format!("{}_search_duration_seconds", METRICS_PREFIX),
        "mode" => mode.to_string()
    )
    .record(duration_secs);

    gauge!(
        format!("{}_search_results_count", METRICS_PREFIX),
        "mode" => mode.to_string()
    )
    .set(result_count as f64);
}

pub fn record_circuit_transition(service: &str, to_state: &str) {
    counter!(
        format!("{}_circuit_state_transitions_total", METRICS_PREFIX),
        "service" => service.to_string(),
        "state" => to_state.to_string()
    )
    .increment(1);
}

pub fn record_retry(service: &str) {
    counter!(
        format!("{}_upstream_retries_total", METRICS_PREFIX),
        "service" => service.to_string()
    )
    .increment(1);
}

pub fn record_bm25_rebuild(kb_id: &str) {
    counter!(
        format!("{}_bm25_rebuild_total", METRICS_PREFIX),
        "kb_id" => kb_id.to_string()
    )
    .increment(1);
}

pub fn record_rewrite(degraded: bool) {
    counter!(format!("{}_rewrite_total", METRICS_PREFIX)).increment(1);
    if degraded {
        counter!(format!("{}_rewrite_degraded_total", METRICS_PREFIX)).increment(1);
    }
}

pub fn record_cache(hit: bool, cache_name: &str) {
    let name = if hit { "hits" } else { "misses" };
    counter!(
        format!("{}_cache_{}_total", METRICS_PREFIX, name),
        "cache" => cache_name.to_string()
    )
    .increment(1);
}
