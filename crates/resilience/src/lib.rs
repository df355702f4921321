//! Resilience layer: every external collaborator call in the retrieval
//! core is wrapped the same way, in this order:
//!
//! 1. Circuit admission — reject immediately if the service is open.
//! 2. Retry loop with full-jitter exponential backoff, bounded by a
//!    per-call timeout.
//! 3. Circuit accounting — record the attempt's outcome.
//!
//! [`call`] composes all three; callers that need provider failover (the
//! rewriter, across LLM providers) layer [`failover::Failover`] on top.

pub mod circuit;
pub mod degradation;
pub mod failover;
pub mod retry;

pub use circuit::CircuitBreaker;
pub use degradation::Degraded;
pub use failover::Failover;

use kbretrieve_common::config::ServiceResilienceConfig;
use kbretrieve_common::errors::Result;
use std::future::Future;
use std::sync::Arc;

/// Run `f` through circuit admission, retry-with-backoff, and circuit
/// accounting. `f` is retried in place; each attempt is individually
/// timed out by `config.call_timeout`.
pub async fn call<T, F, Fut>(
    service: &str,
    breaker: &Arc<CircuitBreaker>,
    config: &ServiceResilienceConfig,
    mut f: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let admission = breaker.try_acquire().await?;

    let result = retry::with_retry(service, config, || {
        retry::with_timeout(service, config.call_timeout(), f())
    })
    .await;

    match &result {
        Ok(_) => admission.record_success().await,
        Err(err) if err.counts_against_circuit() => admission.record_failure().await,
        Err(_) => drop(admission),
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use kbretrieve_common::errors::RetrievalError;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn config() -> ServiceResilienceConfig {
        ServiceResilienceConfig {
            failure_threshold: 2,
            max_retries: 1,
            base_delay_ms: 1,
            max_delay_ms: 2,
            call_timeout_ms: 1000,
            ..ServiceResilienceConfig::default()
        }
    }

    #[tokio::test]
    async fn success_keeps_circuit_closed() {
        let breaker = Arc::new(CircuitBreaker::new("embedding", config()));
        let result: Result<u32> = call("embedding", &breaker, &config(), || async { Ok(7) }).await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(breaker.state().await, kbretrieve_types::CircuitState::Closed);
    }

    #[tokio::test]
    async fn repeated_transient_failures_trip_the_circuit() {
        let breaker = Arc::new(CircuitBreaker::new("embedding", config()));
        let calls = AtomicU32::new(0);
        for _ in 0..2 {
            let _ = call::<u32, _, _>("embedding", &breaker, &config(), || {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(RetrievalError::UpstreamTransient {
                        service: "embedding".into(),
                        message: "boom".into(),
                    })
                }
            })
            .await;
        }
        assert_eq!(breaker.state().await, kbretrieve_types::CircuitState::Open);

        // third call is rejected by the breaker without invoking f again.
        let before = calls.load(Ordering::SeqCst);
        let result: Result<u32> = call("embedding", &breaker, &config(), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok(1) }
        })
        .await;
        assert!(matches!(result, Err(RetrievalError::CircuitOpen { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), before);
    }
}
