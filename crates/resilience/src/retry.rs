//! Exponential backoff with full jitter, built on `backoff` the same way
//! the rest of this workspace retries SQS calls: `ExponentialBackoff` plus
//! `backoff::future::retry`, classifying each error as `Permanent` or
//! `Transient` via [`RetrievalError::retryable`].
//!
//! `delay_i = min(max_delay, base * backoff_exponent^i)`, jittered by
//! `uniform(-jitter * delay_i, +jitter * delay_i)` — `backoff`'s
//! `randomization_factor` implements exactly this jitter shape.

use backoff::backoff::Backoff as _;
use backoff::{Error as BackoffError, ExponentialBackoff};
use kbretrieve_common::config::ServiceResilienceConfig;
use kbretrieve_common::errors::{RetrievalError, Result};
use kbretrieve_common::metrics::record_retry;
use std::future::Future;
use std::time::Duration;

fn build_backoff(config: &ServiceResilienceConfig) -> ExponentialBackoff {
    ExponentialBackoff {
        initial_interval: Duration::from_millis(config.base_delay_ms),
        max_interval: Duration::from_millis(config.max_delay_ms),
        multiplier: config.backoff_exponent,
        randomization_factor: config.jitter,
        max_elapsed_time: None,
        ..ExponentialBackoff::default()
    }
}

/// Run `f` with retry according to `config`, stopping as soon as the error
/// is not [`RetrievalError::retryable`], or once `max_retries` attempts have
/// been made. Never retries a circuit-open rejection — that's the caller's
/// signal to fail over or degrade.
pub async fn with_retry<T, F, Fut>(service: &str, config: &ServiceResilienceConfig, mut f: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut backoff = build_backoff(config);
    let mut attempts = 0u32;

    loop {
        match f().await {
            Ok(value) => return Ok(value),
            Err(err) if err.retryable() && attempts < config.max_retries => {
                let delay = backoff.next_backoff().unwrap_or(Duration::from_millis(config.max_delay_ms));
                record_retry(service);
                tracing::warn!(service, attempts, delay_ms = delay.as_millis() as u64, error = %err, "retrying after transient failure");
                tokio::time::sleep(delay).await;
                attempts += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Classify a [`RetrievalError`] for `backoff::future::retry`-style callers
/// that want the `Permanent`/`Transient` split directly.
pub fn classify(err: RetrievalError) -> BackoffError<RetrievalError> {
    if err.retryable() {
        BackoffError::transient(err)
    } else {
        BackoffError::permanent(err)
    }
}

/// Wrap a future with a hard timeout, converting elapsed into
/// [`RetrievalError::UpstreamTransient`] so it composes with `with_retry`.
pub async fn with_timeout<T, Fut>(service: &str, timeout: Duration, fut: Fut) -> Result<T>
where
    Fut: Future<Output = Result<T>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(RetrievalError::UpstreamTransient {
            service: service.to_string(),
            message: format!("call timed out after {}ms", timeout.as_millis()),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn test_config() -> ServiceResilienceConfig {
        ServiceResilienceConfig {
            max_retries: 3,
            base_delay_ms: 1,
            max_delay_ms: 10,
            backoff_exponent: 2.0,
            jitter: 0.1,
            ..ServiceResilienceConfig::default()
        }
    }

    #[tokio::test]
    async fn succeeds_without_retry_on_first_try() {
        let calls = AtomicU32::new(0);
        let result: Result<u32> = with_retry("embedding", &test_config(), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok(42) }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_transient_errors_up_to_max_retries() {
        let calls = AtomicU32::new(0);
        let result: Result<u32> = with_retry("embedding", &test_config(), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                Err(RetrievalError::UpstreamTransient {
                    service: "embedding".into(),
                    message: "timeout".into(),
                })
            }
        })
        .await;
        assert!(result.is_err());
        // 1 initial attempt + 3 retries = 4 calls
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn never_retries_permanent_errors() {
        let calls = AtomicU32::new(0);
        let result: Result<u32> = with_retry("embedding", &test_config(), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                Err(RetrievalError::UpstreamPermanent {
                    service: "embedding".into(),
                    message: "bad request".into(),
                })
            }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn timeout_converts_to_upstream_transient() {
        let result: Result<()> = with_timeout("embedding", Duration::from_millis(5), async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(())
        })
        .await;
        assert!(matches!(result, Err(RetrievalError::UpstreamTransient { .. })));
    }
}
