//! Per-service circuit breaker.
//!
//! Three states, transitioned lazily (on the next call attempt, never on a
//! background timer):
//!
//! - `Closed`: calls pass through; `failure_threshold` consecutive failures
//!   (consulting [`kbretrieve_common::errors::RetrievalError::counts_against_circuit`])
//!   trips it to `Open`.
//! - `Open`: calls are rejected immediately with
//!   [`RetrievalError::CircuitOpen`] until `recovery_timeout` has elapsed
//!   since the trip, at which point the *next* call attempt transitions to
//!   `HalfOpen` rather than a timer firing on its own.
//! - `HalfOpen`: up to `half_open_max_concurrent` calls are admitted as
//!   probes; `success_threshold` consecutive successes closes the circuit
//!   again, any failure reopens it.

use kbretrieve_common::config::ServiceResilienceConfig;
use kbretrieve_common::errors::{RetrievalError, Result};
use kbretrieve_common::metrics::record_circuit_transition;
use kbretrieve_types::CircuitState;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    opened_at: Option<Instant>,
    half_open_in_flight: u32,
}

/// A single service's circuit breaker. One instance lives per upstream
/// collaborator (embedding, vector_store, rerank, each LLM provider) inside
/// the service registry.
pub struct CircuitBreaker {
    service: String,
    config: ServiceResilienceConfig,
    inner: Mutex<Inner>,
    // cheap lock-free counter for observability without taking the mutex
    trips_total: AtomicU64,
}

/// RAII-ish admission ticket. Holds an `Arc` clone of its breaker so it can
/// release a half-open probe slot on drop without borrowing anything.
/// Callers are still expected to call `record_success`/`record_failure`
/// explicitly — an unsettled drop only prevents permanently leaking a
/// half-open concurrency slot.
pub struct Admission {
    breaker: Arc<CircuitBreaker>,
    was_half_open_probe: bool,
    settled: bool,
}

impl Admission {
    pub async fn record_success(mut self) {
        self.settled = true;
        self.breaker.clone().on_success(self.was_half_open_probe).await;
    }

    pub async fn record_failure(mut self) {
        self.settled = true;
        self.breaker.clone().on_failure(self.was_half_open_probe).await;
    }
}

impl Drop for Admission {
    fn drop(&mut self) {
        if !self.settled && self.was_half_open_probe {
            let breaker = self.breaker.clone();
            tokio::spawn(async move {
                let mut inner = breaker.inner.lock().await;
                inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
            });
        }
    }
}

impl CircuitBreaker {
    pub fn new(service: impl Into<String>, config: ServiceResilienceConfig) -> Self {
        Self {
            service: service.into(),
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                consecutive_successes: 0,
                opened_at: None,
                half_open_in_flight: 0,
            }),
            trips_total: AtomicU64::new(0),
        }
    }

    pub fn service_name(&self) -> &str {
        &self.service
    }

    pub fn trips_total(&self) -> u64 {
        self.trips_total.load(Ordering::Relaxed)
    }

    pub async fn state(&self) -> CircuitState {
        self.inner.lock().await.state
    }

    /// Attempt to acquire an admission ticket for a call. Returns
    /// `CircuitOpen` if the circuit is open and the recovery timeout has not
    /// yet elapsed, or if it's half-open and already at its concurrent probe
    /// limit.
    pub async fn try_acquire(self: &Arc<Self>) -> Result<Admission> {
        let mut inner = self.inner.lock().await;

        if inner.state == CircuitState::Open {
            let elapsed = inner.opened_at.map(|t| t.elapsed()).unwrap_or(Duration::ZERO);
            if elapsed >= self.config.recovery_timeout() {
                inner.state = CircuitState::HalfOpen;
                inner.consecutive_successes = 0;
                inner.half_open_in_flight = 0;
                record_circuit_transition(&self.service, "half_open");
                tracing::info!(service = %self.service, "circuit transitioning to half-open");
            } else {
                return Err(RetrievalError::CircuitOpen {
                    service: self.service.clone(),
                });
            }
        }

        let was_half_open_probe = inner.state == CircuitState::HalfOpen;
        if was_half_open_probe {
            if inner.half_open_in_flight >= self.config.half_open_max_concurrent {
                return Err(RetrievalError::CircuitOpen {
                    service: self.service.clone(),
                });
            }
            inner.half_open_in_flight += 1;
        }

        Ok(Admission {
            breaker: self.clone(),
            was_half_open_probe,
            settled: false,
        })
    }

    async fn on_success(self: Arc<Self>, was_half_open_probe: bool) {
        let mut inner = self.inner.lock().await;
        inner.consecutive_failures = 0;
        if was_half_open_probe {
            inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
            inner.consecutive_successes += 1;
            if inner.state == CircuitState::HalfOpen
                && inner.consecutive_successes >= self.config.success_threshold
            {
                inner.state = CircuitState::Closed;
                inner.consecutive_successes = 0;
                record_circuit_transition(&self.service, "closed");
                tracing::info!(service = %self.service, "circuit closed");
            }
        }
    }

    async fn on_failure(self: Arc<Self>, was_half_open_probe: bool) {
        let mut inner = self.inner.lock().await;
        if was_half_open_probe {
            inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
            self.trip(&mut inner);
            return;
        }

        inner.consecutive_failures += 1;
        if inner.state == CircuitState::Closed && inner.consecutive_failures >= self.config.failure_threshold {
            self.trip(&mut inner);
        }
    }

    fn trip(&self, inner: &mut Inner) {
        inner.state = CircuitState::Open;
        inner.opened_at = Some(Instant::now());
        inner.consecutive_failures = 0;
        inner.consecutive_successes = 0;
        self.trips_total.fetch_add(1, Ordering::Relaxed);
        record_circuit_transition(&self.service, "open");
        tracing::warn!(service = %self.service, "circuit opened");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_config() -> ServiceResilienceConfig {
        ServiceResilienceConfig {
            failure_threshold: 3,
            success_threshold: 2,
            recovery_timeout_secs: 0,
            half_open_max_concurrent: 1,
            ..ServiceResilienceConfig::default()
        }
    }

    #[tokio::test]
    async fn trips_after_failure_threshold() {
        let cb = Arc::new(CircuitBreaker::new("embedding", fast_config()));
        for _ in 0..3 {
            let adm = cb.try_acquire().await.unwrap();
            adm.record_failure().await;
        }
        assert_eq!(cb.state().await, CircuitState::Open);
    }

    #[tokio::test]
    async fn open_circuit_rejects_immediately_then_transitions_lazily() {
        let cb = Arc::new(CircuitBreaker::new("embedding", fast_config()));
        for _ in 0..3 {
            let adm = cb.try_acquire().await.unwrap();
            adm.record_failure().await;
        }
        assert_eq!(cb.state().await, CircuitState::Open);
        // recovery_timeout_secs = 0, so the *next* attempt flips to half-open.
        let adm = cb.try_acquire().await.unwrap();
        assert_eq!(cb.state().await, CircuitState::HalfOpen);
        adm.record_success().await;
    }

    #[tokio::test]
    async fn half_open_closes_after_success_threshold() {
        let cb = Arc::new(CircuitBreaker::new("embedding", fast_config()));
        for _ in 0..3 {
            let adm = cb.try_acquire().await.unwrap();
            adm.record_failure().await;
        }
        for _ in 0..2 {
            let adm = cb.try_acquire().await.unwrap();
            adm.record_success().await;
        }
        assert_eq!(cb.state().await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn half_open_failure_reopens() {
        let cb = Arc::new(CircuitBreaker::new("embedding", fast_config()));
        for _ in 0..3 {
            let adm = cb.try_acquire().await.unwrap();
            adm.record_failure().await;
        }
        let adm = cb.try_acquire().await.unwrap();
        adm.record_failure().await;
        assert_eq!(cb.state().await, CircuitState::Open);
    }

    #[tokio::test]
    async fn half_open_admits_only_max_concurrent_probes() {
        let cb = Arc::new(CircuitBreaker::new("embedding", fast_config()));
        for _ in 0..3 {
            let adm = cb.try_acquire().await.unwrap();
            adm.record_failure().await;
        }
        let _first_probe = cb.try_acquire().await.unwrap();
        assert!(cb.try_acquire().await.is_err());
    }
}
