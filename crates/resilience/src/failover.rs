//! Static-priority provider failover.
//!
//! Used by the query rewriter to pick among configured LLM providers: walk
//! `provider_priority` in order, skip any whose circuit breaker is open,
//! and call the first that's left. No dynamic health scoring, no plugin
//! registry — a fixed list, per SPEC_FULL.md §9.

use crate::circuit::CircuitBreaker;
use kbretrieve_common::errors::{RetrievalError, Result};
use std::collections::HashMap;
use std::sync::Arc;

/// Resolves a provider name to its resilience-wrapped handle.
pub struct Failover<T: ?Sized> {
    priority: Vec<String>,
    providers: HashMap<String, (Arc<T>, Arc<CircuitBreaker>)>,
}

impl<T: ?Sized> Failover<T> {
    pub fn new(priority: Vec<String>) -> Self {
        Self {
            priority,
            providers: HashMap::new(),
        }
    }

    pub fn register(&mut self, name: impl Into<String>, provider: Arc<T>, circuit: Arc<CircuitBreaker>) {
        self.providers.insert(name.into(), (provider, circuit));
    }

    /// First provider in priority order whose circuit is not open.
    /// Returns `ServiceUnavailable` if every configured provider is
    /// open-circuited.
    pub async fn pick(&self) -> Result<(Arc<T>, Arc<CircuitBreaker>)> {
        for name in &self.priority {
            let Some((provider, circuit)) = self.providers.get(name) else {
                continue;
            };
            if circuit.try_acquire().await.is_ok() {
                // the ticket itself is discarded here; callers acquire their
                // own admission right before the call so success/failure
                // accounting happens against the actual attempt.
                return Ok((provider.clone(), circuit.clone()));
            }
        }
        Err(RetrievalError::ServiceUnavailable {
            message: "all providers are circuit-open".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kbretrieve_common::config::ServiceResilienceConfig;

    fn fast_config() -> ServiceResilienceConfig {
        ServiceResilienceConfig {
            failure_threshold: 1,
            recovery_timeout_secs: 3600,
            ..ServiceResilienceConfig::default()
        }
    }

    #[tokio::test]
    async fn skips_open_circuit_and_picks_next() {
        let mut failover: Failover<&'static str> = Failover::new(vec!["primary".into(), "secondary".into()]);
        let primary_circuit = Arc::new(CircuitBreaker::new("primary", fast_config()));
        let secondary_circuit = Arc::new(CircuitBreaker::new("secondary", fast_config()));

        let adm = primary_circuit.try_acquire().await.unwrap();
        adm.record_failure().await;
        assert_eq!(
            primary_circuit.state().await,
            kbretrieve_types::CircuitState::Open
        );

        failover.register("primary", Arc::new("primary-provider"), primary_circuit);
        failover.register("secondary", Arc::new("secondary-provider"), secondary_circuit);

        let (provider, _circuit) = failover.pick().await.unwrap();
        assert_eq!(*provider, "secondary-provider");
    }

    #[tokio::test]
    async fn all_open_returns_service_unavailable() {
        let mut failover: Failover<&'static str> = Failover::new(vec!["primary".into()]);
        let circuit = Arc::new(CircuitBreaker::new("primary", fast_config()));
        let adm = circuit.try_acquire().await.unwrap();
        adm.record_failure().await;
        failover.register("primary", Arc::new("primary-provider"), circuit);

        assert!(failover.pick().await.is_err());
    }
}
