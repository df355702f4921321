//! Adapts a [`Failover`] provider pool into a single [`LlmProvider`] so the
//! rewriter's single-provider call path gets multi-provider failover for
//! free.

use kbretrieve_common::errors::Result;
use kbretrieve_interfaces::LlmProvider;
use kbretrieve_resilience::Failover;

pub struct FailoverLlmProvider {
    failover: Failover<dyn LlmProvider>,
}

impl FailoverLlmProvider {
    pub fn new(failover: Failover<dyn LlmProvider>) -> Self {
        Self { failover }
    }
}

#[async_trait::async_trait]
impl LlmProvider for FailoverLlmProvider {
    fn name(&self) -> &str {
        "failover"
    }

    async fn complete(&self, prompt: &str) -> Result<String> {
        let (provider, circuit) = self.failover.pick().await?;
        let admission = circuit.try_acquire().await?;
        match provider.complete(prompt).await {
            Ok(response) => {
                admission.record_success().await;
                Ok(response)
            }
            Err(err) => {
                if err.counts_against_circuit() {
                    admission.record_failure().await;
                }
                Err(err)
            }
        }
    }
}
