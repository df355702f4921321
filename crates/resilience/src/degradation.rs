//! Degradation manager: the last resort when retry and failover are both
//! exhausted. Produces a labeled fallback instead of propagating the error,
//! for call sites that have a safe default (see the retrieval engine's
//! sparse-only and truncation fallbacks).

use kbretrieve_common::errors::RetrievalError;
use tracing::warn;

/// Outcome of a degraded call: either the real value, or a fallback with a
/// record of why.
pub enum Degraded<T> {
    Ok(T),
    Fallback { value: T, reason: String },
}

impl<T> Degraded<T> {
    pub fn into_value(self) -> T {
        match self {
            Degraded::Ok(v) => v,
            Degraded::Fallback { value, .. } => value,
        }
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self, Degraded::Fallback { .. })
    }
}

/// Run `primary`; on failure, log the degradation and return `fallback()`
/// wrapped so callers can tell whether it was genuine.
pub async fn with_fallback<T, Fut, FbFut>(
    service: &str,
    primary: impl FnOnce() -> Fut,
    fallback: impl FnOnce() -> FbFut,
) -> Degraded<T>
where
    Fut: std::future::Future<Output = Result<T, RetrievalError>>,
    FbFut: std::future::Future<Output = T>,
{
    match primary().await {
        Ok(value) => Degraded::Ok(value),
        Err(err) => {
            warn!(service, error = %err, "degrading to fallback");
            Degraded::Fallback {
                value: fallback().await,
                reason: err.to_string(),
            }
        }
    }
}
