//! Shared ambient services for the retrieval core.
//!
//! Holds cross-cutting concerns every other crate in the workspace depends
//! on: the error taxonomy, layered configuration, Prometheus metrics
//! descriptions, and the in-process embedding cache.

pub mod cache;
pub mod config;
pub mod errors;
pub mod metrics;

pub use config::AppConfig;
pub use errors::{ErrorCode, Result, RetrievalError};

/// Crate version, surfaced in health/debug output.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
