//! Multi-turn query rewriter: pronoun resolution and query expansion
//! over an LLM provider, wrapped in the resilience layer.

pub mod prompt;
pub mod rewrite;
pub mod similarity;

pub use rewrite::Rewriter;
