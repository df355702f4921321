//! Relevance scoring, citation extraction, and extractive compression for
//! fused search hits.

pub mod attribution;
pub mod compression;
pub mod sentence;

pub use attribution::{confidence, extract_citation, score_relevance, Attribution, Citation, SourceReference};
pub use compression::Compression;
