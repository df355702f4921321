//! Trait contracts for the retrieval core's external collaborators.
//!
//! Every concrete backend (a real vector database, a real LLM API, the
//! tenant's SQL store) lives outside this workspace. These traits are the
//! seam: the retrieval core is built and tested entirely against the
//! in-memory fakes in [`mock`].

pub mod embedder;
pub mod llm;
pub mod mock;
pub mod reranker;
pub mod repository;
pub mod vector_store;

pub use embedder::Embedder;
pub use llm::LlmProvider;
pub use reranker::Reranker;
pub use repository::Repository;
pub use vector_store::VectorStore;
