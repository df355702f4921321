//! In-memory fakes for every external collaborator trait.
//!
//! These are what the rest of the workspace is built and tested against
//! (see SPEC_FULL.md §6). They are deliberately simple: deterministic,
//! synchronous where possible, and easy to force into a failure mode from a
//! test.

use crate::embedder::Embedder;
use crate::llm::LlmProvider;
use crate::reranker::{RerankCandidate, Reranker, RerankedHit};
use crate::repository::Repository;
use crate::vector_store::{VectorFilter, VectorMatch, VectorRecord, VectorStore};
use kbretrieve_common::errors::{RetrievalError, Result};
use kbretrieve_types::{Chunk, DocumentId, DocumentStatus, KbId, KnowledgeBase, VectorId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;

/// Deterministic embedder: hashes each word into a fixed-size vector so the
/// same text always embeds the same way, and similar texts (sharing words)
/// produce similar vectors.
pub struct MockEmbedder {
    dim: usize,
    model: String,
    pub fail_next: AtomicBool,
}

impl MockEmbedder {
    pub fn new(dim: usize) -> Self {
        Self {
            dim,
            model: "mock-embedder".to_string(),
            fail_next: AtomicBool::new(false),
        }
    }

    fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; self.dim];
        for word in text.to_lowercase().split_whitespace() {
            let mut hash: u64 = 1469598103934665603;
            for b in word.bytes() {
                hash ^= b as u64;
                hash = hash.wrapping_mul(1099511628211);
            }
            v[(hash as usize) % self.dim] += 1.0;
        }
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in &mut v {
                *x /= norm;
            }
        }
        v
    }
}

#[async_trait::async_trait]
impl Embedder for MockEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(RetrievalError::UpstreamTransient {
                service: "embedding".into(),
                message: "forced failure".into(),
            });
        }
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }

    fn dimension(&self) -> usize {
        self.dim
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

/// Brute-force cosine search over an in-memory map, scoped per KB.
#[derive(Default)]
pub struct MockVectorStore {
    data: Mutex<HashMap<String, Vec<VectorRecord>>>,
    pub fail_next: AtomicBool,
}

impl MockVectorStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 {
        0.0
    } else {
        dot / (na * nb)
    }
}

fn matches_filter(metadata: &HashMap<String, serde_json::Value>, filter: &VectorFilter) -> bool {
    filter.iter().all(|(k, v)| metadata.get(k) == Some(v))
}

#[async_trait::async_trait]
impl VectorStore for MockVectorStore {
    async fn create_collection(&self, name: &str, _dim: usize) -> Result<()> {
        self.data.lock().unwrap().entry(name.to_string()).or_default();
        Ok(())
    }

    async fn delete_collection(&self, name: &str) -> Result<()> {
        self.data.lock().unwrap().remove(name);
        Ok(())
    }

    async fn search(
        &self,
        kb_id: &KbId,
        query: &[f32],
        top_k: usize,
        filter: Option<&VectorFilter>,
    ) -> Result<Vec<VectorMatch>> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(RetrievalError::UpstreamTransient {
                service: "vector_store".into(),
                message: "forced failure".into(),
            });
        }
        let data = self.data.lock().unwrap();
        let mut scored: Vec<VectorMatch> = data
            .get(kb_id.as_str())
            .map(|records| {
                records
                    .iter()
                    .filter(|r| filter.map(|f| matches_filter(&r.metadata, f)).unwrap_or(true))
                    .map(|r| VectorMatch {
                        vector_id: r.vector_id.clone(),
                        score: cosine(query, &r.embedding),
                        metadata: r.metadata.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default();
        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(top_k);
        Ok(scored)
    }

    async fn upsert(&self, kb_id: &KbId, records: Vec<VectorRecord>) -> Result<()> {
        let mut data = self.data.lock().unwrap();
        let entry = data.entry(kb_id.as_str().to_string()).or_default();
        for record in records {
            entry.retain(|r| r.vector_id != record.vector_id);
            entry.push(record);
        }
        Ok(())
    }

    async fn delete(&self, kb_id: &KbId, vector_ids: &[VectorId]) -> Result<()> {
        let mut data = self.data.lock().unwrap();
        if let Some(entry) = data.get_mut(kb_id.as_str()) {
            entry.retain(|r| !vector_ids.contains(&r.vector_id));
        }
        Ok(())
    }
}

/// Reranker that scores by fraction of query words present in the candidate.
#[derive(Default)]
pub struct MockReranker {
    pub fail_next: AtomicBool,
}

#[async_trait::async_trait]
impl Reranker for MockReranker {
    async fn rerank(&self, query: &str, candidates: Vec<RerankCandidate>) -> Result<Vec<RerankedHit>> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(RetrievalError::UpstreamTransient {
                service: "rerank".into(),
                message: "forced failure".into(),
            });
        }
        let query_words: Vec<String> = query.to_lowercase().split_whitespace().map(String::from).collect();
        let mut hits: Vec<RerankedHit> = candidates
            .into_iter()
            .map(|c| {
                let content = c.content.to_lowercase();
                let matches = query_words.iter().filter(|w| content.contains(w.as_str())).count();
                let score = if query_words.is_empty() {
                    0.0
                } else {
                    matches as f32 / query_words.len() as f32
                };
                RerankedHit {
                    chunk_id: c.chunk_id,
                    score,
                }
            })
            .collect();
        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        Ok(hits)
    }
}

/// Canned-response LLM: echoes the prompt back wrapped in the JSON shape the
/// rewriter expects, unless told to fail.
pub struct MockLlmProvider {
    name: String,
    pub fail_next: AtomicBool,
    pub canned_response: Mutex<Option<String>>,
}

impl MockLlmProvider {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            fail_next: AtomicBool::new(false),
            canned_response: Mutex::new(None),
        }
    }
}

#[async_trait::async_trait]
impl LlmProvider for MockLlmProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(&self, prompt: &str) -> Result<String> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(RetrievalError::UpstreamTransient {
                service: "llm".into(),
                message: "forced failure".into(),
            });
        }
        if let Some(resp) = self.canned_response.lock().unwrap().clone() {
            return Ok(resp);
        }
        Ok(format!(
            r#"{{"rewritten": {:?}, "variants": [], "confidence": 0.8}}"#,
            prompt
        ))
    }
}

#[derive(Default)]
pub struct MockRepository {
    kbs: Mutex<HashMap<String, KnowledgeBase>>,
    chunks: Mutex<HashMap<String, Vec<Chunk>>>,
    statuses: Mutex<HashMap<String, DocumentStatus>>,
    next_vector_id: AtomicU32,
}

impl MockRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_kb(&self, kb: KnowledgeBase) {
        self.kbs.lock().unwrap().insert(kb.id.as_str().to_string(), kb);
    }

    pub fn seed_chunks(&self, kb_id: &KbId, chunks: Vec<Chunk>) {
        self.chunks.lock().unwrap().insert(kb_id.as_str().to_string(), chunks);
    }
}

#[async_trait::async_trait]
impl Repository for MockRepository {
    async fn get_kb(&self, kb_id: &KbId) -> Result<Option<KnowledgeBase>> {
        Ok(self.kbs.lock().unwrap().get(kb_id.as_str()).cloned())
    }

    async fn list_active_kb_ids(&self) -> Result<Vec<KbId>> {
        Ok(self
            .kbs
            .lock()
            .unwrap()
            .values()
            .filter(|kb| kb.active)
            .map(|kb| kb.id.clone())
            .collect())
    }

    async fn update_document_status(&self, document_id: &DocumentId, status: DocumentStatus) -> Result<()> {
        self.statuses
            .lock()
            .unwrap()
            .insert(document_id.as_str().to_string(), status);
        Ok(())
    }

    async fn insert_chunks(&self, chunks: Vec<Chunk>) -> Result<Vec<VectorId>> {
        let ids: Vec<VectorId> = chunks
            .iter()
            .map(|_| VectorId::from(format!("v{}", self.next_vector_id.fetch_add(1, Ordering::SeqCst))))
            .collect();
        let mut by_kb = self.chunks.lock().unwrap();
        for chunk in chunks {
            by_kb.entry(chunk.kb_id.as_str().to_string()).or_default().push(chunk);
        }
        Ok(ids)
    }

    async fn list_chunks(&self, kb_id: &KbId) -> Result<Vec<Chunk>> {
        Ok(self.chunks.lock().unwrap().get(kb_id.as_str()).cloned().unwrap_or_default())
    }

    async fn delete_chunks_by_document(&self, document_id: &DocumentId) -> Result<Vec<VectorId>> {
        let mut by_kb = self.chunks.lock().unwrap();
        let mut removed_ids = Vec::new();
        for chunks in by_kb.values_mut() {
            chunks.retain(|c| {
                let keep = &c.document_id != document_id;
                if !keep {
                    if let Some(vid) = &c.vector_id {
                        removed_ids.push(vid.clone());
                    }
                }
                keep
            });
        }
        Ok(removed_ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_embedder_is_deterministic() {
        let e = MockEmbedder::new(32);
        let a = e.embed(&["hello world".to_string()]).await.unwrap();
        let b = e.embed(&["hello world".to_string()]).await.unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn mock_vector_store_respects_kb_scoping() {
        let store = MockVectorStore::new();
        let kb_a = KbId::from("a");
        let kb_b = KbId::from("b");
        store
            .upsert(
                &kb_a,
                vec![VectorRecord {
                    vector_id: VectorId::from("v1"),
                    embedding: vec![1.0, 0.0],
                    metadata: HashMap::new(),
                }],
            )
            .await
            .unwrap();
        let hits = store.search(&kb_b, &[1.0, 0.0], 10, None).await.unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn mock_vector_store_filters_by_metadata() {
        let store = MockVectorStore::new();
        let kb = KbId::from("a");
        let mut tagged = HashMap::new();
        tagged.insert("lang".to_string(), serde_json::json!("en"));
        store
            .upsert(
                &kb,
                vec![
                    VectorRecord {
                        vector_id: VectorId::from("v1"),
                        embedding: vec![1.0, 0.0],
                        metadata: tagged.clone(),
                    },
                    VectorRecord {
                        vector_id: VectorId::from("v2"),
                        embedding: vec![1.0, 0.0],
                        metadata: HashMap::new(),
                    },
                ],
            )
            .await
            .unwrap();
        let hits = store.search(&kb, &[1.0, 0.0], 10, Some(&tagged)).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].vector_id.as_str(), "v1");
    }

    #[tokio::test]
    async fn delete_collection_drops_its_vectors() {
        let store = MockVectorStore::new();
        let kb = KbId::from("a");
        store.create_collection("a", 2).await.unwrap();
        store
            .upsert(
                &kb,
                vec![VectorRecord {
                    vector_id: VectorId::from("v1"),
                    embedding: vec![1.0, 0.0],
                    metadata: HashMap::new(),
                }],
            )
            .await
            .unwrap();
        store.delete_collection("a").await.unwrap();
        let hits = store.search(&kb, &[1.0, 0.0], 10, None).await.unwrap();
        assert!(hits.is_empty());
    }
}
