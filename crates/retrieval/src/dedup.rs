//! Cross-knowledge-base deduplication: the same content can be ingested
//! into more than one KB (shared handbooks, boilerplate policies, ...). A
//! fused result set keeps only the highest-scoring hit per distinct
//! `(document_id, chunk_index)` identity — two physically distinct chunks
//! that happen to share text are not deduplicated.

use kbretrieve_types::SearchHit;
use std::collections::HashMap;

/// Drop all but the highest-scoring hit sharing identical
/// `(document_id, chunk_index)`, preserving the input's relative order
/// among survivors.
pub fn dedup_by_identity(hits: Vec<SearchHit>) -> Vec<SearchHit> {
    let mut best: HashMap<(String, u32), SearchHit> = HashMap::new();
    for hit in hits {
        let key = (hit.document_id.as_str().to_string(), hit.chunk_index);
        match best.get(&key) {
            Some(existing) if existing.score >= hit.score => {}
            _ => {
                best.insert(key, hit);
            }
        }
    }
    let mut deduped: Vec<SearchHit> = best.into_values().collect();
    deduped.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.document_id.as_str().cmp(b.document_id.as_str()))
            .then_with(|| a.chunk_id.as_str().cmp(b.chunk_id.as_str()))
    });
    deduped
}

#[cfg(test)]
mod tests {
    use super::*;
    use kbretrieve_types::{ChunkId, DocumentId, KbId};

    fn hit(chunk_id: &str, document_id: &str, chunk_index: u32, kb_id: &str, content: &str, score: f32) -> SearchHit {
        SearchHit {
            chunk_id: ChunkId::from(chunk_id),
            document_id: DocumentId::from(document_id),
            kb_id: KbId::from(kb_id),
            chunk_index,
            content: content.to_string(),
            score,
            dense_score: None,
            sparse_score: None,
            rerank_score: None,
            page: None,
            section: None,
            degraded: false,
        }
    }

    #[test]
    fn keeps_the_higher_scoring_duplicate() {
        let hits = vec![
            hit("c1", "d1", 0, "kb-a", "shared text", 0.4),
            hit("c2", "d1", 0, "kb-b", "shared text", 0.9),
        ];
        let result = dedup_by_identity(hits);
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].chunk_id.as_str(), "c2");
    }

    #[test]
    fn distinct_document_chunk_identity_is_untouched_even_with_identical_text() {
        let hits = vec![
            hit("c1", "d1", 0, "kb-a", "shared text", 0.4),
            hit("c2", "d2", 0, "kb-b", "shared text", 0.9),
        ];
        let result = dedup_by_identity(hits);
        assert_eq!(result.len(), 2);
    }

    #[test]
    fn distinct_chunk_index_within_the_same_document_is_untouched() {
        let hits = vec![
            hit("c1", "d1", 0, "kb-a", "alpha", 0.4),
            hit("c2", "d1", 1, "kb-a", "beta", 0.9),
        ];
        let result = dedup_by_identity(hits);
        assert_eq!(result.len(), 2);
    }

    #[test]
    fn ties_break_by_document_then_chunk_id() {
        let hits = vec![hit("c2", "d1", 0, "kb-a", "alpha", 0.5), hit("c1", "d1", 1, "kb-a", "beta", 0.5)];
        let result = dedup_by_identity(hits);
        assert_eq!(result[0].chunk_id.as_str(), "c2");
    }
}
