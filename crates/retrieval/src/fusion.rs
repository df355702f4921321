//! Score fusion: min-max normalize each pass independently, then combine
//! with an `alpha`-weighted sum. Replaces reciprocal rank fusion — scores
//! from both passes already carry useful magnitude (cosine similarity,
//! BM25), so blending normalized scores keeps more signal than collapsing
//! everything to rank position.

use kbretrieve_types::ChunkId;
use std::collections::HashMap;

/// Min-max normalize `scores` to `[0, 1]`. A single-element or constant-score
/// set normalizes to `1.0` for every entry (nothing to discriminate).
fn min_max_normalize(scores: &[(ChunkId, f32)]) -> HashMap<ChunkId, f32> {
    if scores.is_empty() {
        return HashMap::new();
    }
    let min = scores.iter().map(|(_, s)| *s).fold(f32::INFINITY, f32::min);
    let max = scores.iter().map(|(_, s)| *s).fold(f32::NEG_INFINITY, f32::max);
    let range = max - min;
    scores
        .iter()
        .map(|(id, s)| {
            let normalized = if range > f32::EPSILON { (s - min) / range } else { 1.0 };
            (id.clone(), normalized)
        })
        .collect()
}

/// A chunk's score contribution from each retrieval pass, prior to fusion.
pub struct FusionInput {
    pub chunk_id: ChunkId,
    pub dense: Option<f32>,
    pub sparse: Option<f32>,
}

/// Fuse per-pass scores into one ranked list:
/// `fused = alpha * normalized_dense + (1 - alpha) * normalized_sparse`,
/// unconditionally — a chunk absent from a pass scores `0` in that term,
/// so at `alpha=1` fusion degenerates to pure dense order and at
/// `alpha=0` to pure sparse order. Result is sorted by fused score
/// descending.
pub fn fuse(dense: &[(ChunkId, f32)], sparse: &[(ChunkId, f32)], alpha: f32) -> Vec<FusionInput> {
    let dense_norm = min_max_normalize(dense);
    let sparse_norm = min_max_normalize(sparse);

    let mut ids: Vec<ChunkId> = Vec::new();
    let mut seen = std::collections::HashSet::new();
    for id in dense_norm.keys().chain(sparse_norm.keys()) {
        if seen.insert(id.clone()) {
            ids.push(id.clone());
        }
    }

    let mut fused: Vec<(FusionInput, f32)> = ids
        .into_iter()
        .map(|id| {
            let d = dense_norm.get(&id).copied();
            let s = sparse_norm.get(&id).copied();
            let input = FusionInput {
                chunk_id: id,
                dense: d,
                sparse: s,
            };
            let score = blended_score(&input, alpha);
            (input, score)
        })
        .collect();

    fused.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    fused.into_iter().map(|(input, _)| input).collect()
}

/// Recover a fused input's blended score using the same formula as [`fuse`],
/// for callers that kept [`FusionInput`]s without the computed score.
/// Missing modalities score `0`, per the fusion formula.
pub fn blended_score(input: &FusionInput, alpha: f32) -> f32 {
    let d = input.dense.unwrap_or(0.0);
    let s = input.sparse.unwrap_or(0.0);
    alpha * d + (1.0 - alpha) * s
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> ChunkId {
        ChunkId::from(s)
    }

    #[test]
    fn dense_only_hit_keeps_its_normalized_score() {
        let dense = vec![(id("a"), 0.8), (id("b"), 0.2)];
        let sparse = vec![];
        let result = fuse(&dense, &sparse, 0.5);
        assert_eq!(result[0].chunk_id, id("a"));
        assert!(result[0].sparse.is_none());
    }

    #[test]
    fn hit_in_both_passes_blends_by_alpha() {
        let dense = vec![(id("a"), 1.0), (id("b"), 0.0)];
        let sparse = vec![(id("a"), 0.0), (id("b"), 1.0)];
        let result = fuse(&dense, &sparse, 0.5);
        let a = result.iter().find(|f| f.chunk_id == id("a")).unwrap();
        assert!((blended_score(a, 0.5) - 0.5).abs() < 1e-6);
    }

    #[test]
    fn alpha_zero_is_sparse_only() {
        let dense = vec![(id("a"), 1.0), (id("b"), 0.0)];
        let sparse = vec![(id("a"), 0.0), (id("b"), 1.0)];
        let result = fuse(&dense, &sparse, 0.0);
        assert_eq!(result[0].chunk_id, id("b"));
    }

    #[test]
    fn empty_passes_produce_no_candidates() {
        let result = fuse(&[], &[], 0.5);
        assert!(result.is_empty());
    }
}
