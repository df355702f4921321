//! Okapi BM25 inverted index for a single knowledge base.
//!
//! `k1 = 1.5, b = 0.75` per the retrieval core's tuning (the wider-ecosystem
//! default is `k1 = 1.2`; this index overrides it).

use kbretrieve_types::ChunkId;
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, Copy)]
pub struct Bm25Params {
    pub k1: f32,
    pub b: f32,
}

impl Default for Bm25Params {
    fn default() -> Self {
        Self { k1: 1.5, b: 0.75 }
    }
}

/// Postings + document statistics for one knowledge base.
///
/// `chunk_ids`/`id_of` give a stable `u32` surrogate per `ChunkId` so
/// postings lists stay compact; the persisted format stores the surrogate
/// and a term table, not `ChunkId` strings, in the posting blocks.
#[derive(Default)]
pub struct InvertedIndex {
    postings: HashMap<String, HashMap<u32, u32>>,
    doc_lengths: HashMap<u32, u32>,
    doc_frequencies: HashMap<String, u32>,
    chunk_ids: Vec<ChunkId>,
    id_of: HashMap<ChunkId, u32>,
    total_length: u64,
    idf_cache: HashMap<String, f32>,
    idf_dirty: bool,
}

impl InvertedIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reconstruct an index from a persisted doc table and postings map
    /// (used by [`crate::persistence::load`]). Recomputes derived state
    /// (`id_of`, `doc_frequencies`, `total_length`) from the raw data.
    pub(crate) fn rehydrate(
        doc_table: Vec<(u32, ChunkId, u32)>,
        postings: HashMap<String, HashMap<u32, u32>>,
    ) -> Self {
        let max_surrogate = doc_table.iter().map(|(s, _, _)| *s).max();
        let mut chunk_ids: Vec<ChunkId> = match max_surrogate {
            Some(max) => (0..=max).map(|_| ChunkId::from("")).collect(),
            None => Vec::new(),
        };
        let mut doc_lengths = HashMap::with_capacity(doc_table.len());
        let mut id_of = HashMap::with_capacity(doc_table.len());
        let mut total_length: u64 = 0;
        for (surrogate, chunk_id, doc_len) in doc_table {
            chunk_ids[surrogate as usize] = chunk_id.clone();
            doc_lengths.insert(surrogate, doc_len);
            id_of.insert(chunk_id, surrogate);
            total_length += doc_len as u64;
        }

        let mut doc_frequencies = HashMap::with_capacity(postings.len());
        for (term, posting_list) in &postings {
            if !posting_list.is_empty() {
                doc_frequencies.insert(term.clone(), posting_list.len() as u32);
            }
        }

        Self {
            postings,
            doc_lengths,
            doc_frequencies,
            chunk_ids,
            id_of,
            total_length,
            idf_cache: HashMap::new(),
            idf_dirty: true,
        }
    }

    pub fn num_docs(&self) -> u32 {
        self.chunk_ids.len() as u32
    }

    pub fn avg_doc_length(&self) -> f32 {
        if self.chunk_ids.is_empty() {
            0.0
        } else {
            self.total_length as f32 / self.chunk_ids.len() as f32
        }
    }

    pub fn chunk_id(&self, surrogate: u32) -> Option<&ChunkId> {
        self.chunk_ids.get(surrogate as usize)
    }

    /// Add or overwrite a document. Re-adding a known `chunk_id` replaces its
    /// prior postings contribution (used by incremental upsert).
    pub fn upsert_document(&mut self, chunk_id: ChunkId, terms: &[String]) {
        if self.id_of.contains_key(&chunk_id) {
            self.remove_document(&chunk_id);
        }

        let surrogate = self.chunk_ids.len() as u32;
        self.chunk_ids.push(chunk_id.clone());
        self.id_of.insert(chunk_id, surrogate);

        let doc_length = terms.len() as u32;
        self.doc_lengths.insert(surrogate, doc_length);
        self.total_length += doc_length as u64;

        let mut term_freqs: HashMap<&str, u32> = HashMap::new();
        for term in terms {
            *term_freqs.entry(term.as_str()).or_insert(0) += 1;
        }
        for (term, freq) in term_freqs {
            self.postings
                .entry(term.to_string())
                .or_default()
                .insert(surrogate, freq);
            *self.doc_frequencies.entry(term.to_string()).or_insert(0) += 1;
        }
        self.idf_dirty = true;
    }

    /// Remove a document's postings contribution. Leaves a tombstoned
    /// surrogate slot (so other surrogates stay stable) with a zero length.
    pub fn remove_document(&mut self, chunk_id: &ChunkId) {
        let Some(&surrogate) = self.id_of.get(chunk_id) else {
            return;
        };
        if let Some(old_len) = self.doc_lengths.insert(surrogate, 0) {
            self.total_length = self.total_length.saturating_sub(old_len as u64);
        }
        for postings in self.postings.values_mut() {
            if postings.remove(&surrogate).is_some() {
                // df decremented below once we know which terms touched this doc
            }
        }
        // Recompute doc_frequencies lazily: a document frequency count only
        // needs to reflect terms that still have postings.
        self.doc_frequencies.clear();
        for (term, postings) in &self.postings {
            if !postings.is_empty() {
                self.doc_frequencies.insert(term.clone(), postings.len() as u32);
            }
        }
        self.id_of.remove(chunk_id);
        self.idf_dirty = true;
    }

    fn ensure_idf(&mut self) {
        if !self.idf_dirty {
            return;
        }
        let n = self.num_docs().max(1) as f32;
        self.idf_cache = self
            .doc_frequencies
            .iter()
            .map(|(term, &df)| {
                let df = df as f32;
                (term.clone(), ((n - df + 0.5) / (df + 0.5) + 1.0).ln())
            })
            .collect();
        self.idf_dirty = false;
    }

    /// Lazily-memoized IDF lookup. Requires `&mut self` because it may
    /// recompute the cache; callers needing read-only access during
    /// concurrent reads should call this once up front under a write lock
    /// (see `kbretrieve_bm25::manager`).
    pub fn idf(&mut self, term: &str) -> f32 {
        self.ensure_idf();
        self.idf_cache.get(term).copied().unwrap_or(0.0)
    }

    fn score_surrogate(&self, surrogate: u32, query_terms: &[String], params: Bm25Params) -> f32 {
        let doc_length = self.doc_lengths.get(&surrogate).copied().unwrap_or(0) as f32;
        let avgdl = self.avg_doc_length();
        if avgdl == 0.0 {
            return 0.0;
        }
        let mut score = 0.0;
        for term in query_terms {
            let idf = self.idf_cache.get(term).copied().unwrap_or(0.0);
            if idf == 0.0 {
                continue;
            }
            let tf = self
                .postings
                .get(term)
                .and_then(|p| p.get(&surrogate))
                .copied()
                .unwrap_or(0) as f32;
            if tf == 0.0 {
                continue;
            }
            let numerator = tf * (params.k1 + 1.0);
            let denominator = tf + params.k1 * (1.0 - params.b + params.b * doc_length / avgdl);
            score += idf * (numerator / denominator);
        }
        score
    }

    /// Top-`k` chunks for `query_terms`. Requires IDF to already be fresh
    /// (call [`Self::idf`] at least once, or [`Self::refresh_idf`], after
    /// any mutation before calling this under a read lock).
    pub fn search(&self, query_terms: &[String], k: usize, params: Bm25Params) -> Vec<(ChunkId, f32)> {
        if query_terms.is_empty() || self.num_docs() == 0 {
            return Vec::new();
        }

        let mut candidates: HashSet<u32> = HashSet::new();
        for term in query_terms {
            if let Some(postings) = self.postings.get(term) {
                candidates.extend(postings.keys());
            }
        }

        let mut scored: Vec<(u32, f32)> = candidates
            .into_iter()
            .map(|s| (s, self.score_surrogate(s, query_terms, params)))
            .filter(|(_, score)| *score > 0.0)
            .collect();

        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(k);

        scored
            .into_iter()
            .filter_map(|(s, score)| self.chunk_id(s).map(|id| (id.clone(), score)))
            .collect()
    }

    /// Force the IDF cache fresh; callers hold a write lock while mutating,
    /// then call this once before releasing it so readers see consistent
    /// scores.
    pub fn refresh_idf(&mut self) {
        self.ensure_idf();
    }

    pub(crate) fn postings_snapshot(&self) -> &HashMap<String, HashMap<u32, u32>> {
        &self.postings
    }

    pub(crate) fn doc_lengths_snapshot(&self) -> &HashMap<u32, u32> {
        &self.doc_lengths
    }

    pub(crate) fn chunk_ids_snapshot(&self) -> &[ChunkId] {
        &self.chunk_ids
    }
}
