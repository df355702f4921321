//! Per-KB BM25 index lifecycle: lazy load, incremental update, batched
//! persistence, and full rebuild from the repository collaborator.

use crate::index::{Bm25Params, InvertedIndex};
use crate::persistence;
use crate::tokenizer;
use kbretrieve_common::config::Bm25Config;
use kbretrieve_common::errors::Result;
use kbretrieve_interfaces::Repository;
use kbretrieve_types::{Chunk, ChunkId, KbId};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

struct Entry {
    index: RwLock<InvertedIndex>,
}

/// Owns every knowledge base's sparse index and keeps it consistent with
/// the repository collaborator.
///
/// Each KB's index is guarded by its own `RwLock` so a write to one KB
/// never blocks reads against another. Dirty KBs are tracked separately
/// and flushed either in a batch once `batch_write_size` chunks have
/// accumulated since the last flush, or by the periodic flush loop driven
/// by [`Self::flush_interval`].
pub struct Bm25Manager {
    config: Bm25Config,
    index_dir: PathBuf,
    repository: Arc<dyn Repository>,
    entries: RwLock<HashMap<KbId, Arc<Entry>>>,
    dirty: Mutex<HashSet<KbId>>,
    pending_since_flush: Mutex<HashMap<KbId, usize>>,
}

impl Bm25Manager {
    pub fn new(config: Bm25Config, repository: Arc<dyn Repository>) -> Self {
        let index_dir = PathBuf::from(config.index_dir.clone());
        Self {
            config,
            index_dir,
            repository,
            entries: RwLock::new(HashMap::new()),
            dirty: Mutex::new(HashSet::new()),
            pending_since_flush: Mutex::new(HashMap::new()),
        }
    }

    pub fn flush_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.config.flush_interval_secs)
    }

    fn params(&self) -> Bm25Params {
        Bm25Params {
            k1: self.config.k1,
            b: self.config.b,
        }
    }

    async fn entry_for(&self, kb_id: &KbId) -> Result<Arc<Entry>> {
        if let Some(entry) = self.entries.read().await.get(kb_id) {
            return Ok(entry.clone());
        }

        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.get(kb_id) {
            return Ok(entry.clone());
        }

        let path = persistence::index_path(&self.index_dir, kb_id);
        let loaded = persistence::load(&path, kb_id, self.config.tokenizer_version);
        let mut index = match loaded {
            Ok(Some(index)) => index,
            Ok(None) => InvertedIndex::new(),
            Err(err) => {
                tracing::warn!(kb_id = %kb_id, error = %err, "discarding unreadable bm25 index, rebuilding empty");
                InvertedIndex::new()
            }
        };
        index.refresh_idf();

        let entry = Arc::new(Entry {
            index: RwLock::new(index),
        });
        entries.insert(kb_id.clone(), entry.clone());
        Ok(entry)
    }

    /// Tokenize and upsert `chunks` into `kb_id`'s index. Flushes
    /// immediately once `batch_write_size` chunks have accumulated since
    /// the last flush; otherwise leaves the KB dirty for the periodic
    /// flush loop.
    pub async fn add_chunks(&self, kb_id: &KbId, chunks: &[Chunk]) -> Result<()> {
        if chunks.is_empty() {
            return Ok(());
        }
        let entry = self.entry_for(kb_id).await?;
        {
            let mut index = entry.index.write().await;
            for chunk in chunks {
                let terms = tokenizer::tokenize(&chunk.content, None);
                index.upsert_document(chunk.id.clone(), &terms);
            }
            index.refresh_idf();
        }
        self.mark_dirty(kb_id, chunks.len()).await?;
        Ok(())
    }

    pub async fn remove_chunks(&self, kb_id: &KbId, chunk_ids: &[ChunkId]) -> Result<()> {
        if chunk_ids.is_empty() {
            return Ok(());
        }
        let entry = self.entry_for(kb_id).await?;
        {
            let mut index = entry.index.write().await;
            for chunk_id in chunk_ids {
                index.remove_document(chunk_id);
            }
            index.refresh_idf();
        }
        self.mark_dirty(kb_id, chunk_ids.len()).await?;
        Ok(())
    }

    async fn mark_dirty(&self, kb_id: &KbId, delta: usize) -> Result<()> {
        self.dirty.lock().await.insert(kb_id.clone());
        let mut pending = self.pending_since_flush.lock().await;
        let count = pending.entry(kb_id.clone()).or_insert(0);
        *count += delta;
        if *count >= self.config.batch_write_size {
            let kb_id = kb_id.clone();
            drop(pending);
            self.flush_one(&kb_id).await?;
        }
        Ok(())
    }

    async fn flush_one(&self, kb_id: &KbId) -> Result<()> {
        let entry = match self.entries.read().await.get(kb_id) {
            Some(entry) => entry.clone(),
            None => return Ok(()),
        };
        let path = persistence::index_path(&self.index_dir, kb_id);
        {
            let index = entry.index.read().await;
            persistence::save(&index, &path, self.config.tokenizer_version)?;
        }
        self.dirty.lock().await.remove(kb_id);
        self.pending_since_flush.lock().await.remove(kb_id);
        tracing::debug!(kb_id = %kb_id, "flushed bm25 index");
        Ok(())
    }

    /// Flush every KB currently marked dirty. Called by the periodic
    /// flush loop; also safe to call directly (e.g. on graceful shutdown).
    pub async fn flush_dirty(&self) -> Result<()> {
        let dirty: Vec<KbId> = self.dirty.lock().await.iter().cloned().collect();
        for kb_id in dirty {
            self.flush_one(&kb_id).await?;
        }
        Ok(())
    }

    /// Rebuild every active knowledge base's index from scratch against
    /// the repository, replacing whatever is cached in memory or on disk.
    /// Run once at startup and available for manual reconciliation.
    pub async fn rebuild_all(&self) -> Result<()> {
        let kb_ids = self.repository.list_active_kb_ids().await?;
        for kb_id in kb_ids {
            self.rebuild_one(&kb_id).await?;
        }
        Ok(())
    }

    pub async fn rebuild_one(&self, kb_id: &KbId) -> Result<()> {
        let chunks = self.repository.list_chunks(kb_id).await?;
        let mut index = InvertedIndex::new();
        for chunk in &chunks {
            let terms = tokenizer::tokenize(&chunk.content, None);
            index.upsert_document(chunk.id.clone(), &terms);
        }
        index.refresh_idf();

        let path = persistence::index_path(&self.index_dir, kb_id);
        persistence::save(&index, &path, self.config.tokenizer_version)?;

        let entry = Arc::new(Entry {
            index: RwLock::new(index),
        });
        self.entries.write().await.insert(kb_id.clone(), entry);
        self.dirty.lock().await.remove(kb_id);
        self.pending_since_flush.lock().await.remove(kb_id);
        kbretrieve_common::metrics::record_bm25_rebuild(kb_id.as_str());
        tracing::info!(kb_id = %kb_id, chunks = chunks.len(), "rebuilt bm25 index");
        Ok(())
    }

    /// Search `kb_id`'s index for `query`. Returns an empty result set
    /// (never an error) for a KB with no index yet — the caller degrades
    /// to a zero sparse score rather than failing the request.
    pub async fn search(&self, kb_id: &KbId, query: &str, top_k: usize) -> Result<Vec<(ChunkId, f32)>> {
        let entry = self.entry_for(kb_id).await?;
        let terms = tokenizer::tokenize(query, None);
        let index = entry.index.read().await;
        Ok(index.search(&terms, top_k, self.params()))
    }

    pub async fn has_index(&self, kb_id: &KbId) -> bool {
        self.entries.read().await.contains_key(kb_id)
    }
}
