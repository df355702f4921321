//! Caching.
//!
//! Two distinct caches live here:
//! - [`EmbeddingCache`]: an in-process LRU keyed by content hash, sized by
//!   `embedding.cache_max`. This is the cache the resilience layer consults
//!   before making an embedding call.
//! - [`QueryCache`]: an optional Redis-backed cache for whole search
//!   responses, kept ambiently the way the rest of this workspace caches
//!   query results — not required by any retrieval invariant.

use crate::errors::{RetrievalError, Result};
use lru::LruCache;
use redis::{aio::MultiplexedConnection, AsyncCommands, Client};
use serde::{de::DeserializeOwned, Serialize};
use std::num::NonZeroUsize;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

/// In-process LRU cache mapping an embedding cache key to its vector.
///
/// Amortized O(1) get/insert/evict via `lru::LruCache`'s intrusive linked
/// hash map.
pub struct EmbeddingCache {
    inner: Mutex<LruCache<String, Arc<Vec<f32>>>>,
}

impl EmbeddingCache {
    pub fn new(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity.max(1)).expect("capacity must be > 0");
        Self {
            inner: Mutex::new(LruCache::new(cap)),
        }
    }

    pub async fn get(&self, key: &str) -> Option<Arc<Vec<f32>>> {
        let mut guard = self.inner.lock().await;
        let hit = guard.get(key).cloned();
        crate::metrics::record_cache(hit.is_some(), "embedding");
        hit
    }

    pub async fn put(&self, key: String, value: Vec<f32>) {
        let mut guard = self.inner.lock().await;
        guard.put(key, Arc::new(value));
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }
}

/// Build the embedding cache key from a content hash and model identifier.
pub fn embedding_key(text_hash: &str, model: &str) -> String {
    format!("embedding:{}:{}", model, text_hash)
}

/// Redis-backed query result cache configuration.
#[derive(Debug, Clone)]
pub struct QueryCacheConfig {
    pub url: String,
    pub default_ttl_secs: u64,
    pub key_prefix: String,
}

impl Default for QueryCacheConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            default_ttl_secs: 60,
            key_prefix: "kbretrieve".to_string(),
        }
    }
}

/// Optional whole-response cache. Never required for correctness: every
/// caller treats a cache error as a miss.
pub struct QueryCache {
    connection: RwLock<MultiplexedConnection>,
    config: QueryCacheConfig,
}

impl QueryCache {
    pub async fn new(config: QueryCacheConfig) -> Result<Self> {
        let client = Client::open(config.url.as_str()).map_err(|e| RetrievalError::Internal {
            message: format!("failed to create redis client: {e}"),
        })?;

        let connection = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| RetrievalError::UpstreamTransient {
                service: "query_cache".into(),
                message: e.to_string(),
            })?;

        Ok(Self {
            connection: RwLock::new(connection),
            config,
        })
    }

    fn key(&self, key: &str) -> String {
        format!("{}:{}", self.config.key_prefix, key)
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let full_key = self.key(key);
        let mut conn = self.connection.write().await;
        match conn.get::<_, Option<String>>(&full_key).await {
            Ok(Some(json)) => match serde_json::from_str(&json) {
                Ok(value) => {
                    debug!(key = %full_key, "query cache hit");
                    Some(value)
                }
                Err(e) => {
                    warn!(error = %e, "failed to deserialize cached query result");
                    None
                }
            },
            Ok(None) => {
                debug!(key = %full_key, "query cache miss");
                None
            }
            Err(e) => {
                warn!(error = %e, "query cache read failed, treating as miss");
                None
            }
        }
    }

    pub async fn set<T: Serialize>(&self, key: &str, value: &T) {
        self.set_with_ttl(key, value, self.config.default_ttl_secs).await;
    }

    pub async fn set_with_ttl<T: Serialize>(&self, key: &str, value: &T, ttl_secs: u64) {
        let full_key = self.key(key);
        let Ok(json) = serde_json::to_string(value) else {
            return;
        };
        let mut conn = self.connection.write().await;
        if let Err(e) = conn.set_ex::<_, _, ()>(&full_key, &json, ttl_secs).await {
            warn!(error = %e, key = %full_key, "query cache write failed, continuing without cache");
        }
    }
}

pub mod keys {
    pub fn search_query(kb_id: &str, query_hash: &str, mode: &str) -> String {
        format!("search:{}:{}:{}", kb_id, mode, query_hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn embedding_cache_evicts_lru_entry() {
        let cache = EmbeddingCache::new(2);
        cache.put("a".into(), vec![1.0]).await;
        cache.put("b".into(), vec![2.0]).await;
        assert!(cache.get("a").await.is_some());
        cache.put("c".into(), vec![3.0]).await;
        assert!(cache.get("b").await.is_none());
        assert!(cache.get("a").await.is_some());
        assert!(cache.get("c").await.is_some());
    }

    #[test]
    fn embedding_key_is_namespaced_by_model() {
        let k1 = embedding_key("hash1", "model-a");
        let k2 = embedding_key("hash1", "model-b");
        assert_ne!(k1, k2);
    }
}
