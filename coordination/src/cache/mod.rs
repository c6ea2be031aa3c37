//! Version-aware content cache shared across agents.
//!
//! Two LRU pools live behind one mutex: `embeddings` (vectors per document)
//! and `summaries` (compressed text and full agent responses). A lookup is a
//! hit only when the caller did not ask for a version or the stored version
//! matches; a stale entry is reported as a miss so the caller recomputes.

pub mod lru;

pub use lru::LruCache;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::Metadata;

/// Dense embedding vector.
pub type Embedding = Vec<f32>;

/// Shared reference to a [`ContextCache`].
pub type SharedContextCache = Arc<ContextCache>;

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("cache capacity must be greater than zero ({pool} pool)")]
    ZeroCapacity { pool: &'static str },
}

/// A cached value with its provenance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry<V> {
    pub value: V,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Metadata::is_empty")]
    pub metadata: Metadata,
}

impl<V> CacheEntry<V> {
    pub fn new(value: V, version: Option<String>, metadata: Metadata) -> Self {
        Self {
            value,
            version,
            metadata,
        }
    }

    /// Whether this entry satisfies a lookup for `expected` version.
    pub fn is_valid(&self, expected: Option<&str>) -> bool {
        match expected {
            None => true,
            Some(expected) => self.version.as_deref() == Some(expected),
        }
    }
}

/// Occupancy of both pools.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub embeddings: usize,
    pub summaries: usize,
}

struct Pools {
    embeddings: LruCache<String, CacheEntry<Embedding>>,
    summaries: LruCache<String, CacheEntry<String>>,
}

/// Cache for embeddings and summaries shared across concurrent pipelines.
pub struct ContextCache {
    pools: Mutex<Pools>,
}

impl ContextCache {
    pub fn new(embedding_capacity: usize, summary_capacity: usize) -> Result<Self, CacheError> {
        let embeddings = LruCache::new(embedding_capacity).ok_or(CacheError::ZeroCapacity {
            pool: "embeddings",
        })?;
        let summaries = LruCache::new(summary_capacity).ok_or(CacheError::ZeroCapacity {
            pool: "summaries",
        })?;
        Ok(Self {
            pools: Mutex::new(Pools {
                embeddings,
                summaries,
            }),
        })
    }

    pub fn shared(self) -> SharedContextCache {
        Arc::new(self)
    }

    pub fn get_embedding(&self, key: &str, version: Option<&str>) -> Option<Embedding> {
        let mut pools = self.lock();
        lookup(&mut pools.embeddings, "embeddings", key, version)
    }

    pub fn put_embedding(
        &self,
        key: impl Into<String>,
        value: Embedding,
        version: Option<String>,
        metadata: Metadata,
    ) -> CacheEntry<Embedding> {
        let entry = CacheEntry::new(value, version, metadata);
        self.lock().embeddings.put(key.into(), entry.clone());
        entry
    }

    pub fn drop_embedding(&self, key: &str) -> Option<CacheEntry<Embedding>> {
        self.lock().embeddings.remove(&key.to_string())
    }

    pub fn get_summary(&self, key: &str, version: Option<&str>) -> Option<String> {
        let mut pools = self.lock();
        lookup(&mut pools.summaries, "summaries", key, version)
    }

    pub fn put_summary(
        &self,
        key: impl Into<String>,
        value: String,
        version: Option<String>,
        metadata: Metadata,
    ) -> CacheEntry<String> {
        let entry = CacheEntry::new(value, version, metadata);
        self.lock().summaries.put(key.into(), entry.clone());
        entry
    }

    pub fn drop_summary(&self, key: &str) -> Option<CacheEntry<String>> {
        self.lock().summaries.remove(&key.to_string())
    }

    pub fn stats(&self) -> CacheStats {
        let pools = self.lock();
        CacheStats {
            embeddings: pools.embeddings.len(),
            summaries: pools.summaries.len(),
        }
    }

    pub fn clear(&self) {
        let mut pools = self.lock();
        pools.embeddings.clear();
        pools.summaries.clear();
    }

    fn lock(&self) -> MutexGuard<'_, Pools> {
        self.pools.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn lookup<V: Clone>(
    pool: &mut LruCache<String, CacheEntry<V>>,
    pool_name: &'static str,
    key: &str,
    version: Option<&str>,
) -> Option<V> {
    let entry = pool.get(&key.to_string())?;
    if !entry.is_valid(version) {
        debug!(
            pool = pool_name,
            key,
            stored = entry.version.as_deref().unwrap_or("-"),
            requested = version.unwrap_or("-"),
            "Stale cache entry"
        );
        return None;
    }
    Some(entry.value.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn cache(capacity: usize) -> ContextCache {
        ContextCache::new(capacity, capacity).unwrap()
    }

    #[test]
    fn test_zero_capacity_is_an_error() {
        let err = ContextCache::new(4, 0).err().unwrap();
        assert!(err.to_string().contains("summaries"));
    }

    #[test]
    fn test_version_mismatch_is_a_miss() {
        let cache = cache(4);
        cache.put_summary("doc-1", "short".into(), Some("v1".into()), Metadata::new());

        assert_eq!(cache.get_summary("doc-1", Some("v2")), None);
        assert_eq!(cache.get_summary("doc-1", Some("v1")).as_deref(), Some("short"));
        assert_eq!(cache.get_summary("doc-1", None).as_deref(), Some("short"));
    }

    #[test]
    fn test_unversioned_entry_only_matches_unversioned_lookup() {
        let cache = cache(4);
        cache.put_embedding("doc-1", vec![0.5, 0.5], None, Metadata::new());

        assert!(cache.get_embedding("doc-1", Some("v1")).is_none());
        assert_eq!(cache.get_embedding("doc-1", None), Some(vec![0.5, 0.5]));
    }

    #[test]
    fn test_put_replaces_instead_of_mutating() {
        let cache = cache(4);
        let first = cache.put_summary("k", "one".into(), Some("v1".into()), Metadata::new());
        cache.put_summary("k", "two".into(), Some("v2".into()), Metadata::new());

        assert_eq!(first.value, "one");
        assert_eq!(cache.get_summary("k", Some("v2")).as_deref(), Some("two"));
        assert!(cache.get_summary("k", Some("v1")).is_none());
    }

    #[test]
    fn test_lru_eviction_respects_access() {
        let cache = cache(2);
        cache.put_summary("a", "A".into(), None, Metadata::new());
        cache.put_summary("b", "B".into(), None, Metadata::new());
        assert!(cache.get_summary("a", None).is_some());
        cache.put_summary("c", "C".into(), None, Metadata::new());

        assert!(cache.get_summary("a", None).is_some());
        assert!(cache.get_summary("b", None).is_none());
        assert_eq!(cache.stats().summaries, 2);
    }

    #[test]
    fn test_pools_are_independent() {
        let cache = ContextCache::new(1, 1).unwrap();
        cache.put_embedding("doc", vec![1.0], None, Metadata::new());
        cache.put_summary("doc", "text".into(), None, Metadata::new());

        assert_eq!(
            cache.stats(),
            CacheStats {
                embeddings: 1,
                summaries: 1
            }
        );
        assert!(cache.drop_embedding("doc").is_some());
        assert_eq!(cache.get_summary("doc", None).as_deref(), Some("text"));

        cache.clear();
        assert_eq!(cache.stats().summaries, 0);
    }

    #[test]
    fn test_concurrent_access_keeps_capacity() {
        let cache = cache(16).shared();
        let handles: Vec<_> = (0..8)
            .map(|worker| {
                let cache = Arc::clone(&cache);
                thread::spawn(move || {
                    for i in 0..50 {
                        let key = format!("w{worker}-{i}");
                        cache.put_summary(key.clone(), key.clone(), None, Metadata::new());
                        let _ = cache.get_summary(&key, None);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(cache.stats().summaries, 16);
    }
}
