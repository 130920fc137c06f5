//! Result caching for repeated grouped aggregations.
//!
//! Keys combine the store generation with a fingerprint of the request, so a
//! new store never sees results computed against an old one.

use moka::sync::Cache;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::group::GroupResult;

#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub struct CacheKey {
    generation: u64,
    fingerprint: String,
}

impl CacheKey {
    /// Fingerprint is the request's JSON form
    pub fn new<R: Serialize>(generation: u64, request: &R) -> Option<Self> {
        let fingerprint = serde_json::to_string(request).ok()?;
        Some(Self {
            generation,
            fingerprint,
        })
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

pub struct ResultCache {
    cache: Cache<CacheKey, Arc<GroupResult>>,
    hits: AtomicU64,
    misses: AtomicU64,
    ttl: Duration,
}

impl ResultCache {
    pub fn new(max_entries: u64, ttl: Duration) -> Self {
        Self {
            cache: Cache::builder()
                .max_capacity(max_entries)
                .time_to_live(ttl)
                .build(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            ttl,
        }
    }

    pub fn get(&self, key: &CacheKey) -> Option<Arc<GroupResult>> {
        if let Some(result) = self.cache.get(key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            Some(result)
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            None
        }
    }

    pub fn put(&self, key: CacheKey, result: Arc<GroupResult>) {
        self.cache.insert(key, result);
    }

    /// Drop every entry computed against store `generation`
    pub fn invalidate_generation(&self, generation: u64) {
        let stale: Vec<CacheKey> = self
            .cache
            .iter()
            .filter(|(key, _)| key.generation() == generation)
            .map(|(key, _)| (*key).clone())
            .collect();

        for key in stale {
            self.cache.invalidate(&key);
        }
    }

    pub fn invalidate_all(&self) {
        self.cache.invalidate_all();
    }

    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;

        CacheStats {
            hits,
            misses,
            hit_rate: if total > 0 {
                hits as f64 / total as f64
            } else {
                0.0
            },
            entry_count: self.cache.entry_count(),
            ttl_secs: self.ttl.as_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// 0.0 - 1.0
    pub hit_rate: f64,
    pub entry_count: u64,
    pub ttl_secs: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(generation: u64, calc: &str) -> CacheKey {
        CacheKey::new(generation, &serde_json::json!({ "calculation": calc })).unwrap()
    }

    #[test]
    fn test_put_get() {
        let cache = ResultCache::new(16, Duration::from_secs(60));
        cache.put(key(1, "sales"), Arc::new(GroupResult::Leaf(vec![1.0])));

        assert_eq!(
            cache.get(&key(1, "sales")).as_deref(),
            Some(&GroupResult::Leaf(vec![1.0]))
        );
        assert!(cache.get(&key(2, "sales")).is_none());
        assert!(cache.get(&key(1, "cost")).is_none());

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 2);
    }

    #[test]
    fn test_invalidate_generation() {
        let cache = ResultCache::new(16, Duration::from_secs(60));
        cache.put(key(1, "a"), Arc::new(GroupResult::Leaf(vec![])));
        cache.put(key(2, "a"), Arc::new(GroupResult::Leaf(vec![])));

        cache.invalidate_generation(1);
        assert!(cache.get(&key(1, "a")).is_none());
        assert!(cache.get(&key(2, "a")).is_some());
    }
}
