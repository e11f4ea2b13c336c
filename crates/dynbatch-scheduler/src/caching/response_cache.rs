//! In-memory response cache with bounded capacity.

use moka::sync::Cache;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use super::{CacheStats, ResponseCache};
use crate::request::InferenceResponse;

/// Response cache backed by a `moka` concurrent cache.
pub struct InMemoryResponseCache {
    cache: Cache<u64, Arc<InferenceResponse>>,
    hits: AtomicU64,
    misses: AtomicU64,
    inserts: AtomicU64,
}

impl InMemoryResponseCache {
    /// Cache holding at most `capacity` responses.
    pub fn new(capacity: u64) -> Self {
        Self::from_cache(Cache::new(capacity))
    }

    /// Cache whose entries also expire `ttl` after insertion.
    pub fn with_ttl(capacity: u64, ttl: Duration) -> Self {
        Self::from_cache(Cache::builder().max_capacity(capacity).time_to_live(ttl).build())
    }

    fn from_cache(cache: Cache<u64, Arc<InferenceResponse>>) -> Self {
        Self { cache, hits: AtomicU64::new(0), misses: AtomicU64::new(0), inserts: AtomicU64::new(0) }
    }
}

impl ResponseCache for InMemoryResponseCache {
    fn lookup(&self, fingerprint: u64) -> Option<InferenceResponse> {
        match self.cache.get(&fingerprint) {
            Some(response) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(response.as_ref().clone())
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    fn insert(&self, fingerprint: u64, response: InferenceResponse) {
        self.inserts.fetch_add(1, Ordering::Relaxed);
        self.cache.insert(fingerprint, Arc::new(response));
    }

    fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.cache.entry_count(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            inserts: self.inserts.load(Ordering::Relaxed),
        }
    }
}
