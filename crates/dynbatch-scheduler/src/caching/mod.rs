//! Response caching keyed by request fingerprint

use serde::Serialize;

use crate::request::InferenceResponse;

pub mod response_cache;

pub use response_cache::InMemoryResponseCache;

/// Fingerprint-keyed response store.
///
/// Lookups run on the enqueueing caller's thread and must stay cheap; a
/// miss or an unavailable backing store simply returns `None`.
pub trait ResponseCache: Send + Sync {
    fn lookup(&self, fingerprint: u64) -> Option<InferenceResponse>;

    fn insert(&self, fingerprint: u64, response: InferenceResponse);

    fn stats(&self) -> CacheStats {
        CacheStats::default()
    }
}

/// Cache statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheStats {
    pub entries: u64,
    pub hits: u64,
    pub misses: u64,
    pub inserts: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let lookups = self.hits + self.misses;
        if lookups == 0 { 0.0 } else { self.hits as f64 / lookups as f64 }
    }
}
