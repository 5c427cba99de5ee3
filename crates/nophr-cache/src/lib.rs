//! Response and aggregate caching.
//!
//! Rendered protocol responses and aggregate lookups are cached under a
//! colon-delimited key grammar (see [`keys`]). Three interchangeable
//! backends: an in-process LRU with a byte cap, a Redis client for
//! shared deployments, and a null cache when disabled. Cache failures
//! never surface to request handling; the caller just rendered
//! uncached.

pub mod keys;
mod memory;
mod redis_cache;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

pub use self::memory::MemoryCache;
pub use self::redis_cache::RedisCache;

const LOG_TARGET: &str = "nophr::cache";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub entries: u64,
    pub bytes: u64,
}

/// Shared hit/miss/evict counters.
#[derive(Debug, Default)]
pub(crate) struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl Counters {
    pub(crate) fn hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn evicted(&self, count: u64) {
        self.evictions.fetch_add(count, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            entries: 0,
            bytes: 0,
        }
    }
}

#[async_trait]
pub trait Cache: Send + Sync + 'static {
    async fn get(&self, key: &str) -> Option<Vec<u8>>;
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration);
    async fn delete(&self, key: &str);
    /// Delete every key matching a glob pattern (`*` wildcards).
    async fn delete_pattern(&self, pattern: &str);
    async fn has(&self, key: &str) -> bool;
    fn stats(&self) -> CacheStats;
    async fn close(&self);
}

/// Cache used when caching is disabled: everything misses.
#[derive(Debug, Default)]
pub struct NullCache;

#[async_trait]
impl Cache for NullCache {
    async fn get(&self, _key: &str) -> Option<Vec<u8>> {
        None
    }

    async fn set(&self, _key: &str, _value: Vec<u8>, _ttl: Duration) {}

    async fn delete(&self, _key: &str) {}

    async fn delete_pattern(&self, _pattern: &str) {}

    async fn has(&self, _key: &str) -> bool {
        false
    }

    fn stats(&self) -> CacheStats {
        CacheStats::default()
    }

    async fn close(&self) {}
}

/// Simple glob matching: `*` matches any (possibly empty) run.
pub fn glob_match(pattern: &str, key: &str) -> bool {
    fn inner(pattern: &[u8], key: &[u8]) -> bool {
        match (pattern.first(), key.first()) {
            (None, None) => true,
            (Some(b'*'), _) => {
                inner(&pattern[1..], key) || (!key.is_empty() && inner(pattern, &key[1..]))
            }
            (Some(p), Some(k)) if p == k => inner(&pattern[1..], &key[1..]),
            _ => false,
        }
    }
    inner(pattern.as_bytes(), key.as_bytes())
}

/// Build the configured cache backend.
///
/// `redis_url` comes from the environment; a missing URL with the redis
/// engine selected degrades to the in-process cache.
pub fn build_cache(
    enabled: bool,
    engine: Engine,
    redis_url: Option<&str>,
    max_bytes: u64,
    cleanup_interval: Duration,
) -> Arc<dyn Cache> {
    if !enabled {
        return Arc::new(NullCache);
    }
    match engine {
        Engine::None => Arc::new(NullCache),
        Engine::Memory => {
            let cache = Arc::new(MemoryCache::new(max_bytes));
            MemoryCache::spawn_sweeper(&cache, cleanup_interval);
            cache
        }
        Engine::Redis => match redis_url {
            Some(url) => match RedisCache::connect(url) {
                Ok(cache) => Arc::new(cache),
                Err(err) => {
                    tracing::warn!(
                        target: LOG_TARGET,
                        %err,
                        "Redis cache unavailable, using in-process cache"
                    );
                    let cache = Arc::new(MemoryCache::new(max_bytes));
                    MemoryCache::spawn_sweeper(&cache, cleanup_interval);
                    cache
                }
            },
            None => {
                tracing::warn!(
                    target: LOG_TARGET,
                    "caching.engine = \"redis\" but NOPHR_REDIS_URL is not set; using in-process cache"
                );
                let cache = Arc::new(MemoryCache::new(max_bytes));
                MemoryCache::spawn_sweeper(&cache, cleanup_interval);
                cache
            }
        },
    }
}

/// Mirror of the config cache engine selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Engine {
    Memory,
    Redis,
    None,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn glob_patterns() {
        assert!(glob_match("event:abc:*", "event:abc:gopher:full"));
        assert!(glob_match("*", "anything"));
        assert!(glob_match("section:notes:*", "section:notes:gemini:p2"));
        assert!(!glob_match("section:notes:*", "section:articles:gemini:p1"));
        assert!(glob_match("a*c", "abc"));
        assert!(glob_match("a*c", "ac"));
        assert!(!glob_match("a*c", "ab"));
        assert!(glob_match("exact", "exact"));
        assert!(!glob_match("exact", "exactly"));
    }
}
