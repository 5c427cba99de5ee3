//! In-process LRU cache with a byte-size cap.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::debug;

use crate::{glob_match, Cache, CacheStats, Counters, LOG_TARGET};

struct Entry {
    value: Vec<u8>,
    expires_at: Instant,
    access_seq: u64,
}

#[derive(Default)]
struct Inner {
    map: HashMap<String, Entry>,
    /// Access order: oldest sequence number first.
    by_access: BTreeMap<u64, String>,
    total_bytes: u64,
    next_seq: u64,
}

impl Inner {
    fn touch(&mut self, key: &str) {
        let seq = self.next_seq;
        self.next_seq += 1;
        if let Some(entry) = self.map.get_mut(key) {
            self.by_access.remove(&entry.access_seq);
            entry.access_seq = seq;
            self.by_access.insert(seq, key.to_owned());
        }
    }

    fn remove(&mut self, key: &str) -> bool {
        if let Some(entry) = self.map.remove(key) {
            self.by_access.remove(&entry.access_seq);
            self.total_bytes = self
                .total_bytes
                .saturating_sub(entry_size(key, &entry.value));
            true
        } else {
            false
        }
    }
}

fn entry_size(key: &str, value: &[u8]) -> u64 {
    (key.len() + value.len()) as u64
}

pub struct MemoryCache {
    inner: Mutex<Inner>,
    counters: Counters,
    max_bytes: u64,
}

impl MemoryCache {
    pub fn new(max_bytes: u64) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            counters: Counters::default(),
            max_bytes,
        }
    }

    /// Periodically drop expired entries.
    pub fn spawn_sweeper(cache: &Arc<Self>, interval: Duration) {
        if interval.is_zero() {
            return;
        }
        let cache = Arc::downgrade(cache);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(cache) = cache.upgrade() else {
                    break;
                };
                cache.sweep_expired();
            }
        });
    }

    pub fn sweep_expired(&self) {
        let now = Instant::now();
        let mut inner = self.inner.lock().expect("Locking failed");
        let expired: Vec<String> = inner
            .map
            .iter()
            .filter(|(_, entry)| entry.expires_at <= now)
            .map(|(key, _)| key.clone())
            .collect();
        if !expired.is_empty() {
            debug!(target: LOG_TARGET, count = expired.len(), "Swept expired cache entries");
        }
        for key in expired {
            inner.remove(&key);
        }
    }

    fn evict_to_cap(&self, inner: &mut Inner) {
        let mut evicted = 0u64;
        while self.max_bytes < inner.total_bytes {
            let Some((_, key)) = inner.by_access.iter().next().map(|(s, k)| (*s, k.clone()))
            else {
                break;
            };
            inner.remove(&key);
            evicted += 1;
        }
        if evicted > 0 {
            self.counters.evicted(evicted);
        }
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn get(&self, key: &str) -> Option<Vec<u8>> {
        let mut inner = self.inner.lock().expect("Locking failed");
        let now = Instant::now();
        match inner.map.get(key) {
            Some(entry) if now < entry.expires_at => {
                let value = entry.value.clone();
                inner.touch(key);
                self.counters.hit();
                Some(value)
            }
            Some(_) => {
                inner.remove(key);
                self.counters.miss();
                None
            }
            None => {
                self.counters.miss();
                None
            }
        }
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) {
        if ttl.is_zero() {
            return;
        }
        let mut inner = self.inner.lock().expect("Locking failed");
        inner.remove(key);
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.total_bytes += entry_size(key, &value);
        inner.by_access.insert(seq, key.to_owned());
        inner.map.insert(
            key.to_owned(),
            Entry {
                value,
                expires_at: Instant::now() + ttl,
                access_seq: seq,
            },
        );
        self.evict_to_cap(&mut inner);
    }

    async fn delete(&self, key: &str) {
        let mut inner = self.inner.lock().expect("Locking failed");
        inner.remove(key);
    }

    async fn delete_pattern(&self, pattern: &str) {
        let mut inner = self.inner.lock().expect("Locking failed");
        let matching: Vec<String> = inner
            .map
            .keys()
            .filter(|key| glob_match(pattern, key))
            .cloned()
            .collect();
        for key in matching {
            inner.remove(&key);
        }
    }

    async fn has(&self, key: &str) -> bool {
        let inner = self.inner.lock().expect("Locking failed");
        inner
            .map
            .get(key)
            .map(|entry| Instant::now() < entry.expires_at)
            .unwrap_or(false)
    }

    fn stats(&self) -> CacheStats {
        let inner = self.inner.lock().expect("Locking failed");
        CacheStats {
            entries: inner.map.len() as u64,
            bytes: inner.total_bytes,
            ..self.counters.snapshot()
        }
    }

    async fn close(&self) {
        let mut inner = self.inner.lock().expect("Locking failed");
        inner.map.clear();
        inner.by_access.clear();
        inner.total_bytes = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_log::test(tokio::test)]
    async fn get_set_delete_roundtrip() {
        let cache = MemoryCache::new(1024 * 1024);
        assert!(cache.get("a").await.is_none());

        cache
            .set("a", b"hello".to_vec(), Duration::from_secs(60))
            .await;
        assert_eq!(cache.get("a").await, Some(b"hello".to_vec()));
        assert!(cache.has("a").await);

        cache.delete("a").await;
        assert!(cache.get("a").await.is_none());

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 2);
    }

    #[test_log::test(tokio::test)]
    async fn pattern_delete() {
        let cache = MemoryCache::new(1024 * 1024);
        let ttl = Duration::from_secs(60);
        cache.set("event:abc:gopher:full", b"1".to_vec(), ttl).await;
        cache.set("event:abc:gemini:full", b"2".to_vec(), ttl).await;
        cache.set("event:def:gopher:full", b"3".to_vec(), ttl).await;

        cache.delete_pattern("event:abc:*").await;
        assert!(cache.get("event:abc:gopher:full").await.is_none());
        assert!(cache.get("event:abc:gemini:full").await.is_none());
        assert!(cache.get("event:def:gopher:full").await.is_some());
    }

    #[test_log::test(tokio::test)]
    async fn byte_cap_evicts_least_recently_used() {
        // Each entry is key (1 byte) + value (10 bytes) = 11 bytes.
        let cache = MemoryCache::new(33);
        let ttl = Duration::from_secs(60);
        cache.set("a", vec![0u8; 10], ttl).await;
        cache.set("b", vec![0u8; 10], ttl).await;
        cache.set("c", vec![0u8; 10], ttl).await;

        // Touch "a" so "b" is the least recently used.
        cache.get("a").await;
        cache.set("d", vec![0u8; 10], ttl).await;

        assert!(cache.get("a").await.is_some());
        assert!(cache.get("b").await.is_none());
        assert!(cache.get("c").await.is_some());
        assert!(cache.get("d").await.is_some());
        assert!(cache.stats().evictions >= 1);
    }

    #[test_log::test(tokio::test)]
    async fn expired_entries_miss_and_sweep() {
        let cache = MemoryCache::new(1024);
        cache.set("a", b"x".to_vec(), Duration::from_millis(1)).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(cache.get("a").await.is_none());

        cache.set("b", b"x".to_vec(), Duration::from_millis(1)).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        cache.sweep_expired();
        assert_eq!(cache.stats().entries, 0);
    }
}
