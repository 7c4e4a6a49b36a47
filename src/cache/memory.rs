//! Bounded in-memory cache store.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use crate::cache::{CacheError, CacheStore};

#[derive(Debug, Clone)]
struct Entry {
    value: Bytes,
    expires_at: Instant,
    /// Insertion sequence; the smallest is evicted first.
    seq: u64,
}

/// In-process store holding at most `max_entries` entries.
///
/// Expired entries are dropped lazily on read and before eviction; when
/// still full, the oldest write is evicted.
#[derive(Debug)]
pub struct MemoryCacheStore {
    entries: DashMap<String, Entry>,
    max_entries: usize,
    seq: AtomicU64,
}

impl MemoryCacheStore {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: DashMap::new(),
            max_entries: max_entries.max(1),
            seq: AtomicU64::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn purge_expired(&self) -> usize {
        let before = self.entries.len();
        let now = Instant::now();
        self.entries.retain(|_, e| e.expires_at > now);
        before.saturating_sub(self.entries.len())
    }

    fn evict_if_needed(&self, incoming: &str) {
        if self.entries.len() < self.max_entries || self.entries.contains_key(incoming) {
            return;
        }
        self.purge_expired();
        while self.entries.len() >= self.max_entries {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|e| e.value().seq)
                .map(|e| e.key().clone());
            match oldest {
                Some(key) => {
                    self.entries.remove(&key);
                }
                None => break,
            }
        }
    }
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, CacheError> {
        let hit = self.entries.get(key).map(|e| e.value().clone());
        match hit {
            Some(entry) if entry.expires_at > Instant::now() => Ok(Some(entry.value)),
            Some(_) => {
                self.entries.remove_if(key, |_, e| e.expires_at <= Instant::now());
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<(), CacheError> {
        self.evict_if_needed(key);
        let entry = Entry {
            value,
            expires_at: Instant::now() + ttl,
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
        };
        self.entries.insert(key.to_string(), entry);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_get_overwrite() {
        let store = MemoryCacheStore::new(10);
        store.set("k", Bytes::from_static(b"one"), Duration::from_secs(60)).await.unwrap();
        store.set("k", Bytes::from_static(b"two"), Duration::from_secs(60)).await.unwrap();
        assert_eq!(store.get("k").await.unwrap().unwrap(), Bytes::from_static(b"two"));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_expiry() {
        let store = MemoryCacheStore::new(10);
        store.set("k", Bytes::from_static(b"v"), Duration::from_millis(10)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(store.get("k").await.unwrap().is_none());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_evicts_oldest_when_full() {
        let store = MemoryCacheStore::new(2);
        store.set("a", Bytes::from_static(b"1"), Duration::from_secs(60)).await.unwrap();
        store.set("b", Bytes::from_static(b"2"), Duration::from_secs(60)).await.unwrap();
        store.set("c", Bytes::from_static(b"3"), Duration::from_secs(60)).await.unwrap();

        assert_eq!(store.len(), 2);
        assert!(store.get("a").await.unwrap().is_none());
        assert!(store.get("c").await.unwrap().is_some());
    }
}
