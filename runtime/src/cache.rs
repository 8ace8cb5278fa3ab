//! Best-effort result cache.
//!
//! The orchestrator short-circuits repeated URL and catalog fetches through a
//! [`CacheStore`]. The cache is never authoritative: a miss, an error or an
//! absent cache only makes things slower.
//!
//! ## LRU eviction
//!
//! When [`MemoryCache`] exceeds `max_entries`, the least-recently-accessed
//! entry is evicted.

use crate::error::ScrapeResult;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Key-value cache collaborator.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> ScrapeResult<Option<Vec<u8>>>;
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> ScrapeResult<()>;
}

/// Cache key for a parsed listing.
pub fn parse_key(url: &str) -> String {
    format!("parse:{url}")
}

/// Cache key for a fetched catalog page.
pub fn catalog_key(url: &str) -> String {
    format!("catalog:{url}")
}

struct CacheEntry {
    value: Vec<u8>,
    stored_at: Instant,
    ttl: Duration,
    /// When the entry was last read or written (for LRU).
    last_accessed: Instant,
}

impl CacheEntry {
    fn is_expired(&self) -> bool {
        self.stored_at.elapsed() > self.ttl
    }
}

/// In-process cache with per-entry TTL and LRU eviction.
pub struct MemoryCache {
    index: Mutex<HashMap<String, CacheEntry>>,
    max_entries: usize,
}

impl MemoryCache {
    pub fn new(max_entries: usize) -> Self {
        Self {
            index: Mutex::new(HashMap::new()),
            max_entries: max_entries.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.index.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl CacheStore for MemoryCache {
    async fn get(&self, key: &str) -> ScrapeResult<Option<Vec<u8>>> {
        let mut index = self.index.lock().unwrap_or_else(PoisonError::into_inner);
        let expired = match index.get_mut(key) {
            None => return Ok(None),
            Some(entry) if entry.is_expired() => true,
            Some(entry) => {
                entry.last_accessed = Instant::now();
                return Ok(Some(entry.value.clone()));
            }
        };
        if expired {
            index.remove(key);
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> ScrapeResult<()> {
        let mut index = self.index.lock().unwrap_or_else(PoisonError::into_inner);
        if index.len() >= self.max_entries && !index.contains_key(key) {
            index.retain(|_, entry| !entry.is_expired());
            if index.len() >= self.max_entries {
                let lru = index
                    .iter()
                    .min_by_key(|(_, entry)| entry.last_accessed)
                    .map(|(k, _)| k.clone());
                if let Some(lru) = lru {
                    tracing::debug!(key = %lru, "evicting least recently used cache entry");
                    index.remove(&lru);
                }
            }
        }
        let now = Instant::now();
        index.insert(
            key.to_string(),
            CacheEntry {
                value,
                stored_at: now,
                ttl,
                last_accessed: now,
            },
        );
        Ok(())
    }
}

/// Cache that stores nothing.
pub struct NoopCache;

#[async_trait]
impl CacheStore for NoopCache {
    async fn get(&self, _key: &str) -> ScrapeResult<Option<Vec<u8>>> {
        Ok(None)
    }

    async fn set(&self, _key: &str, _value: Vec<u8>, _ttl: Duration) -> ScrapeResult<()> {
        Ok(())
    }
}
