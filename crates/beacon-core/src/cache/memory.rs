//! Process-local cache provider.

use super::{compile_pattern, literal_prefix, CacheError, CacheProvider};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::time::Duration;
use tokio::time::Instant;
use tracing::trace;

#[derive(Debug, Clone)]
struct CacheEntry {
    value: String,
    expires_at: Option<Instant>,
}

impl CacheEntry {
    fn new(value: &str, ttl: Option<Duration>) -> Self {
        Self {
            value: value.to_string(),
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

/// An in-memory [`CacheProvider`] backed by an ordered map.
///
/// Keys are kept sorted, so a scan only visits the range sharing the
/// pattern's literal prefix. Entries expire exactly at their TTL boundary and
/// are evicted lazily on read and within the ranges scans visit.
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: RwLock<BTreeMap<String, CacheEntry>>,
}

impl MemoryCache {
    /// Create an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries, including expired ones not yet evicted.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Check if the cache holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Evict every expired entry. Returns the number evicted.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired(now));
        let evicted = before.saturating_sub(entries.len());
        if evicted > 0 {
            trace!(evicted, "Purged expired cache entries");
        }
        evicted
    }

    fn evict(&self, keys: &[String], now: Instant) {
        let mut entries = self.entries.write();
        for key in keys {
            // Rewritten since it was seen expired
            if entries.get(key).is_some_and(|entry| entry.is_expired(now)) {
                entries.remove(key);
            }
        }
        trace!(evicted = keys.len(), "Evicted expired cache entries");
    }
}

#[async_trait]
impl CacheProvider for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let now = Instant::now();
        match self.entries.read().get(key) {
            Some(entry) if !entry.is_expired(now) => return Ok(Some(entry.value.clone())),
            Some(_) => {}
            None => return Ok(None),
        }

        self.evict(&[key.to_string()], now);
        Ok(None)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), CacheError> {
        self.entries
            .write()
            .insert(key.to_string(), CacheEntry::new(value, ttl));
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, CacheError> {
        let now = Instant::now();
        let mut entries = self.entries.write();
        match entries.entry(key.to_string()) {
            Entry::Occupied(entry) if !entry.get().is_expired(now) => Ok(false),
            Entry::Occupied(mut entry) => {
                entry.insert(CacheEntry::new(value, ttl));
                Ok(true)
            }
            Entry::Vacant(entry) => {
                entry.insert(CacheEntry::new(value, ttl));
                Ok(true)
            }
        }
    }

    async fn remove(&self, key: &str) -> Result<bool, CacheError> {
        let now = Instant::now();
        Ok(self
            .entries
            .write()
            .remove(key)
            .is_some_and(|entry| !entry.is_expired(now)))
    }

    async fn scan(&self, pattern: &str) -> Result<Vec<String>, CacheError> {
        let matcher = compile_pattern(pattern)?;
        let prefix = literal_prefix(pattern);
        let now = Instant::now();

        let mut keys = Vec::new();
        let mut expired = Vec::new();
        {
            let entries = self.entries.read();
            let range = entries
                .range::<str, _>((Bound::Included(prefix), Bound::Unbounded))
                .take_while(|(key, _)| key.starts_with(prefix));

            for (key, entry) in range {
                if entry.is_expired(now) {
                    expired.push(key.clone());
                } else if matcher.matches(key) {
                    keys.push(key.clone());
                }
            }
        }

        if !expired.is_empty() {
            self.evict(&expired, now);
        }
        Ok(keys)
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
