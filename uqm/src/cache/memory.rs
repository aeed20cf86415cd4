//! In-process cache backend.

use super::{CacheBackend, CacheStats};
use crate::errors::CacheError;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
struct Entry {
    value: serde_json::Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

#[derive(Debug, Default)]
struct Inner {
    entries: HashMap<String, Entry>,
    hits: u64,
    misses: u64,
    sets: u64,
    deletes: u64,
    evictions: u64,
}

/// Reference [`CacheBackend`] holding entries in a process-local map.
///
/// Expired entries are dropped lazily when read. Clones share storage.
#[derive(Debug, Clone, Default)]
pub struct InMemoryCache {
    inner: Arc<Mutex<Inner>>,
    default_ttl: Option<Duration>,
}

impl InMemoryCache {
    /// Creates an empty cache without a default TTL.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies `ttl` to entries set without one.
    #[must_use]
    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = Some(ttl);
        self
    }

    /// Returns the number of stored entries, including expired ones not yet
    /// evicted.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Returns true if nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }

    /// Drops every expired entry.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let before = inner.entries.len();
        inner.entries.retain(|_, entry| !entry.is_expired(now));
        let purged = before - inner.entries.len();
        inner.evictions += purged as u64;
        purged
    }
}

#[async_trait]
impl CacheBackend for InMemoryCache {
    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>, CacheError> {
        let now = Instant::now();
        let mut inner = self.inner.lock();

        let found = inner
            .entries
            .get(key)
            .map(|entry| (entry.is_expired(now), entry.value.clone()));

        match found {
            Some((false, value)) => {
                inner.hits += 1;
                Ok(Some(value))
            }
            Some((true, _)) => {
                inner.entries.remove(key);
                inner.evictions += 1;
                inner.misses += 1;
                Ok(None)
            }
            None => {
                inner.misses += 1;
                Ok(None)
            }
        }
    }

    async fn set(
        &self,
        key: &str,
        value: serde_json::Value,
        ttl: Option<Duration>,
    ) -> Result<(), CacheError> {
        let expires_at = ttl
            .or(self.default_ttl)
            .and_then(|ttl| Instant::now().checked_add(ttl));
        let mut inner = self.inner.lock();
        inner
            .entries
            .insert(key.to_string(), Entry { value, expires_at });
        inner.sets += 1;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        let mut inner = self.inner.lock();
        let removed = inner.entries.remove(key).is_some();
        if removed {
            inner.deletes += 1;
        }
        Ok(removed)
    }

    async fn exists(&self, key: &str) -> Result<bool, CacheError> {
        let now = Instant::now();
        Ok(self
            .inner
            .lock()
            .entries
            .get(key)
            .is_some_and(|entry| !entry.is_expired(now)))
    }

    async fn clear(&self) -> Result<(), CacheError> {
        self.inner.lock().entries.clear();
        Ok(())
    }

    async fn stats(&self) -> Result<CacheStats, CacheError> {
        let inner = self.inner.lock();
        Ok(CacheStats {
            entries: inner.entries.len(),
            hits: inner.hits,
            misses: inner.misses,
            sets: inner.sets,
            deletes: inner.deletes,
            evictions: inner.evictions,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[tokio::test]
    async fn test_set_get_delete() {
        let cache = InMemoryCache::new();
        cache.set("k", json!({"a": 1}), None).await.unwrap();

        assert_eq!(cache.get("k").await.unwrap(), Some(json!({"a": 1})));
        assert!(cache.exists("k").await.unwrap());
        assert!(cache.delete("k").await.unwrap());
        assert!(!cache.delete("k").await.unwrap());
        assert_eq!(cache.get("k").await.unwrap(), None);

        let stats = cache.stats().await.unwrap();
        assert_eq!((stats.hits, stats.misses, stats.sets, stats.deletes), (1, 1, 1, 1));
        assert!((stats.hit_rate() - 0.5).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_ttl_expiry() {
        let cache = InMemoryCache::new();
        cache.set("gone", json!(1), Some(Duration::ZERO)).await.unwrap();
        cache.set("kept", json!(2), Some(Duration::from_secs(60))).await.unwrap();

        assert!(!cache.exists("gone").await.unwrap());
        assert_eq!(cache.get("gone").await.unwrap(), None);
        assert_eq!(cache.get("kept").await.unwrap(), Some(json!(2)));
        assert_eq!(cache.stats().await.unwrap().evictions, 1);
    }

    #[tokio::test]
    async fn test_clones_share_storage() {
        let cache = InMemoryCache::new().with_default_ttl(Duration::from_secs(60));
        let other = cache.clone();
        cache.set("k", json!("v"), None).await.unwrap();

        assert_eq!(other.len(), 1);
        other.clear().await.unwrap();
        assert!(cache.is_empty());
    }
}
