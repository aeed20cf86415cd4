//! Result caching.
//!
//! The executor caches step outputs and the engine caches whole results in a
//! shared [`CacheBackend`]. Keys are SHA-256 fingerprints (see [`key`]).
//! Backend failures are never fatal to a run; callers log them and treat
//! them as a miss.

pub mod key;
mod memory;

pub use key::{canonical_json, fingerprint, pipeline_cache_key, rows_fingerprint, step_cache_key};
pub use memory::InMemoryCache;

use crate::errors::CacheError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Usage counters of a cache backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    /// Live entries.
    pub entries: usize,
    /// Successful lookups.
    pub hits: u64,
    /// Lookups that found nothing.
    pub misses: u64,
    /// Writes.
    pub sets: u64,
    /// Explicit deletions.
    pub deletes: u64,
    /// Entries dropped after expiring.
    pub evictions: u64,
}

impl CacheStats {
    /// Fraction of lookups that hit, or 0 when nothing was looked up.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Key/value storage for cached results.
///
/// Values are JSON documents; each entry has its own optional TTL.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Reads an entry. Expired entries read as `None`.
    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>, CacheError>;

    /// Writes an entry, replacing any previous one.
    async fn set(
        &self,
        key: &str,
        value: serde_json::Value,
        ttl: Option<Duration>,
    ) -> Result<(), CacheError>;

    /// Removes an entry. Returns whether one existed.
    async fn delete(&self, key: &str) -> Result<bool, CacheError>;

    /// Whether a live entry exists.
    async fn exists(&self, key: &str) -> Result<bool, CacheError>;

    /// Removes every entry.
    async fn clear(&self) -> Result<(), CacheError>;

    /// Returns usage counters.
    async fn stats(&self) -> Result<CacheStats, CacheError>;
}
