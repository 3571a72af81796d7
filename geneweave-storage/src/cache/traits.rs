//! Persistent cache tier trait and entry/statistics types.

use async_trait::async_trait;
use chrono::Duration as ChronoDuration;
use geneweave_core::{cache_key_hash, CacheResult, Timestamp};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::time::Duration;

/// A row of `cache_entries`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub namespace: String,
    /// Content hash of `namespace:key`; unique across the table.
    pub cache_key: String,
    pub data: JsonValue,
    /// `None` means the entry never expires.
    pub expires_at: Option<Timestamp>,
    pub access_count: u64,
    pub last_accessed: Timestamp,
    pub data_size: u64,
}

impl CacheEntry {
    pub fn new(
        namespace: &str,
        key: &str,
        data: JsonValue,
        ttl: Option<Duration>,
        now: Timestamp,
    ) -> Self {
        let data_size = data.to_string().len() as u64;
        let expires_at = ttl.map(|ttl| {
            now + ChronoDuration::from_std(ttl).unwrap_or_else(|_| ChronoDuration::days(36_500))
        });
        Self {
            namespace: namespace.to_string(),
            cache_key: cache_key_hash(namespace, key),
            data,
            expires_at,
            access_count: 0,
            last_accessed: now,
            data_size,
        }
    }

    /// Expired entries are logically dead even before physical deletion.
    pub fn is_expired(&self, now: Timestamp) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Live-entry usage reported by the persistent tier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheUsage {
    pub entries: u64,
    pub size_bytes: u64,
}

/// The persistent, shared cache tier.
///
/// Implementations must exclude expired entries from every read, including
/// usage counts, whether or not they have been physically removed.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Fetch a live entry and record the access.
    async fn get(&self, cache_key: &str, now: Timestamp) -> CacheResult<Option<CacheEntry>>;

    /// Insert or replace the entry with the same `cache_key`.
    async fn put(&self, entry: CacheEntry) -> CacheResult<()>;

    /// Remove one entry. Returns whether a row was removed.
    async fn delete(&self, cache_key: &str) -> CacheResult<bool>;

    /// Remove every entry in `namespace`, returning the count.
    async fn delete_namespace(&self, namespace: &str) -> CacheResult<u64>;

    /// Physically remove expired entries, returning the count.
    async fn delete_expired(&self, now: Timestamp) -> CacheResult<u64>;

    /// Count live entries, optionally restricted to one namespace.
    async fn usage(&self, namespace: Option<&str>, now: Timestamp) -> CacheResult<CacheUsage>;
}

/// Statistics for one namespace or the whole cache.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    pub namespace: Option<String>,
    /// Hits from either tier.
    pub hits: u64,
    pub misses: u64,
    /// `hits / (hits + misses)`, 0.0 before any lookup.
    pub hit_rate: f64,
    /// Hits served by the in-process tier.
    pub l1_hits: u64,
    /// Live entries in the persistent tier.
    pub entries: u64,
    pub size_bytes: u64,
    /// Entries currently held in process.
    pub l1_entries: u64,
}

impl CacheStats {
    /// Recompute `hit_rate` from the hit and miss counters.
    pub fn update_hit_rate(&mut self) {
        let total = self.hits + self.misses;
        self.hit_rate = if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        };
    }
}
