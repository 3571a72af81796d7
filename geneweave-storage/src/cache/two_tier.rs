//! Two-tier cache: bounded in-process LRU over a shared persistent store.
//!
//! Reads check L1 first, then L2, promoting L2 hits into L1. Writes go to
//! both tiers. The persistent tier is treated as best-effort: its failures
//! are logged and degrade to misses so callers fall through to the source.
//!
//! Namespace clears bump a per-namespace generation; L1 entries stamped with
//! an older generation are treated as absent, which invalidates the whole
//! namespace in L1 without scanning it.

use super::traits::{CacheEntry, CacheStats, CacheStore};
use chrono::Utc;
use dashmap::DashMap;
use geneweave_core::{cache_key_hash, CacheConfig, CacheResult, Timestamp};
use moka::sync::Cache;
use serde_json::Value as JsonValue;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug)]
struct L1Entry {
    namespace: String,
    generation: u64,
    value: JsonValue,
    expires_at: Option<Timestamp>,
}

impl L1Entry {
    fn is_live(&self, generation: u64, now: Timestamp) -> bool {
        self.generation == generation && self.expires_at.map_or(true, |at| at > now)
    }
}

#[derive(Debug, Default)]
struct NamespaceCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    l1_hits: AtomicU64,
}

/// Expiry requested for a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheTtl {
    /// Use the namespace policy from `CacheConfig`.
    Namespace,
    After(Duration),
    Never,
}

impl From<Duration> for CacheTtl {
    fn from(ttl: Duration) -> Self {
        CacheTtl::After(ttl)
    }
}

/// Namespaced two-tier cache shared by every source task.
///
/// Safe for concurrent use without external locking.
pub struct TwoTierCache {
    l1: Cache<String, Arc<L1Entry>>,
    l2: Arc<dyn CacheStore>,
    config: CacheConfig,
    generations: DashMap<String, u64>,
    counters: DashMap<String, Arc<NamespaceCounters>>,
}

impl TwoTierCache {
    pub fn new(l2: Arc<dyn CacheStore>, config: CacheConfig) -> Self {
        let l1 = Cache::builder().max_capacity(config.l1_capacity).build();
        Self {
            l1,
            l2,
            config,
            generations: DashMap::new(),
            counters: DashMap::new(),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    fn generation(&self, namespace: &str) -> u64 {
        self.generations.get(namespace).map(|g| *g).unwrap_or(0)
    }

    fn counters(&self, namespace: &str) -> Arc<NamespaceCounters> {
        if let Some(c) = self.counters.get(namespace) {
            return Arc::clone(&c);
        }
        Arc::clone(
            &self
                .counters
                .entry(namespace.to_string())
                .or_insert_with(|| Arc::new(NamespaceCounters::default())),
        )
    }

    fn resolve_ttl(&self, namespace: &str, ttl: CacheTtl) -> Option<Duration> {
        match ttl {
            CacheTtl::Namespace => Some(self.config.ttl_for(namespace)),
            CacheTtl::After(ttl) => Some(ttl),
            CacheTtl::Never => None,
        }
    }

    /// Look up `key` in `namespace`.
    pub async fn get(&self, key: &str, namespace: &str) -> Option<JsonValue> {
        let hashed = cache_key_hash(namespace, key);
        let now = Utc::now();
        let generation = self.generation(namespace);
        let counters = self.counters(namespace);

        if let Some(entry) = self.l1.get(&hashed) {
            if entry.is_live(generation, now) {
                counters.hits.fetch_add(1, Ordering::Relaxed);
                counters.l1_hits.fetch_add(1, Ordering::Relaxed);
                return Some(entry.value.clone());
            }
            self.l1.invalidate(&hashed);
        }

        match self.l2.get(&hashed, now).await {
            Ok(Some(entry)) => {
                counters.hits.fetch_add(1, Ordering::Relaxed);
                let value = entry.data;
                self.l1.insert(
                    hashed,
                    Arc::new(L1Entry {
                        namespace: namespace.to_string(),
                        generation,
                        value: value.clone(),
                        expires_at: entry.expires_at,
                    }),
                );
                Some(value)
            }
            Ok(None) => {
                counters.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            Err(e) => {
                tracing::warn!(namespace, error = %e, "Persistent cache read failed, treating as miss");
                counters.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Store `value` under `key` in both tiers.
    pub async fn set(&self, key: &str, value: JsonValue, namespace: &str, ttl: CacheTtl) {
        let now = Utc::now();
        let ttl = self.resolve_ttl(namespace, ttl);
        let entry = CacheEntry::new(namespace, key, value, ttl, now);

        self.l1.insert(
            entry.cache_key.clone(),
            Arc::new(L1Entry {
                namespace: namespace.to_string(),
                generation: self.generation(namespace),
                value: entry.data.clone(),
                expires_at: entry.expires_at,
            }),
        );

        if let Err(e) = self.l2.put(entry).await {
            tracing::warn!(namespace, error = %e, "Persistent cache write failed, entry kept in process only");
        }
    }

    /// Remove `key` from both tiers. Returns whether the persistent tier held it.
    pub async fn delete(&self, key: &str, namespace: &str) -> bool {
        let hashed = cache_key_hash(namespace, key);
        self.l1.invalidate(&hashed);
        match self.l2.delete(&hashed).await {
            Ok(removed) => removed,
            Err(e) => {
                tracing::warn!(namespace, error = %e, "Persistent cache delete failed");
                false
            }
        }
    }

    /// Drop every entry in `namespace` from both tiers.
    ///
    /// Returns the number of persistent rows removed.
    pub async fn clear_namespace(&self, namespace: &str) -> CacheResult<u64> {
        *self.generations.entry(namespace.to_string()).or_insert(0) += 1;
        let removed = self.l2.delete_namespace(namespace).await?;
        tracing::debug!(namespace, removed, "Cleared cache namespace");
        Ok(removed)
    }

    /// Physically remove expired persistent rows.
    pub async fn cleanup_expired(&self) -> CacheResult<u64> {
        self.l1.run_pending_tasks();
        let removed = self.l2.delete_expired(Utc::now()).await?;
        if removed > 0 {
            tracing::info!(removed, "Removed expired cache entries");
        }
        Ok(removed)
    }

    /// Statistics for one namespace, or aggregated across all of them.
    pub async fn stats(&self, namespace: Option<&str>) -> CacheResult<CacheStats> {
        let mut stats = CacheStats {
            namespace: namespace.map(str::to_string),
            ..Default::default()
        };

        for item in self.counters.iter() {
            if namespace.map_or(true, |ns| item.key() == ns) {
                stats.hits += item.hits.load(Ordering::Relaxed);
                stats.misses += item.misses.load(Ordering::Relaxed);
                stats.l1_hits += item.l1_hits.load(Ordering::Relaxed);
            }
        }
        stats.update_hit_rate();

        let now = Utc::now();
        let usage = self.l2.usage(namespace, now).await?;
        stats.entries = usage.entries;
        stats.size_bytes = usage.size_bytes;

        stats.l1_entries = match namespace {
            None => self.l1.entry_count(),
            Some(ns) => {
                let generation = self.generation(ns);
                self.l1
                    .iter()
                    .filter(|(_, e)| e.namespace == ns && e.is_live(generation, now))
                    .count() as u64
            }
        };

        Ok(stats)
    }

    /// Return the cached value, or fetch, cache and return it.
    ///
    /// Only values accepted by `is_valid` are written to the cache; invalid
    /// values are still returned so the caller can classify them.
    pub async fn get_or_fetch<F, Fut, E>(
        &self,
        key: &str,
        namespace: &str,
        ttl: CacheTtl,
        is_valid: impl Fn(&JsonValue) -> bool,
        fetch: F,
    ) -> Result<Option<JsonValue>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<JsonValue>, E>>,
    {
        if let Some(cached) = self.get(key, namespace).await {
            if is_valid(&cached) {
                return Ok(Some(cached));
            }
            self.delete(key, namespace).await;
        }

        let fetched = fetch().await?;
        if let Some(value) = &fetched {
            if is_valid(value) {
                self.set(key, value.clone(), namespace, ttl).await;
            }
        }
        Ok(fetched)
    }
}

impl std::fmt::Debug for TwoTierCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TwoTierCache")
            .field("l1_entries", &self.l1.entry_count())
            .field("namespaces", &self.counters.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryCacheStore;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn cache() -> (TwoTierCache, Arc<InMemoryCacheStore>) {
        let l2 = Arc::new(InMemoryCacheStore::new());
        (TwoTierCache::new(l2.clone(), CacheConfig::default()), l2)
    }

    #[tokio::test]
    async fn test_set_then_get_hits_l1() {
        let (cache, _) = cache();
        cache.set("BRCA1", json!({"pli": 0.9}), "gnomad", CacheTtl::Namespace).await;

        assert_eq!(cache.get("BRCA1", "gnomad").await, Some(json!({"pli": 0.9})));
        let stats = cache.stats(Some("gnomad")).await.unwrap();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.l1_hits, 1);
        assert_eq!(stats.entries, 1);
    }

    #[tokio::test]
    async fn test_l2_hit_promotes_into_l1() {
        let l2 = Arc::new(InMemoryCacheStore::new());
        let writer = TwoTierCache::new(l2.clone(), CacheConfig::default());
        writer.set("TP53", json!({"a": 1}), "hgnc", CacheTtl::Namespace).await;

        let reader = TwoTierCache::new(l2, CacheConfig::default());
        assert!(reader.get("TP53", "hgnc").await.is_some());
        assert!(reader.get("TP53", "hgnc").await.is_some());
        let stats = reader.stats(Some("hgnc")).await.unwrap();
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.l1_hits, 1);
    }

    #[tokio::test]
    async fn test_namespaces_are_isolated() {
        let (cache, _) = cache();
        cache.set("X", json!(1), "a", CacheTtl::Namespace).await;
        assert!(cache.get("X", "b").await.is_none());
        assert_eq!(cache.stats(Some("b")).await.unwrap().misses, 1);
    }

    #[tokio::test]
    async fn test_stats_report_hit_rate() {
        let (cache, _) = cache();
        cache.set("BRCA2", json!({"pli": 1.0}), "gnomad", CacheTtl::Namespace).await;
        for _ in 0..3 {
            assert!(cache.get("BRCA2", "gnomad").await.is_some());
        }
        assert!(cache.get("MISSING", "gnomad").await.is_none());

        let stats = cache.stats(Some("gnomad")).await.unwrap();
        assert!((stats.hit_rate - 0.75).abs() < f64::EPSILON);
        let body = serde_json::to_value(&stats).unwrap();
        assert_eq!(body["hit_rate"], 0.75);
    }

    #[tokio::test]
    async fn test_clear_namespace_drops_both_tiers() {
        let (cache, l2) = cache();
        cache.set("A", json!(1), "gnomad", CacheTtl::Namespace).await;
        cache.set("B", json!(2), "gnomad", CacheTtl::Namespace).await;
        cache.set("A", json!(3), "clinvar", CacheTtl::Namespace).await;

        assert_eq!(cache.clear_namespace("gnomad").await.unwrap(), 2);
        assert!(cache.get("A", "gnomad").await.is_none());
        assert_eq!(cache.get("A", "clinvar").await, Some(json!(3)));
        assert_eq!(l2.raw_len().await, 1);

        cache.set("A", json!(4), "gnomad", CacheTtl::Namespace).await;
        assert_eq!(cache.get("A", "gnomad").await, Some(json!(4)));
    }

    #[tokio::test]
    async fn test_ttl_expiry_excludes_entry() {
        let (cache, _) = cache();
        cache
            .set("K", json!("v"), "short", Duration::from_secs(1).into())
            .await;
        assert_eq!(cache.get("K", "short").await, Some(json!("v")));

        tokio::time::sleep(Duration::from_millis(1_200)).await;

        assert!(cache.get("K", "short").await.is_none());
        assert_eq!(cache.stats(Some("short")).await.unwrap().entries, 0);
        assert_eq!(cache.cleanup_expired().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_never_expiring_entry() {
        let (cache, _) = cache();
        cache.set("K", json!("v"), "pinned", CacheTtl::Never).await;
        assert_eq!(cache.cleanup_expired().await.unwrap(), 0);
        assert_eq!(cache.get("K", "pinned").await, Some(json!("v")));
    }

    #[tokio::test]
    async fn test_l2_failure_degrades_to_l1() {
        let (cache, l2) = cache();
        l2.set_unavailable(true);
        cache.set("K", json!(1), "ns", CacheTtl::Namespace).await;
        assert_eq!(cache.get("K", "ns").await, Some(json!(1)));
        assert!(cache.get("missing", "ns").await.is_none());
        assert!(cache.stats(Some("ns")).await.is_err());
    }

    #[tokio::test]
    async fn test_get_or_fetch_caches_only_valid() {
        let (cache, _) = cache();
        let calls = AtomicUsize::new(0);
        let is_valid = |v: &JsonValue| v.get("error").is_none();

        let fetched: Result<_, ()> = cache
            .get_or_fetch("G", "ns", CacheTtl::Namespace, is_valid, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(Some(json!({"error": "rate limited"})))
            })
            .await;
        assert!(fetched.unwrap().is_some());
        assert!(cache.get("G", "ns").await.is_none());

        for _ in 0..2 {
            let fetched: Result<_, ()> = cache
                .get_or_fetch("G", "ns", CacheTtl::Namespace, is_valid, || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(Some(json!({"ok": true})))
                })
                .await;
            assert_eq!(fetched.unwrap(), Some(json!({"ok": true})));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
