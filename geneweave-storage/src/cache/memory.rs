//! In-memory persistent-tier stand-in with `cache_entries` semantics.

use super::traits::{CacheEntry, CacheStore, CacheUsage};
use async_trait::async_trait;
use geneweave_core::{CacheError, CacheResult, Timestamp};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;

/// `CacheStore` backed by a map keyed on `cache_key`.
#[derive(Debug, Default)]
pub struct InMemoryCacheStore {
    entries: RwLock<HashMap<String, CacheEntry>>,
    unavailable: AtomicBool,
}

impl InMemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail, to exercise degraded paths.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Rows physically present, live or expired.
    pub async fn raw_len(&self) -> usize {
        self.entries.read().await.len()
    }

    fn check_available(&self, operation: &str) -> CacheResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(CacheError::Backend {
                operation: operation.to_string(),
                reason: "store unavailable".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl CacheStore for InMemoryCacheStore {
    async fn get(&self, cache_key: &str, now: Timestamp) -> CacheResult<Option<CacheEntry>> {
        self.check_available("get")?;
        let mut entries = self.entries.write().await;
        match entries.get_mut(cache_key) {
            Some(entry) if !entry.is_expired(now) => {
                entry.access_count += 1;
                entry.last_accessed = now;
                Ok(Some(entry.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn put(&self, entry: CacheEntry) -> CacheResult<()> {
        self.check_available("put")?;
        self.entries
            .write()
            .await
            .insert(entry.cache_key.clone(), entry);
        Ok(())
    }

    async fn delete(&self, cache_key: &str) -> CacheResult<bool> {
        self.check_available("delete")?;
        Ok(self.entries.write().await.remove(cache_key).is_some())
    }

    async fn delete_namespace(&self, namespace: &str) -> CacheResult<u64> {
        self.check_available("delete_namespace")?;
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, e| e.namespace != namespace);
        Ok((before - entries.len()) as u64)
    }

    async fn delete_expired(&self, now: Timestamp) -> CacheResult<u64> {
        self.check_available("delete_expired")?;
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, e| !e.is_expired(now));
        Ok((before - entries.len()) as u64)
    }

    async fn usage(&self, namespace: Option<&str>, now: Timestamp) -> CacheResult<CacheUsage> {
        self.check_available("usage")?;
        let entries = self.entries.read().await;
        let usage = entries
            .values()
            .filter(|e| !e.is_expired(now))
            .filter(|e| namespace.map_or(true, |ns| e.namespace == ns))
            .fold(CacheUsage::default(), |mut acc, e| {
                acc.entries += 1;
                acc.size_bytes += e.data_size;
                acc
            });
        Ok(usage)
    }
}
