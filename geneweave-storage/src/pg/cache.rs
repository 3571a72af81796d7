//! `CacheStore` over the `cache_entries` table.

use super::as_count;
use crate::cache::{CacheEntry, CacheStore, CacheUsage};
use async_trait::async_trait;
use deadpool_postgres::Pool;
use geneweave_core::{CacheError, CacheResult, Timestamp};
use tokio_postgres::Row;

const ENTRY_COLUMNS: &str =
    "namespace, cache_key, data, expires_at, access_count, last_accessed, data_size";

fn backend(operation: &str, e: impl ToString) -> CacheError {
    CacheError::Backend {
        operation: operation.to_string(),
        reason: e.to_string(),
    }
}

fn entry_from_row(row: &Row) -> CacheEntry {
    CacheEntry {
        namespace: row.get(0),
        cache_key: row.get(1),
        data: row.get(2),
        expires_at: row.get(3),
        access_count: as_count(row.get(4)),
        last_accessed: row.get(5),
        data_size: as_count(row.get(6)),
    }
}

/// Postgres-backed persistent cache tier.
#[derive(Clone)]
pub struct PgCacheStore {
    pool: Pool,
}

impl PgCacheStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    async fn conn(&self, operation: &str) -> CacheResult<deadpool_postgres::Object> {
        self.pool.get().await.map_err(|e| backend(operation, e))
    }
}

impl std::fmt::Debug for PgCacheStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgCacheStore")
            .field("pool_size", &self.pool.status().size)
            .finish()
    }
}

#[async_trait]
impl CacheStore for PgCacheStore {
    async fn get(&self, cache_key: &str, now: Timestamp) -> CacheResult<Option<CacheEntry>> {
        let conn = self.conn("get").await?;
        let sql = format!(
            "UPDATE cache_entries \
             SET access_count = access_count + 1, last_accessed = $2 \
             WHERE cache_key = $1 AND (expires_at IS NULL OR expires_at > $2) \
             RETURNING {}",
            ENTRY_COLUMNS
        );
        let row = conn
            .query_opt(&sql, &[&cache_key, &now])
            .await
            .map_err(|e| backend("get", e))?;
        Ok(row.as_ref().map(entry_from_row))
    }

    async fn put(&self, entry: CacheEntry) -> CacheResult<()> {
        let conn = self.conn("put").await?;
        let data_size = i64::try_from(entry.data_size).unwrap_or(i64::MAX);
        conn.execute(
            "INSERT INTO cache_entries \
             (namespace, cache_key, data, expires_at, access_count, last_accessed, data_size, created_at) \
             VALUES ($1, $2, $3, $4, 0, $5, $6, $5) \
             ON CONFLICT (cache_key) DO UPDATE SET \
               namespace = EXCLUDED.namespace, \
               data = EXCLUDED.data, \
               expires_at = EXCLUDED.expires_at, \
               last_accessed = EXCLUDED.last_accessed, \
               data_size = EXCLUDED.data_size",
            &[
                &entry.namespace,
                &entry.cache_key,
                &entry.data,
                &entry.expires_at,
                &entry.last_accessed,
                &data_size,
            ],
        )
        .await
        .map_err(|e| backend("put", e))?;
        Ok(())
    }

    async fn delete(&self, cache_key: &str) -> CacheResult<bool> {
        let conn = self.conn("delete").await?;
        let removed = conn
            .execute("DELETE FROM cache_entries WHERE cache_key = $1", &[&cache_key])
            .await
            .map_err(|e| backend("delete", e))?;
        Ok(removed > 0)
    }

    async fn delete_namespace(&self, namespace: &str) -> CacheResult<u64> {
        let conn = self.conn("delete_namespace").await?;
        conn.execute("DELETE FROM cache_entries WHERE namespace = $1", &[&namespace])
            .await
            .map_err(|e| backend("delete_namespace", e))
    }

    async fn delete_expired(&self, now: Timestamp) -> CacheResult<u64> {
        let conn = self.conn("delete_expired").await?;
        conn.execute(
            "DELETE FROM cache_entries WHERE expires_at IS NOT NULL AND expires_at <= $1",
            &[&now],
        )
        .await
        .map_err(|e| backend("delete_expired", e))
    }

    async fn usage(&self, namespace: Option<&str>, now: Timestamp) -> CacheResult<CacheUsage> {
        let conn = self.conn("usage").await?;
        let row = conn
            .query_one(
                "SELECT COUNT(*), COALESCE(SUM(data_size), 0)::bigint FROM cache_entries \
                 WHERE (expires_at IS NULL OR expires_at > $1) \
                   AND ($2::text IS NULL OR namespace = $2)",
                &[&now, &namespace],
            )
            .await
            .map_err(|e| backend("usage", e))?;
        Ok(CacheUsage {
            entries: as_count(row.get(0)),
            size_bytes: as_count(row.get(1)),
        })
    }
}
