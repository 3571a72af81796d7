//! PostgreSQL backends
//!
//! Connection pooling uses deadpool-postgres. Both stores issue plain SQL
//! against the tables owned by the external schema:
//! `genes`, `gene_annotations`, `annotation_sources`, `cache_entries` and
//! `data_source_progress`.

mod cache;
mod store;

pub use cache::PgCacheStore;
pub use store::PgAnnotationStore;

use deadpool_postgres::{Config, ManagerConfig, Pool, RecyclingMethod, Runtime};
use geneweave_core::StoreError;
use std::time::Duration;
use tokio_postgres::NoTls;

// ============================================================================
// CONNECTION POOL CONFIGURATION
// ============================================================================

/// Database connection pool configuration.
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// PostgreSQL host
    pub host: String,
    /// PostgreSQL port
    pub port: u16,
    /// Database name
    pub dbname: String,
    /// Database user
    pub user: String,
    /// Database password
    pub password: String,
    /// Maximum pool size
    pub max_size: usize,
    /// Connection timeout
    pub timeout: Duration,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            dbname: "geneweave".to_string(),
            user: "postgres".to_string(),
            password: "".to_string(),
            max_size: 16,
            timeout: Duration::from_secs(30),
        }
    }
}

impl DbConfig {
    /// Create a new database configuration from environment variables.
    pub fn from_env() -> Self {
        Self {
            host: std::env::var("GENEWEAVE_DB_HOST").unwrap_or_else(|_| "localhost".to_string()),
            port: std::env::var("GENEWEAVE_DB_PORT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(5432),
            dbname: std::env::var("GENEWEAVE_DB_NAME").unwrap_or_else(|_| "geneweave".to_string()),
            user: std::env::var("GENEWEAVE_DB_USER").unwrap_or_else(|_| "postgres".to_string()),
            password: std::env::var("GENEWEAVE_DB_PASSWORD").unwrap_or_default(),
            max_size: std::env::var("GENEWEAVE_DB_POOL_SIZE")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(16),
            timeout: Duration::from_secs(
                std::env::var("GENEWEAVE_DB_TIMEOUT")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(30),
            ),
        }
    }

    /// Create a connection pool from this configuration.
    pub fn create_pool(&self) -> Result<Pool, StoreError> {
        let mut cfg = Config::new();
        cfg.host = Some(self.host.clone());
        cfg.port = Some(self.port);
        cfg.dbname = Some(self.dbname.clone());
        cfg.user = Some(self.user.clone());
        cfg.password = Some(self.password.clone());
        cfg.connect_timeout = Some(self.timeout);

        cfg.manager = Some(ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        });
        cfg.pool = Some(deadpool_postgres::PoolConfig::new(self.max_size));

        cfg.create_pool(Some(Runtime::Tokio1), NoTls)
            .map_err(|e| StoreError::Pool {
                reason: format!("Failed to create pool: {}", e),
            })
    }
}

pub(crate) async fn get_conn(pool: &Pool) -> Result<deadpool_postgres::Object, StoreError> {
    pool.get().await.map_err(|e| StoreError::Pool {
        reason: e.to_string(),
    })
}

pub(crate) fn is_unique_violation(e: &tokio_postgres::Error) -> bool {
    e.as_db_error()
        .is_some_and(|db| db.code() == &tokio_postgres::error::SqlState::UNIQUE_VIOLATION)
}

/// Clamp a non-negative BIGINT count into `u64`.
pub(crate) fn as_count(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}
