//! GENEWEAVE Storage
//!
//! Persistence seams for the update engine:
//! - [`AnnotationStore`]: genes, annotation rows, source rows, checkpoints
//! - [`cache`]: the namespaced two-tier cache and its persistent tier
//!
//! Each seam has a Postgres implementation ([`pg`]) and an in-memory one
//! with identical semantics.

pub mod cache;
pub mod memory;
pub mod pg;
pub mod store;

pub use cache::{
    CacheEntry, CacheStats, CacheStore, CacheTtl, CacheUsage, InMemoryCacheStore, TwoTierCache,
};
pub use memory::{InMemoryAnnotationStore, WriteRecord};
pub use pg::{DbConfig, PgAnnotationStore, PgCacheStore};
pub use store::{checkpoint_key, AnnotationStore, UpsertOutcome};
