//! Namespaced two-tier cache.
//!
//! - [`TwoTierCache`]: in-process LRU (moka) over a persistent [`CacheStore`]
//! - [`InMemoryCacheStore`]: persistent-tier stand-in for tests and local runs
//! - `PgCacheStore` (in `crate::pg`): the `cache_entries` table

mod memory;
mod traits;
mod two_tier;

pub use memory::InMemoryCacheStore;
pub use traits::{CacheEntry, CacheStats, CacheStore, CacheUsage};
pub use two_tier::{CacheTtl, TwoTierCache};
