//! GENEWEAVE Core - Domain Types
//!
//! Entities, the error taxonomy, configuration and run reports shared by
//! every other crate. No I/O lives here.

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

pub mod checkpoint;
pub mod config;
pub mod constants;
pub mod entities;
pub mod enums;
pub mod error;
pub mod payload;
pub mod report;

pub use checkpoint::{PipelineCheckpoint, CHECKPOINT_SCHEMA_VERSION};
pub use config::{
    CacheConfig, CircuitBreakerConfig, ClinvarConfig, PipelineConfig, RetryConfig,
    SourceHttpConfig,
};
pub use entities::{
    AnnotationKey, AnnotationSource, Gene, GeneAnnotation, GeneIdentifiers, SourceDefinition,
};
pub use enums::{CircuitState, RunStatus, UpdateStrategy, UpdateStrategyParseError};
pub use error::{
    CacheError, CacheResult, CheckpointError, ConfigError, GeneweaveError, GeneweaveResult,
    SourceError, SourceResult, StoreError, StoreResult,
};
pub use payload::{is_valid_payload, payload_issue, PayloadIssue};
pub use report::{
    AnnotationStats, RunError, RunSummary, SourceRunResult, SourceStatus, SourceValidation,
    UpdateRequest, ValidationReport,
};

// ============================================================================
// IDENTITY TYPES
// ============================================================================

/// Database identifier of a gene row.
pub type GeneId = i64;

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

/// Content-hashed cache key for a `namespace:key` pair (hex SHA-256).
pub fn cache_key_hash(namespace: &str, key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(namespace.as_bytes());
    hasher.update(b":");
    hasher.update(key.as_bytes());
    hex::encode(hasher.finalize())
}
