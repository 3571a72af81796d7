//! Error types for geneweave operations

use std::time::Duration;
use thiserror::Error;

/// Errors raised while talking to an external annotation source.
///
/// The variants follow the failure taxonomy the update engine reacts to:
/// transient failures are retried, permanent failures propagate, validation
/// failures count as misses, and an open circuit fails fast.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SourceError {
    #[error("Transient failure from {source_name} (status {status:?}): {message}")]
    Transient {
        source_name: String,
        status: Option<u16>,
        message: String,
    },

    #[error("Permanent failure from {source_name} (status {status:?}): {message}")]
    Permanent {
        source_name: String,
        status: Option<u16>,
        message: String,
    },

    #[error("Invalid payload from {source_name}: {reason}")]
    Validation { source_name: String, reason: String },

    #[error("{source_name} has no record for {key}")]
    NotFound { source_name: String, key: String },

    #[error("Circuit open for {source_name}, call rejected")]
    CircuitOpen { source_name: String },

    #[error("{operation} on {source_name} exceeded its budget of {budget:?}")]
    Timeout {
        source_name: String,
        operation: String,
        budget: Duration,
    },

    #[error("Bulk file error for {source_name}: {reason}")]
    BulkFile { source_name: String, reason: String },
}

impl SourceError {
    /// Name of the source that produced this error.
    pub fn source_name(&self) -> &str {
        match self {
            Self::Transient { source_name, .. }
            | Self::Permanent { source_name, .. }
            | Self::Validation { source_name, .. }
            | Self::NotFound { source_name, .. }
            | Self::CircuitOpen { source_name }
            | Self::Timeout { source_name, .. }
            | Self::BulkFile { source_name, .. } => source_name,
        }
    }

    /// Whether a retry layer may attempt the call again.
    ///
    /// Validation failures are retryable: an upstream that returned an
    /// error marker inside a 200 response frequently recovers.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Transient { .. } | Self::Timeout { .. } | Self::Validation { .. }
        )
    }

    /// Whether this failure should count against the circuit breaker.
    ///
    /// A missing record is a healthy answer from the upstream.
    pub fn trips_breaker(&self) -> bool {
        !matches!(
            self,
            Self::NotFound { .. } | Self::CircuitOpen { .. } | Self::Validation { .. }
        )
    }

    pub fn transient(source_name: impl Into<String>, status: Option<u16>, message: impl Into<String>) -> Self {
        Self::Transient {
            source_name: source_name.into(),
            status,
            message: message.into(),
        }
    }

    pub fn permanent(source_name: impl Into<String>, status: Option<u16>, message: impl Into<String>) -> Self {
        Self::Permanent {
            source_name: source_name.into(),
            status,
            message: message.into(),
        }
    }

    pub fn validation(source_name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Validation {
            source_name: source_name.into(),
            reason: reason.into(),
        }
    }

    pub fn not_found(source_name: impl Into<String>, key: impl Into<String>) -> Self {
        Self::NotFound {
            source_name: source_name.into(),
            key: key.into(),
        }
    }
}

/// Persistent store errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("Database error during {operation}: {reason}")]
    Database { operation: String, reason: String },

    #[error("Duplicate key on {entity} '{key}' created concurrently")]
    ConstraintRace { entity: String, key: String },

    #[error("Serialization error: {reason}")]
    Serialization { reason: String },

    #[error("{entity} not found: {key}")]
    NotFound { entity: String, key: String },

    #[error("Connection pool error: {reason}")]
    Pool { reason: String },
}

impl StoreError {
    pub fn database(operation: impl Into<String>, reason: impl ToString) -> Self {
        Self::Database {
            operation: operation.into(),
            reason: reason.to_string(),
        }
    }
}

/// Cache layer errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("Cache backend error during {operation}: {reason}")]
    Backend { operation: String, reason: String },

    #[error("Cache serialization error: {reason}")]
    Serialization { reason: String },
}

/// Checkpoint decoding errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CheckpointError {
    #[error("Unsupported checkpoint schema version {found} (expected {expected})")]
    UnsupportedVersion { found: u32, expected: u32 },

    #[error("Malformed checkpoint: {reason}")]
    Malformed { reason: String },
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required configuration field: {field}")]
    MissingRequired { field: String },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },
}

/// Master error type for all geneweave errors.
#[derive(Debug, Clone, Error)]
pub enum GeneweaveError {
    #[error("Source error: {0}")]
    Source(#[from] SourceError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

/// Result type alias for geneweave operations.
pub type GeneweaveResult<T> = Result<T, GeneweaveError>;

/// Result type alias for source adapter operations.
pub type SourceResult<T> = Result<T, SourceError>;

/// Result type alias for persistent store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Result type alias for cache operations.
pub type CacheResult<T> = Result<T, CacheError>;

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_is_retryable() {
        let err = SourceError::transient("gnomad", Some(503), "unavailable");
        assert!(err.is_retryable());
        assert!(err.trips_breaker());
        assert_eq!(err.source_name(), "gnomad");
    }

    #[test]
    fn test_permanent_is_not_retryable() {
        let err = SourceError::permanent("hgnc", Some(404), "no such symbol");
        assert!(!err.is_retryable());
        assert!(err.trips_breaker());
    }

    #[test]
    fn test_not_found_does_not_trip_breaker() {
        let err = SourceError::not_found("clinvar", "BRCA1");
        assert!(!err.is_retryable());
        assert!(!err.trips_breaker());
        let msg = format!("{}", err);
        assert!(msg.contains("clinvar"));
        assert!(msg.contains("BRCA1"));
    }

    #[test]
    fn test_timeout_display() {
        let err = SourceError::Timeout {
            source_name: "clinvar".to_string(),
            operation: "bulk parse".to_string(),
            budget: Duration::from_secs(42),
        };
        assert!(err.is_retryable());
        let msg = format!("{}", err);
        assert!(msg.contains("bulk parse"));
        assert!(msg.contains("42s"));
    }

    #[test]
    fn test_checkpoint_error_display() {
        let err = CheckpointError::UnsupportedVersion {
            found: 9,
            expected: 2,
        };
        let msg = format!("{}", err);
        assert!(msg.contains("9"));
        assert!(msg.contains("expected 2"));
    }

    #[test]
    fn test_geneweave_error_from_variants() {
        let source = GeneweaveError::from(SourceError::CircuitOpen {
            source_name: "gnomad".to_string(),
        });
        assert!(matches!(source, GeneweaveError::Source(_)));

        let store = GeneweaveError::from(StoreError::database("upsert", "boom"));
        assert!(matches!(store, GeneweaveError::Store(_)));

        let config = GeneweaveError::from(ConfigError::MissingRequired {
            field: "db_host".to_string(),
        });
        assert!(matches!(config, GeneweaveError::Config(_)));
    }
}
