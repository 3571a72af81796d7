//! Orchestrator-level errors.
//!
//! Anything returned as a `PipelineError` from `run_update` aborted the
//! whole run. Source-level failures never surface here; they are recorded
//! in the run summary instead.

use geneweave_core::{
    CacheError, CheckpointError, ConfigError, GeneweaveError, SourceError, StoreError,
};
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PipelineError {
    #[error("Unknown sources requested: {}", names.join(", "))]
    UnknownSources { names: Vec<String> },

    #[error("Invalid update request: {reason}")]
    InvalidRequest { reason: String },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Source error: {0}")]
    Source(#[from] SourceError),

    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Telemetry error: {reason}")]
    Telemetry { reason: String },
}

impl PipelineError {
    pub fn invalid_request(reason: impl Into<String>) -> Self {
        Self::InvalidRequest {
            reason: reason.into(),
        }
    }
}

impl From<GeneweaveError> for PipelineError {
    fn from(err: GeneweaveError) -> Self {
        match err {
            GeneweaveError::Source(e) => Self::Source(e),
            GeneweaveError::Store(e) => Self::Store(e),
            GeneweaveError::Cache(e) => Self::Cache(e),
            GeneweaveError::Checkpoint(e) => Self::Checkpoint(e),
            GeneweaveError::Config(e) => Self::Config(e),
        }
    }
}

pub type PipelineResult<T> = Result<T, PipelineError>;
