//! GENEWEAVE Pipeline
//!
//! The multi-source annotation update orchestrator:
//! - [`UpdatePipeline`]: strategy-driven runs with priority ordering,
//!   bounded fan-out, checkpoint/resume and post-run refresh
//! - [`SourceUpdater`]: batch-first update of one source with per-gene
//!   fallback and backoff retry
//! - [`InvalidationWorker`]: bounded background cache invalidation
//! - status and validation reports, tracing setup

pub mod error;
pub mod invalidation;
pub mod orchestrator;
pub mod reports;
pub mod telemetry;
pub mod updater;

pub use error::{PipelineError, PipelineResult};
pub use invalidation::{InvalidationQueue, InvalidationSnapshot, InvalidationWorker};
pub use orchestrator::UpdatePipeline;
pub use reports::{check_source_status, validate_annotations};
pub use telemetry::{init_tracing, LogFormat, TelemetryConfig};
pub use updater::{SourceUpdateError, SourceUpdater};
