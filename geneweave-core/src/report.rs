//! Request and report types exchanged with the trigger interface.

use crate::{CircuitState, GeneId, RunStatus, Timestamp, UpdateStrategy};
use serde::{Deserialize, Serialize};

/// Parameters of a single orchestrator run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateRequest {
    pub strategy: UpdateStrategy,
    /// Explicit source names; validated against the registry.
    pub sources: Option<Vec<String>>,
    /// Explicit gene ids; bypasses strategy gene selection.
    pub gene_ids: Option<Vec<GeneId>>,
    pub force: bool,
}

impl UpdateRequest {
    pub fn new(strategy: UpdateStrategy) -> Self {
        Self {
            strategy,
            sources: None,
            gene_ids: None,
            force: false,
        }
    }

    pub fn with_sources<I, S>(mut self, sources: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.sources = Some(sources.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_gene_ids(mut self, gene_ids: Vec<GeneId>) -> Self {
        self.gene_ids = Some(gene_ids);
        self
    }

    pub fn forced(mut self) -> Self {
        self.force = true;
        self
    }

    /// Whether the caller overrides what a checkpoint would resume.
    pub fn has_overrides(&self) -> bool {
        self.sources.is_some() || self.gene_ids.is_some()
    }
}

/// Outcome of one source within a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceRunResult {
    pub source: String,
    pub success: bool,
    pub genes_requested: usize,
    /// Rows written through the batch path.
    pub batch_updated: usize,
    /// Rows written through the per-gene fallback path.
    pub fallback_updated: usize,
    /// Rows written by the backoff retry phase.
    pub retry_updated: usize,
    pub failed_gene_ids: Vec<GeneId>,
    pub duration_seconds: f64,
    pub error: Option<String>,
}

impl SourceRunResult {
    pub fn new(source: impl Into<String>, genes_requested: usize) -> Self {
        Self {
            source: source.into(),
            genes_requested,
            ..Default::default()
        }
    }

    pub fn genes_updated(&self) -> usize {
        self.batch_updated + self.fallback_updated + self.retry_updated
    }
}

/// A non-fatal error recorded during a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunError {
    pub source: Option<String>,
    pub message: String,
}

/// Summary returned by every run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub strategy: UpdateStrategy,
    pub status: RunStatus,
    pub sources_updated: Vec<String>,
    pub sources_failed: Vec<String>,
    pub genes_processed: usize,
    pub results: Vec<SourceRunResult>,
    pub errors: Vec<RunError>,
    pub resumed_from_checkpoint: bool,
    pub duration_seconds: f64,
}

impl RunSummary {
    /// The success flag surfaced to HTTP-facing callers.
    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn result_for(&self, source: &str) -> Option<&SourceRunResult> {
        self.results.iter().find(|r| r.source == source)
    }
}

/// Per-source status row for `CheckSourceStatus`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceStatus {
    pub source_name: String,
    pub display_name: String,
    pub is_active: bool,
    pub is_registered: bool,
    pub last_update: Option<Timestamp>,
    pub next_update: Option<Timestamp>,
    pub is_due: bool,
    pub annotation_count: u64,
    pub circuit_state: Option<CircuitState>,
}

/// Raw annotation counts for one source, as computed by the store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnnotationStats {
    pub source: String,
    pub total: u64,
    pub empty_payloads: u64,
    pub error_payloads: u64,
    pub genes_without_annotation: u64,
}

/// Validation outcome for one source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceValidation {
    pub source: String,
    pub total_annotations: u64,
    pub empty_payloads: u64,
    pub error_payloads: u64,
    pub genes_missing: u64,
    pub coverage_percent: f64,
    pub issues: Vec<String>,
    pub is_valid: bool,
}

impl SourceValidation {
    /// Derive the validation verdict from raw counts.
    pub fn from_stats(stats: &AnnotationStats, total_genes: u64) -> Self {
        let mut issues = Vec::new();
        if stats.empty_payloads > 0 {
            issues.push(format!("{} empty payloads", stats.empty_payloads));
        }
        if stats.error_payloads > 0 {
            issues.push(format!("{} payloads carry error markers", stats.error_payloads));
        }
        if stats.genes_without_annotation > 0 {
            issues.push(format!(
                "{} genes have no annotation",
                stats.genes_without_annotation
            ));
        }

        let coverage_percent = if total_genes == 0 {
            0.0
        } else {
            let covered = total_genes.saturating_sub(stats.genes_without_annotation);
            (covered as f64 / total_genes as f64) * 100.0
        };

        Self {
            source: stats.source.clone(),
            total_annotations: stats.total,
            empty_payloads: stats.empty_payloads,
            error_payloads: stats.error_payloads,
            genes_missing: stats.genes_without_annotation,
            coverage_percent,
            is_valid: stats.empty_payloads == 0 && stats.error_payloads == 0,
            issues,
        }
    }
}

/// Report returned by `ValidateAnnotations`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub generated_at: Timestamp,
    pub total_genes: u64,
    pub sources: Vec<SourceValidation>,
    pub is_valid: bool,
}
