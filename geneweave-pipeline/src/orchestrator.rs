//! Update orchestrator.
//!
//! A run resolves a plan (sources and genes), runs the priority source to
//! completion, checkpoints, then fans the remaining sources out under a
//! semaphore. Each source task is isolated: its failure is recorded in the
//! summary and never aborts siblings. Derived views are refreshed and the
//! API response cache is cleared once, after every source has finished.

use crate::error::{PipelineError, PipelineResult};
use crate::invalidation::{InvalidationQueue, InvalidationWorker};
use crate::reports;
use crate::updater::SourceUpdater;
use chrono::Utc;
use futures_util::FutureExt;
use geneweave_core::constants::API_RESPONSES_NAMESPACE;
use geneweave_core::{
    GeneId, PipelineCheckpoint, PipelineConfig, RunError, RunStatus, RunSummary, SourceRunResult,
    SourceStatus, UpdateRequest, UpdateStrategy, ValidationReport,
};
use geneweave_sources::SourceRegistry;
use geneweave_storage::{AnnotationStore, TwoTierCache};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

const STATUS_RUNNING: &str = "running";
const STATUS_FAILED: &str = "failed";

/// What a run will do, resolved from the request or a checkpoint.
#[derive(Debug, Clone, PartialEq)]
struct RunPlan {
    strategy: UpdateStrategy,
    sources: Vec<String>,
    completed: Vec<String>,
    gene_ids: Vec<GeneId>,
    resumed: bool,
}

/// Multi-source annotation update orchestrator.
pub struct UpdatePipeline {
    store: Arc<dyn AnnotationStore>,
    cache: Arc<TwoTierCache>,
    registry: SourceRegistry,
    config: PipelineConfig,
    invalidation: InvalidationWorker,
}

impl UpdatePipeline {
    /// Build the orchestrator and spawn its invalidation worker. Must be
    /// called from within a Tokio runtime.
    pub fn new(
        store: Arc<dyn AnnotationStore>,
        cache: Arc<TwoTierCache>,
        registry: SourceRegistry,
        config: PipelineConfig,
    ) -> PipelineResult<Self> {
        config.validate()?;
        let invalidation = InvalidationWorker::spawn(cache.clone(), config.invalidation_queue_capacity);
        Ok(Self {
            store,
            cache,
            registry,
            config,
            invalidation,
        })
    }

    pub fn registry(&self) -> &SourceRegistry {
        &self.registry
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn cache(&self) -> &Arc<TwoTierCache> {
        &self.cache
    }

    pub fn invalidation(&self) -> InvalidationQueue {
        self.invalidation.queue()
    }

    /// Wait for every queued cache invalidation to be applied.
    pub async fn flush_invalidations(&self) {
        self.invalidation.queue().flush().await;
    }

    /// Drain the invalidation queue and stop its worker.
    pub async fn shutdown(&self) {
        self.invalidation.shutdown().await;
    }

    pub async fn check_source_status(&self) -> PipelineResult<Vec<SourceStatus>> {
        reports::check_source_status(&*self.store, &self.registry).await
    }

    pub async fn validate_annotations(&self, source: Option<&str>) -> PipelineResult<ValidationReport> {
        reports::validate_annotations(&*self.store, source).await
    }

    // ========================================================================
    // RUN
    // ========================================================================

    /// Run one update.
    ///
    /// Returns `Err` only for orchestrator-level failures (unknown sources,
    /// unreadable checkpoint, gene list unavailable). Source failures are
    /// reported in the summary.
    pub async fn run_update(&self, request: UpdateRequest) -> PipelineResult<RunSummary> {
        let started = Instant::now();
        let plan = self.plan(&request).await?;

        tracing::info!(
            strategy = %plan.strategy,
            sources = ?plan.sources,
            genes = plan.gene_ids.len(),
            resumed = plan.resumed,
            "Starting annotation update"
        );

        let mut summary = RunSummary {
            strategy: plan.strategy,
            status: RunStatus::Completed,
            sources_updated: Vec::new(),
            sources_failed: Vec::new(),
            genes_processed: plan.gene_ids.len(),
            results: Vec::new(),
            errors: Vec::new(),
            resumed_from_checkpoint: plan.resumed,
            duration_seconds: 0.0,
        };

        if plan.sources.is_empty() || plan.gene_ids.is_empty() {
            tracing::info!("Nothing to update");
            if plan.resumed {
                self.clear_checkpoint(&mut summary).await;
            }
            summary.duration_seconds = started.elapsed().as_secs_f64();
            return Ok(summary);
        }

        let updater = SourceUpdater::new(self.store.clone(), self.config.clone(), self.invalidation.queue());
        let priority = self.registry.priority().to_string();
        let force = request.force || plan.strategy.ignores_schedule();

        let mut checkpoint = PipelineCheckpoint::new(
            self.config.pipeline_id.clone(),
            plan.strategy,
            plan.sources.clone(),
            plan.completed.clone(),
            plan.gene_ids.clone(),
        );

        // === Priority source ===
        if plan.sources.contains(&priority) {
            if let Some(adapter) = self.registry.get(&priority) {
                let result = updater.run(adapter, &plan.gene_ids, force).await;
                if result.success {
                    checkpoint.mark_completed(&priority);
                }
                record(&mut summary, result);
            }
        }

        // === Checkpoint, then fan out ===
        let fan_out: Vec<String> = plan.sources.iter().filter(|s| **s != priority).cloned().collect();
        if !fan_out.is_empty() {
            self.save_checkpoint(&checkpoint, STATUS_RUNNING, &mut summary).await;
        }

        let gene_ids: Arc<[GeneId]> = plan.gene_ids.clone().into();
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_sources));
        let mut tasks: JoinSet<SourceRunResult> = JoinSet::new();

        for name in fan_out {
            let Some(adapter) = self.registry.get(&name) else {
                continue;
            };
            let updater = updater.clone();
            let semaphore = semaphore.clone();
            let gene_ids = gene_ids.clone();
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                let requested = gene_ids.len();
                match AssertUnwindSafe(updater.run(adapter, &gene_ids, force)).catch_unwind().await {
                    Ok(result) => result,
                    Err(_) => SourceRunResult {
                        error: Some("source task panicked".to_string()),
                        ..SourceRunResult::new(name, requested)
                    },
                }
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(result) => {
                    if result.success {
                        checkpoint.mark_completed(&result.source);
                        self.save_checkpoint(&checkpoint, STATUS_RUNNING, &mut summary).await;
                    }
                    record(&mut summary, result);
                }
                Err(e) => {
                    tracing::error!(error = %e, "Source task did not complete");
                    summary.errors.push(RunError {
                        source: None,
                        message: format!("source task did not complete: {}", e),
                    });
                }
            }
        }

        // === Post-run ===
        if !summary.sources_updated.is_empty() {
            self.refresh_views(&mut summary).await;
            self.invalidation.queue().enqueue(
                "annotation update",
                vec![API_RESPONSES_NAMESPACE.to_string()],
            );
        }

        if checkpoint.is_finished() {
            self.clear_checkpoint(&mut summary).await;
        } else {
            self.save_checkpoint(&checkpoint, STATUS_FAILED, &mut summary).await;
        }

        summary.status = if summary.sources_updated.is_empty() && !summary.sources_failed.is_empty() {
            RunStatus::Failed
        } else if summary.errors.is_empty() {
            RunStatus::Completed
        } else {
            RunStatus::CompletedWithErrors
        };
        summary.duration_seconds = started.elapsed().as_secs_f64();

        tracing::info!(
            status = ?summary.status,
            updated = ?summary.sources_updated,
            failed = ?summary.sources_failed,
            genes = summary.genes_processed,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Annotation update finished"
        );
        Ok(summary)
    }

    // ========================================================================
    // PLANNING
    // ========================================================================

    async fn plan(&self, request: &UpdateRequest) -> PipelineResult<RunPlan> {
        if let Some(sources) = &request.sources {
            let unknown = self.registry.unknown(sources);
            if !unknown.is_empty() {
                return Err(PipelineError::UnknownSources {
                    names: unknown.into_iter().map(str::to_string).collect(),
                });
            }
        }

        if !request.has_overrides() {
            if let Some(plan) = self.resume_plan().await? {
                return Ok(plan);
            }
        }

        let sources = self.select_sources(request).await?;
        let gene_ids = self.select_genes(request).await?;
        Ok(RunPlan {
            strategy: request.strategy,
            sources,
            completed: Vec::new(),
            gene_ids,
            resumed: false,
        })
    }

    async fn resume_plan(&self) -> PipelineResult<Option<RunPlan>> {
        let Some(snapshot) = self.store.load_checkpoint(&self.config.pipeline_id).await? else {
            return Ok(None);
        };
        let checkpoint = PipelineCheckpoint::from_json(&snapshot)?;

        let (sources, dropped): (Vec<String>, Vec<String>) = checkpoint
            .sources_remaining
            .iter()
            .cloned()
            .partition(|s| self.registry.contains(s));
        if !dropped.is_empty() {
            tracing::warn!(sources = ?dropped, "Checkpoint names sources that are no longer registered");
        }

        tracing::info!(
            pipeline_id = %checkpoint.pipeline_id,
            remaining = ?sources,
            completed = ?checkpoint.sources_completed,
            checkpoint_at = %checkpoint.timestamp,
            "Resuming from checkpoint"
        );
        Ok(Some(RunPlan {
            strategy: checkpoint.strategy,
            sources,
            completed: checkpoint.sources_completed,
            gene_ids: checkpoint.gene_ids,
            resumed: true,
        }))
    }

    /// Explicit sources as given (deduplicated), otherwise every active
    /// registered source that is due, or all of them when forced.
    async fn select_sources(&self, request: &UpdateRequest) -> PipelineResult<Vec<String>> {
        if let Some(explicit) = &request.sources {
            let mut sources: Vec<String> = Vec::with_capacity(explicit.len());
            for name in explicit {
                if !sources.contains(name) {
                    sources.push(name.clone());
                }
            }
            return Ok(sources);
        }

        if request.strategy == UpdateStrategy::Selective {
            return Err(PipelineError::invalid_request(
                "the selective strategy requires explicit sources",
            ));
        }

        let now = Utc::now();
        let ignore_schedule = request.force || request.strategy.ignores_schedule();
        let mut sources = Vec::new();
        for name in self.registry.names() {
            let Some(adapter) = self.registry.get(&name) else {
                continue;
            };
            let row = self.store.ensure_source(adapter.definition()).await?;
            if row.is_active && (ignore_schedule || row.is_due(now)) {
                sources.push(name);
            } else {
                tracing::debug!(source = %name, next_update = ?row.next_update, active = row.is_active, "Source not due");
            }
        }
        Ok(sources)
    }

    async fn select_genes(&self, request: &UpdateRequest) -> PipelineResult<Vec<GeneId>> {
        let genes = match (&request.gene_ids, request.strategy) {
            (Some(ids), _) => self.store.load_genes(Some(ids)).await?,
            (None, UpdateStrategy::Incremental) => {
                let active = self.active_sources().await?;
                self.store.genes_needing_update(&active).await?
            }
            (None, _) => self.store.load_genes(None).await?,
        };
        Ok(genes.into_iter().map(|g| g.gene_id).collect())
    }

    async fn active_sources(&self) -> PipelineResult<Vec<String>> {
        let mut active = Vec::new();
        for name in self.registry.names() {
            if let Some(adapter) = self.registry.get(&name) {
                if self.store.ensure_source(adapter.definition()).await?.is_active {
                    active.push(name);
                }
            }
        }
        Ok(active)
    }

    // ========================================================================
    // HELPERS
    // ========================================================================

    async fn save_checkpoint(&self, checkpoint: &PipelineCheckpoint, status: &str, summary: &mut RunSummary) {
        let saved = match checkpoint.to_json() {
            Ok(snapshot) => self
                .store
                .save_checkpoint(&self.config.pipeline_id, status, &snapshot)
                .await
                .map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };
        if let Err(message) = saved {
            tracing::error!(error = %message, "Failed to persist checkpoint");
            summary.errors.push(RunError {
                source: None,
                message: format!("checkpoint not saved: {}", message),
            });
        }
    }

    async fn clear_checkpoint(&self, summary: &mut RunSummary) {
        if let Err(e) = self.store.clear_checkpoint(&self.config.pipeline_id).await {
            tracing::error!(error = %e, "Failed to clear checkpoint");
            summary.errors.push(RunError {
                source: None,
                message: format!("checkpoint not cleared: {}", e),
            });
        }
    }

    /// Refresh derived views, concurrently first and exclusively if that
    /// fails.
    async fn refresh_views(&self, summary: &mut RunSummary) {
        let Err(e) = self.store.refresh_views(true).await else {
            return;
        };
        tracing::warn!(error = %e, "Concurrent view refresh failed; retrying exclusively");
        if let Err(e) = self.store.refresh_views(false).await {
            tracing::error!(error = %e, "View refresh failed");
            summary.errors.push(RunError {
                source: None,
                message: format!("view refresh failed: {}", e),
            });
        }
    }
}

impl std::fmt::Debug for UpdatePipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpdatePipeline")
            .field("registry", &self.registry)
            .field("config", &self.config)
            .field("cache", &self.cache)
            .field("invalidation", &self.invalidation)
            .finish()
    }
}

fn record(summary: &mut RunSummary, result: SourceRunResult) {
    if result.success {
        summary.sources_updated.push(result.source.clone());
    } else {
        summary.sources_failed.push(result.source.clone());
        summary.errors.push(RunError {
            source: Some(result.source.clone()),
            message: result
                .error
                .clone()
                .unwrap_or_else(|| "source update failed".to_string()),
        });
    }
    summary.results.push(result);
}
