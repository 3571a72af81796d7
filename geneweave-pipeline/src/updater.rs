//! Per-source update with recovery.
//!
//! One source, one gene set:
//! 1. batch fetch and chunked bulk upsert
//! 2. per-gene fetch for whatever the batch did not cover, committed every
//!    `commit_interval` genes
//! 3. per-gene backoff retry for genes that still failed
//!
//! A successful update stamps the source row and enqueues invalidation of
//! the source's cache namespace and the derived annotations namespace.

use crate::invalidation::InvalidationQueue;
use chrono::Utc;
use geneweave_core::constants::ANNOTATIONS_NAMESPACE;
use geneweave_core::{
    Gene, GeneAnnotation, GeneId, PipelineConfig, SourceError, SourceRunResult, StoreError,
};
use geneweave_sources::{AnnotationSourceAdapter, RetryPolicy};
use geneweave_storage::AnnotationStore;
use serde_json::Value as JsonValue;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;

/// Why a source update as a whole failed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SourceUpdateError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("all {failed} genes failed; last error: {last_error}")]
    AllGenesFailed { failed: usize, last_error: String },

    #[error("timed out after {seconds}s")]
    TimedOut { seconds: u64 },
}

/// How one gene's fallback attempt ended.
enum GeneOutcome {
    Stored(GeneAnnotation),
    NoData,
    Failed(String),
}

/// Runs the update algorithm for a single source.
#[derive(Clone)]
pub struct SourceUpdater {
    store: Arc<dyn AnnotationStore>,
    config: PipelineConfig,
    invalidation: InvalidationQueue,
}

impl SourceUpdater {
    pub fn new(
        store: Arc<dyn AnnotationStore>,
        config: PipelineConfig,
        invalidation: InvalidationQueue,
    ) -> Self {
        Self {
            store,
            config,
            invalidation,
        }
    }

    /// Update `adapter` for `gene_ids`, bounded by the configured per-source
    /// timeout. Never returns an error: failures land in the result.
    pub async fn run(
        &self,
        adapter: Arc<dyn AnnotationSourceAdapter>,
        gene_ids: &[GeneId],
        force: bool,
    ) -> SourceRunResult {
        let started = Instant::now();
        let mut result = SourceRunResult::new(adapter.name(), gene_ids.len());

        let outcome = match self.config.source_timeout {
            Some(budget) => {
                match tokio::time::timeout(budget, self.update(&*adapter, gene_ids, force, &mut result))
                    .await
                {
                    Ok(outcome) => outcome,
                    Err(_) => Err(SourceUpdateError::TimedOut {
                        seconds: budget.as_secs(),
                    }),
                }
            }
            None => self.update(&*adapter, gene_ids, force, &mut result).await,
        };

        match outcome {
            Ok(()) => result.success = true,
            Err(e) => {
                tracing::error!(source = %adapter.name(), error = %e, "Source update failed");
                result.success = false;
                result.error = Some(e.to_string());
            }
        }
        result.duration_seconds = started.elapsed().as_secs_f64();
        result
    }

    #[tracing::instrument(skip_all, fields(source = %adapter.name(), genes = gene_ids.len()))]
    async fn update(
        &self,
        adapter: &dyn AnnotationSourceAdapter,
        gene_ids: &[GeneId],
        force: bool,
        result: &mut SourceRunResult,
    ) -> Result<(), SourceUpdateError> {
        let source_name = adapter.name().to_string();
        self.store.ensure_source(adapter.definition()).await?;

        // Resolve by id so the priority source's identifier write-back is
        // visible here.
        let mut genes = self.store.load_genes(Some(gene_ids)).await?;
        let position: HashMap<GeneId, usize> =
            gene_ids.iter().enumerate().map(|(i, id)| (*id, i)).collect();
        genes.sort_by_key(|g| position.get(&g.gene_id).copied().unwrap_or(usize::MAX));
        if genes.is_empty() {
            tracing::info!(source = %source_name, "No genes to update");
            self.finish(&source_name).await?;
            return Ok(());
        }

        if let Err(e) = adapter.ensure_bulk_data_loaded(force).await {
            tracing::warn!(source = %source_name, error = %e, "Bulk data unavailable; relying on per-gene fetches");
        }

        // === Batch path ===
        let batch = match adapter.fetch_batch(&genes).await {
            Ok(batch) => batch,
            Err(e) => {
                tracing::warn!(source = %source_name, error = %e, "Batch fetch failed; falling back to per-gene fetches");
                HashMap::new()
            }
        };

        let mut stored: HashSet<GeneId> = HashSet::new();
        let rows: Vec<GeneAnnotation> = genes
            .iter()
            .filter_map(|gene| {
                let payload = batch.get(&gene.gene_id)?;
                if !adapter.is_valid(payload) {
                    tracing::debug!(source = %source_name, gene_id = gene.gene_id, "Discarding invalid batch payload");
                    return None;
                }
                Some(self.row(adapter, gene.gene_id, payload.clone()))
            })
            .collect();

        for chunk in rows.chunks(self.config.upsert_chunk_size.max(1)) {
            match self.store.upsert_annotations(chunk).await {
                Ok(outcome) => {
                    result.batch_updated += chunk.len();
                    stored.extend(chunk.iter().map(|r| r.gene_id));
                    self.write_back_identifiers(adapter, chunk).await;
                    tracing::debug!(
                        source = %source_name,
                        inserted = outcome.inserted,
                        updated = outcome.updated,
                        "Upserted batch chunk"
                    );
                }
                Err(e) => {
                    tracing::warn!(
                        source = %source_name,
                        rows = chunk.len(),
                        error = %e,
                        "Batch chunk upsert failed; genes will be fetched individually"
                    );
                }
            }
        }

        // === Per-gene fallback ===
        let remaining: Vec<&Gene> = genes.iter().filter(|g| !stored.contains(&g.gene_id)).collect();
        let mut failed: Vec<&Gene> = Vec::new();
        let mut last_error = String::new();

        if !remaining.is_empty() {
            tracing::info!(
                source = %source_name,
                batch_updated = result.batch_updated,
                fallback = remaining.len(),
                "Fetching genes individually"
            );
        }

        for group in remaining.chunks(self.config.commit_interval.max(1)) {
            let mut pending: Vec<GeneAnnotation> = Vec::with_capacity(group.len());
            let mut pending_genes: Vec<&Gene> = Vec::with_capacity(group.len());
            for &gene in group {
                match self.fetch_gene(adapter, gene).await {
                    GeneOutcome::Stored(row) => {
                        pending.push(row);
                        pending_genes.push(gene);
                    }
                    GeneOutcome::NoData => {}
                    GeneOutcome::Failed(e) => {
                        last_error = e;
                        failed.push(gene);
                    }
                }
            }
            if pending.is_empty() {
                continue;
            }
            match self.store.upsert_annotations(&pending).await {
                Ok(_) => {
                    result.fallback_updated += pending.len();
                    self.write_back_identifiers(adapter, &pending).await;
                    tracing::debug!(
                        source = %source_name,
                        committed = pending.len(),
                        fallback_updated = result.fallback_updated,
                        "Committed per-gene progress"
                    );
                }
                Err(e) => {
                    last_error = e.to_string();
                    failed.extend(pending_genes);
                }
            }
        }

        // === Backoff retry ===
        let policy = RetryPolicy::new(self.config.gene_retry());
        for gene in failed {
            match self.retry_gene(adapter, &policy, gene).await {
                Ok(true) => result.retry_updated += 1,
                Ok(false) => {}
                Err(e) => {
                    last_error = e;
                    result.failed_gene_ids.push(gene.gene_id);
                }
            }
        }

        if !result.failed_gene_ids.is_empty() {
            if result.genes_updated() == 0 {
                return Err(SourceUpdateError::AllGenesFailed {
                    failed: result.failed_gene_ids.len(),
                    last_error,
                });
            }
            tracing::warn!(
                source = %source_name,
                failed = result.failed_gene_ids.len(),
                last_error = %last_error,
                "Some genes could not be updated"
            );
        }

        self.finish(&source_name).await?;
        tracing::info!(
            source = %source_name,
            batch_updated = result.batch_updated,
            fallback_updated = result.fallback_updated,
            retry_updated = result.retry_updated,
            failed = result.failed_gene_ids.len(),
            "Source update complete"
        );
        Ok(())
    }

    async fn fetch_gene(&self, adapter: &dyn AnnotationSourceAdapter, gene: &Gene) -> GeneOutcome {
        match adapter.fetch_one(gene).await {
            Ok(Some(payload)) if adapter.is_valid(&payload) => {
                GeneOutcome::Stored(self.row(adapter, gene.gene_id, payload))
            }
            Ok(Some(_)) => GeneOutcome::Failed(
                SourceError::validation(adapter.name(), format!("invalid payload for {}", gene.symbol))
                    .to_string(),
            ),
            Ok(None) => GeneOutcome::NoData,
            Err(e) => {
                tracing::debug!(source = %adapter.name(), gene_id = gene.gene_id, error = %e, "Per-gene fetch failed");
                GeneOutcome::Failed(e.to_string())
            }
        }
    }

    /// Retry one gene with exponential backoff. `Ok(true)` means stored,
    /// `Ok(false)` means the source has no data for it.
    async fn retry_gene(
        &self,
        adapter: &dyn AnnotationSourceAdapter,
        policy: &RetryPolicy,
        gene: &Gene,
    ) -> Result<bool, String> {
        let mut last_error = String::new();
        for attempt in 1..=policy.max_attempts() {
            tokio::time::sleep(policy.delay_for_attempt(attempt)).await;
            match self.fetch_gene(adapter, gene).await {
                GeneOutcome::Stored(row) => match self.store.upsert_annotations(std::slice::from_ref(&row)).await {
                    Ok(_) => {
                        self.write_back_identifiers(adapter, std::slice::from_ref(&row)).await;
                        tracing::debug!(source = %adapter.name(), gene_id = gene.gene_id, attempt, "Gene recovered on retry");
                        return Ok(true);
                    }
                    Err(e) => last_error = e.to_string(),
                },
                GeneOutcome::NoData => return Ok(false),
                GeneOutcome::Failed(e) => last_error = e,
            }
        }
        tracing::warn!(
            source = %adapter.name(),
            gene_id = gene.gene_id,
            symbol = %gene.symbol,
            attempts = policy.max_attempts(),
            error = %last_error,
            "Gene failed after retries"
        );
        Err(last_error)
    }

    fn row(&self, adapter: &dyn AnnotationSourceAdapter, gene_id: GeneId, payload: JsonValue) -> GeneAnnotation {
        GeneAnnotation::new(gene_id, adapter.name(), adapter.version(), payload, Utc::now())
    }

    /// Persist identifiers the source resolved for stored genes.
    async fn write_back_identifiers(&self, adapter: &dyn AnnotationSourceAdapter, rows: &[GeneAnnotation]) {
        for row in rows {
            let Some(identifiers) = adapter.extract_identifiers(&row.annotations) else {
                continue;
            };
            if identifiers.is_empty() {
                continue;
            }
            if let Err(e) = self.store.update_gene_identifiers(row.gene_id, &identifiers).await {
                tracing::warn!(source = %adapter.name(), gene_id = row.gene_id, error = %e, "Identifier write-back failed");
            }
        }
    }

    async fn finish(&self, source_name: &str) -> Result<(), SourceUpdateError> {
        let source = self.store.mark_source_updated(source_name, Utc::now()).await?;
        tracing::debug!(source = %source_name, next_update = ?source.next_update, "Source schedule advanced");
        self.invalidation.enqueue(
            source_name,
            vec![source_name.to_string(), ANNOTATIONS_NAMESPACE.to_string()],
        );
        Ok(())
    }
}

impl std::fmt::Debug for SourceUpdater {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceUpdater")
            .field("config", &self.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::invalidation::InvalidationWorker;
    use geneweave_core::{PipelineConfig, SourceError};
    use geneweave_storage::{InMemoryAnnotationStore, InMemoryCacheStore, TwoTierCache};
    use geneweave_test_utils::{
        gene_fixtures, BatchScript, GeneScript, ScriptedSource, SourceCall,
    };
    use std::time::Duration;

    fn config() -> PipelineConfig {
        PipelineConfig {
            upsert_chunk_size: 4,
            commit_interval: 3,
            gene_retry_attempts: 2,
            gene_retry_initial_delay: Duration::from_millis(10),
            gene_retry_max_delay: Duration::from_millis(20),
            ..PipelineConfig::default()
        }
    }

    async fn fixture(n: i64, config: PipelineConfig) -> (Arc<InMemoryAnnotationStore>, SourceUpdater, InvalidationWorker) {
        let store = Arc::new(InMemoryAnnotationStore::with_genes(gene_fixtures(n)).await);
        let cache = Arc::new(TwoTierCache::new(
            Arc::new(InMemoryCacheStore::new()),
            Default::default(),
        ));
        let worker = InvalidationWorker::spawn(cache, 16);
        let updater = SourceUpdater::new(store.clone(), config, worker.queue());
        (store, updater, worker)
    }

    fn ids(n: i64) -> Vec<GeneId> {
        (1..=n).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_covers_everything_in_chunks() {
        let (store, updater, worker) = fixture(10, config()).await;
        let source = Arc::new(ScriptedSource::new("gnomad"));

        let result = updater.run(source.clone(), &ids(10), false).await;
        assert!(result.success);
        assert_eq!(result.batch_updated, 10);
        assert_eq!(result.fallback_updated, 0);
        assert_eq!(store.annotations_for("gnomad").await.len(), 10);
        assert_eq!(source.batch_calls().await, 1);

        let stamped = store.get_source("gnomad").await.unwrap().unwrap();
        assert!(stamped.last_update.is_some());

        worker.queue().flush().await;
        assert_eq!(worker.snapshot().namespaces_cleared, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_genes_missing_from_batch_fall_back() {
        let (store, updater, _worker) = fixture(6, config()).await;
        let source = Arc::new(
            ScriptedSource::new("clinvar").with_batch(BatchScript::Only([1, 2, 3].into_iter().collect())),
        );

        let result = updater.run(source.clone(), &ids(6), false).await;
        assert!(result.success);
        assert_eq!(result.batch_updated, 3);
        assert_eq!(result.fallback_updated, 3);
        assert_eq!(source.fetch_one_calls(1).await, 0);
        assert_eq!(source.fetch_one_calls(5).await, 1);
        assert_eq!(store.annotations_for("clinvar").await.len(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_chunk_is_recovered_per_gene() {
        let (store, updater, _worker) = fixture(8, config()).await;
        store.fail_next_upserts("gnomad", 1).await;
        let source = Arc::new(ScriptedSource::new("gnomad"));

        let result = updater.run(source.clone(), &ids(8), false).await;
        assert!(result.success);
        assert_eq!(result.batch_updated, 4);
        assert_eq!(result.fallback_updated, 4);
        assert_eq!(source.fetch_one_calls(1).await, 1);
        assert_eq!(source.fetch_one_calls(5).await, 0);
        assert_eq!(store.annotations_for("gnomad").await.len(), 8);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_gene_failure_recovers_in_retry_phase() {
        let (store, updater, _worker) = fixture(3, config()).await;
        let flaky = SourceError::transient("ensembl", Some(503), "unavailable");
        let source = Arc::new(
            ScriptedSource::new("ensembl")
                .with_batch(BatchScript::Empty)
                .with_gene_script(2, vec![GeneScript::Fail(flaky), GeneScript::Found]),
        );

        let result = updater.run(source.clone(), &ids(3), false).await;
        assert!(result.success);
        assert_eq!(result.fallback_updated, 2);
        assert_eq!(result.retry_updated, 1);
        assert!(result.failed_gene_ids.is_empty());
        assert_eq!(source.fetch_one_calls(2).await, 2);
        assert_eq!(store.annotations_for("ensembl").await.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_payloads_are_never_stored() {
        let (store, updater, _worker) = fixture(2, config()).await;
        let source = Arc::new(
            ScriptedSource::new("hgnc")
                .with_batch(BatchScript::Empty)
                .with_gene_script(1, vec![GeneScript::Invalid]),
        );

        let result = updater.run(source.clone(), &ids(2), false).await;
        assert!(result.success);
        assert_eq!(result.failed_gene_ids, vec![1]);
        // one fallback attempt plus two retries
        assert_eq!(source.fetch_one_calls(1).await, 3);
        assert!(store.get_annotation(1, "hgnc").await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_data_is_not_retried() {
        let (_store, updater, _worker) = fixture(2, config()).await;
        let source = Arc::new(
            ScriptedSource::new("clinvar")
                .with_batch(BatchScript::Empty)
                .with_default_one(GeneScript::Missing),
        );

        let result = updater.run(source.clone(), &ids(2), false).await;
        assert!(result.success);
        assert_eq!(result.genes_updated(), 0);
        assert_eq!(source.fetch_one_calls(1).await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_source_failing_every_gene_fails() {
        let (store, updater, _worker) = fixture(3, config()).await;
        let source = Arc::new(ScriptedSource::failing("omim"));

        let result = updater.run(source, &ids(3), false).await;
        assert!(!result.success);
        assert_eq!(result.failed_gene_ids, vec![1, 2, 3]);
        assert!(result.error.unwrap().contains("all 3 genes failed"));
        let row = store.get_source("omim").await.unwrap().unwrap();
        assert!(row.last_update.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_source_timeout_bounds_the_update() {
        let config = PipelineConfig {
            source_timeout: Some(Duration::from_secs(5)),
            ..config()
        };
        let (_store, updater, _worker) = fixture(2, config).await;
        let source = Arc::new(ScriptedSource::new("gnomad").hanging());

        let result = updater.run(source, &ids(2), false).await;
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("timed out after 5s"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_identifiers_are_written_back() {
        let (store, updater, _worker) = fixture(2, config()).await;
        let source = Arc::new(ScriptedSource::new("hgnc").resolving_identifiers());

        updater.run(source.clone(), &ids(2), true).await;
        let gene = store.gene(2).await.unwrap();
        assert_eq!(gene.ensembl_gene_id.as_deref(), Some("ENSG00000000002"));
        assert!(source.calls().await.contains(&SourceCall::EnsureBulk(true)));
    }
}
