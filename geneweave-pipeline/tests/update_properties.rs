//! End-to-end orchestrator behavior against the in-memory store.

use chrono::Utc;
use geneweave_core::{
    CacheConfig, CheckpointError, GeneAnnotation, PipelineCheckpoint, PipelineConfig, RunStatus,
    UpdateRequest, UpdateStrategy,
};
use geneweave_pipeline::{PipelineError, UpdatePipeline};
use geneweave_sources::{ClinvarSource, SourceContext, SourceRegistry};
use geneweave_storage::{AnnotationStore, CacheTtl, InMemoryAnnotationStore, TwoTierCache};
use geneweave_test_utils::{
    gene_fixtures, memory_cache, variant_row, write_variant_summary_gz, ConcurrencyGauge,
    ScriptedSource, SourceCall,
};
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

const GENES: i64 = 12;

fn config() -> PipelineConfig {
    PipelineConfig {
        gene_retry_attempts: 2,
        gene_retry_initial_delay: Duration::from_millis(5),
        gene_retry_max_delay: Duration::from_millis(10),
        ..PipelineConfig::default()
    }
}

async fn store() -> Arc<InMemoryAnnotationStore> {
    Arc::new(InMemoryAnnotationStore::with_genes(gene_fixtures(GENES)).await)
}

fn pipeline(
    store: &Arc<InMemoryAnnotationStore>,
    cache: Arc<TwoTierCache>,
    sources: Vec<Arc<ScriptedSource>>,
) -> UpdatePipeline {
    let mut registry = SourceRegistry::new();
    for source in sources {
        registry.register(source);
    }
    UpdatePipeline::new(store.clone(), cache, registry, config()).unwrap()
}

// ============================================================================
// PRIORITY ORDERING
// ============================================================================

#[tokio::test]
async fn priority_source_writes_commit_before_any_other_source_starts() {
    for strategy in [
        UpdateStrategy::Full,
        UpdateStrategy::Incremental,
        UpdateStrategy::Forced,
        UpdateStrategy::Selective,
    ] {
        let store = store().await;
        let (cache, _) = memory_cache();
        let hgnc = Arc::new(ScriptedSource::new("hgnc").resolving_identifiers());
        let others: Vec<Arc<ScriptedSource>> = ["gnomad", "clinvar", "ensembl"]
            .into_iter()
            .map(|name| Arc::new(ScriptedSource::new(name).observing(store.clone())))
            .collect();

        let mut all = vec![hgnc.clone()];
        all.extend(others.iter().cloned());
        let pipeline = pipeline(&store, cache, all);

        let mut request = UpdateRequest::new(strategy);
        if strategy == UpdateStrategy::Selective {
            // listed out of order on purpose
            request = request.with_sources(["clinvar", "gnomad", "hgnc", "ensembl"]);
        }
        let summary = pipeline.run_update(request).await.unwrap();
        assert_eq!(summary.status, RunStatus::Completed, "{strategy}");
        assert_eq!(summary.sources_updated[0], "hgnc", "{strategy}");

        let hgnc_total = store
            .write_log()
            .await
            .iter()
            .filter(|w| w.source == "hgnc")
            .count();
        assert_eq!(hgnc_total, GENES as usize, "{strategy}");

        for source in &others {
            let seen = source.writes_at_first_call().expect("source was called");
            let hgnc_seen = seen.iter().filter(|w| w.source == "hgnc").count();
            assert_eq!(hgnc_seen, hgnc_total, "{strategy}: {:?}", source);
        }

        // identifiers resolved by the priority source are on the gene rows
        let gene = store.gene(3).await.unwrap();
        assert_eq!(gene.hgnc_id.as_deref(), Some("HGNC:3"), "{strategy}");
    }
}

// ============================================================================
// FAILURE ISOLATION
// ============================================================================

#[tokio::test(start_paused = true)]
async fn failing_source_is_isolated_from_its_siblings() {
    let store = store().await;
    let (cache, _) = memory_cache();
    let alpha = Arc::new(ScriptedSource::failing("alpha"));
    let beta = Arc::new(ScriptedSource::new("beta"));
    let pipeline = pipeline(&store, cache, vec![alpha, beta]);

    let summary = pipeline
        .run_update(UpdateRequest::new(UpdateStrategy::Selective).with_sources(["alpha", "beta"]))
        .await
        .unwrap();

    assert_eq!(summary.errors.len(), 1);
    assert_eq!(summary.errors[0].source.as_deref(), Some("alpha"));
    assert!(!summary.is_success());
    assert_eq!(summary.sources_updated, vec!["beta".to_string()]);
    assert_eq!(summary.sources_failed, vec!["alpha".to_string()]);
    assert_eq!(summary.status, RunStatus::CompletedWithErrors);
    assert_eq!(store.annotations_for("beta").await.len(), GENES as usize);
    assert!(store.annotations_for("alpha").await.is_empty());

    // the failed source stays in the checkpoint for the next run
    let snapshot = store.load_checkpoint("annotation_pipeline").await.unwrap().unwrap();
    let checkpoint = PipelineCheckpoint::from_json(&snapshot).unwrap();
    assert_eq!(checkpoint.sources_remaining, vec!["alpha".to_string()]);
    assert_eq!(checkpoint.sources_completed, vec!["beta".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn run_fails_only_when_no_source_succeeds() {
    let store = store().await;
    let (cache, _) = memory_cache();
    let pipeline = pipeline(
        &store,
        cache,
        vec![
            Arc::new(ScriptedSource::failing("hgnc")),
            Arc::new(ScriptedSource::failing("gnomad")),
        ],
    );

    let summary = pipeline.run_update(UpdateRequest::new(UpdateStrategy::Full)).await.unwrap();
    assert_eq!(summary.status, RunStatus::Failed);
    assert_eq!(summary.errors.len(), 2);
    assert!(store.refresh_calls().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn fan_out_never_exceeds_the_concurrency_limit() {
    let store = store().await;
    let (cache, _) = memory_cache();
    let gauge = ConcurrencyGauge::new();

    let mut registry = SourceRegistry::new();
    registry.register(Arc::new(ScriptedSource::new("hgnc")));
    let names = ["gnomad", "clinvar", "ensembl", "omim", "uniprot", "mgi"];
    for name in names {
        registry.register(Arc::new(
            ScriptedSource::new(name)
                .with_delay(Duration::from_millis(50))
                .gauged(gauge.clone()),
        ));
    }
    let config = PipelineConfig {
        max_concurrent_sources: 3,
        ..config()
    };
    let pipeline = UpdatePipeline::new(store.clone(), cache, registry, config).unwrap();

    let summary = pipeline.run_update(UpdateRequest::new(UpdateStrategy::Full)).await.unwrap();
    assert_eq!(summary.status, RunStatus::Completed);
    assert_eq!(summary.sources_updated.len(), names.len() + 1);
    assert!(gauge.peak() <= 3, "peak was {}", gauge.peak());
    assert!(gauge.peak() > 1, "sources never overlapped");
    assert_eq!(gauge.in_flight(), 0);
}

// ============================================================================
// CHECKPOINT RESUME
// ============================================================================

#[tokio::test]
async fn interrupted_run_resumes_only_the_remaining_sources() {
    let store = store().await;
    let (cache, _) = memory_cache();

    let first = Arc::new(pipeline(
        &store,
        cache.clone(),
        vec![
            Arc::new(ScriptedSource::new("hgnc")),
            Arc::new(ScriptedSource::new("gnomad").hanging()),
            Arc::new(ScriptedSource::new("clinvar")),
        ],
    ));
    let running = {
        let first = first.clone();
        tokio::spawn(async move { first.run_update(UpdateRequest::new(UpdateStrategy::Full)).await })
    };

    // Wait until the fan-out has made progress, then kill the run.
    let mut checkpoint = None;
    for _ in 0..500 {
        if let Some(snapshot) = store.load_checkpoint("annotation_pipeline").await.unwrap() {
            let cp = PipelineCheckpoint::from_json(&snapshot).unwrap();
            if cp.sources_completed.contains(&"clinvar".to_string()) {
                checkpoint = Some(cp);
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    running.abort();
    let checkpoint = checkpoint.expect("checkpoint written during fan-out");
    assert_eq!(checkpoint.sources_remaining, vec!["gnomad".to_string()]);
    assert_eq!(checkpoint.gene_ids.len(), GENES as usize);

    let hgnc = Arc::new(ScriptedSource::new("hgnc"));
    let gnomad = Arc::new(ScriptedSource::new("gnomad"));
    let clinvar = Arc::new(ScriptedSource::new("clinvar"));
    let second = pipeline(&store, cache, vec![hgnc.clone(), gnomad.clone(), clinvar.clone()]);

    let summary = second.run_update(UpdateRequest::new(UpdateStrategy::Full)).await.unwrap();
    assert!(summary.resumed_from_checkpoint);
    assert_eq!(summary.sources_updated, vec!["gnomad".to_string()]);
    assert!(!hgnc.was_called().await);
    assert!(!clinvar.was_called().await);
    assert_eq!(gnomad.batch_calls().await, 1);
    assert!(store.load_checkpoint("annotation_pipeline").await.unwrap().is_none());
}

#[tokio::test]
async fn explicit_overrides_ignore_the_checkpoint() {
    let store = store().await;
    let (cache, _) = memory_cache();
    let stale = PipelineCheckpoint::new(
        "annotation_pipeline",
        UpdateStrategy::Full,
        vec!["gnomad".to_string()],
        vec!["hgnc".to_string()],
        vec![1, 2],
    );
    store
        .save_checkpoint("annotation_pipeline", "running", &stale.to_json().unwrap())
        .await
        .unwrap();

    let gnomad = Arc::new(ScriptedSource::new("gnomad"));
    let hgnc = Arc::new(ScriptedSource::new("hgnc"));
    let pipeline = pipeline(&store, cache, vec![hgnc.clone(), gnomad.clone()]);

    let summary = pipeline
        .run_update(UpdateRequest::new(UpdateStrategy::Selective).with_sources(["hgnc"]).with_gene_ids(vec![5]))
        .await
        .unwrap();
    assert!(!summary.resumed_from_checkpoint);
    assert_eq!(summary.genes_processed, 1);
    assert!(!gnomad.was_called().await);
    assert!(hgnc.calls().await.contains(&SourceCall::Batch(vec![5])));
}

#[tokio::test]
async fn unknown_checkpoint_version_fails_loudly() {
    let store = store().await;
    let (cache, _) = memory_cache();
    store
        .save_checkpoint(
            "annotation_pipeline",
            "running",
            &json!({"schema_version": 1, "sources_remaining": ["gnomad"]}),
        )
        .await
        .unwrap();
    let pipeline = pipeline(&store, cache, vec![Arc::new(ScriptedSource::new("hgnc"))]);

    let err = pipeline.run_update(UpdateRequest::new(UpdateStrategy::Full)).await.unwrap_err();
    assert!(matches!(
        err,
        PipelineError::Checkpoint(CheckpointError::UnsupportedVersion { found: 1, .. })
    ));
}

// ============================================================================
// IDEMPOTENCE AND GENE SELECTION
// ============================================================================

#[tokio::test]
async fn repeated_forced_runs_keep_one_row_per_key() {
    let store = store().await;
    let (cache, _) = memory_cache();
    let pipeline = pipeline(
        &store,
        cache,
        vec![Arc::new(ScriptedSource::new("hgnc")), Arc::new(ScriptedSource::new("gnomad"))],
    );

    pipeline.run_update(UpdateRequest::new(UpdateStrategy::Forced)).await.unwrap();
    let before = store.get_annotation(1, "gnomad").await.unwrap().unwrap();
    pipeline.run_update(UpdateRequest::new(UpdateStrategy::Forced)).await.unwrap();
    let after = store.get_annotation(1, "gnomad").await.unwrap().unwrap();

    let rows = store.annotations().await;
    assert_eq!(rows.len(), 2 * GENES as usize);
    let keys: HashSet<_> = rows.iter().map(|r| r.key()).collect();
    assert_eq!(keys.len(), rows.len());
    assert_eq!(after.created_at, before.created_at);
    assert!(after.updated_at >= before.updated_at);
}

#[tokio::test]
async fn incremental_selects_incomplete_genes_by_clinical_score() {
    let store = store().await;
    let (cache, _) = memory_cache();
    let hgnc = Arc::new(ScriptedSource::new("hgnc"));
    let gnomad = Arc::new(ScriptedSource::new("gnomad"));
    let pipeline = pipeline(&store, cache, vec![hgnc.clone(), gnomad.clone()]);

    let now = Utc::now();
    let mut complete = Vec::new();
    for gene_id in 5..=GENES {
        for source in ["hgnc", "gnomad"] {
            complete.push(GeneAnnotation::new(gene_id, source, "1.0", json!({"seeded": true}), now));
        }
    }
    store.upsert_annotations(&complete).await.unwrap();
    // gene 2 only has one of the two sources
    store
        .upsert_annotations(&[GeneAnnotation::new(2, "hgnc", "1.0", json!({"seeded": true}), now)])
        .await
        .unwrap();

    let summary = pipeline.run_update(UpdateRequest::new(UpdateStrategy::Incremental)).await.unwrap();
    assert_eq!(summary.genes_processed, 4);
    // scores are id % 7: 4, 3, 2, 1
    assert!(gnomad.calls().await.contains(&SourceCall::Batch(vec![4, 3, 2, 1])));
}

// ============================================================================
// CACHE AND VIEWS
// ============================================================================

#[tokio::test]
async fn run_invalidates_source_and_response_caches_once() {
    let store = store().await;
    let (cache, _) = memory_cache();
    for namespace in ["gnomad", "annotations", "api_responses", "ensembl"] {
        cache.set("GENE1", json!({"cached": namespace}), namespace, CacheTtl::Never).await;
    }
    let pipeline = pipeline(
        &store,
        cache.clone(),
        vec![Arc::new(ScriptedSource::new("hgnc")), Arc::new(ScriptedSource::new("gnomad"))],
    );

    pipeline
        .run_update(UpdateRequest::new(UpdateStrategy::Selective).with_sources(["hgnc", "gnomad"]))
        .await
        .unwrap();
    pipeline.flush_invalidations().await;

    assert!(cache.get("GENE1", "gnomad").await.is_none());
    assert!(cache.get("GENE1", "annotations").await.is_none());
    assert!(cache.get("GENE1", "api_responses").await.is_none());
    assert!(cache.get("GENE1", "ensembl").await.is_some());
    assert_eq!(store.refresh_calls().await, vec![true]);
    assert_eq!(pipeline.invalidation().snapshot().dropped, 0);
}

// ============================================================================
// BULK SOURCE
// ============================================================================

#[tokio::test]
async fn clinvar_bulk_file_feeds_the_batch_path() {
    let dir = tempfile::tempdir().unwrap();
    write_variant_summary_gz(
        &dir.path().join("variant_summary.txt.gz"),
        &[
            variant_row(42, "GENE1", "Benign", "GRCh37", "NM_1(GENE1):c.10A>G (p.Lys4Glu)"),
            variant_row(42, "GENE1", "Pathogenic", "GRCh38", "NM_1(GENE1):c.10A>T (p.Lys4Ter)"),
            variant_row(43, "GENE1", "Uncertain significance", "GRCh38", "NM_1(GENE1):c.30C>T (p.Ser10=)"),
            variant_row(77, "GENE2", "Likely benign", "GRCh38", "NM_2(GENE2):c.5G>A (p.Gly2Ser)"),
        ],
    )
    .unwrap();

    let store = store().await;
    let cache = Arc::new(TwoTierCache::new(
        Arc::new(geneweave_storage::InMemoryCacheStore::new()),
        CacheConfig::default(),
    ));
    let mut context = SourceContext::new(cache.clone());
    context.clinvar.data_dir = dir.path().to_path_buf();

    let mut registry = SourceRegistry::new();
    registry.register(Arc::new(ScriptedSource::new("hgnc")));
    registry.register(Arc::new(ClinvarSource::new(&context).unwrap()));
    let pipeline = UpdatePipeline::new(store.clone(), cache, registry, config()).unwrap();

    let summary = pipeline
        .run_update(
            UpdateRequest::new(UpdateStrategy::Selective)
                .with_sources(["hgnc", "clinvar"])
                .with_gene_ids(vec![1, 2]),
        )
        .await
        .unwrap();
    assert_eq!(summary.status, RunStatus::Completed);
    let clinvar = summary.result_for("clinvar").unwrap();
    assert_eq!(clinvar.batch_updated, 2);
    assert_eq!(clinvar.fallback_updated, 0);

    let gene1 = store.get_annotation(1, "clinvar").await.unwrap().unwrap();
    assert_eq!(gene1.annotations["total_variants"], 2);
    assert_eq!(gene1.annotations["counts"]["pathogenic"], 1);
    assert_eq!(gene1.annotations["counts"]["benign"], 0);
    assert_eq!(gene1.annotations["has_pathogenic"], true);

    let gene2 = store.get_annotation(2, "clinvar").await.unwrap().unwrap();
    assert_eq!(gene2.annotations["total_variants"], 1);
}

// ============================================================================
// PROPERTIES
// ============================================================================

mod props {
    use super::*;
    use proptest::prelude::*;

    const NAMES: [&str; 4] = ["gnomad", "clinvar", "ensembl", "omim"];

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        #[test]
        fn every_failed_source_is_reported_once(failing in proptest::collection::vec(any::<bool>(), 4)) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            runtime.block_on(async {
                let store = store().await;
                let (cache, _) = memory_cache();
                let mut sources = vec![Arc::new(ScriptedSource::new("hgnc"))];
                for (name, fails) in NAMES.iter().zip(&failing) {
                    sources.push(Arc::new(if *fails {
                        ScriptedSource::failing(name)
                    } else {
                        ScriptedSource::new(name)
                    }));
                }
                let pipeline = pipeline(&store, cache, sources);
                let summary = pipeline.run_update(UpdateRequest::new(UpdateStrategy::Full)).await.unwrap();

                let failed: Vec<&str> = NAMES
                    .iter()
                    .zip(&failing)
                    .filter(|(_, fails)| **fails)
                    .map(|(name, _)| *name)
                    .collect();
                assert_eq!(summary.errors.len(), failed.len());
                for name in &failed {
                    let reported = summary
                        .errors
                        .iter()
                        .filter(|e| e.source.as_deref() == Some(*name))
                        .count();
                    assert_eq!(reported, 1, "{name}");
                    assert!(store.annotations_for(name).await.is_empty());
                }
                for (name, fails) in NAMES.iter().zip(&failing) {
                    if !fails {
                        assert_eq!(store.annotations_for(name).await.len(), GENES as usize);
                    }
                }
                let expected = if failed.is_empty() {
                    RunStatus::Completed
                } else {
                    RunStatus::CompletedWithErrors
                };
                assert_eq!(summary.status, expected);
                pipeline.shutdown().await;
            });
        }
    }
}
