//! Source status and annotation validation reports.

use crate::error::PipelineResult;
use chrono::Utc;
use geneweave_core::{AnnotationSource, SourceStatus, SourceValidation, ValidationReport};
use geneweave_sources::SourceRegistry;
use geneweave_storage::AnnotationStore;
use std::collections::BTreeMap;

/// Status of every known source: rows in the store plus registered
/// adapters that have never run.
pub async fn check_source_status(
    store: &dyn AnnotationStore,
    registry: &SourceRegistry,
) -> PipelineResult<Vec<SourceStatus>> {
    let now = Utc::now();
    let mut rows: BTreeMap<String, AnnotationSource> = store
        .list_sources()
        .await?
        .into_iter()
        .map(|s| (s.source_name.clone(), s))
        .collect();

    for name in registry.names() {
        if rows.contains_key(&name) {
            continue;
        }
        if let Some(adapter) = registry.get(&name) {
            rows.insert(name, AnnotationSource::from_definition(adapter.definition()));
        }
    }

    let mut statuses = Vec::with_capacity(rows.len());
    for (name, source) in rows {
        let adapter = registry.get(&name);
        statuses.push(SourceStatus {
            annotation_count: store.annotation_count(&name).await?,
            is_due: source.is_active && source.is_due(now),
            is_registered: adapter.is_some(),
            circuit_state: adapter.and_then(|a| a.circuit_state()),
            source_name: name,
            display_name: source.display_name,
            is_active: source.is_active,
            last_update: source.last_update,
            next_update: source.next_update,
        });
    }
    Ok(statuses)
}

/// Validate stored annotations for one source, or every source with a row.
pub async fn validate_annotations(
    store: &dyn AnnotationStore,
    source: Option<&str>,
) -> PipelineResult<ValidationReport> {
    let total_genes = store.count_genes().await?;
    let names: Vec<String> = match source {
        Some(name) => vec![name.to_string()],
        None => store
            .list_sources()
            .await?
            .into_iter()
            .map(|s| s.source_name)
            .collect(),
    };

    let mut sources = Vec::with_capacity(names.len());
    for name in &names {
        let stats = store.annotation_stats(name).await?;
        let validation = SourceValidation::from_stats(&stats, total_genes);
        if !validation.is_valid {
            tracing::warn!(source = %name, issues = ?validation.issues, "Annotation validation issues");
        }
        sources.push(validation);
    }

    Ok(ValidationReport {
        generated_at: Utc::now(),
        total_genes,
        is_valid: sources.iter().all(|s| s.is_valid),
        sources,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use geneweave_core::{CircuitState, GeneAnnotation};
    use geneweave_storage::InMemoryAnnotationStore;
    use geneweave_test_utils::{gene_fixtures, source_definition, ScriptedSource};
    use serde_json::json;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_status_includes_unregistered_rows_and_never_run_adapters() {
        let store = InMemoryAnnotationStore::with_genes(gene_fixtures(3)).await;
        store.ensure_source(&source_definition("retired")).await.unwrap();
        store.ensure_source(&source_definition("hgnc")).await.unwrap();
        store.mark_source_updated("hgnc", Utc::now()).await.unwrap();
        store
            .upsert_annotations(&[GeneAnnotation::new(1, "hgnc", "1.0", json!({"hgnc_id": "HGNC:1"}), Utc::now())])
            .await
            .unwrap();

        let mut registry = SourceRegistry::new();
        registry.register(Arc::new(ScriptedSource::new("hgnc")));
        registry.register(Arc::new(ScriptedSource::new("gnomad")));

        let statuses = check_source_status(&store, &registry).await.unwrap();
        let names: Vec<&str> = statuses.iter().map(|s| s.source_name.as_str()).collect();
        assert_eq!(names, vec!["gnomad", "hgnc", "retired"]);

        let gnomad = &statuses[0];
        assert!(gnomad.is_due);
        assert!(gnomad.is_registered);
        assert!(gnomad.last_update.is_none());

        let hgnc = &statuses[1];
        assert!(!hgnc.is_due);
        assert_eq!(hgnc.annotation_count, 1);

        let retired = &statuses[2];
        assert!(!retired.is_registered);
        assert_eq!(retired.circuit_state, None::<CircuitState>);
    }

    #[tokio::test]
    async fn test_validation_flags_error_payloads() {
        let store = InMemoryAnnotationStore::with_genes(gene_fixtures(4)).await;
        store.ensure_source(&source_definition("gnomad")).await.unwrap();
        store.ensure_source(&source_definition("clinvar")).await.unwrap();
        let now = Utc::now();
        store
            .upsert_annotations(&[
                GeneAnnotation::new(1, "gnomad", "1.0", json!({"pli": 0.9}), now),
                GeneAnnotation::new(2, "gnomad", "1.0", json!({"error": "rate limited"}), now),
                GeneAnnotation::new(1, "clinvar", "1.0", json!({"total_variants": 3}), now),
            ])
            .await
            .unwrap();

        let report = validate_annotations(&store, None).await.unwrap();
        assert_eq!(report.total_genes, 4);
        assert!(!report.is_valid);
        let gnomad = report.sources.iter().find(|s| s.source == "gnomad").unwrap();
        assert_eq!(gnomad.error_payloads, 1);
        assert_eq!(gnomad.genes_missing, 2);

        let clinvar_only = validate_annotations(&store, Some("clinvar")).await.unwrap();
        assert_eq!(clinvar_only.sources.len(), 1);
        assert!(clinvar_only.is_valid);
        assert!((clinvar_only.sources[0].coverage_percent - 25.0).abs() < f64::EPSILON);
    }
}
