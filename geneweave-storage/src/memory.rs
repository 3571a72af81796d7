//! In-memory `AnnotationStore` with the same semantics as the Postgres one.
//!
//! Backs the test suite and local dry runs. Exposes a write log and a few
//! failure switches so tests can observe ordering and degraded paths.

use crate::store::{checkpoint_key, AnnotationStore, UpsertOutcome};
use async_trait::async_trait;
use geneweave_core::{
    payload_issue, AnnotationKey, AnnotationSource, AnnotationStats, Gene, GeneAnnotation,
    GeneId, GeneIdentifiers, PayloadIssue, SourceDefinition, StoreError, StoreResult, Timestamp,
};
use serde_json::Value as JsonValue;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::{Mutex, RwLock};

/// One committed annotation write, in commit order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteRecord {
    pub sequence: u64,
    pub source: String,
    pub gene_id: GeneId,
}

#[derive(Debug, Default)]
struct State {
    genes: BTreeMap<GeneId, Gene>,
    sources: BTreeMap<String, AnnotationSource>,
    annotations: BTreeMap<AnnotationKey, GeneAnnotation>,
    checkpoints: HashMap<String, (String, JsonValue)>,
}

#[derive(Debug, Default)]
pub struct InMemoryAnnotationStore {
    state: RwLock<State>,
    write_log: Mutex<Vec<WriteRecord>>,
    sequence: AtomicU64,
    failing_upserts: Mutex<HashMap<String, usize>>,
    fail_gene_loads: AtomicBool,
    fail_concurrent_refresh: AtomicBool,
    refreshes: Mutex<Vec<bool>>,
}

impl InMemoryAnnotationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn with_genes(genes: impl IntoIterator<Item = Gene>) -> Self {
        let store = Self::new();
        store.insert_genes(genes).await;
        store
    }

    pub async fn insert_genes(&self, genes: impl IntoIterator<Item = Gene>) {
        let mut state = self.state.write().await;
        for gene in genes {
            state.genes.insert(gene.gene_id, gene);
        }
    }

    /// Insert or replace a source row directly.
    pub async fn put_source(&self, source: AnnotationSource) {
        self.state
            .write()
            .await
            .sources
            .insert(source.source_name.clone(), source);
    }

    /// Fail the next `chunks` bulk upserts issued for `source`.
    pub async fn fail_next_upserts(&self, source: &str, chunks: usize) {
        self.failing_upserts
            .lock()
            .await
            .insert(source.to_string(), chunks);
    }

    pub fn set_fail_gene_loads(&self, fail: bool) {
        self.fail_gene_loads.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_concurrent_refresh(&self, fail: bool) {
        self.fail_concurrent_refresh.store(fail, Ordering::SeqCst);
    }

    /// Every `refresh_views` call, as its `concurrently` flag.
    pub async fn refresh_calls(&self) -> Vec<bool> {
        self.refreshes.lock().await.clone()
    }

    pub async fn write_log(&self) -> Vec<WriteRecord> {
        self.write_log.lock().await.clone()
    }

    pub async fn annotations(&self) -> Vec<GeneAnnotation> {
        self.state.read().await.annotations.values().cloned().collect()
    }

    pub async fn annotations_for(&self, source: &str) -> Vec<GeneAnnotation> {
        self.state
            .read()
            .await
            .annotations
            .values()
            .filter(|a| a.source == source)
            .cloned()
            .collect()
    }

    pub async fn gene(&self, gene_id: GeneId) -> Option<Gene> {
        self.state.read().await.genes.get(&gene_id).cloned()
    }

    fn check_gene_loads(&self) -> StoreResult<()> {
        if self.fail_gene_loads.load(Ordering::SeqCst) {
            return Err(StoreError::database("load_genes", "connection refused"));
        }
        Ok(())
    }
}

#[async_trait]
impl AnnotationStore for InMemoryAnnotationStore {
    async fn load_genes(&self, gene_ids: Option<&[GeneId]>) -> StoreResult<Vec<Gene>> {
        self.check_gene_loads()?;
        let state = self.state.read().await;
        let genes = match gene_ids {
            None => state.genes.values().cloned().collect(),
            Some(ids) => {
                let wanted: HashSet<GeneId> = ids.iter().copied().collect();
                state
                    .genes
                    .values()
                    .filter(|g| wanted.contains(&g.gene_id))
                    .cloned()
                    .collect()
            }
        };
        Ok(genes)
    }

    async fn count_genes(&self) -> StoreResult<u64> {
        self.check_gene_loads()?;
        Ok(self.state.read().await.genes.len() as u64)
    }

    async fn genes_needing_update(&self, active_sources: &[String]) -> StoreResult<Vec<Gene>> {
        self.check_gene_loads()?;
        let state = self.state.read().await;
        let active: HashSet<&str> = active_sources.iter().map(String::as_str).collect();

        let mut covered: HashMap<GeneId, HashSet<&str>> = HashMap::new();
        for annotation in state.annotations.values() {
            if active.contains(annotation.source.as_str()) {
                covered
                    .entry(annotation.gene_id)
                    .or_default()
                    .insert(annotation.source.as_str());
            }
        }

        let mut genes: Vec<Gene> = state
            .genes
            .values()
            .filter(|g| covered.get(&g.gene_id).map_or(0, HashSet::len) < active.len())
            .cloned()
            .collect();
        genes.sort_by(|a, b| {
            b.clinical_score
                .total_cmp(&a.clinical_score)
                .then(a.gene_id.cmp(&b.gene_id))
        });
        Ok(genes)
    }

    async fn update_gene_identifiers(
        &self,
        gene_id: GeneId,
        identifiers: &GeneIdentifiers,
    ) -> StoreResult<()> {
        let mut state = self.state.write().await;
        let gene = state.genes.get_mut(&gene_id).ok_or_else(|| StoreError::NotFound {
            entity: "gene".to_string(),
            key: gene_id.to_string(),
        })?;
        gene.apply_identifiers(identifiers);
        Ok(())
    }

    async fn ensure_source(&self, definition: &SourceDefinition) -> StoreResult<AnnotationSource> {
        let mut state = self.state.write().await;
        let source = state
            .sources
            .entry(definition.source_name.clone())
            .or_insert_with(|| AnnotationSource::from_definition(definition));
        Ok(source.clone())
    }

    async fn get_source(&self, source_name: &str) -> StoreResult<Option<AnnotationSource>> {
        Ok(self.state.read().await.sources.get(source_name).cloned())
    }

    async fn list_sources(&self) -> StoreResult<Vec<AnnotationSource>> {
        Ok(self.state.read().await.sources.values().cloned().collect())
    }

    async fn mark_source_updated(
        &self,
        source_name: &str,
        now: Timestamp,
    ) -> StoreResult<AnnotationSource> {
        let mut state = self.state.write().await;
        let source = state
            .sources
            .get_mut(source_name)
            .ok_or_else(|| StoreError::NotFound {
                entity: "annotation_source".to_string(),
                key: source_name.to_string(),
            })?;
        source.last_update = Some(now);
        source.next_update = Some(source.next_update_after(now));
        Ok(source.clone())
    }

    async fn upsert_annotations(&self, rows: &[GeneAnnotation]) -> StoreResult<UpsertOutcome> {
        if let Some(first) = rows.first() {
            let mut failing = self.failing_upserts.lock().await;
            if let Some(remaining) = failing.get_mut(&first.source) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(StoreError::database("upsert_annotations", "injected chunk failure"));
                }
            }
        }

        let mut outcome = UpsertOutcome::default();
        let mut state = self.state.write().await;
        let mut log = self.write_log.lock().await;
        for row in rows {
            match state.annotations.get_mut(&row.key()) {
                Some(existing) => {
                    existing.annotations = row.annotations.clone();
                    existing.updated_at = row.updated_at.max(existing.updated_at);
                    outcome.updated += 1;
                }
                None => {
                    state.annotations.insert(row.key(), row.clone());
                    outcome.inserted += 1;
                }
            }
            log.push(WriteRecord {
                sequence: self.sequence.fetch_add(1, Ordering::SeqCst),
                source: row.source.clone(),
                gene_id: row.gene_id,
            });
        }
        Ok(outcome)
    }

    async fn get_annotation(
        &self,
        gene_id: GeneId,
        source: &str,
    ) -> StoreResult<Option<GeneAnnotation>> {
        let state = self.state.read().await;
        Ok(state
            .annotations
            .values()
            .filter(|a| a.gene_id == gene_id && a.source == source)
            .max_by_key(|a| a.updated_at)
            .cloned())
    }

    async fn annotation_count(&self, source: &str) -> StoreResult<u64> {
        let state = self.state.read().await;
        Ok(state.annotations.values().filter(|a| a.source == source).count() as u64)
    }

    async fn annotation_stats(&self, source: &str) -> StoreResult<AnnotationStats> {
        let state = self.state.read().await;
        let mut stats = AnnotationStats {
            source: source.to_string(),
            ..Default::default()
        };
        let mut annotated: HashSet<GeneId> = HashSet::new();
        for annotation in state.annotations.values().filter(|a| a.source == source) {
            stats.total += 1;
            annotated.insert(annotation.gene_id);
            match payload_issue(&annotation.annotations) {
                Some(PayloadIssue::Empty) => stats.empty_payloads += 1,
                Some(PayloadIssue::ErrorMarker) => stats.error_payloads += 1,
                None => {}
            }
        }
        stats.genes_without_annotation = state
            .genes
            .keys()
            .filter(|id| !annotated.contains(id))
            .count() as u64;
        Ok(stats)
    }

    async fn refresh_views(&self, concurrently: bool) -> StoreResult<()> {
        self.refreshes.lock().await.push(concurrently);
        if concurrently && self.fail_concurrent_refresh.load(Ordering::SeqCst) {
            return Err(StoreError::database(
                "refresh_views",
                "cannot refresh materialized view concurrently",
            ));
        }
        Ok(())
    }

    async fn load_checkpoint(&self, pipeline_id: &str) -> StoreResult<Option<JsonValue>> {
        let state = self.state.read().await;
        Ok(state
            .checkpoints
            .get(&checkpoint_key(pipeline_id))
            .map(|(_, snapshot)| snapshot.clone()))
    }

    async fn save_checkpoint(
        &self,
        pipeline_id: &str,
        status: &str,
        snapshot: &JsonValue,
    ) -> StoreResult<()> {
        self.state.write().await.checkpoints.insert(
            checkpoint_key(pipeline_id),
            (status.to_string(), snapshot.clone()),
        );
        Ok(())
    }

    async fn clear_checkpoint(&self, pipeline_id: &str) -> StoreResult<()> {
        self.state
            .write()
            .await
            .checkpoints
            .remove(&checkpoint_key(pipeline_id));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, Utc};
    use serde_json::json;

    fn definition(name: &str) -> SourceDefinition {
        SourceDefinition {
            source_name: name.to_string(),
            display_name: name.to_uppercase(),
            version: "1".to_string(),
            update_frequency_hours: 24,
            base_url: "http://localhost".to_string(),
        }
    }

    fn row(gene_id: GeneId, source: &str, payload: JsonValue) -> GeneAnnotation {
        GeneAnnotation::new(gene_id, source, "1", payload, Utc::now())
    }

    #[tokio::test]
    async fn test_upsert_is_idempotent() {
        let store = InMemoryAnnotationStore::new();
        let rows = vec![row(1, "gnomad", json!({"a": 1})), row(2, "gnomad", json!({"a": 2}))];

        let first = store.upsert_annotations(&rows).await.unwrap();
        assert_eq!(first, UpsertOutcome { inserted: 2, updated: 0 });
        let before = store.get_annotation(1, "gnomad").await.unwrap().unwrap().updated_at;

        let again: Vec<_> = rows
            .iter()
            .map(|r| {
                let mut r = r.clone();
                r.updated_at = before + ChronoDuration::seconds(1);
                r
            })
            .collect();
        let second = store.upsert_annotations(&again).await.unwrap();
        assert_eq!(second, UpsertOutcome { inserted: 0, updated: 2 });
        assert_eq!(store.annotations().await.len(), 2);

        let after = store.get_annotation(1, "gnomad").await.unwrap().unwrap();
        assert!(after.updated_at > before);
        assert!(after.created_at <= before);
    }

    #[tokio::test]
    async fn test_genes_needing_update_orders_by_score() {
        let store = InMemoryAnnotationStore::with_genes([
            Gene::new(1, "A").with_clinical_score(0.1),
            Gene::new(2, "B").with_clinical_score(0.9),
            Gene::new(3, "C").with_clinical_score(0.9),
            Gene::new(4, "D").with_clinical_score(0.5),
        ])
        .await;
        store
            .upsert_annotations(&[row(4, "hgnc", json!({"x": 1})), row(4, "gnomad", json!({"x": 1}))])
            .await
            .unwrap();

        let active = vec!["hgnc".to_string(), "gnomad".to_string()];
        let ids: Vec<_> = store
            .genes_needing_update(&active)
            .await
            .unwrap()
            .into_iter()
            .map(|g| g.gene_id)
            .collect();
        assert_eq!(ids, vec![2, 3, 1]);
    }

    #[tokio::test]
    async fn test_ensure_source_is_stable() {
        let store = InMemoryAnnotationStore::new();
        let first = store.ensure_source(&definition("hgnc")).await.unwrap();
        store.mark_source_updated("hgnc", Utc::now()).await.unwrap();
        let second = store.ensure_source(&definition("hgnc")).await.unwrap();
        assert_eq!(first.source_name, second.source_name);
        assert!(second.last_update.is_some());
        assert_eq!(store.list_sources().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_mark_unknown_source_fails() {
        let store = InMemoryAnnotationStore::new();
        let err = store.mark_source_updated("nope", Utc::now()).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_injected_upsert_failures_are_consumed() {
        let store = InMemoryAnnotationStore::new();
        store.fail_next_upserts("clinvar", 1).await;
        let rows = vec![row(1, "clinvar", json!({"a": 1}))];
        assert!(store.upsert_annotations(&rows).await.is_err());
        assert!(store.upsert_annotations(&rows).await.is_ok());
    }

    #[tokio::test]
    async fn test_annotation_stats() {
        let store = InMemoryAnnotationStore::with_genes([
            Gene::new(1, "A"),
            Gene::new(2, "B"),
            Gene::new(3, "C"),
        ])
        .await;
        store
            .upsert_annotations(&[
                row(1, "gnomad", json!({"pli": 0.4})),
                row(2, "gnomad", json!({"error": "timeout"})),
            ])
            .await
            .unwrap();
        let stats = store.annotation_stats("gnomad").await.unwrap();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.error_payloads, 1);
        assert_eq!(stats.genes_without_annotation, 1);
    }

    #[tokio::test]
    async fn test_checkpoint_round_trip() {
        let store = InMemoryAnnotationStore::new();
        assert!(store.load_checkpoint("p").await.unwrap().is_none());
        store.save_checkpoint("p", "running", &json!({"v": 1})).await.unwrap();
        assert_eq!(store.load_checkpoint("p").await.unwrap(), Some(json!({"v": 1})));
        store.clear_checkpoint("p").await.unwrap();
        assert!(store.load_checkpoint("p").await.unwrap().is_none());
    }
}
