//! Persistent annotation store trait.

use async_trait::async_trait;
use geneweave_core::{
    AnnotationSource, AnnotationStats, Gene, GeneAnnotation, GeneId, GeneIdentifiers,
    SourceDefinition, StoreResult, Timestamp,
};
use serde_json::Value as JsonValue;

/// Row counts produced by one bulk upsert statement.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpsertOutcome {
    pub inserted: usize,
    pub updated: usize,
}

impl UpsertOutcome {
    pub fn total(&self) -> usize {
        self.inserted + self.updated
    }

    pub fn merge(&mut self, other: UpsertOutcome) {
        self.inserted += other.inserted;
        self.updated += other.updated;
    }
}

/// The relational store the update engine reads genes from and writes
/// annotations, source rows and checkpoints to.
#[async_trait]
pub trait AnnotationStore: Send + Sync {
    // === Genes ===

    /// Load genes by id, or every gene when `gene_ids` is `None`.
    /// Results are ordered by id; unknown ids are skipped.
    async fn load_genes(&self, gene_ids: Option<&[GeneId]>) -> StoreResult<Vec<Gene>>;

    async fn count_genes(&self) -> StoreResult<u64>;

    /// Genes with fewer annotations than there are `active_sources`,
    /// ordered by clinical score descending, then id.
    async fn genes_needing_update(&self, active_sources: &[String]) -> StoreResult<Vec<Gene>>;

    async fn update_gene_identifiers(
        &self,
        gene_id: GeneId,
        identifiers: &GeneIdentifiers,
    ) -> StoreResult<()>;

    // === Sources ===

    /// Return the source row, creating it from `definition` if absent.
    ///
    /// A concurrent creation is resolved by re-reading the existing row.
    async fn ensure_source(&self, definition: &SourceDefinition) -> StoreResult<AnnotationSource>;

    async fn get_source(&self, source_name: &str) -> StoreResult<Option<AnnotationSource>>;

    async fn list_sources(&self) -> StoreResult<Vec<AnnotationSource>>;

    /// Record a completed update: `last_update = now`,
    /// `next_update = now + update_frequency`.
    async fn mark_source_updated(
        &self,
        source_name: &str,
        now: Timestamp,
    ) -> StoreResult<AnnotationSource>;

    // === Annotations ===

    /// Insert-or-update one chunk keyed by `(gene_id, source, version)`.
    async fn upsert_annotations(&self, rows: &[GeneAnnotation]) -> StoreResult<UpsertOutcome>;

    async fn get_annotation(
        &self,
        gene_id: GeneId,
        source: &str,
    ) -> StoreResult<Option<GeneAnnotation>>;

    async fn annotation_count(&self, source: &str) -> StoreResult<u64>;

    async fn annotation_stats(&self, source: &str) -> StoreResult<AnnotationStats>;

    /// Refresh read-optimized derived views.
    async fn refresh_views(&self, concurrently: bool) -> StoreResult<()>;

    // === Checkpoints ===

    async fn load_checkpoint(&self, pipeline_id: &str) -> StoreResult<Option<JsonValue>>;

    async fn save_checkpoint(
        &self,
        pipeline_id: &str,
        status: &str,
        snapshot: &JsonValue,
    ) -> StoreResult<()>;

    async fn clear_checkpoint(&self, pipeline_id: &str) -> StoreResult<()>;
}

/// `data_source_progress.source_name` under which a pipeline's checkpoint
/// is stored.
pub fn checkpoint_key(pipeline_id: &str) -> String {
    format!("{}{}", geneweave_core::constants::CHECKPOINT_KEY_PREFIX, pipeline_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upsert_outcome_merge() {
        let mut total = UpsertOutcome::default();
        total.merge(UpsertOutcome { inserted: 3, updated: 1 });
        total.merge(UpsertOutcome { inserted: 0, updated: 2 });
        assert_eq!(total.total(), 6);
        assert_eq!(total.updated, 3);
    }

    #[test]
    fn test_checkpoint_key() {
        assert_eq!(checkpoint_key("nightly"), "pipeline:nightly");
    }
}
