//! `AnnotationStore` over deadpool-postgres.

use super::{as_count, get_conn, is_unique_violation};
use crate::store::{checkpoint_key, AnnotationStore, UpsertOutcome};
use async_trait::async_trait;
use deadpool_postgres::Pool;
use geneweave_core::payload::ERROR_MARKER_KEYS;
use geneweave_core::{
    AnnotationKey, AnnotationSource, AnnotationStats, Gene, GeneAnnotation, GeneId,
    GeneIdentifiers, SourceDefinition, StoreError, StoreResult, Timestamp,
};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use tokio_postgres::types::ToSql;
use tokio_postgres::Row;

const GENE_COLUMNS: &str = "g.id, g.approved_symbol, g.hgnc_id, g.ensembl_gene_id, g.entrez_id, \
     COALESCE(g.clinical_score, 0)::float8";

const SOURCE_COLUMNS: &str =
    "source_name, display_name, is_active, update_frequency_hours, last_update, next_update, config";

const ANNOTATION_COLUMNS: &str = "gene_id, source, version, annotations, created_at, updated_at";

/// Materialized views refreshed after every run.
pub const DEFAULT_VIEWS: &[&str] = &["gene_annotations_summary"];

fn gene_from_row(row: &Row) -> Gene {
    Gene {
        gene_id: row.get(0),
        symbol: row.get(1),
        hgnc_id: row.get(2),
        ensembl_gene_id: row.get(3),
        entrez_id: row.get(4),
        clinical_score: row.get(5),
    }
}

fn source_from_row(row: &Row) -> AnnotationSource {
    let hours: i32 = row.get(3);
    AnnotationSource {
        source_name: row.get(0),
        display_name: row.get(1),
        is_active: row.get(2),
        update_frequency_hours: i64::from(hours),
        last_update: row.get(4),
        next_update: row.get(5),
        config: row.get(6),
    }
}

fn annotation_from_row(row: &Row) -> GeneAnnotation {
    GeneAnnotation {
        gene_id: row.get(0),
        source: row.get(1),
        version: row.get(2),
        annotations: row.get(3),
        created_at: row.get(4),
        updated_at: row.get(5),
    }
}

/// Postgres-backed annotation store.
#[derive(Clone)]
pub struct PgAnnotationStore {
    pool: Pool,
    views: Vec<String>,
}

impl PgAnnotationStore {
    pub fn new(pool: Pool) -> Self {
        Self {
            pool,
            views: DEFAULT_VIEWS.iter().map(|v| v.to_string()).collect(),
        }
    }

    pub fn with_views(mut self, views: Vec<String>) -> Self {
        self.views = views;
        self
    }

    /// Get the current pool size for observability.
    pub fn pool_size(&self) -> usize {
        self.pool.status().size
    }

    async fn insert_source(&self, definition: &SourceDefinition) -> StoreResult<AnnotationSource> {
        let conn = get_conn(&self.pool).await?;
        let fresh = AnnotationSource::from_definition(definition);
        let hours = i32::try_from(fresh.update_frequency_hours).unwrap_or(i32::MAX);
        let sql = format!(
            "INSERT INTO annotation_sources \
             (source_name, display_name, is_active, update_frequency_hours, config, created_at) \
             VALUES ($1, $2, $3, $4, $5, NOW()) RETURNING {}",
            SOURCE_COLUMNS
        );
        let row = conn
            .query_one(
                &sql,
                &[
                    &fresh.source_name,
                    &fresh.display_name,
                    &fresh.is_active,
                    &hours,
                    &fresh.config,
                ],
            )
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    StoreError::ConstraintRace {
                        entity: "annotation_source".to_string(),
                        key: definition.source_name.clone(),
                    }
                } else {
                    StoreError::database("insert_source", e)
                }
            })?;
        Ok(source_from_row(&row))
    }
}

impl std::fmt::Debug for PgAnnotationStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgAnnotationStore")
            .field("pool_size", &self.pool_size())
            .field("views", &self.views)
            .finish()
    }
}

/// Keep the last row per key so one statement never touches a row twice.
fn dedup_rows(rows: &[GeneAnnotation]) -> Vec<&GeneAnnotation> {
    let mut index: HashMap<AnnotationKey, usize> = HashMap::with_capacity(rows.len());
    let mut unique: Vec<&GeneAnnotation> = Vec::with_capacity(rows.len());
    for row in rows {
        match index.get(&row.key()) {
            Some(&i) => unique[i] = row,
            None => {
                index.insert(row.key(), unique.len());
                unique.push(row);
            }
        }
    }
    unique
}

fn upsert_sql(row_count: usize) -> String {
    let values: Vec<String> = (0..row_count)
        .map(|i| {
            let b = i * 6;
            format!(
                "(${}, ${}, ${}, ${}, ${}, ${})",
                b + 1,
                b + 2,
                b + 3,
                b + 4,
                b + 5,
                b + 6
            )
        })
        .collect();
    format!(
        "INSERT INTO gene_annotations ({}) VALUES {} \
         ON CONFLICT (gene_id, source, version) DO UPDATE \
         SET annotations = EXCLUDED.annotations, updated_at = EXCLUDED.updated_at \
         RETURNING (xmax = 0) AS inserted",
        ANNOTATION_COLUMNS,
        values.join(", ")
    )
}

#[async_trait]
impl AnnotationStore for PgAnnotationStore {
    async fn load_genes(&self, gene_ids: Option<&[GeneId]>) -> StoreResult<Vec<Gene>> {
        let conn = get_conn(&self.pool).await?;
        let rows = match gene_ids {
            None => {
                let sql = format!("SELECT {} FROM genes g ORDER BY g.id", GENE_COLUMNS);
                conn.query(&sql, &[]).await
            }
            Some(ids) => {
                let sql = format!(
                    "SELECT {} FROM genes g WHERE g.id = ANY($1) ORDER BY g.id",
                    GENE_COLUMNS
                );
                conn.query(&sql, &[&ids]).await
            }
        }
        .map_err(|e| StoreError::database("load_genes", e))?;
        Ok(rows.iter().map(gene_from_row).collect())
    }

    async fn count_genes(&self) -> StoreResult<u64> {
        let conn = get_conn(&self.pool).await?;
        let row = conn
            .query_one("SELECT COUNT(*) FROM genes", &[])
            .await
            .map_err(|e| StoreError::database("count_genes", e))?;
        Ok(as_count(row.get(0)))
    }

    async fn genes_needing_update(&self, active_sources: &[String]) -> StoreResult<Vec<Gene>> {
        let conn = get_conn(&self.pool).await?;
        let active_count = active_sources.len() as i64;
        let sql = format!(
            "SELECT {} FROM genes g \
             LEFT JOIN gene_annotations ga ON ga.gene_id = g.id AND ga.source = ANY($1) \
             GROUP BY g.id \
             HAVING COUNT(DISTINCT ga.source) < $2 \
             ORDER BY COALESCE(g.clinical_score, 0) DESC, g.id",
            GENE_COLUMNS
        );
        let rows = conn
            .query(&sql, &[&active_sources, &active_count])
            .await
            .map_err(|e| StoreError::database("genes_needing_update", e))?;
        Ok(rows.iter().map(gene_from_row).collect())
    }

    async fn update_gene_identifiers(
        &self,
        gene_id: GeneId,
        identifiers: &GeneIdentifiers,
    ) -> StoreResult<()> {
        let conn = get_conn(&self.pool).await?;
        let updated = conn
            .execute(
                "UPDATE genes SET \
                 hgnc_id = COALESCE($2, hgnc_id), \
                 ensembl_gene_id = COALESCE($3, ensembl_gene_id), \
                 entrez_id = COALESCE($4, entrez_id) \
                 WHERE id = $1",
                &[
                    &gene_id,
                    &identifiers.hgnc_id,
                    &identifiers.ensembl_gene_id,
                    &identifiers.entrez_id,
                ],
            )
            .await
            .map_err(|e| StoreError::database("update_gene_identifiers", e))?;
        if updated == 0 {
            return Err(StoreError::NotFound {
                entity: "gene".to_string(),
                key: gene_id.to_string(),
            });
        }
        Ok(())
    }

    async fn ensure_source(&self, definition: &SourceDefinition) -> StoreResult<AnnotationSource> {
        if let Some(existing) = self.get_source(&definition.source_name).await? {
            return Ok(existing);
        }
        match self.insert_source(definition).await {
            Ok(created) => {
                tracing::info!(source = %created.source_name, "Created annotation source");
                Ok(created)
            }
            Err(StoreError::ConstraintRace { entity, key }) => {
                tracing::debug!(source = %key, "Source created concurrently, re-reading");
                self.get_source(&key)
                    .await?
                    .ok_or(StoreError::NotFound { entity, key })
            }
            Err(e) => Err(e),
        }
    }

    async fn get_source(&self, source_name: &str) -> StoreResult<Option<AnnotationSource>> {
        let conn = get_conn(&self.pool).await?;
        let sql = format!(
            "SELECT {} FROM annotation_sources WHERE source_name = $1",
            SOURCE_COLUMNS
        );
        let row = conn
            .query_opt(&sql, &[&source_name])
            .await
            .map_err(|e| StoreError::database("get_source", e))?;
        Ok(row.as_ref().map(source_from_row))
    }

    async fn list_sources(&self) -> StoreResult<Vec<AnnotationSource>> {
        let conn = get_conn(&self.pool).await?;
        let sql = format!(
            "SELECT {} FROM annotation_sources ORDER BY source_name",
            SOURCE_COLUMNS
        );
        let rows = conn
            .query(&sql, &[])
            .await
            .map_err(|e| StoreError::database("list_sources", e))?;
        Ok(rows.iter().map(source_from_row).collect())
    }

    async fn mark_source_updated(
        &self,
        source_name: &str,
        now: Timestamp,
    ) -> StoreResult<AnnotationSource> {
        let conn = get_conn(&self.pool).await?;
        let sql = format!(
            "UPDATE annotation_sources SET \
             last_update = $2, \
             next_update = $2 + make_interval(hours => update_frequency_hours), \
             updated_at = $2 \
             WHERE source_name = $1 RETURNING {}",
            SOURCE_COLUMNS
        );
        let row = conn
            .query_opt(&sql, &[&source_name, &now])
            .await
            .map_err(|e| StoreError::database("mark_source_updated", e))?;
        row.as_ref()
            .map(source_from_row)
            .ok_or_else(|| StoreError::NotFound {
                entity: "annotation_source".to_string(),
                key: source_name.to_string(),
            })
    }

    async fn upsert_annotations(&self, rows: &[GeneAnnotation]) -> StoreResult<UpsertOutcome> {
        let unique = dedup_rows(rows);
        if unique.is_empty() {
            return Ok(UpsertOutcome::default());
        }

        let sql = upsert_sql(unique.len());
        let mut params: Vec<&(dyn ToSql + Sync)> = Vec::with_capacity(unique.len() * 6);
        for row in &unique {
            params.push(&row.gene_id);
            params.push(&row.source);
            params.push(&row.version);
            params.push(&row.annotations);
            params.push(&row.created_at);
            params.push(&row.updated_at);
        }

        let conn = get_conn(&self.pool).await?;
        let returned = conn
            .query(&sql, &params[..])
            .await
            .map_err(|e| StoreError::database("upsert_annotations", e))?;

        let inserted = returned.iter().filter(|r| r.get::<_, bool>(0)).count();
        Ok(UpsertOutcome {
            inserted,
            updated: returned.len() - inserted,
        })
    }

    async fn get_annotation(
        &self,
        gene_id: GeneId,
        source: &str,
    ) -> StoreResult<Option<GeneAnnotation>> {
        let conn = get_conn(&self.pool).await?;
        let sql = format!(
            "SELECT {} FROM gene_annotations WHERE gene_id = $1 AND source = $2 \
             ORDER BY updated_at DESC LIMIT 1",
            ANNOTATION_COLUMNS
        );
        let row = conn
            .query_opt(&sql, &[&gene_id, &source])
            .await
            .map_err(|e| StoreError::database("get_annotation", e))?;
        Ok(row.as_ref().map(annotation_from_row))
    }

    async fn annotation_count(&self, source: &str) -> StoreResult<u64> {
        let conn = get_conn(&self.pool).await?;
        let row = conn
            .query_one(
                "SELECT COUNT(*) FROM gene_annotations WHERE source = $1",
                &[&source],
            )
            .await
            .map_err(|e| StoreError::database("annotation_count", e))?;
        Ok(as_count(row.get(0)))
    }

    async fn annotation_stats(&self, source: &str) -> StoreResult<AnnotationStats> {
        let conn = get_conn(&self.pool).await?;
        let markers: Vec<String> = ERROR_MARKER_KEYS.iter().map(|k| k.to_string()).collect();
        let row = conn
            .query_one(
                "SELECT \
                   COUNT(*), \
                   COUNT(*) FILTER (WHERE annotations IS NULL \
                     OR annotations IN ('{}'::jsonb, '[]'::jsonb, 'null'::jsonb) \
                     OR (jsonb_typeof(annotations) = 'string' AND btrim(annotations #>> '{}') = '')), \
                   COUNT(*) FILTER (WHERE CASE WHEN jsonb_typeof(annotations) = 'object' THEN \
                     EXISTS (SELECT 1 FROM jsonb_each(annotations) e \
                             WHERE e.key = ANY($2) AND e.value <> 'null'::jsonb) \
                     ELSE false END), \
                   (SELECT COUNT(*) FROM genes g WHERE NOT EXISTS \
                     (SELECT 1 FROM gene_annotations x WHERE x.gene_id = g.id AND x.source = $1)) \
                 FROM gene_annotations WHERE source = $1",
                &[&source, &markers],
            )
            .await
            .map_err(|e| StoreError::database("annotation_stats", e))?;

        let total = as_count(row.get(0));
        let empty = as_count(row.get(1));
        let with_markers = as_count(row.get(2));
        Ok(AnnotationStats {
            source: source.to_string(),
            total,
            empty_payloads: empty,
            // An empty object cannot carry a marker, so the two never overlap.
            error_payloads: with_markers,
            genes_without_annotation: as_count(row.get(3)),
        })
    }

    async fn refresh_views(&self, concurrently: bool) -> StoreResult<()> {
        let conn = get_conn(&self.pool).await?;
        let mode = if concurrently { "CONCURRENTLY " } else { "" };
        for view in &self.views {
            let sql = format!("REFRESH MATERIALIZED VIEW {}{}", mode, view);
            conn.batch_execute(&sql)
                .await
                .map_err(|e| StoreError::database(format!("refresh_views({})", view), e))?;
        }
        Ok(())
    }

    async fn load_checkpoint(&self, pipeline_id: &str) -> StoreResult<Option<JsonValue>> {
        let conn = get_conn(&self.pool).await?;
        let row = conn
            .query_opt(
                "SELECT progress_metadata FROM data_source_progress WHERE source_name = $1",
                &[&checkpoint_key(pipeline_id)],
            )
            .await
            .map_err(|e| StoreError::database("load_checkpoint", e))?;
        Ok(row.and_then(|r| r.get::<_, Option<JsonValue>>(0)))
    }

    async fn save_checkpoint(
        &self,
        pipeline_id: &str,
        status: &str,
        snapshot: &JsonValue,
    ) -> StoreResult<()> {
        let conn = get_conn(&self.pool).await?;
        conn.execute(
            "INSERT INTO data_source_progress (source_name, status, progress_metadata, updated_at) \
             VALUES ($1, $2, $3, NOW()) \
             ON CONFLICT (source_name) DO UPDATE \
             SET status = EXCLUDED.status, progress_metadata = EXCLUDED.progress_metadata, \
                 updated_at = NOW()",
            &[&checkpoint_key(pipeline_id), &status, snapshot],
        )
        .await
        .map_err(|e| StoreError::database("save_checkpoint", e))?;
        Ok(())
    }

    async fn clear_checkpoint(&self, pipeline_id: &str) -> StoreResult<()> {
        let conn = get_conn(&self.pool).await?;
        conn.execute(
            "DELETE FROM data_source_progress WHERE source_name = $1",
            &[&checkpoint_key(pipeline_id)],
        )
        .await
        .map_err(|e| StoreError::database("clear_checkpoint", e))?;
        Ok(())
    }
}
