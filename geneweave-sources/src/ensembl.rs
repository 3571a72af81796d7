//! Ensembl gene lookups.

use crate::adapter::{fetch_validated, AnnotationSourceAdapter, SourceContext};
use crate::http::SourceHttpClient;
use async_trait::async_trait;
use geneweave_core::{CircuitState, Gene, GeneId, SourceDefinition, SourceResult};
use geneweave_storage::{CacheTtl, TwoTierCache};
use serde_json::{json, Value as JsonValue};
use std::collections::HashMap;
use std::sync::Arc;

pub const ENSEMBL_SOURCE: &str = "ensembl";
const ENSEMBL_BASE_URL: &str = "https://rest.ensembl.org";

/// Ids per `POST /lookup/id` request.
pub const ENSEMBL_BATCH_SIZE: usize = 200;

const KEPT_FIELDS: &[&str] = &[
    "display_name",
    "description",
    "biotype",
    "seq_region_name",
    "start",
    "end",
    "strand",
    "assembly_name",
    "canonical_transcript",
    "version",
];

pub struct EnsemblSource {
    definition: SourceDefinition,
    http: SourceHttpClient,
    cache: Arc<TwoTierCache>,
}

impl EnsemblSource {
    pub fn new(ctx: &SourceContext) -> SourceResult<Self> {
        Ok(Self {
            definition: Self::definition_default(),
            http: ctx.http_client(ENSEMBL_SOURCE)?,
            cache: ctx.cache.clone(),
        })
    }

    pub fn definition_default() -> SourceDefinition {
        SourceDefinition {
            source_name: ENSEMBL_SOURCE.to_string(),
            display_name: "Ensembl".to_string(),
            version: "1.0".to_string(),
            update_frequency_hours: 24 * 30,
            base_url: ENSEMBL_BASE_URL.to_string(),
        }
    }
}

/// Normalize a lookup record. Records without an `id` are rejected.
pub fn normalize_lookup(record: &JsonValue) -> Option<JsonValue> {
    let record = record.as_object()?;
    let id = record.get("id")?.as_str()?;
    let mut payload = serde_json::Map::new();
    payload.insert("source".to_string(), json!(ENSEMBL_SOURCE));
    payload.insert("ensembl_gene_id".to_string(), json!(id));
    for field in KEPT_FIELDS {
        if let Some(value) = record.get(*field).filter(|v| !v.is_null()) {
            payload.insert((*field).to_string(), value.clone());
        }
    }
    Some(JsonValue::Object(payload))
}

#[async_trait]
impl AnnotationSourceAdapter for EnsemblSource {
    fn definition(&self) -> &SourceDefinition {
        &self.definition
    }

    async fn fetch_one(&self, gene: &Gene) -> SourceResult<Option<JsonValue>> {
        let validator = |payload: &JsonValue| self.is_valid(payload);
        fetch_validated(&self.cache, ENSEMBL_SOURCE, &gene.symbol, validator, || async {
            let url = format!(
                "{}/lookup/symbol/homo_sapiens/{}",
                self.definition.base_url, gene.symbol
            );
            let body = self.http.get_json(&url, &[("content-type", "application/json")]).await?;
            Ok(body.as_ref().and_then(normalize_lookup))
        })
        .await
    }

    /// Batch lookup for genes that already carry an Ensembl id; the rest
    /// are left to the per-gene symbol lookup.
    async fn fetch_batch(&self, genes: &[Gene]) -> SourceResult<HashMap<GeneId, JsonValue>> {
        let with_ids: Vec<(&Gene, &str)> = genes
            .iter()
            .filter_map(|g| g.ensembl_gene_id.as_deref().map(|id| (g, id)))
            .collect();
        let mut results = HashMap::new();
        let url = format!("{}/lookup/id", self.definition.base_url);

        for chunk in with_ids.chunks(ENSEMBL_BATCH_SIZE) {
            let ids: Vec<&str> = chunk.iter().map(|(_, id)| *id).collect();
            let Some(body) = self.http.post_json(&url, &json!({ "ids": ids })).await? else {
                continue;
            };
            for (gene, id) in chunk {
                let Some(payload) = body.get(*id).and_then(normalize_lookup) else {
                    continue;
                };
                if self.is_valid(&payload) {
                    self.cache
                        .set(&gene.symbol, payload.clone(), ENSEMBL_SOURCE, CacheTtl::Namespace)
                        .await;
                    results.insert(gene.gene_id, payload);
                }
            }
        }
        Ok(results)
    }

    fn circuit_state(&self) -> Option<CircuitState> {
        Some(self.http.breaker().state())
    }
}
