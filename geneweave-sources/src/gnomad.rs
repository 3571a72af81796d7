//! gnomAD gene constraint metrics over GraphQL.

use crate::adapter::{fetch_validated, AnnotationSourceAdapter, SourceContext};
use crate::http::SourceHttpClient;
use async_trait::async_trait;
use geneweave_core::{
    CircuitState, Gene, GeneId, SourceDefinition, SourceError, SourceResult,
};
use geneweave_storage::{CacheTtl, TwoTierCache};
use serde_json::{json, Value as JsonValue};
use std::collections::HashMap;
use std::sync::Arc;

pub const GNOMAD_SOURCE: &str = "gnomad";
const GNOMAD_API_URL: &str = "https://gnomad.broadinstitute.org/api";

/// Genes per aliased GraphQL request.
pub const GNOMAD_BATCH_SIZE: usize = 25;

const GENE_FIELDS: &str = "gene_id symbol gnomad_constraint { \
     exp_lof exp_mis exp_syn obs_lof obs_mis obs_syn \
     oe_lof oe_lof_lower oe_lof_upper oe_mis oe_mis_lower oe_mis_upper oe_syn \
     lof_z mis_z syn_z pLI flags }";

pub struct GnomadSource {
    definition: SourceDefinition,
    http: SourceHttpClient,
    cache: Arc<TwoTierCache>,
}

impl GnomadSource {
    pub fn new(ctx: &SourceContext) -> SourceResult<Self> {
        Ok(Self {
            definition: Self::definition_default(),
            http: ctx.http_client(GNOMAD_SOURCE)?,
            cache: ctx.cache.clone(),
        })
    }

    pub fn definition_default() -> SourceDefinition {
        SourceDefinition {
            source_name: GNOMAD_SOURCE.to_string(),
            display_name: "gnomAD".to_string(),
            version: "4.1".to_string(),
            update_frequency_hours: 24 * 30,
            base_url: GNOMAD_API_URL.to_string(),
        }
    }

    async fn query(&self, symbols: &[&str]) -> SourceResult<Option<JsonValue>> {
        let body = json!({ "query": build_constraint_query(symbols) });
        self.http.post_json(&self.definition.base_url, &body).await
    }
}

/// One GraphQL document with an aliased `gene` field per symbol
/// (`g0`, `g1`, ...).
pub fn build_constraint_query(symbols: &[&str]) -> String {
    let mut query = String::from("query GeneConstraint {");
    for (i, symbol) in symbols.iter().enumerate() {
        // JSON string quoting is valid GraphQL string quoting
        let quoted = serde_json::to_string(symbol).unwrap_or_else(|_| "\"\"".to_string());
        query.push_str(&format!(
            " g{}: gene(gene_symbol: {}, reference_genome: GRCh38) {{ {} }}",
            i, quoted, GENE_FIELDS
        ));
    }
    query.push_str(" }");
    query
}

/// Turn one aliased `gene` object into an annotation payload.
pub fn normalize_gene(gene: &JsonValue) -> Option<JsonValue> {
    let constraint = gene.get("gnomad_constraint")?;
    if !constraint.is_object() {
        return None;
    }
    Some(json!({
        "source": GNOMAD_SOURCE,
        "gene_id": gene.get("gene_id").cloned().unwrap_or(JsonValue::Null),
        "symbol": gene.get("symbol").cloned().unwrap_or(JsonValue::Null),
        "constraint": constraint,
    }))
}

/// Map a batched response back to symbols by alias index.
pub fn split_batch_response(body: &JsonValue, symbols: &[&str]) -> HashMap<String, JsonValue> {
    let mut out = HashMap::new();
    let Some(data) = body.get("data") else {
        return out;
    };
    for (i, symbol) in symbols.iter().enumerate() {
        if let Some(payload) = data.get(format!("g{}", i)).and_then(normalize_gene) {
            out.insert((*symbol).to_string(), payload);
        }
    }
    out
}

#[async_trait]
impl AnnotationSourceAdapter for GnomadSource {
    fn definition(&self) -> &SourceDefinition {
        &self.definition
    }

    async fn fetch_one(&self, gene: &Gene) -> SourceResult<Option<JsonValue>> {
        let validator = |payload: &JsonValue| self.is_valid(payload);
        fetch_validated(&self.cache, GNOMAD_SOURCE, &gene.symbol, validator, || async {
            let symbols = [gene.symbol.as_str()];
            let body = self.query(&symbols).await?;
            Ok(body.and_then(|b| split_batch_response(&b, &symbols).remove(&gene.symbol)))
        })
        .await
    }

    async fn fetch_batch(&self, genes: &[Gene]) -> SourceResult<HashMap<GeneId, JsonValue>> {
        let mut results = HashMap::new();
        let mut last_error: Option<SourceError> = None;

        for chunk in genes.chunks(GNOMAD_BATCH_SIZE) {
            let symbols: Vec<&str> = chunk.iter().map(|g| g.symbol.as_str()).collect();
            match self.query(&symbols).await {
                Ok(Some(body)) => {
                    let mut by_symbol = split_batch_response(&body, &symbols);
                    for gene in chunk {
                        if let Some(payload) = by_symbol.remove(&gene.symbol) {
                            if self.is_valid(&payload) {
                                self.cache
                                    .set(&gene.symbol, payload.clone(), GNOMAD_SOURCE, CacheTtl::Namespace)
                                    .await;
                                results.insert(gene.gene_id, payload);
                            }
                        }
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(source = GNOMAD_SOURCE, genes = chunk.len(), error = %e, "Batch chunk failed");
                    let circuit_open = matches!(e, SourceError::CircuitOpen { .. });
                    last_error = Some(e);
                    if circuit_open {
                        break;
                    }
                }
            }
        }

        match last_error {
            Some(e) if results.is_empty() => Err(e),
            _ => Ok(results),
        }
    }

    fn circuit_state(&self) -> Option<CircuitState> {
        Some(self.http.breaker().state())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_aliases_every_symbol() {
        let query = build_constraint_query(&["BRCA1", "TP53"]);
        assert!(query.contains("g0: gene(gene_symbol: \"BRCA1\", reference_genome: GRCh38)"));
        assert!(query.contains("g1: gene(gene_symbol: \"TP53\""));
        assert!(query.contains("pLI"));
    }

    #[test]
    fn test_query_escapes_symbols() {
        let query = build_constraint_query(&["A\"B"]);
        assert!(query.contains("\"A\\\"B\""));
    }

    #[test]
    fn test_split_batch_response() {
        let body = json!({
            "data": {
                "g0": {"gene_id": "ENSG00000012048", "symbol": "BRCA1", "gnomad_constraint": {"pLI": 0.0, "oe_lof": 0.8}},
                "g1": null,
                "g2": {"gene_id": "ENSG00000141510", "symbol": "TP53", "gnomad_constraint": null}
            },
            "errors": [{"message": "Gene not found"}]
        });
        let out = split_batch_response(&body, &["BRCA1", "FAKE1", "TP53"]);
        assert_eq!(out.len(), 1);
        let brca1 = &out["BRCA1"];
        assert_eq!(brca1["constraint"]["oe_lof"], 0.8);
        assert_eq!(brca1["source"], "gnomad");
    }

    #[test]
    fn test_missing_data_yields_nothing() {
        let body = json!({"errors": [{"message": "rate limited"}]});
        assert!(split_batch_response(&body, &["BRCA1"]).is_empty());
    }
}
