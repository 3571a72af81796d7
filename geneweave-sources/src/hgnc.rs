//! HGNC: the identifier-resolution source.
//!
//! Runs ahead of every other source. Its payloads carry the Ensembl and
//! Entrez identifiers the later sources look genes up by.

use crate::adapter::{fetch_validated, AnnotationSourceAdapter, SourceContext};
use crate::http::SourceHttpClient;
use async_trait::async_trait;
use geneweave_core::{
    CircuitState, Gene, GeneIdentifiers, SourceDefinition, SourceResult,
};
use geneweave_storage::TwoTierCache;
use serde_json::{json, Value as JsonValue};
use std::sync::Arc;

pub const HGNC_SOURCE: &str = "hgnc";
const HGNC_BASE_URL: &str = "https://rest.genenames.org";

/// Fields copied from an HGNC document into the annotation payload.
const KEPT_FIELDS: &[&str] = &[
    "hgnc_id",
    "symbol",
    "name",
    "status",
    "locus_group",
    "locus_type",
    "location",
    "alias_symbol",
    "prev_symbol",
    "ensembl_gene_id",
    "entrez_id",
    "uniprot_ids",
    "omim_id",
    "mane_select",
    "gene_group",
    "date_modified",
];

pub struct HgncSource {
    definition: SourceDefinition,
    http: SourceHttpClient,
    cache: Arc<TwoTierCache>,
}

impl HgncSource {
    pub fn new(ctx: &SourceContext) -> SourceResult<Self> {
        Ok(Self {
            definition: Self::definition_default(),
            http: ctx.http_client(HGNC_SOURCE)?,
            cache: ctx.cache.clone(),
        })
    }

    pub fn definition_default() -> SourceDefinition {
        SourceDefinition {
            source_name: HGNC_SOURCE.to_string(),
            display_name: "HGNC".to_string(),
            version: "1.0".to_string(),
            update_frequency_hours: 24 * 7,
            base_url: HGNC_BASE_URL.to_string(),
        }
    }

    async fn fetch_remote(&self, symbol: &str) -> SourceResult<Option<JsonValue>> {
        let url = format!("{}/fetch/symbol/{}", self.definition.base_url, symbol);
        let body = self.http.get_json(&url, &[]).await?;
        Ok(body.and_then(|b| normalize_fetch_response(&b)))
    }
}

/// Reduce a `/fetch` response to the first matching document.
pub fn normalize_fetch_response(body: &JsonValue) -> Option<JsonValue> {
    let doc = body.pointer("/response/docs")?.as_array()?.first()?.as_object()?;
    let mut payload = serde_json::Map::new();
    for field in KEPT_FIELDS {
        if let Some(value) = doc.get(*field) {
            if !value.is_null() {
                payload.insert((*field).to_string(), value.clone());
            }
        }
    }
    if payload.is_empty() {
        return None;
    }
    payload.insert("source".to_string(), json!(HGNC_SOURCE));
    Some(JsonValue::Object(payload))
}

/// Identifiers carried by a normalized HGNC payload.
pub fn identifiers_from_payload(payload: &JsonValue) -> Option<GeneIdentifiers> {
    let text = |key: &str| -> Option<String> {
        match payload.get(key)? {
            JsonValue::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
            JsonValue::Number(n) => Some(n.to_string()),
            _ => None,
        }
    };
    let ids = GeneIdentifiers {
        hgnc_id: text("hgnc_id"),
        ensembl_gene_id: text("ensembl_gene_id"),
        entrez_id: text("entrez_id"),
    };
    (!ids.is_empty()).then_some(ids)
}

#[async_trait]
impl AnnotationSourceAdapter for HgncSource {
    fn definition(&self) -> &SourceDefinition {
        &self.definition
    }

    async fn fetch_one(&self, gene: &Gene) -> SourceResult<Option<JsonValue>> {
        let validator = |payload: &JsonValue| self.is_valid(payload);
        fetch_validated(&self.cache, HGNC_SOURCE, &gene.symbol, validator, || {
            self.fetch_remote(&gene.symbol)
        })
        .await
    }

    fn is_valid(&self, payload: &JsonValue) -> bool {
        geneweave_core::is_valid_payload(payload) && payload.get("hgnc_id").is_some()
    }

    fn extract_identifiers(&self, payload: &JsonValue) -> Option<GeneIdentifiers> {
        identifiers_from_payload(payload)
    }

    fn circuit_state(&self) -> Option<CircuitState> {
        Some(self.http.breaker().state())
    }
}
