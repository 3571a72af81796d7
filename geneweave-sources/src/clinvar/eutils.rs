//! Per-gene ClinVar lookups through NCBI E-utilities.

use super::record::VariantRecord;
use crate::http::SourceHttpClient;
use geneweave_core::SourceResult;
use serde_json::Value as JsonValue;

pub const EUTILS_BASE_URL: &str = "https://eutils.ncbi.nlm.nih.gov/entrez/eutils";

/// Variation ids fetched per gene.
pub const MAX_IDS_PER_GENE: usize = 500;
const SUMMARY_CHUNK: usize = 200;

/// Search ClinVar for a gene symbol and summarize every hit.
pub async fn fetch_gene_variants(http: &SourceHttpClient, symbol: &str) -> SourceResult<Vec<VariantRecord>> {
    let term = format!("{}[gene]", symbol);
    let retmax = MAX_IDS_PER_GENE.to_string();
    let search = http
        .get_json(
            &format!("{}/esearch.fcgi", EUTILS_BASE_URL),
            &[("db", "clinvar"), ("term", term.as_str()), ("retmode", "json"), ("retmax", retmax.as_str())],
        )
        .await?;
    let ids = search.as_ref().map(search_ids).unwrap_or_default();
    if ids.is_empty() {
        return Ok(Vec::new());
    }

    let mut records = Vec::with_capacity(ids.len());
    for chunk in ids.chunks(SUMMARY_CHUNK) {
        let joined = chunk.join(",");
        let summary = http
            .get_json(
                &format!("{}/esummary.fcgi", EUTILS_BASE_URL),
                &[("db", "clinvar"), ("id", joined.as_str()), ("retmode", "json")],
            )
            .await?;
        if let Some(summary) = summary {
            records.extend(summary_records(&summary));
        }
    }
    Ok(records)
}

/// `esearchresult.idlist` from an esearch response.
pub fn search_ids(body: &JsonValue) -> Vec<String> {
    body.pointer("/esearchresult/idlist")
        .and_then(JsonValue::as_array)
        .map(|ids| {
            ids.iter()
                .filter_map(JsonValue::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Normalize every document of an esummary response.
pub fn summary_records(body: &JsonValue) -> Vec<VariantRecord> {
    let Some(result) = body.get("result") else {
        return Vec::new();
    };
    let uids = result
        .get("uids")
        .and_then(JsonValue::as_array)
        .cloned()
        .unwrap_or_default();
    uids.iter()
        .filter_map(JsonValue::as_str)
        .filter_map(|uid| summary_record(uid, result.get(uid)?))
        .collect()
}

fn summary_record(uid: &str, doc: &JsonValue) -> Option<VariantRecord> {
    let variation_id = uid.parse().ok()?;
    let str_at = |path: &str| doc.pointer(path).and_then(JsonValue::as_str).unwrap_or("").to_string();

    // germline_classification replaced clinical_significance in 2024
    let classification = doc
        .get("germline_classification")
        .filter(|c| c.get("description").and_then(JsonValue::as_str).is_some_and(|d| !d.is_empty()))
        .or_else(|| doc.get("clinical_significance"));
    let class_str = |key: &str| {
        classification
            .and_then(|c| c.get(key))
            .and_then(JsonValue::as_str)
            .unwrap_or("")
            .to_string()
    };

    let phenotypes = classification
        .and_then(|c| c.get("trait_set"))
        .or_else(|| doc.get("trait_set"))
        .and_then(JsonValue::as_array)
        .map(|traits| {
            traits
                .iter()
                .filter_map(|t| t.get("trait_name").and_then(JsonValue::as_str))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    let location = preferred_location(doc);
    let loc_str = |key: &str| {
        location
            .and_then(|l| l.get(key))
            .and_then(JsonValue::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };

    Some(VariantRecord {
        variation_id,
        name: str_at("/title"),
        variant_type: str_at("/obj_type"),
        clinical_significance: class_str("description"),
        review_status: class_str("review_status"),
        assembly: loc_str("assembly_name").unwrap_or_default(),
        chromosome: loc_str("chr"),
        start: loc_str("start").and_then(|s| s.parse().ok()),
        stop: loc_str("stop").and_then(|s| s.parse().ok()),
        phenotypes,
        number_submitters: None,
        last_evaluated: Some(class_str("last_evaluated")).filter(|s| !s.is_empty()),
    })
}

/// The GRCh38 location when present, else the first one listed.
fn preferred_location(doc: &JsonValue) -> Option<&JsonValue> {
    let locations = doc
        .pointer("/variation_set/0/variation_loc")
        .and_then(JsonValue::as_array)?;
    locations
        .iter()
        .find(|l| l.get("assembly_name").and_then(JsonValue::as_str) == Some("GRCh38"))
        .or_else(|| locations.first())
}
