//! ClinVar: the bulk-file source.
//!
//! Batch updates aggregate the `variant_summary` dump with a two-pass
//! streaming parse. Genes absent from the dump fall back to E-utilities,
//! whose records feed the same accumulator so both paths produce the same
//! payload shape.

pub mod accumulator;
pub mod aggregate;
pub mod eutils;
pub mod record;

pub use accumulator::{AccumulatorCaps, GeneAccumulator};
pub use aggregate::{open_variant_file, two_pass_aggregate, AggregationOutput, AggregationStats, ColumnMap};
pub use record::{build_priority, review_stars, Consequence, SignificanceCategory, VariantRecord};

use crate::adapter::{fetch_validated, AnnotationSourceAdapter, SourceContext};
use crate::bulk::BulkFileManager;
use crate::http::SourceHttpClient;
use async_trait::async_trait;
use geneweave_core::{
    is_valid_payload, CircuitState, ClinvarConfig, Gene, GeneId, SourceDefinition, SourceError,
    SourceResult,
};
use geneweave_storage::{CacheTtl, TwoTierCache};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;

pub const CLINVAR_SOURCE: &str = "clinvar";
const DEFAULT_FILE_NAME: &str = "variant_summary.txt.gz";

pub struct ClinvarSource {
    definition: SourceDefinition,
    http: SourceHttpClient,
    cache: Arc<TwoTierCache>,
    bulk: BulkFileManager,
    config: ClinvarConfig,
    loaded: Mutex<Option<PathBuf>>,
}

impl ClinvarSource {
    pub fn new(ctx: &SourceContext) -> SourceResult<Self> {
        let config = ctx.clinvar.clone();
        Ok(Self {
            definition: Self::definition_default(),
            http: ctx.http_client(CLINVAR_SOURCE)?,
            cache: ctx.cache.clone(),
            bulk: BulkFileManager::new(
                CLINVAR_SOURCE,
                config.data_dir.clone(),
                config.file_ttl,
                config.download_budget,
            ),
            config,
            loaded: Mutex::new(None),
        })
    }

    pub fn definition_default() -> SourceDefinition {
        SourceDefinition {
            source_name: CLINVAR_SOURCE.to_string(),
            display_name: "ClinVar".to_string(),
            version: "1.0".to_string(),
            update_frequency_hours: 24 * 7,
            base_url: eutils::EUTILS_BASE_URL.to_string(),
        }
    }

    fn caps(&self) -> AccumulatorCaps {
        AccumulatorCaps {
            detail_cap: self.config.detail_cap,
            condition_cap: self.config.condition_cap,
        }
    }

    fn file_name(&self) -> &str {
        self.config
            .download_url
            .rsplit('/')
            .next()
            .filter(|name| !name.is_empty())
            .unwrap_or(DEFAULT_FILE_NAME)
    }

    async fn loaded_path(&self) -> SourceResult<PathBuf> {
        self.ensure_bulk_data_loaded(false).await?;
        self.loaded.lock().await.clone().ok_or_else(|| SourceError::BulkFile {
            source_name: CLINVAR_SOURCE.to_string(),
            reason: "bulk file not loaded".to_string(),
        })
    }

    #[tracing::instrument(skip(self, targets), fields(source = CLINVAR_SOURCE, genes = targets.len()))]
    async fn aggregate(&self, path: PathBuf, targets: HashMap<String, GeneId>) -> SourceResult<AggregationOutput> {
        let caps = self.caps();
        let budget = self.config.parse_budget;
        let started = std::time::Instant::now();

        // a timed-out parse keeps running on its blocking thread until EOF
        let task = tokio::task::spawn_blocking(move || {
            two_pass_aggregate(|| open_variant_file(&path), &targets, caps)
        });
        let output = match tokio::time::timeout(budget, task).await {
            Err(_) => {
                return Err(SourceError::Timeout {
                    source_name: CLINVAR_SOURCE.to_string(),
                    operation: "bulk parse".to_string(),
                    budget,
                })
            }
            Ok(Err(join)) => return Err(bulk_error(format!("parse task failed: {}", join))),
            Ok(Ok(Err(io))) => return Err(bulk_error(format!("cannot read variant file: {}", io))),
            Ok(Ok(Ok(output))) => output,
        };

        tracing::info!(
            rows = output.stats.rows_scanned,
            unique_variants = output.stats.unique_variants,
            duplicates = output.stats.duplicate_rows_skipped,
            genes_with_data = output.stats.genes_with_data,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Aggregated variant summary"
        );
        Ok(output)
    }
}

fn bulk_error(reason: String) -> SourceError {
    SourceError::BulkFile {
        source_name: CLINVAR_SOURCE.to_string(),
        reason,
    }
}

/// Aggregate per-gene API records with the bulk accumulator.
pub fn summarize_records(records: &[VariantRecord], caps: AccumulatorCaps) -> Option<JsonValue> {
    if records.is_empty() {
        return None;
    }
    let mut acc = GeneAccumulator::new(caps);
    for record in records {
        acc.add(record);
    }
    Some(acc.finalize())
}

#[async_trait]
impl AnnotationSourceAdapter for ClinvarSource {
    fn definition(&self) -> &SourceDefinition {
        &self.definition
    }

    async fn fetch_one(&self, gene: &Gene) -> SourceResult<Option<JsonValue>> {
        let validator = |payload: &JsonValue| self.is_valid(payload);
        fetch_validated(&self.cache, CLINVAR_SOURCE, &gene.symbol, validator, || async {
            let records = eutils::fetch_gene_variants(&self.http, &gene.symbol).await?;
            Ok(summarize_records(&records, self.caps()))
        })
        .await
    }

    async fn fetch_batch(&self, genes: &[Gene]) -> SourceResult<HashMap<GeneId, JsonValue>> {
        if genes.is_empty() {
            return Ok(HashMap::new());
        }
        let path = self.loaded_path().await?;
        let targets: HashMap<String, GeneId> = genes.iter().map(|g| (g.symbol.clone(), g.gene_id)).collect();
        let output = self
            .http
            .breaker()
            .call(|| self.aggregate(path, targets))
            .await?;

        let symbols: HashMap<GeneId, &str> = genes.iter().map(|g| (g.gene_id, g.symbol.as_str())).collect();
        let mut results = HashMap::with_capacity(output.annotations.len());
        for (gene_id, payload) in output.annotations {
            if !self.is_valid(&payload) {
                continue;
            }
            if let Some(symbol) = symbols.get(&gene_id) {
                self.cache.set(symbol, payload.clone(), CLINVAR_SOURCE, CacheTtl::Namespace).await;
            }
            results.insert(gene_id, payload);
        }
        Ok(results)
    }

    async fn ensure_bulk_data_loaded(&self, force: bool) -> SourceResult<()> {
        let mut loaded = self.loaded.lock().await;
        if loaded.is_some() && !force {
            return Ok(());
        }
        let path = self
            .http
            .breaker()
            .call(|| async {
                self.http.limiter().wait().await;
                self.bulk
                    .ensure_file(self.http.client(), &self.config.download_url, self.file_name(), force)
                    .await
            })
            .await?;
        *loaded = Some(path);
        Ok(())
    }

    fn is_valid(&self, payload: &JsonValue) -> bool {
        is_valid_payload(payload)
            && payload
                .get("total_variants")
                .and_then(JsonValue::as_u64)
                .is_some_and(|n| n > 0)
    }

    fn circuit_state(&self) -> Option<CircuitState> {
        Some(self.http.breaker().state())
    }
}
