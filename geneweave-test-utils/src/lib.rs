//! GENEWEAVE Test Utilities
//!
//! Shared test infrastructure for the workspace:
//! - `ScriptedSource`: an adapter whose batch and per-gene behavior is
//!   scripted, which records every call it receives
//! - Gene, store and cache fixtures
//! - Writers for `variant_summary` bulk-file fixtures

pub use geneweave_storage::{InMemoryAnnotationStore, InMemoryCacheStore, TwoTierCache, WriteRecord};

use async_trait::async_trait;
use flate2::write::GzEncoder;
use flate2::Compression;
use geneweave_core::{
    CacheConfig, Gene, GeneId, GeneIdentifiers, SourceDefinition, SourceError, SourceResult,
};
use geneweave_sources::AnnotationSourceAdapter;
use serde_json::{json, Value as JsonValue};
use std::collections::{HashMap, HashSet, VecDeque};
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OnceCell};

// ============================================================================
// SCRIPTED SOURCE
// ============================================================================

/// What `fetch_batch` returns.
#[derive(Debug, Clone)]
pub enum BatchScript {
    /// A payload for every requested gene.
    All,
    /// An empty map: every gene goes to the per-gene path.
    Empty,
    /// Payloads only for these genes.
    Only(HashSet<GeneId>),
    Fail(SourceError),
}

/// What one `fetch_one` call returns.
#[derive(Debug, Clone)]
pub enum GeneScript {
    Found,
    Missing,
    /// A payload carrying an error marker.
    Invalid,
    Fail(SourceError),
}

/// Counts batch fetches in flight across every source sharing it, and the
/// highest count seen.
#[derive(Debug, Default)]
pub struct ConcurrencyGauge {
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl ConcurrencyGauge {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    fn enter(self: &Arc<Self>) -> GaugeSlot {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        GaugeSlot(self.clone())
    }
}

struct GaugeSlot(Arc<ConcurrencyGauge>);

impl Drop for GaugeSlot {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A call received by a [`ScriptedSource`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceCall {
    Batch(Vec<GeneId>),
    One(GeneId),
    EnsureBulk(bool),
}

pub struct ScriptedSource {
    definition: SourceDefinition,
    batch: BatchScript,
    default_one: GeneScript,
    per_gene: Mutex<HashMap<GeneId, VecDeque<GeneScript>>>,
    delay: Option<Duration>,
    hang: bool,
    resolves_identifiers: bool,
    observed_store: Option<Arc<InMemoryAnnotationStore>>,
    gauge: Option<Arc<ConcurrencyGauge>>,
    writes_at_first_call: OnceCell<Vec<WriteRecord>>,
    calls: Mutex<Vec<SourceCall>>,
}

impl ScriptedSource {
    /// A source whose batch returns every gene.
    pub fn new(name: &str) -> Self {
        Self {
            definition: source_definition(name),
            batch: BatchScript::All,
            default_one: GeneScript::Found,
            per_gene: Mutex::new(HashMap::new()),
            delay: None,
            hang: false,
            resolves_identifiers: false,
            observed_store: None,
            gauge: None,
            writes_at_first_call: OnceCell::new(),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// A source where every call fails with a permanent error.
    pub fn failing(name: &str) -> Self {
        let error = SourceError::permanent(name, Some(500), "scripted outage");
        Self::new(name)
            .with_batch(BatchScript::Fail(error.clone()))
            .with_default_one(GeneScript::Fail(error))
    }

    pub fn with_batch(mut self, batch: BatchScript) -> Self {
        self.batch = batch;
        self
    }

    pub fn with_default_one(mut self, outcome: GeneScript) -> Self {
        self.default_one = outcome;
        self
    }

    /// Script successive `fetch_one` outcomes for a gene. The last
    /// outcome repeats once the script runs out.
    pub fn with_gene_script(self, gene_id: GeneId, outcomes: Vec<GeneScript>) -> Self {
        if let Ok(mut per_gene) = self.per_gene.try_lock() {
            per_gene.insert(gene_id, outcomes.into());
        }
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Never complete any fetch.
    pub fn hanging(mut self) -> Self {
        self.hang = true;
        self
    }

    /// Payloads carry identifiers and `extract_identifiers` returns them.
    pub fn resolving_identifiers(mut self) -> Self {
        self.resolves_identifiers = true;
        self
    }

    /// Snapshot the store's write log when this source receives its first
    /// call.
    pub fn observing(mut self, store: Arc<InMemoryAnnotationStore>) -> Self {
        self.observed_store = Some(store);
        self
    }

    /// Report batch fetches to a gauge shared with other sources.
    pub fn gauged(mut self, gauge: Arc<ConcurrencyGauge>) -> Self {
        self.gauge = Some(gauge);
        self
    }

    pub fn with_update_frequency_hours(mut self, hours: i64) -> Self {
        self.definition.update_frequency_hours = hours;
        self
    }

    pub async fn calls(&self) -> Vec<SourceCall> {
        self.calls.lock().await.clone()
    }

    pub async fn fetch_one_calls(&self, gene_id: GeneId) -> usize {
        self.calls
            .lock()
            .await
            .iter()
            .filter(|c| **c == SourceCall::One(gene_id))
            .count()
    }

    pub async fn batch_calls(&self) -> usize {
        self.calls
            .lock()
            .await
            .iter()
            .filter(|c| matches!(c, SourceCall::Batch(_)))
            .count()
    }

    /// Whether any fetch was attempted.
    pub async fn was_called(&self) -> bool {
        self.calls
            .lock()
            .await
            .iter()
            .any(|c| !matches!(c, SourceCall::EnsureBulk(_)))
    }

    /// The observed store's write log at this source's first call.
    pub fn writes_at_first_call(&self) -> Option<&Vec<WriteRecord>> {
        self.writes_at_first_call.get()
    }

    pub fn payload_for(&self, gene: &Gene) -> JsonValue {
        let mut payload = json!({
            "source": self.definition.source_name,
            "symbol": gene.symbol,
            "gene_id": gene.gene_id,
        });
        if self.resolves_identifiers {
            payload["hgnc_id"] = json!(format!("HGNC:{}", gene.gene_id));
            payload["ensembl_gene_id"] = json!(format!("ENSG{:011}", gene.gene_id));
            payload["entrez_id"] = json!(gene.gene_id.to_string());
        }
        payload
    }

    async fn record(&self, call: SourceCall) {
        if let Some(store) = &self.observed_store {
            self.writes_at_first_call
                .get_or_init(|| async { store.write_log().await })
                .await;
        }
        self.calls.lock().await.push(call);
    }

    async fn pace(&self) {
        if self.hang {
            std::future::pending::<()>().await;
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
    }

    async fn next_outcome(&self, gene_id: GeneId) -> GeneScript {
        let mut per_gene = self.per_gene.lock().await;
        match per_gene.get_mut(&gene_id) {
            Some(script) if script.len() > 1 => script.pop_front().unwrap_or(GeneScript::Found),
            Some(script) => script.front().cloned().unwrap_or_else(|| self.default_one.clone()),
            None => self.default_one.clone(),
        }
    }
}

#[async_trait]
impl AnnotationSourceAdapter for ScriptedSource {
    fn definition(&self) -> &SourceDefinition {
        &self.definition
    }

    async fn fetch_one(&self, gene: &Gene) -> SourceResult<Option<JsonValue>> {
        self.record(SourceCall::One(gene.gene_id)).await;
        self.pace().await;
        match self.next_outcome(gene.gene_id).await {
            GeneScript::Found => Ok(Some(self.payload_for(gene))),
            GeneScript::Missing => Ok(None),
            GeneScript::Invalid => Err(SourceError::validation(
                &self.definition.source_name,
                format!("error marker for {}", gene.symbol),
            )),
            GeneScript::Fail(e) => Err(e),
        }
    }

    async fn fetch_batch(&self, genes: &[Gene]) -> SourceResult<HashMap<GeneId, JsonValue>> {
        self.record(SourceCall::Batch(genes.iter().map(|g| g.gene_id).collect()))
            .await;
        let _slot = self.gauge.as_ref().map(ConcurrencyGauge::enter);
        self.pace().await;
        let selected = |gene: &&Gene| match &self.batch {
            BatchScript::All => true,
            BatchScript::Only(ids) => ids.contains(&gene.gene_id),
            BatchScript::Empty | BatchScript::Fail(_) => false,
        };
        if let BatchScript::Fail(e) = &self.batch {
            return Err(e.clone());
        }
        Ok(genes
            .iter()
            .filter(selected)
            .map(|g| (g.gene_id, self.payload_for(g)))
            .collect())
    }

    async fn ensure_bulk_data_loaded(&self, force: bool) -> SourceResult<()> {
        self.calls.lock().await.push(SourceCall::EnsureBulk(force));
        Ok(())
    }

    fn extract_identifiers(&self, payload: &JsonValue) -> Option<GeneIdentifiers> {
        if !self.resolves_identifiers {
            return None;
        }
        let text = |key: &str| payload.get(key).and_then(JsonValue::as_str).map(str::to_string);
        Some(GeneIdentifiers {
            hgnc_id: text("hgnc_id"),
            ensembl_gene_id: text("ensembl_gene_id"),
            entrez_id: text("entrez_id"),
        })
    }
}

impl std::fmt::Debug for ScriptedSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptedSource")
            .field("name", &self.definition.source_name)
            .field("batch", &self.batch)
            .field("hang", &self.hang)
            .finish()
    }
}

// ============================================================================
// FIXTURES
// ============================================================================

pub fn source_definition(name: &str) -> SourceDefinition {
    SourceDefinition {
        source_name: name.to_string(),
        display_name: name.to_uppercase(),
        version: "1.0".to_string(),
        update_frequency_hours: 24,
        base_url: format!("https://{}.example.org", name),
    }
}

/// Genes `1..=n` named `GENE<id>`, with clinical scores cycling 0..7.
pub fn gene_fixtures(n: i64) -> Vec<Gene> {
    (1..=n)
        .map(|id| Gene::new(id, format!("GENE{}", id)).with_clinical_score((id % 7) as f64))
        .collect()
}

pub async fn store_with_genes(n: i64) -> Arc<InMemoryAnnotationStore> {
    Arc::new(InMemoryAnnotationStore::with_genes(gene_fixtures(n)).await)
}

/// A two-tier cache over an in-memory persistent tier.
pub fn memory_cache() -> (Arc<TwoTierCache>, Arc<InMemoryCacheStore>) {
    let l2 = Arc::new(InMemoryCacheStore::new());
    let cache = Arc::new(TwoTierCache::new(l2.clone(), CacheConfig::default()));
    (cache, l2)
}

// ============================================================================
// BULK FILE FIXTURES
// ============================================================================

pub const VARIANT_SUMMARY_HEADER: &str = "#AlleleID\tType\tName\tGeneID\tGeneSymbol\tClinicalSignificance\tLastEvaluated\tPhenotypeList\tAssembly\tChromosome\tStart\tStop\tReviewStatus\tNumberSubmitters\tVariationID";

/// One `variant_summary` row in [`VARIANT_SUMMARY_HEADER`] column order.
pub fn variant_row(variation_id: u64, symbol: &str, significance: &str, assembly: &str, name: &str) -> String {
    format!(
        "{variation_id}\tsingle nucleotide variant\t{name}\t-1\t{symbol}\t{significance}\tJan 01, 2024\tHereditary cancer\t{assembly}\t17\t1000\t1000\tcriteria provided, multiple submitters, no conflicts\t2\t{variation_id}"
    )
}

/// Write a gzip-compressed `variant_summary` file.
pub fn write_variant_summary_gz(path: &Path, rows: &[String]) -> std::io::Result<()> {
    let file = std::fs::File::create(path)?;
    let mut gz = GzEncoder::new(file, Compression::fast());
    writeln!(gz, "{}", VARIANT_SUMMARY_HEADER)?;
    for row in rows {
        writeln!(gz, "{}", row)?;
    }
    gz.finish()?;
    Ok(())
}
