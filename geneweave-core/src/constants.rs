//! Engine-wide constants and defaults.

// ============================================================================
// ORCHESTRATOR
// ============================================================================

/// Identifier-resolution source that always runs before every other source.
pub const PRIORITY_SOURCE: &str = "hgnc";

/// Default orchestrator identity; checkpoints are keyed by it.
pub const DEFAULT_PIPELINE_ID: &str = "annotation_pipeline";

/// Maximum number of sources updated at the same time.
pub const DEFAULT_MAX_CONCURRENT_SOURCES: usize = 3;

/// Rows per bulk upsert statement.
pub const DEFAULT_UPSERT_CHUNK_SIZE: usize = 500;

/// Per-gene fallback writes between progress commits.
pub const DEFAULT_COMMIT_INTERVAL: usize = 100;

/// Attempts per gene in the backoff retry phase.
pub const DEFAULT_GENE_RETRY_ATTEMPTS: u32 = 3;
pub const DEFAULT_GENE_RETRY_INITIAL_DELAY_MS: u64 = 500;
pub const DEFAULT_GENE_RETRY_MAX_DELAY_MS: u64 = 10_000;

/// Bounded capacity of the cache invalidation queue.
pub const DEFAULT_INVALIDATION_QUEUE_CAPACITY: usize = 64;

/// Prefix of the `data_source_progress.source_name` used for checkpoints.
pub const CHECKPOINT_KEY_PREFIX: &str = "pipeline:";

// ============================================================================
// CACHE NAMESPACES
// ============================================================================

/// Generic namespace holding derived annotation views; invalidated after
/// every source update.
pub const ANNOTATIONS_NAMESPACE: &str = "annotations";

/// Externally visible API response cache; cleared once per run.
pub const API_RESPONSES_NAMESPACE: &str = "api_responses";

pub const DEFAULT_L1_CAPACITY: u64 = 10_000;
pub const DEFAULT_CACHE_TTL_SECS: u64 = 3_600;

/// Built-in per-namespace TTLs, in seconds.
pub const DEFAULT_NAMESPACE_TTLS: &[(&str, u64)] = &[
    ("hgnc", 86_400),
    ("gnomad", 604_800),
    ("clinvar", 86_400),
    ("ensembl", 604_800),
    (ANNOTATIONS_NAMESPACE, 3_600),
    (API_RESPONSES_NAMESPACE, 300),
];

// ============================================================================
// RESILIENCE
// ============================================================================

pub const DEFAULT_RETRY_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_RETRY_INITIAL_DELAY_MS: u64 = 1_000;
pub const DEFAULT_RETRY_MULTIPLIER: f64 = 2.0;
pub const DEFAULT_RETRY_MAX_DELAY_MS: u64 = 60_000;

/// HTTP statuses treated as transient.
pub const RETRYABLE_STATUS_CODES: &[u16] = &[429, 500, 502, 503, 504];

pub const DEFAULT_CIRCUIT_FAILURE_THRESHOLD: u32 = 5;
pub const DEFAULT_CIRCUIT_FAILURE_WINDOW_SECS: u64 = 60;
pub const DEFAULT_CIRCUIT_RECOVERY_TIMEOUT_SECS: u64 = 60;

// ============================================================================
// HTTP
// ============================================================================

pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_REQUESTS_PER_SECOND: f64 = 5.0;
pub const DEFAULT_USER_AGENT: &str = concat!("geneweave/", env!("CARGO_PKG_VERSION"));

// ============================================================================
// CLINVAR BULK FILE
// ============================================================================

pub const DEFAULT_CLINVAR_URL: &str =
    "https://ftp.ncbi.nlm.nih.gov/pub/clinvar/tab_delimited/variant_summary.txt.gz";
pub const DEFAULT_CLINVAR_DATA_DIR: &str = "data/clinvar";
pub const DEFAULT_CLINVAR_FILE_TTL_HOURS: u64 = 168;
pub const DEFAULT_CLINVAR_DETAIL_CAP: usize = 100;
pub const DEFAULT_CLINVAR_CONDITION_CAP: usize = 50;
pub const DEFAULT_CLINVAR_DOWNLOAD_BUDGET_SECS: u64 = 600;
pub const DEFAULT_CLINVAR_PARSE_BUDGET_SECS: u64 = 900;
