//! Configuration types
//!
//! Every struct has sensible defaults and a `from_env()` constructor reading
//! `GENEWEAVE_*` variables. Unparseable values fall back to the default.

use crate::constants::*;
use crate::ConfigError;
use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

fn env_or<T: FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

fn invalid(field: &str, value: impl ToString, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

// ============================================================================
// RETRY
// ============================================================================

/// Retry-with-backoff settings.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    pub jitter: bool,
    pub retryable_statuses: Vec<u16>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_RETRY_MAX_ATTEMPTS,
            initial_delay: Duration::from_millis(DEFAULT_RETRY_INITIAL_DELAY_MS),
            multiplier: DEFAULT_RETRY_MULTIPLIER,
            max_delay: Duration::from_millis(DEFAULT_RETRY_MAX_DELAY_MS),
            jitter: true,
            retryable_statuses: RETRYABLE_STATUS_CODES.to_vec(),
        }
    }
}

impl RetryConfig {
    /// Create RetryConfig from environment variables.
    ///
    /// - `GENEWEAVE_RETRY_MAX_ATTEMPTS` (default: 3)
    /// - `GENEWEAVE_RETRY_INITIAL_DELAY_MS` (default: 1000)
    /// - `GENEWEAVE_RETRY_MULTIPLIER` (default: 2.0)
    /// - `GENEWEAVE_RETRY_MAX_DELAY_MS` (default: 60000)
    /// - `GENEWEAVE_RETRY_JITTER`: "true" or "false" (default: true)
    pub fn from_env() -> Self {
        Self {
            max_attempts: env_or("GENEWEAVE_RETRY_MAX_ATTEMPTS", DEFAULT_RETRY_MAX_ATTEMPTS),
            initial_delay: Duration::from_millis(env_or(
                "GENEWEAVE_RETRY_INITIAL_DELAY_MS",
                DEFAULT_RETRY_INITIAL_DELAY_MS,
            )),
            multiplier: env_or("GENEWEAVE_RETRY_MULTIPLIER", DEFAULT_RETRY_MULTIPLIER),
            max_delay: Duration::from_millis(env_or(
                "GENEWEAVE_RETRY_MAX_DELAY_MS",
                DEFAULT_RETRY_MAX_DELAY_MS,
            )),
            jitter: std::env::var("GENEWEAVE_RETRY_JITTER")
                .ok()
                .map(|s| s.to_lowercase() != "false")
                .unwrap_or(true),
            retryable_statuses: RETRYABLE_STATUS_CODES.to_vec(),
        }
    }

    /// A policy that never retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(invalid(
                "max_attempts",
                self.max_attempts,
                "max_attempts must be at least 1",
            ));
        }
        if self.multiplier < 1.0 {
            return Err(invalid(
                "multiplier",
                self.multiplier,
                "multiplier must be >= 1.0",
            ));
        }
        if self.max_delay < self.initial_delay {
            return Err(invalid(
                "max_delay",
                format!("{:?}", self.max_delay),
                "max_delay must not be shorter than initial_delay",
            ));
        }
        Ok(())
    }
}

// ============================================================================
// CIRCUIT BREAKER
// ============================================================================

/// Configuration for a per-source circuit breaker.
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures inside `failure_window` that open the circuit.
    pub failure_threshold: u32,
    pub failure_window: Duration,
    /// How long the circuit stays open before a trial call is allowed.
    pub recovery_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_CIRCUIT_FAILURE_THRESHOLD,
            failure_window: Duration::from_secs(DEFAULT_CIRCUIT_FAILURE_WINDOW_SECS),
            recovery_timeout: Duration::from_secs(DEFAULT_CIRCUIT_RECOVERY_TIMEOUT_SECS),
        }
    }
}

impl CircuitBreakerConfig {
    /// Create CircuitBreakerConfig from environment variables.
    ///
    /// # Environment Variables
    /// - `GENEWEAVE_CIRCUIT_FAILURE_THRESHOLD`: Failures before opening (default: 5)
    /// - `GENEWEAVE_CIRCUIT_FAILURE_WINDOW_SECS`: Window the failures must fall in (default: 60)
    /// - `GENEWEAVE_CIRCUIT_RECOVERY_SECS`: How long the circuit stays open (default: 60)
    pub fn from_env() -> Self {
        Self {
            failure_threshold: env_or(
                "GENEWEAVE_CIRCUIT_FAILURE_THRESHOLD",
                DEFAULT_CIRCUIT_FAILURE_THRESHOLD,
            ),
            failure_window: Duration::from_secs(env_or(
                "GENEWEAVE_CIRCUIT_FAILURE_WINDOW_SECS",
                DEFAULT_CIRCUIT_FAILURE_WINDOW_SECS,
            )),
            recovery_timeout: Duration::from_secs(env_or(
                "GENEWEAVE_CIRCUIT_RECOVERY_SECS",
                DEFAULT_CIRCUIT_RECOVERY_TIMEOUT_SECS,
            )),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.failure_threshold == 0 {
            return Err(invalid(
                "failure_threshold",
                self.failure_threshold,
                "failure_threshold must be greater than 0",
            ));
        }
        if self.failure_window.is_zero() {
            return Err(invalid(
                "failure_window",
                format!("{:?}", self.failure_window),
                "failure_window must be positive",
            ));
        }
        Ok(())
    }
}

// ============================================================================
// CACHE
// ============================================================================

/// Two-tier cache settings.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheConfig {
    /// Maximum number of entries held by the in-process tier.
    pub l1_capacity: u64,
    /// TTL for namespaces without an explicit policy.
    pub default_ttl: Duration,
    pub namespace_ttls: HashMap<String, Duration>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            l1_capacity: DEFAULT_L1_CAPACITY,
            default_ttl: Duration::from_secs(DEFAULT_CACHE_TTL_SECS),
            namespace_ttls: DEFAULT_NAMESPACE_TTLS
                .iter()
                .map(|(ns, secs)| (ns.to_string(), Duration::from_secs(*secs)))
                .collect(),
        }
    }
}

impl CacheConfig {
    /// Create CacheConfig from environment variables.
    ///
    /// - `GENEWEAVE_CACHE_L1_CAPACITY` (default: 10000)
    /// - `GENEWEAVE_CACHE_DEFAULT_TTL_SECS` (default: 3600)
    /// - `GENEWEAVE_CACHE_NAMESPACE_TTLS`: comma-separated `namespace=seconds`
    ///   pairs layered over the built-in policy
    pub fn from_env() -> Self {
        let mut config = Self {
            l1_capacity: env_or("GENEWEAVE_CACHE_L1_CAPACITY", DEFAULT_L1_CAPACITY),
            default_ttl: Duration::from_secs(env_or(
                "GENEWEAVE_CACHE_DEFAULT_TTL_SECS",
                DEFAULT_CACHE_TTL_SECS,
            )),
            ..Self::default()
        };

        if let Ok(raw) = std::env::var("GENEWEAVE_CACHE_NAMESPACE_TTLS") {
            config.namespace_ttls.extend(parse_namespace_ttls(&raw));
        }
        config
    }

    pub fn with_l1_capacity(mut self, capacity: u64) -> Self {
        self.l1_capacity = capacity;
        self
    }

    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    pub fn with_namespace_ttl(mut self, namespace: impl Into<String>, ttl: Duration) -> Self {
        self.namespace_ttls.insert(namespace.into(), ttl);
        self
    }

    /// TTL applied to `namespace` when the caller gives none.
    pub fn ttl_for(&self, namespace: &str) -> Duration {
        self.namespace_ttls
            .get(namespace)
            .copied()
            .unwrap_or(self.default_ttl)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.l1_capacity == 0 {
            return Err(invalid(
                "l1_capacity",
                self.l1_capacity,
                "l1_capacity must be greater than 0",
            ));
        }
        Ok(())
    }
}

/// Parse `ns=secs,ns2=secs` pairs, skipping malformed entries.
pub fn parse_namespace_ttls(raw: &str) -> HashMap<String, Duration> {
    raw.split(',')
        .filter_map(|pair| {
            let (ns, secs) = pair.split_once('=')?;
            let ns = ns.trim();
            if ns.is_empty() {
                return None;
            }
            let secs: u64 = secs.trim().parse().ok()?;
            Some((ns.to_string(), Duration::from_secs(secs)))
        })
        .collect()
}

// ============================================================================
// PIPELINE
// ============================================================================

/// Orchestrator settings.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    pub pipeline_id: String,
    pub max_concurrent_sources: usize,
    pub upsert_chunk_size: usize,
    pub commit_interval: usize,
    pub gene_retry_attempts: u32,
    pub gene_retry_initial_delay: Duration,
    pub gene_retry_max_delay: Duration,
    /// Wall-clock budget for one source update. `None` means unbounded.
    pub source_timeout: Option<Duration>,
    pub invalidation_queue_capacity: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            pipeline_id: DEFAULT_PIPELINE_ID.to_string(),
            max_concurrent_sources: DEFAULT_MAX_CONCURRENT_SOURCES,
            upsert_chunk_size: DEFAULT_UPSERT_CHUNK_SIZE,
            commit_interval: DEFAULT_COMMIT_INTERVAL,
            gene_retry_attempts: DEFAULT_GENE_RETRY_ATTEMPTS,
            gene_retry_initial_delay: Duration::from_millis(DEFAULT_GENE_RETRY_INITIAL_DELAY_MS),
            gene_retry_max_delay: Duration::from_millis(DEFAULT_GENE_RETRY_MAX_DELAY_MS),
            source_timeout: None,
            invalidation_queue_capacity: DEFAULT_INVALIDATION_QUEUE_CAPACITY,
        }
    }
}

impl PipelineConfig {
    /// Create PipelineConfig from environment variables.
    ///
    /// - `GENEWEAVE_PIPELINE_ID` (default: "annotation_pipeline")
    /// - `GENEWEAVE_MAX_CONCURRENT_SOURCES` (default: 3)
    /// - `GENEWEAVE_UPSERT_CHUNK_SIZE` (default: 500)
    /// - `GENEWEAVE_COMMIT_INTERVAL` (default: 100)
    /// - `GENEWEAVE_GENE_RETRY_ATTEMPTS` (default: 3)
    /// - `GENEWEAVE_GENE_RETRY_INITIAL_DELAY_MS` (default: 500)
    /// - `GENEWEAVE_GENE_RETRY_MAX_DELAY_MS` (default: 10000)
    /// - `GENEWEAVE_SOURCE_TIMEOUT_SECS`: unset or 0 disables the budget
    /// - `GENEWEAVE_INVALIDATION_QUEUE_CAPACITY` (default: 64)
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let source_timeout = std::env::var("GENEWEAVE_SOURCE_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.trim().parse::<u64>().ok())
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs);

        Self {
            pipeline_id: std::env::var("GENEWEAVE_PIPELINE_ID")
                .ok()
                .filter(|s| !s.trim().is_empty())
                .unwrap_or(defaults.pipeline_id),
            max_concurrent_sources: env_or(
                "GENEWEAVE_MAX_CONCURRENT_SOURCES",
                defaults.max_concurrent_sources,
            ),
            upsert_chunk_size: env_or("GENEWEAVE_UPSERT_CHUNK_SIZE", defaults.upsert_chunk_size),
            commit_interval: env_or("GENEWEAVE_COMMIT_INTERVAL", defaults.commit_interval),
            gene_retry_attempts: env_or(
                "GENEWEAVE_GENE_RETRY_ATTEMPTS",
                defaults.gene_retry_attempts,
            ),
            gene_retry_initial_delay: Duration::from_millis(env_or(
                "GENEWEAVE_GENE_RETRY_INITIAL_DELAY_MS",
                DEFAULT_GENE_RETRY_INITIAL_DELAY_MS,
            )),
            gene_retry_max_delay: Duration::from_millis(env_or(
                "GENEWEAVE_GENE_RETRY_MAX_DELAY_MS",
                DEFAULT_GENE_RETRY_MAX_DELAY_MS,
            )),
            source_timeout,
            invalidation_queue_capacity: env_or(
                "GENEWEAVE_INVALIDATION_QUEUE_CAPACITY",
                defaults.invalidation_queue_capacity,
            ),
        }
    }

    /// Retry policy for the per-gene backoff phase.
    pub fn gene_retry(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.gene_retry_attempts,
            initial_delay: self.gene_retry_initial_delay,
            max_delay: self.gene_retry_max_delay,
            ..RetryConfig::default()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent_sources == 0 {
            return Err(invalid(
                "max_concurrent_sources",
                self.max_concurrent_sources,
                "at least one source must be allowed to run",
            ));
        }
        if self.upsert_chunk_size == 0 {
            return Err(invalid(
                "upsert_chunk_size",
                self.upsert_chunk_size,
                "upsert_chunk_size must be greater than 0",
            ));
        }
        if self.commit_interval == 0 {
            return Err(invalid(
                "commit_interval",
                self.commit_interval,
                "commit_interval must be greater than 0",
            ));
        }
        if self.invalidation_queue_capacity == 0 {
            return Err(invalid(
                "invalidation_queue_capacity",
                self.invalidation_queue_capacity,
                "invalidation_queue_capacity must be greater than 0",
            ));
        }
        if self.pipeline_id.trim().is_empty() {
            return Err(ConfigError::MissingRequired {
                field: "pipeline_id".to_string(),
            });
        }
        Ok(())
    }
}

// ============================================================================
// SOURCES
// ============================================================================

/// Outbound HTTP settings shared by source adapters.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceHttpConfig {
    pub timeout: Duration,
    pub requests_per_second: f64,
    pub user_agent: String,
}

impl Default for SourceHttpConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(DEFAULT_HTTP_TIMEOUT_SECS),
            requests_per_second: DEFAULT_REQUESTS_PER_SECOND,
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }
}

impl SourceHttpConfig {
    /// - `GENEWEAVE_HTTP_TIMEOUT_SECS` (default: 30)
    /// - `GENEWEAVE_REQUESTS_PER_SECOND` (default: 5.0)
    /// - `GENEWEAVE_USER_AGENT`
    pub fn from_env() -> Self {
        Self {
            timeout: Duration::from_secs(env_or(
                "GENEWEAVE_HTTP_TIMEOUT_SECS",
                DEFAULT_HTTP_TIMEOUT_SECS,
            )),
            requests_per_second: env_or("GENEWEAVE_REQUESTS_PER_SECOND", DEFAULT_REQUESTS_PER_SECOND),
            user_agent: std::env::var("GENEWEAVE_USER_AGENT")
                .unwrap_or_else(|_| DEFAULT_USER_AGENT.to_string()),
        }
    }

    pub fn with_requests_per_second(mut self, rps: f64) -> Self {
        self.requests_per_second = rps;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.requests_per_second > 0.0) {
            return Err(invalid(
                "requests_per_second",
                self.requests_per_second,
                "requests_per_second must be positive",
            ));
        }
        if self.timeout.is_zero() {
            return Err(invalid(
                "timeout",
                format!("{:?}", self.timeout),
                "timeout must be positive",
            ));
        }
        Ok(())
    }
}

/// ClinVar bulk file settings.
#[derive(Debug, Clone, PartialEq)]
pub struct ClinvarConfig {
    pub download_url: String,
    pub data_dir: PathBuf,
    /// A local copy younger than this is reused.
    pub file_ttl: Duration,
    /// Cap on each per-gene detail list.
    pub detail_cap: usize,
    /// Cap on distinct conditions tracked per gene.
    pub condition_cap: usize,
    pub download_budget: Duration,
    pub parse_budget: Duration,
}

impl Default for ClinvarConfig {
    fn default() -> Self {
        Self {
            download_url: DEFAULT_CLINVAR_URL.to_string(),
            data_dir: PathBuf::from(DEFAULT_CLINVAR_DATA_DIR),
            file_ttl: Duration::from_secs(DEFAULT_CLINVAR_FILE_TTL_HOURS * 3_600),
            detail_cap: DEFAULT_CLINVAR_DETAIL_CAP,
            condition_cap: DEFAULT_CLINVAR_CONDITION_CAP,
            download_budget: Duration::from_secs(DEFAULT_CLINVAR_DOWNLOAD_BUDGET_SECS),
            parse_budget: Duration::from_secs(DEFAULT_CLINVAR_PARSE_BUDGET_SECS),
        }
    }
}

impl ClinvarConfig {
    /// - `GENEWEAVE_CLINVAR_URL`
    /// - `GENEWEAVE_CLINVAR_DATA_DIR` (default: "data/clinvar")
    /// - `GENEWEAVE_CLINVAR_FILE_TTL_HOURS` (default: 168)
    /// - `GENEWEAVE_CLINVAR_DETAIL_CAP` (default: 100)
    /// - `GENEWEAVE_CLINVAR_CONDITION_CAP` (default: 50)
    /// - `GENEWEAVE_CLINVAR_DOWNLOAD_BUDGET_SECS` (default: 600)
    /// - `GENEWEAVE_CLINVAR_PARSE_BUDGET_SECS` (default: 900)
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            download_url: std::env::var("GENEWEAVE_CLINVAR_URL").unwrap_or(defaults.download_url),
            data_dir: std::env::var("GENEWEAVE_CLINVAR_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            file_ttl: Duration::from_secs(
                env_or(
                    "GENEWEAVE_CLINVAR_FILE_TTL_HOURS",
                    DEFAULT_CLINVAR_FILE_TTL_HOURS,
                ) * 3_600,
            ),
            detail_cap: env_or("GENEWEAVE_CLINVAR_DETAIL_CAP", defaults.detail_cap),
            condition_cap: env_or("GENEWEAVE_CLINVAR_CONDITION_CAP", defaults.condition_cap),
            download_budget: Duration::from_secs(env_or(
                "GENEWEAVE_CLINVAR_DOWNLOAD_BUDGET_SECS",
                DEFAULT_CLINVAR_DOWNLOAD_BUDGET_SECS,
            )),
            parse_budget: Duration::from_secs(env_or(
                "GENEWEAVE_CLINVAR_PARSE_BUDGET_SECS",
                DEFAULT_CLINVAR_PARSE_BUDGET_SECS,
            )),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.detail_cap == 0 {
            return Err(invalid(
                "detail_cap",
                self.detail_cap,
                "detail_cap must be greater than 0",
            ));
        }
        if self.download_url.trim().is_empty() {
            return Err(ConfigError::MissingRequired {
                field: "download_url".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        assert!(RetryConfig::default().validate().is_ok());
        assert!(CircuitBreakerConfig::default().validate().is_ok());
        assert!(CacheConfig::default().validate().is_ok());
        assert!(PipelineConfig::default().validate().is_ok());
        assert!(SourceHttpConfig::default().validate().is_ok());
        assert!(ClinvarConfig::default().validate().is_ok());
    }

    #[test]
    fn test_pipeline_defaults() {
        let config = PipelineConfig::default();
        assert_eq!(config.max_concurrent_sources, 3);
        assert_eq!(config.upsert_chunk_size, 500);
        assert!(config.source_timeout.is_none());
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let config = PipelineConfig {
            max_concurrent_sources: 0,
            ..PipelineConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { ref field, .. }) if field == "max_concurrent_sources"
        ));
    }

    #[test]
    fn test_retry_rejects_inverted_delays() {
        let config = RetryConfig {
            initial_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(1),
            ..RetryConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_namespace_ttl_lookup() {
        let config = CacheConfig::default().with_namespace_ttl("custom", Duration::from_secs(5));
        assert_eq!(config.ttl_for("custom"), Duration::from_secs(5));
        assert_eq!(config.ttl_for("api_responses"), Duration::from_secs(300));
        assert_eq!(config.ttl_for("unknown"), config.default_ttl);
    }

    #[test]
    fn test_parse_namespace_ttls_skips_garbage() {
        let parsed = parse_namespace_ttls("hgnc=10, bad, =5,gnomad=abc,clinvar = 20");
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed["hgnc"], Duration::from_secs(10));
        assert_eq!(parsed["clinvar"], Duration::from_secs(20));
    }

    #[test]
    fn test_gene_retry_derives_from_pipeline() {
        let config = PipelineConfig::default();
        let retry = config.gene_retry();
        assert_eq!(retry.max_attempts, config.gene_retry_attempts);
        assert_eq!(retry.initial_delay, config.gene_retry_initial_delay);
        assert!(retry.validate().is_ok());
    }
}
