//! The contract every annotation source implements.

use crate::http::SourceHttpClient;
use crate::resilience::{CircuitBreaker, RetryPolicy};
use async_trait::async_trait;
use geneweave_core::{
    is_valid_payload, payload_issue, CircuitBreakerConfig, CircuitState, ClinvarConfig, Gene,
    GeneId, GeneIdentifiers, RetryConfig, SourceDefinition, SourceError, SourceHttpConfig,
    SourceResult,
};
use geneweave_storage::{CacheTtl, TwoTierCache};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

/// An external annotation source.
///
/// `fetch_batch` is best effort: genes missing from the returned map are
/// not errors, they go through `fetch_one` instead. A batch-level `Err`
/// means the whole batch path is unavailable.
#[async_trait]
pub trait AnnotationSourceAdapter: Send + Sync {
    fn definition(&self) -> &SourceDefinition;

    fn name(&self) -> &str {
        &self.definition().source_name
    }

    fn version(&self) -> &str {
        &self.definition().version
    }

    /// Fetch a single gene's annotation. `Ok(None)` means the upstream has
    /// no record for it.
    async fn fetch_one(&self, gene: &Gene) -> SourceResult<Option<JsonValue>>;

    async fn fetch_batch(&self, _genes: &[Gene]) -> SourceResult<HashMap<GeneId, JsonValue>> {
        Ok(HashMap::new())
    }

    /// Make sure a bulk-file source has its data on hand. Idempotent;
    /// does nothing unless the data is missing, stale or `force` is set.
    async fn ensure_bulk_data_loaded(&self, _force: bool) -> SourceResult<()> {
        Ok(())
    }

    /// Whether a payload may be cached and stored.
    fn is_valid(&self, payload: &JsonValue) -> bool {
        is_valid_payload(payload)
    }

    /// Cross-reference identifiers carried by a payload, for sources that
    /// resolve identifiers for the others.
    fn extract_identifiers(&self, _payload: &JsonValue) -> Option<GeneIdentifiers> {
        None
    }

    fn circuit_state(&self) -> Option<CircuitState> {
        None
    }
}

impl std::fmt::Debug for dyn AnnotationSourceAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnnotationSourceAdapter")
            .field("name", &self.name())
            .field("version", &self.version())
            .finish()
    }
}

// ============================================================================
// SOURCE CONTEXT
// ============================================================================

/// Shared services handed to every source constructor.
#[derive(Debug, Clone)]
pub struct SourceContext {
    pub http: SourceHttpConfig,
    pub retry: RetryConfig,
    pub breaker: CircuitBreakerConfig,
    pub clinvar: ClinvarConfig,
    pub cache: Arc<TwoTierCache>,
}

impl SourceContext {
    pub fn new(cache: Arc<TwoTierCache>) -> Self {
        Self {
            http: SourceHttpConfig::default(),
            retry: RetryConfig::default(),
            breaker: CircuitBreakerConfig::default(),
            clinvar: ClinvarConfig::default(),
            cache,
        }
    }

    pub fn from_env(cache: Arc<TwoTierCache>) -> Self {
        Self {
            http: SourceHttpConfig::from_env(),
            retry: RetryConfig::from_env(),
            breaker: CircuitBreakerConfig::from_env(),
            clinvar: ClinvarConfig::from_env(),
            cache,
        }
    }

    /// A client with its own breaker and limiter, so health and rate state
    /// stay per adapter instance.
    pub fn http_client(&self, source_name: &str) -> SourceResult<SourceHttpClient> {
        let breaker = Arc::new(CircuitBreaker::new(source_name, self.breaker.clone()));
        SourceHttpClient::new(source_name, &self.http, RetryPolicy::new(self.retry.clone()), breaker)
    }
}

/// Read-through cache for a per-gene fetch.
///
/// Valid payloads are cached under the source's namespace. An invalid
/// payload is never cached and surfaces as a `Validation` error.
pub async fn fetch_validated<V, F, Fut>(
    cache: &TwoTierCache,
    source_name: &str,
    key: &str,
    is_valid: V,
    fetch: F,
) -> SourceResult<Option<JsonValue>>
where
    V: Fn(&JsonValue) -> bool,
    F: FnOnce() -> Fut,
    Fut: Future<Output = SourceResult<Option<JsonValue>>>,
{
    let fetched = cache
        .get_or_fetch(key, source_name, CacheTtl::Namespace, &is_valid, fetch)
        .await?;
    match fetched {
        Some(payload) if !is_valid(&payload) => {
            let reason = payload_issue(&payload)
                .map(|issue| format!("{:?} payload for {}", issue, key))
                .unwrap_or_else(|| format!("payload for {} rejected", key));
            Err(SourceError::validation(source_name, reason))
        }
        other => Ok(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use geneweave_core::CacheConfig;
    use geneweave_storage::InMemoryCacheStore;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn cache() -> TwoTierCache {
        TwoTierCache::new(Arc::new(InMemoryCacheStore::new()), CacheConfig::default())
    }

    #[tokio::test]
    async fn test_valid_payload_is_cached() {
        let cache = cache();
        let calls = AtomicUsize::new(0);
        for _ in 0..3 {
            let value = fetch_validated(&cache, "gnomad", "BRCA1", is_valid_payload, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(Some(json!({"pli": 0.1})))
            })
            .await
            .unwrap();
            assert_eq!(value, Some(json!({"pli": 0.1})));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_error_marker_is_validation_failure_and_not_cached() {
        let cache = cache();
        let result = fetch_validated(&cache, "gnomad", "TP53", is_valid_payload, || async {
            Ok(Some(json!({"error": "upstream exploded"})))
        })
        .await;
        assert!(matches!(result, Err(SourceError::Validation { .. })));
        assert_eq!(cache.get("TP53", "gnomad").await, None);
    }

    #[tokio::test]
    async fn test_missing_record_passes_through() {
        let cache = cache();
        let result = fetch_validated(&cache, "ensembl", "NOPE", is_valid_payload, || async { Ok(None) })
            .await
            .unwrap();
        assert_eq!(result, None);
    }

    #[test]
    fn test_context_clients_have_independent_breakers() {
        let ctx = SourceContext::new(Arc::new(cache()));
        let a = ctx.http_client("gnomad").unwrap();
        let b = ctx.http_client("gnomad").unwrap();
        a.breaker().record_failure();
        assert_eq!(a.breaker().failure_count(), 1);
        assert_eq!(b.breaker().failure_count(), 0);
    }
}
