//! Resilient JSON HTTP client shared by the API-backed sources.

use crate::resilience::{CircuitBreaker, RetryPolicy, SourceRateLimiter};
use geneweave_core::{SourceError, SourceHttpConfig, SourceResult};
use reqwest::{Client, RequestBuilder};
use serde_json::Value as JsonValue;
use std::sync::Arc;
use std::time::Duration;

/// HTTP client for one source.
///
/// Every request waits on the source's rate limiter, passes through its
/// circuit breaker, and is retried by its retry policy. A 404 is a healthy
/// "no record" answer and comes back as `Ok(None)`.
#[derive(Clone)]
pub struct SourceHttpClient {
    source_name: String,
    client: Client,
    limiter: SourceRateLimiter,
    breaker: Arc<CircuitBreaker>,
    retry: RetryPolicy,
    timeout: Duration,
}

impl SourceHttpClient {
    pub fn new(
        source_name: impl Into<String>,
        config: &SourceHttpConfig,
        retry: RetryPolicy,
        breaker: Arc<CircuitBreaker>,
    ) -> SourceResult<Self> {
        let source_name = source_name.into();
        let client = Client::builder()
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| SourceError::permanent(&source_name, None, format!("HTTP client setup failed: {}", e)))?;
        Ok(Self {
            limiter: SourceRateLimiter::new(config.requests_per_second),
            source_name,
            client,
            breaker,
            retry,
            timeout: config.timeout,
        })
    }

    pub fn source_name(&self) -> &str {
        &self.source_name
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn limiter(&self) -> &SourceRateLimiter {
        &self.limiter
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn retry(&self) -> &RetryPolicy {
        &self.retry
    }

    pub async fn get_json(&self, url: &str, query: &[(&str, &str)]) -> SourceResult<Option<JsonValue>> {
        self.execute("GET", |client| client.get(url).query(query)).await
    }

    pub async fn post_json(&self, url: &str, body: &JsonValue) -> SourceResult<Option<JsonValue>> {
        self.execute("POST", |client| client.post(url).json(body)).await
    }

    async fn execute<F>(&self, operation: &str, make_request: F) -> SourceResult<Option<JsonValue>>
    where
        F: Fn(&Client) -> RequestBuilder + Send + Sync,
    {
        self.retry
            .run(operation, |_attempt| {
                let request = make_request(&self.client)
                    .header("Accept", "application/json")
                    .timeout(self.timeout);
                async move {
                    self.breaker
                        .call(|| async move {
                            self.limiter.wait().await;
                            self.send_once(operation, request).await
                        })
                        .await
                }
            })
            .await
    }

    async fn send_once(&self, operation: &str, request: RequestBuilder) -> SourceResult<Option<JsonValue>> {
        let response = request
            .send()
            .await
            .map_err(|e| classify_transport(&self.source_name, operation, e.is_timeout(), self.timeout, e))?;

        let status = response.status().as_u16();
        if status == 404 {
            return Ok(None);
        }
        if !response.status().is_success() {
            let retry_after = parse_retry_after(response.headers());
            let body = response.text().await.unwrap_or_default();
            let error = classify_status(&self.source_name, status, &body, self.retry.config().retryable_statuses.as_slice());
            if let (Some(wait), SourceError::Transient { .. }) = (retry_after, &error) {
                let wait = wait.min(self.retry.config().max_delay);
                tracing::debug!(
                    source = %self.source_name,
                    wait_ms = wait.as_millis() as u64,
                    "Honoring Retry-After"
                );
                tokio::time::sleep(wait).await;
            }
            return Err(error);
        }

        let body = response
            .text()
            .await
            .map_err(|e| classify_transport(&self.source_name, operation, e.is_timeout(), self.timeout, e))?;
        parse_body(&self.source_name, status, &body)
    }
}

impl std::fmt::Debug for SourceHttpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceHttpClient")
            .field("source_name", &self.source_name)
            .field("limiter", &self.limiter)
            .field("breaker", &self.breaker)
            .field("timeout", &self.timeout)
            .finish()
    }
}

// ============================================================================
// CLASSIFICATION
// ============================================================================

/// Map a non-success HTTP status onto the source error taxonomy.
pub fn classify_status(source_name: &str, status: u16, body: &str, retryable: &[u16]) -> SourceError {
    let message = summarize_body(body);
    if retryable.contains(&status) {
        SourceError::transient(source_name, Some(status), message)
    } else {
        SourceError::permanent(source_name, Some(status), message)
    }
}

fn classify_transport(
    source_name: &str,
    operation: &str,
    is_timeout: bool,
    budget: Duration,
    error: reqwest::Error,
) -> SourceError {
    if is_timeout {
        SourceError::Timeout {
            source_name: source_name.to_string(),
            operation: operation.to_string(),
            budget,
        }
    } else {
        SourceError::transient(source_name, None, format!("HTTP request failed: {}", error))
    }
}

fn parse_body(source_name: &str, status: u16, body: &str) -> SourceResult<Option<JsonValue>> {
    if body.trim().is_empty() {
        return Ok(None);
    }
    serde_json::from_str(body)
        .map(Some)
        .map_err(|e| SourceError::permanent(source_name, Some(status), format!("Malformed JSON response: {}", e)))
}

fn summarize_body(body: &str) -> String {
    const MAX: usize = 200;
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return "empty response body".to_string();
    }
    match trimmed.char_indices().nth(MAX) {
        Some((cut, _)) => format!("{}...", &trimmed[..cut]),
        None => trimmed.to_string(),
    }
}

fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get("retry-after")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<f64>().ok())
        .filter(|seconds| seconds.is_finite() && *seconds >= 0.0)
        .map(Duration::from_secs_f64)
}
