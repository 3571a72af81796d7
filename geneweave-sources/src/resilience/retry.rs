//! Retry with exponential backoff.

use geneweave_core::{RetryConfig, SourceError, SourceResult};
use rand::Rng;
use std::future::Future;
use std::time::Duration;

/// Exponential backoff policy driven by [`RetryConfig`].
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    pub fn max_attempts(&self) -> u32 {
        self.config.max_attempts.max(1)
    }

    /// Un-jittered delay before retry number `attempt` (1-based).
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63) as i32;
        let millis = self.config.initial_delay.as_millis() as f64
            * self.config.multiplier.powi(exponent);
        let capped = millis.min(self.config.max_delay.as_millis() as f64);
        Duration::from_millis(capped.max(0.0) as u64)
    }

    /// Delay before retry number `attempt`, with jitter when enabled.
    ///
    /// Jittered delays fall in `[base / 2, base]`, so the cap still holds.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        if !self.config.jitter || base.is_zero() {
            return base;
        }
        let factor: f64 = rand::rng().random_range(0.5..=1.0);
        base.mul_f64(factor)
    }

    pub fn is_retryable_status(&self, status: u16) -> bool {
        self.config.retryable_statuses.contains(&status)
    }

    /// Run `operation` until it succeeds, fails with a non-retryable error,
    /// or the attempt budget is spent. The closure receives the 1-based
    /// attempt number.
    pub async fn run<T, F, Fut>(&self, operation: &str, mut f: F) -> SourceResult<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = SourceResult<T>>,
    {
        let max_attempts = self.max_attempts();
        let mut attempt = 1;
        loop {
            match f(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < max_attempts => {
                    let delay = self.delay_for_attempt(attempt);
                    tracing::debug!(
                        source = %e.source_name(),
                        operation,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Retrying after transient failure"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    if e.is_retryable() {
                        tracing::warn!(
                            source = %e.source_name(),
                            operation,
                            attempts = attempt,
                            error = %e,
                            "Retry budget exhausted"
                        );
                    }
                    return Err(e);
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(RetryConfig {
            max_attempts,
            initial_delay: Duration::from_millis(100),
            multiplier: 2.0,
            max_delay: Duration::from_millis(1_000),
            jitter: false,
            ..RetryConfig::default()
        })
    }

    #[test]
    fn test_delays_grow_and_cap() {
        let p = policy(5);
        assert_eq!(p.base_delay(1), Duration::from_millis(100));
        assert_eq!(p.base_delay(2), Duration::from_millis(200));
        assert_eq!(p.base_delay(3), Duration::from_millis(400));
        assert_eq!(p.base_delay(5), Duration::from_millis(1_000));
        assert_eq!(p.base_delay(40), Duration::from_millis(1_000));
    }

    #[test]
    fn test_retryable_statuses() {
        let p = RetryPolicy::default();
        for status in [429, 500, 502, 503, 504] {
            assert!(p.is_retryable_status(status));
        }
        assert!(!p.is_retryable_status(400));
        assert!(!p.is_retryable_status(404));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_errors_are_retried() {
        let p = policy(3);
        let calls = AtomicU32::new(0);
        let result = p
            .run("fetch", |_| async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(SourceError::transient("gnomad", Some(503), "unavailable"))
                } else {
                    Ok(7)
                }
            })
            .await;
        assert_eq!(result, Ok(7));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_errors_propagate_immediately() {
        let p = policy(5);
        let calls = AtomicU32::new(0);
        let result: SourceResult<()> = p
            .run("fetch", |_| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(SourceError::permanent("gnomad", Some(400), "bad query"))
            })
            .await;
        assert!(matches!(result, Err(SourceError::Permanent { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_budget_is_bounded() {
        let p = policy(4);
        let calls = AtomicU32::new(0);
        let started = tokio::time::Instant::now();
        let result: SourceResult<()> = p
            .run("fetch", |_| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(SourceError::transient("hgnc", Some(429), "slow down"))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        // 100 + 200 + 400 ms of backoff
        assert!(started.elapsed() >= Duration::from_millis(700));
    }

    proptest! {
        #[test]
        fn prop_jittered_delay_within_bounds(
            attempt in 1u32..20,
            initial_ms in 1u64..2_000,
            extra_ms in 0u64..60_000,
        ) {
            let p = RetryPolicy::new(RetryConfig {
                initial_delay: Duration::from_millis(initial_ms),
                max_delay: Duration::from_millis(initial_ms + extra_ms),
                jitter: true,
                ..RetryConfig::default()
            });
            let base = p.base_delay(attempt);
            let delay = p.delay_for_attempt(attempt);
            prop_assert!(delay <= base);
            prop_assert!(delay >= base / 2);
            prop_assert!(base <= Duration::from_millis(initial_ms + extra_ms));
        }
    }
}
