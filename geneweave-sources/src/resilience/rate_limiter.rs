//! Per-source token-bucket rate limiter.

use governor::{clock::DefaultClock, Quota, RateLimiter};
use std::sync::Arc;
use std::time::Duration;

type DirectRateLimiter =
    RateLimiter<governor::state::NotKeyed, governor::state::InMemoryState, DefaultClock>;

/// Requests-per-second limiter shared by every call an adapter makes.
///
/// Burst size is one, so calls are spaced evenly at `1 / rps`. A
/// non-positive rate disables limiting.
#[derive(Clone)]
pub struct SourceRateLimiter {
    requests_per_second: f64,
    limiter: Option<Arc<DirectRateLimiter>>,
}

impl SourceRateLimiter {
    pub fn new(requests_per_second: f64) -> Self {
        let limiter = if requests_per_second.is_finite() && requests_per_second > 0.0 {
            Quota::with_period(Duration::from_secs_f64(1.0 / requests_per_second))
                .map(|quota| Arc::new(RateLimiter::direct(quota)))
        } else {
            None
        };
        Self {
            requests_per_second,
            limiter,
        }
    }

    pub fn unlimited() -> Self {
        Self::new(0.0)
    }

    pub fn requests_per_second(&self) -> f64 {
        self.requests_per_second
    }

    /// Wait until a token is available.
    pub async fn wait(&self) {
        if let Some(limiter) = &self.limiter {
            limiter.until_ready().await;
        }
    }

    /// Take a token if one is available right now.
    pub fn try_acquire(&self) -> bool {
        match &self.limiter {
            Some(limiter) => limiter.check().is_ok(),
            None => true,
        }
    }
}

impl std::fmt::Debug for SourceRateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceRateLimiter")
            .field("requests_per_second", &self.requests_per_second)
            .field("limited", &self.limiter.is_some())
            .finish()
    }
}
