//! Per-source circuit breaker.

use geneweave_core::{CircuitBreakerConfig, CircuitState, SourceError, SourceResult};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::RwLock;
use tokio::time::Instant;

/// Three-state breaker guarding one upstream.
///
/// `Closed` lets calls through and counts consecutive failures inside the
/// failure window. Reaching the threshold opens the circuit; after the
/// recovery timeout a single trial call is admitted in `HalfOpen`.
pub struct CircuitBreaker {
    name: String,
    state: AtomicU8,
    failure_count: AtomicU32,
    first_failure: RwLock<Option<Instant>>,
    opened_at: RwLock<Option<Instant>>,
    trial_in_flight: AtomicBool,
    config: CircuitBreakerConfig,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            state: AtomicU8::new(CircuitState::Closed as u8),
            failure_count: AtomicU32::new(0),
            first_failure: RwLock::new(None),
            opened_at: RwLock::new(None),
            trial_in_flight: AtomicBool::new(false),
            config,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> CircuitState {
        CircuitState::from(self.state.load(Ordering::SeqCst))
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count.load(Ordering::SeqCst)
    }

    /// Ask permission to make a call.
    pub fn try_acquire(&self) -> bool {
        self.admit() != Admission::Denied
    }

    fn admit(&self) -> Admission {
        match self.state() {
            CircuitState::Closed => Admission::Normal,
            CircuitState::Open => {
                let recovered = self
                    .opened_at
                    .read()
                    .ok()
                    .and_then(|guard| *guard)
                    .is_some_and(|opened| opened.elapsed() >= self.config.recovery_timeout);
                if !recovered {
                    return Admission::Denied;
                }
                let moved = self
                    .state
                    .compare_exchange(
                        CircuitState::Open as u8,
                        CircuitState::HalfOpen as u8,
                        Ordering::SeqCst,
                        Ordering::SeqCst,
                    )
                    .is_ok();
                if moved {
                    tracing::info!(source = %self.name, "Circuit half-open, admitting trial call");
                }
                self.claim_trial()
            }
            CircuitState::HalfOpen => self.claim_trial(),
        }
    }

    fn claim_trial(&self) -> Admission {
        let claimed = self
            .trial_in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        if claimed {
            Admission::Trial
        } else {
            Admission::Denied
        }
    }

    pub fn record_success(&self) {
        self.failure_count.store(0, Ordering::SeqCst);
        if let Ok(mut guard) = self.first_failure.write() {
            *guard = None;
        }
        if self.state() != CircuitState::Closed {
            tracing::info!(source = %self.name, "Circuit closed after successful trial");
            self.state.store(CircuitState::Closed as u8, Ordering::SeqCst);
            if let Ok(mut guard) = self.opened_at.write() {
                *guard = None;
            }
        }
        self.trial_in_flight.store(false, Ordering::SeqCst);
    }

    pub fn record_failure(&self) {
        let now = Instant::now();

        if self.state() == CircuitState::HalfOpen {
            self.open(now);
            self.trial_in_flight.store(false, Ordering::SeqCst);
            return;
        }

        let window_expired = self
            .first_failure
            .read()
            .ok()
            .and_then(|guard| *guard)
            .is_some_and(|first| now.duration_since(first) > self.config.failure_window);
        if window_expired {
            self.failure_count.store(0, Ordering::SeqCst);
        }
        if let Ok(mut guard) = self.first_failure.write() {
            if guard.is_none() || window_expired {
                *guard = Some(now);
            }
        }

        let count = self.failure_count.fetch_add(1, Ordering::SeqCst) + 1;
        if count >= self.config.failure_threshold && self.state() == CircuitState::Closed {
            tracing::warn!(
                source = %self.name,
                failures = count,
                "Circuit opened after consecutive failures"
            );
            self.open(now);
        }
    }

    /// Release a half-open trial without judging the upstream.
    pub fn record_neutral(&self) {
        self.trial_in_flight.store(false, Ordering::SeqCst);
    }

    fn open(&self, now: Instant) {
        self.state.store(CircuitState::Open as u8, Ordering::SeqCst);
        if let Ok(mut guard) = self.opened_at.write() {
            *guard = Some(now);
        }
    }

    pub fn reset(&self) {
        self.state.store(CircuitState::Closed as u8, Ordering::SeqCst);
        self.failure_count.store(0, Ordering::SeqCst);
        self.trial_in_flight.store(false, Ordering::SeqCst);
        if let Ok(mut guard) = self.first_failure.write() {
            *guard = None;
        }
        if let Ok(mut guard) = self.opened_at.write() {
            *guard = None;
        }
    }

    /// Run `f` through the breaker, recording its outcome.
    ///
    /// A missing record counts as a healthy answer. Validation failures
    /// leave the failure count untouched. A half-open trial whose future is
    /// dropped before finishing is released without a verdict.
    pub async fn call<T, F, Fut>(&self, f: F) -> SourceResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = SourceResult<T>>,
    {
        let mut trial = match self.admit() {
            Admission::Denied => {
                return Err(SourceError::CircuitOpen {
                    source_name: self.name.clone(),
                })
            }
            Admission::Normal => None,
            Admission::Trial => Some(TrialRelease {
                breaker: self,
                armed: true,
            }),
        };
        let result = f().await;
        match &result {
            Ok(_) | Err(SourceError::NotFound { .. }) => self.record_success(),
            Err(e) if e.trips_breaker() => self.record_failure(),
            Err(_) => self.record_neutral(),
        }
        if let Some(release) = trial.as_mut() {
            release.armed = false;
        }
        result
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    Denied,
    Normal,
    Trial,
}

/// Frees the half-open trial slot if the guarded call never reports back.
struct TrialRelease<'a> {
    breaker: &'a CircuitBreaker,
    armed: bool,
}

impl Drop for TrialRelease<'_> {
    fn drop(&mut self) {
        if self.armed {
            tracing::debug!(source = %self.breaker.name, "Half-open trial dropped before completing");
            self.breaker.record_neutral();
        }
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &self.state())
            .field("failure_count", &self.failure_count.load(Ordering::Relaxed))
            .finish()
    }
}
