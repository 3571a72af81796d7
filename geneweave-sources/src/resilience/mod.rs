//! Resilience primitives wrapped around every outbound call.

pub mod circuit_breaker;
pub mod rate_limiter;
pub mod retry;

pub use circuit_breaker::CircuitBreaker;
pub use rate_limiter::SourceRateLimiter;
pub use retry::RetryPolicy;
