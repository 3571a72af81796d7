//! Enum types shared across the engine.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// ============================================================================
// UPDATE STRATEGY
// ============================================================================

/// Strategy used to select genes (and, for `Selective`, sources) for a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateStrategy {
    /// All genes, sources that are due.
    Full,
    /// Genes missing annotations from at least one active source, most
    /// clinically important first.
    Incremental,
    /// All genes, every selected source regardless of its schedule.
    Forced,
    /// All genes, restricted to caller-specified sources.
    Selective,
}

impl UpdateStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Incremental => "incremental",
            Self::Forced => "forced",
            Self::Selective => "selective",
        }
    }

    /// Whether this strategy ignores per-source schedules.
    pub fn ignores_schedule(&self) -> bool {
        matches!(self, Self::Forced)
    }
}

impl fmt::Display for UpdateStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error parsing UpdateStrategy from string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateStrategyParseError(pub String);

impl fmt::Display for UpdateStrategyParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid update strategy: {}", self.0)
    }
}

impl std::error::Error for UpdateStrategyParseError {}

impl FromStr for UpdateStrategy {
    type Err = UpdateStrategyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "full" => Ok(Self::Full),
            "incremental" => Ok(Self::Incremental),
            "forced" => Ok(Self::Forced),
            "selective" => Ok(Self::Selective),
            _ => Err(UpdateStrategyParseError(s.to_string())),
        }
    }
}

// ============================================================================
// CIRCUIT STATE
// ============================================================================

/// Circuit breaker state for an upstream source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum CircuitState {
    /// Circuit is closed, requests flow normally
    Closed = 0,
    /// Circuit is open, requests are rejected
    Open = 1,
    /// Circuit is half-open, one trial request is allowed
    HalfOpen = 2,
}

impl From<u8> for CircuitState {
    fn from(v: u8) -> Self {
        match v {
            0 => CircuitState::Closed,
            1 => CircuitState::Open,
            _ => CircuitState::HalfOpen,
        }
    }
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

// ============================================================================
// RUN STATUS
// ============================================================================

/// Overall outcome of an orchestrator run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Every selected source succeeded (or nothing was due).
    Completed,
    /// At least one source succeeded and at least one failed.
    CompletedWithErrors,
    /// Sources were attempted and none succeeded.
    Failed,
}
