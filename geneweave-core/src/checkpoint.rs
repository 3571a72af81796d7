//! Structured checkpoint snapshot for resumable orchestrator runs.

use crate::{CheckpointError, GeneId, Timestamp, UpdateStrategy};
use chrono::{Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Current checkpoint schema version. Bump on any field change.
pub const CHECKPOINT_SCHEMA_VERSION: u32 = 2;

/// Persisted state allowing an interrupted multi-source run to resume.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineCheckpoint {
    pub schema_version: u32,
    pub pipeline_id: String,
    pub strategy: UpdateStrategy,
    pub sources_remaining: Vec<String>,
    pub sources_completed: Vec<String>,
    pub gene_ids: Vec<GeneId>,
    pub timestamp: Timestamp,
}

impl PipelineCheckpoint {
    pub fn new(
        pipeline_id: impl Into<String>,
        strategy: UpdateStrategy,
        sources_remaining: Vec<String>,
        sources_completed: Vec<String>,
        gene_ids: Vec<GeneId>,
    ) -> Self {
        Self {
            schema_version: CHECKPOINT_SCHEMA_VERSION,
            pipeline_id: pipeline_id.into(),
            strategy,
            sources_remaining,
            sources_completed,
            gene_ids,
            timestamp: Utc::now(),
        }
    }

    /// Move `source` from remaining to completed and advance the timestamp.
    pub fn mark_completed(&mut self, source: &str) {
        self.sources_remaining.retain(|s| s != source);
        if !self.sources_completed.iter().any(|s| s == source) {
            self.sources_completed.push(source.to_string());
        }
        self.advance();
    }

    /// Advance the timestamp, strictly later than the previous value even
    /// when the wall clock has not moved.
    pub fn advance(&mut self) {
        let now = Utc::now();
        self.timestamp = if now > self.timestamp {
            now
        } else {
            self.timestamp + ChronoDuration::microseconds(1)
        };
    }

    pub fn is_finished(&self) -> bool {
        self.sources_remaining.is_empty()
    }

    pub fn to_json(&self) -> Result<JsonValue, CheckpointError> {
        serde_json::to_value(self).map_err(|e| CheckpointError::Malformed {
            reason: e.to_string(),
        })
    }

    /// Decode a persisted snapshot, refusing any schema version other than
    /// the current one.
    pub fn from_json(value: &JsonValue) -> Result<Self, CheckpointError> {
        let found = value
            .get("schema_version")
            .and_then(JsonValue::as_u64)
            .ok_or_else(|| CheckpointError::Malformed {
                reason: "missing schema_version".to_string(),
            })?;

        if found != u64::from(CHECKPOINT_SCHEMA_VERSION) {
            return Err(CheckpointError::UnsupportedVersion {
                found: u32::try_from(found).unwrap_or(u32::MAX),
                expected: CHECKPOINT_SCHEMA_VERSION,
            });
        }

        serde_json::from_value(value.clone()).map_err(|e| CheckpointError::Malformed {
            reason: e.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn checkpoint() -> PipelineCheckpoint {
        PipelineCheckpoint::new(
            "default",
            UpdateStrategy::Full,
            vec!["gnomad".to_string(), "clinvar".to_string()],
            vec!["hgnc".to_string()],
            vec![1, 2, 3],
        )
    }

    #[test]
    fn test_json_round_trip() {
        let cp = checkpoint();
        let decoded = PipelineCheckpoint::from_json(&cp.to_json().unwrap()).unwrap();
        assert_eq!(decoded, cp);
    }

    #[test]
    fn test_unknown_version_fails_loudly() {
        let mut value = checkpoint().to_json().unwrap();
        value["schema_version"] = json!(1);
        let err = PipelineCheckpoint::from_json(&value).unwrap_err();
        assert_eq!(
            err,
            CheckpointError::UnsupportedVersion {
                found: 1,
                expected: CHECKPOINT_SCHEMA_VERSION
            }
        );
    }

    #[test]
    fn test_missing_version_is_malformed() {
        let err = PipelineCheckpoint::from_json(&json!({"sources_remaining": []})).unwrap_err();
        assert!(matches!(err, CheckpointError::Malformed { .. }));
    }

    #[test]
    fn test_mark_completed_moves_source_and_advances() {
        let mut cp = checkpoint();
        let before = cp.timestamp;
        cp.mark_completed("gnomad");
        assert_eq!(cp.sources_remaining, vec!["clinvar".to_string()]);
        assert_eq!(cp.sources_completed, vec!["hgnc".to_string(), "gnomad".to_string()]);
        assert!(cp.timestamp > before);

        cp.mark_completed("clinvar");
        cp.mark_completed("clinvar");
        assert!(cp.is_finished());
        assert_eq!(cp.sources_completed.len(), 3);
    }
}
