//! Payload validity predicate shared by adapters and the validation report.

use serde_json::Value as JsonValue;

/// Keys whose presence at the top level marks a payload as an embedded
/// upstream error rather than data.
pub const ERROR_MARKER_KEYS: &[&str] = &["error", "errors", "error_message"];

/// Why a payload is not a usable annotation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadIssue {
    Empty,
    ErrorMarker,
}

/// Inspect a payload. `None` means the payload is valid.
pub fn payload_issue(payload: &JsonValue) -> Option<PayloadIssue> {
    match payload {
        JsonValue::Null => Some(PayloadIssue::Empty),
        JsonValue::Object(map) if map.is_empty() => Some(PayloadIssue::Empty),
        JsonValue::Array(items) if items.is_empty() => Some(PayloadIssue::Empty),
        JsonValue::String(s) if s.trim().is_empty() => Some(PayloadIssue::Empty),
        JsonValue::Object(map) => {
            let has_marker = ERROR_MARKER_KEYS
                .iter()
                .any(|key| map.get(*key).is_some_and(|v| !v.is_null()));
            has_marker.then_some(PayloadIssue::ErrorMarker)
        }
        _ => None,
    }
}

/// Default validity predicate: non-empty and free of error markers.
pub fn is_valid_payload(payload: &JsonValue) -> bool {
    payload_issue(payload).is_none()
}
