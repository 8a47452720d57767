// SPDX-License-Identifier: MIT OR Apache-2.0
//! Tool invocation request and result shapes.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// A tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Correlation id assigned by the model.
    pub id: String,
    /// Tool name.
    pub name: String,
    /// Structured argument map.
    pub arguments: BTreeMap<String, Value>,
}

/// Outcome of executing (or refusing) one tool call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    /// Correlation id matching the originating [`ToolCall`].
    pub id: String,
    /// Whether the call succeeded end to end.
    pub success: bool,
    /// Decoded result body on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Error description on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Wall-clock duration of the call in milliseconds.
    pub duration_ms: u64,
}

impl ToolResult {
    /// A successful result.
    #[must_use]
    pub fn ok(id: impl Into<String>, result: Value, duration_ms: u64) -> Self {
        Self {
            id: id.into(),
            success: true,
            result: Some(result),
            error: None,
            duration_ms,
        }
    }

    /// A failed result.
    #[must_use]
    pub fn err(id: impl Into<String>, error: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            id: id.into(),
            success: false,
            result: None,
            error: Some(error.into()),
            duration_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn ok_result_shape() {
        let r = ToolResult::ok("c1", json!({"rows": 3}), 42);
        assert!(r.success);
        assert_eq!(r.result.unwrap()["rows"], 3);
        assert!(r.error.is_none());
    }

    #[test]
    fn err_result_shape() {
        let r = ToolResult::err("c1", "boom", 10);
        assert!(!r.success);
        assert_eq!(r.error.as_deref(), Some("boom"));
        assert!(r.result.is_none());
    }

    #[test]
    fn tool_call_serde_roundtrip() {
        let call = ToolCall {
            id: "c9".into(),
            name: "search".into(),
            arguments: BTreeMap::from([("q".to_string(), json!("rust"))]),
        };
        let json = serde_json::to_string(&call).unwrap();
        let back: ToolCall = serde_json::from_str(&json).unwrap();
        assert_eq!(back, call);
    }
}
