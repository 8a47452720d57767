// SPDX-License-Identifier: MIT OR Apache-2.0
//! Tool-call extraction from raw model messages.
//!
//! Two encodings appear in the wild and both are accepted:
//!
//! - **function-call style**: `tool_calls: [{id, function: {name,
//!   arguments: "<json string>"}}]`;
//! - **content-block style**: `content: [{type: "tool_use", id, name,
//!   input: {…}}]`.
//!
//! Entries whose argument payload is not decodable are silently dropped -
//! a malformed call must not fail the turn.

use helm_core::ToolCall;
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::debug;

/// Extract every tool call from a raw assistant message, regardless of
/// encoding. Returns an empty list for plain text turns.
#[must_use]
pub fn parse_tool_calls(raw_message: &Value) -> Vec<ToolCall> {
    let mut calls = Vec::new();

    // Function-call style.
    if let Some(entries) = raw_message.get("tool_calls").and_then(Value::as_array) {
        for entry in entries {
            let Some(id) = entry.get("id").and_then(Value::as_str) else {
                continue;
            };
            let Some(function) = entry.get("function") else {
                continue;
            };
            let Some(name) = function.get("name").and_then(Value::as_str) else {
                continue;
            };
            let Some(arguments) = decode_arguments(function.get("arguments")) else {
                debug!(call = id, tool = name, "dropping tool call with undecodable arguments");
                continue;
            };
            calls.push(ToolCall {
                id: id.to_string(),
                name: name.to_string(),
                arguments,
            });
        }
    }

    // Content-block style.
    if let Some(blocks) = raw_message.get("content").and_then(Value::as_array) {
        for block in blocks {
            if block.get("type").and_then(Value::as_str) != Some("tool_use") {
                continue;
            }
            let (Some(id), Some(name)) = (
                block.get("id").and_then(Value::as_str),
                block.get("name").and_then(Value::as_str),
            ) else {
                continue;
            };
            let Some(arguments) = decode_arguments(block.get("input")) else {
                debug!(call = id, tool = name, "dropping tool_use block with undecodable input");
                continue;
            };
            calls.push(ToolCall {
                id: id.to_string(),
                name: name.to_string(),
                arguments,
            });
        }
    }

    calls
}

/// Decode an argument payload that may be an object or a JSON-encoded
/// string. `None` and non-object payloads are undecodable.
fn decode_arguments(raw: Option<&Value>) -> Option<BTreeMap<String, Value>> {
    let raw = raw?;
    let object = match raw {
        Value::Object(map) => map.clone(),
        Value::String(encoded) => match serde_json::from_str::<Value>(encoded) {
            Ok(Value::Object(map)) => map,
            _ => return None,
        },
        _ => return None,
    };
    Some(object.into_iter().collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn function_call_style_with_string_arguments() {
        let message = json!({
            "role": "assistant",
            "content": null,
            "tool_calls": [{
                "id": "call_1",
                "type": "function",
                "function": {"name": "search", "arguments": "{\"q\": \"rust\", \"limit\": 5}"},
            }],
        });
        let calls = parse_tool_calls(&message);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].id, "call_1");
        assert_eq!(calls[0].name, "search");
        assert_eq!(calls[0].arguments["q"], "rust");
        assert_eq!(calls[0].arguments["limit"], 5);
    }

    #[test]
    fn function_call_style_with_object_arguments() {
        let message = json!({
            "tool_calls": [{
                "id": "call_2",
                "function": {"name": "fetch", "arguments": {"url": "https://example.com"}},
            }],
        });
        let calls = parse_tool_calls(&message);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].arguments["url"], "https://example.com");
    }

    #[test]
    fn content_block_style() {
        let message = json!({
            "role": "assistant",
            "content": [
                {"type": "text", "text": "let me check"},
                {"type": "tool_use", "id": "tu_1", "name": "search", "input": {"q": "rust"}},
            ],
        });
        let calls = parse_tool_calls(&message);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].id, "tu_1");
        assert_eq!(calls[0].arguments["q"], "rust");
    }

    #[test]
    fn undecodable_arguments_are_dropped_silently() {
        let message = json!({
            "tool_calls": [
                {"id": "bad_1", "function": {"name": "a", "arguments": "not json"}},
                {"id": "bad_2", "function": {"name": "b", "arguments": "[1, 2]"}},
                {"id": "ok_1", "function": {"name": "c", "arguments": "{}"}},
            ],
        });
        let calls = parse_tool_calls(&message);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].id, "ok_1");
    }

    #[test]
    fn plain_text_message_has_no_calls() {
        let message = json!({"role": "assistant", "content": "just words"});
        assert!(parse_tool_calls(&message).is_empty());
    }

    #[test]
    fn both_encodings_in_one_message_are_merged() {
        let message = json!({
            "tool_calls": [{"id": "f1", "function": {"name": "a", "arguments": "{}"}}],
            "content": [{"type": "tool_use", "id": "b1", "name": "b", "input": {}}],
        });
        let calls = parse_tool_calls(&message);
        assert_eq!(calls.len(), 2);
    }
}
