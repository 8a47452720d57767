// SPDX-License-Identifier: MIT OR Apache-2.0
//! Shallow validation of structured-task output.
//!
//! The task endpoint's `schema` field is opaque structured data carried
//! end-to-end; validation is deliberately shallow; type, required keys,
//! array element type, and object membership. Full JSON-Schema semantics are
//! out of scope.

use serde_json::Value;

/// Validate `value` against `schema`, shallowly. Returns the list of
/// violations; empty means valid.
#[must_use]
pub fn validate_shallow(value: &Value, schema: &Value) -> Vec<String> {
    let mut errors = Vec::new();

    if let Some(expected) = schema.get("type").and_then(Value::as_str)
        && !type_matches(value, expected)
    {
        errors.push(format!(
            "expected type '{expected}', got '{}'",
            type_name(value)
        ));
        // A wrong top-level type makes the remaining checks meaningless.
        return errors;
    }

    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        for key in required.iter().filter_map(Value::as_str) {
            if value.get(key).is_none() {
                errors.push(format!("missing required key '{key}'"));
            }
        }
    }

    if let (Some(properties), Some(object)) = (
        schema.get("properties").and_then(Value::as_object),
        value.as_object(),
    ) {
        let closed = schema
            .get("additionalProperties")
            .and_then(Value::as_bool)
            == Some(false);
        if closed {
            for key in object.keys() {
                if !properties.contains_key(key) {
                    errors.push(format!("unexpected key '{key}'"));
                }
            }
        }
        for (key, prop_schema) in properties {
            if let (Some(prop_value), Some(expected)) = (
                value.get(key),
                prop_schema.get("type").and_then(Value::as_str),
            ) && !type_matches(prop_value, expected)
            {
                errors.push(format!(
                    "key '{key}' expected type '{expected}', got '{}'",
                    type_name(prop_value)
                ));
            }
        }
    }

    if let (Some(items), Some(array)) = (schema.get("items"), value.as_array())
        && let Some(expected) = items.get("type").and_then(Value::as_str)
    {
        for (index, item) in array.iter().enumerate() {
            if !type_matches(item, expected) {
                errors.push(format!(
                    "item {index} expected type '{expected}', got '{}'",
                    type_name(item)
                ));
            }
        }
    }

    errors
}

fn type_matches(value: &Value, expected: &str) -> bool {
    match expected {
        "object" => value.is_object(),
        "array" => value.is_array(),
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        "boolean" => value.is_boolean(),
        "null" => value.is_null(),
        _ => true,
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn empty_schema_accepts_anything() {
        assert!(validate_shallow(&json!({"a": 1}), &json!({})).is_empty());
        assert!(validate_shallow(&json!("text"), &json!({})).is_empty());
    }

    #[test]
    fn type_mismatch_short_circuits() {
        let errors = validate_shallow(&json!("text"), &json!({"type": "object", "required": ["a"]}));
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("expected type 'object'"));
    }

    #[test]
    fn required_keys_checked() {
        let schema = json!({"type": "object", "required": ["category", "urgency"]});
        let errors = validate_shallow(&json!({"category": "bug"}), &schema);
        assert_eq!(errors, vec!["missing required key 'urgency'"]);
    }

    #[test]
    fn closed_objects_reject_extras() {
        let schema = json!({
            "type": "object",
            "properties": {"a": {"type": "string"}},
            "additionalProperties": false,
        });
        let errors = validate_shallow(&json!({"a": "x", "b": 1}), &schema);
        assert_eq!(errors, vec!["unexpected key 'b'"]);
    }

    #[test]
    fn property_types_are_shallow_checked() {
        let schema = json!({
            "type": "object",
            "properties": {"count": {"type": "integer"}},
        });
        let errors = validate_shallow(&json!({"count": "three"}), &schema);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("'count'"));
    }

    #[test]
    fn array_element_types_checked() {
        let schema = json!({"type": "array", "items": {"type": "number"}});
        let errors = validate_shallow(&json!([1, "two", 3]), &schema);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("item 1"));
    }

    #[test]
    fn nested_shapes_are_not_descended() {
        // Shallow by contract: nested object schemas are not evaluated.
        let schema = json!({
            "type": "object",
            "properties": {"inner": {"type": "object", "required": ["deep"]}},
        });
        let errors = validate_shallow(&json!({"inner": {}}), &schema);
        assert!(errors.is_empty());
    }
}
