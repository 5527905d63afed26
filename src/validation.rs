//! Validate invocation arguments against a tool's input schema before dispatch.
//!
//! Structural subset of JSON Schema: `type`, `required`, `properties`,
//! `additionalProperties`, `items`, `enum`, `const`, numeric bounds, string
//! length and array length. Unknown keywords are ignored.

use serde_json::{Map, Value};

use crate::error::{Result, ToolHostError};

/// Validate `args` against `schema`. `null` arguments count as `{}`.
///
/// Returns the first violation as [`ToolHostError::Validation`], with a path
/// like `$.filters[2].field`.
pub fn validate_arguments(args: &Value, schema: &Value) -> Result<()> {
    let empty = Value::Object(Map::new());
    let args = if args.is_null() { &empty } else { args };
    validate_at(args, schema, "$")
        .map_err(|(path, reason)| ToolHostError::Validation { path, reason })
}

type Violation = (String, String);

fn fail(path: &str, reason: impl Into<String>) -> std::result::Result<(), Violation> {
    Err((path.to_string(), reason.into()))
}

fn validate_at(value: &Value, schema: &Value, path: &str) -> std::result::Result<(), Violation> {
    let schema = match schema {
        Value::Bool(true) => return Ok(()),
        Value::Bool(false) => return fail(path, "no value is allowed here"),
        Value::Object(schema) => schema,
        _ => return Ok(()),
    };

    if let Some(expected) = schema.get("type") {
        check_type(value, expected, path)?;
    }

    if let Some(allowed) = schema.get("enum").and_then(Value::as_array) {
        if !allowed.iter().any(|candidate| candidate == value) {
            let allowed = Value::Array(allowed.clone());
            return fail(path, format!("value {value} is not one of {allowed}"));
        }
    }

    if let Some(expected) = schema.get("const") {
        if expected != value {
            return fail(path, format!("expected constant {expected}, got {value}"));
        }
    }

    match value {
        Value::Object(obj) => validate_object(obj, schema, path),
        Value::Array(items) => validate_array(items, schema, path),
        Value::String(s) => validate_string(s, schema, path),
        Value::Number(_) => validate_number(value, schema, path),
        _ => Ok(()),
    }
}

fn check_type(value: &Value, expected: &Value, path: &str) -> std::result::Result<(), Violation> {
    let matches = match expected {
        Value::String(name) => value_matches_type(value, name),
        Value::Array(names) => names
            .iter()
            .filter_map(Value::as_str)
            .any(|name| value_matches_type(value, name)),
        _ => true,
    };
    if matches {
        return Ok(());
    }
    let expected = match expected {
        Value::String(name) => name.clone(),
        other => other.to_string(),
    };
    fail(path, format!("expected {expected}, got {}", json_type_name(value)))
}

fn validate_object(
    obj: &Map<String, Value>,
    schema: &Map<String, Value>,
    path: &str,
) -> std::result::Result<(), Violation> {
    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        for name in required.iter().filter_map(Value::as_str) {
            if !obj.contains_key(name) {
                return fail(path, format!("missing required field '{name}'"));
            }
        }
    }

    let properties = schema.get("properties").and_then(Value::as_object);
    let additional = schema.get("additionalProperties");

    for (key, child) in obj {
        let child_path = format!("{path}.{key}");
        match properties.and_then(|props| props.get(key)) {
            Some(child_schema) => validate_at(child, child_schema, &child_path)?,
            None => match additional {
                Some(Value::Bool(false)) => {
                    return fail(&child_path, "unexpected field");
                }
                Some(extra @ Value::Object(_)) => validate_at(child, extra, &child_path)?,
                _ => {}
            },
        }
    }
    Ok(())
}

fn validate_array(
    items: &[Value],
    schema: &Map<String, Value>,
    path: &str,
) -> std::result::Result<(), Violation> {
    if let Some(min) = schema.get("minItems").and_then(Value::as_u64) {
        if (items.len() as u64) < min {
            return fail(path, format!("expected at least {min} items, got {}", items.len()));
        }
    }
    if let Some(max) = schema.get("maxItems").and_then(Value::as_u64) {
        if items.len() as u64 > max {
            return fail(path, format!("expected at most {max} items, got {}", items.len()));
        }
    }
    if let Some(item_schema) = schema.get("items") {
        for (index, item) in items.iter().enumerate() {
            validate_at(item, item_schema, &format!("{path}[{index}]"))?;
        }
    }
    Ok(())
}

fn validate_string(
    s: &str,
    schema: &Map<String, Value>,
    path: &str,
) -> std::result::Result<(), Violation> {
    let len = s.chars().count() as u64;
    if let Some(min) = schema.get("minLength").and_then(Value::as_u64) {
        if len < min {
            return fail(path, format!("expected at least {min} characters, got {len}"));
        }
    }
    if let Some(max) = schema.get("maxLength").and_then(Value::as_u64) {
        if len > max {
            return fail(path, format!("expected at most {max} characters, got {len}"));
        }
    }
    Ok(())
}

fn validate_number(
    value: &Value,
    schema: &Map<String, Value>,
    path: &str,
) -> std::result::Result<(), Violation> {
    let Some(n) = value.as_f64() else {
        return Ok(());
    };
    let bound = |key: &str| schema.get(key).and_then(Value::as_f64);

    if let Some(min) = bound("minimum") {
        if n < min {
            return fail(path, format!("{value} is less than minimum {min}"));
        }
    }
    if let Some(max) = bound("maximum") {
        if n > max {
            return fail(path, format!("{value} is greater than maximum {max}"));
        }
    }
    if let Some(min) = bound("exclusiveMinimum") {
        if n <= min {
            return fail(path, format!("{value} must be greater than {min}"));
        }
    }
    if let Some(max) = bound("exclusiveMaximum") {
        if n >= max {
            return fail(path, format!("{value} must be less than {max}"));
        }
    }
    Ok(())
}

fn value_matches_type(value: &Value, expected: &str) -> bool {
    match expected {
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => {
            value.is_i64()
                || value.is_u64()
                || value.as_f64().is_some_and(|f| f.is_finite() && f.fract() == 0.0)
        }
        "boolean" => value.is_boolean(),
        "object" => value.is_object(),
        "array" => value.is_array(),
        "null" => value.is_null(),
        _ => true,
    }
}

fn json_type_name(value: &Value) -> &'static str {
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

    fn violation(args: Value, schema: Value) -> (String, String) {
        match validate_arguments(&args, &schema) {
            Err(ToolHostError::Validation { path, reason }) => (path, reason),
            Err(other) => panic!("expected Validation, got error: {other}"),
            Ok(()) => panic!("expected Validation, got Ok"),
        }
    }

    fn search_schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": { "type": "string", "minLength": 1 },
                "limit": { "type": "integer", "minimum": 1, "maximum": 50 }
            },
            "required": ["query"]
        })
    }

    #[test]
    fn accepts_valid_arguments() {
        let args = json!({ "query": "rust", "limit": 10 });
        assert!(validate_arguments(&args, &search_schema()).is_ok());
    }

    #[test]
    fn rejects_missing_required_field_at_root() {
        let (path, reason) = violation(json!({ "limit": 3 }), search_schema());
        assert_eq!(path, "$");
        assert!(reason.contains("missing required field 'query'"));
    }

    #[test]
    fn null_arguments_count_as_empty_object() {
        let (_, reason) = violation(Value::Null, search_schema());
        assert!(reason.contains("query"));
        assert!(validate_arguments(&Value::Null, &json!({ "type": "object" })).is_ok());
    }

    #[test]
    fn rejects_wrong_property_type_with_path() {
        let (path, reason) = violation(json!({ "query": 42 }), search_schema());
        assert_eq!(path, "$.query");
        assert_eq!(reason, "expected string, got number");
    }

    #[test]
    fn rejects_non_object_arguments() {
        let (path, reason) = violation(json!("just text"), search_schema());
        assert_eq!(path, "$");
        assert!(reason.contains("expected object"));
    }

    #[test]
    fn enforces_numeric_bounds() {
        let (path, reason) = violation(json!({ "query": "q", "limit": 51 }), search_schema());
        assert_eq!(path, "$.limit");
        assert!(reason.contains("maximum"));

        let schema = json!({ "type": "number", "exclusiveMinimum": 0 });
        assert!(validate_arguments(&json!(0.5), &schema).is_ok());
        assert!(validate_arguments(&json!(0), &schema).is_err());
    }

    #[test]
    fn integer_accepts_whole_floats_only() {
        let schema = json!({ "type": "integer" });
        assert!(validate_arguments(&json!(3.0), &schema).is_ok());
        assert!(validate_arguments(&json!(3.5), &schema).is_err());
    }

    #[test]
    fn validates_nested_array_items() {
        let schema = json!({
            "type": "object",
            "properties": {
                "filters": {
                    "type": "array",
                    "maxItems": 3,
                    "items": {
                        "type": "object",
                        "properties": { "field": { "enum": ["title", "body"] } },
                        "required": ["field"]
                    }
                }
            }
        });
        let args = json!({ "filters": [{ "field": "title" }, { "field": "author" }] });
        let (path, reason) = violation(args, schema.clone());
        assert_eq!(path, "$.filters[1].field");
        assert!(reason.contains("not one of"));

        let too_many = json!({
            "filters": [
                { "field": "title" },
                { "field": "title" },
                { "field": "body" },
                { "field": "body" }
            ]
        });
        let (path, _) = violation(too_many, schema);
        assert_eq!(path, "$.filters");
    }

    #[test]
    fn additional_properties_false_rejects_unknown_fields() {
        let schema = json!({
            "type": "object",
            "properties": { "a": { "type": "string" } },
            "additionalProperties": false
        });
        let (path, reason) = violation(json!({ "a": "x", "b": 1 }), schema);
        assert_eq!(path, "$.b");
        assert_eq!(reason, "unexpected field");
    }

    #[test]
    fn schema_valued_additional_properties_applies_to_extras() {
        let schema = json!({ "type": "object", "additionalProperties": { "type": "boolean" } });
        assert!(validate_arguments(&json!({ "x": true }), &schema).is_ok());
        let (path, _) = violation(json!({ "x": "yes" }), schema);
        assert_eq!(path, "$.x");
    }

    #[test]
    fn type_arrays_and_const() {
        let schema = json!({ "type": ["string", "null"] });
        assert!(validate_arguments(&json!("s"), &schema).is_ok());
        assert!(validate_arguments(&json!(1), &schema).is_err());

        let (_, reason) = violation(json!("v2"), json!({ "const": "v1" }));
        assert!(reason.contains("constant"));
    }

    #[test]
    fn string_length_counts_characters() {
        let schema = json!({ "type": "string", "maxLength": 3 });
        assert!(validate_arguments(&json!("héé"), &schema).is_ok());
        assert!(validate_arguments(&json!("abcd"), &schema).is_err());
    }

    #[test]
    fn unknown_keywords_and_empty_schema_accept_anything() {
        assert!(validate_arguments(&json!({ "anything": 42 }), &json!({})).is_ok());
        assert!(validate_arguments(&json!({ "x": 1 }), &json!({ "pattern": "^a$" })).is_ok());
    }
}
