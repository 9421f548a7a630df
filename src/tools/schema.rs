//! Argument validation against a tool's JSON schema.
//!
//! Supports the subset of JSON Schema that tool definitions actually use:
//! `type`, `enum`, `required`, `properties`, `additionalProperties: false`,
//! `items`, numeric bounds and string length bounds.

use serde_json::Value;

use crate::error::{Result, TermpalError};

const KNOWN_TYPES: &[&str] = &[
    "object", "array", "string", "integer", "number", "boolean", "null",
];

/// Validate `args` against `schema`. Returns every violation found, joined.
pub fn validate_args(args: &Value, schema: &Value) -> std::result::Result<(), String> {
    let mut errors = Vec::new();
    validate_value(args, schema, "", &mut errors);
    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors.join("; "))
    }
}

/// Sanity-check a schema at registration time.
///
/// A tool schema must describe an object; every declared `type` must be a
/// JSON Schema type name and every `required` entry must be declared.
pub fn check_schema(tool: &str, schema: &Value) -> Result<()> {
    if schema.get("type").and_then(Value::as_str) != Some("object") {
        return Err(TermpalError::Config(format!(
            "tool '{}': parameter schema must have type \"object\"",
            tool
        )));
    }
    check_node(tool, schema, "")
}

fn check_node(tool: &str, schema: &Value, path: &str) -> Result<()> {
    let display_path = if path.is_empty() { "root" } else { path };
    if let Some(ty) = schema.get("type") {
        match ty.as_str() {
            Some(name) if KNOWN_TYPES.contains(&name) => {}
            _ => {
                return Err(TermpalError::Config(format!(
                    "tool '{}': {}: unsupported type {}",
                    tool, display_path, ty
                )))
            }
        }
    }

    let props = schema.get("properties").and_then(Value::as_object);
    if let Some(required) = schema.get("required") {
        let Some(required) = required.as_array() else {
            return Err(TermpalError::Config(format!(
                "tool '{}': {}: \"required\" must be an array",
                tool, display_path
            )));
        };
        for field in required {
            let declared = field
                .as_str()
                .map(|f| props.map(|p| p.contains_key(f)).unwrap_or(false))
                .unwrap_or(false);
            if !declared {
                return Err(TermpalError::Config(format!(
                    "tool '{}': {}: required field {} is not declared in properties",
                    tool, display_path, field
                )));
            }
        }
    }

    if let Some(props) = props {
        for (key, sub) in props {
            check_node(tool, sub, &join_path(path, key))?;
        }
    }
    if let Some(items) = schema.get("items") {
        check_node(tool, items, &format!("{}[]", display_path))?;
    }
    Ok(())
}

fn join_path(path: &str, key: &str) -> String {
    if path.is_empty() {
        key.to_string()
    } else {
        format!("{}.{}", path, key)
    }
}

fn validate_value(val: &Value, schema: &Value, path: &str, errors: &mut Vec<String>) {
    let display_path = if path.is_empty() { "root" } else { path };

    if let Some(expected) = schema.get("type").and_then(Value::as_str) {
        let type_ok = match expected {
            "object" => val.is_object(),
            "array" => val.is_array(),
            "string" => val.is_string(),
            "integer" => val.is_i64() || val.is_u64(),
            "number" => val.is_number(),
            "boolean" => val.is_boolean(),
            "null" => val.is_null(),
            _ => true,
        };
        if !type_ok {
            errors.push(format!("{}: expected type '{}'", display_path, expected));
            return;
        }
    }

    if let Some(allowed) = schema.get("enum").and_then(Value::as_array) {
        if !allowed.contains(val) {
            errors.push(format!("{}: value not in allowed enum", display_path));
        }
    }

    if let Some(n) = val.as_f64() {
        if let Some(min) = schema.get("minimum").and_then(Value::as_f64) {
            if n < min {
                errors.push(format!("{}: value {} < minimum {}", display_path, n, min));
            }
        }
        if let Some(max) = schema.get("maximum").and_then(Value::as_f64) {
            if n > max {
                errors.push(format!("{}: value {} > maximum {}", display_path, n, max));
            }
        }
    }

    if let Some(s) = val.as_str() {
        let len = s.chars().count() as u64;
        if let Some(min_len) = schema.get("minLength").and_then(Value::as_u64) {
            if len < min_len {
                errors.push(format!(
                    "{}: string length {} < minLength {}",
                    display_path, len, min_len
                ));
            }
        }
        if let Some(max_len) = schema.get("maxLength").and_then(Value::as_u64) {
            if len > max_len {
                errors.push(format!(
                    "{}: string length {} > maxLength {}",
                    display_path, len, max_len
                ));
            }
        }
    }

    if let Some(obj) = val.as_object() {
        let props = schema.get("properties").and_then(Value::as_object);
        if let Some(required) = schema.get("required").and_then(Value::as_array) {
            for field in required.iter().filter_map(Value::as_str) {
                if !obj.contains_key(field) {
                    errors.push(format!(
                        "{}: required field missing",
                        join_path(path, field)
                    ));
                }
            }
        }
        if let Some(props) = props {
            for (key, prop_schema) in props {
                if let Some(prop_val) = obj.get(key) {
                    validate_value(prop_val, prop_schema, &join_path(path, key), errors);
                }
            }
        }
        if schema.get("additionalProperties") == Some(&Value::Bool(false)) {
            for key in obj.keys() {
                let declared = props.map(|p| p.contains_key(key)).unwrap_or(false);
                if !declared {
                    errors.push(format!("{}: unexpected field", join_path(path, key)));
                }
            }
        }
    }

    if let Some(arr) = val.as_array() {
        if let Some(items_schema) = schema.get("items") {
            for (i, item) in arr.iter().enumerate() {
                let item_path = format!("{}[{}]", display_path, i);
                validate_value(item, items_schema, &item_path, errors);
            }
        }
    }
}
