//! Argument validation and scalar coercion against a declared parameter list.

use serde_json::{Map, Number, Value};
use tracing::debug;

use crate::schema::{Param, ParamKind};

/// Validates a decoded argument value against `params`.
///
/// Compatible scalars are coerced (`"3"` → `3` for integers, `1` → `true` for
/// booleans, ...), missing required fields are rejected, concrete defaults are
/// filled in, and a zero-parameter tool rejects any key at all. Unknown keys
/// of tools that declare parameters are dropped.
pub fn validate_arguments(params: &[Param], value: Value) -> Result<Map<String, Value>, String> {
    let map = match value {
        Value::Object(map) => map,
        Value::Null => Map::new(),
        other => {
            return Err(format!(
                "arguments must be a JSON object, got {}",
                type_label(&other)
            ));
        }
    };

    if params.is_empty() && !map.is_empty() {
        let keys: Vec<&str> = map.keys().map(String::as_str).collect();
        return Err(format!(
            "tool takes no arguments, unexpected: {}",
            keys.join(", ")
        ));
    }

    validate_object(params, map, "")
}

fn validate_object(
    params: &[Param],
    mut map: Map<String, Value>,
    prefix: &str,
) -> Result<Map<String, Value>, String> {
    let mut out = Map::new();
    for param in params {
        let path = join_path(prefix, &param.name);
        match map.remove(&param.name) {
            Some(Value::Null) if !param.is_required() => {
                if let Some(default) = param.default.as_ref().filter(|d| !d.is_null()) {
                    out.insert(param.name.clone(), default.clone());
                }
            }
            Some(value) => {
                let coerced = coerce(&param.kind, value, &path)?;
                out.insert(param.name.clone(), coerced);
            }
            None => match &param.default {
                None => return Err(format!("missing required field '{path}'")),
                Some(Value::Null) => {}
                Some(default) => {
                    out.insert(param.name.clone(), default.clone());
                }
            },
        }
    }
    if !map.is_empty() {
        debug!(
            fields = ?map.keys().collect::<Vec<_>>(),
            "Dropping undeclared argument fields"
        );
    }
    Ok(out)
}

fn coerce(kind: &ParamKind, value: Value, path: &str) -> Result<Value, String> {
    let mismatch = |expected: &str, value: &Value| {
        format!(
            "field '{path}': expected {expected}, got {} {}",
            type_label(value),
            value
        )
    };

    match kind {
        ParamKind::Any => Ok(value),
        ParamKind::String => match value {
            Value::String(_) => Ok(value),
            Value::Number(n) => Ok(Value::String(n.to_string())),
            Value::Bool(b) => Ok(Value::String(b.to_string())),
            other => Err(mismatch("string", &other)),
        },
        ParamKind::Integer => match &value {
            Value::Number(n) if n.is_i64() || n.is_u64() => Ok(value),
            Value::Number(n) => match n.as_f64() {
                Some(f) if f.fract() == 0.0 && f.abs() < i64::MAX as f64 => {
                    Ok(Value::from(f as i64))
                }
                _ => Err(mismatch("integer", &value)),
            },
            Value::String(s) => s
                .trim()
                .parse::<i64>()
                .map(Value::from)
                .map_err(|_| mismatch("integer", &value)),
            _ => Err(mismatch("integer", &value)),
        },
        ParamKind::Number => match &value {
            Value::Number(_) => Ok(value),
            Value::String(s) => s
                .trim()
                .parse::<f64>()
                .ok()
                .and_then(Number::from_f64)
                .map(Value::Number)
                .ok_or_else(|| mismatch("number", &value)),
            _ => Err(mismatch("number", &value)),
        },
        ParamKind::Boolean => match &value {
            Value::Bool(_) => Ok(value),
            Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "yes" | "1" => Ok(Value::Bool(true)),
                "false" | "no" | "0" => Ok(Value::Bool(false)),
                _ => Err(mismatch("boolean", &value)),
            },
            Value::Number(n) => match n.as_i64() {
                Some(0) => Ok(Value::Bool(false)),
                Some(1) => Ok(Value::Bool(true)),
                _ => Err(mismatch("boolean", &value)),
            },
            _ => Err(mismatch("boolean", &value)),
        },
        ParamKind::Array(items) => match value {
            Value::Array(values) => match items {
                Some(item_kind) => values
                    .into_iter()
                    .enumerate()
                    .map(|(i, v)| coerce(item_kind, v, &format!("{path}[{i}]")))
                    .collect::<Result<Vec<_>, _>>()
                    .map(Value::Array),
                None => Ok(Value::Array(values)),
            },
            other => Err(mismatch("array", &other)),
        },
        ParamKind::Object(fields) => match value {
            Value::Object(map) => validate_object(fields, map, path).map(Value::Object),
            other => Err(mismatch("object", &other)),
        },
        ParamKind::Map => match value {
            Value::Object(_) => Ok(value),
            other => Err(mismatch("object", &other)),
        },
    }
}

fn join_path(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}.{name}")
    }
}

fn type_label(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
