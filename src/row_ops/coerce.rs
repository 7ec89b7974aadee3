//! Type coercion rules (spec §4.D.1), applied uniformly by insert/update/
//! filter compilation so validation never depends on how a value happens to
//! arrive over JSON.

use crate::error::{DbError, DbResult};
use crate::schema_registry::FieldType;
use chrono::DateTime;
use rusqlite::types::Value as SqlValue;

/// Coerce a JSON value to the declared field type, or fail with a
/// `VALIDATION_ERROR` naming `field_name`.
pub fn coerce(value: &serde_json::Value, field_type: FieldType, field_name: &str) -> DbResult<SqlValue> {
    match field_type {
        FieldType::String | FieldType::Text => coerce_string(value, field_name),
        FieldType::Integer => coerce_integer(value, field_name),
        FieldType::Float => coerce_float(value, field_name),
        FieldType::Boolean => coerce_boolean(value, field_name),
        FieldType::Datetime => coerce_datetime(value, field_name),
    }
}

fn bad(field_name: &str, value: &serde_json::Value, wanted: &str) -> DbError {
    DbError::validation(format!(
        "field '{field_name}': cannot coerce {value} to {wanted}"
    ))
}

fn coerce_string(value: &serde_json::Value, field_name: &str) -> DbResult<SqlValue> {
    let s = match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Number(n) => n.to_string(),
        serde_json::Value::Bool(b) => b.to_string(),
        _ => return Err(bad(field_name, value, "string")),
    };
    Ok(SqlValue::Text(s))
}

fn coerce_integer(value: &serde_json::Value, field_name: &str) -> DbResult<SqlValue> {
    let n = match value {
        serde_json::Value::Number(n) if n.is_i64() || n.is_u64() => n.as_i64().unwrap(),
        serde_json::Value::Number(n) if n.is_f64() => n.as_f64().unwrap().trunc() as i64,
        serde_json::Value::String(s) => s
            .trim()
            .parse::<i64>()
            .or_else(|_| s.trim().parse::<f64>().map(|f| f.trunc() as i64))
            .map_err(|_| bad(field_name, value, "integer"))?,
        _ => return Err(bad(field_name, value, "integer")),
    };
    Ok(SqlValue::Integer(n))
}

fn coerce_float(value: &serde_json::Value, field_name: &str) -> DbResult<SqlValue> {
    let f = match value {
        serde_json::Value::Number(n) => n.as_f64().ok_or_else(|| bad(field_name, value, "float"))?,
        serde_json::Value::String(s) => {
            s.trim().parse::<f64>().map_err(|_| bad(field_name, value, "float"))?
        }
        _ => return Err(bad(field_name, value, "float")),
    };
    Ok(SqlValue::Real(f))
}

fn coerce_boolean(value: &serde_json::Value, field_name: &str) -> DbResult<SqlValue> {
    let b = match value {
        serde_json::Value::Bool(b) => *b,
        serde_json::Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        serde_json::Value::String(s) => {
            let lower = s.to_ascii_lowercase();
            match lower.as_str() {
                "true" | "1" | "yes" | "on" => true,
                "false" | "0" | "no" | "off" | "" => false,
                _ => return Err(bad(field_name, value, "boolean")),
            }
        }
        _ => return Err(bad(field_name, value, "boolean")),
    };
    Ok(SqlValue::Integer(if b { 1 } else { 0 }))
}

fn coerce_datetime(value: &serde_json::Value, field_name: &str) -> DbResult<SqlValue> {
    let s = value
        .as_str()
        .ok_or_else(|| bad(field_name, value, "datetime"))?;
    let parsed = DateTime::parse_from_rfc3339(s).map_err(|_| bad(field_name, value, "datetime (ISO-8601)"))?;
    Ok(SqlValue::Text(parsed.to_rfc3339()))
}
