//! The MongoDB-style filter operator language shared by search and update
//! (spec §4.D.5). Compiles a JSON filter document directly into a
//! parameterized SQL fragment, following the dynamic-SQL-with-param-vec
//! idiom the teacher uses for its search/list routes (`routes.rs`), rather
//! than evaluating filters in-process — so the same compiled predicate can
//! be reused for `SELECT` (search) and `UPDATE` (atomic patch targeting).

use crate::error::{DbError, DbResult};
use crate::row_ops::coerce::coerce;
use crate::schema_registry::{FieldType, Schema};
use rusqlite::types::Value as SqlValue;

pub struct Compiled {
    pub clause: String,
    pub params: Vec<SqlValue>,
}

const COMPARISON_ONLY_NUMERIC_OR_DATETIME: &[&str] = &["$lt", "$lte", "$gt", "$gte"];

fn is_numeric_or_datetime(ft: FieldType) -> bool {
    matches!(
        ft,
        FieldType::Integer | FieldType::Float | FieldType::Datetime
    )
}

/// Compile a filter document. `filter` may be `null`/absent to mean "match
/// everything" (the caller should special-case that before calling in).
pub fn compile_filter(schema: &Schema, filter: &serde_json::Value) -> DbResult<Compiled> {
    let obj = filter
        .as_object()
        .ok_or_else(|| DbError::validation("filter must be a JSON object"))?;

    let mut clauses = Vec::new();
    let mut params = Vec::new();

    for (key, value) in obj {
        match key.as_str() {
            "$and" => {
                let (clause, mut p) = compile_logical(schema, value, " AND ")?;
                clauses.push(clause);
                params.append(&mut p);
            }
            "$or" => {
                let (clause, mut p) = compile_logical(schema, value, " OR ")?;
                clauses.push(clause);
                params.append(&mut p);
            }
            "$not" => {
                let inner = compile_filter(schema, value)?;
                clauses.push(format!("NOT ({})", inner.clause));
                params.extend(inner.params);
            }
            field_name => {
                let (clause, mut p) = compile_field(schema, field_name, value)?;
                clauses.push(clause);
                params.append(&mut p);
            }
        }
    }

    let clause = if clauses.is_empty() {
        "1=1".to_string()
    } else {
        format!("({})", clauses.join(" AND "))
    };

    Ok(Compiled { clause, params })
}

fn compile_logical(
    schema: &Schema,
    value: &serde_json::Value,
    joiner: &str,
) -> DbResult<(String, Vec<SqlValue>)> {
    let arr = value
        .as_array()
        .ok_or_else(|| DbError::validation("'$and'/'$or' must be an array of filters"))?;
    let mut parts = Vec::new();
    let mut params = Vec::new();
    for sub in arr {
        let compiled = compile_filter(schema, sub)?;
        parts.push(compiled.clause);
        params.extend(compiled.params);
    }
    Ok((format!("({})", parts.join(joiner)), params))
}

fn compile_field(
    schema: &Schema,
    field_name: &str,
    value: &serde_json::Value,
) -> DbResult<(String, Vec<SqlValue>)> {
    let field = schema
        .field(field_name)
        .ok_or_else(|| DbError::validation(format!("unknown field: {field_name}")))?;

    // Bare literal is shorthand for $eq.
    let ops: Vec<(&str, &serde_json::Value)> = match value {
        serde_json::Value::Object(m) if is_operator_object(m) => {
            m.iter().map(|(k, v)| (k.as_str(), v)).collect()
        }
        other => vec![("$eq", other)],
    };

    let mut clauses = Vec::new();
    let mut params = Vec::new();

    for (op, op_value) in ops {
        if COMPARISON_ONLY_NUMERIC_OR_DATETIME.contains(&op) && !is_numeric_or_datetime(field.field_type) {
            return Err(DbError::validation(format!(
                "operator '{op}' is not valid on field '{field_name}' (only numeric or datetime fields)"
            )));
        }

        match op {
            "$eq" => {
                clauses.push(format!("{field_name} = ?"));
                params.push(coerce(op_value, field.field_type, field_name)?);
            }
            "$ne" => {
                clauses.push(format!("{field_name} != ?"));
                params.push(coerce(op_value, field.field_type, field_name)?);
            }
            "$lt" => {
                clauses.push(format!("{field_name} < ?"));
                params.push(coerce(op_value, field.field_type, field_name)?);
            }
            "$lte" => {
                clauses.push(format!("{field_name} <= ?"));
                params.push(coerce(op_value, field.field_type, field_name)?);
            }
            "$gt" => {
                clauses.push(format!("{field_name} > ?"));
                params.push(coerce(op_value, field.field_type, field_name)?);
            }
            "$gte" => {
                clauses.push(format!("{field_name} >= ?"));
                params.push(coerce(op_value, field.field_type, field_name)?);
            }
            "$in" | "$nin" => {
                let arr = op_value
                    .as_array()
                    .ok_or_else(|| DbError::validation(format!("'{op}' requires an array value")))?;
                if arr.is_empty() {
                    // Empty $in matches nothing; empty $nin matches everything.
                    clauses.push(if op == "$in" { "0=1".to_string() } else { "1=1".to_string() });
                    continue;
                }
                let placeholders = vec!["?"; arr.len()].join(", ");
                let not_kw = if op == "$nin" { "NOT " } else { "" };
                clauses.push(format!("{field_name} {not_kw}IN ({placeholders})"));
                for v in arr {
                    params.push(coerce(v, field.field_type, field_name)?);
                }
            }
            other => {
                return Err(DbError::validation(format!(
                    "unknown filter operator: {other}"
                )));
            }
        }
    }

    Ok((format!("({})", clauses.join(" AND ")), params))
}

/// A field value is an "operator object" (rather than a literal that happens
/// to be a JSON object) iff every key starts with `$`.
fn is_operator_object(m: &serde_json::Map<String, serde_json::Value>) -> bool {
    !m.is_empty() && m.keys().all(|k| k.starts_with('$'))
}
