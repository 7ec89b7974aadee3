//! Row-operation engine (spec §4.D): insert/select/delete/search/update
//! against a plugin's physical `{plugin}_{table}` table, validated solely
//! against the cached schema (never physical column introspection — see
//! `schema_registry`), matching the spec's call for migration-timing-
//! independent behavior.

pub mod coerce;
pub mod filter;

use crate::error::{DbError, DbResult};
use crate::schema_registry::{physical_table_name, FieldType, Schema, SchemaRegistry, NOW_ISO8601_SQL};
use coerce::coerce;
use rusqlite::types::Value as SqlValue;
use rusqlite::Connection;

const IMMUTABLE_FIELDS: &[&str] = &["id", "created_at", "updated_at"];

fn require_schema(registry: &SchemaRegistry, plugin: &str, table: &str) -> DbResult<Schema> {
    registry
        .get_schema(plugin, table)
        .ok_or_else(|| DbError::validation(format!("unregistered table: {plugin}.{table}")))
}

/// Validate one input row against `schema`, returning coerced
/// `(column, value)` pairs ready for parameter binding.
fn validate_row(schema: &Schema, data: &serde_json::Value) -> DbResult<Vec<(String, SqlValue)>> {
    let obj = data
        .as_object()
        .ok_or_else(|| DbError::validation("row data must be a JSON object"))?;

    for key in obj.keys() {
        if IMMUTABLE_FIELDS.contains(&key.as_str()) {
            return Err(DbError::validation(format!(
                "field '{key}' is immutable and cannot be set"
            )));
        }
        if schema.field(key).is_none() {
            return Err(DbError::validation(format!("unknown field: {key}")));
        }
    }

    let mut out = Vec::new();
    for field in &schema.fields {
        match obj.get(&field.name) {
            None | Some(serde_json::Value::Null) => {
                if field.required {
                    return Err(DbError::validation(format!(
                        "missing required field: {}",
                        field.name
                    )));
                }
            }
            Some(value) => {
                out.push((field.name.clone(), coerce(value, field.field_type, &field.name)?));
            }
        }
    }
    Ok(out)
}

/// `row.{plugin}.insert` — single row. Returns `{id, created: true}`.
pub fn insert_one(
    conn: &Connection,
    registry: &SchemaRegistry,
    plugin: &str,
    table: &str,
    data: &serde_json::Value,
) -> DbResult<serde_json::Value> {
    let schema = require_schema(registry, plugin, table)?;
    let cols = validate_row(&schema, data)?;
    let full_table = physical_table_name(plugin, table);

    let mut names: Vec<String> = cols.iter().map(|(n, _)| n.clone()).collect();
    let mut placeholders: Vec<String> = (0..cols.len()).map(|_| "?".to_string()).collect();
    names.push("created_at".to_string());
    names.push("updated_at".to_string());
    placeholders.push(NOW_ISO8601_SQL.to_string());
    placeholders.push(NOW_ISO8601_SQL.to_string());

    let sql = format!(
        "INSERT INTO {full_table} ({}) VALUES ({})",
        names.join(", "),
        placeholders.join(", ")
    );
    let params: Vec<&dyn rusqlite::ToSql> = cols.iter().map(|(_, v)| v as &dyn rusqlite::ToSql).collect();
    conn.execute(&sql, params.as_slice())?;
    let id = conn.last_insert_rowid();

    Ok(serde_json::json!({ "id": id, "created": true }))
}

/// `row.{plugin}.insert` — bulk form. Validates every row before inserting
/// any; the whole batch is transactional.
pub fn insert_bulk(
    conn: &mut Connection,
    registry: &SchemaRegistry,
    plugin: &str,
    table: &str,
    rows: &[serde_json::Value],
) -> DbResult<serde_json::Value> {
    if rows.is_empty() {
        return Err(DbError::validation("bulk insert requires at least one row"));
    }
    let schema = require_schema(registry, plugin, table)?;
    let validated: Vec<Vec<(String, SqlValue)>> = rows
        .iter()
        .map(|row| validate_row(&schema, row))
        .collect::<DbResult<Vec<_>>>()?;

    let full_table = physical_table_name(plugin, table);
    let tx = conn.transaction()?;
    let mut ids = Vec::with_capacity(validated.len());
    for cols in &validated {
        let mut names: Vec<String> = cols.iter().map(|(n, _)| n.clone()).collect();
        let mut placeholders: Vec<String> = (0..cols.len()).map(|_| "?".to_string()).collect();
        names.push("created_at".to_string());
        names.push("updated_at".to_string());
        placeholders.push(NOW_ISO8601_SQL.to_string());
        placeholders.push(NOW_ISO8601_SQL.to_string());

        let sql = format!(
            "INSERT INTO {full_table} ({}) VALUES ({})",
            names.join(", "),
            placeholders.join(", ")
        );
        let params: Vec<&dyn rusqlite::ToSql> = cols.iter().map(|(_, v)| v as &dyn rusqlite::ToSql).collect();
        tx.execute(&sql, params.as_slice())?;
        ids.push(tx.last_insert_rowid());
    }
    tx.commit()?;

    Ok(serde_json::json!({ "ids": ids, "created": ids.len() }))
}

/// `row.{plugin}.select` — `{exists:false}` or `{exists:true, data}`.
pub fn select(
    conn: &Connection,
    registry: &SchemaRegistry,
    plugin: &str,
    table: &str,
    id: i64,
) -> DbResult<serde_json::Value> {
    let schema = require_schema(registry, plugin, table)?;
    let full_table = physical_table_name(plugin, table);

    let mut col_names: Vec<&str> = vec!["id"];
    col_names.extend(schema.fields.iter().map(|f| f.name.as_str()));
    col_names.push("created_at");
    col_names.push("updated_at");

    let sql = format!(
        "SELECT {} FROM {full_table} WHERE id = ?",
        col_names.join(", ")
    );
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query(rusqlite::params![id])?;

    match rows.next()? {
        None => Ok(serde_json::json!({ "exists": false })),
        Some(row) => {
            let data = row_to_json(row, &col_names, &schema)?;
            Ok(serde_json::json!({ "exists": true, "data": data }))
        }
    }
}

fn row_to_json(
    row: &rusqlite::Row,
    col_names: &[&str],
    schema: &Schema,
) -> DbResult<serde_json::Value> {
    let mut obj = serde_json::Map::new();
    for (i, name) in col_names.iter().enumerate() {
        let value: SqlValue = row.get(i)?;
        let json_value = match *name {
            "id" => match value {
                SqlValue::Integer(n) => serde_json::json!(n),
                _ => serde_json::Value::Null,
            },
            "created_at" | "updated_at" => sql_value_to_datetime_json(value),
            field_name => {
                let field_type = schema
                    .field(field_name)
                    .map(|f| f.field_type)
                    .unwrap_or(FieldType::Text);
                sql_value_to_json(value, field_type)
            }
        };
        obj.insert(name.to_string(), json_value);
    }
    Ok(serde_json::Value::Object(obj))
}

fn sql_value_to_datetime_json(value: SqlValue) -> serde_json::Value {
    match value {
        SqlValue::Null => serde_json::Value::Null,
        SqlValue::Text(s) => serde_json::Value::String(s),
        other => sql_value_to_json(other, FieldType::Text),
    }
}

fn sql_value_to_json(value: SqlValue, field_type: FieldType) -> serde_json::Value {
    match value {
        SqlValue::Null => serde_json::Value::Null,
        SqlValue::Integer(n) => {
            if field_type == FieldType::Boolean {
                serde_json::Value::Bool(n != 0)
            } else {
                serde_json::json!(n)
            }
        }
        SqlValue::Real(f) => serde_json::json!(f),
        SqlValue::Text(s) => serde_json::Value::String(s),
        SqlValue::Blob(_) => serde_json::Value::Null,
    }
}

/// `row.{plugin}.delete` — idempotent; `{deleted:false}` for a nonexistent id.
pub fn delete(
    conn: &Connection,
    registry: &SchemaRegistry,
    plugin: &str,
    table: &str,
    id: i64,
) -> DbResult<serde_json::Value> {
    require_schema(registry, plugin, table)?;
    let full_table = physical_table_name(plugin, table);
    let affected = conn.execute(&format!("DELETE FROM {full_table} WHERE id = ?"), rusqlite::params![id])?;
    Ok(serde_json::json!({ "deleted": affected > 0 }))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SortOrder {
    Asc,
    Desc,
}

/// `row.{plugin}.search` — `{rows, count, truncated}`.
pub fn search(
    conn: &Connection,
    registry: &SchemaRegistry,
    plugin: &str,
    table: &str,
    request: &serde_json::Value,
) -> DbResult<serde_json::Value> {
    let schema = require_schema(registry, plugin, table)?;
    let full_table = physical_table_name(plugin, table);

    let limit = request
        .get("limit")
        .and_then(|v| v.as_u64())
        .unwrap_or(100)
        .min(1000) as i64;
    let offset = request.get("offset").and_then(|v| v.as_i64()).unwrap_or(0);

    let (sort_field, sort_order) = match request.get("sort") {
        None => ("id".to_string(), SortOrder::Asc),
        Some(sort_value) => {
            let sort_obj = sort_value
                .as_object()
                .ok_or_else(|| DbError::validation("'sort' must be an object"))?;
            let field = sort_obj
                .get("field")
                .and_then(|v| v.as_str())
                .ok_or_else(|| DbError::validation("'sort' requires a 'field'"))?;
            if field != "id" && schema.field(field).is_none() {
                return Err(DbError::validation(format!("invalid sort field: {field}")));
            }
            let order = match sort_obj.get("order").and_then(|v| v.as_str()) {
                None | Some("asc") => SortOrder::Asc,
                Some("desc") => SortOrder::Desc,
                Some(other) => {
                    return Err(DbError::validation(format!("invalid sort order: {other}")));
                }
            };
            (field.to_string(), order)
        }
    };

    let compiled = match request.get("filters") {
        None | Some(serde_json::Value::Null) => filter::Compiled {
            clause: "1=1".to_string(),
            params: vec![],
        },
        Some(filters) => filter::compile_filter(&schema, filters)?,
    };

    let mut col_names: Vec<&str> = vec!["id"];
    col_names.extend(schema.fields.iter().map(|f| f.name.as_str()));
    col_names.push("created_at");
    col_names.push("updated_at");

    let order_kw = if sort_order == SortOrder::Desc { "DESC" } else { "ASC" };
    let sql = format!(
        "SELECT {} FROM {full_table} WHERE {} ORDER BY {sort_field} {order_kw} LIMIT ? OFFSET ?",
        col_names.join(", "),
        compiled.clause,
    );

    let mut stmt = conn.prepare(&sql)?;
    let mut params: Vec<&dyn rusqlite::ToSql> =
        compiled.params.iter().map(|v| v as &dyn rusqlite::ToSql).collect();
    params.push(&limit);
    params.push(&offset);

    let mut rows_out = Vec::new();
    let mut rows = stmt.query(params.as_slice())?;
    while let Some(row) = rows.next()? {
        rows_out.push(row_to_json(row, &col_names, &schema)?);
    }

    let count = rows_out.len();
    let truncated = count as i64 == limit;
    Ok(serde_json::json!({ "rows": rows_out, "count": count, "truncated": truncated }))
}

/// `row.{plugin}.update` — `{table, id, data}` form: a full literal
/// replacement of the row's fields by id, as opposed to the filter+patch
/// form. Returns `{exists:false}` for a nonexistent id, else `{updated:true,
/// id}`. Shares `validate_row`'s coercion/immutability rules with insert.
pub fn update_by_id(
    conn: &Connection,
    registry: &SchemaRegistry,
    plugin: &str,
    table: &str,
    id: i64,
    data: &serde_json::Value,
) -> DbResult<serde_json::Value> {
    let schema = require_schema(registry, plugin, table)?;
    let full_table = physical_table_name(plugin, table);

    let obj = data
        .as_object()
        .ok_or_else(|| DbError::validation("row data must be a JSON object"))?;
    for key in obj.keys() {
        if IMMUTABLE_FIELDS.contains(&key.as_str()) {
            return Err(DbError::validation(format!(
                "field '{key}' is immutable and cannot be set"
            )));
        }
        if schema.field(key).is_none() {
            return Err(DbError::validation(format!("unknown field: {key}")));
        }
    }

    let mut set_clauses = Vec::new();
    let mut params: Vec<SqlValue> = Vec::new();
    for (key, value) in obj {
        let field_type = schema.field(key).unwrap().field_type;
        set_clauses.push(format!("{key} = ?"));
        params.push(coerce(value, field_type, key)?);
    }
    if set_clauses.is_empty() {
        return Err(DbError::validation("data must contain at least one field"));
    }
    set_clauses.push(format!("updated_at = {NOW_ISO8601_SQL}"));

    let sql = format!("UPDATE {full_table} SET {} WHERE id = ?", set_clauses.join(", "));
    let mut all_params: Vec<&dyn rusqlite::ToSql> = params.iter().map(|v| v as &dyn rusqlite::ToSql).collect();
    all_params.push(&id);

    let affected = conn.execute(&sql, all_params.as_slice())?;
    if affected == 0 {
        Ok(serde_json::json!({ "exists": false }))
    } else {
        Ok(serde_json::json!({ "updated": true, "id": id }))
    }
}

enum PatchOp {
    Set(serde_json::Value),
    Inc(serde_json::Value),
    Max(serde_json::Value),
    Min(serde_json::Value),
}

fn parse_patch(schema: &Schema, patch: &serde_json::Value) -> DbResult<Vec<(String, PatchOp)>> {
    let obj = patch
        .as_object()
        .ok_or_else(|| DbError::validation("patch must be a JSON object"))?;
    if obj.is_empty() {
        return Err(DbError::validation("patch must contain at least one field"));
    }

    let mut ops = Vec::new();
    for (field_name, value) in obj {
        if IMMUTABLE_FIELDS.contains(&field_name.as_str()) {
            return Err(DbError::validation(format!(
                "field '{field_name}' is immutable and cannot be patched"
            )));
        }
        if schema.field(field_name).is_none() {
            return Err(DbError::validation(format!("unknown field: {field_name}")));
        }

        let op = match value {
            serde_json::Value::Object(m) if m.len() == 1 && m.keys().next().unwrap().starts_with('$') => {
                let (op_name, op_value) = m.iter().next().unwrap();
                match op_name.as_str() {
                    "$set" => PatchOp::Set(op_value.clone()),
                    "$inc" => PatchOp::Inc(op_value.clone()),
                    "$max" => PatchOp::Max(op_value.clone()),
                    "$min" => PatchOp::Min(op_value.clone()),
                    other => {
                        return Err(DbError::validation(format!("unknown update operator: {other}")));
                    }
                }
            }
            literal => PatchOp::Set(literal.clone()),
        };
        ops.push((field_name.clone(), op));
    }
    Ok(ops)
}

/// `row.{plugin}.update` — `{table, filter, patch}` form → `{updated:
/// <rows affected>}`. Atomic operators compile to single SQL expressions
/// (`col = col + ?`) so that N concurrent `$inc`s yield exactly N
/// increments — no read-modify-write happens in this engine.
pub fn update(
    conn: &Connection,
    registry: &SchemaRegistry,
    plugin: &str,
    table: &str,
    filter_value: &serde_json::Value,
    patch: &serde_json::Value,
) -> DbResult<serde_json::Value> {
    let schema = require_schema(registry, plugin, table)?;
    let full_table = physical_table_name(plugin, table);

    let ops = parse_patch(&schema, patch)?;
    let compiled_filter = filter::compile_filter(&schema, filter_value)?;

    let mut set_clauses = Vec::new();
    let mut params: Vec<SqlValue> = Vec::new();

    for (field_name, op) in &ops {
        let field_type = schema.field(field_name).unwrap().field_type;
        match op {
            PatchOp::Set(v) => {
                set_clauses.push(format!("{field_name} = ?"));
                params.push(coerce(v, field_type, field_name)?);
            }
            PatchOp::Inc(v) => {
                if !matches!(field_type, FieldType::Integer | FieldType::Float) {
                    return Err(DbError::validation(format!(
                        "'$inc' requires a numeric field, got '{field_name}'"
                    )));
                }
                set_clauses.push(format!("{field_name} = {field_name} + ?"));
                params.push(coerce(v, field_type, field_name)?);
            }
            PatchOp::Max(v) => {
                set_clauses.push(format!("{field_name} = MAX({field_name}, ?)"));
                params.push(coerce(v, field_type, field_name)?);
            }
            PatchOp::Min(v) => {
                set_clauses.push(format!("{field_name} = MIN({field_name}, ?)"));
                params.push(coerce(v, field_type, field_name)?);
            }
        }
    }
    set_clauses.push(format!("updated_at = {NOW_ISO8601_SQL}"));

    let sql = format!(
        "UPDATE {full_table} SET {} WHERE {}",
        set_clauses.join(", "),
        compiled_filter.clause
    );

    let mut all_params: Vec<&dyn rusqlite::ToSql> = params.iter().map(|v| v as &dyn rusqlite::ToSql).collect();
    all_params.extend(compiled_filter.params.iter().map(|v| v as &dyn rusqlite::ToSql));

    let affected = conn.execute(&sql, all_params.as_slice())?;
    Ok(serde_json::json!({ "updated": affected }))
}
