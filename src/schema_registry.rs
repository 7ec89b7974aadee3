//! Schema registry (spec §4.C).
//!
//! Grounded directly on `original_source/common/schema_registry.py`:
//! validation rules, the reserved/duplicate-name checks, the type map, and
//! the "already exists is a no-op, not an error" registration outcome all
//! come from that file. The in-memory cache is loaded once at startup and is
//! the sole source of truth the row-operation engine consults (§4.D) — never
//! physical column introspection, so behavior stays deterministic under
//! migration.

use crate::db::Db;
use crate::error::{DbError, DbResult};
use regex::Regex;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

fn field_name_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-z][a-z0-9_]{0,63}$").unwrap())
}

fn table_name_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-z][a-z0-9_]{0,99}$").unwrap())
}

const RESERVED_FIELD_NAMES: &[&str] = &["id", "created_at", "updated_at"];

/// SQLite expression producing an RFC3339 (ISO-8601) UTC timestamp, e.g.
/// `2024-01-01T00:00:00.000Z`. `CURRENT_TIMESTAMP` yields a bare
/// `YYYY-MM-DD HH:MM:SS` with no `T` and no offset, which spec §4.D.3
/// requires on the way out — used for both the materialized `created_at`/
/// `updated_at` column defaults and every engine-written update to them.
pub const NOW_ISO8601_SQL: &str = "strftime('%Y-%m-%dT%H:%M:%fZ', 'now')";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Text,
    Integer,
    Float,
    Boolean,
    Datetime,
}

impl FieldType {
    fn from_str(s: &str) -> Option<Self> {
        match s {
            "string" => Some(FieldType::String),
            "text" => Some(FieldType::Text),
            "integer" => Some(FieldType::Integer),
            "float" => Some(FieldType::Float),
            "boolean" => Some(FieldType::Boolean),
            "datetime" => Some(FieldType::Datetime),
            _ => None,
        }
    }

    /// The SQLite column type used when materializing the table.
    pub fn sql_type(&self) -> &'static str {
        match self {
            FieldType::String => "VARCHAR(255)",
            FieldType::Text => "TEXT",
            FieldType::Integer => "INTEGER",
            FieldType::Float => "REAL",
            FieldType::Boolean => "INTEGER",
            FieldType::Datetime => "TEXT",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldDef {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default)]
    pub required: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schema {
    pub fields: Vec<FieldDef>,
}

impl Schema {
    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }
}

type CacheKey = (String, String);

pub struct SchemaRegistry {
    cache: Mutex<HashMap<CacheKey, Schema>>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self {
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Load every schema row from the database into the in-memory cache.
    /// Call once at service startup.
    pub fn load_cache(&self, db: &Db) -> DbResult<()> {
        let conn = db.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt =
            conn.prepare("SELECT plugin_name, table_name, schema_json FROM plugin_table_schemas")?;
        let rows = stmt.query_map([], |row| {
            let plugin: String = row.get(0)?;
            let table: String = row.get(1)?;
            let schema_json: String = row.get(2)?;
            Ok((plugin, table, schema_json))
        })?;

        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        let mut count = 0;
        for row in rows {
            let (plugin, table, schema_json) = row?;
            let schema: Schema = serde_json::from_str(&schema_json)?;
            cache.insert((plugin, table), schema);
            count += 1;
        }
        tracing::info!(count, "loaded schemas into cache");
        Ok(())
    }

    pub fn validate_table_name(table_name: &str) -> DbResult<()> {
        if !table_name_re().is_match(table_name) {
            return Err(DbError::validation(format!(
                "table name '{table_name}' invalid: must start with a lowercase letter and \
                 contain only lowercase letters, digits, underscores, max 100 chars"
            )));
        }
        Ok(())
    }

    pub fn validate_schema(schema_value: &serde_json::Value) -> DbResult<Schema> {
        let obj = schema_value
            .as_object()
            .ok_or_else(|| DbError::validation("schema must be an object"))?;

        let fields_value = obj
            .get("fields")
            .ok_or_else(|| DbError::validation("schema must have a 'fields' key"))?;
        let fields_arr = fields_value
            .as_array()
            .ok_or_else(|| DbError::validation("'fields' must be a list"))?;
        if fields_arr.is_empty() {
            return Err(DbError::validation("schema must have at least one field"));
        }

        let mut seen = std::collections::HashSet::new();
        let mut fields = Vec::with_capacity(fields_arr.len());

        for (i, field_value) in fields_arr.iter().enumerate() {
            let field_obj = field_value
                .as_object()
                .ok_or_else(|| DbError::validation(format!("field {i} must be an object")))?;

            let name = field_obj
                .get("name")
                .and_then(|v| v.as_str())
                .ok_or_else(|| DbError::validation(format!("field {i} missing 'name'")))?;
            let type_str = field_obj
                .get("type")
                .and_then(|v| v.as_str())
                .ok_or_else(|| DbError::validation(format!("field {i} missing 'type'")))?;

            if !field_name_re().is_match(name) {
                return Err(DbError::validation(format!(
                    "field name '{name}' invalid: must start with a lowercase letter and \
                     contain only lowercase letters, digits, underscores, max 64 chars"
                )));
            }
            if !seen.insert(name.to_string()) {
                return Err(DbError::validation(format!("duplicate field name: {name}")));
            }
            if RESERVED_FIELD_NAMES.contains(&name) {
                return Err(DbError::validation(format!(
                    "field name '{name}' is reserved"
                )));
            }

            let field_type = FieldType::from_str(type_str).ok_or_else(|| {
                DbError::validation(format!(
                    "field '{name}' has invalid type '{type_str}': valid types are string, \
                     text, integer, float, boolean, datetime"
                ))
            })?;

            let required = match field_obj.get("required") {
                None => false,
                Some(serde_json::Value::Bool(b)) => *b,
                Some(_) => {
                    return Err(DbError::validation(format!(
                        "field '{name}' 'required' must be boolean"
                    )));
                }
            };

            fields.push(FieldDef {
                name: name.to_string(),
                field_type,
                required,
            });
        }

        Ok(Schema { fields })
    }

    /// Register a table schema and materialize its physical table.
    /// Returns `Ok(false)` (not an error) if the `(plugin, table)` pair is
    /// already registered.
    pub fn register_schema(
        &self,
        db: &Db,
        plugin_name: &str,
        table_name: &str,
        schema_value: &serde_json::Value,
    ) -> DbResult<bool> {
        Self::validate_table_name(table_name)?;
        let schema = Self::validate_schema(schema_value)?;

        let key = (plugin_name.to_string(), table_name.to_string());
        {
            let cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
            if cache.contains_key(&key) {
                tracing::warn!(plugin = plugin_name, table = table_name, "schema already exists, skipping");
                return Ok(false);
            }
        }

        let now = chrono::Utc::now().timestamp();
        let schema_json = serde_json::to_string(&schema)?;

        let conn = db.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "INSERT INTO plugin_table_schemas (plugin_name, table_name, version, schema_json, created_at, updated_at)
             VALUES (?1, ?2, 1, ?3, ?4, ?4)",
            rusqlite::params![plugin_name, table_name, schema_json, now],
        )?;

        Self::create_table(&conn, plugin_name, table_name, &schema)?;
        drop(conn);

        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        cache.insert(key, schema);

        tracing::info!(plugin = plugin_name, table = table_name, "registered schema");
        Ok(true)
    }

    fn create_table(
        conn: &Connection,
        plugin_name: &str,
        table_name: &str,
        schema: &Schema,
    ) -> DbResult<()> {
        let full_name = physical_table_name(plugin_name, table_name);

        let mut cols = vec!["id INTEGER PRIMARY KEY AUTOINCREMENT".to_string()];
        for field in &schema.fields {
            let nullable = if field.required { "NOT NULL" } else { "" };
            cols.push(format!("{} {} {}", field.name, field.field_type.sql_type(), nullable));
        }
        cols.push(format!("created_at TEXT NOT NULL DEFAULT ({NOW_ISO8601_SQL})"));
        cols.push(format!("updated_at TEXT NOT NULL DEFAULT ({NOW_ISO8601_SQL})"));

        let ddl = format!("CREATE TABLE IF NOT EXISTS {full_name} ({})", cols.join(", "));
        conn.execute(&ddl, [])?;
        tracing::info!(table = %full_name, "materialized plugin table");
        Ok(())
    }

    pub fn get_schema(&self, plugin_name: &str, table_name: &str) -> Option<Schema> {
        let cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        cache
            .get(&(plugin_name.to_string(), table_name.to_string()))
            .cloned()
    }

    pub fn list_schemas(&self, plugin_name: &str) -> Vec<serde_json::Value> {
        let cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        cache
            .iter()
            .filter(|((p, _), _)| p == plugin_name)
            .map(|((_, t), schema)| {
                serde_json::json!({
                    "table_name": t,
                    "fields": schema.fields,
                    "field_count": schema.fields.len(),
                })
            })
            .collect()
    }

    pub fn delete_schema(&self, db: &Db, plugin_name: &str, table_name: &str) -> DbResult<bool> {
        let key = (plugin_name.to_string(), table_name.to_string());
        {
            let cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
            if !cache.contains_key(&key) {
                return Ok(false);
            }
        }

        let full_name = physical_table_name(plugin_name, table_name);
        let conn = db.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(&format!("DROP TABLE IF EXISTS {full_name}"), [])?;
        conn.execute(
            "DELETE FROM plugin_table_schemas WHERE plugin_name = ?1 AND table_name = ?2",
            rusqlite::params![plugin_name, table_name],
        )?;
        drop(conn);

        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        cache.remove(&key);

        tracing::info!(plugin = plugin_name, table = table_name, "deleted schema and table");
        Ok(true)
    }
}

impl Default for SchemaRegistry {
    fn default() -> Self {
        Self::new()
    }
}

pub fn physical_table_name(plugin_name: &str, table_name: &str) -> String {
    format!("{plugin_name}_{table_name}")
}

pub type SharedSchemaRegistry = Arc<SchemaRegistry>;
