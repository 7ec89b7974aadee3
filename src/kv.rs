//! Per-plugin key-value store with TTL (spec §4.E).
//!
//! The background sweeper follows the teacher's `retention.rs` idiom
//! exactly: its own loop, a configurable interval, poisoned-mutex recovery,
//! and continuation after logging on error rather than aborting the task.

use crate::db::Db;
use crate::error::{DbError, DbResult};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

const MAX_VALUE_BYTES: usize = 64 * 1024;
const DEFAULT_LIST_LIMIT: i64 = 1000;

pub fn kv_set(
    db: &Db,
    plugin: &str,
    key: &str,
    value: &serde_json::Value,
    ttl_seconds: Option<i64>,
) -> DbResult<()> {
    let value_json = serde_json::to_string(value)?;
    if value_json.len() > MAX_VALUE_BYTES {
        return Err(DbError::ValueTooLarge(format!(
            "value for {plugin}.{key} is {} bytes, max is {MAX_VALUE_BYTES}",
            value_json.len()
        )));
    }

    let now = chrono::Utc::now().timestamp();
    let expires_at = match ttl_seconds {
        Some(ttl) if ttl > 0 => Some(now + ttl),
        _ => None,
    };

    let conn = db.conn.lock().unwrap_or_else(|e| e.into_inner());
    conn.execute(
        "INSERT INTO plugin_kv (plugin_name, key, value_json, expires_at, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?5)
         ON CONFLICT(plugin_name, key) DO UPDATE SET
            value_json = excluded.value_json,
            expires_at = excluded.expires_at,
            updated_at = excluded.updated_at",
        rusqlite::params![plugin, key, value_json, expires_at, now],
    )?;
    Ok(())
}

pub fn kv_get(db: &Db, plugin: &str, key: &str) -> DbResult<serde_json::Value> {
    let now = chrono::Utc::now().timestamp();
    let conn = db.conn.lock().unwrap_or_else(|e| e.into_inner());
    let row: Option<(String, Option<i64>)> = conn
        .query_row(
            "SELECT value_json, expires_at FROM plugin_kv WHERE plugin_name = ?1 AND key = ?2",
            rusqlite::params![plugin, key],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .ok();

    match row {
        None => Ok(serde_json::json!({ "exists": false })),
        Some((_, Some(expires_at))) if expires_at <= now => Ok(serde_json::json!({ "exists": false })),
        Some((value_json, _)) => {
            let value: serde_json::Value = serde_json::from_str(&value_json)?;
            Ok(serde_json::json!({ "exists": true, "value": value }))
        }
    }
}

pub fn kv_delete(db: &Db, plugin: &str, key: &str) -> DbResult<serde_json::Value> {
    let conn = db.conn.lock().unwrap_or_else(|e| e.into_inner());
    let affected = conn.execute(
        "DELETE FROM plugin_kv WHERE plugin_name = ?1 AND key = ?2",
        rusqlite::params![plugin, key],
    )?;
    Ok(serde_json::json!({ "deleted": affected > 0 }))
}

pub fn kv_list(
    db: &Db,
    plugin: &str,
    prefix: Option<&str>,
    limit: Option<i64>,
) -> DbResult<serde_json::Value> {
    let now = chrono::Utc::now().timestamp();
    let limit = limit.unwrap_or(DEFAULT_LIST_LIMIT).min(DEFAULT_LIST_LIMIT);
    let conn = db.conn.lock().unwrap_or_else(|e| e.into_inner());

    let mut stmt = conn.prepare(
        "SELECT key FROM plugin_kv
         WHERE plugin_name = ?1
           AND (expires_at IS NULL OR expires_at > ?2)
           AND (?3 IS NULL OR key LIKE ?3 || '%')
         ORDER BY key ASC
         LIMIT ?4",
    )?;
    let keys: Vec<String> = stmt
        .query_map(rusqlite::params![plugin, now, prefix, limit], |r| r.get(0))?
        .filter_map(|r| r.ok())
        .collect();

    let count = keys.len();
    let truncated = count as i64 == limit;
    Ok(serde_json::json!({ "keys": keys, "count": count, "truncated": truncated }))
}

/// Delete every row past its expiry. Returns the number of rows swept.
pub fn sweep_expired(db: &Db) -> DbResult<usize> {
    let now = chrono::Utc::now().timestamp();
    let conn = db.conn.lock().unwrap_or_else(|e| e.into_inner());
    let affected = conn.execute(
        "DELETE FROM plugin_kv WHERE expires_at IS NOT NULL AND expires_at <= ?1",
        rusqlite::params![now],
    )?;
    Ok(affected)
}

/// Spawn the background TTL sweeper. Mirrors `retention.rs`'s
/// `spawn_retention_task`: owns the shared `Db`, loops on an interval,
/// recovers from a poisoned mutex rather than panicking, and checks
/// `shutdown` at every suspension point.
pub fn spawn_sweeper(
    db: Arc<Db>,
    interval_secs: u64,
    shutdown: Arc<AtomicBool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let interval = Duration::from_secs(interval_secs.max(1));
        loop {
            tokio::time::sleep(interval).await;
            if shutdown.load(Ordering::Relaxed) {
                break;
            }
            match sweep_expired(&db) {
                Ok(n) if n > 0 => tracing::debug!(swept = n, "kv ttl sweep"),
                Ok(_) => {}
                Err(e) => {
                    tracing::error!(error = %e, "kv ttl sweep failed");
                    tokio::time::sleep(Duration::from_secs(5)).await;
                }
            }
        }
        tracing::info!("kv sweeper shut down");
    })
}
