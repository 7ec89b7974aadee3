//! Ancillary state: chat user stats, channel high-water marks, user-count
//! history, recent chat, user-action audit log, outbound message queue, API
//! tokens, current status, and periodic maintenance (spec §3, recovered from
//! `common/database.py`).
//!
//! These are the tables the database service itself owns (everything in §3
//! except the plugin-owned entities, which live in `schema_registry`/`kv`).
//! Grounded directly on `BotDatabase`'s methods in `common/database.py`, kept
//! as plain functions over a shared `Db` rather than ported as a class.

use crate::db::Db;
use crate::error::DbResult;
use base64::Engine;
use rand::RngCore;

const RECENT_CHAT_RETENTION_SECS: i64 = 150 * 3600;
const HISTORY_RETENTION_DAYS: i64 = 30;
const OUTBOUND_SENT_RETENTION_DAYS: i64 = 7;
const REVOKED_TOKEN_RETENTION_DAYS: i64 = 90;

/// Record a user joining: new row on first sight, otherwise a fresh session.
pub fn user_joined(db: &Db, username: &str) -> DbResult<()> {
    let now = chrono::Utc::now().timestamp();
    let conn = db.conn.lock().unwrap_or_else(|e| e.into_inner());
    let exists: bool = conn
        .query_row(
            "SELECT 1 FROM user_stats WHERE username = ?1",
            rusqlite::params![username],
            |_| Ok(true),
        )
        .unwrap_or(false);

    if exists {
        conn.execute(
            "UPDATE user_stats SET last_seen = ?1, current_session_start = ?1 WHERE username = ?2",
            rusqlite::params![now, username],
        )?;
    } else {
        conn.execute(
            "INSERT INTO user_stats (username, first_seen, last_seen, current_session_start)
             VALUES (?1, ?2, ?2, ?2)",
            rusqlite::params![username, now],
        )?;
    }
    Ok(())
}

/// Record a user leaving: session time is only ever added, never subtracted,
/// and a user without an open session is left untouched (idempotent under
/// duplicate/reordered pub/sub delivery).
pub fn user_left(db: &Db, username: &str) -> DbResult<()> {
    let now = chrono::Utc::now().timestamp();
    let conn = db.conn.lock().unwrap_or_else(|e| e.into_inner());
    conn.execute(
        "UPDATE user_stats
         SET last_seen = ?1,
             total_time_connected = total_time_connected + (?1 - current_session_start),
             current_session_start = NULL
         WHERE username = ?2 AND current_session_start IS NOT NULL",
        rusqlite::params![now, username],
    )?;
    Ok(())
}

/// Close every open session. Called on shutdown so no user's
/// `current_session_start` survives a restart.
pub fn close_all_sessions(db: &Db) -> DbResult<usize> {
    let now = chrono::Utc::now().timestamp();
    let conn = db.conn.lock().unwrap_or_else(|e| e.into_inner());
    let affected = conn.execute(
        "UPDATE user_stats
         SET total_time_connected = total_time_connected + (?1 - current_session_start),
             current_session_start = NULL,
             last_seen = ?1
         WHERE current_session_start IS NOT NULL",
        rusqlite::params![now],
    )?;
    Ok(affected)
}

/// Increment a user's chat-line count and, unless the message is empty or
/// from the synthetic `server` sender, append it to `recent_chat`.
pub fn message_log(db: &Db, username: &str, message: &str) -> DbResult<()> {
    let now = chrono::Utc::now().timestamp();
    let conn = db.conn.lock().unwrap_or_else(|e| e.into_inner());
    conn.execute(
        "UPDATE user_stats SET total_chat_lines = total_chat_lines + 1, last_seen = ?1 WHERE username = ?2",
        rusqlite::params![now, username],
    )?;

    if !message.is_empty() && !username.eq_ignore_ascii_case("server") {
        conn.execute(
            "INSERT INTO recent_chat (timestamp, username, message) VALUES (?1, ?2, ?3)",
            rusqlite::params![now, username, message],
        )?;
        let cutoff = now - RECENT_CHAT_RETENTION_SECS;
        conn.execute("DELETE FROM recent_chat WHERE timestamp < ?1", rusqlite::params![cutoff])?;
    }
    Ok(())
}

pub fn log_user_action(db: &Db, username: &str, action_type: &str, details: Option<&str>) -> DbResult<()> {
    let now = chrono::Utc::now().timestamp();
    let conn = db.conn.lock().unwrap_or_else(|e| e.into_inner());
    conn.execute(
        "INSERT INTO user_actions (timestamp, username, action_type, details) VALUES (?1, ?2, ?3, ?4)",
        rusqlite::params![now, username, action_type, details],
    )?;
    Ok(())
}

/// Record a point-in-time user-count sample for the history series.
pub fn log_user_count(db: &Db, chat_users: i64, connected_users: i64) -> DbResult<()> {
    let now = chrono::Utc::now().timestamp();
    let conn = db.conn.lock().unwrap_or_else(|e| e.into_inner());
    conn.execute(
        "INSERT INTO user_count_history (timestamp, chat_users, connected_users) VALUES (?1, ?2, ?3)",
        rusqlite::params![now, chat_users, connected_users],
    )?;
    Ok(())
}

/// Bump the channel's high-water marks. Monotone — only replaces a value if
/// the new one strictly exceeds the old.
pub fn update_high_water_mark(db: &Db, chat_count: i64, connected_count: Option<i64>) -> DbResult<()> {
    let now = chrono::Utc::now().timestamp();
    let conn = db.conn.lock().unwrap_or_else(|e| e.into_inner());

    conn.execute(
        "UPDATE channel_stats
         SET max_users = ?1, max_users_at = ?2, last_updated = ?2
         WHERE id = 1 AND ?1 > max_users",
        rusqlite::params![chat_count, now],
    )?;

    if let Some(connected_count) = connected_count {
        conn.execute(
            "UPDATE channel_stats
             SET max_connected = ?1, max_connected_at = ?2, last_updated = ?2
             WHERE id = 1 AND ?1 > max_connected",
            rusqlite::params![connected_count, now],
        )?;
    }
    Ok(())
}

pub fn get_user_stats(db: &Db, username: &str) -> DbResult<serde_json::Value> {
    let conn = db.conn.lock().unwrap_or_else(|e| e.into_inner());
    let row = conn.query_row(
        "SELECT username, first_seen, last_seen, total_chat_lines, total_time_connected, current_session_start
         FROM user_stats WHERE username = ?1",
        rusqlite::params![username],
        |r| {
            Ok(serde_json::json!({
                "username": r.get::<_, String>(0)?,
                "first_seen": r.get::<_, i64>(1)?,
                "last_seen": r.get::<_, i64>(2)?,
                "total_chat_lines": r.get::<_, i64>(3)?,
                "total_time_connected": r.get::<_, i64>(4)?,
                "current_session_start": r.get::<_, Option<i64>>(5)?,
            }))
        },
    );
    match row {
        Ok(v) => Ok(v),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(serde_json::json!({ "found": false })),
        Err(e) => Err(e.into()),
    }
}

/// `query.channel_stats` payload: high-water marks, top chatters, and total
/// unique users ever seen.
pub fn channel_stats(db: &Db, top_chatters_limit: i64) -> DbResult<serde_json::Value> {
    let conn = db.conn.lock().unwrap_or_else(|e| e.into_inner());

    let (max_users, max_connected): (i64, i64) = conn.query_row(
        "SELECT max_users, max_connected FROM channel_stats WHERE id = 1",
        [],
        |r| Ok((r.get(0)?, r.get(1)?)),
    )?;

    let mut stmt = conn.prepare(
        "SELECT username, total_chat_lines FROM user_stats
         WHERE total_chat_lines > 0 ORDER BY total_chat_lines DESC LIMIT ?1",
    )?;
    let top_chatters: Vec<serde_json::Value> = stmt
        .query_map(rusqlite::params![top_chatters_limit], |r| {
            Ok(serde_json::json!({ "username": r.get::<_, String>(0)?, "total_chat_lines": r.get::<_, i64>(1)? }))
        })?
        .filter_map(|r| r.ok())
        .collect();

    let total_users_seen: i64 = conn.query_row("SELECT COUNT(*) FROM user_stats", [], |r| r.get(0))?;

    Ok(serde_json::json!({
        "high_water_mark": max_users,
        "high_water_connected": max_connected,
        "top_chatters": top_chatters,
        "total_users_seen": total_users_seen,
    }))
}

pub fn get_recent_chat(db: &Db, limit: i64) -> DbResult<Vec<serde_json::Value>> {
    let conn = db.conn.lock().unwrap_or_else(|e| e.into_inner());
    let mut stmt = conn.prepare(
        "SELECT timestamp, username, message FROM recent_chat ORDER BY timestamp DESC LIMIT ?1",
    )?;
    let mut rows: Vec<serde_json::Value> = stmt
        .query_map(rusqlite::params![limit], |r| {
            Ok(serde_json::json!({
                "timestamp": r.get::<_, i64>(0)?,
                "username": r.get::<_, String>(1)?,
                "message": r.get::<_, String>(2)?,
            }))
        })?
        .filter_map(|r| r.ok())
        .collect();
    rows.reverse();
    Ok(rows)
}

/// `messages.outbound.get` — enqueue_time-ordered, backoff-aware fetch of
/// unsent messages. Matches the `2^retry_count * 60s` eligibility formula in
/// spec §3.
pub fn get_unsent_outbound(db: &Db, limit: i64, max_retries: i64) -> DbResult<Vec<serde_json::Value>> {
    let now = chrono::Utc::now().timestamp();
    let conn = db.conn.lock().unwrap_or_else(|e| e.into_inner());
    let mut stmt = conn.prepare(
        "SELECT id, enqueue_time, message, retry_count, last_error
         FROM outbound_messages
         WHERE sent_flag = 0
           AND retry_count < ?1
           AND (retry_count = 0 OR enqueue_time + (1 << retry_count) * 60 <= ?2)
         ORDER BY enqueue_time ASC
         LIMIT ?3",
    )?;
    let rows = stmt
        .query_map(rusqlite::params![max_retries, now, limit], |r| {
            Ok(serde_json::json!({
                "id": r.get::<_, i64>(0)?,
                "timestamp": r.get::<_, i64>(1)?,
                "message": r.get::<_, String>(2)?,
                "retry_count": r.get::<_, i64>(3)?,
                "last_error": r.get::<_, Option<String>>(4)?,
            }))
        })?
        .filter_map(|r| r.ok())
        .collect();
    Ok(rows)
}

pub fn enqueue_outbound(db: &Db, message: &str) -> DbResult<i64> {
    let now = chrono::Utc::now().timestamp();
    let conn = db.conn.lock().unwrap_or_else(|e| e.into_inner());
    conn.execute(
        "INSERT INTO outbound_messages (enqueue_time, message, sent_flag) VALUES (?1, ?2, 0)",
        rusqlite::params![now, message],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn mark_outbound_sent(db: &Db, id: i64) -> DbResult<()> {
    let now = chrono::Utc::now().timestamp();
    let conn = db.conn.lock().unwrap_or_else(|e| e.into_inner());
    conn.execute(
        "UPDATE outbound_messages SET sent_flag = 1, sent_time = ?1 WHERE id = ?2",
        rusqlite::params![now, id],
    )?;
    Ok(())
}

/// Record a failed send attempt. A permanent failure sets `sent_flag = 1`
/// (terminal — the row is never re-delivered); a transient one only
/// increments `retry_count`, leaving the backoff formula above to decide
/// when it's offered again.
pub fn mark_outbound_failed(db: &Db, id: i64, error_msg: &str, permanent: bool) -> DbResult<()> {
    let now = chrono::Utc::now().timestamp();
    let conn = db.conn.lock().unwrap_or_else(|e| e.into_inner());
    if permanent {
        conn.execute(
            "UPDATE outbound_messages
             SET sent_flag = 1, sent_time = ?1, retry_count = retry_count + 1, last_error = ?2
             WHERE id = ?3",
            rusqlite::params![now, error_msg, id],
        )?;
    } else {
        conn.execute(
            "UPDATE outbound_messages SET retry_count = retry_count + 1, last_error = ?1 WHERE id = ?2",
            rusqlite::params![error_msg, id],
        )?;
    }
    Ok(())
}

const ALLOWED_STATUS_FIELDS: &[&str] = &[
    "bot_name",
    "bot_rank",
    "bot_afk",
    "channel_name",
    "current_chat_users",
    "current_connected_users",
    "playlist_items",
    "current_media_title",
    "current_media_duration",
    "bot_start_time",
    "bot_connected",
];

/// `status.update` — merges allowed fields into the `current_status`
/// singleton's JSON blob; unknown fields are silently dropped.
pub fn update_status(db: &Db, status_data: &serde_json::Value) -> DbResult<()> {
    let now = chrono::Utc::now().timestamp();
    let conn = db.conn.lock().unwrap_or_else(|e| e.into_inner());

    let current_json: String = conn.query_row(
        "SELECT status_json FROM current_status WHERE id = 1",
        [],
        |r| r.get(0),
    )?;
    let mut current: serde_json::Value =
        serde_json::from_str(&current_json).unwrap_or_else(|_| serde_json::json!({}));
    let current_obj = current.as_object_mut().expect("status_json is always an object");

    if let Some(incoming) = status_data.as_object() {
        for field in ALLOWED_STATUS_FIELDS {
            if let Some(value) = incoming.get(*field) {
                current_obj.insert(field.to_string(), value.clone());
            }
        }
    }

    conn.execute(
        "UPDATE current_status SET status_json = ?1, updated_at = ?2 WHERE id = 1",
        rusqlite::params![serde_json::to_string(&current)?, now],
    )?;
    Ok(())
}

pub fn get_current_status(db: &Db) -> DbResult<serde_json::Value> {
    let conn = db.conn.lock().unwrap_or_else(|e| e.into_inner());
    let status_json: String = conn.query_row(
        "SELECT status_json FROM current_status WHERE id = 1",
        [],
        |r| r.get(0),
    )?;
    Ok(serde_json::from_str(&status_json)?)
}

/// Generate a new API token: 256 bits from the OS CSPRNG, URL-safe
/// base64-without-padding — matching `secrets.token_urlsafe(32)`'s entropy
/// and encoding exactly.
pub fn generate_api_token(db: &Db, description: &str) -> DbResult<String> {
    let mut bytes = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    let token = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes);

    let now = chrono::Utc::now().timestamp();
    let conn = db.conn.lock().unwrap_or_else(|e| e.into_inner());
    conn.execute(
        "INSERT INTO api_tokens (token, description, created_at, revoked_flag) VALUES (?1, ?2, ?3, 0)",
        rusqlite::params![token, description, now],
    )?;
    Ok(token)
}

pub fn validate_api_token(db: &Db, token: &str) -> DbResult<bool> {
    if token.is_empty() {
        return Ok(false);
    }
    let now = chrono::Utc::now().timestamp();
    let conn = db.conn.lock().unwrap_or_else(|e| e.into_inner());
    let valid: bool = conn
        .query_row(
            "SELECT 1 FROM api_tokens WHERE token = ?1 AND revoked_flag = 0",
            rusqlite::params![token],
            |_| Ok(true),
        )
        .unwrap_or(false);
    if valid {
        conn.execute(
            "UPDATE api_tokens SET last_used = ?1 WHERE token = ?2",
            rusqlite::params![now, token],
        )?;
    }
    Ok(valid)
}

/// Revoke by full token, or by an at-least-8-character prefix (`LIKE`
/// match); shorter inputs only match exactly. Returns the number revoked.
pub fn revoke_api_token(db: &Db, token: &str) -> DbResult<usize> {
    let conn = db.conn.lock().unwrap_or_else(|e| e.into_inner());
    let affected = if token.len() >= 8 {
        conn.execute(
            "UPDATE api_tokens SET revoked_flag = 1 WHERE token LIKE ?1 || '%' AND revoked_flag = 0",
            rusqlite::params![token],
        )?
    } else {
        conn.execute(
            "UPDATE api_tokens SET revoked_flag = 1 WHERE token = ?1 AND revoked_flag = 0",
            rusqlite::params![token],
        )?
    };
    Ok(affected)
}

/// List tokens, exposing only an 8-character prefix — never the full token.
pub fn list_api_tokens(db: &Db, include_revoked: bool) -> DbResult<Vec<serde_json::Value>> {
    let conn = db.conn.lock().unwrap_or_else(|e| e.into_inner());
    let sql = if include_revoked {
        "SELECT token, description, created_at, last_used, revoked_flag FROM api_tokens ORDER BY created_at DESC"
    } else {
        "SELECT token, description, created_at, last_used, revoked_flag FROM api_tokens
         WHERE revoked_flag = 0 ORDER BY created_at DESC"
    };
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map([], |r| {
            let token: String = r.get(0)?;
            Ok(serde_json::json!({
                "token_preview": token.chars().take(8).collect::<String>(),
                "description": r.get::<_, Option<String>>(1)?,
                "created_at": r.get::<_, i64>(2)?,
                "last_used": r.get::<_, Option<i64>>(3)?,
                "revoked": r.get::<_, i64>(4)? != 0,
            }))
        })?
        .filter_map(|r| r.ok())
        .collect();
    Ok(rows)
}

/// Periodic maintenance (spec §3 "Recovered from original source"): trims
/// `user_count_history`/`recent_chat`/old sent `outbound_messages`/old
/// revoked `api_tokens`, then reclaims space. Distinct from the KV TTL
/// sweeper (`kv::spawn_sweeper`), which runs on its own, tighter interval.
pub fn perform_maintenance(db: &Db) -> DbResult<Vec<String>> {
    let now = chrono::Utc::now().timestamp();
    let mut log = Vec::new();
    let conn = db.conn.lock().unwrap_or_else(|e| e.into_inner());

    let history_cutoff = now - HISTORY_RETENTION_DAYS * 86_400;
    let deleted_history = conn.execute(
        "DELETE FROM user_count_history WHERE timestamp < ?1",
        rusqlite::params![history_cutoff],
    )?;
    if deleted_history > 0 {
        log.push(format!("cleaned {deleted_history} old history records"));
    }

    let chat_cutoff = now - RECENT_CHAT_RETENTION_SECS;
    let deleted_chat = conn.execute(
        "DELETE FROM recent_chat WHERE timestamp < ?1",
        rusqlite::params![chat_cutoff],
    )?;
    if deleted_chat > 0 {
        log.push(format!("cleaned {deleted_chat} old recent_chat rows"));
    }

    let outbound_cutoff = now - OUTBOUND_SENT_RETENTION_DAYS * 86_400;
    let deleted_outbound = conn.execute(
        "DELETE FROM outbound_messages WHERE sent_flag = 1 AND sent_time < ?1",
        rusqlite::params![outbound_cutoff],
    )?;
    if deleted_outbound > 0 {
        log.push(format!("cleaned {deleted_outbound} old outbound messages"));
    }

    let token_cutoff = now - REVOKED_TOKEN_RETENTION_DAYS * 86_400;
    let deleted_tokens = conn.execute(
        "DELETE FROM api_tokens WHERE revoked_flag = 1 AND created_at < ?1",
        rusqlite::params![token_cutoff],
    )?;
    if deleted_tokens > 0 {
        log.push(format!("cleaned {deleted_tokens} old revoked tokens"));
    }

    conn.execute_batch("VACUUM; ANALYZE;")?;
    log.push("vacuum+analyze completed".to_string());

    tracing::info!(steps = ?log, "maintenance sweep completed");
    Ok(log)
}

/// Spawn the periodic maintenance task, distinct from and slower than the KV
/// TTL sweeper — mirrors the teacher's `retention.rs` background-loop idiom.
pub fn spawn_maintenance(
    db: std::sync::Arc<Db>,
    interval_secs: u64,
    shutdown: std::sync::Arc<std::sync::atomic::AtomicBool>,
) -> tokio::task::JoinHandle<()> {
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    tokio::spawn(async move {
        let interval = Duration::from_secs(interval_secs.max(1));
        loop {
            tokio::time::sleep(interval).await;
            if shutdown.load(Ordering::Relaxed) {
                break;
            }
            if let Err(e) = perform_maintenance(&db) {
                tracing::error!(error = %e, "maintenance sweep failed");
            }
        }
        tracing::info!("maintenance task shut down");
    })
}
