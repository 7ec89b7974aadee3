//! Ancillary state writers (spec §4.H/§3): chat-user sessions, channel
//! high-water marks, outbound backoff eligibility, and API tokens — the
//! invariants spec §8 calls out explicitly (finalized sessions, monotone
//! high-water marks, terminal `sent_flag`).

use rosey_db_bus::db::Db;
use rosey_db_bus::stats;

#[test]
fn user_joined_creates_row_with_open_session() {
    let db = Db::in_memory().unwrap();
    stats::user_joined(&db, "alice").unwrap();
    let v = stats::get_user_stats(&db, "alice").unwrap();
    assert_eq!(v["username"], "alice");
    assert!(v["current_session_start"].is_i64());
    assert_eq!(v["total_chat_lines"], 0);
}

#[test]
fn user_left_finalizes_session_and_accumulates_uptime_never_subtracts() {
    let db = Db::in_memory().unwrap();
    stats::user_joined(&db, "alice").unwrap();
    stats::user_left(&db, "alice").unwrap();

    let v = stats::get_user_stats(&db, "alice").unwrap();
    assert!(v["current_session_start"].is_null());
    assert!(v["total_time_connected"].as_i64().unwrap() >= 0);
}

#[test]
fn user_left_without_open_session_is_a_noop() {
    let db = Db::in_memory().unwrap();
    stats::user_joined(&db, "alice").unwrap();
    stats::user_left(&db, "alice").unwrap();
    let before = stats::get_user_stats(&db, "alice").unwrap();

    // Duplicate leave under bus reordering/at-least-once delivery must not
    // touch total_time_connected again since current_session_start is null.
    stats::user_left(&db, "alice").unwrap();
    let after = stats::get_user_stats(&db, "alice").unwrap();
    assert_eq!(before, after);
}

#[test]
fn rejoin_after_leave_opens_a_fresh_session_without_losing_history() {
    let db = Db::in_memory().unwrap();
    stats::user_joined(&db, "alice").unwrap();
    stats::user_left(&db, "alice").unwrap();
    stats::user_joined(&db, "alice").unwrap();

    let v = stats::get_user_stats(&db, "alice").unwrap();
    assert!(v["current_session_start"].is_i64());
}

#[test]
fn close_all_sessions_finalizes_every_open_session() {
    let db = Db::in_memory().unwrap();
    stats::user_joined(&db, "alice").unwrap();
    stats::user_joined(&db, "bob").unwrap();
    stats::user_left(&db, "bob").unwrap();

    let closed = stats::close_all_sessions(&db).unwrap();
    assert_eq!(closed, 1);

    for user in ["alice", "bob"] {
        let v = stats::get_user_stats(&db, user).unwrap();
        assert!(v["current_session_start"].is_null(), "{user} should have no open session");
    }
}

#[test]
fn unknown_user_stats_reports_found_false() {
    let db = Db::in_memory().unwrap();
    let v = stats::get_user_stats(&db, "nobody").unwrap();
    assert_eq!(v, serde_json::json!({ "found": false }));
}

#[test]
fn message_log_increments_chat_lines_and_appends_recent_chat() {
    let db = Db::in_memory().unwrap();
    stats::user_joined(&db, "alice").unwrap();
    stats::message_log(&db, "alice", "hello").unwrap();
    stats::message_log(&db, "alice", "world").unwrap();

    let v = stats::get_user_stats(&db, "alice").unwrap();
    assert_eq!(v["total_chat_lines"], 2);

    let recent = stats::get_recent_chat(&db, 10).unwrap();
    assert_eq!(recent.len(), 2);
    assert_eq!(recent[0]["message"], "hello");
    assert_eq!(recent[1]["message"], "world");
}

#[test]
fn high_water_mark_is_monotone_non_decreasing() {
    let db = Db::in_memory().unwrap();
    stats::update_high_water_mark(&db, 10, Some(5)).unwrap();
    stats::update_high_water_mark(&db, 3, Some(2)).unwrap();

    let channel = stats::channel_stats(&db, 5).unwrap();
    assert_eq!(channel["high_water_mark"], 10);
    assert_eq!(channel["high_water_connected"], 5);

    stats::update_high_water_mark(&db, 42, Some(99)).unwrap();
    let channel = stats::channel_stats(&db, 5).unwrap();
    assert_eq!(channel["high_water_mark"], 42);
    assert_eq!(channel["high_water_connected"], 99);
}

#[test]
fn high_water_connected_is_optional_and_independent_of_chat_count() {
    let db = Db::in_memory().unwrap();
    stats::update_high_water_mark(&db, 10, None).unwrap();
    let channel = stats::channel_stats(&db, 5).unwrap();
    assert_eq!(channel["high_water_mark"], 10);
    assert_eq!(channel["high_water_connected"], 0);
}

#[test]
fn outbound_backoff_formula_gates_retry_eligibility() {
    let db = Db::in_memory().unwrap();
    let id = stats::enqueue_outbound(&db, "hi").unwrap();

    // Freshly enqueued with retry_count=0 is immediately eligible.
    let eligible = stats::get_unsent_outbound(&db, 10, 3).unwrap();
    assert!(eligible.iter().any(|r| r["id"] == id));

    // Bump retry_count and push enqueue_time far enough in the past that
    // the 2^retry_count * 60s backoff hasn't elapsed yet.
    {
        let conn = db.conn.lock().unwrap();
        let now = chrono::Utc::now().timestamp();
        conn.execute(
            "UPDATE outbound_messages SET retry_count = 1, enqueue_time = ?1 WHERE id = ?2",
            rusqlite::params![now - 10, id],
        )
        .unwrap();
    }
    let eligible = stats::get_unsent_outbound(&db, 10, 3).unwrap();
    assert!(!eligible.iter().any(|r| r["id"] == id), "backoff window (120s) has not elapsed");

    // Push enqueue_time far enough in the past that the window has elapsed.
    {
        let conn = db.conn.lock().unwrap();
        let now = chrono::Utc::now().timestamp();
        conn.execute(
            "UPDATE outbound_messages SET enqueue_time = ?1 WHERE id = ?2",
            rusqlite::params![now - 1000, id],
        )
        .unwrap();
    }
    let eligible = stats::get_unsent_outbound(&db, 10, 3).unwrap();
    assert!(eligible.iter().any(|r| r["id"] == id));
}

#[test]
fn outbound_exhausted_retries_are_never_offered_again() {
    let db = Db::in_memory().unwrap();
    let id = stats::enqueue_outbound(&db, "hi").unwrap();
    {
        let conn = db.conn.lock().unwrap();
        conn.execute(
            "UPDATE outbound_messages SET retry_count = 3 WHERE id = ?1",
            rusqlite::params![id],
        )
        .unwrap();
    }
    let eligible = stats::get_unsent_outbound(&db, 10, 3).unwrap();
    assert!(!eligible.iter().any(|r| r["id"] == id));
}

#[test]
fn mark_outbound_sent_is_terminal() {
    let db = Db::in_memory().unwrap();
    let id = stats::enqueue_outbound(&db, "hi").unwrap();
    stats::mark_outbound_sent(&db, id).unwrap();

    let eligible = stats::get_unsent_outbound(&db, 10, 3).unwrap();
    assert!(!eligible.iter().any(|r| r["id"] == id));
}

#[test]
fn mark_outbound_failed_permanent_is_terminal_transient_is_not() {
    let db = Db::in_memory().unwrap();
    let transient_id = stats::enqueue_outbound(&db, "a").unwrap();
    let permanent_id = stats::enqueue_outbound(&db, "b").unwrap();

    stats::mark_outbound_failed(&db, transient_id, "rate limited", false).unwrap();
    stats::mark_outbound_failed(&db, permanent_id, "permission denied", true).unwrap();

    let v = stats::get_user_stats(&db, "nobody"); // sanity: db still usable
    assert!(v.is_ok());

    let conn = db.conn.lock().unwrap();
    let (sent_flag, retry_count): (i64, i64) = conn
        .query_row(
            "SELECT sent_flag, retry_count FROM outbound_messages WHERE id = ?1",
            rusqlite::params![transient_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .unwrap();
    assert_eq!(sent_flag, 0);
    assert_eq!(retry_count, 1);

    let sent_flag: i64 = conn
        .query_row(
            "SELECT sent_flag FROM outbound_messages WHERE id = ?1",
            rusqlite::params![permanent_id],
            |r| r.get(0),
        )
        .unwrap();
    assert_eq!(sent_flag, 1);
}

#[test]
fn status_update_merges_allowed_fields_and_drops_unknown_ones() {
    let db = Db::in_memory().unwrap();
    stats::update_status(
        &db,
        &serde_json::json!({ "bot_name": "rosey", "totally_unknown": "nope" }),
    )
    .unwrap();

    let status = stats::get_current_status(&db).unwrap();
    assert_eq!(status["bot_name"], "rosey");
    assert!(status.get("totally_unknown").is_none());

    // A second update only touches the fields it names; prior ones persist.
    stats::update_status(&db, &serde_json::json!({ "bot_afk": true })).unwrap();
    let status = stats::get_current_status(&db).unwrap();
    assert_eq!(status["bot_name"], "rosey");
    assert_eq!(status["bot_afk"], true);
}

#[test]
fn api_token_lifecycle_generate_validate_revoke() {
    let db = Db::in_memory().unwrap();
    let token = stats::generate_api_token(&db, "test token").unwrap();
    assert!(token.len() >= 32, "256-bit token should encode to well over 32 chars");

    assert!(stats::validate_api_token(&db, &token).unwrap());

    let revoked = stats::revoke_api_token(&db, &token).unwrap();
    assert_eq!(revoked, 1);
    assert!(!stats::validate_api_token(&db, &token).unwrap());
}

#[test]
fn api_token_revocation_by_prefix_matches_only_long_enough_prefixes() {
    let db = Db::in_memory().unwrap();
    let token = stats::generate_api_token(&db, "d").unwrap();
    let prefix = &token[..8];

    let revoked = stats::revoke_api_token(&db, prefix).unwrap();
    assert_eq!(revoked, 1);
    assert!(!stats::validate_api_token(&db, &token).unwrap());
}

#[test]
fn api_token_list_never_exposes_the_full_token() {
    let db = Db::in_memory().unwrap();
    let token = stats::generate_api_token(&db, "d").unwrap();
    let listed = stats::list_api_tokens(&db, true).unwrap();
    assert_eq!(listed.len(), 1);
    let preview = listed[0]["token_preview"].as_str().unwrap();
    assert_eq!(preview.len(), 8);
    assert_ne!(preview, token);
}

#[test]
fn list_api_tokens_excludes_revoked_unless_requested() {
    let db = Db::in_memory().unwrap();
    let token = stats::generate_api_token(&db, "d").unwrap();
    stats::revoke_api_token(&db, &token).unwrap();

    assert_eq!(stats::list_api_tokens(&db, false).unwrap().len(), 0);
    assert_eq!(stats::list_api_tokens(&db, true).unwrap().len(), 1);
}

#[test]
fn perform_maintenance_trims_old_history_and_sent_outbound() {
    let db = Db::in_memory().unwrap();
    stats::log_user_count(&db, 1, 1).unwrap();
    {
        let conn = db.conn.lock().unwrap();
        conn.execute("UPDATE user_count_history SET timestamp = 0", []).unwrap();
    }
    let log = stats::perform_maintenance(&db).unwrap();
    assert!(log.iter().any(|l| l.contains("history")));

    let conn = db.conn.lock().unwrap();
    let remaining: i64 = conn.query_row("SELECT COUNT(*) FROM user_count_history", [], |r| r.get(0)).unwrap();
    assert_eq!(remaining, 0);
}
