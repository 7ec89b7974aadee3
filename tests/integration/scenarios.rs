//! The literal scenarios walked through end-to-end, one test per scenario,
//! each exercising the same module boundaries a `rosey.db.*` request would
//! cross but calling straight into the functions rather than through a bus.

use crate::common::test_db;
use rosey_db_bus::db::Db;
use rosey_db_bus::row_ops;
use rosey_db_bus::schema_registry::SchemaRegistry;
use std::sync::Arc;

#[test]
fn scenario_register_schema_and_round_trip() {
    let t = test_db();
    t.register(
        "quotes",
        "q",
        serde_json::json!([
            { "name": "text", "type": "text", "required": true },
            { "name": "author", "type": "string" },
        ]),
    );

    let conn = t.db.conn.lock().unwrap();
    let inserted =
        row_ops::insert_one(&conn, &t.registry, "quotes", "q", &serde_json::json!({ "text": "hi", "author": "a" }))
            .unwrap();
    let id = inserted["id"].as_i64().unwrap();

    let fetched = row_ops::select(&conn, &t.registry, "quotes", "q", id).unwrap();
    assert_eq!(fetched["data"]["text"], "hi");
    assert_eq!(fetched["data"]["author"], "a");
    assert!(fetched["data"]["id"].is_i64());
    let created_at = fetched["data"]["created_at"].as_str().unwrap();
    assert!(chrono::DateTime::parse_from_rfc3339(created_at).is_ok());
}

#[test]
fn scenario_atomic_increment_under_concurrency() {
    let db = Arc::new(Db::in_memory().unwrap());
    let registry = Arc::new(SchemaRegistry::new());
    registry.load_cache(&db).unwrap();
    registry
        .register_schema(
            &db,
            "trivia",
            "scores",
            &serde_json::json!({
                "fields": [
                    { "name": "score", "type": "integer", "required": true },
                    { "name": "status", "type": "string", "required": true },
                ]
            }),
        )
        .unwrap();

    let id = {
        let conn = db.conn.lock().unwrap();
        row_ops::insert_one(
            &conn,
            &registry,
            "trivia",
            "scores",
            &serde_json::json!({ "score": 0, "status": "active" }),
        )
        .unwrap()["id"]
            .as_i64()
            .unwrap()
    };

    let handles: Vec<_> = (0..100)
        .map(|_| {
            let db = db.clone();
            let registry = registry.clone();
            std::thread::spawn(move || {
                let conn = db.conn.lock().unwrap();
                row_ops::update(
                    &conn,
                    &registry,
                    "trivia",
                    "scores",
                    &serde_json::json!({ "id": id }),
                    &serde_json::json!({ "score": { "$inc": 1 } }),
                )
                .unwrap();
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    let conn = db.conn.lock().unwrap();
    let fetched = row_ops::select(&conn, &registry, "trivia", "scores", id).unwrap();
    assert_eq!(fetched["data"]["score"], 100);
}

#[test]
fn scenario_kv_ttl_expiry() {
    use rosey_db_bus::kv;
    let t = test_db();
    kv::kv_set(&t.db, "p", "k", &serde_json::json!("v"), Some(2)).unwrap();
    let immediate = kv::kv_get(&t.db, "p", "k").unwrap();
    assert_eq!(immediate, serde_json::json!({ "exists": true, "value": "v" }));

    // Simulate "after 3s" by moving the row's expiry into the past rather
    // than sleeping in the test.
    {
        let conn = t.db.conn.lock().unwrap();
        conn.execute("UPDATE plugin_kv SET expires_at = 0 WHERE plugin_name='p' AND key='k'", [])
            .unwrap();
    }
    assert_eq!(kv::kv_get(&t.db, "p", "k").unwrap(), serde_json::json!({ "exists": false }));
}

#[test]
fn scenario_migration_dry_run_leaves_current_version_at_zero() {
    use rosey_db_bus::migrations::{current_version, MigrationExecutor, MigrationManager};

    let root = tempfile::tempdir().unwrap();
    let dir = root.path().join("trivia").join("migrations");
    std::fs::create_dir_all(&dir).unwrap();
    for v in 1..=3 {
        std::fs::write(
            dir.join(format!("{v:03}_step.sql")),
            format!("-- UP\nCREATE TABLE t{v}(id INTEGER);\n-- DOWN\nDROP TABLE t{v};\n"),
        )
        .unwrap();
    }

    let manager = MigrationManager::new(root.path());
    let files = manager.discover_migrations("trivia").unwrap();
    let db = Db::in_memory().unwrap();

    let mut results = Vec::new();
    for file in &files {
        results.push(MigrationExecutor::apply_migration(&db, file, "trivia", true, None));
    }
    assert!(results.iter().all(|r| r.success));
    assert_eq!(current_version(&db, "trivia").unwrap(), 0);

    let pending = manager.pending(&files, current_version(&db, "trivia").unwrap(), 3);
    assert_eq!(pending.len(), 3);
}

#[test]
fn scenario_migration_apply_then_rollback() {
    use rosey_db_bus::migrations::{current_version, load_ledger, MigrationExecutor, MigrationManager};

    let root = tempfile::tempdir().unwrap();
    let dir = root.path().join("trivia").join("migrations");
    std::fs::create_dir_all(&dir).unwrap();
    for v in 1..=3 {
        std::fs::write(
            dir.join(format!("{v:03}_step.sql")),
            format!("-- UP\nCREATE TABLE t{v}(id INTEGER);\n-- DOWN\nDROP TABLE t{v};\n"),
        )
        .unwrap();
    }

    let manager = MigrationManager::new(root.path());
    let files = manager.discover_migrations("trivia").unwrap();
    let db = Db::in_memory().unwrap();

    for file in &files {
        let result = MigrationExecutor::apply_migration(&db, file, "trivia", false, None);
        assert!(result.success);
    }
    assert_eq!(current_version(&db, "trivia").unwrap(), 3);

    let ledger = load_ledger(&db, "trivia").unwrap();
    let candidates = manager.rollback_candidates(&ledger, 1);
    assert_eq!(candidates.len(), 2);
    for entry in &candidates {
        let file = manager.find_migration(&files, entry.version).unwrap();
        let result = MigrationExecutor::rollback_migration(&db, file, "trivia", false, None);
        assert!(result.success);
    }

    let ledger = load_ledger(&db, "trivia").unwrap();
    let v2 = ledger.iter().find(|e| e.version == 2).unwrap();
    let v3 = ledger.iter().find(|e| e.version == 3).unwrap();
    assert_eq!(v2.status, "rolled_back");
    assert_eq!(v3.status, "rolled_back");
    assert_eq!(current_version(&db, "trivia").unwrap(), 1);

    let conn = db.conn.lock().unwrap();
    for (v, should_exist) in [(1, true), (2, false), (3, false)] {
        let exists: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name=?1",
                [format!("t{v}")],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(exists == 1, should_exist, "table t{v} existence mismatch");
    }
}

#[test]
fn scenario_validation_error_shape_mentions_the_offending_field() {
    let t = test_db();
    t.register(
        "test",
        "items",
        serde_json::json!([{ "name": "name", "type": "string", "required": true }]),
    );

    let conn = t.db.conn.lock().unwrap();
    let err = row_ops::insert_one(&conn, &t.registry, "test", "items", &serde_json::json!({ "unknown": 1 }))
        .unwrap_err();
    let envelope = err.to_envelope();
    assert_eq!(envelope["success"], false);
    assert_eq!(envelope["error"]["code"], "VALIDATION_ERROR");
    assert!(envelope["error"]["message"].as_str().unwrap().contains("unknown"));
}
