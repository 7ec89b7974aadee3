//! Database service: the bus front-end (spec §4.G).
//!
//! Subscribes to every subject in the taxonomy (spec §6), dispatches into
//! `schema_registry`/`row_ops`/`kv`/`migrations`/`stats`, and owns the
//! background tasks (`kv` TTL sweeper, `stats` maintenance) described in
//! spec §9 — mirroring `database_service.py`'s `start()`/`stop()` pair,
//! which is already an idiomatic Rust service shape and so is kept rather
//! than recast.

use crate::bus::BusClient;
use crate::db::Db;
use crate::error::{ok_envelope, DbError, DbResult};
use crate::kv;
use crate::migrations::{MigrationExecutor, MigrationLocks, MigrationManager, MigrationValidator, WarningLevel};
use crate::row_ops;
use crate::schema_registry::SchemaRegistry;
use crate::stats;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub struct DatabaseService {
    bus: BusClient,
    db: Arc<Db>,
    registry: Arc<SchemaRegistry>,
    migrations: Arc<MigrationManager>,
    locks: Arc<MigrationLocks>,
    shutdown: Arc<AtomicBool>,
    kv_sweep_interval_secs: u64,
    maintenance_interval_secs: u64,
    tasks: std::sync::Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl DatabaseService {
    pub fn new(
        bus: BusClient,
        db: Arc<Db>,
        registry: Arc<SchemaRegistry>,
        plugin_root: impl Into<String>,
        kv_sweep_interval_secs: u64,
        maintenance_interval_secs: u64,
    ) -> DbResult<Self> {
        registry.load_cache(&db)?;
        Ok(Self {
            bus,
            db,
            registry,
            migrations: Arc::new(MigrationManager::new(plugin_root.into())),
            locks: Arc::new(MigrationLocks::new()),
            shutdown: Arc::new(AtomicBool::new(false)),
            kv_sweep_interval_secs,
            maintenance_interval_secs,
            tasks: std::sync::Mutex::new(Vec::new()),
        })
    }

    /// Subscribe to every subject in spec §6 and start the background
    /// sweeper/maintenance tasks.
    pub async fn start(&self) -> DbResult<()> {
        self.subscribe_pubsub().await?;
        self.subscribe_request_reply().await?;

        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        tasks.push(kv::spawn_sweeper(
            self.db.clone(),
            self.kv_sweep_interval_secs,
            self.shutdown.clone(),
        ));
        tasks.push(stats::spawn_maintenance(
            self.db.clone(),
            self.maintenance_interval_secs,
            self.shutdown.clone(),
        ));

        tracing::info!("database service subscribed and background tasks started");
        Ok(())
    }

    /// Cancel background tasks, await them, then close the bus. The caller
    /// is responsible for closing the database after this returns — mirrors
    /// `database_service.py`'s `finally:` shutdown order (bus, then db).
    pub async fn stop(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
        let handles: Vec<_> = self.tasks.lock().unwrap_or_else(|e| e.into_inner()).drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
        self.bus.close().await;
        tracing::info!("database service stopped");
    }

    async fn subscribe_pubsub(&self) -> DbResult<()> {
        let db = self.db.clone();
        self.bus
            .subscribe("rosey.db.user.joined", move |msg| {
                let db = db.clone();
                async move {
                    let Ok(payload) = msg.json() else { return };
                    if let Some(username) = payload.get("username").and_then(|v| v.as_str()) {
                        if let Err(e) = stats::user_joined(&db, username) {
                            tracing::error!(error = %e, "user.joined handler failed");
                        }
                    }
                }
            })
            .await?;

        let db = self.db.clone();
        self.bus
            .subscribe("rosey.db.user.left", move |msg| {
                let db = db.clone();
                async move {
                    let Ok(payload) = msg.json() else { return };
                    if let Some(username) = payload.get("username").and_then(|v| v.as_str()) {
                        if let Err(e) = stats::user_left(&db, username) {
                            tracing::error!(error = %e, "user.left handler failed");
                        }
                    }
                }
            })
            .await?;

        let db = self.db.clone();
        self.bus
            .subscribe("rosey.db.message.log", move |msg| {
                let db = db.clone();
                async move {
                    let Ok(payload) = msg.json() else { return };
                    let (Some(username), Some(message)) = (
                        payload.get("username").and_then(|v| v.as_str()),
                        payload.get("message").and_then(|v| v.as_str()),
                    ) else {
                        return;
                    };
                    if let Err(e) = stats::message_log(&db, username, message) {
                        tracing::error!(error = %e, "message.log handler failed");
                    }
                }
            })
            .await?;

        let db = self.db.clone();
        self.bus
            .subscribe("rosey.db.stats.user_count", move |msg| {
                let db = db.clone();
                async move {
                    let Ok(payload) = msg.json() else { return };
                    let (Some(chat), Some(connected)) = (
                        payload.get("chat_count").and_then(|v| v.as_i64()),
                        payload.get("connected_count").and_then(|v| v.as_i64()),
                    ) else {
                        return;
                    };
                    if let Err(e) = stats::log_user_count(&db, chat, connected) {
                        tracing::error!(error = %e, "stats.user_count handler failed");
                    }
                }
            })
            .await?;

        let db = self.db.clone();
        self.bus
            .subscribe("rosey.db.stats.high_water", move |msg| {
                let db = db.clone();
                async move {
                    let Ok(payload) = msg.json() else { return };
                    let Some(chat) = payload.get("chat_count").and_then(|v| v.as_i64()) else {
                        return;
                    };
                    let connected = payload.get("connected_count").and_then(|v| v.as_i64());
                    if let Err(e) = stats::update_high_water_mark(&db, chat, connected) {
                        tracing::error!(error = %e, "stats.high_water handler failed");
                    }
                }
            })
            .await?;

        let db = self.db.clone();
        self.bus
            .subscribe("rosey.db.status.update", move |msg| {
                let db = db.clone();
                async move {
                    let Ok(payload) = msg.json() else { return };
                    let status_data = payload.get("status_data").cloned().unwrap_or(serde_json::json!({}));
                    if let Err(e) = stats::update_status(&db, &status_data) {
                        tracing::error!(error = %e, "status.update handler failed");
                    }
                }
            })
            .await?;

        let db = self.db.clone();
        self.bus
            .subscribe("rosey.db.messages.outbound.mark_sent", move |msg| {
                let db = db.clone();
                async move {
                    let Ok(payload) = msg.json() else { return };
                    let Some(id) = payload.get("message_id").and_then(|v| v.as_i64()) else {
                        return;
                    };
                    if let Err(e) = stats::mark_outbound_sent(&db, id) {
                        tracing::error!(error = %e, "messages.outbound.mark_sent handler failed");
                    }
                }
            })
            .await?;

        let db = self.db.clone();
        self.bus
            .subscribe("rosey.db.messages.outbound.mark_failed", move |msg| {
                let db = db.clone();
                async move {
                    let Ok(payload) = msg.json() else { return };
                    let Some(id) = payload.get("message_id").and_then(|v| v.as_i64()) else {
                        return;
                    };
                    let error = payload.get("error").and_then(|v| v.as_str()).unwrap_or("");
                    let permanent = payload.get("permanent").and_then(|v| v.as_bool()).unwrap_or(false);
                    if let Err(e) = stats::mark_outbound_failed(&db, id, error, permanent) {
                        tracing::error!(error = %e, "messages.outbound.mark_failed handler failed");
                    }
                }
            })
            .await?;

        let db = self.db.clone();
        self.bus
            .subscribe("rosey.db.action.pm_command", move |msg| {
                let db = db.clone();
                async move {
                    let Ok(payload) = msg.json() else { return };
                    let Some(username) = payload.get("username").and_then(|v| v.as_str()) else {
                        return;
                    };
                    let details = payload.to_string();
                    if let Err(e) = stats::log_user_action(&db, username, "pm_command", Some(&details)) {
                        tracing::error!(error = %e, "action.pm_command handler failed");
                    }
                }
            })
            .await?;

        Ok(())
    }

    async fn subscribe_request_reply(&self) -> DbResult<()> {
        let db = self.db.clone();
        self.bus
            .subscribe("rosey.db.messages.outbound.get", move |msg| {
                let db = db.clone();
                async move {
                    let resp = match msg.json() {
                        Ok(req) => {
                            let limit = req.get("limit").and_then(|v| v.as_i64()).unwrap_or(20);
                            let max_retries = req.get("max_retries").and_then(|v| v.as_i64()).unwrap_or(3);
                            match stats::get_unsent_outbound(&db, limit, max_retries) {
                                Ok(rows) => ok_envelope(serde_json::json!({ "messages": rows })),
                                Err(e) => e.to_envelope(),
                            }
                        }
                        Err(e) => e.to_envelope(),
                    };
                    msg.respond(resp).await;
                }
            })
            .await?;

        let db = self.db.clone();
        self.bus
            .subscribe("rosey.db.stats.recent_chat.get", move |msg| {
                let db = db.clone();
                async move {
                    let resp = match msg.json() {
                        Ok(req) => {
                            let limit = req.get("limit").and_then(|v| v.as_i64()).unwrap_or(50);
                            match stats::get_recent_chat(&db, limit) {
                                Ok(rows) => ok_envelope(serde_json::json!({ "messages": rows })),
                                Err(e) => e.to_envelope(),
                            }
                        }
                        Err(e) => e.to_envelope(),
                    };
                    msg.respond(resp).await;
                }
            })
            .await?;

        let db = self.db.clone();
        self.bus
            .subscribe("rosey.db.query.channel_stats", move |msg| {
                let db = db.clone();
                async move {
                    let resp = match stats::channel_stats(&db, 10) {
                        Ok(v) => ok_envelope(v),
                        Err(e) => e.to_envelope(),
                    };
                    msg.respond(resp).await;
                }
            })
            .await?;

        let db = self.db.clone();
        self.bus
            .subscribe("rosey.db.query.user_stats", move |msg| {
                let db = db.clone();
                async move {
                    let resp = match msg.json().and_then(|req| {
                        let username = req
                            .get("username")
                            .and_then(|v| v.as_str())
                            .ok_or_else(|| DbError::MissingField("username".to_string()))?;
                        stats::get_user_stats(&db, username)
                    }) {
                        Ok(v) => ok_envelope(v),
                        Err(e) => e.to_envelope(),
                    };
                    msg.respond(resp).await;
                }
            })
            .await?;

        let db = self.db.clone();
        self.bus
            .subscribe("rosey.db.kv.set", move |msg| {
                let db = db.clone();
                async move {
                    let resp = dispatch_kv_set(&db, msg.json()).unwrap_or_else(|e| e.to_envelope());
                    msg.respond(resp).await;
                }
            })
            .await?;

        let db = self.db.clone();
        self.bus
            .subscribe("rosey.db.kv.get", move |msg| {
                let db = db.clone();
                async move {
                    let resp = match msg.json().and_then(|req| {
                        let plugin = require_str(&req, "plugin_name")?;
                        let key = require_str(&req, "key")?;
                        kv::kv_get(&db, plugin, key)
                    }) {
                        Ok(v) => ok_envelope(v),
                        Err(e) => e.to_envelope(),
                    };
                    msg.respond(resp).await;
                }
            })
            .await?;

        let db = self.db.clone();
        self.bus
            .subscribe("rosey.db.kv.delete", move |msg| {
                let db = db.clone();
                async move {
                    let resp = match msg.json().and_then(|req| {
                        let plugin = require_str(&req, "plugin_name")?;
                        let key = require_str(&req, "key")?;
                        kv::kv_delete(&db, plugin, key)
                    }) {
                        Ok(v) => ok_envelope(v),
                        Err(e) => e.to_envelope(),
                    };
                    msg.respond(resp).await;
                }
            })
            .await?;

        let db = self.db.clone();
        self.bus
            .subscribe("rosey.db.kv.list", move |msg| {
                let db = db.clone();
                async move {
                    let resp = match msg.json().and_then(|req| {
                        let plugin = require_str(&req, "plugin_name")?;
                        let prefix = req.get("prefix").and_then(|v| v.as_str());
                        let limit = req.get("limit").and_then(|v| v.as_i64());
                        kv::kv_list(&db, plugin, prefix, limit)
                    }) {
                        Ok(v) => ok_envelope(v),
                        Err(e) => e.to_envelope(),
                    };
                    msg.respond(resp).await;
                }
            })
            .await?;

        let db = self.db.clone();
        let registry = self.registry.clone();
        self.bus
            .subscribe("rosey.db.row.*.schema.register", move |msg| {
                let db = db.clone();
                let registry = registry.clone();
                async move {
                    let resp = dispatch_row(&msg.subject, "schema.register", |plugin, req| {
                        let table = require_str(req, "table")?;
                        let schema = req.get("schema").ok_or_else(|| DbError::MissingField("schema".to_string()))?;
                        registry.register_schema(&db, plugin, table, schema)?;
                        Ok(serde_json::json!({}))
                    }, msg.json())
                    .unwrap_or_else(|e| e.to_envelope());
                    msg.respond(resp).await;
                }
            })
            .await?;

        let db = self.db.clone();
        let registry = self.registry.clone();
        self.bus
            .subscribe("rosey.db.row.*.insert", move |msg| {
                let db = db.clone();
                let registry = registry.clone();
                async move {
                    let resp = dispatch_row(&msg.subject, "insert", |plugin, req| {
                        let table = require_str(req, "table")?;
                        let data = req.get("data").ok_or_else(|| DbError::MissingField("data".to_string()))?;
                        let mut conn = db.conn.lock().unwrap_or_else(|e| e.into_inner());
                        if let Some(rows) = data.as_array() {
                            row_ops::insert_bulk(&mut conn, &registry, plugin, table, rows)
                        } else {
                            row_ops::insert_one(&conn, &registry, plugin, table, data)
                        }
                    }, msg.json())
                    .unwrap_or_else(|e| e.to_envelope());
                    msg.respond(resp).await;
                }
            })
            .await?;

        let db = self.db.clone();
        let registry = self.registry.clone();
        self.bus
            .subscribe("rosey.db.row.*.select", move |msg| {
                let db = db.clone();
                let registry = registry.clone();
                async move {
                    let resp = dispatch_row(&msg.subject, "select", |plugin, req| {
                        let table = require_str(req, "table")?;
                        let id = require_i64(req, "id")?;
                        let conn = db.conn.lock().unwrap_or_else(|e| e.into_inner());
                        row_ops::select(&conn, &registry, plugin, table, id)
                    }, msg.json())
                    .unwrap_or_else(|e| e.to_envelope());
                    msg.respond(resp).await;
                }
            })
            .await?;

        let db = self.db.clone();
        let registry = self.registry.clone();
        self.bus
            .subscribe("rosey.db.row.*.delete", move |msg| {
                let db = db.clone();
                let registry = registry.clone();
                async move {
                    let resp = dispatch_row(&msg.subject, "delete", |plugin, req| {
                        let table = require_str(req, "table")?;
                        let id = require_i64(req, "id")?;
                        let conn = db.conn.lock().unwrap_or_else(|e| e.into_inner());
                        row_ops::delete(&conn, &registry, plugin, table, id)
                    }, msg.json())
                    .unwrap_or_else(|e| e.to_envelope());
                    msg.respond(resp).await;
                }
            })
            .await?;

        let db = self.db.clone();
        let registry = self.registry.clone();
        self.bus
            .subscribe("rosey.db.row.*.search", move |msg| {
                let db = db.clone();
                let registry = registry.clone();
                async move {
                    let resp = dispatch_row(&msg.subject, "search", |plugin, req| {
                        let table = require_str(req, "table")?;
                        let conn = db.conn.lock().unwrap_or_else(|e| e.into_inner());
                        row_ops::search(&conn, &registry, plugin, table, req)
                    }, msg.json())
                    .unwrap_or_else(|e| e.to_envelope());
                    msg.respond(resp).await;
                }
            })
            .await?;

        let db = self.db.clone();
        let registry = self.registry.clone();
        self.bus
            .subscribe("rosey.db.row.*.update", move |msg| {
                let db = db.clone();
                let registry = registry.clone();
                async move {
                    let resp = dispatch_row(&msg.subject, "update", |plugin, req| {
                        let table = require_str(req, "table")?;
                        let conn = db.conn.lock().unwrap_or_else(|e| e.into_inner());
                        if let (Some(id), Some(data)) = (req.get("id"), req.get("data")) {
                            let id = id.as_i64().ok_or_else(|| DbError::validation("id must be an integer"))?;
                            row_ops::update_by_id(&conn, &registry, plugin, table, id, data)
                        } else {
                            let filter = req.get("filter").ok_or_else(|| DbError::MissingField("filter".to_string()))?;
                            let patch = req.get("patch").ok_or_else(|| DbError::MissingField("patch".to_string()))?;
                            row_ops::update(&conn, &registry, plugin, table, filter, patch)
                        }
                    }, msg.json())
                    .unwrap_or_else(|e| e.to_envelope());
                    msg.respond(resp).await;
                }
            })
            .await?;

        let db = self.db.clone();
        let migrations = self.migrations.clone();
        let locks = self.locks.clone();
        self.bus
            .subscribe("rosey.db.migrate.*.apply", move |msg| {
                let db = db.clone();
                let migrations = migrations.clone();
                let locks = locks.clone();
                async move {
                    let resp = match extract_plugin(&msg.subject, "apply") {
                        Ok(plugin) => match msg.json() {
                            Ok(req) => handle_migrate_apply(&db, &migrations, &locks, plugin, &req)
                                .await
                                .unwrap_or_else(|e| e.to_envelope()),
                            Err(e) => e.to_envelope(),
                        },
                        Err(e) => e.to_envelope(),
                    };
                    msg.respond(resp).await;
                }
            })
            .await?;

        let db = self.db.clone();
        let migrations = self.migrations.clone();
        let locks = self.locks.clone();
        self.bus
            .subscribe("rosey.db.migrate.*.rollback", move |msg| {
                let db = db.clone();
                let migrations = migrations.clone();
                let locks = locks.clone();
                async move {
                    let resp = match extract_plugin(&msg.subject, "rollback") {
                        Ok(plugin) => match msg.json() {
                            Ok(req) => handle_migrate_rollback(&db, &migrations, &locks, plugin, &req)
                                .await
                                .unwrap_or_else(|e| e.to_envelope()),
                            Err(e) => e.to_envelope(),
                        },
                        Err(e) => e.to_envelope(),
                    };
                    msg.respond(resp).await;
                }
            })
            .await?;

        let db = self.db.clone();
        let migrations = self.migrations.clone();
        self.bus
            .subscribe("rosey.db.migrate.*.status", move |msg| {
                let db = db.clone();
                let migrations = migrations.clone();
                async move {
                    let resp = match extract_plugin(&msg.subject, "status") {
                        Ok(plugin) => handle_migrate_status(&db, &migrations, plugin).unwrap_or_else(|e| e.to_envelope()),
                        Err(e) => e.to_envelope(),
                    };
                    msg.respond(resp).await;
                }
            })
            .await?;

        Ok(())
    }
}

fn require_str<'a>(req: &'a serde_json::Value, field: &str) -> DbResult<&'a str> {
    req.get(field)
        .and_then(|v| v.as_str())
        .ok_or_else(|| DbError::MissingField(field.to_string()))
}

fn require_i64(req: &serde_json::Value, field: &str) -> DbResult<i64> {
    req.get(field)
        .and_then(|v| v.as_i64())
        .ok_or_else(|| DbError::MissingField(field.to_string()))
}

fn dispatch_kv_set(db: &Db, req: DbResult<serde_json::Value>) -> DbResult<serde_json::Value> {
    let req = req?;
    let plugin = require_str(&req, "plugin_name")?;
    let key = require_str(&req, "key")?;
    let value = req.get("value").ok_or_else(|| DbError::MissingField("value".to_string()))?;
    let ttl = req.get("ttl_seconds").and_then(|v| v.as_i64());
    kv::kv_set(db, plugin, key, value, ttl)?;
    Ok(ok_envelope(serde_json::json!({})))
}

/// Extract the plugin name at token position 4 of `rosey.db.row.{plugin}.<op>`
/// or `rosey.db.migrate.{plugin}.<op>` (spec §4.G wildcard dispatch).
fn extract_plugin<'a>(subject: &'a str, expected_op: &str) -> DbResult<&'a str> {
    let parts: Vec<&str> = subject.split('.').collect();
    if parts.len() < 5 {
        return Err(DbError::InvalidSubject(subject.to_string()));
    }
    let plugin = parts[3];
    if plugin.is_empty() {
        return Err(DbError::InvalidSubject(subject.to_string()));
    }
    let op = parts[4..].join(".");
    if !op.starts_with(expected_op) {
        return Err(DbError::InvalidSubject(subject.to_string()));
    }
    Ok(plugin)
}

fn dispatch_row(
    subject: &str,
    op: &str,
    handler: impl FnOnce(&str, &serde_json::Value) -> DbResult<serde_json::Value>,
    req: DbResult<serde_json::Value>,
) -> DbResult<serde_json::Value> {
    let plugin = extract_plugin(subject, op)?;
    let req = req?;
    handler(plugin, &req).map(ok_envelope)
}

async fn handle_migrate_apply(
    db: &Db,
    manager: &MigrationManager,
    locks: &MigrationLocks,
    plugin: &str,
    req: &serde_json::Value,
) -> DbResult<serde_json::Value> {
    let _guard = locks.acquire(plugin).await?;

    let files = manager.discover_migrations(plugin)?;
    let current = crate::migrations::current_version(db, plugin)?;
    let target = req
        .get("target_version")
        .or_else(|| req.get("version"))
        .and_then(|v| v.as_i64())
        .unwrap_or_else(|| files.iter().map(|f| f.version).max().unwrap_or(current));
    let dry_run = req.get("dry_run").and_then(|v| v.as_bool()).unwrap_or(false);
    let applied_by = req.get("applied_by").and_then(|v| v.as_str());

    let pending = manager.pending(&files, current, target);

    let mut warnings = Vec::new();
    for file in &pending {
        for w in MigrationValidator::validate_migration(file) {
            if matches!(w.level, WarningLevel::Error) {
                return Err(DbError::MigrationFailed(format!(
                    "migration {} failed validation: {}",
                    file.version, w.message
                )));
            }
            warnings.push(w.message);
        }
    }

    let mut applied = Vec::new();
    for file in &pending {
        let result = MigrationExecutor::apply_migration(db, file, plugin, dry_run, applied_by);
        let ok = result.success;
        applied.push(serde_json::json!({
            "version": result.version,
            "success": ok,
            "error_message": result.error_message,
            "execution_time_ms": result.execution_time_ms,
        }));
        if !ok {
            let current_version = crate::migrations::current_version(db, plugin)?;
            return Ok(ok_envelope(serde_json::json!({
                "applied": applied,
                "current_version": current_version,
                "warnings": warnings,
            })));
        }
    }

    let current_version = crate::migrations::current_version(db, plugin)?;
    Ok(ok_envelope(serde_json::json!({
        "applied": applied,
        "current_version": current_version,
        "warnings": warnings,
    })))
}

async fn handle_migrate_rollback(
    db: &Db,
    manager: &MigrationManager,
    locks: &MigrationLocks,
    plugin: &str,
    req: &serde_json::Value,
) -> DbResult<serde_json::Value> {
    let _guard = locks.acquire(plugin).await?;

    let files = manager.discover_migrations(plugin)?;
    let ledger = crate::migrations::load_ledger(db, plugin)?;
    let target = req.get("version").and_then(|v| v.as_i64()).unwrap_or(0);
    let dry_run = req.get("dry_run").and_then(|v| v.as_bool()).unwrap_or(false);
    let applied_by = req.get("applied_by").and_then(|v| v.as_str());

    let candidates = manager.rollback_candidates(&ledger, target);

    let mut rolled_back = Vec::new();
    for entry in &candidates {
        let Some(file) = manager.find_migration(&files, entry.version) else {
            return Err(DbError::RollbackFailed(format!(
                "migration {} file missing on disk, cannot roll back",
                entry.version
            )));
        };
        let result = MigrationExecutor::rollback_migration(db, file, plugin, dry_run, applied_by);
        let ok = result.success;
        rolled_back.push(serde_json::json!({
            "version": result.version,
            "success": ok,
            "error_message": result.error_message,
        }));
        if !ok {
            let current_version = crate::migrations::current_version(db, plugin)?;
            return Ok(ok_envelope(serde_json::json!({
                "rolled_back": rolled_back,
                "current_version": current_version,
            })));
        }
    }

    let current_version = crate::migrations::current_version(db, plugin)?;
    Ok(ok_envelope(serde_json::json!({
        "rolled_back": rolled_back,
        "current_version": current_version,
    })))
}

fn handle_migrate_status(db: &Db, manager: &MigrationManager, plugin: &str) -> DbResult<serde_json::Value> {
    let files = manager.discover_migrations(plugin)?;
    let ledger = crate::migrations::load_ledger(db, plugin)?;
    let current = crate::migrations::current_version(db, plugin)?;

    let mut warnings = Vec::new();
    let applied_migrations: Vec<serde_json::Value> = ledger
        .iter()
        .filter(|e| e.status == "applied")
        .map(|e| {
            let file = manager.find_migration(&files, e.version);
            if let Some(w) = MigrationValidator::verify_checksum(e, file) {
                warnings.push(w.message);
            }
            serde_json::json!({ "version": e.version, "name": e.name, "status": e.status })
        })
        .collect();

    let pending_migrations: Vec<serde_json::Value> = files
        .iter()
        .filter(|f| f.version > current)
        .map(|f| serde_json::json!({ "version": f.version, "name": f.name }))
        .collect();

    Ok(ok_envelope(serde_json::json!({
        "current_version": current,
        "applied_migrations": applied_migrations,
        "pending_migrations": pending_migrations,
        "warnings": warnings,
    })))
}


/// Convenience bootstrap matching `database_service.py`'s constructor: opens
/// the database, connects the bus, wires the service, but does not call
/// `start()` — callers decide when to go live.
pub async fn build(config: &crate::config::Config) -> DbResult<DatabaseService> {
    let db = Arc::new(Db::new(&config.db_path).map_err(DbError::from)?);
    let registry = Arc::new(SchemaRegistry::new());
    let bus = BusClient::connect(
        &config.nats_url,
        10,
        Duration::from_millis(500),
        Duration::from_secs(5),
    )
    .await?;

    DatabaseService::new(
        bus,
        db,
        registry,
        config.plugin_root.clone(),
        config.kv_sweep_interval_secs,
        config.maintenance_interval_secs,
    )
}
