//! Core schema bootstrap and the shared `Db` handle.
//!
//! Mirrors the teacher's `db.rs`: a `Mutex<Connection>` behind a thin struct,
//! `PRAGMA`s set once at open, `CREATE TABLE IF NOT EXISTS` plus idempotent
//! `ALTER TABLE ... ADD COLUMN` (`.ok()`-guarded) for additive evolution, and
//! a singleton-row seed pattern. Tables here are exactly the entities in
//! spec §3 that the database service itself owns (everything except the
//! plugin-owned row tables, which `schema_registry` materializes
//! dynamically).

use rusqlite::Connection;
use std::sync::Mutex;

pub struct Db {
    pub conn: Mutex<Connection>,
}

impl Db {
    pub fn new(path: &str) -> rusqlite::Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        let db = Db {
            conn: Mutex::new(conn),
        };
        db.migrate()?;
        Ok(db)
    }

    pub fn in_memory() -> rusqlite::Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        let db = Db {
            conn: Mutex::new(conn),
        };
        db.migrate()?;
        Ok(db)
    }

    fn migrate(&self) -> rusqlite::Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS user_stats (
                username TEXT PRIMARY KEY,
                first_seen INTEGER NOT NULL,
                last_seen INTEGER NOT NULL,
                total_chat_lines INTEGER NOT NULL DEFAULT 0,
                total_time_connected INTEGER NOT NULL DEFAULT 0,
                current_session_start INTEGER
            );

            CREATE TABLE IF NOT EXISTS channel_stats (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                max_users INTEGER NOT NULL DEFAULT 0,
                max_users_at INTEGER,
                max_connected INTEGER NOT NULL DEFAULT 0,
                max_connected_at INTEGER,
                last_updated INTEGER
            );

            CREATE TABLE IF NOT EXISTS user_count_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp INTEGER NOT NULL,
                chat_users INTEGER NOT NULL,
                connected_users INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_user_count_history_ts ON user_count_history(timestamp);

            CREATE TABLE IF NOT EXISTS recent_chat (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp INTEGER NOT NULL,
                username TEXT NOT NULL,
                message TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_recent_chat_ts ON recent_chat(timestamp);

            CREATE TABLE IF NOT EXISTS user_actions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp INTEGER NOT NULL,
                username TEXT NOT NULL,
                action_type TEXT NOT NULL,
                details TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_user_actions_ts ON user_actions(timestamp);

            CREATE TABLE IF NOT EXISTS outbound_messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                enqueue_time INTEGER NOT NULL,
                message TEXT NOT NULL,
                sent_flag INTEGER NOT NULL DEFAULT 0,
                sent_time INTEGER,
                retry_count INTEGER NOT NULL DEFAULT 0,
                last_error TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_outbound_sent_flag ON outbound_messages(sent_flag);

            CREATE TABLE IF NOT EXISTS api_tokens (
                token TEXT PRIMARY KEY,
                description TEXT,
                created_at INTEGER NOT NULL,
                last_used INTEGER,
                revoked_flag INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS current_status (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                status_json TEXT NOT NULL DEFAULT '{}',
                updated_at INTEGER
            );

            CREATE TABLE IF NOT EXISTS plugin_table_schemas (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                plugin_name TEXT NOT NULL,
                table_name TEXT NOT NULL,
                version INTEGER NOT NULL,
                schema_json TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                UNIQUE(plugin_name, table_name)
            );

            CREATE TABLE IF NOT EXISTS plugin_kv (
                plugin_name TEXT NOT NULL,
                key TEXT NOT NULL,
                value_json TEXT NOT NULL,
                expires_at INTEGER,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (plugin_name, key)
            );
            CREATE INDEX IF NOT EXISTS idx_plugin_kv_expires ON plugin_kv(expires_at);

            CREATE TABLE IF NOT EXISTS plugin_schema_migrations (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                plugin_name TEXT NOT NULL,
                version INTEGER NOT NULL,
                name TEXT NOT NULL,
                checksum TEXT NOT NULL,
                applied_at INTEGER NOT NULL,
                applied_by TEXT,
                status TEXT NOT NULL,
                error_message TEXT,
                execution_time_ms INTEGER,
                UNIQUE(plugin_name, version)
            );
            ",
        )?;

        // Additive, idempotent evolution — same `.ok()`-guarded ALTER idiom
        // the teacher uses for columns added after the initial release.
        conn.execute_batch("ALTER TABLE api_tokens ADD COLUMN description TEXT;")
            .ok();

        // Seed the channel_stats singleton row if absent.
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM channel_stats", [], |r| r.get(0))
            .unwrap_or(0);
        if count == 0 {
            conn.execute(
                "INSERT INTO channel_stats (id, max_users, max_connected) VALUES (1, 0, 0)",
                [],
            )
            .ok();
        }

        // Seed the current_status singleton row if absent.
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM current_status", [], |r| r.get(0))
            .unwrap_or(0);
        if count == 0 {
            conn.execute(
                "INSERT INTO current_status (id, status_json) VALUES (1, '{}')",
                [],
            )
            .ok();
        }

        Ok(())
    }
}
