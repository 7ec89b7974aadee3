//! Migration engine (spec §4.F).
//!
//! `common/migrations.py` itself isn't present in the retrieval pack, so the
//! four-piece shape here (`MigrationManager` / `MigrationExecutor` /
//! `MigrationValidator` / the result and warning types) is reconstructed from
//! how `original_source/common/database_service.py` calls into it, not
//! ported line-for-line. The dry-run sentinel, checksum-as-warning, and
//! per-plugin-lock-with-timeout semantics come straight from spec §4.F/§9.

use crate::db::Db;
use crate::error::{DbError, DbResult};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;

const LOCK_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct MigrationFile {
    pub version: i64,
    pub name: String,
    pub up_sql: String,
    pub down_sql: String,
    pub checksum: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum WarningLevel {
    Error,
    Warning,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ValidationWarning {
    pub level: WarningLevel,
    pub message: String,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct MigrationResult {
    pub version: i64,
    pub success: bool,
    pub error_message: Option<String>,
    pub execution_time_ms: i64,
}

#[derive(Debug, Clone)]
pub struct LedgerEntry {
    pub version: i64,
    pub name: String,
    pub checksum: String,
    pub status: String,
}

/// Compute a checksum stable across line-ending differences.
pub fn compute_checksum(content: &str) -> String {
    let normalized = content.replace("\r\n", "\n");
    let mut hasher = Sha256::new();
    hasher.update(normalized.as_bytes());
    hex::encode(hasher.finalize())
}

fn parse_filename(filename: &str) -> Option<(i64, String)> {
    let stem = filename.strip_suffix(".sql")?;
    let (version_str, rest) = stem.split_once('_')?;
    let version: i64 = version_str.parse().ok()?;
    Some((version, rest.to_string()))
}

fn split_up_down(content: &str) -> DbResult<(String, String)> {
    let up_idx = content
        .find("-- UP")
        .ok_or_else(|| DbError::MigrationFailed("missing '-- UP' section".to_string()))?;
    let down_idx = content.find("-- DOWN");

    let (up_sql, down_sql) = match down_idx {
        Some(down_idx) if down_idx > up_idx => {
            let up = content[up_idx + "-- UP".len()..down_idx].trim().to_string();
            let down = content[down_idx + "-- DOWN".len()..].trim().to_string();
            (up, down)
        }
        _ => {
            let up = content[up_idx + "-- UP".len()..].trim().to_string();
            (up, String::new())
        }
    };
    Ok((up_sql, down_sql))
}

pub struct MigrationManager {
    plugin_root: PathBuf,
}

impl MigrationManager {
    pub fn new(plugin_root: impl Into<PathBuf>) -> Self {
        Self {
            plugin_root: plugin_root.into(),
        }
    }

    fn migrations_dir(&self, plugin: &str) -> PathBuf {
        self.plugin_root.join(plugin).join("migrations")
    }

    /// Discover and parse every `NNN_<name>.sql` file for a plugin, sorted
    /// ascending by version.
    pub fn discover_migrations(&self, plugin: &str) -> DbResult<Vec<MigrationFile>> {
        let dir = self.migrations_dir(plugin);
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut files = Vec::new();
        for entry in std::fs::read_dir(&dir).map_err(|e| DbError::Internal(e.to_string()))? {
            let entry = entry.map_err(|e| DbError::Internal(e.to_string()))?;
            let filename = entry.file_name().to_string_lossy().to_string();
            let Some((version, name)) = parse_filename(&filename) else {
                continue;
            };
            let content = std::fs::read_to_string(entry.path()).map_err(|e| DbError::Internal(e.to_string()))?;
            let checksum = compute_checksum(&content);
            let (up_sql, down_sql) = split_up_down(&content)?;
            files.push(MigrationFile {
                version,
                name,
                up_sql,
                down_sql,
                checksum,
            });
        }
        files.sort_by_key(|f| f.version);
        Ok(files)
    }

    pub fn find_migration<'a>(&self, files: &'a [MigrationFile], version: i64) -> Option<&'a MigrationFile> {
        files.iter().find(|f| f.version == version)
    }

    /// Migrations with version in `(current, target]`, ascending.
    pub fn pending(&self, files: &[MigrationFile], current: i64, target: i64) -> Vec<MigrationFile> {
        files
            .iter()
            .filter(|f| f.version > current && f.version <= target)
            .cloned()
            .collect()
    }

    /// Applied migrations with version in `(target, current]`, descending —
    /// the rollback candidates.
    pub fn rollback_candidates(&self, ledger: &[LedgerEntry], target: i64) -> Vec<LedgerEntry> {
        let mut out: Vec<LedgerEntry> = ledger
            .iter()
            .filter(|e| e.status == "applied" && e.version > target)
            .cloned()
            .collect();
        out.sort_by(|a, b| b.version.cmp(&a.version));
        out
    }
}

pub struct MigrationValidator;

impl MigrationValidator {
    /// Basic sanity checks before a batch is applied. An `Error`-level
    /// warning aborts the whole batch; `Warning`-level ones proceed.
    pub fn validate_migration(file: &MigrationFile) -> Vec<ValidationWarning> {
        let mut warnings = Vec::new();
        if file.up_sql.trim().is_empty() {
            warnings.push(ValidationWarning {
                level: WarningLevel::Error,
                message: format!("migration {} has an empty UP section", file.version),
            });
        }
        if file.down_sql.trim().is_empty() {
            warnings.push(ValidationWarning {
                level: WarningLevel::Warning,
                message: format!("migration {} has no DOWN section (rollback will be a no-op)", file.version),
            });
        }
        warnings
    }

    /// Compare a ledger entry's recorded checksum against the file's current
    /// checksum. A mismatch is a warning, never a blocker on apply.
    pub fn verify_checksum(entry: &LedgerEntry, file: Option<&MigrationFile>) -> Option<ValidationWarning> {
        match file {
            None => Some(ValidationWarning {
                level: WarningLevel::Warning,
                message: format!("migration {} is applied but its file is missing on disk", entry.version),
            }),
            Some(f) if f.checksum != entry.checksum => Some(ValidationWarning {
                level: WarningLevel::Warning,
                message: format!(
                    "migration {} checksum mismatch: file has changed since it was applied",
                    entry.version
                ),
            }),
            Some(_) => None,
        }
    }
}

pub struct MigrationExecutor;

impl MigrationExecutor {
    /// Apply one migration inside its own transaction. On `dry_run`, the
    /// transaction is deliberately rolled back after a successful UP+ledger
    /// write and reported as success — this is the Rust equivalent of the
    /// Python sentinel-exception pattern: we never let the rollback surface
    /// as a failure, because it's the intended outcome, not an error.
    pub fn apply_migration(
        db: &Db,
        file: &MigrationFile,
        plugin: &str,
        dry_run: bool,
        applied_by: Option<&str>,
    ) -> MigrationResult {
        let start = std::time::Instant::now();
        let mut conn = db.conn.lock().unwrap_or_else(|e| e.into_inner());
        let now = chrono::Utc::now().timestamp();

        let outcome: rusqlite::Result<()> = (|| {
            let tx = conn.transaction()?;
            tx.execute_batch(&file.up_sql)?;
            tx.execute(
                "INSERT INTO plugin_schema_migrations
                    (plugin_name, version, name, checksum, applied_at, applied_by, status, execution_time_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'applied', ?7)
                 ON CONFLICT(plugin_name, version) DO UPDATE SET
                    name=excluded.name, checksum=excluded.checksum, applied_at=excluded.applied_at,
                    applied_by=excluded.applied_by, status='applied', error_message=NULL,
                    execution_time_ms=excluded.execution_time_ms",
                rusqlite::params![
                    plugin,
                    file.version,
                    file.name,
                    file.checksum,
                    now,
                    applied_by,
                    start.elapsed().as_millis() as i64,
                ],
            )?;
            if dry_run {
                tx.rollback()?;
            } else {
                tx.commit()?;
            }
            Ok(())
        })();

        match outcome {
            Ok(()) => MigrationResult {
                version: file.version,
                success: true,
                error_message: None,
                execution_time_ms: start.elapsed().as_millis() as i64,
            },
            Err(e) => {
                let error_message = e.to_string();
                conn.execute(
                    "INSERT INTO plugin_schema_migrations
                        (plugin_name, version, name, checksum, applied_at, applied_by, status, error_message, execution_time_ms)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'failed', ?7, ?8)
                     ON CONFLICT(plugin_name, version) DO UPDATE SET status='failed', error_message=excluded.error_message",
                    rusqlite::params![
                        plugin,
                        file.version,
                        file.name,
                        file.checksum,
                        now,
                        applied_by,
                        error_message,
                        start.elapsed().as_millis() as i64,
                    ],
                )
                .ok();
                MigrationResult {
                    version: file.version,
                    success: false,
                    error_message: Some(error_message),
                    execution_time_ms: start.elapsed().as_millis() as i64,
                }
            }
        }
    }

    pub fn rollback_migration(
        db: &Db,
        file: &MigrationFile,
        plugin: &str,
        dry_run: bool,
        applied_by: Option<&str>,
    ) -> MigrationResult {
        let start = std::time::Instant::now();
        let mut conn = db.conn.lock().unwrap_or_else(|e| e.into_inner());

        let outcome: rusqlite::Result<()> = (|| {
            let tx = conn.transaction()?;
            if !file.down_sql.trim().is_empty() {
                tx.execute_batch(&file.down_sql)?;
            }
            tx.execute(
                "UPDATE plugin_schema_migrations SET status='rolled_back', applied_by=?1
                 WHERE plugin_name=?2 AND version=?3",
                rusqlite::params![applied_by, plugin, file.version],
            )?;
            if dry_run {
                tx.rollback()?;
            } else {
                tx.commit()?;
            }
            Ok(())
        })();

        match outcome {
            Ok(()) => MigrationResult {
                version: file.version,
                success: true,
                error_message: None,
                execution_time_ms: start.elapsed().as_millis() as i64,
            },
            Err(e) => MigrationResult {
                version: file.version,
                success: false,
                error_message: Some(e.to_string()),
                execution_time_ms: start.elapsed().as_millis() as i64,
            },
        }
    }
}

/// Current version for a plugin = max version where status = applied, else 0.
pub fn current_version(db: &Db, plugin: &str) -> DbResult<i64> {
    let conn = db.conn.lock().unwrap_or_else(|e| e.into_inner());
    let version: Option<i64> = conn
        .query_row(
            "SELECT MAX(version) FROM plugin_schema_migrations WHERE plugin_name = ?1 AND status = 'applied'",
            rusqlite::params![plugin],
            |r| r.get(0),
        )
        .unwrap_or(None);
    Ok(version.unwrap_or(0))
}

pub fn load_ledger(db: &Db, plugin: &str) -> DbResult<Vec<LedgerEntry>> {
    let conn = db.conn.lock().unwrap_or_else(|e| e.into_inner());
    let mut stmt = conn.prepare(
        "SELECT version, name, checksum, status FROM plugin_schema_migrations WHERE plugin_name = ?1",
    )?;
    let rows = stmt.query_map(rusqlite::params![plugin], |r| {
        Ok(LedgerEntry {
            version: r.get(0)?,
            name: r.get(1)?,
            checksum: r.get(2)?,
            status: r.get(3)?,
        })
    })?;
    Ok(rows.filter_map(|r| r.ok()).collect())
}

/// Per-plugin process-local locks, acquired with a 30s timeout. Concurrent
/// migration operations on different plugins proceed in parallel; same-
/// plugin operations serialize.
#[derive(Default)]
pub struct MigrationLocks {
    locks: std::sync::Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl MigrationLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, plugin: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks
            .entry(plugin.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    pub async fn acquire(&self, plugin: &str) -> DbResult<tokio::sync::OwnedMutexGuard<()>> {
        let lock = self.lock_for(plugin);
        match tokio::time::timeout(LOCK_TIMEOUT, lock.lock_owned()).await {
            Ok(guard) => Ok(guard),
            Err(_) => Err(DbError::LockTimeout(format!(
                "timed out acquiring migration lock for plugin '{plugin}'"
            ))),
        }
    }
}

pub fn plugin_root_path(root: &str) -> PathBuf {
    Path::new(root).to_path_buf()
}
