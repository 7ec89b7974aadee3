use rosey_db_bus::db::Db;
use rosey_db_bus::migrations::{
    compute_checksum, current_version, load_ledger, MigrationExecutor, MigrationLocks, MigrationManager,
    MigrationValidator, WarningLevel,
};

fn write_migration(dir: &std::path::Path, filename: &str, contents: &str) {
    std::fs::write(dir.join(filename), contents).unwrap();
}

fn plugin_dir(root: &tempfile::TempDir, plugin: &str) -> std::path::PathBuf {
    let dir = root.path().join(plugin).join("migrations");
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

#[test]
fn discover_parses_version_name_and_sections_in_order() {
    let root = tempfile::tempdir().unwrap();
    let dir = plugin_dir(&root, "trivia");
    write_migration(
        &dir,
        "002_add_index.sql",
        "-- UP\nCREATE INDEX idx ON trivia_scores(points);\n-- DOWN\nDROP INDEX idx;\n",
    );
    write_migration(
        &dir,
        "001_create_scores.sql",
        "-- UP\nCREATE TABLE trivia_scores(id INTEGER PRIMARY KEY, points INTEGER);\n-- DOWN\nDROP TABLE trivia_scores;\n",
    );

    let manager = MigrationManager::new(root.path());
    let files = manager.discover_migrations("trivia").unwrap();
    assert_eq!(files.len(), 2);
    assert_eq!(files[0].version, 1);
    assert_eq!(files[0].name, "create_scores");
    assert!(files[0].up_sql.contains("CREATE TABLE"));
    assert!(files[0].down_sql.contains("DROP TABLE"));
    assert_eq!(files[1].version, 2);
}

#[test]
fn discover_on_absent_directory_returns_empty() {
    let root = tempfile::tempdir().unwrap();
    let manager = MigrationManager::new(root.path());
    let files = manager.discover_migrations("nothing_here").unwrap();
    assert!(files.is_empty());
}

#[test]
fn checksum_is_stable_across_line_endings() {
    let unix = "-- UP\nSELECT 1;\n-- DOWN\nSELECT 1;\n";
    let windows = "-- UP\r\nSELECT 1;\r\n-- DOWN\r\nSELECT 1;\r\n";
    assert_eq!(compute_checksum(unix), compute_checksum(windows));
}

#[test]
fn validator_flags_empty_up_as_error_and_empty_down_as_warning() {
    let root = tempfile::tempdir().unwrap();
    let dir = plugin_dir(&root, "trivia");
    write_migration(&dir, "001_no_down.sql", "-- UP\nSELECT 1;\n");
    let manager = MigrationManager::new(root.path());
    let files = manager.discover_migrations("trivia").unwrap();
    let warnings = MigrationValidator::validate_migration(&files[0]);
    assert_eq!(warnings.len(), 1);
    assert_eq!(warnings[0].level, WarningLevel::Warning);
}

#[test]
fn apply_migration_commits_and_updates_ledger() {
    let root = tempfile::tempdir().unwrap();
    let dir = plugin_dir(&root, "trivia");
    write_migration(
        &dir,
        "001_create_scores.sql",
        "-- UP\nCREATE TABLE trivia_scores(id INTEGER PRIMARY KEY, points INTEGER);\n-- DOWN\nDROP TABLE trivia_scores;\n",
    );
    let manager = MigrationManager::new(root.path());
    let files = manager.discover_migrations("trivia").unwrap();
    let db = Db::in_memory().unwrap();

    let result = MigrationExecutor::apply_migration(&db, &files[0], "trivia", false, Some("tester"));
    assert!(result.success);
    assert_eq!(current_version(&db, "trivia").unwrap(), 1);

    let conn = db.conn.lock().unwrap();
    let exists: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='trivia_scores'",
            [],
            |r| r.get(0),
        )
        .unwrap();
    assert_eq!(exists, 1);
}

#[test]
fn dry_run_apply_rolls_back_but_reports_success() {
    let root = tempfile::tempdir().unwrap();
    let dir = plugin_dir(&root, "trivia");
    write_migration(
        &dir,
        "001_create_scores.sql",
        "-- UP\nCREATE TABLE trivia_scores(id INTEGER PRIMARY KEY);\n-- DOWN\nDROP TABLE trivia_scores;\n",
    );
    let manager = MigrationManager::new(root.path());
    let files = manager.discover_migrations("trivia").unwrap();
    let db = Db::in_memory().unwrap();

    let result = MigrationExecutor::apply_migration(&db, &files[0], "trivia", true, None);
    assert!(result.success);

    // The dry run must leave no trace: no table, no ledger entry, current
    // version unchanged.
    assert_eq!(current_version(&db, "trivia").unwrap(), 0);
    let conn = db.conn.lock().unwrap();
    let table_exists: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='trivia_scores'",
            [],
            |r| r.get(0),
        )
        .unwrap();
    assert_eq!(table_exists, 0);
    let ledger_rows: i64 = conn
        .query_row("SELECT COUNT(*) FROM plugin_schema_migrations", [], |r| r.get(0))
        .unwrap();
    assert_eq!(ledger_rows, 0);
}

#[test]
fn rollback_runs_down_sql_and_marks_ledger_rolled_back() {
    let root = tempfile::tempdir().unwrap();
    let dir = plugin_dir(&root, "trivia");
    write_migration(
        &dir,
        "001_create_scores.sql",
        "-- UP\nCREATE TABLE trivia_scores(id INTEGER PRIMARY KEY);\n-- DOWN\nDROP TABLE trivia_scores;\n",
    );
    let manager = MigrationManager::new(root.path());
    let files = manager.discover_migrations("trivia").unwrap();
    let db = Db::in_memory().unwrap();

    MigrationExecutor::apply_migration(&db, &files[0], "trivia", false, None);
    let result = MigrationExecutor::rollback_migration(&db, &files[0], "trivia", false, Some("tester"));
    assert!(result.success);

    let ledger = load_ledger(&db, "trivia").unwrap();
    assert_eq!(ledger.len(), 1);
    assert_eq!(ledger[0].status, "rolled_back");

    let conn = db.conn.lock().unwrap();
    let table_exists: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='trivia_scores'",
            [],
            |r| r.get(0),
        )
        .unwrap();
    assert_eq!(table_exists, 0);
}

#[test]
fn checksum_mismatch_against_ledger_is_a_warning_not_a_blocker() {
    let root = tempfile::tempdir().unwrap();
    let dir = plugin_dir(&root, "trivia");
    write_migration(&dir, "001_x.sql", "-- UP\nSELECT 1;\n-- DOWN\nSELECT 1;\n");
    let manager = MigrationManager::new(root.path());
    let files = manager.discover_migrations("trivia").unwrap();
    let db = Db::in_memory().unwrap();
    MigrationExecutor::apply_migration(&db, &files[0], "trivia", false, None);

    // Mutate the file on disk after it was applied.
    write_migration(&dir, "001_x.sql", "-- UP\nSELECT 2;\n-- DOWN\nSELECT 2;\n");
    let files_after = manager.discover_migrations("trivia").unwrap();
    let ledger = load_ledger(&db, "trivia").unwrap();

    let warning = MigrationValidator::verify_checksum(&ledger[0], Some(&files_after[0]));
    assert!(warning.is_some());
    assert_eq!(warning.unwrap().level, WarningLevel::Warning);
}

#[tokio::test]
async fn same_plugin_migration_locks_serialize() {
    let locks = std::sync::Arc::new(MigrationLocks::new());
    let guard = locks.acquire("trivia").await.unwrap();

    let locks2 = locks.clone();
    let handle = tokio::spawn(async move {
        let result = tokio::time::timeout(std::time::Duration::from_millis(50), locks2.acquire("trivia")).await;
        result.is_err()
    });
    assert!(handle.await.unwrap(), "second acquire should still be blocked");
    drop(guard);
}

#[tokio::test]
async fn different_plugin_migration_locks_proceed_independently() {
    let locks = MigrationLocks::new();
    let _a = locks.acquire("trivia").await.unwrap();
    let b = tokio::time::timeout(std::time::Duration::from_millis(50), locks.acquire("otherplugin")).await;
    assert!(b.is_ok());
}
