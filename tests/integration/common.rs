use rosey_db_bus::db::Db;
use rosey_db_bus::schema_registry::SchemaRegistry;

/// A fresh in-memory database with an empty, loaded schema cache. Every test
/// gets its own connection, so there's no cross-test contention to worry
/// about — unlike the teacher's on-disk `TestClient`, nothing needs cleanup.
pub struct TestDb {
    pub db: Db,
    pub registry: SchemaRegistry,
}

pub fn test_db() -> TestDb {
    let db = Db::in_memory().expect("in-memory db");
    let registry = SchemaRegistry::new();
    registry.load_cache(&db).expect("load empty cache");
    TestDb { db, registry }
}

impl TestDb {
    /// Register `plugin.table` with the given field tuples `(name, type,
    /// required)` and return the schema value used, for callers that want to
    /// assert on the registration outcome separately.
    pub fn register(&self, plugin: &str, table: &str, fields: serde_json::Value) -> bool {
        self.registry
            .register_schema(&self.db, plugin, table, &serde_json::json!({ "fields": fields }))
            .expect("register_schema")
    }
}
