use crate::common::test_db;
use rosey_db_bus::error::DbError;
use rosey_db_bus::schema_registry::{physical_table_name, SchemaRegistry};

#[test]
fn register_schema_materializes_table_and_caches_it() {
    let t = test_db();
    let created = t.register(
        "trivia",
        "scores",
        serde_json::json!([
            { "name": "username", "type": "string", "required": true },
            { "name": "points", "type": "integer" },
        ]),
    );
    assert!(created);

    let schema = t.registry.get_schema("trivia", "scores").expect("cached schema");
    assert_eq!(schema.fields.len(), 2);

    let conn = t.db.conn.lock().unwrap();
    let full_table = physical_table_name("trivia", "scores");
    let count: i64 = conn
        .query_row(&format!("SELECT COUNT(*) FROM {full_table}"), [], |r| r.get(0))
        .expect("physical table exists");
    assert_eq!(count, 0);
}

#[test]
fn re_registering_same_table_is_a_no_op() {
    let t = test_db();
    let fields = serde_json::json!([{ "name": "value", "type": "integer" }]);
    assert!(t.register("pluginx", "counters", fields.clone()));
    assert!(!t.register("pluginx", "counters", fields));
}

#[test]
fn reserved_field_names_are_rejected() {
    let t = test_db();
    let err = t
        .registry
        .register_schema(
            &t.db,
            "pluginx",
            "widgets",
            &serde_json::json!({ "fields": [{ "name": "created_at", "type": "string" }] }),
        )
        .unwrap_err();
    assert!(matches!(err, DbError::Validation(_)));
}

#[test]
fn invalid_table_name_is_rejected() {
    let err = SchemaRegistry::validate_table_name("Bad-Name").unwrap_err();
    assert!(matches!(err, DbError::Validation(_)));
    assert!(SchemaRegistry::validate_table_name("valid_name_99").is_ok());
}

#[test]
fn duplicate_field_names_are_rejected() {
    let t = test_db();
    let err = t
        .registry
        .register_schema(
            &t.db,
            "pluginx",
            "dupes",
            &serde_json::json!({
                "fields": [
                    { "name": "a", "type": "string" },
                    { "name": "a", "type": "integer" },
                ]
            }),
        )
        .unwrap_err();
    assert!(matches!(err, DbError::Validation(_)));
}

#[test]
fn unknown_field_type_is_rejected() {
    let t = test_db();
    let err = t
        .registry
        .register_schema(
            &t.db,
            "pluginx",
            "badtype",
            &serde_json::json!({ "fields": [{ "name": "a", "type": "money" }] }),
        )
        .unwrap_err();
    assert!(matches!(err, DbError::Validation(_)));
}

#[test]
fn delete_schema_drops_table_and_cache_entry() {
    let t = test_db();
    t.register("pluginx", "gone", serde_json::json!([{ "name": "a", "type": "string" }]));
    assert!(t.registry.delete_schema(&t.db, "pluginx", "gone").unwrap());
    assert!(t.registry.get_schema("pluginx", "gone").is_none());
    // Idempotent: deleting again reports nothing to delete.
    assert!(!t.registry.delete_schema(&t.db, "pluginx", "gone").unwrap());
}

#[test]
fn list_schemas_is_scoped_per_plugin() {
    let t = test_db();
    t.register("a", "one", serde_json::json!([{ "name": "x", "type": "string" }]));
    t.register("b", "two", serde_json::json!([{ "name": "y", "type": "string" }]));
    let listed = t.registry.list_schemas("a");
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0]["table_name"], "one");
}
