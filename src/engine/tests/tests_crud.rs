use tempfile::TempDir;

use crate::schema::Value;

use super::super::{Engine, EngineError};
use super::helpers::{direct_config, lsm_config, row, standard_schema};

#[tokio::test]
async fn test_insert_query_round_trip() {
    let tmp = TempDir::new().unwrap();
    let engine = Engine::open(lsm_config(tmp.path())).await.unwrap();
    engine.create_table(standard_schema(), false).await.unwrap();

    engine.insert("t", row("a", 10), None).await.unwrap();
    engine.insert("t", row("b", 20), None).await.unwrap();
    engine.insert("t", row("c", 10), None).await.unwrap();

    // score = 10, ordered by id: a then c.
    let query = engine
        .query("t")
        .where_eq("score", Value::Int32(10))
        .order_by_asc("id");
    let rows = engine.select(&query).await.unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0]["name"], Value::Str("a".into()));
    assert_eq!(rows[1]["name"], Value::Str("c".into()));

    let count_query = engine.query("t").where_eq("score", Value::Int32(10));
    assert_eq!(engine.count("t", Some(&count_query)).await.unwrap(), 2);

    // Auto-increment ids start at 1; id 2 is the second insert.
    let found = engine
        .find_by_id("t", "id", &Value::Int64(2))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(found["name"], Value::Str("b".into()));

    engine.close().await.unwrap();
}

#[tokio::test]
async fn test_empty_table_boundaries() {
    let tmp = TempDir::new().unwrap();
    let engine = Engine::open(lsm_config(tmp.path())).await.unwrap();
    engine.create_table(standard_schema(), false).await.unwrap();

    let all = engine.query("t");
    assert!(engine.select(&all).await.unwrap().is_empty());
    assert_eq!(engine.count("t", None).await.unwrap(), 0);
    assert!(!engine.exists("t", &engine.query("t")).await.unwrap());

    engine.close().await.unwrap();
}

#[tokio::test]
async fn test_update_and_delete() {
    let tmp = TempDir::new().unwrap();
    let engine = Engine::open(lsm_config(tmp.path())).await.unwrap();
    engine.create_table(standard_schema(), false).await.unwrap();

    let row_id = engine.insert("t", row("a", 10), None).await.unwrap();

    assert!(
        engine
            .update("t", row_id, serde_json::json!({ "score": 99 }), None)
            .await
            .unwrap()
    );
    let updated = engine
        .find_by_id("t", "id", &Value::Int64(1))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(updated["score"], Value::Int32(99));
    assert_eq!(updated["name"], Value::Str("a".into()));

    // The index follows the updated value.
    let by_new_score = engine.query("t").where_eq("score", Value::Int32(99));
    assert_eq!(engine.select(&by_new_score).await.unwrap().len(), 1);

    assert!(engine.delete("t", row_id, None).await.unwrap());
    assert!(!engine.delete("t", row_id, None).await.unwrap());
    assert_eq!(engine.count("t", None).await.unwrap(), 0);
    assert!(
        engine
            .find_by_id("t", "id", &Value::Int64(1))
            .await
            .unwrap()
            .is_none()
    );

    // Updating a deleted row reports absence.
    assert!(
        !engine
            .update("t", row_id, serde_json::json!({ "score": 1 }), None)
            .await
            .unwrap()
    );

    engine.close().await.unwrap();
}

#[tokio::test]
async fn test_failure_semantics() {
    let tmp = TempDir::new().unwrap();
    let engine = Engine::open(lsm_config(tmp.path())).await.unwrap();
    engine.create_table(standard_schema(), false).await.unwrap();

    // Unknown table.
    assert!(matches!(
        engine.insert("ghost", row("a", 1), None).await,
        Err(EngineError::TableNotFound(_))
    ));
    assert!(matches!(
        engine.get_table_info("ghost").await,
        Err(EngineError::TableNotFound(_))
    ));

    // Existing table without if_not_exists.
    assert!(matches!(
        engine.create_table(standard_schema(), false).await,
        Err(EngineError::TableExists(_))
    ));
    // With if_not_exists the schema is adopted and no error raised.
    assert!(!engine.create_table(standard_schema(), true).await.unwrap());

    // Unknown column.
    assert!(matches!(
        engine
            .insert("t", serde_json::json!({ "ghost": 1 }), None)
            .await,
        Err(EngineError::SchemaViolation(_))
    ));

    // Drop of a missing table.
    assert!(matches!(
        engine.drop_table("ghost", false).await,
        Err(EngineError::TableNotFound(_))
    ));
    assert!(!engine.drop_table("ghost", true).await.unwrap());

    engine.close().await.unwrap();
}

#[tokio::test]
async fn test_non_null_and_unique_constraints() {
    let tmp = TempDir::new().unwrap();
    let engine = Engine::open(lsm_config(tmp.path())).await.unwrap();

    let schema = crate::schema::TableSchema::new(
        "users",
        vec![
            crate::schema::Column::new("id", crate::schema::DataType::Int64)
                .primary_key()
                .auto_increment(),
            crate::schema::Column::new("handle", crate::schema::DataType::String)
                .not_null()
                .unique(),
            crate::schema::Column::new("level", crate::schema::DataType::Int32)
                .not_null()
                .default_value(Value::Int32(0)),
        ],
        None,
    )
    .unwrap();
    engine.create_table(schema, false).await.unwrap();

    // Null in a non-null column with no default.
    assert!(matches!(
        engine.insert("users", serde_json::json!({}), None).await,
        Err(EngineError::SchemaViolation(_))
    ));

    // The default fills the missing non-null column.
    engine
        .insert("users", serde_json::json!({ "handle": "tak" }), None)
        .await
        .unwrap();

    // Duplicate unique value.
    assert!(matches!(
        engine
            .insert("users", serde_json::json!({ "handle": "tak" }), None)
            .await,
        Err(EngineError::SchemaViolation(_))
    ));

    engine.close().await.unwrap();
}

#[tokio::test]
async fn test_direct_flush_backend_has_same_semantics() {
    let tmp = TempDir::new().unwrap();
    let engine = Engine::open(direct_config(tmp.path())).await.unwrap();
    engine.create_table(standard_schema(), false).await.unwrap();

    engine.insert("t", row("a", 10), None).await.unwrap();
    let row_id = engine.insert("t", row("b", 20), None).await.unwrap();
    engine.insert("t", row("c", 10), None).await.unwrap();

    let query = engine
        .query("t")
        .where_eq("score", Value::Int32(10))
        .order_by_asc("id");
    let rows = engine.select(&query).await.unwrap();
    assert_eq!(rows.len(), 2);

    assert!(engine.delete("t", row_id, None).await.unwrap());
    assert_eq!(engine.count("t", None).await.unwrap(), 2);

    // Backend rows survive a restart.
    engine.close().await.unwrap();
    let reopened = Engine::open(direct_config(tmp.path())).await.unwrap();
    reopened.create_table(standard_schema(), true).await.unwrap();
    assert_eq!(reopened.count("t", None).await.unwrap(), 2);
    assert!(
        reopened
            .find_one("t", "name", &Value::Str("b".into()))
            .await
            .unwrap()
            .is_none()
    );
    reopened.close().await.unwrap();
}

#[tokio::test]
async fn test_insert_many_and_query_cache() {
    let tmp = TempDir::new().unwrap();
    let engine = Engine::open(lsm_config(tmp.path())).await.unwrap();
    engine.create_table(standard_schema(), false).await.unwrap();

    let ids = engine
        .insert_many(
            "t",
            vec![row("a", 1), row("b", 2), row("c", 3)],
            None,
        )
        .await
        .unwrap();
    assert_eq!(ids.len(), 3);

    let query = engine.query("t").order_by_asc("id");
    assert_eq!(engine.select(&query).await.unwrap().len(), 3);

    // A write invalidates the cached result.
    engine.insert("t", row("d", 4), None).await.unwrap();
    assert_eq!(engine.select(&query).await.unwrap().len(), 4);

    engine.close().await.unwrap();
}
