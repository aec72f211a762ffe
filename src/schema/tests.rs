use super::*;

#[test]
fn test_type_tags_round_trip() {
    for dt in [
        DataType::Int32,
        DataType::Int64,
        DataType::Float32,
        DataType::Float64,
        DataType::String,
        DataType::Bytes,
        DataType::Bool,
        DataType::Timestamp,
        DataType::Json,
        DataType::Null,
        DataType::Array,
    ] {
        assert_eq!(DataType::from_tag(dt.tag()).unwrap(), dt);
    }
    assert!(DataType::from_tag(0).is_err());
    assert!(DataType::from_tag(12).is_err());
}

#[test]
fn test_numeric_total_order_mixes_widths() {
    assert_eq!(
        Value::Int32(3).cmp_total(&Value::Int64(3)),
        Ordering::Equal
    );
    assert_eq!(
        Value::Int64(2).cmp_total(&Value::Float64(2.5)),
        Ordering::Less
    );
    assert_eq!(
        Value::Timestamp(1000).cmp_total(&Value::Int64(999)),
        Ordering::Greater
    );
}

#[test]
fn test_loose_cmp_coerces_strings() {
    assert_eq!(
        Value::Int64(10).loose_cmp(&Value::Str("10".into())),
        Some(Ordering::Equal)
    );
    assert_eq!(
        Value::Str("2.5".into()).loose_cmp(&Value::Float64(3.0)),
        Some(Ordering::Less)
    );
    // Non-numeric string cannot be coerced.
    assert_eq!(Value::Int64(10).loose_cmp(&Value::Str("abc".into())), None);
    // Null never compares.
    assert_eq!(Value::Null.loose_cmp(&Value::Null), None);
}

#[test]
fn test_json_round_trip() {
    let row: Row = [
        ("id".to_string(), Value::Int64(42)),
        ("name".to_string(), Value::Str("takao".into())),
        ("active".to_string(), Value::Bool(true)),
        ("blob".to_string(), Value::Bytes(vec![1, 2, 3])),
        (
            "meta".to_string(),
            Value::Json(serde_json::json!({"k": [1, 2]})),
        ),
    ]
    .into_iter()
    .collect();

    let json = row_to_json(&row);
    let back = row_from_json(&json);

    assert_eq!(back["id"], Value::Int64(42));
    assert_eq!(back["name"], Value::Str("takao".into()));
    assert_eq!(back["active"], Value::Bool(true));
    // Bytes degrade to base64 text without schema knowledge.
    assert_eq!(back["blob"], Value::Str("AQID".into()));
    assert!(matches!(back["meta"], Value::Json(_)));

    // With schema knowledge the bytes come back intact.
    let typed = Value::from_json(&json["blob"], DataType::Bytes).unwrap();
    assert_eq!(typed, Value::Bytes(vec![1, 2, 3]));
}

#[test]
fn test_schema_rejects_two_primary_keys() {
    let err = TableSchema::new(
        "t",
        vec![
            Column::new("a", DataType::Int64).primary_key(),
            Column::new("b", DataType::Int64).primary_key(),
        ],
        None,
    )
    .unwrap_err();
    assert!(matches!(err, SchemaError::Invalid(_)));
}

#[test]
fn test_schema_rejects_auto_increment_on_string() {
    let err = TableSchema::new(
        "t",
        vec![Column::new("a", DataType::String).auto_increment()],
        None,
    )
    .unwrap_err();
    assert!(matches!(err, SchemaError::Invalid(_)));
}

#[test]
fn test_schema_collects_index_columns() {
    let schema = TableSchema::new(
        "t",
        vec![
            Column::new("id", DataType::Int64).primary_key().auto_increment(),
            Column::new("name", DataType::String),
            Column::new("score", DataType::Int32).indexed(),
        ],
        None,
    )
    .unwrap();
    assert_eq!(schema.primary_key.as_deref(), Some("id"));
    assert_eq!(schema.index_columns, vec!["id".to_string(), "score".to_string()]);
}

#[test]
fn test_schema_partition_key_must_exist() {
    let err = TableSchema::new(
        "t",
        vec![Column::new("id", DataType::Int64)],
        Some("tenant".into()),
    )
    .unwrap_err();
    assert!(matches!(err, SchemaError::Invalid(_)));
}
