use super::*;
use crate::schema::{Column, DataType};

fn schema() -> TableSchema {
    TableSchema::new(
        "t",
        vec![
            Column::new("id", DataType::Int64).primary_key().auto_increment(),
            Column::new("name", DataType::String),
            Column::new("score", DataType::Int32).default_value(Value::Int32(0)),
        ],
        None,
    )
    .unwrap()
}

fn named_row(name: &str, id: i64) -> Row {
    [
        ("id".to_string(), Value::Int64(id)),
        ("name".to_string(), Value::Str(name.into())),
    ]
    .into_iter()
    .collect()
}

#[test]
fn test_upsert_fills_defaults_and_keeps_invariants() {
    let mut table = Table::new(schema());
    let row_id = table.allocate_row_id();
    table.upsert_row(row_id, &named_row("a", 1));

    assert_eq!(table.row_count(), 1);
    assert!(table.check_invariants());

    // Missing score fell back to the column default.
    assert_eq!(table.cell(row_id, "score"), Some(Value::Int32(0)));

    // Upsert of the same row id replaces cells in place.
    table.upsert_row(
        row_id,
        &[("score".to_string(), Value::Int32(9))].into_iter().collect(),
    );
    assert_eq!(table.row_count(), 1);
    assert_eq!(table.cell(row_id, "score"), Some(Value::Int32(9)));
    assert_eq!(table.cell(row_id, "name"), Some(Value::Str("a".into())));
}

#[test]
fn test_row_ids_are_never_reused() {
    let mut table = Table::new(schema());
    let first = table.allocate_row_id();
    table.upsert_row(first, &named_row("a", 1));
    table.remove_row(first).unwrap();

    let second = table.allocate_row_id();
    assert!(second > first);
    assert!(table.get_row(first).is_none());
    assert!(matches!(
        table.remove_row(first),
        Err(TableError::RowNotFound { .. })
    ));
}

#[test]
fn test_remove_keeps_positions_aligned() {
    let mut table = Table::new(schema());
    let ids: Vec<u64> = (0..4)
        .map(|i| {
            let row_id = table.allocate_row_id();
            table.upsert_row(row_id, &named_row(&format!("r{i}"), i as i64));
            row_id
        })
        .collect();

    table.remove_row(ids[1]).unwrap();
    assert_eq!(table.row_count(), 3);
    assert!(table.check_invariants());

    assert_eq!(table.get_row(ids[0]).unwrap()["name"], Value::Str("r0".into()));
    assert_eq!(table.get_row(ids[2]).unwrap()["name"], Value::Str("r2".into()));
    assert_eq!(table.get_row(ids[3]).unwrap()["name"], Value::Str("r3".into()));

    let with_ids = table.rows_with_ids();
    assert_eq!(with_ids.len(), 3);
    assert_eq!(with_ids[1].0, ids[2]);
}

#[test]
fn test_counters_observe_external_values() {
    let mut table = Table::new(schema());
    table.observe_row_id(41);
    assert_eq!(table.allocate_row_id(), 42);

    assert_eq!(table.allocate_auto_increment(), 1);
    table.observe_auto_increment(10);
    assert_eq!(table.allocate_auto_increment(), 11);
}

#[test]
fn test_column_entries_for_index_build() {
    let mut table = Table::new(schema());
    for i in 0..3 {
        let row_id = table.allocate_row_id();
        table.upsert_row(row_id, &named_row(&format!("r{i}"), i as i64));
    }
    let entries = table.column_entries("name").unwrap();
    assert_eq!(entries.len(), 3);
    assert_eq!(entries[2].0, Value::Str("r2".into()));

    assert!(matches!(
        table.column_entries("ghost"),
        Err(TableError::UnknownColumn { .. })
    ));
}

#[test]
fn test_file_round_trip() {
    let mut table = Table::new(schema());
    for i in 0..5 {
        let row_id = table.allocate_row_id();
        table.upsert_row(row_id, &named_row(&format!("r{i}"), i as i64 + 1));
    }

    let bytes = table.to_file_bytes().unwrap();
    let restored = Table::from_file_bytes(&bytes).unwrap();

    assert_eq!(restored.schema.name, "t");
    assert_eq!(restored.row_count(), 5);
    assert!(restored.check_invariants());
    let rows = restored.rows();
    assert_eq!(rows[3]["name"], Value::Str("r3".into()));
    assert_eq!(rows[3]["id"], Value::Int64(4));
}

#[test]
fn test_file_rejects_corruption() {
    let mut table = Table::new(schema());
    let row_id = table.allocate_row_id();
    table.upsert_row(row_id, &named_row("a", 1));

    let mut bytes = table.to_file_bytes().unwrap();
    let last = bytes.len() - 1;
    bytes[last] ^= 0x01;
    assert!(matches!(
        Table::from_file_bytes(&bytes),
        Err(TableError::Codec(CodecError::Integrity(_)))
    ));
}
