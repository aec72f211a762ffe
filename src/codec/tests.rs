use super::*;

fn sample_columns() -> Vec<Column> {
    vec![
        Column::new("id", DataType::Int64).primary_key(),
        Column::new("name", DataType::String).not_null(),
        Column::new("score", DataType::Int32)
            .indexed()
            .default_value(Value::Int32(0)),
        Column::new("ratio", DataType::Float64),
        Column::new("active", DataType::Bool),
        Column::new("seen_at", DataType::Timestamp),
        Column::new("payload", DataType::Bytes),
        Column::new("meta", DataType::Json),
        Column::new("tags", DataType::Array),
    ]
}

#[test]
fn test_value_round_trip_all_types() {
    let cases = vec![
        (Value::Int32(-7), DataType::Int32),
        (Value::Int64(1 << 40), DataType::Int64),
        (Value::Float32(1.5), DataType::Float32),
        (Value::Float64(-2.25), DataType::Float64),
        (Value::Str("héllo".into()), DataType::String),
        (Value::Bytes(vec![0, 255, 3]), DataType::Bytes),
        (Value::Bool(true), DataType::Bool),
        (Value::Timestamp(1_700_000_000_000), DataType::Timestamp),
        (
            Value::Json(serde_json::json!({"a": {"b": [1, 2]}})),
            DataType::Json,
        ),
        (
            Value::Array(vec![Value::Int64(1), Value::Str("x".into())]),
            DataType::Array,
        ),
        (Value::Null, DataType::String),
    ];
    for (value, data_type) in cases {
        let bytes = encode_value(&value, data_type).unwrap();
        let decoded = decode_value(&mut Cursor::new(&bytes), data_type).unwrap();
        assert_eq!(decoded, value, "round trip failed for {data_type:?}");
    }
}

#[test]
fn test_column_block_compresses_repetitive_data() {
    let values: Vec<Value> = (0..500).map(|_| Value::Str("same-string".into())).collect();
    let block = encode_column(&values, DataType::String, true).unwrap();
    assert_eq!(block[0], 1, "repetitive block should be compressed");

    let decoded = decode_column(&block, DataType::String).unwrap();
    assert_eq!(decoded, values);
}

#[test]
fn test_column_block_skips_useless_compression() {
    let values = vec![Value::Int64(1), Value::Int64(2)];
    let block = encode_column(&values, DataType::Int64, true).unwrap();
    assert_eq!(block[0], 0, "tiny block must stay uncompressed");
    assert_eq!(decode_column(&block, DataType::Int64).unwrap(), values);
}

#[test]
fn test_point_decode_skips_preceding_values() {
    let values: Vec<Value> = (0..100)
        .map(|i| {
            if i % 7 == 0 {
                Value::Null
            } else {
                Value::Str(format!("row-{i}"))
            }
        })
        .collect();
    let block = encode_column(&values, DataType::String, true).unwrap();

    for idx in [0usize, 6, 7, 55, 99] {
        let got = decode_column_value_at(&block, DataType::String, idx).unwrap();
        assert_eq!(got.as_ref(), Some(&values[idx]));
    }
    assert!(
        decode_column_value_at(&block, DataType::String, 100)
            .unwrap()
            .is_none()
    );
}

#[test]
fn test_header_round_trip_preserves_flags_and_defaults() {
    let columns = sample_columns();
    let header = encode_header("guild_settings", &columns, 42).unwrap();
    let decoded = decode_header(&header).unwrap();

    assert_eq!(decoded.table_name, "guild_settings");
    assert_eq!(decoded.row_count, 42);
    assert_eq!(decoded.columns.len(), columns.len());
    let score = &decoded.columns[2];
    assert_eq!(score.name, "score");
    assert!(score.indexed);
    assert_eq!(score.default, Some(Value::Int32(0)));
    let name = &decoded.columns[1];
    assert!(!name.nullable);
}

#[test]
fn test_table_file_round_trip() {
    let columns = vec![
        Column::new("id", DataType::Int64),
        Column::new("name", DataType::String),
    ];
    let data = vec![
        vec![Value::Int64(1), Value::Int64(2), Value::Int64(3)],
        vec![
            Value::Str("a".into()),
            Value::Null,
            Value::Str("c".into()),
        ],
    ];
    let file = encode_table_file("t", &columns, &data, 3).unwrap();
    let decoded = decode_table_file(&file).unwrap();

    assert_eq!(decoded.table_name, "t");
    assert_eq!(decoded.row_count, 3);
    assert_eq!(decoded.data, data);
}

#[test]
fn test_table_file_rejects_flipped_byte() {
    let columns = vec![Column::new("id", DataType::Int64)];
    let data = vec![vec![Value::Int64(9), Value::Int64(10)]];
    let mut file = encode_table_file("t", &columns, &data, 2).unwrap();

    // Corrupt one byte inside the body; the checksum must catch it.
    let last = file.len() - 1;
    file[last] ^= 0xFF;
    let err = decode_table_file(&file).unwrap_err();
    assert!(matches!(err, CodecError::Integrity(_)));
}

#[test]
fn test_table_file_rejects_bad_magic() {
    let columns = vec![Column::new("id", DataType::Int64)];
    let data = vec![vec![Value::Int64(1)]];
    let mut file = encode_table_file("t", &columns, &data, 1).unwrap();

    // Overwrite magic and re-stamp the checksum so only the magic is wrong.
    file[CHECKSUM_LEN] = b'X';
    let checksum = compute_checksum(&file[CHECKSUM_LEN..]);
    file[..CHECKSUM_LEN].copy_from_slice(&checksum);

    let err = decode_table_file(&file).unwrap_err();
    assert!(matches!(err, CodecError::Integrity(_)));
}
