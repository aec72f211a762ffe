use crate::memtable::MemTableEntry;
use crate::schema::{DataType, Row, Value};

use super::super::SstableWriter;

pub fn test_columns() -> Vec<(String, DataType)> {
    vec![
        ("id".to_string(), DataType::Int64),
        ("name".to_string(), DataType::String),
        ("score".to_string(), DataType::Int32),
    ]
}

pub fn entry(row_id: u64, name: &str, score: i32) -> MemTableEntry {
    let data: Row = [
        ("id".to_string(), Value::Int64(row_id as i64)),
        ("name".to_string(), Value::Str(name.into())),
        ("score".to_string(), Value::Int32(score)),
    ]
    .into_iter()
    .collect();
    MemTableEntry {
        row_id,
        data,
        timestamp: 1,
        seq: row_id,
        deleted: false,
    }
}

pub fn tombstone(row_id: u64) -> MemTableEntry {
    MemTableEntry {
        row_id,
        data: Row::new(),
        timestamp: 1,
        seq: row_id,
        deleted: true,
    }
}

pub fn writer(base: &std::path::Path) -> SstableWriter {
    SstableWriter::new(base, "t", test_columns())
}
