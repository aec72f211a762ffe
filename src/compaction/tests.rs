use std::sync::Arc;

use tempfile::TempDir;

use super::*;
use crate::schema::{DataType, Value};
use crate::sstable::SstableMetadata;

fn columns() -> Vec<(String, DataType)> {
    vec![
        ("id".to_string(), DataType::Int64),
        ("name".to_string(), DataType::String),
    ]
}

fn entry(row_id: u64, name: &str, seq: u64) -> MemTableEntry {
    let data: Row = [
        ("id".to_string(), Value::Int64(row_id as i64)),
        ("name".to_string(), Value::Str(name.into())),
    ]
    .into_iter()
    .collect();
    MemTableEntry {
        row_id,
        data,
        timestamp: 1,
        seq,
        deleted: false,
    }
}

fn tombstone(row_id: u64, seq: u64) -> MemTableEntry {
    MemTableEntry {
        row_id,
        data: Row::new(),
        timestamp: 1,
        seq,
        deleted: true,
    }
}

fn write_segment(
    registry: &Arc<SstableRegistry>,
    level: u8,
    entries: Vec<MemTableEntry>,
) -> SstableMetadata {
    let writer = SstableWriter::new(registry.base_path(), "t", columns());
    let meta = writer.write(entries, level).unwrap().unwrap();
    registry.register(meta.clone()).unwrap();
    // Creation timestamps are millisecond-granular; space the segments out so
    // registry order matches write order deterministically.
    std::thread::sleep(std::time::Duration::from_millis(3));
    meta
}

fn registry(tmp: &TempDir) -> Arc<SstableRegistry> {
    let registry = Arc::new(SstableRegistry::new(tmp.path()));
    registry.load().unwrap();
    registry
}

#[tokio::test]
async fn test_no_merge_below_threshold() {
    let tmp = TempDir::new().unwrap();
    let registry = registry(&tmp);
    for i in 0..3u64 {
        write_segment(&registry, 0, vec![entry(i, "x", i)]);
    }

    let service = CompactionService::new(Arc::clone(&registry));
    assert!(!service.compact_table_now("t").await.unwrap());
    assert_eq!(registry.get_sstables("t").len(), 3);
}

#[tokio::test]
async fn test_merge_promotes_to_next_level() {
    let tmp = TempDir::new().unwrap();
    let registry = registry(&tmp);
    for i in 0..4u64 {
        write_segment(&registry, 0, vec![entry(i * 10, &format!("seg{i}"), i)]);
    }

    let service = CompactionService::new(Arc::clone(&registry));
    assert!(service.compact_table_now("t").await.unwrap());

    let segments = registry.get_sstables("t");
    assert_eq!(segments.len(), 1);
    assert_eq!(segments[0].level, 1);
    assert_eq!(segments[0].entry_count, 4);

    // Inputs are gone from disk; only the merged segment remains.
    let sst_files = std::fs::read_dir(tmp.path())
        .unwrap()
        .filter(|e| {
            e.as_ref().unwrap().path().extension().and_then(|x| x.to_str()) == Some("sst")
        })
        .count();
    assert_eq!(sst_files, 1);
}

#[tokio::test]
async fn test_newest_version_wins() {
    let tmp = TempDir::new().unwrap();
    let registry = registry(&tmp);
    write_segment(&registry, 0, vec![entry(1, "old", 0)]);
    write_segment(&registry, 0, vec![entry(1, "mid", 1)]);
    write_segment(&registry, 0, vec![entry(1, "new", 2)]);
    write_segment(&registry, 0, vec![entry(2, "other", 3)]);

    let service = CompactionService::new(Arc::clone(&registry));
    service.compact_table_now("t").await.unwrap();

    let meta = &registry.get_sstables("t")[0];
    let reader = Sstable::open(meta.path(tmp.path())).unwrap();
    let row = reader.get(1).unwrap().unwrap();
    assert_eq!(row["name"], Value::Str("new".into()));
}

#[tokio::test]
async fn test_tombstones_survive_intermediate_merges() {
    let tmp = TempDir::new().unwrap();
    let registry = registry(&tmp);
    write_segment(&registry, 0, vec![entry(1, "victim", 0), entry(2, "keep", 1)]);
    write_segment(&registry, 0, vec![tombstone(1, 2)]);
    write_segment(&registry, 0, vec![entry(3, "c", 3)]);
    write_segment(&registry, 0, vec![entry(4, "d", 4)]);

    let service = CompactionService::new(Arc::clone(&registry));
    service.compact_table_now("t").await.unwrap();

    let meta = &registry.get_sstables("t")[0];
    assert_eq!(meta.level, 1);
    let reader = Sstable::open(meta.path(tmp.path())).unwrap();

    // Row 1 is still present as a tombstone (level 1 is not the max level),
    // so it keeps shadowing anything older.
    let raw = reader.scan_raw(None, None).unwrap();
    let deleted: Vec<u64> = raw
        .iter()
        .filter(|(_, _, deleted)| *deleted)
        .map(|(id, _, _)| *id)
        .collect();
    assert_eq!(deleted, vec![1]);
    assert!(reader.get(1).unwrap().is_none());
    assert!(reader.get(2).unwrap().is_some());
}

#[tokio::test]
async fn test_max_level_is_never_compacted() {
    let tmp = TempDir::new().unwrap();
    let registry = registry(&tmp);
    for i in 0..5u64 {
        write_segment(&registry, MAX_LEVEL, vec![entry(i, "x", i)]);
    }

    let service = CompactionService::new(Arc::clone(&registry));
    assert!(!service.compact_table_now("t").await.unwrap());
    assert_eq!(registry.get_sstables("t").len(), 5);
}
