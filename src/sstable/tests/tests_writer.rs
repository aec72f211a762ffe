use tempfile::TempDir;

use super::super::{FOOTER_LEN, SSTABLE_MAGIC, Sstable};
use super::helpers::{entry, tombstone, writer};

#[test]
fn test_empty_entry_set_writes_nothing() {
    let tmp = TempDir::new().unwrap();
    let meta = writer(tmp.path()).write(Vec::new(), 0).unwrap();
    assert!(meta.is_none());
    assert_eq!(std::fs::read_dir(tmp.path()).unwrap().count(), 0);
}

#[test]
fn test_metadata_describes_the_file() {
    let tmp = TempDir::new().unwrap();
    let entries = vec![entry(5, "a", 1), entry(2, "b", 2), entry(9, "c", 3)];
    let meta = writer(tmp.path()).write(entries, 0).unwrap().unwrap();

    assert_eq!(meta.table_name, "t");
    assert_eq!(meta.level, 0);
    assert_eq!(meta.min_row_id, 2);
    assert_eq!(meta.max_row_id, 9);
    assert_eq!(meta.entry_count, 3);
    assert_eq!(meta.columns, vec!["id", "name", "score"]);

    let path = meta.path(tmp.path());
    assert!(path.exists());
    assert_eq!(std::fs::metadata(&path).unwrap().len(), meta.size_bytes);

    // No temp file left behind after the atomic publish.
    let leftovers = std::fs::read_dir(tmp.path())
        .unwrap()
        .filter(|e| {
            e.as_ref().unwrap().path().extension().and_then(|x| x.to_str()) == Some("tmp")
        })
        .count();
    assert_eq!(leftovers, 0);
}

#[test]
fn test_footer_carries_offsets_and_magic() {
    let tmp = TempDir::new().unwrap();
    let meta = writer(tmp.path())
        .write(vec![entry(1, "a", 1)], 3)
        .unwrap()
        .unwrap();
    let bytes = std::fs::read(meta.path(tmp.path())).unwrap();

    let footer = &bytes[bytes.len() - FOOTER_LEN..];
    assert_eq!(
        u64::from_le_bytes(footer[0..8].try_into().unwrap()),
        meta.bloom_filter_offset
    );
    assert_eq!(
        u64::from_le_bytes(footer[8..16].try_into().unwrap()),
        meta.data_offset
    );
    assert_eq!(
        u64::from_le_bytes(footer[16..24].try_into().unwrap()),
        meta.index_offset
    );
    assert_eq!(&footer[24..28], SSTABLE_MAGIC);

    // Header magic too, and the level byte survives.
    assert_eq!(&bytes[..4], SSTABLE_MAGIC);
    let reader = Sstable::open(meta.path(tmp.path())).unwrap();
    assert_eq!(reader.level(), 3);
}

#[test]
fn test_duplicate_row_ids_are_deduped() {
    let tmp = TempDir::new().unwrap();
    let entries = vec![entry(1, "first", 1), entry(1, "dup", 2), entry(2, "b", 3)];
    let meta = writer(tmp.path()).write(entries, 0).unwrap().unwrap();
    assert_eq!(meta.entry_count, 2);
}

#[test]
fn test_tombstones_are_persisted_as_all_null_rows() {
    let tmp = TempDir::new().unwrap();
    let entries = vec![entry(1, "a", 1), tombstone(2), entry(3, "c", 3)];
    let meta = writer(tmp.path()).write(entries, 0).unwrap().unwrap();
    assert_eq!(meta.entry_count, 3);

    let reader = Sstable::open(meta.path(tmp.path())).unwrap();
    let raw = reader.scan_raw(None, None).unwrap();
    assert_eq!(raw.len(), 3);
    assert!(!raw[0].2);
    assert!(raw[1].2, "row 2 must read back as a tombstone");
    assert!(raw[1].1.is_empty());
    assert!(!raw[2].2);
}

#[test]
fn test_sparse_index_interval() {
    let tmp = TempDir::new().unwrap();
    let entries: Vec<_> = (0..1000u64).map(|i| entry(i, "x", i as i32)).collect();
    let meta = writer(tmp.path()).write(entries, 0).unwrap().unwrap();

    let reader = Sstable::open(meta.path(tmp.path())).unwrap();
    // ⌈1000/100⌉ = 10 → one anchor every 10 rows.
    assert_eq!(reader.sparse_index().len(), 100);
    assert_eq!(reader.sparse_index()[0], (0, 0));
    assert_eq!(reader.sparse_index()[1], (10, 10));
}
