use rand::Rng;
use rand::seq::SliceRandom;
use tempfile::TempDir;

use crate::schema::Value;

use super::super::{Sstable, SstableError};
use super::helpers::{entry, tombstone, writer};

#[test]
fn test_point_lookup_round_trip() {
    let tmp = TempDir::new().unwrap();
    let entries = vec![entry(1, "a", 10), entry(2, "b", 20), entry(3, "c", 30)];
    let meta = writer(tmp.path()).write(entries, 0).unwrap().unwrap();

    let reader = Sstable::open(meta.path(tmp.path())).unwrap();
    let row = reader.get(2).unwrap().unwrap();
    assert_eq!(row["name"], Value::Str("b".into()));
    assert_eq!(row["score"], Value::Int32(20));
    assert!(reader.get(4).unwrap().is_none());
}

#[test]
fn test_get_skips_out_of_range_without_decoding() {
    let tmp = TempDir::new().unwrap();
    let meta = writer(tmp.path())
        .write(vec![entry(100, "a", 1), entry(200, "b", 2)], 0)
        .unwrap()
        .unwrap();
    let reader = Sstable::open(meta.path(tmp.path())).unwrap();

    assert!(!reader.might_contain(99));
    assert!(!reader.might_contain(201));
    assert!(reader.get(99).unwrap().is_none());
    assert!(reader.get(150).unwrap().is_none());
}

#[test]
fn test_tombstone_point_lookup() {
    let tmp = TempDir::new().unwrap();
    let meta = writer(tmp.path())
        .write(vec![entry(1, "a", 1), tombstone(2)], 0)
        .unwrap()
        .unwrap();
    let reader = Sstable::open(meta.path(tmp.path())).unwrap();

    assert!(reader.get(2).unwrap().is_none());
    let (_, deleted) = reader.get_raw(2).unwrap().unwrap();
    assert!(deleted);
}

#[test]
fn test_scan_with_bounds() {
    let tmp = TempDir::new().unwrap();
    let entries: Vec<_> = (0..50u64).map(|i| entry(i, &format!("r{i}"), i as i32)).collect();
    let meta = writer(tmp.path()).write(entries, 0).unwrap().unwrap();
    let reader = Sstable::open(meta.path(tmp.path())).unwrap();

    let hits = reader.scan(Some(10), Some(14)).unwrap();
    let ids: Vec<u64> = hits.iter().map(|(id, _)| *id).collect();
    assert_eq!(ids, vec![10, 11, 12, 13, 14]);

    assert_eq!(reader.scan(None, None).unwrap().len(), 50);
    assert!(reader.scan(Some(60), None).unwrap().is_empty());
}

#[test]
fn test_bloom_and_sparse_index_on_large_segment() {
    let tmp = TempDir::new().unwrap();
    // Even row ids only, so every odd id is genuinely absent.
    let entries: Vec<_> = (0..10_000u64)
        .map(|i| entry(i * 2, &format!("row{i}"), (i % 100) as i32))
        .collect();
    let meta = writer(tmp.path()).write(entries, 0).unwrap().unwrap();
    let reader = Sstable::open(meta.path(tmp.path())).unwrap();

    let mut rng = rand::rng();

    // Present ids always come back.
    let mut present: Vec<u64> = (0..10_000u64).map(|i| i * 2).collect();
    present.shuffle(&mut rng);
    for row_id in present.iter().take(1_000) {
        let row = reader.get(*row_id).unwrap().expect("present row");
        assert_eq!(row["id"], Value::Int64(*row_id as i64));
    }

    // Absent ids never produce a row, and the bloom filter screens most of
    // them before any data block is decoded.
    let mut bloom_passes = 0usize;
    for _ in 0..1_000 {
        let row_id = rng.random_range(0..10_000u64) * 2 + 1;
        if reader.might_contain(row_id) {
            bloom_passes += 1;
        }
        assert!(reader.get(row_id).unwrap().is_none());
    }
    assert!(
        bloom_passes <= 50,
        "bloom passed {bloom_passes}/1000 absent ids, far above the 1% target"
    );
}

#[test]
fn test_open_rejects_truncated_file() {
    let tmp = TempDir::new().unwrap();
    let meta = writer(tmp.path())
        .write(vec![entry(1, "a", 1)], 0)
        .unwrap()
        .unwrap();
    let path = meta.path(tmp.path());
    let bytes = std::fs::read(&path).unwrap();
    std::fs::write(&path, &bytes[..10]).unwrap();

    assert!(matches!(
        Sstable::open(&path),
        Err(SstableError::Integrity { .. })
    ));
}

#[test]
fn test_open_rejects_bad_footer_magic() {
    let tmp = TempDir::new().unwrap();
    let meta = writer(tmp.path())
        .write(vec![entry(1, "a", 1)], 0)
        .unwrap()
        .unwrap();
    let path = meta.path(tmp.path());
    let mut bytes = std::fs::read(&path).unwrap();
    let len = bytes.len();
    bytes[len - 2] = b'!';
    std::fs::write(&path, &bytes).unwrap();

    assert!(matches!(
        Sstable::open(&path),
        Err(SstableError::Integrity { .. })
    ));
}
