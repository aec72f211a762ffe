use std::sync::Arc;
use std::sync::atomic::AtomicU64;

use super::*;
use crate::schema::Value;

fn memtable(size_limit: usize, entry_limit: usize) -> MemTable {
    MemTable::new("t", size_limit, entry_limit, Arc::new(AtomicU64::new(0)))
}

fn row(name: &str) -> Row {
    [("name".to_string(), Value::Str(name.into()))]
        .into_iter()
        .collect()
}

#[test]
fn test_insert_get() {
    let mt = memtable(DEFAULT_SIZE_LIMIT, DEFAULT_ENTRY_LIMIT);
    assert!(mt.insert(1, row("a")).unwrap());
    assert!(mt.insert(2, row("b")).unwrap());
    assert!(!mt.insert(1, row("a2")).unwrap());

    assert_eq!(mt.get(1).unwrap()["name"], Value::Str("a2".into()));
    assert!(mt.get(9).is_none());
    assert_eq!(mt.entry_count(), 2);
}

#[test]
fn test_update_merges_partial_row() {
    let mt = memtable(DEFAULT_SIZE_LIMIT, DEFAULT_ENTRY_LIMIT);
    let full: Row = [
        ("name".to_string(), Value::Str("a".into())),
        ("score".to_string(), Value::Int64(1)),
    ]
    .into_iter()
    .collect();
    mt.insert(1, full).unwrap();

    mt.update(1, [("score".to_string(), Value::Int64(5))].into_iter().collect())
        .unwrap();
    let got = mt.get(1).unwrap();
    assert_eq!(got["name"], Value::Str("a".into()));
    assert_eq!(got["score"], Value::Int64(5));

    // Updating an unbuffered row buffers the partial as a new row.
    mt.update(7, row("fresh")).unwrap();
    assert_eq!(mt.get(7).unwrap()["name"], Value::Str("fresh".into()));
}

#[test]
fn test_delete_is_a_tombstone() {
    let mt = memtable(DEFAULT_SIZE_LIMIT, DEFAULT_ENTRY_LIMIT);
    mt.insert(1, row("a")).unwrap();
    mt.delete(1).unwrap();

    assert!(mt.get(1).is_none());
    let entry = mt.get_entry(1).unwrap();
    assert!(entry.deleted);
    assert!(entry.data.is_empty());

    // Tombstones flow into the flush set.
    let flush = mt.entries_for_flush();
    assert_eq!(flush.len(), 1);
    assert!(flush[0].deleted);

    // Deleting a never-seen row still records a tombstone.
    mt.delete(42).unwrap();
    assert!(mt.get_entry(42).unwrap().deleted);
}

#[test]
fn test_sequence_numbers_are_monotonic() {
    let mt = memtable(DEFAULT_SIZE_LIMIT, DEFAULT_ENTRY_LIMIT);
    mt.insert(1, row("a")).unwrap();
    mt.insert(2, row("b")).unwrap();
    mt.delete(1).unwrap();

    let seq1 = mt.get_entry(1).unwrap().seq;
    let seq2 = mt.get_entry(2).unwrap().seq;
    assert!(seq1 > seq2, "tombstone must outrank the earlier insert");
}

#[test]
fn test_should_flush_on_entry_limit() {
    let mt = memtable(DEFAULT_SIZE_LIMIT, 3);
    for id in 0..3u64 {
        mt.insert(id, row("x")).unwrap();
        if id < 2 {
            assert!(!mt.should_flush());
        }
    }
    assert!(mt.should_flush());
}

#[test]
fn test_should_flush_on_size_limit() {
    let mt = memtable(64, DEFAULT_ENTRY_LIMIT);
    mt.insert(0, row("a-fairly-long-name-to-blow-the-byte-budget-quickly"))
        .unwrap();
    mt.insert(1, row("another-long-name")).unwrap();
    assert!(mt.should_flush());
}

#[test]
fn test_mutations_fail_after_immutable() {
    let mt = memtable(DEFAULT_SIZE_LIMIT, DEFAULT_ENTRY_LIMIT);
    mt.insert(1, row("a")).unwrap();
    mt.make_immutable().unwrap();
    assert_eq!(mt.state(), MemTableState::Immutable);

    assert!(matches!(
        mt.insert(2, row("b")),
        Err(MemtableError::IllegalState { .. })
    ));
    assert!(matches!(mt.delete(1), Err(MemtableError::IllegalState { .. })));
    assert!(matches!(
        mt.make_immutable(),
        Err(MemtableError::IllegalState { .. })
    ));

    // Reads still work.
    assert!(mt.get(1).is_some());
}

#[test]
fn test_flush_state_machine() {
    let mt = memtable(DEFAULT_SIZE_LIMIT, DEFAULT_ENTRY_LIMIT);
    mt.insert(1, row("a")).unwrap();

    // Flushing requires Immutable first.
    assert!(mt.mark_flushing().is_err());
    mt.make_immutable().unwrap();
    mt.mark_flushing().unwrap();
    assert_eq!(mt.state(), MemTableState::Flushing);

    // Failed flush rolls back; a retry can mark Flushing again.
    mt.revert_to_immutable();
    assert_eq!(mt.state(), MemTableState::Immutable);
    mt.mark_flushing().unwrap();
    mt.mark_flushed();
    assert_eq!(mt.state(), MemTableState::Flushed);
}

#[test]
fn test_range_skips_tombstones() {
    let mt = memtable(DEFAULT_SIZE_LIMIT, DEFAULT_ENTRY_LIMIT);
    for id in 0..10u64 {
        mt.insert(id, row(&format!("r{id}"))).unwrap();
    }
    mt.delete(4).unwrap();
    mt.delete(6).unwrap();

    let hits = mt.range(3, 7);
    let ids: Vec<u64> = hits.iter().map(|(id, _)| *id).collect();
    assert_eq!(ids, vec![3, 5, 7]);
    assert_eq!(mt.get_all().len(), 8);
}
