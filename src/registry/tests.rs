use tempfile::TempDir;

use super::*;

fn meta(table: &str, segment_id: &str, created_at: u64) -> SstableMetadata {
    SstableMetadata {
        segment_id: segment_id.to_string(),
        table_name: table.to_string(),
        level: 0,
        min_row_id: 0,
        max_row_id: 10,
        entry_count: 11,
        size_bytes: 1024,
        created_at,
        columns: vec!["id".into()],
        bloom_filter_offset: 32,
        data_offset: 64,
        index_offset: 128,
    }
}

fn touch_segment(dir: &TempDir, segment_id: &str) {
    std::fs::write(dir.path().join(format!("{segment_id}.sst")), b"stub").unwrap();
}

#[test]
fn test_register_persists_and_sorts() {
    let tmp = TempDir::new().unwrap();
    let registry = SstableRegistry::new(tmp.path());
    registry.load().unwrap();

    registry.register(meta("t", "seg_b", 200)).unwrap();
    registry.register(meta("t", "seg_a", 100)).unwrap();

    let segments = registry.get_sstables("t");
    assert_eq!(segments.len(), 2);
    assert_eq!(segments[0].segment_id, "seg_a");
    assert_eq!(segments[1].segment_id, "seg_b");

    assert!(tmp.path().join(REGISTRY_FILE).exists());
}

#[test]
fn test_load_round_trip() {
    let tmp = TempDir::new().unwrap();
    touch_segment(&tmp, "seg_a");
    touch_segment(&tmp, "seg_b");
    {
        let registry = SstableRegistry::new(tmp.path());
        registry.load().unwrap();
        registry.register(meta("t", "seg_a", 100)).unwrap();
        registry.register(meta("u", "seg_b", 150)).unwrap();
    }

    let registry = SstableRegistry::new(tmp.path());
    registry.load().unwrap();
    assert_eq!(registry.segment_count(), 2);
    assert_eq!(registry.get_sstables("t")[0], meta("t", "seg_a", 100));
    let mut tables = registry.tables();
    tables.sort();
    assert_eq!(tables, vec!["t", "u"]);
}

#[test]
fn test_load_drops_missing_segment_files() {
    let tmp = TempDir::new().unwrap();
    touch_segment(&tmp, "seg_present");
    {
        let registry = SstableRegistry::new(tmp.path());
        registry.load().unwrap();
        registry.register(meta("t", "seg_present", 100)).unwrap();
        registry.register(meta("t", "seg_ghost", 200)).unwrap();
    }

    let registry = SstableRegistry::new(tmp.path());
    registry.load().unwrap();
    let segments = registry.get_sstables("t");
    assert_eq!(segments.len(), 1);
    assert_eq!(segments[0].segment_id, "seg_present");
}

#[test]
fn test_unregister_removes_and_persists() {
    let tmp = TempDir::new().unwrap();
    let registry = SstableRegistry::new(tmp.path());
    registry.load().unwrap();

    registry.register(meta("t", "seg_a", 100)).unwrap();
    registry.register(meta("t", "seg_b", 200)).unwrap();
    registry
        .unregister("t", &["seg_a".to_string()])
        .unwrap();

    assert_eq!(registry.get_sstables("t").len(), 1);

    // Removing the last segment drops the table key entirely.
    registry.unregister("t", &["seg_b".to_string()]).unwrap();
    assert!(registry.get_sstables("t").is_empty());
    assert!(registry.tables().is_empty());

    let raw = std::fs::read_to_string(tmp.path().join(REGISTRY_FILE)).unwrap();
    let parsed: serde_json::Value = serde_json::from_str(&raw).unwrap();
    assert_eq!(parsed, serde_json::json!({}));
}

#[test]
fn test_unregister_table() {
    let tmp = TempDir::new().unwrap();
    let registry = SstableRegistry::new(tmp.path());
    registry.load().unwrap();

    registry.register(meta("t", "seg_a", 100)).unwrap();
    registry.register(meta("u", "seg_b", 100)).unwrap();

    let removed = registry.unregister_table("t").unwrap();
    assert_eq!(removed.len(), 1);
    assert!(registry.get_sstables("t").is_empty());
    assert_eq!(registry.get_sstables("u").len(), 1);
}
