use super::super::snowflake::{analyze_distribution, hash_partition, synthesize, whiten};

#[test]
fn test_whiten_is_deterministic_and_spreading() {
    let id = synthesize(1_700_000_000_000, 3, 7);
    assert_eq!(whiten(id), whiten(id));

    // Consecutive sequence numbers must not stay adjacent after whitening.
    let a = whiten(synthesize(1_700_000_000_000, 3, 7));
    let b = whiten(synthesize(1_700_000_000_000, 3, 8));
    assert!(a.abs_diff(b) > 1 << 32);
}

#[test]
fn test_hash_partition_changes_with_seed() {
    let id = synthesize(1_700_000_000_000, 1, 1);
    assert_ne!(hash_partition(id, 0), hash_partition(id, 1));
    assert_eq!(hash_partition(id, 0), hash_partition(id, 0));
}

#[test]
fn test_narrow_time_window_distributes_evenly() {
    // Ids minted within one hour: identical high bits, the worst case for
    // naive hashing.
    let base_ms = 1_700_000_000_000u64;
    let ids: Vec<u64> = (0..10_000u64)
        .map(|i| synthesize(base_ms + (i * 360) % 3_600_000, (i % 32) as u16, (i % 4096) as u16))
        .collect();

    let report = analyze_distribution(&ids, 100);
    assert_eq!(report.total_ids, 10_000);
    assert!(
        report.max_deviation_percent < 50.0,
        "fullest bucket deviates {:.1}% from uniform",
        report.max_deviation_percent
    );
    assert!(
        report.deviation_percent < 15.0,
        "std deviation is {:.1}% of expectation",
        report.deviation_percent
    );
    assert!(report.min_bucket_count > 0, "no bucket may starve");
}
