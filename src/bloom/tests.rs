use super::*;

#[test]
fn test_no_false_negatives() {
    let mut bloom = BloomFilter::new(10_000, 0.01);
    for id in 0..10_000u64 {
        bloom.add(id * 3);
    }
    for id in 0..10_000u64 {
        assert!(bloom.might_contain(id * 3), "false negative for {}", id * 3);
    }
}

#[test]
fn test_false_positive_rate_is_bounded() {
    let mut bloom = BloomFilter::new(10_000, 0.01);
    for id in 0..10_000u64 {
        bloom.add(id);
    }
    let false_positives = (1_000_000u64..1_010_000)
        .filter(|id| bloom.might_contain(*id))
        .count();
    // Allow generous slack over the 1% target; the point is order of magnitude.
    assert!(
        false_positives < 300,
        "false positive rate too high: {false_positives}/10000"
    );
}

#[test]
fn test_sizing_floors() {
    let bloom = BloomFilter::new(1, 0.5);
    assert!(bloom.bit_count() >= 64);
    assert!(bloom.hash_count() >= 1);
}

#[test]
fn test_serialization_round_trip() {
    let mut bloom = BloomFilter::new(500, 0.01);
    for id in [7u64, 42, 1000, u64::MAX] {
        bloom.add(id);
    }
    let bytes = bloom.to_bytes();
    let restored = BloomFilter::from_bytes(&bytes).unwrap();
    assert_eq!(restored.bit_count(), bloom.bit_count());
    assert_eq!(restored.hash_count(), bloom.hash_count());
    for id in [7u64, 42, 1000, u64::MAX] {
        assert!(restored.might_contain(id));
    }
    assert_eq!(restored.to_bytes(), bytes);
}

#[test]
fn test_from_bytes_rejects_truncation() {
    let mut bloom = BloomFilter::new(100, 0.01);
    bloom.add(1);
    let bytes = bloom.to_bytes();
    assert!(BloomFilter::from_bytes(&bytes[..8]).is_err());
    assert!(BloomFilter::from_bytes(&bytes[..bytes.len() - 4]).is_err());
}
