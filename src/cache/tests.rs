use std::time::Duration;

use super::*;
use crate::schema::Value;

#[test]
fn test_basic_get_put_and_stats() {
    let cache: LruCache<String, String> = LruCache::new(10, None, None);
    cache.put("a".into(), "alpha".into());
    cache.put("b".into(), "beta".into());

    assert_eq!(cache.get(&"a".to_string()), Some("alpha".to_string()));
    assert_eq!(cache.get(&"missing".to_string()), None);

    let stats = cache.stats();
    assert_eq!(stats.entries, 2);
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.misses, 1);
    assert!((stats.hit_rate - 0.5).abs() < f64::EPSILON);
    assert_eq!(stats.memory_bytes, "alpha".len() + "beta".len());
}

#[test]
fn test_count_bound_evicts_lru() {
    let cache: LruCache<u64, String> = LruCache::new(3, None, None);
    for key in 0..3u64 {
        cache.put(key, format!("v{key}"));
    }
    // Touch key 0 so it is most-recently-used, then overflow.
    cache.get(&0);
    cache.put(3, "v3".into());

    assert_eq!(cache.len(), 3);
    assert!(cache.contains(&0));
    assert!(!cache.contains(&1), "least-recently-used entry must go");
    assert!(cache.contains(&3));
}

#[test]
fn test_memory_bound_evicts_until_fit() {
    let cache: LruCache<u64, String> = LruCache::new(100, Some(30), None);
    cache.put(1, "x".repeat(10));
    cache.put(2, "y".repeat(10));
    cache.put(3, "z".repeat(10));
    assert_eq!(cache.memory_usage(), 30);

    cache.put(4, "w".repeat(15));
    assert!(cache.memory_usage() <= 30);
    assert!(!cache.contains(&1));
    assert!(cache.contains(&4));
}

#[test]
fn test_overwrite_replaces_size_accounting() {
    let cache: LruCache<String, String> = LruCache::new(10, None, None);
    cache.put("k".into(), "1234567890".into());
    assert_eq!(cache.memory_usage(), 10);
    cache.put("k".into(), "12".into());
    assert_eq!(cache.memory_usage(), 2);
    assert_eq!(cache.len(), 1);
}

#[test]
fn test_ttl_expiry_on_access_and_sweep() {
    let cache: LruCache<String, String> = LruCache::new(10, None, Some(Duration::from_millis(20)));
    cache.put("a".into(), "x".into());
    cache.put("b".into(), "y".into());
    assert_eq!(cache.get(&"a".to_string()), Some("x".to_string()));

    std::thread::sleep(Duration::from_millis(40));

    // Access path removes the expired entry and reports a miss.
    assert_eq!(cache.get(&"a".to_string()), None);
    assert!(!cache.contains(&"b".to_string()));

    cache.put("c".into(), "z".into());
    std::thread::sleep(Duration::from_millis(40));
    cache.put("d".into(), "fresh".into());
    assert_eq!(cache.sweep_expired(), 1);
    assert!(cache.contains(&"d".to_string()));
}

#[test]
fn test_remove_and_clear() {
    let cache: LruCache<String, String> = LruCache::new(10, None, None);
    cache.put("a".into(), "x".into());
    assert!(cache.remove(&"a".to_string()));
    assert!(!cache.remove(&"a".to_string()));
    assert_eq!(cache.memory_usage(), 0);

    cache.put("b".into(), "y".into());
    cache.clear();
    assert!(cache.is_empty());
    assert_eq!(cache.stats().hits, 0);
}

fn sample_rows() -> Vec<Row> {
    vec![
        [
            ("id".to_string(), Value::Int64(1)),
            ("name".to_string(), Value::Str("a".into())),
        ]
        .into_iter()
        .collect(),
        [
            ("id".to_string(), Value::Int64(2)),
            ("name".to_string(), Value::Str("b".into())),
        ]
        .into_iter()
        .collect(),
    ]
}

#[test]
fn test_query_cache_round_trip() {
    let cache = QueryCache::default();
    let params = serde_json::json!({ "limit": 10 });

    assert!(cache.get("guilds", &params).is_none());
    cache.set("guilds", &params, &sample_rows());

    let rows = cache.get("guilds", &params).unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0]["id"], Value::Int64(1));

    // A different parameter set is a different key.
    assert!(cache.get("guilds", &serde_json::json!({ "limit": 11 })).is_none());
}

#[test]
fn test_query_cache_invalidate_table() {
    let cache = QueryCache::default();
    let params = serde_json::json!({});
    cache.set("guilds", &params, &sample_rows());
    cache.set("members", &params, &sample_rows());

    cache.invalidate_table("guilds");
    assert!(cache.get("guilds", &params).is_none());
    assert!(cache.get("members", &params).is_some());
}
