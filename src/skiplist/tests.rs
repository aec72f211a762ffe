use super::*;

#[test]
fn test_insert_search_overwrite() {
    let list = SkipList::new();
    assert!(list.insert(5, "a"));
    assert!(list.insert(1, "b"));
    assert!(list.insert(9, "c"));
    assert_eq!(list.len(), 3);

    assert_eq!(list.search(5), Some("a"));
    assert_eq!(list.search(2), None);

    // Overwrite in place keeps len stable.
    assert!(!list.insert(5, "a2"));
    assert_eq!(list.search(5), Some("a2"));
    assert_eq!(list.len(), 3);
}

#[test]
fn test_delete() {
    let list = SkipList::new();
    for key in [3u64, 1, 4, 1, 5, 9, 2, 6] {
        list.insert(key, key * 10);
    }
    assert_eq!(list.len(), 7); // duplicate 1 overwrote

    assert!(list.delete(4));
    assert!(!list.delete(4));
    assert_eq!(list.search(4), None);
    assert_eq!(list.len(), 6);

    // Remaining keys stay reachable and ordered.
    let keys: Vec<u64> = list.items().into_iter().map(|(k, _)| k).collect();
    assert_eq!(keys, vec![1, 2, 3, 5, 6, 9]);
}

#[test]
fn test_range_is_inclusive_and_ordered() {
    let list = SkipList::new();
    for key in 0..100u64 {
        list.insert(key * 2, key);
    }
    let hits = list.range(10, 20);
    let keys: Vec<u64> = hits.iter().map(|(k, _)| *k).collect();
    assert_eq!(keys, vec![10, 12, 14, 16, 18, 20]);

    assert!(list.range(1001, 2000).is_empty());
    // Inverted bounds yield nothing.
    assert!(list.range(20, 10).is_empty());
}

#[test]
fn test_slot_recycling_after_delete() {
    let list = SkipList::new();
    for key in 0..1000u64 {
        list.insert(key, key);
    }
    for key in (0..1000u64).step_by(2) {
        assert!(list.delete(key));
    }
    assert_eq!(list.len(), 500);
    for key in 1000..1500u64 {
        list.insert(key, key);
    }
    assert_eq!(list.len(), 1000);
    for key in (1..1000u64).step_by(2) {
        assert_eq!(list.search(key), Some(key));
    }
    for key in 1000..1500u64 {
        assert_eq!(list.search(key), Some(key));
    }
}

#[test]
fn test_randomized_against_btreemap() {
    use rand::Rng;
    use std::collections::BTreeMap;

    let list = SkipList::new();
    let mut model = BTreeMap::new();
    let mut rng = rand::rng();

    for _ in 0..5000 {
        let key = rng.random_range(0..500u64);
        if rng.random::<f64>() < 0.7 {
            list.insert(key, key as i64);
            model.insert(key, key as i64);
        } else {
            list.delete(key);
            model.remove(&key);
        }
    }

    assert_eq!(list.len(), model.len());
    let got: Vec<(u64, i64)> = list.items();
    let want: Vec<(u64, i64)> = model.into_iter().collect();
    assert_eq!(got, want);
}
