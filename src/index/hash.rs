//! Open-bucket hash index. Buckets are addressed by an MD5 digest of the
//! key's canonical string, so any value type can be indexed; point lookups
//! only.

use md5::{Digest, Md5};

use crate::schema::Value;

const BUCKET_COUNT: usize = 1024;

/// Hash column index: equality lookups in O(1) expected time.
#[derive(Debug)]
pub struct HashIndex {
    name: String,
    buckets: Vec<Vec<(Value, Vec<u64>)>>,
    live_keys: usize,
}

impl HashIndex {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            buckets: (0..BUCKET_COUNT).map(|_| Vec::new()).collect(),
            live_keys: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn bucket_for(key: &Value) -> usize {
        let digest = Md5::digest(key.canonical_string().as_bytes());
        let hash = u128::from_be_bytes(digest.into());
        (hash % BUCKET_COUNT as u128) as usize
    }

    /// Adds a `(value, row_id)` pair; equal values share one list.
    pub fn insert(&mut self, key: Value, row_id: u64) {
        let bucket = &mut self.buckets[Self::bucket_for(&key)];
        match bucket.iter_mut().find(|(existing, _)| *existing == key) {
            Some((_, payload)) => {
                if !payload.contains(&row_id) {
                    payload.push(row_id);
                }
            }
            None => {
                bucket.push((key, vec![row_id]));
                self.live_keys += 1;
            }
        }
    }

    /// Row ids for an exact key; empty when absent.
    pub fn search(&self, key: &Value) -> Vec<u64> {
        self.buckets[Self::bucket_for(key)]
            .iter()
            .find(|(existing, _)| existing == key)
            .map(|(_, payload)| payload.clone())
            .unwrap_or_default()
    }

    /// Removes one row id for the key, or the whole key when `row_id` is
    /// `None`.
    pub fn delete(&mut self, key: &Value, row_id: Option<u64>) {
        let bucket = &mut self.buckets[Self::bucket_for(key)];
        let Some(position) = bucket.iter().position(|(existing, _)| existing == key) else {
            return;
        };
        match row_id {
            Some(row_id) => {
                let payload = &mut bucket[position].1;
                payload.retain(|id| *id != row_id);
                if payload.is_empty() {
                    bucket.remove(position);
                    self.live_keys -= 1;
                }
            }
            None => {
                bucket.remove(position);
                self.live_keys -= 1;
            }
        }
    }

    pub fn clear(&mut self) {
        for bucket in &mut self.buckets {
            bucket.clear();
        }
        self.live_keys = 0;
    }

    /// Number of distinct keys.
    pub fn len(&self) -> usize {
        self.live_keys
    }

    pub fn is_empty(&self) -> bool {
        self.live_keys == 0
    }

    /// Every `(key, row_ids)` entry, in bucket order.
    pub fn all_entries(&self) -> Vec<(Value, Vec<u64>)> {
        self.buckets
            .iter()
            .flat_map(|bucket| bucket.iter().cloned())
            .collect()
    }
}
