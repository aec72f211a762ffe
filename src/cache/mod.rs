//! # Cache Module
//!
//! Bounded in-process caches: a generic LRU bounded by entry count, byte
//! budget, and per-entry TTL, plus the query-result cache keyed by canonical
//! query parameters.
//!
//! ## Sizing
//!
//! Entry sizes are best-effort estimates via [`ByteSized`] (string/byte
//! lengths, JSON text length). Expired entries are dropped on access and by
//! the periodic sweep the engine runs.
//!
//! ## Query cache keys
//!
//! `"{table}:{sha256(canonical params json)}"`. Prefixing the table name
//! keeps [`QueryCache::invalidate_table`]'s substring walk exact: any write
//! to a table removes precisely that table's cached results.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests;

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};

use crate::schema::{Row, row_from_json, row_to_json};

// ------------------------------------------------------------------------------------------------
// ByteSized
// ------------------------------------------------------------------------------------------------

/// Best-effort memory footprint of a cached value.
pub trait ByteSized {
    fn approx_bytes(&self) -> usize;
}

impl ByteSized for String {
    fn approx_bytes(&self) -> usize {
        self.len()
    }
}

impl ByteSized for Vec<u8> {
    fn approx_bytes(&self) -> usize {
        self.len()
    }
}

impl ByteSized for serde_json::Value {
    fn approx_bytes(&self) -> usize {
        match self {
            serde_json::Value::Null => 4,
            serde_json::Value::Bool(_) => 8,
            serde_json::Value::Number(_) => 8,
            serde_json::Value::String(s) => s.len(),
            other => other.to_string().len(),
        }
    }
}

impl ByteSized for Row {
    fn approx_bytes(&self) -> usize {
        row_to_json(self).to_string().len()
    }
}

impl<T: ByteSized> ByteSized for Vec<T> {
    fn approx_bytes(&self) -> usize {
        self.iter().map(ByteSized::approx_bytes).sum()
    }
}

// ------------------------------------------------------------------------------------------------
// LruCache
// ------------------------------------------------------------------------------------------------

struct CacheEntry<V> {
    value: V,
    size: usize,
    created_at: Instant,
}

struct Inner<K: Hash + Eq, V> {
    map: lru::LruCache<K, CacheEntry<V>>,
    current_memory: usize,
    hits: u64,
    misses: u64,
}

/// Statistics snapshot of one cache.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheStats {
    pub entries: usize,
    pub memory_bytes: usize,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
}

/// LRU cache bounded by entry count, optional byte budget, and optional TTL.
pub struct LruCache<K: Hash + Eq + Clone, V: ByteSized + Clone> {
    inner: Mutex<Inner<K, V>>,
    max_memory_bytes: Option<usize>,
    ttl: Option<Duration>,
}

impl<K: Hash + Eq + Clone, V: ByteSized + Clone> LruCache<K, V> {
    pub fn new(max_size: usize, max_memory_bytes: Option<usize>, ttl: Option<Duration>) -> Self {
        let capacity = NonZeroUsize::new(max_size.max(1)).expect("max(1) is non-zero");
        Self {
            inner: Mutex::new(Inner {
                map: lru::LruCache::new(capacity),
                current_memory: 0,
                hits: 0,
                misses: 0,
            }),
            max_memory_bytes,
            ttl,
        }
    }

    fn is_expired(&self, entry: &CacheEntry<V>) -> bool {
        self.ttl
            .is_some_and(|ttl| entry.created_at.elapsed() > ttl)
    }

    /// Fetches and promotes. Expired entries are removed and count as a miss.
    pub fn get(&self, key: &K) -> Option<V> {
        let mut inner = self.inner.lock().expect("cache lock poisoned");
        let expired = match inner.map.get(key) {
            Some(entry) => self.is_expired(entry),
            None => {
                inner.misses += 1;
                return None;
            }
        };
        if expired {
            if let Some(removed) = inner.map.pop(key) {
                inner.current_memory -= removed.size;
            }
            inner.misses += 1;
            return None;
        }
        let value = inner.map.get(key).map(|entry| entry.value.clone());
        inner.hits += 1;
        value
    }

    /// Inserts, evicting least-recently-used entries past either bound.
    pub fn put(&self, key: K, value: V) {
        let size = value.approx_bytes();
        let mut inner = self.inner.lock().expect("cache lock poisoned");

        if let Some(old) = inner.map.pop(&key) {
            inner.current_memory -= old.size;
        }
        // Count bound is enforced by the backing store on push; byte bound
        // needs explicit eviction.
        if let Some(budget) = self.max_memory_bytes {
            while inner.current_memory + size > budget && !inner.map.is_empty() {
                if let Some((_, evicted)) = inner.map.pop_lru() {
                    inner.current_memory -= evicted.size;
                }
            }
        }
        if let Some((_, evicted)) = inner.map.push(
            key,
            CacheEntry {
                value,
                size,
                created_at: Instant::now(),
            },
        ) {
            inner.current_memory -= evicted.size;
        }
        inner.current_memory += size;
    }

    pub fn remove(&self, key: &K) -> bool {
        let mut inner = self.inner.lock().expect("cache lock poisoned");
        match inner.map.pop(key) {
            Some(entry) => {
                inner.current_memory -= entry.size;
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, key: &K) -> bool {
        let mut inner = self.inner.lock().expect("cache lock poisoned");
        let expired = match inner.map.peek(key) {
            Some(entry) => self.is_expired(entry),
            None => return false,
        };
        if expired {
            if let Some(entry) = inner.map.pop(key) {
                inner.current_memory -= entry.size;
            }
            return false;
        }
        true
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock().expect("cache lock poisoned");
        inner.map.clear();
        inner.current_memory = 0;
        inner.hits = 0;
        inner.misses = 0;
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("cache lock poisoned").map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn memory_usage(&self) -> usize {
        self.inner
            .lock()
            .expect("cache lock poisoned")
            .current_memory
    }

    /// All keys, most-recently-used first.
    pub fn keys(&self) -> Vec<K> {
        self.inner
            .lock()
            .expect("cache lock poisoned")
            .map
            .iter()
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Drops every expired entry; returns how many were removed.
    pub fn sweep_expired(&self) -> usize {
        let Some(ttl) = self.ttl else {
            return 0;
        };
        let mut inner = self.inner.lock().expect("cache lock poisoned");
        let expired: Vec<K> = inner
            .map
            .iter()
            .filter(|(_, entry)| entry.created_at.elapsed() > ttl)
            .map(|(key, _)| key.clone())
            .collect();
        let removed = expired.len();
        for key in expired {
            if let Some(entry) = inner.map.pop(&key) {
                inner.current_memory -= entry.size;
            }
        }
        removed
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock().expect("cache lock poisoned");
        let total = inner.hits + inner.misses;
        CacheStats {
            entries: inner.map.len(),
            memory_bytes: inner.current_memory,
            hits: inner.hits,
            misses: inner.misses,
            hit_rate: if total == 0 {
                0.0
            } else {
                inner.hits as f64 / total as f64
            },
        }
    }
}

// ------------------------------------------------------------------------------------------------
// QueryCache
// ------------------------------------------------------------------------------------------------

/// Default query-cache capacity.
pub const QUERY_CACHE_SIZE: usize = 500;

/// Default query-result TTL.
pub const QUERY_CACHE_TTL: Duration = Duration::from_secs(300);

/// Cache of query results keyed by table plus canonical parameters.
pub struct QueryCache {
    cache: LruCache<String, serde_json::Value>,
}

impl Default for QueryCache {
    fn default() -> Self {
        Self::new(QUERY_CACHE_SIZE, QUERY_CACHE_TTL)
    }
}

impl QueryCache {
    pub fn new(max_size: usize, ttl: Duration) -> Self {
        Self {
            cache: LruCache::new(max_size, None, Some(ttl)),
        }
    }

    fn make_key(table: &str, params: &serde_json::Value) -> String {
        let body = serde_json::json!({ "table": table, "params": params });
        let digest = Sha256::digest(body.to_string().as_bytes());
        format!("{table}:{digest:x}")
    }

    pub fn get(&self, table: &str, params: &serde_json::Value) -> Option<Vec<Row>> {
        let cached = self.cache.get(&Self::make_key(table, params))?;
        let rows = cached.as_array()?;
        Some(rows.iter().map(row_from_json).collect())
    }

    pub fn set(&self, table: &str, params: &serde_json::Value, rows: &[Row]) {
        let body = serde_json::Value::Array(rows.iter().map(row_to_json).collect());
        self.cache.put(Self::make_key(table, params), body);
    }

    /// Removes every cached result whose key mentions the table.
    pub fn invalidate_table(&self, table: &str) {
        for key in self.cache.keys() {
            if key.contains(table) {
                self.cache.remove(&key);
            }
        }
    }

    pub fn clear(&self) {
        self.cache.clear();
    }

    pub fn sweep_expired(&self) -> usize {
        self.cache.sweep_expired()
    }

    pub fn stats(&self) -> CacheStats {
        self.cache.stats()
    }
}
