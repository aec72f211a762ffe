//! Read-through cache of partitions this node does not own.
//!
//! Keys are `(partition, table, subkey)`; values remember the owner node
//! they were fetched from so a dead peer's entries can be purged. Entries
//! expire after [`DEFAULT_TTL`]; when the cache is full the oldest tenth is
//! evicted; a periodic sweep (every [`SWEEP_INTERVAL`]) drops expired
//! entries.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::schema::now_millis;

use super::ClusterError;
use super::client::NodeClient;
use super::proto::NodeInfo;

// ------------------------------------------------------------------------------------------------
// Constants
// ------------------------------------------------------------------------------------------------

/// Default entry TTL.
pub const DEFAULT_TTL: Duration = Duration::from_secs(60);

/// Default maximum entry count.
pub const DEFAULT_MAX_SIZE: usize = 10_000;

/// Expired-entry sweep cadence.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

// ------------------------------------------------------------------------------------------------
// Types
// ------------------------------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct CachedData {
    data: serde_json::Value,
    source_node: String,
    /// Milliseconds since the UNIX epoch.
    fetched_at: u64,
    ttl_ms: u64,
}

impl CachedData {
    fn is_expired(&self) -> bool {
        now_millis().saturating_sub(self.fetched_at) > self.ttl_ms
    }
}

/// Statistics snapshot of the distributed cache.
#[derive(Debug, Clone)]
pub struct DistributedCacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub remote_fetches: u64,
}

// ------------------------------------------------------------------------------------------------
// DistributedCache
// ------------------------------------------------------------------------------------------------

struct CacheInner {
    entries: HashMap<String, CachedData>,
    hits: u64,
    misses: u64,
    remote_fetches: u64,
}

/// TTL-bounded cache of non-owned partition data with read-through fetch.
pub struct DistributedCache {
    client: Arc<NodeClient>,
    inner: Mutex<CacheInner>,
    ttl: Duration,
    max_size: usize,
    sweep_handle: Mutex<Option<JoinHandle<()>>>,
}

impl DistributedCache {
    pub fn new(client: Arc<NodeClient>, ttl: Duration, max_size: usize) -> Self {
        Self {
            client,
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
                hits: 0,
                misses: 0,
                remote_fetches: 0,
            }),
            ttl,
            max_size: max_size.max(1),
            sweep_handle: Mutex::new(None),
        }
    }

    fn make_key(partition: u64, table: &str, subkey: Option<&str>) -> String {
        match subkey {
            Some(subkey) => format!("{partition}:{table}:{subkey}"),
            None => format!("{partition}:{table}"),
        }
    }

    /// Starts the periodic expiry sweep.
    pub async fn start(self: &Arc<Self>) {
        let cache = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let removed = cache.sweep_expired().await;
                if removed > 0 {
                    debug!(removed, "distributed cache sweep");
                }
            }
        });
        *self.sweep_handle.lock().await = Some(handle);
    }

    pub async fn stop(&self) {
        if let Some(handle) = self.sweep_handle.lock().await.take() {
            handle.abort();
            let _ = handle.await;
        }
        info!("distributed cache stopped");
    }

    /// Cached data for a non-owned partition; a miss fetches from the owner
    /// and populates the entry.
    pub async fn get(
        &self,
        partition: u64,
        table: &str,
        owner: &NodeInfo,
    ) -> Result<serde_json::Value, ClusterError> {
        let key = Self::make_key(partition, table, None);
        {
            let mut inner = self.inner.lock().await;
            match inner.entries.get(&key).map(|entry| (entry.is_expired(), entry.data.clone())) {
                Some((false, data)) => {
                    inner.hits += 1;
                    return Ok(data);
                }
                Some(_) => {
                    inner.entries.remove(&key);
                    inner.misses += 1;
                }
                None => inner.misses += 1,
            }
        }

        let data = self.client.fetch_guild_data(owner, partition, table).await?;
        self.set(partition, table, data.clone(), &owner.node_id).await;
        self.inner.lock().await.remote_fetches += 1;
        Ok(data)
    }

    /// Peeks without fetching. `None` on miss or expiry.
    pub async fn peek(&self, partition: u64, table: &str) -> Option<serde_json::Value> {
        let key = Self::make_key(partition, table, None);
        let mut inner = self.inner.lock().await;
        match inner.entries.get(&key).map(|entry| (entry.is_expired(), entry.data.clone())) {
            Some((false, data)) => {
                inner.hits += 1;
                Some(data)
            }
            Some(_) => {
                inner.entries.remove(&key);
                inner.misses += 1;
                None
            }
            None => {
                inner.misses += 1;
                None
            }
        }
    }

    /// Stores an entry, evicting the oldest tenth when full.
    pub async fn set(
        &self,
        partition: u64,
        table: &str,
        data: serde_json::Value,
        source_node: &str,
    ) {
        let key = Self::make_key(partition, table, None);
        let mut inner = self.inner.lock().await;
        if inner.entries.len() >= self.max_size && !inner.entries.contains_key(&key) {
            Self::evict_oldest(&mut inner.entries, self.max_size / 10);
        }
        inner.entries.insert(
            key,
            CachedData {
                data,
                source_node: source_node.to_string(),
                fetched_at: now_millis(),
                ttl_ms: self.ttl.as_millis() as u64,
            },
        );
    }

    fn evict_oldest(entries: &mut HashMap<String, CachedData>, count: usize) {
        let mut by_age: Vec<(String, u64)> = entries
            .iter()
            .map(|(key, entry)| (key.clone(), entry.fetched_at))
            .collect();
        by_age.sort_by_key(|(_, fetched_at)| *fetched_at);
        for (key, _) in by_age.into_iter().take(count.max(1)) {
            entries.remove(&key);
        }
    }

    /// Drops every entry with the given partition (and table) prefix.
    pub async fn invalidate(&self, partition: u64, table: Option<&str>) {
        let prefix = match table {
            Some(table) => format!("{partition}:{table}"),
            None => format!("{partition}:"),
        };
        let mut inner = self.inner.lock().await;
        inner.entries.retain(|key, _| !key.starts_with(&prefix));
    }

    /// Drops every entry fetched from a node (called when a peer dies).
    pub async fn invalidate_from_node(&self, node_id: &str) {
        let mut inner = self.inner.lock().await;
        let before = inner.entries.len();
        inner.entries.retain(|_, entry| entry.source_node != node_id);
        let dropped = before - inner.entries.len();
        if dropped > 0 {
            info!(node_id, dropped, "purged cache entries from dead peer");
        }
    }

    /// Drops expired entries; returns how many were removed.
    pub async fn sweep_expired(&self) -> usize {
        let mut inner = self.inner.lock().await;
        let before = inner.entries.len();
        inner.entries.retain(|_, entry| !entry.is_expired());
        before - inner.entries.len()
    }

    pub async fn stats(&self) -> DistributedCacheStats {
        let inner = self.inner.lock().await;
        DistributedCacheStats {
            entries: inner.entries.len(),
            hits: inner.hits,
            misses: inner.misses,
            remote_fetches: inner.remote_fetches,
        }
    }
}
