//! Weighted consistent hash ring.
//!
//! A node with weight `w` contributes `max(1, round(150 · w))` virtual
//! points, each placed at `BLAKE2b-128("node_id:vnode:i")`. A partition key
//! is looked up by hashing it ([`super::snowflake::hash_partition`]) and
//! bisecting the sorted points for the first strictly greater one, wrapping
//! around. Owner lookups are memoized per partition until membership or
//! weights change.

use std::collections::HashMap;

use blake2::digest::consts::U16;
use blake2::{Blake2b, Digest};
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::proto::NodeInfo;
use super::snowflake;

type Blake2b128 = Blake2b<U16>;

/// Virtual points per unit of node weight.
pub const DEFAULT_VIRTUAL_NODES: usize = 150;

struct RingInner {
    /// Sorted `(position, node_id)` points.
    points: Vec<(u128, String)>,
    nodes: HashMap<String, NodeInfo>,
    weights: HashMap<String, f64>,
    vnode_counts: HashMap<String, usize>,
    /// Memoized `partition → node_id`, cleared on every mutation.
    owner_cache: HashMap<u64, String>,
}

/// Statistics snapshot of the ring.
#[derive(Debug, Clone)]
pub struct RingStats {
    pub node_count: usize,
    pub point_count: usize,
    pub vnodes_per_node: HashMap<String, usize>,
}

/// Consistent hash ring with weighted virtual nodes.
pub struct ConsistentHashRing {
    virtual_nodes: usize,
    inner: RwLock<RingInner>,
}

impl Default for ConsistentHashRing {
    fn default() -> Self {
        Self::new(DEFAULT_VIRTUAL_NODES)
    }
}

impl ConsistentHashRing {
    pub fn new(virtual_nodes: usize) -> Self {
        Self {
            virtual_nodes: virtual_nodes.max(1),
            inner: RwLock::new(RingInner {
                points: Vec::new(),
                nodes: HashMap::new(),
                weights: HashMap::new(),
                vnode_counts: HashMap::new(),
                owner_cache: HashMap::new(),
            }),
        }
    }

    fn vnode_position(node_id: &str, index: usize) -> u128 {
        let mut hasher = Blake2b128::new();
        hasher.update(format!("{node_id}:vnode:{index}").as_bytes());
        u128::from_be_bytes(hasher.finalize().into())
    }

    fn insert_points(inner: &mut RingInner, node_id: &str, count: usize) {
        for index in 0..count {
            let position = Self::vnode_position(node_id, index);
            let at = inner
                .points
                .partition_point(|(existing, _)| *existing < position);
            inner.points.insert(at, (position, node_id.to_string()));
        }
    }

    /// Adds a node with the given capacity weight. A node already present is
    /// left untouched.
    pub async fn add_node(&self, node: NodeInfo, weight: f64) {
        let mut inner = self.inner.write().await;
        if inner.nodes.contains_key(&node.node_id) {
            return;
        }
        let node_id = node.node_id.clone();
        let vnode_count = ((self.virtual_nodes as f64 * weight).round() as usize).max(1);
        inner.nodes.insert(node_id.clone(), node);
        inner.weights.insert(node_id.clone(), weight);
        inner.vnode_counts.insert(node_id.clone(), vnode_count);
        Self::insert_points(&mut inner, &node_id, vnode_count);
        inner.owner_cache.clear();
        info!(node = %node_id, weight, vnodes = vnode_count, "ring node added");
    }

    /// Rebuilds a node's virtual points for a new weight.
    pub async fn update_weight(&self, node_id: &str, weight: f64) {
        let mut inner = self.inner.write().await;
        if !inner.nodes.contains_key(node_id) {
            return;
        }
        inner.points.retain(|(_, id)| id != node_id);
        let vnode_count = ((self.virtual_nodes as f64 * weight).round() as usize).max(1);
        inner.weights.insert(node_id.to_string(), weight);
        inner.vnode_counts.insert(node_id.to_string(), vnode_count);
        Self::insert_points(&mut inner, node_id, vnode_count);
        inner.owner_cache.clear();
        debug!(node = %node_id, weight, "ring weight updated");
    }

    /// Removes a node and all of its points.
    pub async fn remove_node(&self, node_id: &str) {
        let mut inner = self.inner.write().await;
        if inner.nodes.remove(node_id).is_none() {
            return;
        }
        inner.weights.remove(node_id);
        inner.vnode_counts.remove(node_id);
        inner.points.retain(|(_, id)| id != node_id);
        inner.owner_cache.clear();
        info!(node = %node_id, "ring node removed");
    }

    /// Refreshes the stored descriptor of a node (heartbeat bookkeeping).
    pub async fn refresh_node(&self, node: NodeInfo) {
        let mut inner = self.inner.write().await;
        if let Some(existing) = inner.nodes.get_mut(&node.node_id) {
            *existing = node;
        }
    }

    /// Owner node for a partition key. Deterministic for a given membership
    /// set regardless of insertion order.
    pub async fn owner(&self, partition_id: u64) -> Option<NodeInfo> {
        {
            let inner = self.inner.read().await;
            if let Some(node_id) = inner.owner_cache.get(&partition_id)
                && let Some(node) = inner.nodes.get(node_id)
            {
                return Some(node.clone());
            }
        }

        let mut inner = self.inner.write().await;
        if inner.points.is_empty() {
            return None;
        }
        let hash = snowflake::hash_partition(partition_id, 0);
        let at = inner.points.partition_point(|(position, _)| *position <= hash);
        let (_, node_id) = &inner.points[at % inner.points.len()];
        let node_id = node_id.clone();
        inner.owner_cache.insert(partition_id, node_id.clone());
        inner.nodes.get(&node_id).cloned()
    }

    /// The next `replica_count` distinct successor nodes after the owner,
    /// skipping duplicate ids produced by virtual points.
    pub async fn replicas(&self, partition_id: u64, replica_count: usize) -> Vec<NodeInfo> {
        let inner = self.inner.read().await;
        if inner.points.is_empty() {
            return Vec::new();
        }
        let hash = snowflake::hash_partition(partition_id, 0);
        let start = inner.points.partition_point(|(position, _)| *position <= hash);

        let mut seen = Vec::new();
        for step in 0..inner.points.len() {
            if seen.len() > replica_count {
                break;
            }
            let (_, node_id) = &inner.points[(start + step) % inner.points.len()];
            if !seen.contains(node_id) {
                seen.push(node_id.clone());
            }
        }
        // The first distinct id is the owner; replicas follow it.
        seen.into_iter()
            .skip(1)
            .filter_map(|node_id| inner.nodes.get(&node_id).cloned())
            .collect()
    }

    pub async fn get_all_nodes(&self) -> Vec<NodeInfo> {
        self.inner.read().await.nodes.values().cloned().collect()
    }

    pub async fn healthy_nodes(&self, heartbeat_timeout_ms: u64) -> Vec<NodeInfo> {
        self.inner
            .read()
            .await
            .nodes
            .values()
            .filter(|node| node.is_healthy(heartbeat_timeout_ms))
            .cloned()
            .collect()
    }

    pub async fn node_count(&self) -> usize {
        self.inner.read().await.nodes.len()
    }

    pub async fn contains_node(&self, node_id: &str) -> bool {
        self.inner.read().await.nodes.contains_key(node_id)
    }

    /// Per-node share of a sample of partition ids.
    pub async fn analyze_distribution(&self, sample: &[u64]) -> HashMap<String, usize> {
        let mut counts: HashMap<String, usize> = HashMap::new();
        for partition_id in sample {
            if let Some(node) = self.owner(*partition_id).await {
                *counts.entry(node.node_id).or_default() += 1;
            }
        }
        counts
    }

    pub async fn stats(&self) -> RingStats {
        let inner = self.inner.read().await;
        RingStats {
            node_count: inner.nodes.len(),
            point_count: inner.points.len(),
            vnodes_per_node: inner.vnode_counts.clone(),
        }
    }
}
