//! Peer membership registry.
//!
//! Owns the local node descriptor and the live peer map. Heartbeats go out
//! every [`HEARTBEAT_INTERVAL`] to every peer; a peer whose last heartbeat is
//! older than [`HEARTBEAT_TIMEOUT`] is considered dead, and the cleanup task
//! (every [`CLEANUP_INTERVAL`]) evicts it from both the peer map and the
//! hash ring, firing the registered `on_node_change` callbacks with a
//! `leave` event. Fresh peers fire `join`.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::schema::now_millis;

use super::ClusterError;
use super::client::NodeClient;
use super::proto::{NodeInfo, PeerMessage};
use super::ring::ConsistentHashRing;

// ------------------------------------------------------------------------------------------------
// Constants
// ------------------------------------------------------------------------------------------------

/// Heartbeat send cadence.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// A peer silent for longer than this is dead.
pub const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(15);

/// Dead-peer sweep cadence.
pub const CLEANUP_INTERVAL: Duration = Duration::from_secs(30);

// ------------------------------------------------------------------------------------------------
// Types
// ------------------------------------------------------------------------------------------------

/// Membership-change event passed to callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeEvent {
    Join,
    Leave,
}

/// Callback fired on membership changes.
pub type NodeChangeCallback =
    Arc<dyn Fn(NodeEvent, NodeInfo) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Statistics snapshot of the registry.
#[derive(Debug, Clone)]
pub struct RegistryStats {
    pub local_node_id: String,
    pub peer_count: usize,
    pub healthy_peers: usize,
}

// ------------------------------------------------------------------------------------------------
// NodeRegistry
// ------------------------------------------------------------------------------------------------

/// Live peer map plus the background heartbeat and cleanup tasks.
pub struct NodeRegistry {
    local: RwLock<NodeInfo>,
    peers: Arc<RwLock<HashMap<String, NodeInfo>>>,
    ring: Arc<ConsistentHashRing>,
    client: Arc<NodeClient>,
    callbacks: Arc<RwLock<Vec<NodeChangeCallback>>>,
    default_weight: f64,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl NodeRegistry {
    pub fn new(
        local: NodeInfo,
        ring: Arc<ConsistentHashRing>,
        client: Arc<NodeClient>,
        default_weight: f64,
    ) -> Self {
        Self {
            local: RwLock::new(local),
            peers: Arc::new(RwLock::new(HashMap::new())),
            ring,
            client,
            callbacks: Arc::new(RwLock::new(Vec::new())),
            default_weight,
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub async fn local_node(&self) -> NodeInfo {
        self.local.read().await.clone()
    }

    /// Registers a membership-change callback.
    pub async fn on_node_change(&self, callback: NodeChangeCallback) {
        self.callbacks.write().await.push(callback);
    }

    async fn fire_callbacks(
        callbacks: &Arc<RwLock<Vec<NodeChangeCallback>>>,
        event: NodeEvent,
        node: NodeInfo,
    ) {
        let snapshot = callbacks.read().await.clone();
        for callback in snapshot {
            callback(event, node.clone()).await;
        }
    }

    /// Starts the heartbeat and cleanup loops. The local node joins its own
    /// ring first.
    pub async fn start(self: &Arc<Self>) {
        let local = self.local_node().await;
        self.ring.add_node(local, self.default_weight).await;

        let mut tasks = self.tasks.lock().await;

        // Heartbeat loop.
        {
            let registry = Arc::clone(self);
            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    registry.send_heartbeats().await;
                }
            }));
        }

        // Dead-peer cleanup loop.
        {
            let registry = Arc::clone(self);
            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(CLEANUP_INTERVAL);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    registry.evict_dead_peers().await;
                }
            }));
        }
        info!("node registry started");
    }

    /// Announces departure and stops the background loops.
    pub async fn stop(&self) {
        let node_id = self.local.read().await.node_id.clone();
        self.broadcast(&PeerMessage::NodeLeave { node_id }).await;
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
            let _ = task.await;
        }
        info!("node registry stopped");
    }

    async fn send_heartbeats(&self) {
        let local = self.local.read().await.clone();
        let message = PeerMessage::Heartbeat {
            node_id: local.node_id.clone(),
            timestamp: now_millis(),
            load_factor: local.load_factor,
            guild_count: local.guild_count,
        };
        self.broadcast(&message).await;
    }

    /// Best-effort frame to every known peer.
    pub async fn broadcast(&self, message: &PeerMessage) {
        let peers: Vec<NodeInfo> = self.peers.read().await.values().cloned().collect();
        for peer in peers {
            if let Err(err) = self.client.send_message(&peer, message).await {
                warn!(peer = %peer.node_id, "broadcast failed: {err}");
            }
        }
    }

    async fn evict_dead_peers(&self) {
        let timeout_ms = HEARTBEAT_TIMEOUT.as_millis() as u64;
        let dead: Vec<String> = {
            let peers = self.peers.read().await;
            peers
                .values()
                .filter(|peer| !peer.is_healthy(timeout_ms))
                .map(|peer| peer.node_id.clone())
                .collect()
        };
        for node_id in dead {
            warn!(peer = %node_id, "evicting dead peer");
            self.remove_peer(&node_id).await;
        }
    }

    /// Adds (or refreshes) a peer; fresh peers join the ring and fire `join`.
    pub async fn add_peer(&self, mut node: NodeInfo) {
        let local_id = self.local.read().await.node_id.clone();
        if node.node_id == local_id {
            return;
        }
        node.last_heartbeat = now_millis();

        let is_new = {
            let mut peers = self.peers.write().await;
            peers.insert(node.node_id.clone(), node.clone()).is_none()
        };
        self.client.register_node(node.clone()).await;
        if is_new {
            let weight = if node.weight > 0.0 {
                node.weight
            } else {
                self.default_weight
            };
            self.ring.add_node(node.clone(), weight).await;
            info!(peer = %node.node_id, "peer joined");
            Self::fire_callbacks(&self.callbacks, NodeEvent::Join, node).await;
        }
    }

    /// Removes a peer from the map and the ring, firing `leave`.
    pub async fn remove_peer(&self, node_id: &str) {
        let removed = self.peers.write().await.remove(node_id);
        if let Some(node) = removed {
            self.ring.remove_node(node_id).await;
            self.client.forget_node(&node.address()).await;
            Self::fire_callbacks(&self.callbacks, NodeEvent::Leave, node).await;
        }
    }

    /// Records a heartbeat from a peer.
    pub async fn record_heartbeat(
        &self,
        node_id: &str,
        load_factor: f64,
        guild_count: u64,
    ) {
        let mut peers = self.peers.write().await;
        if let Some(peer) = peers.get_mut(node_id) {
            peer.last_heartbeat = now_millis();
            peer.load_factor = load_factor;
            peer.guild_count = guild_count;
            self.ring.refresh_node(peer.clone()).await;
        }
    }

    /// Joins the cluster through seed addresses: register with each seed,
    /// pull its membership view, and absorb every node in it.
    pub async fn join_cluster(&self, seeds: &[String]) -> Result<(), ClusterError> {
        let local = self.local.read().await.clone();
        let mut joined_any = false;
        for seed in seeds {
            match self.client.join_handshake(seed, local.clone()).await {
                Ok(nodes) => {
                    joined_any = true;
                    for node in nodes {
                        self.add_peer(node).await;
                    }
                }
                Err(err) => warn!(seed = %seed, "seed join failed: {err}"),
            }
        }
        if !joined_any && !seeds.is_empty() {
            return Err(ClusterError::Internal(
                "no seed node answered the join handshake".into(),
            ));
        }
        info!(peers = self.peers.read().await.len(), "joined cluster");
        Ok(())
    }

    pub async fn get_peer(&self, node_id: &str) -> Option<NodeInfo> {
        self.peers.read().await.get(node_id).cloned()
    }

    pub async fn get_all_peers(&self) -> Vec<NodeInfo> {
        self.peers.read().await.values().cloned().collect()
    }

    /// Every node in the membership view, local first.
    pub async fn all_nodes(&self) -> Vec<NodeInfo> {
        let mut nodes = vec![self.local.read().await.clone()];
        nodes.extend(self.peers.read().await.values().cloned());
        nodes
    }

    pub async fn stats(&self) -> RegistryStats {
        let timeout_ms = HEARTBEAT_TIMEOUT.as_millis() as u64;
        let peers = self.peers.read().await;
        RegistryStats {
            local_node_id: self.local.read().await.node_id.clone(),
            peer_count: peers.len(),
            healthy_peers: peers
                .values()
                .filter(|peer| peer.is_healthy(timeout_ms))
                .count(),
        }
    }
}
