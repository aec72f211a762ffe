//! Cluster orchestration: owner-routed writes, cached reads of non-owned
//! partitions, invalidation broadcast, and fan-out reads.
//!
//! ## Fan-out reads
//!
//! Peers are grouped by their deployment cluster (`cluster_id`, falling back
//! to host). One *random healthy* peer is picked per group, the query runs
//! concurrently against the local node and each pick with a per-call
//! timeout, and results merge by strategy:
//!
//! - `union` (default) — all responses combined, deduped by `id`, then
//!   `row_id`, then a hash of the sorted row items;
//! - `first_positive` — the first non-empty response wins, the rest are
//!   cancelled;
//! - `fastest` — the first response wins regardless of content.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use rand::Rng;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

use crate::schema::{Row, row_from_json};

use super::ClusterError;
use super::cache::DistributedCache;
use super::client::NodeClient;
use super::proto::NodeInfo;
use super::registry::{HEARTBEAT_TIMEOUT, NodeEvent, NodeRegistry};
use super::ring::ConsistentHashRing;
use super::server::{NodeServer, RequestHandler};

// ------------------------------------------------------------------------------------------------
// Types
// ------------------------------------------------------------------------------------------------

/// How fan-out responses are merged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MergeStrategy {
    #[default]
    Union,
    FirstPositive,
    Fastest,
}

impl MergeStrategy {
    pub fn parse(text: &str) -> Self {
        match text {
            "first_positive" => MergeStrategy::FirstPositive,
            "fastest" => MergeStrategy::Fastest,
            _ => MergeStrategy::Union,
        }
    }
}

/// Result of a fan-out query, rows plus per-cluster metadata.
#[derive(Debug, Clone)]
pub struct FanOutReport {
    pub rows: Vec<Row>,
    pub total_time_ms: u64,
    pub responded_clusters: Vec<String>,
    pub failed_clusters: Vec<String>,
    pub cluster_times_ms: HashMap<String, u64>,
}

/// Application-level request handler the engine plugs into the cluster
/// layer; every inbound `Request` action lands here.
#[async_trait]
pub trait DataHandler: Send + Sync {
    async fn handle(&self, action: &str, data: serde_json::Value)
    -> Result<serde_json::Value, String>;
}

// ------------------------------------------------------------------------------------------------
// ClusterManager
// ------------------------------------------------------------------------------------------------

/// Owns the ring, registry, client, distributed cache, and inbound server.
pub struct ClusterManager {
    local: NodeInfo,
    ring: Arc<ConsistentHashRing>,
    registry: Arc<NodeRegistry>,
    client: Arc<NodeClient>,
    cache: Arc<DistributedCache>,
    data_handler: RwLock<Option<Arc<dyn DataHandler>>>,
    server: Mutex<Option<NodeServer>>,
}

impl ClusterManager {
    pub fn new(
        local: NodeInfo,
        virtual_nodes: usize,
        node_weight: f64,
        cache_ttl: Duration,
        cache_max_size: usize,
    ) -> Arc<Self> {
        let ring = Arc::new(ConsistentHashRing::new(virtual_nodes));
        let client = Arc::new(NodeClient::new());
        let registry = Arc::new(NodeRegistry::new(
            local.clone(),
            Arc::clone(&ring),
            Arc::clone(&client),
            node_weight,
        ));
        let cache = Arc::new(DistributedCache::new(
            Arc::clone(&client),
            cache_ttl,
            cache_max_size,
        ));
        Arc::new(Self {
            local,
            ring,
            registry,
            client,
            cache,
            data_handler: RwLock::new(None),
            server: Mutex::new(None),
        })
    }

    pub fn local_node(&self) -> &NodeInfo {
        &self.local
    }

    pub fn ring(&self) -> &Arc<ConsistentHashRing> {
        &self.ring
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }

    pub fn client(&self) -> &Arc<NodeClient> {
        &self.client
    }

    pub fn cache(&self) -> &Arc<DistributedCache> {
        &self.cache
    }

    /// Plugs in the engine-side action handler.
    pub async fn register_data_handler(&self, handler: Arc<dyn DataHandler>) {
        *self.data_handler.write().await = Some(handler);
    }

    /// Binds the inbound server, starts background services, and joins the
    /// cluster through the given seeds.
    pub async fn start(self: &Arc<Self>, seeds: &[String]) -> Result<(), ClusterError> {
        let bind_addr = self.local.address();
        let server = NodeServer::start(&bind_addr, Arc::clone(self) as Arc<dyn RequestHandler>)
            .await?;
        *self.server.lock().await = Some(server);

        self.client.start().await;
        self.registry.start().await;
        self.cache.start().await;

        // A dead peer's cached entries are garbage; purge them on leave.
        let cache = Arc::clone(&self.cache);
        self.registry
            .on_node_change(Arc::new(move |event, node| {
                let cache = Arc::clone(&cache);
                Box::pin(async move {
                    if event == NodeEvent::Leave {
                        cache.invalidate_from_node(&node.node_id).await;
                    }
                })
            }))
            .await;

        if !seeds.is_empty() {
            self.registry.join_cluster(seeds).await?;
        }
        info!(node = %self.local.node_id, "cluster manager started");
        Ok(())
    }

    pub async fn stop(&self) {
        self.cache.stop().await;
        self.registry.stop().await;
        self.client.stop().await;
        if let Some(server) = self.server.lock().await.take() {
            server.stop().await;
        }
        info!("cluster manager stopped");
    }

    // -- routing ---------------------------------------------------------------------------------

    /// True when this node owns the partition (or no ring exists yet).
    pub async fn is_owner(&self, partition: u64) -> bool {
        match self.ring.owner(partition).await {
            Some(owner) => owner.node_id == self.local.node_id,
            None => true,
        }
    }

    pub async fn owner_node(&self, partition: u64) -> Option<NodeInfo> {
        self.ring.owner(partition).await
    }

    /// Reads partition data: locally when owner, through the distributed
    /// cache otherwise.
    pub async fn get_data<F, Fut>(
        &self,
        partition: u64,
        table: &str,
        local_getter: F,
    ) -> Result<serde_json::Value, ClusterError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<serde_json::Value, ClusterError>>,
    {
        if self.is_owner(partition).await {
            return local_getter().await;
        }
        let owner = self
            .owner_node(partition)
            .await
            .ok_or(ClusterError::NoOwner(partition))?;
        self.cache.get(partition, table, &owner).await
    }

    /// Writes partition data: locally when owner (then broadcasts cache
    /// invalidation), forwarded to the owner otherwise. A forwarded failure
    /// carries the owner's error message.
    pub async fn write_data<F, Fut>(
        &self,
        partition: u64,
        table: &str,
        data: serde_json::Value,
        local_writer: F,
    ) -> Result<serde_json::Value, ClusterError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<serde_json::Value, ClusterError>>,
    {
        if self.is_owner(partition).await {
            let result = local_writer().await?;
            self.broadcast_invalidation(partition, Some(table)).await;
            return Ok(result);
        }
        let owner = self
            .owner_node(partition)
            .await
            .ok_or(ClusterError::NoOwner(partition))?;
        self.client.write_data(&owner, partition, table, data).await
    }

    /// Tells every peer to drop cached data for the partition.
    pub async fn broadcast_invalidation(&self, partition: u64, table: Option<&str>) {
        let peers = self.registry.get_all_peers().await;
        for peer in peers {
            if let Err(err) = self.client.invalidate_cache(&peer, partition, table).await {
                warn!(peer = %peer.node_id, "invalidation broadcast failed: {err}");
            }
        }
    }

    // -- fan-out ---------------------------------------------------------------------------------

    fn group_by_cluster(nodes: Vec<NodeInfo>) -> HashMap<String, Vec<NodeInfo>> {
        let mut clusters: HashMap<String, Vec<NodeInfo>> = HashMap::new();
        for node in nodes {
            clusters.entry(node.cluster_key()).or_default().push(node);
        }
        clusters
    }

    fn pick_random_healthy(clusters: HashMap<String, Vec<NodeInfo>>) -> Vec<NodeInfo> {
        let timeout_ms = HEARTBEAT_TIMEOUT.as_millis() as u64;
        let mut rng = rand::rng();
        let mut picks = Vec::new();
        for (_, nodes) in clusters {
            let healthy: Vec<NodeInfo> = nodes
                .into_iter()
                .filter(|node| node.is_healthy(timeout_ms))
                .collect();
            if !healthy.is_empty() {
                picks.push(healthy[rng.random_range(0..healthy.len())].clone());
            }
        }
        picks
    }

    fn dedupe_key(row: &Row) -> String {
        if let Some(id) = row.get("id") {
            return format!("id:{}", id.display_string());
        }
        if let Some(row_id) = row.get("row_id") {
            return format!("row_id:{}", row_id.display_string());
        }
        crate::schema::row_to_json(row).to_string()
    }

    /// Fan-out read returning merged rows only.
    pub async fn fan_out_read<F, Fut>(
        &self,
        table: &str,
        params: serde_json::Value,
        local_reader: F,
        strategy: MergeStrategy,
        timeout: Duration,
    ) -> Result<Vec<Row>, ClusterError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Vec<Row>> + Send + 'static,
    {
        self.fan_out_query(table, params, local_reader, strategy, timeout)
            .await
            .map(|report| report.rows)
    }

    /// Fan-out read returning rows plus per-cluster response metadata.
    pub async fn fan_out_query<F, Fut>(
        &self,
        table: &str,
        params: serde_json::Value,
        local_reader: F,
        strategy: MergeStrategy,
        timeout: Duration,
    ) -> Result<FanOutReport, ClusterError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Vec<Row>> + Send + 'static,
    {
        let started = tokio::time::Instant::now();
        let picks = Self::pick_random_healthy(Self::group_by_cluster(
            self.registry.get_all_peers().await,
        ));

        let local_cluster = self.local.cluster_key();
        let mut futures: FuturesUnordered<
            std::pin::Pin<Box<dyn Future<Output = (String, Result<Vec<Row>, ClusterError>, u64)> + Send>>,
        > = FuturesUnordered::new();

        {
            let local_cluster = local_cluster.clone();
            let local_future = local_reader();
            futures.push(Box::pin(async move {
                let cluster_started = tokio::time::Instant::now();
                let rows = match tokio::time::timeout(timeout, local_future).await {
                    Ok(rows) => Ok(rows),
                    // A timed-out participant contributes empty.
                    Err(_) => Ok(Vec::new()),
                };
                (
                    local_cluster,
                    rows,
                    cluster_started.elapsed().as_millis() as u64,
                )
            }));
        }

        for peer in picks {
            let client = Arc::clone(&self.client);
            let cluster = peer.cluster_key();
            let table = table.to_string();
            let params = params.clone();
            futures.push(Box::pin(async move {
                let cluster_started = tokio::time::Instant::now();
                // The outer deadline caps the whole exchange, including the
                // client's internal retries; a late peer contributes empty.
                let result = match tokio::time::timeout(
                    timeout,
                    client.query_remote(&peer, &table, params, Some(timeout)),
                )
                .await
                {
                    Ok(Ok(json)) => Ok(match json.as_array() {
                        Some(rows) => rows.iter().map(row_from_json).collect(),
                        None => Vec::new(),
                    }),
                    Ok(Err(ClusterError::Timeout(_))) | Err(_) => Ok(Vec::new()),
                    Ok(Err(err)) => Err(err),
                };
                (
                    cluster,
                    result,
                    cluster_started.elapsed().as_millis() as u64,
                )
            }));
        }

        let mut merged: Vec<Row> = Vec::new();
        let mut seen = std::collections::HashSet::new();
        let mut responded_clusters = Vec::new();
        let mut failed_clusters = Vec::new();
        let mut cluster_times_ms = HashMap::new();

        while let Some((cluster, result, elapsed_ms)) = futures.next().await {
            cluster_times_ms.insert(cluster.clone(), elapsed_ms);
            match result {
                Ok(rows) => {
                    responded_clusters.push(cluster);
                    match strategy {
                        MergeStrategy::Union => {
                            for row in rows {
                                if seen.insert(Self::dedupe_key(&row)) {
                                    merged.push(row);
                                }
                            }
                        }
                        MergeStrategy::FirstPositive => {
                            if !rows.is_empty() {
                                // Dropping the stream cancels the laggards.
                                merged = rows;
                                break;
                            }
                        }
                        MergeStrategy::Fastest => {
                            merged = rows;
                            break;
                        }
                    }
                }
                Err(err) => {
                    warn!(cluster = %cluster, "fan-out participant failed: {err}");
                    failed_clusters.push(cluster);
                }
            }
        }
        drop(futures);

        Ok(FanOutReport {
            rows: merged,
            total_time_ms: started.elapsed().as_millis() as u64,
            responded_clusters,
            failed_clusters,
            cluster_times_ms,
        })
    }

    // -- stats -----------------------------------------------------------------------------------

    pub async fn stats(&self) -> serde_json::Value {
        let ring_stats = self.ring.stats().await;
        let registry_stats = self.registry.stats().await;
        let cache_stats = self.cache.stats().await;
        serde_json::json!({
            "local_node": self.local.node_id,
            "ring": {
                "nodes": ring_stats.node_count,
                "points": ring_stats.point_count,
                "vnodes_per_node": ring_stats.vnodes_per_node,
            },
            "registry": {
                "peers": registry_stats.peer_count,
                "healthy_peers": registry_stats.healthy_peers,
            },
            "distributed_cache": {
                "entries": cache_stats.entries,
                "hits": cache_stats.hits,
                "misses": cache_stats.misses,
                "remote_fetches": cache_stats.remote_fetches,
            },
            "blacklisted": self.client.failed_nodes().await,
        })
    }
}

// ------------------------------------------------------------------------------------------------
// RequestHandler bridge
// ------------------------------------------------------------------------------------------------

#[async_trait]
impl RequestHandler for ClusterManager {
    async fn handle_action(
        &self,
        action: &str,
        data: serde_json::Value,
    ) -> Result<serde_json::Value, String> {
        let handler = self.data_handler.read().await.clone();
        match handler {
            Some(handler) => handler.handle(action, data).await,
            None => Err(format!("no handler registered for action '{action}'")),
        }
    }

    async fn on_register(&self, node: NodeInfo) {
        self.registry.add_peer(node).await;
    }

    async fn on_heartbeat(
        &self,
        node_id: &str,
        _timestamp: u64,
        load_factor: f64,
        guild_count: u64,
    ) {
        self.registry
            .record_heartbeat(node_id, load_factor, guild_count)
            .await;
    }

    async fn on_node_leave(&self, node_id: &str) {
        self.registry.remove_peer(node_id).await;
    }

    async fn on_invalidate(&self, guild_id: u64, table: Option<String>) {
        self.cache.invalidate(guild_id, table.as_deref()).await;
    }

    async fn cluster_nodes(&self) -> Vec<NodeInfo> {
        self.registry.all_nodes().await
    }
}
