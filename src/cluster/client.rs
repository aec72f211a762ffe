//! Inter-node request client.
//!
//! One persistent connection per peer address, shared by every in-flight
//! request and multiplexed with correlation ids. Failures follow a fixed
//! policy: up to [`MAX_RETRIES`] attempts with exponential backoff starting
//! at [`BACKOFF_BASE`], then the address is blacklisted for
//! [`BLACKLIST_DURATION`] and the error surfaces. A probe loop retries
//! blacklisted peers every [`PROBE_INTERVAL`] and clears entries whose
//! handshake succeeds again.
//!
//! When a connection drops, every pending request on it fails with
//! [`ClusterError::ConnectionLost`].

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tokio::net::TcpStream;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::{Mutex, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::proto::{self, NodeInfo, PeerMessage};
use super::ClusterError;

// ------------------------------------------------------------------------------------------------
// Constants
// ------------------------------------------------------------------------------------------------

/// Connection establishment deadline.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default request deadline; callers may override per call.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Attempts per request/connect before blacklisting.
pub const MAX_RETRIES: u32 = 3;

/// First backoff step; doubles per attempt.
pub const BACKOFF_BASE: Duration = Duration::from_millis(500);

/// How long a failed address stays blacklisted.
pub const BLACKLIST_DURATION: Duration = Duration::from_secs(30);

/// Blacklist probe cadence.
pub const PROBE_INTERVAL: Duration = Duration::from_secs(10);

// ------------------------------------------------------------------------------------------------
// Connection
// ------------------------------------------------------------------------------------------------

type PendingMap = Mutex<HashMap<String, oneshot::Sender<Result<serde_json::Value, ClusterError>>>>;

struct Connection {
    writer: Mutex<OwnedWriteHalf>,
    pending: Arc<PendingMap>,
    closed: Arc<AtomicBool>,
    reader: JoinHandle<()>,
}

impl Connection {
    async fn open(
        address: &str,
        connections: Arc<Mutex<HashMap<String, Arc<Connection>>>>,
    ) -> Result<Arc<Self>, ClusterError> {
        let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(address))
            .await
            .map_err(|_| ClusterError::Timeout(format!("connect to {address}")))??;
        stream.set_nodelay(true)?;
        let (mut read_half, write_half) = stream.into_split();

        let pending: Arc<PendingMap> = Arc::new(Mutex::new(HashMap::new()));
        let closed = Arc::new(AtomicBool::new(false));

        let reader = {
            let pending = Arc::clone(&pending);
            let closed = Arc::clone(&closed);
            let address = address.to_string();
            tokio::spawn(async move {
                loop {
                    match proto::read_frame(&mut read_half).await {
                        Ok(Some(PeerMessage::Response {
                            request_id,
                            data,
                            error,
                        })) => {
                            if let Some(sender) = pending.lock().await.remove(&request_id) {
                                let result = match error {
                                    Some(message) => Err(ClusterError::Remote {
                                        node: address.clone(),
                                        message,
                                    }),
                                    None => Ok(data.unwrap_or(serde_json::Value::Null)),
                                };
                                let _ = sender.send(result);
                            }
                        }
                        Ok(Some(PeerMessage::ClusterState { request_id, nodes })) => {
                            if let Some(sender) = pending.lock().await.remove(&request_id) {
                                let _ = sender.send(Ok(serde_json::to_value(nodes)
                                    .unwrap_or(serde_json::Value::Null)));
                            }
                        }
                        Ok(Some(other)) => {
                            debug!(address = %address, "ignoring unsolicited frame: {other:?}");
                        }
                        Ok(None) => break,
                        Err(err) => {
                            debug!(address = %address, "peer read failed: {err}");
                            break;
                        }
                    }
                }
                // Connection is gone: fail every waiter and deregister.
                closed.store(true, Ordering::SeqCst);
                for (_, sender) in pending.lock().await.drain() {
                    let _ = sender.send(Err(ClusterError::ConnectionLost(address.clone())));
                }
                connections.lock().await.remove(&address);
                debug!(address = %address, "peer connection closed");
            })
        };

        Ok(Arc::new(Self {
            writer: Mutex::new(write_half),
            pending,
            closed,
            reader,
        }))
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn send(&self, message: &PeerMessage) -> Result<(), ClusterError> {
        let mut writer = self.writer.lock().await;
        proto::write_frame(&mut *writer, message).await
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

// ------------------------------------------------------------------------------------------------
// NodeClient
// ------------------------------------------------------------------------------------------------

/// Request/response client over persistent peer connections.
pub struct NodeClient {
    connections: Arc<Mutex<HashMap<String, Arc<Connection>>>>,
    blacklist: Mutex<HashMap<String, Instant>>,
    known_nodes: Mutex<HashMap<String, NodeInfo>>,
    probe_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Default for NodeClient {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeClient {
    pub fn new() -> Self {
        Self {
            connections: Arc::new(Mutex::new(HashMap::new())),
            blacklist: Mutex::new(HashMap::new()),
            known_nodes: Mutex::new(HashMap::new()),
            probe_handle: Mutex::new(None),
        }
    }

    /// Starts the blacklist probe loop.
    pub async fn start(self: &Arc<Self>) {
        let client = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(PROBE_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                client.probe_blacklisted().await;
            }
        });
        *self.probe_handle.lock().await = Some(handle);
    }

    pub async fn stop(&self) {
        if let Some(handle) = self.probe_handle.lock().await.take() {
            handle.abort();
            let _ = handle.await;
        }
        self.connections.lock().await.clear();
        info!("node client stopped");
    }

    /// Remembers a peer so the probe loop can retry it while blacklisted.
    pub async fn register_node(&self, node: NodeInfo) {
        self.known_nodes.lock().await.insert(node.address(), node);
    }

    pub async fn forget_node(&self, address: &str) {
        self.known_nodes.lock().await.remove(address);
        self.connections.lock().await.remove(address);
    }

    /// Addresses currently blacklisted, with the instant they were added.
    pub async fn failed_nodes(&self) -> Vec<String> {
        self.blacklist.lock().await.keys().cloned().collect()
    }

    async fn is_blacklisted(&self, address: &str) -> bool {
        let mut blacklist = self.blacklist.lock().await;
        match blacklist.get(address) {
            Some(since) if since.elapsed() < BLACKLIST_DURATION => true,
            Some(_) => {
                blacklist.remove(address);
                false
            }
            None => false,
        }
    }

    async fn add_to_blacklist(&self, address: &str) {
        warn!(address, "peer blacklisted after repeated failures");
        self.blacklist
            .lock()
            .await
            .insert(address.to_string(), Instant::now());
    }

    /// Probes every blacklisted *known* address; a successful dial clears it.
    async fn probe_blacklisted(&self) {
        let addresses = self.failed_nodes().await;
        for address in addresses {
            if !self.known_nodes.lock().await.contains_key(&address) {
                continue;
            }
            let reachable = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(&address))
                .await
                .map(|r| r.is_ok())
                .unwrap_or(false);
            if reachable {
                info!(address = %address, "blacklisted peer reachable again");
                self.blacklist.lock().await.remove(&address);
            }
        }
    }

    async fn get_connection(&self, address: &str) -> Result<Arc<Connection>, ClusterError> {
        if self.is_blacklisted(address).await {
            return Err(ClusterError::Blacklisted(address.to_string()));
        }
        {
            let connections = self.connections.lock().await;
            if let Some(connection) = connections.get(address)
                && !connection.is_closed()
            {
                return Ok(Arc::clone(connection));
            }
        }

        let mut last_error = ClusterError::ConnectionLost(address.to_string());
        for attempt in 0..MAX_RETRIES {
            match Connection::open(address, Arc::clone(&self.connections)).await {
                Ok(connection) => {
                    self.connections
                        .lock()
                        .await
                        .insert(address.to_string(), Arc::clone(&connection));
                    return Ok(connection);
                }
                Err(err) => {
                    last_error = err;
                    tokio::time::sleep(BACKOFF_BASE * 2u32.pow(attempt)).await;
                }
            }
        }
        self.add_to_blacklist(address).await;
        Err(last_error)
    }

    /// Fire-and-forget frame to a peer (heartbeats, invalidations).
    pub async fn send_message(
        &self,
        node: &NodeInfo,
        message: &PeerMessage,
    ) -> Result<(), ClusterError> {
        let connection = self.get_connection(&node.address()).await?;
        connection.send(message).await
    }

    /// Correlated request with retry, backoff, and blacklist on exhaustion.
    pub async fn request(
        &self,
        node: &NodeInfo,
        action: &str,
        data: serde_json::Value,
        timeout: Option<Duration>,
    ) -> Result<serde_json::Value, ClusterError> {
        let address = node.address();
        let timeout = timeout.unwrap_or(REQUEST_TIMEOUT);

        let mut last_error = ClusterError::Timeout(address.clone());
        for attempt in 0..MAX_RETRIES {
            match self
                .request_once(&address, action, data.clone(), timeout)
                .await
            {
                Ok(response) => return Ok(response),
                // Application-level errors from the peer are final; retrying
                // will not change the answer.
                Err(err @ ClusterError::Remote { .. }) => return Err(err),
                Err(err @ ClusterError::Blacklisted(_)) => return Err(err),
                Err(err) => {
                    debug!(address = %address, attempt, "request attempt failed: {err}");
                    last_error = err;
                    tokio::time::sleep(BACKOFF_BASE * 2u32.pow(attempt)).await;
                }
            }
        }
        self.add_to_blacklist(&address).await;
        Err(last_error)
    }

    async fn request_once(
        &self,
        address: &str,
        action: &str,
        data: serde_json::Value,
        timeout: Duration,
    ) -> Result<serde_json::Value, ClusterError> {
        let connection = self.get_connection(address).await?;
        let request_id = Uuid::new_v4().to_string();
        let (sender, receiver) = oneshot::channel();
        connection
            .pending
            .lock()
            .await
            .insert(request_id.clone(), sender);

        let message = PeerMessage::Request {
            request_id: request_id.clone(),
            action: action.to_string(),
            data,
        };
        if let Err(err) = connection.send(&message).await {
            connection.pending.lock().await.remove(&request_id);
            return Err(err);
        }

        match tokio::time::timeout(timeout, receiver).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ClusterError::ConnectionLost(address.to_string())),
            Err(_) => {
                connection.pending.lock().await.remove(&request_id);
                Err(ClusterError::Timeout(format!("{action} on {address}")))
            }
        }
    }

    /// Seed handshake: introduce ourselves, then fetch the membership view.
    pub async fn join_handshake(
        &self,
        address: &str,
        local: NodeInfo,
    ) -> Result<Vec<NodeInfo>, ClusterError> {
        let connection = self.get_connection(address).await?;
        connection
            .send(&PeerMessage::Register { node: local })
            .await?;

        let request_id = Uuid::new_v4().to_string();
        let (sender, receiver) = oneshot::channel();
        connection
            .pending
            .lock()
            .await
            .insert(request_id.clone(), sender);
        connection
            .send(&PeerMessage::ClusterStateRequest {
                request_id: request_id.clone(),
            })
            .await?;

        let nodes = match tokio::time::timeout(REQUEST_TIMEOUT, receiver).await {
            Ok(Ok(result)) => result?,
            Ok(Err(_)) => return Err(ClusterError::ConnectionLost(address.to_string())),
            Err(_) => {
                connection.pending.lock().await.remove(&request_id);
                return Err(ClusterError::Timeout(format!("cluster_state from {address}")));
            }
        };
        Ok(serde_json::from_value(nodes)?)
    }

    // -- convenience wrappers --------------------------------------------------------------------

    /// Fetches a partition's rows for one table from its owner.
    pub async fn fetch_guild_data(
        &self,
        node: &NodeInfo,
        guild_id: u64,
        table: &str,
    ) -> Result<serde_json::Value, ClusterError> {
        self.request(
            node,
            "fetch_guild_data",
            serde_json::json!({ "guild_id": guild_id, "table": table }),
            None,
        )
        .await
    }

    /// Runs a query remotely and returns its rows.
    pub async fn query_remote(
        &self,
        node: &NodeInfo,
        table: &str,
        params: serde_json::Value,
        timeout: Option<Duration>,
    ) -> Result<serde_json::Value, ClusterError> {
        self.request(
            node,
            "query",
            serde_json::json!({ "table": table, "params": params }),
            timeout,
        )
        .await
    }

    /// Tells a peer to drop its cached copy of a partition. Best effort.
    pub async fn invalidate_cache(
        &self,
        node: &NodeInfo,
        guild_id: u64,
        table: Option<&str>,
    ) -> Result<(), ClusterError> {
        self.send_message(
            node,
            &PeerMessage::InvalidateCache {
                guild_id,
                table: table.map(str::to_string),
            },
        )
        .await
    }

    /// Forwards a write to the partition owner.
    pub async fn write_data(
        &self,
        node: &NodeInfo,
        guild_id: u64,
        table: &str,
        data: serde_json::Value,
    ) -> Result<serde_json::Value, ClusterError> {
        self.request(
            node,
            "write_data",
            serde_json::json!({ "guild_id": guild_id, "table": table, "data": data }),
            None,
        )
        .await
    }
}
