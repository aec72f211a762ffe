//! Inbound peer listener.
//!
//! Accepts persistent connections from peers and dispatches every frame:
//! application [`PeerMessage::Request`]s go to the [`RequestHandler`] and are
//! answered on the same connection with the correlated response; membership
//! frames feed the handler's membership hooks.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use super::ClusterError;
use super::proto::{self, NodeInfo, PeerMessage};

/// Callbacks the server dispatches inbound traffic to. The cluster manager
/// implements this, bridging membership frames to the node registry and
/// application requests to the engine.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    /// Handles one application request; the returned value (or error text)
    /// travels back in the correlated response.
    async fn handle_action(
        &self,
        action: &str,
        data: serde_json::Value,
    ) -> Result<serde_json::Value, String>;

    /// A peer introduced itself on a fresh connection.
    async fn on_register(&self, node: NodeInfo);

    /// A peer heartbeat arrived.
    async fn on_heartbeat(&self, node_id: &str, timestamp: u64, load_factor: f64, guild_count: u64);

    /// A peer announced departure.
    async fn on_node_leave(&self, node_id: &str);

    /// A partition owner asked us to drop cached data.
    async fn on_invalidate(&self, guild_id: u64, table: Option<String>);

    /// Current membership view for `cluster_state` requests.
    async fn cluster_nodes(&self) -> Vec<NodeInfo>;
}

/// Frame listener bound to the node's advertised address.
pub struct NodeServer {
    handle: Mutex<Option<JoinHandle<()>>>,
    local_addr: std::net::SocketAddr,
}

impl NodeServer {
    /// Binds and starts accepting peers.
    pub async fn start(
        bind_addr: &str,
        handler: Arc<dyn RequestHandler>,
    ) -> Result<Self, ClusterError> {
        let listener = TcpListener::bind(bind_addr).await?;
        let local_addr = listener.local_addr()?;
        info!(%local_addr, "node server listening");

        let handle = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer_addr)) => {
                        debug!(%peer_addr, "peer connected");
                        let handler = Arc::clone(&handler);
                        tokio::spawn(async move {
                            if let Err(err) = Self::serve_connection(stream, handler).await {
                                debug!(%peer_addr, "peer connection ended: {err}");
                            }
                        });
                    }
                    Err(err) => {
                        error!("accept failed: {err}");
                        break;
                    }
                }
            }
        });

        Ok(Self {
            handle: Mutex::new(Some(handle)),
            local_addr,
        })
    }

    pub fn local_addr(&self) -> std::net::SocketAddr {
        self.local_addr
    }

    async fn serve_connection(
        stream: TcpStream,
        handler: Arc<dyn RequestHandler>,
    ) -> Result<(), ClusterError> {
        stream.set_nodelay(true)?;
        let (mut read_half, write_half) = stream.into_split();
        let writer = Arc::new(Mutex::new(write_half));

        while let Some(message) = proto::read_frame(&mut read_half).await? {
            match message {
                PeerMessage::Request {
                    request_id,
                    action,
                    data,
                } => {
                    // Handle concurrently so one slow request does not stall
                    // the peer's other traffic on this connection.
                    let handler = Arc::clone(&handler);
                    let writer = Arc::clone(&writer);
                    tokio::spawn(async move {
                        let response = match handler.handle_action(&action, data).await {
                            Ok(data) => PeerMessage::Response {
                                request_id,
                                data: Some(data),
                                error: None,
                            },
                            Err(message) => PeerMessage::Response {
                                request_id,
                                data: None,
                                error: Some(message),
                            },
                        };
                        let mut writer = writer.lock().await;
                        if let Err(err) = proto::write_frame(&mut *writer, &response).await {
                            debug!("failed to write response: {err}");
                        }
                    });
                }
                PeerMessage::ClusterStateRequest { request_id } => {
                    let nodes = handler.cluster_nodes().await;
                    let mut writer = writer.lock().await;
                    proto::write_frame(
                        &mut *writer,
                        &PeerMessage::ClusterState { request_id, nodes },
                    )
                    .await?;
                }
                PeerMessage::Register { node } => handler.on_register(node).await,
                PeerMessage::Heartbeat {
                    node_id,
                    timestamp,
                    load_factor,
                    guild_count,
                } => {
                    handler
                        .on_heartbeat(&node_id, timestamp, load_factor, guild_count)
                        .await;
                }
                PeerMessage::NodeLeave { node_id } => handler.on_node_leave(&node_id).await,
                PeerMessage::InvalidateCache { guild_id, table } => {
                    handler.on_invalidate(guild_id, table).await;
                }
                PeerMessage::Response { .. } | PeerMessage::ClusterState { .. } => {
                    debug!("ignoring response frame on server side");
                }
            }
        }
        Ok(())
    }

    pub async fn stop(&self) {
        if let Some(handle) = self.handle.lock().await.take() {
            handle.abort();
            let _ = handle.await;
        }
        info!("node server stopped");
    }
}
