//! Inter-node wire protocol: one JSON document per frame over a persistent
//! bidirectional TCP stream, each frame prefixed with a `u32` big-endian
//! length.
//!
//! Every request carries a client-generated correlation id (`request_id`)
//! and an `action` string; the response repeats the id. Membership frames
//! (`register`, `heartbeat`, `cluster_state`, `node_leave`) and the
//! application-level `invalidate_cache` share the same envelope.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::schema::now_millis;

use super::ClusterError;

/// Upper bound on a single frame; anything larger is treated as corruption.
pub const MAX_FRAME_LEN: u32 = 64 * 1024 * 1024;

// ------------------------------------------------------------------------------------------------
// Node descriptors
// ------------------------------------------------------------------------------------------------

/// Lifecycle state of a peer as seen by the membership layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    Starting,
    Active,
    Suspect,
    Leaving,
    Dead,
}

/// Description of one cluster node, gossiped through membership frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInfo {
    pub node_id: String,
    pub host: String,
    pub port: u16,
    pub state: NodeState,
    /// Ring capacity multiplier; 1.0 is a normal node.
    #[serde(default = "default_weight")]
    pub weight: f64,
    /// Deployment cluster this node belongs to; fan-out picks one peer per
    /// cluster. Falls back to the host when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_id: Option<String>,
    /// Milliseconds since the UNIX epoch of the last heartbeat seen.
    #[serde(default)]
    pub last_heartbeat: u64,
    #[serde(default)]
    pub load_factor: f64,
    /// Number of partitions this node currently serves.
    #[serde(default)]
    pub guild_count: u64,
}

fn default_weight() -> f64 {
    1.0
}

impl NodeInfo {
    pub fn new(node_id: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            node_id: node_id.into(),
            host: host.into(),
            port,
            state: NodeState::Active,
            weight: 1.0,
            cluster_id: None,
            last_heartbeat: now_millis(),
            load_factor: 0.0,
            guild_count: 0,
        }
    }

    /// `host:port` dial address.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Cluster grouping key for fan-out reads.
    pub fn cluster_key(&self) -> String {
        self.cluster_id.clone().unwrap_or_else(|| self.host.clone())
    }

    /// A peer is healthy while its heartbeat is within `timeout_ms`.
    pub fn is_healthy(&self, timeout_ms: u64) -> bool {
        self.state == NodeState::Active
            && now_millis().saturating_sub(self.last_heartbeat) <= timeout_ms
    }
}

// ------------------------------------------------------------------------------------------------
// Messages
// ------------------------------------------------------------------------------------------------

/// Every frame that travels between peers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PeerMessage {
    /// A node introduces itself after connecting.
    Register { node: NodeInfo },

    /// Periodic liveness signal.
    Heartbeat {
        node_id: String,
        timestamp: u64,
        load_factor: f64,
        guild_count: u64,
    },

    /// Request for the full membership view.
    ClusterStateRequest { request_id: String },

    /// Response to [`PeerMessage::ClusterStateRequest`].
    ClusterState {
        request_id: String,
        nodes: Vec<NodeInfo>,
    },

    /// A node announces its departure.
    NodeLeave { node_id: String },

    /// Owner-side instruction to drop cached data for a partition.
    InvalidateCache {
        guild_id: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        table: Option<String>,
    },

    /// Correlated application request.
    Request {
        request_id: String,
        action: String,
        data: serde_json::Value,
    },

    /// Correlated response; `error` is set instead of `data` on failure.
    Response {
        request_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<serde_json::Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

// ------------------------------------------------------------------------------------------------
// Framing
// ------------------------------------------------------------------------------------------------

/// Writes one frame: `[len u32 BE][json]`.
pub async fn write_frame<W>(writer: &mut W, message: &PeerMessage) -> Result<(), ClusterError>
where
    W: AsyncWriteExt + Unpin,
{
    let payload = serde_json::to_vec(message)?;
    writer.write_all(&(payload.len() as u32).to_be_bytes()).await?;
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one frame. `Ok(None)` on clean EOF at a frame boundary.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<PeerMessage>, ClusterError>
where
    R: AsyncReadExt + Unpin,
{
    let mut len_bytes = [0u8; 4];
    match reader.read_exact(&mut len_bytes).await {
        Ok(_) => {}
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    }
    let len = u32::from_be_bytes(len_bytes);
    if len > MAX_FRAME_LEN {
        return Err(ClusterError::Internal(format!(
            "frame of {len} bytes exceeds limit"
        )));
    }
    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload).await?;
    Ok(Some(serde_json::from_slice(&payload)?))
}
