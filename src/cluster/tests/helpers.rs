use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::schema::now_millis;

use super::super::proto::NodeInfo;
use super::super::server::{NodeServer, RequestHandler};

/// Peer stub: answers `query` with fixed rows after an optional delay.
pub struct StubPeer {
    pub rows: Vec<serde_json::Value>,
    pub delay: Duration,
}

#[async_trait]
impl RequestHandler for StubPeer {
    async fn handle_action(
        &self,
        action: &str,
        _data: serde_json::Value,
    ) -> Result<serde_json::Value, String> {
        if self.delay > Duration::ZERO {
            tokio::time::sleep(self.delay).await;
        }
        match action {
            "query" | "fetch_guild_data" => Ok(serde_json::Value::Array(self.rows.clone())),
            "ping" => Ok(serde_json::json!({ "pong": true })),
            other => Err(format!("unsupported action '{other}'")),
        }
    }

    async fn on_register(&self, _node: NodeInfo) {}
    async fn on_heartbeat(&self, _node_id: &str, _ts: u64, _load: f64, _guilds: u64) {}
    async fn on_node_leave(&self, _node_id: &str) {}
    async fn on_invalidate(&self, _guild_id: u64, _table: Option<String>) {}
    async fn cluster_nodes(&self) -> Vec<NodeInfo> {
        Vec::new()
    }
}

/// Starts a stub peer on an ephemeral port; returns the server handle and a
/// healthy `NodeInfo` pointing at it.
pub async fn spawn_stub_peer(
    node_id: &str,
    cluster_id: &str,
    rows: Vec<serde_json::Value>,
    delay: Duration,
) -> (NodeServer, NodeInfo) {
    let handler = Arc::new(StubPeer { rows, delay });
    let server = NodeServer::start("127.0.0.1:0", handler).await.unwrap();
    let addr = server.local_addr();
    let mut node = NodeInfo::new(node_id, addr.ip().to_string(), addr.port());
    node.cluster_id = Some(cluster_id.to_string());
    node.last_heartbeat = now_millis();
    (server, node)
}

pub fn json_row(id: u64, name: &str) -> serde_json::Value {
    serde_json::json!({ "id": id, "name": name })
}
