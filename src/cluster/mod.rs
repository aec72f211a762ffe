//! # Cluster Module
//!
//! Horizontal partitioning of tables across peer nodes, keyed by a tenant
//! identifier. Sub-modules, leaves first:
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`snowflake`] | Whitening of timestamp-clustered ids before ring hashing |
//! | [`ring`] | Weighted consistent hash ring with virtual nodes |
//! | [`proto`] | Length-prefixed JSON frames and peer message envelopes |
//! | [`registry`] | Peer discovery, heartbeats, dead-peer eviction |
//! | [`client`] | Persistent request/response channels with retry and blacklist |
//! | [`cache`] | Read-through cache of partitions this node does not own |
//! | [`server`] | Inbound frame listener dispatching to a request handler |
//! | [`manager`] | Owner routing, invalidation broadcast, fan-out reads |
//!
//! ## Consistency model
//!
//! Writes for a partition are accepted only on the owner node (or forwarded
//! to it). Reads of non-owned partitions come from the distributed cache and
//! are eventually consistent: a write is visible remotely after the cache
//! TTL expires or the owner's invalidation broadcast is processed.

pub mod cache;
pub mod client;
pub mod manager;
pub mod proto;
pub mod registry;
pub mod ring;
pub mod server;
pub mod snowflake;

#[cfg(test)]
mod tests;

pub use cache::DistributedCache;
pub use client::NodeClient;
pub use manager::{ClusterManager, FanOutReport, MergeStrategy};
pub use proto::{NodeInfo, NodeState, PeerMessage};
pub use registry::NodeRegistry;
pub use ring::ConsistentHashRing;
pub use server::{NodeServer, RequestHandler};

use thiserror::Error;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors surfaced by the cluster layer.
#[derive(Debug, Error)]
pub enum ClusterError {
    /// Underlying socket I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Frame payload is not valid JSON.
    #[error("Frame error: {0}")]
    Frame(#[from] serde_json::Error),

    /// Request did not complete within its deadline.
    #[error("Timeout waiting for {0}")]
    Timeout(String),

    /// Peer connection dropped mid-request; safe to retry.
    #[error("Connection to {0} lost")]
    ConnectionLost(String),

    /// Peer is blacklisted after repeated failures.
    #[error("Node {0} is blacklisted")]
    Blacklisted(String),

    /// No owner is reachable for the partition.
    #[error("No reachable owner for partition {0}")]
    NoOwner(u64),

    /// The owner node reported an application-level error.
    #[error("Remote error from {node}: {message}")]
    Remote { node: String, message: String },

    /// Internal invariant violation.
    #[error("Internal error: {0}")]
    Internal(String),
}
