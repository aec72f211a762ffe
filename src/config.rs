//! Engine configuration.
//!
//! [`EngineConfig`] carries every recognized constructor option plus the
//! ambient knobs for background services. Field names are part of the public
//! contract; embedding applications construct this struct directly.

use std::path::PathBuf;
use std::time::Duration;

use crate::cache::{QUERY_CACHE_SIZE, QUERY_CACHE_TTL};
use crate::cluster::cache::{DEFAULT_MAX_SIZE, DEFAULT_TTL};
use crate::cluster::ring::DEFAULT_VIRTUAL_NODES;
use crate::crypto::KeyMaterial;
use crate::memtable::{DEFAULT_ENTRY_LIMIT, DEFAULT_SIZE_LIMIT};
use crate::schema::now_millis;
use crate::wal::DEFAULT_RETENTION_MS;

/// Constructor options for [`crate::engine::Engine`].
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Root directory for table files, WAL, and segments.
    pub data_dir: PathBuf,

    /// Stable identifier for this node; generated from hostname and time
    /// when unset.
    pub node_id: Option<String>,

    /// Bind address advertised to peers.
    pub host: String,
    pub port: u16,

    /// Enables the cluster layer; when false the node runs standalone.
    pub cluster_enabled: bool,

    /// Virtual ring points per unit of node weight.
    pub virtual_nodes: usize,

    /// This node's capacity multiplier.
    pub node_weight: f64,

    /// Memtable thresholds that trigger a flush.
    pub memtable_size_limit: usize,
    pub memtable_entry_limit: usize,

    /// Chooses the direct-flush backend over the memtable/SSTable one.
    pub use_direct_flush: bool,

    // -- ambient knobs ---------------------------------------------------------------------------
    /// Compaction cycle interval.
    pub compaction_interval: Duration,

    /// Query-cache sizing.
    pub query_cache_size: usize,
    pub query_cache_ttl: Duration,

    /// Expired-cache sweep cadence.
    pub cache_sweep_interval: Duration,

    /// Distributed-cache sizing (cluster mode).
    pub distributed_cache_ttl: Duration,
    pub distributed_cache_size: usize,

    /// WAL files older than this are removed by cleanup.
    pub wal_retention_ms: u64,

    /// Row-encryption key material; injectable for tests and embedders.
    pub key_material: KeyMaterial,

    /// Disables row encryption entirely (plaintext segments).
    pub encryption_enabled: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data/db"),
            node_id: None,
            host: "127.0.0.1".to_string(),
            port: 7400,
            cluster_enabled: false,
            virtual_nodes: DEFAULT_VIRTUAL_NODES,
            node_weight: 1.0,
            memtable_size_limit: DEFAULT_SIZE_LIMIT,
            memtable_entry_limit: DEFAULT_ENTRY_LIMIT,
            use_direct_flush: false,
            compaction_interval: Duration::from_secs(30),
            query_cache_size: QUERY_CACHE_SIZE,
            query_cache_ttl: QUERY_CACHE_TTL,
            cache_sweep_interval: Duration::from_secs(60),
            distributed_cache_ttl: DEFAULT_TTL,
            distributed_cache_size: DEFAULT_MAX_SIZE,
            wal_retention_ms: DEFAULT_RETENTION_MS,
            key_material: KeyMaterial::default(),
            encryption_enabled: true,
        }
    }
}

impl EngineConfig {
    /// The effective node id: configured, or hostname plus startup time.
    pub fn effective_node_id(&self) -> String {
        self.node_id.clone().unwrap_or_else(generate_node_id)
    }
}

/// Generates a reasonably unique node id from hostname and current time.
pub fn generate_node_id() -> String {
    let hostname = std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "node".to_string());
    format!("{hostname}-{:x}", now_millis())
}
