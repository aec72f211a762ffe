//! # Engine Façade
//!
//! The public surface of the store: table lifecycle, row operations,
//! queries, transactions, maintenance, and cluster wiring.
//!
//! ## Design Overview
//!
//! The engine keeps each table's column-major buffers in memory as the
//! materialized current state and delegates durability to a storage backend
//! chosen at construction ([`backend::LsmBackend`] or
//! [`backend::DirectBackend`]). Reads execute over the buffers; writes go
//! backend-first, then buffers, then indexes, then cache invalidation, so a
//! crash can lose at most unacknowledged work.
//!
//! ## Transactions
//!
//! Transactional operations are validated and WAL-logged immediately but
//! buffered until commit; the commit callback applies them through the same
//! write path and persists the affected table files. An aborted transaction
//! leaves no trace in the visible state.
//!
//! ## Recovery
//!
//! On open: table files are loaded for their schemas (a checksum mismatch is
//! logged and treated as a missing table), buffers are rebuilt from the
//! backend's merged scan, indexes are rebuilt from the buffers, and the WAL
//! is replayed — committed transactions are re-applied (idempotent for
//! explicit row ids), pending ones are treated as aborted.
//!
//! ## Cluster mode
//!
//! With `cluster_enabled`, writes to a partitioned table are accepted only
//! on the ring owner and forwarded otherwise; the forwarded error, if any,
//! is the owner's. After a local write the engine broadcasts cache
//! invalidation for the partition.

// ------------------------------------------------------------------------------------------------
// Sub-modules
// ------------------------------------------------------------------------------------------------

pub mod backend;
mod handler;

#[cfg(test)]
mod tests;

pub use backend::{DirectBackend, LsmBackend, StorageBackend};

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::cache::QueryCache;
use crate::cluster::{ClusterError, ClusterManager};
use crate::cluster::manager::{FanOutReport, MergeStrategy};
use crate::cluster::proto::NodeInfo;
use crate::codec::CodecError;
use crate::compaction::CompactionError;
use crate::config::EngineConfig;
use crate::crypto::{CryptoError, CryptoManager};
use crate::flush::FlushError;
use crate::index::{IndexError, IndexManager, IndexType};
use crate::memtable::MemtableError;
use crate::query::{QueryBuilder, QueryError};
use crate::registry::RegistryError;
use crate::schema::{Row, SchemaError, TableSchema, Value, row_to_json};
use crate::segment::SegmentError;
use crate::sstable::SstableError;
use crate::table::{Table, TableError};
use crate::txn::{Operation, Transaction, TransactionManager, TxnError};
use crate::wal::{OpType, Wal, WalError};

// ------------------------------------------------------------------------------------------------
// Constants
// ------------------------------------------------------------------------------------------------

const TABLES_DIR: &str = "tables";
const WAL_DIR: &str = "wal";
const SEGMENTS_DIR: &str = "segments";
const TABLE_FILE_EXT: &str = "coldb";

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors surfaced by the engine façade.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Unknown table.
    #[error("Table '{0}' not found")]
    TableNotFound(String),

    /// Direct lookup missed.
    #[error("Row {row_id} not found in table '{table}'")]
    RowNotFound { table: String, row_id: u64 },

    /// `create_table` against an existing name without `if_not_exists`.
    #[error("Table '{0}' already exists")]
    TableExists(String),

    /// Null in a non-null column, unknown column, bad coercion, or a
    /// violated unique constraint.
    #[error("Schema violation: {0}")]
    SchemaViolation(String),

    /// Checksum/magic/CRC mismatch or decryption failure.
    #[error("Integrity failure: {0}")]
    Integrity(String),

    /// Operation against an object in the wrong state.
    #[error("Illegal state: {0}")]
    IllegalState(String),

    /// Partition owner unreachable after retries.
    #[error("Cluster routing failure: {0}")]
    ClusterRouting(String),

    /// Network or request deadline exceeded.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Connection dropped mid-request; retryable.
    #[error("Transient failure: {0}")]
    Transient(String),

    /// The partition owner rejected a forwarded write; the message is the
    /// owner's error, not the forwarding failure.
    #[error("Remote node {node}: {message}")]
    Remote { node: String, message: String },

    /// Underlying filesystem I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Background task failure.
    #[error("Internal error: {0}")]
    Internal(String),

    // -- subsystem wrappers ----------------------------------------------------------------------
    #[error(transparent)]
    Schema(#[from] SchemaError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    Table(#[from] TableError),
    #[error(transparent)]
    Memtable(#[from] MemtableError),
    #[error(transparent)]
    Sstable(#[from] SstableError),
    #[error(transparent)]
    Segment(#[from] SegmentError),
    #[error(transparent)]
    Wal(#[from] WalError),
    #[error(transparent)]
    Txn(#[from] TxnError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Flush(#[from] FlushError),
    #[error(transparent)]
    Compaction(#[from] CompactionError),
    #[error(transparent)]
    Index(#[from] IndexError),
    #[error(transparent)]
    Query(#[from] QueryError),
}

impl From<ClusterError> for EngineError {
    fn from(err: ClusterError) -> Self {
        match err {
            ClusterError::Timeout(what) => EngineError::Timeout(what),
            ClusterError::ConnectionLost(peer) => {
                EngineError::Transient(format!("connection to {peer} lost"))
            }
            ClusterError::Remote { node, message } => EngineError::Remote { node, message },
            other => EngineError::ClusterRouting(other.to_string()),
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Engine
// ------------------------------------------------------------------------------------------------

struct EngineInner {
    config: EngineConfig,
    node_id: String,
    crypto: Arc<CryptoManager>,
    backend: Box<dyn StorageBackend>,
    tables: RwLock<HashMap<String, Arc<RwLock<Table>>>>,
    indexes: std::sync::RwLock<IndexManager>,
    txn: TransactionManager,
    query_cache: Arc<QueryCache>,
    cluster: Option<Arc<ClusterManager>>,
    /// Serializes all writes within this engine instance.
    write_lock: Mutex<()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// The store's public handle. Cheap to clone; all clones share one engine.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    // -- lifecycle -------------------------------------------------------------------------------

    /// Opens (or creates) an engine rooted at `config.data_dir`, recovers
    /// persisted state, and starts background services.
    pub async fn open(config: EngineConfig) -> Result<Self, EngineError> {
        let data_dir = config.data_dir.clone();
        std::fs::create_dir_all(data_dir.join(TABLES_DIR))?;
        std::fs::create_dir_all(data_dir.join(WAL_DIR))?;
        std::fs::create_dir_all(data_dir.join(SEGMENTS_DIR))?;

        let node_id = config.effective_node_id();
        let crypto = Arc::new(
            CryptoManager::new(&config.key_material)
                .with_encryption_enabled(config.encryption_enabled),
        );

        let backend: Box<dyn StorageBackend> = if config.use_direct_flush {
            Box::new(DirectBackend::open(data_dir.join(SEGMENTS_DIR), Arc::clone(&crypto)).await?)
        } else {
            Box::new(
                LsmBackend::open(
                    data_dir.join(SEGMENTS_DIR),
                    config.memtable_size_limit,
                    config.memtable_entry_limit,
                    config.compaction_interval,
                )
                .await?,
            )
        };

        let wal = Arc::new(Wal::open(data_dir.join(WAL_DIR))?);
        let txn = TransactionManager::new(wal);
        let query_cache = Arc::new(QueryCache::new(
            config.query_cache_size,
            config.query_cache_ttl,
        ));

        let cluster = if config.cluster_enabled {
            let mut local = NodeInfo::new(node_id.clone(), config.host.clone(), config.port);
            local.weight = config.node_weight;
            Some(ClusterManager::new(
                local,
                config.virtual_nodes,
                config.node_weight,
                config.distributed_cache_ttl,
                config.distributed_cache_size,
            ))
        } else {
            None
        };

        let inner = Arc::new(EngineInner {
            config,
            node_id,
            crypto,
            backend,
            tables: RwLock::new(HashMap::new()),
            indexes: std::sync::RwLock::new(IndexManager::new()),
            txn,
            query_cache,
            cluster,
            write_lock: Mutex::new(()),
            tasks: Mutex::new(Vec::new()),
        });
        let engine = Self { inner };

        engine.load_tables().await?;
        engine.recover().await?;
        engine.register_txn_callbacks();
        engine.start_background_tasks().await;

        if let Some(cluster) = &engine.inner.cluster {
            cluster
                .register_data_handler(Arc::new(handler::EngineHandler::new(engine.clone())))
                .await;
            cluster.start(&[]).await?;
        }

        info!(node = %engine.inner.node_id, "engine opened");
        Ok(engine)
    }

    /// Flushes everything, persists table files, and stops all services.
    pub async fn close(&self) -> Result<(), EngineError> {
        self.flush_all().await?;
        self.inner.backend.close().await?;
        for task in self.inner.tasks.lock().await.drain(..) {
            task.abort();
            let _ = task.await;
        }
        if let Some(cluster) = &self.inner.cluster {
            cluster.stop().await;
        }
        info!("engine closed");
        Ok(())
    }

    pub fn node_id(&self) -> &str {
        &self.inner.node_id
    }

    pub fn crypto(&self) -> &Arc<CryptoManager> {
        &self.inner.crypto
    }

    async fn start_background_tasks(&self) {
        let query_cache = Arc::clone(&self.inner.query_cache);
        let sweep_interval = self.inner.config.cache_sweep_interval;
        let mut tasks = self.inner.tasks.lock().await;
        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sweep_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                query_cache.sweep_expired();
            }
        }));

        let txn_wal_retention = self.inner.config.wal_retention_ms;
        let engine = self.clone();
        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(3600));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(err) = engine.inner.txn.cleanup(txn_wal_retention).await {
                    warn!("WAL cleanup failed: {err}");
                }
            }
        }));
    }

    // -- startup: table files, buffers, recovery -------------------------------------------------

    fn table_file_path(&self, table: &str) -> PathBuf {
        self.inner
            .config
            .data_dir
            .join(TABLES_DIR)
            .join(format!("{table}.{TABLE_FILE_EXT}"))
    }

    /// Loads every table file for its schema, registers the table with the
    /// backend, and rebuilds buffers from the backend's merged state.
    async fn load_tables(&self) -> Result<(), EngineError> {
        let tables_dir = self.inner.config.data_dir.join(TABLES_DIR);
        for entry in std::fs::read_dir(&tables_dir)? {
            let path = entry?.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(TABLE_FILE_EXT) {
                continue;
            }
            let bytes = std::fs::read(&path)?;
            let loaded = match Table::from_file_bytes(&bytes) {
                Ok(table) => table,
                Err(err) => {
                    // Treat a damaged table file as missing.
                    warn!("skipping damaged table file {}: {err}", path.display());
                    continue;
                }
            };
            let name = loaded.schema.name.clone();
            self.adopt_table(Table::new(loaded.schema)).await?;
            info!(table = %name, "table loaded");
        }
        Ok(())
    }

    /// Registers a table with the backend, rebuilds its buffers from the
    /// backend scan, and rebuilds its indexes.
    async fn adopt_table(&self, mut table: Table) -> Result<(), EngineError> {
        let name = table.schema.name.clone();
        let columns: Vec<_> = table
            .schema
            .columns
            .iter()
            .map(|column| (column.name.clone(), column.data_type))
            .collect();
        self.inner.backend.register_table(&name, columns).await?;

        for (row_id, row) in self.inner.backend.scan(&name, None, None).await? {
            table.upsert_row(row_id, &row);
            table.observe_row_id(row_id);
        }
        self.restore_auto_increment(&mut table);

        {
            let mut indexes = self.inner.indexes.write().expect("index lock poisoned");
            for column in table.schema.index_columns.clone() {
                let entries = table.column_entries(&column)?;
                indexes.build_index(&name, &column, &entries, IndexType::BTree);
            }
        }

        self.inner
            .tables
            .write()
            .await
            .insert(name, Arc::new(RwLock::new(table)));
        Ok(())
    }

    /// Resumes the auto-increment counter past the highest persisted value.
    fn restore_auto_increment(&self, table: &mut Table) {
        let auto_columns: Vec<String> = table
            .schema
            .columns
            .iter()
            .filter(|column| column.auto_increment)
            .map(|column| column.name.clone())
            .collect();
        for column in auto_columns {
            if let Ok(entries) = table.column_entries(&column) {
                let max = entries
                    .iter()
                    .filter_map(|(value, _)| value.as_i64())
                    .max()
                    .unwrap_or(0);
                table.observe_auto_increment(max);
            }
        }
    }

    /// Replays the WAL: committed transactions are re-applied, pending ones
    /// are treated as aborted.
    async fn recover(&self) -> Result<(), EngineError> {
        let report = self.inner.txn.recover().await?;
        for txn in &report.pending {
            warn!(txn_id = %txn.id, "treating crashed transaction as aborted");
        }
        for txn in &report.committed {
            for operation in &txn.operations {
                if let Err(err) = self.apply_operation(operation).await {
                    warn!(
                        txn_id = %txn.id,
                        table = %operation.table,
                        "skipping unreplayable operation: {err}"
                    );
                }
            }
        }
        Ok(())
    }

    fn register_txn_callbacks(&self) {
        let engine = self.clone();
        self.inner.txn.on_commit(Arc::new(move |txn: Transaction| {
            let engine = engine.clone();
            Box::pin(async move {
                if let Err(err) = engine.apply_committed(&txn).await {
                    error!(txn_id = %txn.id, "failed to apply committed transaction: {err}");
                }
            })
        }));

        self.inner.txn.on_abort(Arc::new(move |txn: Transaction| {
            Box::pin(async move {
                info!(txn_id = %txn.id, ops = txn.operations.len(), "transaction rolled back");
            })
        }));
    }

    /// Applies and persists every operation of a committed transaction.
    async fn apply_committed(&self, txn: &Transaction) -> Result<(), EngineError> {
        let mut touched: Vec<String> = Vec::new();
        for operation in &txn.operations {
            self.apply_operation(operation).await?;
            if !touched.contains(&operation.table) {
                touched.push(operation.table.clone());
            }
        }
        for table in touched {
            self.save_table(&table).await?;
        }
        Ok(())
    }

    /// Applies one WAL operation through the regular write path.
    async fn apply_operation(&self, operation: &Operation) -> Result<(), EngineError> {
        let table_arc = self.table_handle(&operation.table).await?;
        let row_id = operation
            .row_id
            .ok_or_else(|| EngineError::Internal("operation without row id".into()))?;

        match operation.op_type {
            OpType::Insert | OpType::Update => {
                let row = {
                    let table = table_arc.read().await;
                    coerce_row(&table.schema, &operation.data)?
                };
                if operation.op_type == OpType::Insert {
                    self.inner
                        .backend
                        .insert(&operation.table, row_id, row.clone())
                        .await?;
                } else {
                    self.inner
                        .backend
                        .update(&operation.table, row_id, row.clone())
                        .await?;
                }
                let mut table = table_arc.write().await;
                self.unindex_row(&table, row_id);
                table.upsert_row(row_id, &row);
                self.index_row(&table, row_id);
            }
            OpType::Delete => {
                self.inner.backend.delete(&operation.table, row_id).await?;
                let mut table = table_arc.write().await;
                self.unindex_row(&table, row_id);
                let _ = table.remove_row(row_id);
            }
            OpType::CreateTable | OpType::DropTable => {
                // Schema operations are persisted through table files, not
                // replayed from the WAL.
            }
        }
        self.invalidate_caches(&operation.table).await;
        Ok(())
    }

    // -- schema lifecycle ------------------------------------------------------------------------

    /// Creates a table, its indexes, and its on-disk table file.
    ///
    /// With `if_not_exists`, an existing table adopts the richer provided
    /// schema (constraint flags are not part of the table-file format) and
    /// `Ok(false)` is returned.
    pub async fn create_table(
        &self,
        schema: TableSchema,
        if_not_exists: bool,
    ) -> Result<bool, EngineError> {
        let name = schema.name.clone();
        let exists = self.inner.tables.read().await.contains_key(&name);
        if exists {
            if !if_not_exists {
                return Err(EngineError::TableExists(name));
            }
            // Re-adopt the provided schema over the file-derived one.
            let table_arc = self.table_handle(&name).await?;
            {
                let mut table = table_arc.write().await;
                let richer = schema.clone();
                table.schema = richer;
                self.restore_auto_increment(&mut table);
                let mut indexes = self.inner.indexes.write().expect("index lock poisoned");
                for column in table.schema.index_columns.clone() {
                    if !indexes.has_index(&name, &column) {
                        let entries = table.column_entries(&column)?;
                        indexes.build_index(&name, &column, &entries, IndexType::BTree);
                    }
                }
            }
            return Ok(false);
        }

        self.adopt_table(Table::new(schema)).await?;
        self.save_table(&name).await?;
        info!(table = %name, "table created");
        Ok(true)
    }

    /// Drops a table, its segments, its indexes, and its table file.
    pub async fn drop_table(&self, name: &str, if_exists: bool) -> Result<bool, EngineError> {
        let removed = self.inner.tables.write().await.remove(name);
        if removed.is_none() {
            if if_exists {
                return Ok(false);
            }
            return Err(EngineError::TableNotFound(name.to_string()));
        }

        self.inner.backend.drop_table(name).await?;
        self.inner
            .indexes
            .write()
            .expect("index lock poisoned")
            .drop_table(name);
        let path = self.table_file_path(name);
        if path.exists() {
            std::fs::remove_file(&path)?;
        }
        self.invalidate_caches(name).await;
        info!(table = %name, "table dropped");
        Ok(true)
    }

    pub async fn list_tables(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.tables.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Schema and size description of one table.
    pub async fn get_table_info(&self, name: &str) -> Result<serde_json::Value, EngineError> {
        let table_arc = self.table_handle(name).await?;
        let table = table_arc.read().await;
        let indexes = self
            .inner
            .indexes
            .read()
            .expect("index lock poisoned")
            .list_indexes(name);
        Ok(serde_json::json!({
            "name": table.schema.name,
            "row_count": table.row_count(),
            "primary_key": table.schema.primary_key,
            "partition_key": table.schema.partition_key,
            "created_at": table.schema.created_at,
            "indexes": indexes,
            "columns": table.schema.columns.iter().map(|column| serde_json::json!({
                "name": column.name,
                "data_type": format!("{:?}", column.data_type),
                "nullable": column.nullable,
                "indexed": column.indexed,
                "unique": column.unique,
                "primary_key": column.primary_key,
                "auto_increment": column.auto_increment,
            })).collect::<Vec<_>>(),
        }))
    }

    async fn table_handle(&self, name: &str) -> Result<Arc<RwLock<Table>>, EngineError> {
        self.inner
            .tables
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::TableNotFound(name.to_string()))
    }

    /// Persists a table's schema and buffers as its table file.
    async fn save_table(&self, name: &str) -> Result<(), EngineError> {
        let table_arc = self.table_handle(name).await?;
        let bytes = {
            let table = table_arc.read().await;
            table.to_file_bytes()?
        };
        let path = self.table_file_path(name);
        let temp = path.with_extension("tmp");
        tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            use std::io::Write;
            let mut file = std::fs::File::create(&temp)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
            std::fs::rename(&temp, &path)
        })
        .await
        .map_err(|err| EngineError::Internal(format!("table save task failed: {err}")))??;
        Ok(())
    }

    // -- validation ------------------------------------------------------------------------------

    /// Validates and coerces an input row against the schema, filling
    /// defaults and auto-increment values and enforcing null and unique
    /// constraints.
    fn validate_insert(
        &self,
        table: &mut Table,
        data: &serde_json::Value,
    ) -> Result<Row, EngineError> {
        let object = data
            .as_object()
            .ok_or_else(|| EngineError::SchemaViolation("row payload must be an object".into()))?;
        for key in object.keys() {
            if table.schema.get_column(key).is_none() {
                return Err(EngineError::SchemaViolation(format!(
                    "unknown column '{key}' in table '{}'",
                    table.schema.name
                )));
            }
        }

        let mut row = Row::new();
        let columns = table.schema.columns.clone();
        for column in &columns {
            let provided = object.get(&column.name);
            let mut value = match provided {
                Some(json) => Value::from_json(json, column.data_type)
                    .map_err(|err| EngineError::SchemaViolation(err.to_string()))?,
                None => column.default.clone().unwrap_or(Value::Null),
            };
            if value.is_null() && column.auto_increment {
                value = match column.data_type {
                    crate::schema::DataType::Int32 => {
                        Value::Int32(table.allocate_auto_increment() as i32)
                    }
                    _ => Value::Int64(table.allocate_auto_increment()),
                };
            }
            if value.is_null() && !column.nullable {
                return Err(EngineError::SchemaViolation(format!(
                    "column '{}' is not nullable and has no default",
                    column.name
                )));
            }
            if !value.is_null() {
                row.insert(column.name.clone(), value);
            }
        }

        // Unique constraints go through the column indexes.
        let indexes = self.inner.indexes.read().expect("index lock poisoned");
        for column in &columns {
            if !(column.unique || column.primary_key) {
                continue;
            }
            if let Some(value) = row.get(&column.name)
                && !indexes.search(&table.schema.name, &column.name, value).is_empty()
            {
                return Err(EngineError::SchemaViolation(format!(
                    "duplicate value for unique column '{}'",
                    column.name
                )));
            }
        }
        Ok(row)
    }

    /// Coerces a partial update payload; unknown columns are rejected.
    fn validate_update(
        table: &Table,
        data: &serde_json::Value,
    ) -> Result<Row, EngineError> {
        let object = data
            .as_object()
            .ok_or_else(|| EngineError::SchemaViolation("row payload must be an object".into()))?;
        let mut row = Row::new();
        for (key, json) in object {
            let column = table.schema.get_column(key).ok_or_else(|| {
                EngineError::SchemaViolation(format!(
                    "unknown column '{key}' in table '{}'",
                    table.schema.name
                ))
            })?;
            let value = Value::from_json(json, column.data_type)
                .map_err(|err| EngineError::SchemaViolation(err.to_string()))?;
            if value.is_null() && !column.nullable {
                return Err(EngineError::SchemaViolation(format!(
                    "column '{}' is not nullable",
                    column.name
                )));
            }
            row.insert(key.clone(), value);
        }
        Ok(row)
    }

    fn index_row(&self, table: &Table, row_id: u64) {
        let mut indexes = self.inner.indexes.write().expect("index lock poisoned");
        for column in &table.schema.index_columns {
            if let Some(value) = table.cell(row_id, column) {
                indexes.insert_entry(&table.schema.name, column, &value, row_id);
            }
        }
    }

    fn unindex_row(&self, table: &Table, row_id: u64) {
        let mut indexes = self.inner.indexes.write().expect("index lock poisoned");
        for column in &table.schema.index_columns {
            if let Some(value) = table.cell(row_id, column) {
                indexes.delete_entry(&table.schema.name, column, &value, row_id);
            }
        }
    }

    pub(crate) async fn invalidate_caches(&self, table: &str) {
        self.inner.query_cache.invalidate_table(table);
    }

    // -- partition routing -----------------------------------------------------------------------

    fn partition_of(schema: &TableSchema, row: &serde_json::Value) -> Option<u64> {
        let key = schema.partition_key.as_deref()?;
        let value = row.get(key)?;
        value
            .as_u64()
            .or_else(|| value.as_i64().and_then(|v| u64::try_from(v).ok()))
            .or_else(|| value.as_str().and_then(|s| s.parse().ok()))
    }

    /// Owner node for a partition when this node is not it.
    async fn foreign_owner(&self, partition: Option<u64>) -> Option<(u64, NodeInfo)> {
        let cluster = self.inner.cluster.as_ref()?;
        let partition = partition?;
        if cluster.is_owner(partition).await {
            return None;
        }
        cluster.owner_node(partition).await.map(|node| (partition, node))
    }

    async fn after_local_write(&self, table: &str, partition: Option<u64>) {
        self.invalidate_caches(table).await;
        if let (Some(cluster), Some(partition)) = (&self.inner.cluster, partition) {
            cluster.broadcast_invalidation(partition, Some(table)).await;
        }
    }

    // -- row operations --------------------------------------------------------------------------

    /// Inserts a row. Returns the issued row id. With a transaction id the
    /// operation is WAL-logged and buffered until commit.
    pub async fn insert(
        &self,
        table: &str,
        data: serde_json::Value,
        txn: Option<&str>,
    ) -> Result<u64, EngineError> {
        let table_arc = self.table_handle(table).await?;

        // Owner-authority: non-owner writes are forwarded, and a forwarded
        // failure carries the owner's error.
        let partition = {
            let guard = table_arc.read().await;
            Self::partition_of(&guard.schema, &data)
        };
        if let Some((partition, owner)) = self.foreign_owner(partition).await {
            let cluster = self.inner.cluster.as_ref().expect("checked above");
            let response = cluster
                .client()
                .write_data(&owner, partition, table, data)
                .await?;
            return response
                .get("row_id")
                .and_then(|id| id.as_u64())
                .ok_or_else(|| EngineError::Internal("owner returned no row id".into()));
        }

        let _write = self.inner.write_lock.lock().await;
        let (row_id, row) = {
            let mut guard = table_arc.write().await;
            let row = self.validate_insert(&mut guard, &data)?;
            (guard.allocate_row_id(), row)
        };

        if let Some(txn_id) = txn {
            self.inner
                .txn
                .add_operation(
                    txn_id,
                    Operation::new(OpType::Insert, table, Some(row_id), row_to_json(&row)),
                )
                .await?;
            return Ok(row_id);
        }

        self.inner.backend.insert(table, row_id, row.clone()).await?;
        {
            let mut guard = table_arc.write().await;
            guard.upsert_row(row_id, &row);
            self.index_row(&guard, row_id);
        }
        self.after_local_write(table, partition).await;
        Ok(row_id)
    }

    /// Inserts many rows; returns the issued row ids in order.
    pub async fn insert_many(
        &self,
        table: &str,
        rows: Vec<serde_json::Value>,
        txn: Option<&str>,
    ) -> Result<Vec<u64>, EngineError> {
        let mut row_ids = Vec::with_capacity(rows.len());
        for data in rows {
            row_ids.push(self.insert(table, data, txn).await?);
        }
        Ok(row_ids)
    }

    /// Merges a partial row into an existing row. Returns whether the row
    /// existed.
    pub async fn update(
        &self,
        table: &str,
        row_id: u64,
        data: serde_json::Value,
        txn: Option<&str>,
    ) -> Result<bool, EngineError> {
        let table_arc = self.table_handle(table).await?;

        let partition = {
            let guard = table_arc.read().await;
            guard
                .get_row(row_id)
                .map(|row| row_to_json(&row))
                .and_then(|row| Self::partition_of(&guard.schema, &row))
        };
        if let Some((_, owner)) = self.foreign_owner(partition).await {
            let cluster = self.inner.cluster.as_ref().expect("checked above");
            let response = cluster
                .client()
                .request(
                    &owner,
                    "update",
                    serde_json::json!({ "table": table, "row_id": row_id, "data": data }),
                    None,
                )
                .await?;
            return Ok(response
                .get("updated")
                .and_then(|v| v.as_bool())
                .unwrap_or(false));
        }

        let _write = self.inner.write_lock.lock().await;
        let partial = {
            let guard = table_arc.read().await;
            if guard.get_row(row_id).is_none() {
                return Ok(false);
            }
            Self::validate_update(&guard, &data)?
        };

        if let Some(txn_id) = txn {
            self.inner
                .txn
                .add_operation(
                    txn_id,
                    Operation::new(OpType::Update, table, Some(row_id), row_to_json(&partial)),
                )
                .await?;
            return Ok(true);
        }

        self.inner.backend.update(table, row_id, partial.clone()).await?;
        {
            let mut guard = table_arc.write().await;
            self.unindex_row(&guard, row_id);
            guard.upsert_row(row_id, &partial);
            self.index_row(&guard, row_id);
        }
        self.after_local_write(table, partition).await;
        Ok(true)
    }

    /// Deletes a row (tombstone in the backend). Returns whether it existed.
    pub async fn delete(
        &self,
        table: &str,
        row_id: u64,
        txn: Option<&str>,
    ) -> Result<bool, EngineError> {
        let table_arc = self.table_handle(table).await?;

        let partition = {
            let guard = table_arc.read().await;
            guard
                .get_row(row_id)
                .map(|row| row_to_json(&row))
                .and_then(|row| Self::partition_of(&guard.schema, &row))
        };
        if let Some((_, owner)) = self.foreign_owner(partition).await {
            let cluster = self.inner.cluster.as_ref().expect("checked above");
            let response = cluster
                .client()
                .request(
                    &owner,
                    "delete",
                    serde_json::json!({ "table": table, "row_id": row_id }),
                    None,
                )
                .await?;
            return Ok(response
                .get("deleted")
                .and_then(|v| v.as_bool())
                .unwrap_or(false));
        }

        let _write = self.inner.write_lock.lock().await;
        {
            let guard = table_arc.read().await;
            if guard.get_row(row_id).is_none() {
                return Ok(false);
            }
        }

        if let Some(txn_id) = txn {
            self.inner
                .txn
                .add_operation(
                    txn_id,
                    Operation::new(OpType::Delete, table, Some(row_id), serde_json::json!({})),
                )
                .await?;
            return Ok(true);
        }

        self.inner.backend.delete(table, row_id).await?;
        {
            let mut guard = table_arc.write().await;
            self.unindex_row(&guard, row_id);
            guard.remove_row(row_id)?;
        }
        self.after_local_write(table, partition).await;
        Ok(true)
    }

    // -- queries ---------------------------------------------------------------------------------

    /// Query builder entry point; execute with [`Engine::select`].
    pub fn query(&self, table: &str) -> QueryBuilder {
        QueryBuilder::new(table)
    }

    /// Executes a query over the table, going through the query cache.
    pub async fn select(&self, query: &QueryBuilder) -> Result<Vec<Row>, EngineError> {
        let table = query.table().to_string();
        let params = query.to_params();
        if let Some(cached) = self.inner.query_cache.get(&table, &params) {
            return Ok(cached);
        }

        let table_arc = self.table_handle(&table).await?;
        let rows = {
            let guard = table_arc.read().await;
            guard.rows()
        };
        let result = query.execute(rows);
        self.inner.query_cache.set(&table, &params, &result);
        Ok(result)
    }

    /// First row matching `column = value`, index-accelerated when possible.
    pub async fn find_one(
        &self,
        table: &str,
        column: &str,
        value: &Value,
    ) -> Result<Option<Row>, EngineError> {
        let table_arc = self.table_handle(table).await?;
        let guard = table_arc.read().await;

        let indexed = self
            .inner
            .indexes
            .read()
            .expect("index lock poisoned")
            .has_index(table, column);
        if indexed {
            let row_ids = self
                .inner
                .indexes
                .read()
                .expect("index lock poisoned")
                .search(table, column, value);
            return Ok(row_ids.first().and_then(|row_id| guard.get_row(*row_id)));
        }

        Ok(guard.rows().into_iter().find(|row| {
            row.get(column)
                .is_some_and(|cell| cell.loose_cmp(value) == Some(std::cmp::Ordering::Equal))
        }))
    }

    /// Exact lookup by an identifier column.
    pub async fn find_by_id(
        &self,
        table: &str,
        column: &str,
        value: &Value,
    ) -> Result<Option<Row>, EngineError> {
        self.find_one(table, column, value).await
    }

    /// Direct row fetch by internal row id, reading the durable backend.
    pub async fn fetch_row(&self, table: &str, row_id: u64) -> Result<Option<Row>, EngineError> {
        // Guard against unknown tables before hitting the backend.
        let _ = self.table_handle(table).await?;
        self.inner.backend.get(table, row_id).await
    }

    /// Number of rows matching the query (all rows when `None`).
    pub async fn count(&self, table: &str, query: Option<&QueryBuilder>) -> Result<u64, EngineError> {
        match query {
            None => {
                let table_arc = self.table_handle(table).await?;
                let guard = table_arc.read().await;
                Ok(guard.row_count() as u64)
            }
            Some(query) => Ok(self.select(query).await?.len() as u64),
        }
    }

    /// Whether any row matches the query.
    pub async fn exists(&self, table: &str, query: &QueryBuilder) -> Result<bool, EngineError> {
        let _ = self.table_handle(table).await?;
        Ok(!self.select(query).await?.is_empty())
    }

    // -- transactions ----------------------------------------------------------------------------

    /// Begins a transaction; the returned id feeds the row operations and
    /// [`Engine::commit`]/[`Engine::rollback`].
    pub async fn begin(&self) -> String {
        self.inner.txn.begin().await
    }

    /// Durably commits; buffered operations are applied before this returns.
    pub async fn commit(&self, txn_id: &str) -> Result<(), EngineError> {
        Ok(self.inner.txn.commit(txn_id).await?)
    }

    /// Durably aborts; buffered operations are discarded.
    pub async fn rollback(&self, txn_id: &str) -> Result<(), EngineError> {
        Ok(self.inner.txn.abort(txn_id).await?)
    }

    // -- maintenance -----------------------------------------------------------------------------

    /// Flushes every table's buffered data and persists table files.
    pub async fn flush_all(&self) -> Result<(), EngineError> {
        for table in self.list_tables().await {
            self.inner.backend.flush(&table).await?;
            self.save_table(&table).await?;
        }
        Ok(())
    }

    /// Flushes, then copies the whole data directory to `target`.
    pub async fn backup(&self, target: impl AsRef<Path>) -> Result<(), EngineError> {
        self.flush_all().await?;
        let source = self.inner.config.data_dir.clone();
        let target = target.as_ref().to_path_buf();
        tokio::task::spawn_blocking(move || copy_tree(&source, &target))
            .await
            .map_err(|err| EngineError::Internal(format!("backup task failed: {err}")))??;
        info!("backup finished");
        Ok(())
    }

    /// Copies a backup into a data directory. Must run before [`Engine::open`]
    /// on that directory.
    pub fn restore(backup_dir: impl AsRef<Path>, data_dir: impl AsRef<Path>) -> Result<(), EngineError> {
        copy_tree(backup_dir.as_ref(), data_dir.as_ref())?;
        info!("restore finished");
        Ok(())
    }

    /// Engine-wide statistics snapshot.
    pub async fn stats(&self) -> serde_json::Value {
        let tables = self.inner.tables.read().await;
        let mut table_stats = serde_json::Map::new();
        for (name, table_arc) in tables.iter() {
            let guard = table_arc.read().await;
            table_stats.insert(
                name.clone(),
                serde_json::json!({
                    "row_count": guard.row_count(),
                    "columns": guard.schema.columns.len(),
                    "partition_key": guard.schema.partition_key,
                }),
            );
        }
        drop(tables);

        let cache = self.inner.query_cache.stats();
        let mut stats = serde_json::json!({
            "node_id": self.inner.node_id,
            "tables": table_stats,
            "storage": self.inner.backend.stats().await,
            "query_cache": {
                "entries": cache.entries,
                "memory_bytes": cache.memory_bytes,
                "hits": cache.hits,
                "misses": cache.misses,
                "hit_rate": cache.hit_rate,
            },
            "active_transactions": self.inner.txn.active_transactions().await.len(),
        });
        if let Some(cluster) = &self.inner.cluster {
            stats["cluster"] = cluster.stats().await;
        }
        stats
    }

    // -- cluster ---------------------------------------------------------------------------------

    /// Joins the cluster through seed addresses. Fails on a standalone
    /// engine.
    pub async fn join_cluster(&self, seeds: &[String]) -> Result<(), EngineError> {
        let cluster = self.inner.cluster.as_ref().ok_or_else(|| {
            EngineError::IllegalState("cluster support is disabled on this engine".into())
        })?;
        Ok(cluster.registry().join_cluster(seeds).await?)
    }

    /// Cluster statistics; `None` on a standalone engine.
    pub async fn cluster_stats(&self) -> Option<serde_json::Value> {
        match &self.inner.cluster {
            Some(cluster) => Some(cluster.stats().await),
            None => None,
        }
    }

    /// Fan-out query across the cluster; see
    /// [`ClusterManager::fan_out_query`].
    pub async fn fan_out_query(
        &self,
        query: &QueryBuilder,
        strategy: MergeStrategy,
        timeout: Duration,
    ) -> Result<FanOutReport, EngineError> {
        let cluster = self.inner.cluster.as_ref().ok_or_else(|| {
            EngineError::IllegalState("cluster support is disabled on this engine".into())
        })?;
        let engine = self.clone();
        let local_query = query.clone();
        let report = cluster
            .fan_out_query(
                query.table(),
                query.to_params(),
                move || async move { engine.select(&local_query).await.unwrap_or_default() },
                strategy,
                timeout,
            )
            .await?;
        Ok(report)
    }

    /// All rows of one partition of a table, for owner-side serving of
    /// `fetch_guild_data`.
    pub async fn partition_rows(
        &self,
        table: &str,
        partition: u64,
    ) -> Result<Vec<Row>, EngineError> {
        let table_arc = self.table_handle(table).await?;
        let guard = table_arc.read().await;
        let Some(key) = guard.schema.partition_key.clone() else {
            return Ok(guard.rows());
        };
        Ok(guard
            .rows()
            .into_iter()
            .filter(|row| {
                row.get(&key).is_some_and(|value| {
                    value.as_i64().is_some_and(|v| v as u64 == partition)
                        || value.display_string() == partition.to_string()
                })
            })
            .collect())
    }
}

// ------------------------------------------------------------------------------------------------
// Helpers
// ------------------------------------------------------------------------------------------------

/// Coerces a JSON row against the schema without constraint checks; used
/// when replaying already-validated WAL payloads.
fn coerce_row(schema: &TableSchema, data: &serde_json::Value) -> Result<Row, EngineError> {
    let object = data
        .as_object()
        .ok_or_else(|| EngineError::Internal("WAL payload is not an object".into()))?;
    let mut row = Row::new();
    for (key, json) in object {
        let Some(column) = schema.get_column(key) else {
            continue;
        };
        let value = Value::from_json(json, column.data_type)
            .map_err(|err| EngineError::SchemaViolation(err.to_string()))?;
        if !value.is_null() {
            row.insert(key.clone(), value);
        }
    }
    Ok(row)
}

fn copy_tree(source: &Path, target: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(target)?;
    for entry in std::fs::read_dir(source)? {
        let entry = entry?;
        let from = entry.path();
        let to = target.join(entry.file_name());
        if from.is_dir() {
            copy_tree(&from, &to)?;
        } else {
            std::fs::copy(&from, &to)?;
        }
    }
    Ok(())
}
