//! Storage backends behind the engine façade.
//!
//! Two implementations share one capability set: the memtable/SSTable path
//! ([`LsmBackend`]) buffering writes in memory and flushing immutable sorted
//! segments, and the direct-flush path ([`DirectBackend`]) writing one
//! encrypted micro-segment per batch. The engine picks one at construction;
//! semantics at the engine boundary are identical.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::compaction::CompactionService;
use crate::crypto::CryptoManager;
use crate::flush::FlushService;
use crate::memtable::{MemTable, MemTableState};
use crate::registry::SstableRegistry;
use crate::schema::{DataType, Row, Value};
use crate::segment::DirectFlushManager;
use crate::sstable::{Sstable, SstableMetadata, SstableWriter};

use super::EngineError;

/// Capability set both storage paths provide.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    async fn register_table(
        &self,
        table: &str,
        columns: Vec<(String, DataType)>,
    ) -> Result<(), EngineError>;

    async fn drop_table(&self, table: &str) -> Result<(), EngineError>;

    async fn insert(&self, table: &str, row_id: u64, row: Row) -> Result<(), EngineError>;

    /// Merges a partial row into the current version of the row.
    async fn update(&self, table: &str, row_id: u64, partial: Row) -> Result<bool, EngineError>;

    async fn delete(&self, table: &str, row_id: u64) -> Result<(), EngineError>;

    async fn get(&self, table: &str, row_id: u64) -> Result<Option<Row>, EngineError>;

    /// Merged scan, newest version per row id, tombstones resolved.
    async fn scan(
        &self,
        table: &str,
        lo: Option<u64>,
        hi: Option<u64>,
    ) -> Result<Vec<(u64, Row)>, EngineError>;

    async fn find_by_column(
        &self,
        table: &str,
        column: &str,
        value: &Value,
    ) -> Result<Vec<(u64, Row)>, EngineError>;

    /// Forces buffered data onto disk (LSM) or compacts micro-segments
    /// (direct flush).
    async fn flush(&self, table: &str) -> Result<(), EngineError>;

    async fn stats(&self) -> serde_json::Value;

    async fn close(&self) -> Result<(), EngineError>;
}

// ------------------------------------------------------------------------------------------------
// LSM backend
// ------------------------------------------------------------------------------------------------

struct LsmTableState {
    active: Arc<MemTable>,
    /// Oldest first; merged newest-wins at read time.
    immutables: Vec<Arc<MemTable>>,
    writer: Arc<SstableWriter>,
    next_seq: Arc<AtomicU64>,
    columns: Vec<(String, DataType)>,
}

/// Memtable + SSTable + flush + compaction storage path.
pub struct LsmBackend {
    segments_dir: PathBuf,
    registry: Arc<SstableRegistry>,
    flush: FlushService,
    compaction: CompactionService,
    tables: Arc<RwLock<HashMap<String, LsmTableState>>>,
    readers: Mutex<HashMap<String, Arc<Sstable>>>,
    size_limit: usize,
    entry_limit: usize,
}

impl LsmBackend {
    pub async fn open(
        segments_dir: impl AsRef<Path>,
        size_limit: usize,
        entry_limit: usize,
        compaction_interval: Duration,
    ) -> Result<Self, EngineError> {
        let segments_dir = segments_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&segments_dir)?;

        let registry = Arc::new(SstableRegistry::new(&segments_dir));
        registry.load()?;

        let tables: Arc<RwLock<HashMap<String, LsmTableState>>> =
            Arc::new(RwLock::new(HashMap::new()));

        // Flush completion: persist the metadata, then release every
        // memtable the flush service marked Flushed.
        let callback_registry = Arc::clone(&registry);
        let callback_tables = Arc::clone(&tables);
        let flush = FlushService::start(Arc::new(move |meta: SstableMetadata| {
            let registry = Arc::clone(&callback_registry);
            let tables = Arc::clone(&callback_tables);
            Box::pin(async move {
                let table_name = meta.table_name.clone();
                let persisted =
                    tokio::task::spawn_blocking(move || registry.register(meta)).await;
                match persisted {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => warn!("failed to persist segment registry: {err}"),
                    Err(err) => warn!("registry persist task failed: {err}"),
                }
                let mut tables = tables.write().await;
                if let Some(state) = tables.get_mut(&table_name) {
                    state
                        .immutables
                        .retain(|memtable| memtable.state() != MemTableState::Flushed);
                }
            })
        }));

        let compaction = CompactionService::new(Arc::clone(&registry));
        compaction.start(compaction_interval).await;

        Ok(Self {
            segments_dir,
            registry,
            flush,
            compaction,
            tables,
            readers: Mutex::new(HashMap::new()),
            size_limit,
            entry_limit,
        })
    }

    pub fn registry(&self) -> &Arc<SstableRegistry> {
        &self.registry
    }

    /// Forces one compaction pass outside the periodic cycle.
    pub async fn compact_now(&self, table: &str) -> Result<bool, EngineError> {
        Ok(self.compaction.compact_table_now(table).await?)
    }

    fn new_memtable(&self, table: &str, next_seq: &Arc<AtomicU64>) -> Arc<MemTable> {
        Arc::new(MemTable::new(
            table,
            self.size_limit,
            self.entry_limit,
            Arc::clone(next_seq),
        ))
    }

    /// Cached mmap reader for a segment, pruning entries whose file is gone.
    async fn reader(&self, meta: &SstableMetadata) -> Result<Option<Arc<Sstable>>, EngineError> {
        let path = meta.path(&self.segments_dir);
        let mut readers = self.readers.lock().await;
        if let Some(reader) = readers.get(&meta.segment_id) {
            if path.exists() {
                return Ok(Some(Arc::clone(reader)));
            }
            readers.remove(&meta.segment_id);
            return Ok(None);
        }
        if !path.exists() {
            // Compaction removed the file after we listed the registry.
            return Ok(None);
        }
        let opened = tokio::task::spawn_blocking(move || Sstable::open(&path))
            .await
            .map_err(|err| EngineError::Internal(format!("segment open task failed: {err}")))??;
        let reader = Arc::new(opened);
        readers.insert(meta.segment_id.clone(), Arc::clone(&reader));
        Ok(Some(reader))
    }

    /// Rotates a full active memtable into the flush queue.
    async fn maybe_rotate(&self, table: &str) -> Result<(), EngineError> {
        let mut tables = self.tables.write().await;
        let state = tables
            .get_mut(table)
            .ok_or_else(|| EngineError::TableNotFound(table.to_string()))?;
        if !state.active.should_flush() {
            return Ok(());
        }

        state.active.make_immutable()?;
        let rotated = Arc::clone(&state.active);
        state.immutables.push(Arc::clone(&rotated));
        state.active = self.new_memtable(table, &state.next_seq);
        debug!(table, entries = rotated.entry_count(), "memtable rotated");
        self.flush.enqueue(rotated, Arc::clone(&state.writer))?;
        Ok(())
    }
}

#[async_trait]
impl StorageBackend for LsmBackend {
    async fn register_table(
        &self,
        table: &str,
        columns: Vec<(String, DataType)>,
    ) -> Result<(), EngineError> {
        let mut tables = self.tables.write().await;
        if tables.contains_key(table) {
            return Ok(());
        }
        let next_seq = Arc::new(AtomicU64::new(0));
        let state = LsmTableState {
            active: self.new_memtable(table, &next_seq),
            immutables: Vec::new(),
            writer: Arc::new(SstableWriter::new(
                &self.segments_dir,
                table,
                columns.clone(),
            )),
            next_seq,
            columns,
        };
        tables.insert(table.to_string(), state);
        Ok(())
    }

    async fn drop_table(&self, table: &str) -> Result<(), EngineError> {
        self.tables.write().await.remove(table);
        let removed = self.registry.unregister_table(table)?;
        let mut readers = self.readers.lock().await;
        for meta in removed {
            readers.remove(&meta.segment_id);
            let path = meta.path(&self.segments_dir);
            if path.exists()
                && let Err(err) = std::fs::remove_file(&path)
            {
                warn!("failed to remove segment {}: {err}", path.display());
            }
        }
        Ok(())
    }

    async fn insert(&self, table: &str, row_id: u64, row: Row) -> Result<(), EngineError> {
        {
            let tables = self.tables.read().await;
            let state = tables
                .get(table)
                .ok_or_else(|| EngineError::TableNotFound(table.to_string()))?;
            state.active.insert(row_id, row)?;
        }
        self.maybe_rotate(table).await
    }

    async fn update(&self, table: &str, row_id: u64, partial: Row) -> Result<bool, EngineError> {
        // The memtable merge only sees its own buffer; merge against the
        // full visible row so updates of flushed rows keep older cells.
        let Some(mut current) = self.get(table, row_id).await? else {
            return Ok(false);
        };
        current.extend(partial);
        self.insert(table, row_id, current).await?;
        Ok(true)
    }

    async fn delete(&self, table: &str, row_id: u64) -> Result<(), EngineError> {
        {
            let tables = self.tables.read().await;
            let state = tables
                .get(table)
                .ok_or_else(|| EngineError::TableNotFound(table.to_string()))?;
            state.active.delete(row_id)?;
        }
        self.maybe_rotate(table).await
    }

    async fn get(&self, table: &str, row_id: u64) -> Result<Option<Row>, EngineError> {
        // Newest wins: active memtable, immutables LIFO, segments LIFO.
        {
            let tables = self.tables.read().await;
            let state = tables
                .get(table)
                .ok_or_else(|| EngineError::TableNotFound(table.to_string()))?;
            if let Some(entry) = state.active.get_entry(row_id) {
                return Ok((!entry.deleted).then_some(entry.data));
            }
            for memtable in state.immutables.iter().rev() {
                if let Some(entry) = memtable.get_entry(row_id) {
                    return Ok((!entry.deleted).then_some(entry.data));
                }
            }
        }

        for meta in self.registry.get_sstables(table).iter().rev() {
            if meta.min_row_id > row_id || meta.max_row_id < row_id {
                continue;
            }
            let Some(reader) = self.reader(meta).await? else {
                continue;
            };
            let found = tokio::task::spawn_blocking(move || reader.get_raw(row_id))
                .await
                .map_err(|err| EngineError::Internal(format!("segment read task failed: {err}")))??;
            if let Some((row, deleted)) = found {
                return Ok((!deleted).then_some(row));
            }
        }
        Ok(None)
    }

    async fn scan(
        &self,
        table: &str,
        lo: Option<u64>,
        hi: Option<u64>,
    ) -> Result<Vec<(u64, Row)>, EngineError> {
        let mut merged: BTreeMap<u64, (Row, bool)> = BTreeMap::new();

        // Oldest segments first; everything newer overwrites.
        for meta in self.registry.get_sstables(table) {
            let Some(reader) = self.reader(&meta).await? else {
                continue;
            };
            let rows = tokio::task::spawn_blocking(move || reader.scan_raw(lo, hi))
                .await
                .map_err(|err| EngineError::Internal(format!("segment scan task failed: {err}")))??;
            for (row_id, row, deleted) in rows {
                merged.insert(row_id, (row, deleted));
            }
        }

        {
            let tables = self.tables.read().await;
            let state = tables
                .get(table)
                .ok_or_else(|| EngineError::TableNotFound(table.to_string()))?;
            let lo = lo.unwrap_or(0);
            let hi = hi.unwrap_or(u64::MAX);
            for memtable in state.immutables.iter().chain(std::iter::once(&state.active)) {
                for entry in memtable.entries_for_flush() {
                    if entry.row_id < lo || entry.row_id > hi {
                        continue;
                    }
                    merged.insert(entry.row_id, (entry.data, entry.deleted));
                }
            }
        }

        Ok(merged
            .into_iter()
            .filter(|(_, (_, deleted))| !deleted)
            .map(|(row_id, (row, _))| (row_id, row))
            .collect())
    }

    async fn find_by_column(
        &self,
        table: &str,
        column: &str,
        value: &Value,
    ) -> Result<Vec<(u64, Row)>, EngineError> {
        Ok(self
            .scan(table, None, None)
            .await?
            .into_iter()
            .filter(|(_, row)| {
                row.get(column).is_some_and(|cell| {
                    cell == value || cell.display_string() == value.display_string()
                })
            })
            .collect())
    }

    async fn flush(&self, table: &str) -> Result<(), EngineError> {
        // Rotate whatever the active memtable holds, then drain inline.
        let (pending, writer) = {
            let mut tables = self.tables.write().await;
            let state = tables
                .get_mut(table)
                .ok_or_else(|| EngineError::TableNotFound(table.to_string()))?;
            if state.active.entry_count() > 0 {
                state.active.make_immutable()?;
                let rotated = Arc::clone(&state.active);
                state.immutables.push(rotated);
                state.active = self.new_memtable(table, &state.next_seq);
            }
            (state.immutables.clone(), Arc::clone(&state.writer))
        };

        for memtable in pending {
            if memtable.state() == MemTableState::Immutable {
                self.flush
                    .flush_immediately(memtable, Arc::clone(&writer))
                    .await?;
            }
        }
        Ok(())
    }

    async fn stats(&self) -> serde_json::Value {
        let tables = self.tables.read().await;
        let mut per_table = serde_json::Map::new();
        for (name, state) in tables.iter() {
            let segments = self.registry.get_sstables(name);
            per_table.insert(
                name.clone(),
                serde_json::json!({
                    "active_entries": state.active.entry_count(),
                    "active_bytes": state.active.size_bytes(),
                    "immutable_memtables": state.immutables.len(),
                    "segments": segments.len(),
                    "segment_bytes": segments.iter().map(|m| m.size_bytes).sum::<u64>(),
                    "columns": state.columns.len(),
                }),
            );
        }
        serde_json::json!({
            "backend": "lsm",
            "pending_flushes": self.flush.pending_count(),
            "tables": per_table,
        })
    }

    async fn close(&self) -> Result<(), EngineError> {
        self.compaction.stop().await;
        let table_names: Vec<String> = self.tables.read().await.keys().cloned().collect();
        for table in table_names {
            self.flush(&table).await?;
        }
        self.flush.stop().await;
        Ok(())
    }
}

// ------------------------------------------------------------------------------------------------
// Direct-flush backend
// ------------------------------------------------------------------------------------------------

/// One-segment-per-write storage path.
pub struct DirectBackend {
    manager: Arc<DirectFlushManager>,
}

impl DirectBackend {
    pub async fn open(
        segments_dir: impl AsRef<Path>,
        crypto: Arc<CryptoManager>,
    ) -> Result<Self, EngineError> {
        let manager = Arc::new(DirectFlushManager::new(segments_dir, crypto));
        manager.initialize().await?;
        Ok(Self { manager })
    }

    pub fn manager(&self) -> &Arc<DirectFlushManager> {
        &self.manager
    }
}

#[async_trait]
impl StorageBackend for DirectBackend {
    async fn register_table(
        &self,
        table: &str,
        columns: Vec<(String, DataType)>,
    ) -> Result<(), EngineError> {
        Ok(self.manager.register_table(table, columns).await?)
    }

    async fn drop_table(&self, table: &str) -> Result<(), EngineError> {
        Ok(self.manager.drop_table(table).await?)
    }

    async fn insert(&self, table: &str, row_id: u64, row: Row) -> Result<(), EngineError> {
        Ok(self.manager.insert(table, row_id, row).await?)
    }

    async fn update(&self, table: &str, row_id: u64, partial: Row) -> Result<bool, EngineError> {
        Ok(self.manager.update(table, row_id, partial).await?)
    }

    async fn delete(&self, table: &str, row_id: u64) -> Result<(), EngineError> {
        Ok(self.manager.delete(table, row_id).await?)
    }

    async fn get(&self, table: &str, row_id: u64) -> Result<Option<Row>, EngineError> {
        Ok(self.manager.get(table, row_id).await?)
    }

    async fn scan(
        &self,
        table: &str,
        lo: Option<u64>,
        hi: Option<u64>,
    ) -> Result<Vec<(u64, Row)>, EngineError> {
        Ok(self.manager.scan(table, lo, hi).await?)
    }

    async fn find_by_column(
        &self,
        table: &str,
        column: &str,
        value: &Value,
    ) -> Result<Vec<(u64, Row)>, EngineError> {
        Ok(self.manager.find_by_column(table, column, value).await?)
    }

    async fn flush(&self, table: &str) -> Result<(), EngineError> {
        // Direct flush is always durable; flushing merges micro-segments.
        Ok(self.manager.compact_table(table).await?)
    }

    async fn stats(&self) -> serde_json::Value {
        self.manager.stats().await
    }

    async fn close(&self) -> Result<(), EngineError> {
        Ok(())
    }
}
