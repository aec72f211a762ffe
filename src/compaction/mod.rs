//! # Compaction Module
//!
//! Leveled background compaction of SSTable segments.
//!
//! ## Design Overview
//!
//! Every cycle (30 s by default) the service walks each table's registered
//! segments, partitions them by level, and merges any level holding at least
//! [`MIN_SEGMENTS_PER_LEVEL`] segments into one segment at `level + 1`
//! (levels at [`crate::sstable::MAX_LEVEL`] are left alone).
//!
//! A merge reads every input segment oldest-first and keeps the newest
//! version per row id — "newest" meaning the latest segment in registry
//! creation order, never wall-clock timestamps. Tombstones are carried
//! through the merge so they keep shadowing older levels; they are only
//! dropped when the merge output lands on the maximum level, where nothing
//! older can remain.
//!
//! ## Crash ordering
//!
//! The replacement segment is written and registered *before* the inputs are
//! unregistered and deleted. A crash in between leaves duplicate data, which
//! the next read merge resolves in favor of the newer segment.
//!
//! Only one compaction runs per table at a time; errors skip the table and
//! retry next cycle.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests;

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::memtable::MemTableEntry;
use crate::registry::{RegistryError, SstableRegistry};
use crate::schema::Row;
use crate::sstable::{MAX_LEVEL, Sstable, SstableError, SstableWriter};

// ------------------------------------------------------------------------------------------------
// Constants
// ------------------------------------------------------------------------------------------------

/// Segments per level required to trigger a merge.
pub const MIN_SEGMENTS_PER_LEVEL: usize = 4;

/// Default cycle interval.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(30);

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by compaction operations.
#[derive(Debug, Error)]
pub enum CompactionError {
    /// Segment read/write failure.
    #[error("Segment error: {0}")]
    Sstable(#[from] SstableError),

    /// Registry persistence failure.
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Background task failure.
    #[error("Internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// CompactionService
// ------------------------------------------------------------------------------------------------

/// Background leveled compactor over a segment registry.
pub struct CompactionService {
    registry: Arc<SstableRegistry>,
    in_progress: Arc<Mutex<HashSet<String>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl CompactionService {
    pub fn new(registry: Arc<SstableRegistry>) -> Self {
        Self {
            registry,
            in_progress: Arc::new(Mutex::new(HashSet::new())),
            handle: Mutex::new(None),
        }
    }

    /// Starts the periodic cycle task.
    pub async fn start(&self, interval: Duration) {
        let registry = Arc::clone(&self.registry);
        let in_progress = Arc::clone(&self.in_progress);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                for table in registry.tables() {
                    if let Err(err) =
                        Self::compact_table(&registry, &in_progress, &table).await
                    {
                        // Skip and retry next cycle.
                        error!(table = %table, "compaction cycle failed: {err}");
                    }
                }
            }
        });
        *self.handle.lock().await = Some(handle);
        info!("compaction service started");
    }

    pub async fn stop(&self) {
        if let Some(handle) = self.handle.lock().await.take() {
            handle.abort();
            let _ = handle.await;
        }
        info!("compaction service stopped");
    }

    /// Runs one compaction pass for a single table. Public so callers can
    /// force a pass outside the periodic cycle.
    pub async fn compact_table_now(&self, table: &str) -> Result<bool, CompactionError> {
        Self::compact_table(&self.registry, &self.in_progress, table).await
    }

    async fn compact_table(
        registry: &Arc<SstableRegistry>,
        in_progress: &Arc<Mutex<HashSet<String>>>,
        table: &str,
    ) -> Result<bool, CompactionError> {
        {
            let mut guard = in_progress.lock().await;
            if !guard.insert(table.to_string()) {
                debug!(table, "compaction already in progress, skipping");
                return Ok(false);
            }
        }
        let result = Self::compact_table_inner(registry, table).await;
        in_progress.lock().await.remove(table);
        result
    }

    async fn compact_table_inner(
        registry: &Arc<SstableRegistry>,
        table: &str,
    ) -> Result<bool, CompactionError> {
        let segments = registry.get_sstables(table);
        let mut by_level: HashMap<u8, Vec<_>> = HashMap::new();
        for meta in segments {
            by_level.entry(meta.level).or_default().push(meta);
        }

        let mut merged_any = false;
        let mut levels: Vec<u8> = by_level.keys().copied().collect();
        levels.sort_unstable();
        for level in levels {
            if level >= MAX_LEVEL {
                continue;
            }
            let inputs = &by_level[&level];
            if inputs.len() < MIN_SEGMENTS_PER_LEVEL {
                continue;
            }

            let registry = Arc::clone(registry);
            let table = table.to_string();
            let inputs = inputs.clone();
            tokio::task::spawn_blocking(move || {
                Self::merge_level(&registry, &table, level, &inputs)
            })
            .await
            .map_err(|err| CompactionError::Internal(format!("merge task failed: {err}")))??;
            merged_any = true;
        }
        Ok(merged_any)
    }

    /// Merges one level's segments into a single segment at `level + 1`.
    fn merge_level(
        registry: &SstableRegistry,
        table: &str,
        level: u8,
        inputs: &[crate::sstable::SstableMetadata],
    ) -> Result<(), CompactionError> {
        let output_level = level + 1;
        let drop_tombstones = output_level >= MAX_LEVEL;

        // Oldest first: later inputs overwrite earlier versions per row id.
        let mut merged: BTreeMap<u64, (Row, bool)> = BTreeMap::new();
        let mut columns = Vec::new();
        for meta in inputs {
            let reader = Sstable::open(meta.path(registry.base_path()))?;
            if columns.is_empty() {
                columns = reader.columns_with_types();
            }
            for (row_id, row, deleted) in reader.scan_raw(None, None)? {
                merged.insert(row_id, (row, deleted));
            }
        }

        let entries: Vec<MemTableEntry> = merged
            .into_iter()
            .filter(|(_, (_, deleted))| !(drop_tombstones && *deleted))
            .enumerate()
            .map(|(seq, (row_id, (data, deleted)))| MemTableEntry {
                row_id,
                data,
                timestamp: 0,
                seq: seq as u64,
                deleted,
            })
            .collect();

        // Publish the replacement before touching the inputs.
        let writer = SstableWriter::new(registry.base_path(), table, columns);
        if let Some(meta) = writer.write(entries, output_level)? {
            info!(
                table,
                from_level = level,
                to_level = output_level,
                inputs = inputs.len(),
                entries = meta.entry_count,
                "compaction merged level"
            );
            registry.register(meta)?;
        }

        let input_ids: Vec<String> = inputs.iter().map(|m| m.segment_id.clone()).collect();
        registry.unregister(table, &input_ids)?;
        for meta in inputs {
            let path = meta.path(registry.base_path());
            if path.exists() {
                fs::remove_file(&path)?;
            }
        }
        Ok(())
    }
}
