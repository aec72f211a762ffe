//! # Memtable Module
//!
//! Bounded in-memory buffer of row mutations for one table, ordered by row id
//! on a skip list.
//!
//! ## Design Invariants
//!
//! - Every mutation is stamped with a per-table monotonic sequence number;
//!   version resolution during merges uses the sequence, never wall-clock
//!   time.
//! - Deletes are tombstones (`deleted = true`, empty data map), not physical
//!   removal; flushed tombstones must override older segment contents.
//! - Byte accounting is a JSON-length estimate per entry; `should_flush`
//!   fires once either the byte or the entry limit is reached.
//!
//! ## Lifecycle
//!
//! ```text
//! Active ──make_immutable()──► Immutable ──flush queue──► Flushing ──► Flushed
//!                                   ▲                        │
//!                                   └───────on write error───┘
//! ```
//!
//! Mutations are rejected in any state but `Active`. A failed flush rolls the
//! memtable back to `Immutable` so it is retried.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests;

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::sync::{
    Arc, RwLock,
    atomic::{AtomicU64, AtomicUsize, Ordering},
};

use thiserror::Error;
use tracing::trace;

use crate::schema::{Row, now_millis, row_to_json};
use crate::skiplist::SkipList;

// ------------------------------------------------------------------------------------------------
// Constants
// ------------------------------------------------------------------------------------------------

/// Default byte budget before a flush is requested (64 MiB).
pub const DEFAULT_SIZE_LIMIT: usize = 64 * 1024 * 1024;

/// Default entry budget before a flush is requested.
pub const DEFAULT_ENTRY_LIMIT: usize = 100_000;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by [`MemTable`] operations.
#[derive(Debug, Error)]
pub enum MemtableError {
    /// Mutation attempted while the memtable is not `Active`, or an invalid
    /// state transition was requested.
    #[error("Memtable for '{table}' is {state:?}, expected {expected:?}")]
    IllegalState {
        table: String,
        state: MemTableState,
        expected: MemTableState,
    },
}

// ------------------------------------------------------------------------------------------------
// Types
// ------------------------------------------------------------------------------------------------

/// Lifecycle state of a memtable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemTableState {
    Active,
    Immutable,
    Flushing,
    Flushed,
}

/// One buffered mutation. A tombstone has `deleted = true` and an empty
/// data map.
#[derive(Debug, Clone, PartialEq)]
pub struct MemTableEntry {
    pub row_id: u64,
    pub data: Row,
    /// Milliseconds since the UNIX epoch; informational only.
    pub timestamp: u64,
    /// Per-table monotonic sequence; authoritative version order.
    pub seq: u64,
    pub deleted: bool,
}

// ------------------------------------------------------------------------------------------------
// MemTable
// ------------------------------------------------------------------------------------------------

/// Buffered mutations for one table.
pub struct MemTable {
    table_name: String,
    data: SkipList<MemTableEntry>,
    state: RwLock<MemTableState>,
    size_bytes: AtomicUsize,
    size_limit: usize,
    entry_limit: usize,
    /// Shared with the table so sequence numbers survive rotation.
    next_seq: Arc<AtomicU64>,
    created_at: u64,
}

impl MemTable {
    pub fn new(
        table_name: impl Into<String>,
        size_limit: usize,
        entry_limit: usize,
        next_seq: Arc<AtomicU64>,
    ) -> Self {
        Self {
            table_name: table_name.into(),
            data: SkipList::new(),
            state: RwLock::new(MemTableState::Active),
            size_bytes: AtomicUsize::new(0),
            size_limit,
            entry_limit,
            next_seq,
            created_at: now_millis(),
        }
    }

    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    pub fn state(&self) -> MemTableState {
        *self.state.read().expect("memtable state lock poisoned")
    }

    pub fn size_bytes(&self) -> usize {
        self.size_bytes.load(Ordering::Relaxed)
    }

    pub fn entry_count(&self) -> usize {
        self.data.len()
    }

    /// True once either configured limit is reached.
    pub fn should_flush(&self) -> bool {
        self.size_bytes() >= self.size_limit || self.entry_count() >= self.entry_limit
    }

    fn estimate_entry_size(data: &Row) -> usize {
        serde_json::to_string(&row_to_json(data))
            .map(|s| s.len())
            .unwrap_or(256)
    }

    fn require_active(&self) -> Result<(), MemtableError> {
        let state = self.state();
        if state != MemTableState::Active {
            return Err(MemtableError::IllegalState {
                table: self.table_name.clone(),
                state,
                expected: MemTableState::Active,
            });
        }
        Ok(())
    }

    fn stamp(&self, row_id: u64, data: Row, deleted: bool) -> MemTableEntry {
        MemTableEntry {
            row_id,
            data,
            timestamp: now_millis(),
            seq: self.next_seq.fetch_add(1, Ordering::SeqCst),
            deleted,
        }
    }

    /// Buffers a full-row insert, overwriting any buffered version.
    pub fn insert(&self, row_id: u64, data: Row) -> Result<bool, MemtableError> {
        self.require_active()?;
        let size = Self::estimate_entry_size(&data);
        let entry = self.stamp(row_id, data, false);
        let is_new = self.data.insert(row_id, entry);
        if is_new {
            self.size_bytes.fetch_add(size, Ordering::Relaxed);
        }
        trace!(table = %self.table_name, row_id, is_new, "memtable insert");
        Ok(is_new)
    }

    /// Merges a partial row into the buffered version, or buffers it as a new
    /// row when nothing is buffered yet.
    pub fn update(&self, row_id: u64, partial: Row) -> Result<(), MemtableError> {
        self.require_active()?;
        match self.data.search(row_id) {
            Some(existing) if !existing.deleted => {
                let old_size = Self::estimate_entry_size(&existing.data);
                let mut merged = existing.data;
                merged.extend(partial);
                let new_size = Self::estimate_entry_size(&merged);
                let entry = self.stamp(row_id, merged, false);
                self.data.insert(row_id, entry);
                if new_size > old_size {
                    self.size_bytes.fetch_add(new_size - old_size, Ordering::Relaxed);
                } else {
                    self.size_bytes.fetch_sub(old_size - new_size, Ordering::Relaxed);
                }
            }
            _ => {
                let size = Self::estimate_entry_size(&partial);
                let entry = self.stamp(row_id, partial, false);
                self.data.insert(row_id, entry);
                self.size_bytes.fetch_add(size, Ordering::Relaxed);
            }
        }
        Ok(())
    }

    /// Buffers a tombstone for the row id.
    pub fn delete(&self, row_id: u64) -> Result<(), MemtableError> {
        self.require_active()?;
        let entry = self.stamp(row_id, Row::new(), true);
        self.data.insert(row_id, entry);
        trace!(table = %self.table_name, row_id, "memtable tombstone");
        Ok(())
    }

    /// Buffered row data; `None` for absent or tombstoned ids.
    pub fn get(&self, row_id: u64) -> Option<Row> {
        self.data
            .search(row_id)
            .filter(|entry| !entry.deleted)
            .map(|entry| entry.data)
    }

    /// Raw buffered entry including tombstones; merge paths need this to
    /// distinguish "not buffered" from "buffered as deleted".
    pub fn get_entry(&self, row_id: u64) -> Option<MemTableEntry> {
        self.data.search(row_id)
    }

    /// Live rows with `lo <= row_id <= hi`.
    pub fn range(&self, lo: u64, hi: u64) -> Vec<(u64, Row)> {
        self.data
            .range(lo, hi)
            .into_iter()
            .filter(|(_, entry)| !entry.deleted)
            .map(|(row_id, entry)| (row_id, entry.data))
            .collect()
    }

    /// All live rows in row-id order.
    pub fn get_all(&self) -> Vec<(u64, Row)> {
        self.range(0, u64::MAX)
    }

    /// Every buffered entry including tombstones, in row-id order. This is
    /// the flush input; tombstones must reach disk.
    pub fn entries_for_flush(&self) -> Vec<MemTableEntry> {
        self.data.items().into_iter().map(|(_, entry)| entry).collect()
    }

    /// Transitions `Active → Immutable`. Further mutations fail.
    pub fn make_immutable(&self) -> Result<(), MemtableError> {
        let mut state = self.state.write().expect("memtable state lock poisoned");
        if *state != MemTableState::Active {
            return Err(MemtableError::IllegalState {
                table: self.table_name.clone(),
                state: *state,
                expected: MemTableState::Active,
            });
        }
        *state = MemTableState::Immutable;
        Ok(())
    }

    /// Transitions `Immutable → Flushing`. Only the flush service calls this.
    pub(crate) fn mark_flushing(&self) -> Result<(), MemtableError> {
        let mut state = self.state.write().expect("memtable state lock poisoned");
        if *state != MemTableState::Immutable {
            return Err(MemtableError::IllegalState {
                table: self.table_name.clone(),
                state: *state,
                expected: MemTableState::Immutable,
            });
        }
        *state = MemTableState::Flushing;
        Ok(())
    }

    /// Terminal transition after the segment is durably registered.
    pub(crate) fn mark_flushed(&self) {
        *self.state.write().expect("memtable state lock poisoned") = MemTableState::Flushed;
    }

    /// Rolls `Flushing` back to `Immutable` after a failed write so the
    /// flush is retried.
    pub(crate) fn revert_to_immutable(&self) {
        *self.state.write().expect("memtable state lock poisoned") = MemTableState::Immutable;
    }

    /// Point-in-time statistics snapshot.
    pub fn stats(&self) -> MemTableStats {
        MemTableStats {
            table_name: self.table_name.clone(),
            state: self.state(),
            entry_count: self.entry_count(),
            size_bytes: self.size_bytes(),
            size_limit: self.size_limit,
            entry_limit: self.entry_limit,
            created_at: self.created_at,
        }
    }
}

/// Snapshot returned by [`MemTable::stats`].
#[derive(Debug, Clone)]
pub struct MemTableStats {
    pub table_name: String,
    pub state: MemTableState,
    pub entry_count: usize,
    pub size_bytes: usize,
    pub size_limit: usize,
    pub entry_limit: usize,
    pub created_at: u64,
}
