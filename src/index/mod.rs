//! # Index Module
//!
//! Column-value → row-id lookup structures and the per-table index manager.
//!
//! Two index kinds are provided:
//!
//! - **B-tree** ([`btree::BTreeIndex`]) — ordered keys, point and range
//!   search. Order 100; equal keys coalesce into one row-id list.
//! - **Hash** ([`hash::HashIndex`]) — 1024 open buckets addressed by an MD5
//!   digest of the key's canonical form; point search only.
//!
//! The [`IndexManager`] owns one index object per `(table, column)` pair and
//! can materialize an index from existing column data via
//! [`IndexManager::build_index`].
//!
//! ## Invariant
//!
//! For a live table, each index's entries are exactly the `(value, row_id)`
//! pairs of that column's live rows; the engine updates indexes in-place on
//! every write before acknowledging it.

// ------------------------------------------------------------------------------------------------
// Sub-modules
// ------------------------------------------------------------------------------------------------

pub mod btree;
pub mod hash;


pub use btree::BTreeIndex;
pub use hash::HashIndex;

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::collections::HashMap;

use thiserror::Error;
use tracing::debug;

use crate::schema::Value;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by index-manager operations.
#[derive(Debug, Error)]
pub enum IndexError {
    /// No index exists for the `(table, column)` pair.
    #[error("No index on {table}.{column}")]
    NotFound { table: String, column: String },

    /// An index already exists for the `(table, column)` pair.
    #[error("Index on {table}.{column} already exists")]
    AlreadyExists { table: String, column: String },

    /// Range search requested on a hash index.
    #[error("Index on {table}.{column} does not support range search")]
    Unsupported { table: String, column: String },
}

// ------------------------------------------------------------------------------------------------
// Index kinds
// ------------------------------------------------------------------------------------------------

/// Which structure backs an index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexType {
    BTree,
    Hash,
}

/// A column index of either kind.
#[derive(Debug)]
pub enum Index {
    BTree(BTreeIndex),
    Hash(HashIndex),
}

impl Index {
    pub fn new(name: impl Into<String>, kind: IndexType) -> Self {
        match kind {
            IndexType::BTree => Index::BTree(BTreeIndex::new(name)),
            IndexType::Hash => Index::Hash(HashIndex::new(name)),
        }
    }

    pub fn index_type(&self) -> IndexType {
        match self {
            Index::BTree(_) => IndexType::BTree,
            Index::Hash(_) => IndexType::Hash,
        }
    }

    pub fn insert(&mut self, value: Value, row_id: u64) {
        match self {
            Index::BTree(index) => index.insert(value, row_id),
            Index::Hash(index) => index.insert(value, row_id),
        }
    }

    /// Removes one row id for the value, or every row id when `row_id` is
    /// `None`.
    pub fn delete(&mut self, value: &Value, row_id: Option<u64>) {
        match self {
            Index::BTree(index) => index.delete(value, row_id),
            Index::Hash(index) => index.delete(value, row_id),
        }
    }

    pub fn search(&self, value: &Value) -> Vec<u64> {
        match self {
            Index::BTree(index) => index.search(value),
            Index::Hash(index) => index.search(value),
        }
    }

    pub fn clear(&mut self) {
        match self {
            Index::BTree(index) => index.clear(),
            Index::Hash(index) => index.clear(),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Index::BTree(index) => index.len(),
            Index::Hash(index) => index.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn all_entries(&self) -> Vec<(Value, Vec<u64>)> {
        match self {
            Index::BTree(index) => index.all_entries(),
            Index::Hash(index) => index.all_entries(),
        }
    }
}

// ------------------------------------------------------------------------------------------------
// IndexManager
// ------------------------------------------------------------------------------------------------

/// Owns every `(table, column)` index.
#[derive(Debug, Default)]
pub struct IndexManager {
    indexes: HashMap<String, HashMap<String, Index>>,
}

impl IndexManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty index.
    pub fn create_index(
        &mut self,
        table: &str,
        column: &str,
        kind: IndexType,
    ) -> Result<(), IndexError> {
        let columns = self.indexes.entry(table.to_string()).or_default();
        if columns.contains_key(column) {
            return Err(IndexError::AlreadyExists {
                table: table.to_string(),
                column: column.to_string(),
            });
        }
        let name = format!("{table}_{column}");
        columns.insert(column.to_string(), Index::new(name, kind));
        debug!(table, column, ?kind, "index created");
        Ok(())
    }

    /// Drops one index. Returns whether it existed.
    pub fn drop_index(&mut self, table: &str, column: &str) -> bool {
        self.indexes
            .get_mut(table)
            .is_some_and(|columns| columns.remove(column).is_some())
    }

    pub fn get_index(&self, table: &str, column: &str) -> Option<&Index> {
        self.indexes.get(table)?.get(column)
    }

    pub fn has_index(&self, table: &str, column: &str) -> bool {
        self.get_index(table, column).is_some()
    }

    pub fn list_indexes(&self, table: &str) -> Vec<String> {
        self.indexes
            .get(table)
            .map(|columns| columns.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Materializes an index from existing column data, replacing any
    /// previous index on the pair.
    pub fn build_index(
        &mut self,
        table: &str,
        column: &str,
        entries: &[(Value, u64)],
        kind: IndexType,
    ) {
        let name = format!("{table}_{column}");
        let mut index = Index::new(name, kind);
        for (value, row_id) in entries {
            if !value.is_null() {
                index.insert(value.clone(), *row_id);
            }
        }
        debug!(table, column, entries = entries.len(), "index built");
        self.indexes
            .entry(table.to_string())
            .or_default()
            .insert(column.to_string(), index);
    }

    /// Adds one `(value, row_id)` pair. Nulls are never indexed.
    pub fn insert_entry(&mut self, table: &str, column: &str, value: &Value, row_id: u64) {
        if value.is_null() {
            return;
        }
        if let Some(index) = self
            .indexes
            .get_mut(table)
            .and_then(|columns| columns.get_mut(column))
        {
            index.insert(value.clone(), row_id);
        }
    }

    /// Removes one `(value, row_id)` pair.
    pub fn delete_entry(&mut self, table: &str, column: &str, value: &Value, row_id: u64) {
        if let Some(index) = self
            .indexes
            .get_mut(table)
            .and_then(|columns| columns.get_mut(column))
        {
            index.delete(value, Some(row_id));
        }
    }

    /// Re-points a row id from an old value to a new one.
    pub fn update_entry(
        &mut self,
        table: &str,
        column: &str,
        old_value: &Value,
        new_value: &Value,
        row_id: u64,
    ) {
        self.delete_entry(table, column, old_value, row_id);
        self.insert_entry(table, column, new_value, row_id);
    }

    /// Equality lookup. Empty when the pair has no index.
    pub fn search(&self, table: &str, column: &str, value: &Value) -> Vec<u64> {
        self.get_index(table, column)
            .map(|index| index.search(value))
            .unwrap_or_default()
    }

    /// Range lookup; only B-tree indexes support it.
    pub fn search_range(
        &self,
        table: &str,
        column: &str,
        lo: Option<&Value>,
        hi: Option<&Value>,
        include_lo: bool,
        include_hi: bool,
    ) -> Result<Vec<u64>, IndexError> {
        let index = self.get_index(table, column).ok_or_else(|| IndexError::NotFound {
            table: table.to_string(),
            column: column.to_string(),
        })?;
        match index {
            Index::BTree(btree) => Ok(btree.search_range(lo, hi, include_lo, include_hi)),
            Index::Hash(_) => Err(IndexError::Unsupported {
                table: table.to_string(),
                column: column.to_string(),
            }),
        }
    }

    /// Empties every index of a table, keeping the index objects.
    pub fn clear_table(&mut self, table: &str) {
        if let Some(columns) = self.indexes.get_mut(table) {
            for index in columns.values_mut() {
                index.clear();
            }
        }
    }

    /// Drops every index of a table.
    pub fn drop_table(&mut self, table: &str) {
        self.indexes.remove(table);
    }
}
