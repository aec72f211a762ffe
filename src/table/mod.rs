//! # Table Module
//!
//! In-memory column-major table state and its on-disk persistence through
//! the binary codec.
//!
//! ## Design Invariants
//!
//! - For every column `c` in the schema, `data[c].len() == row_count`.
//! - Row ids are monotonically issued per table and never reused, even
//!   after deletion.
//! - The auto-increment counter is monotonic and survives restarts by
//!   resuming past the highest persisted value.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests;

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::collections::HashMap;

use thiserror::Error;

use crate::codec::{self, CodecError};
use crate::schema::{Row, TableSchema, Value};

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by table-state operations.
#[derive(Debug, Error)]
pub enum TableError {
    /// Row id is not present in the buffers.
    #[error("Row {row_id} not found in table '{table}'")]
    RowNotFound { table: String, row_id: u64 },

    /// Input references a column the schema does not define.
    #[error("Unknown column '{column}' in table '{table}'")]
    UnknownColumn { table: String, column: String },

    /// Codec failure while persisting or loading the table file.
    #[error(transparent)]
    Codec(#[from] CodecError),
}

// ------------------------------------------------------------------------------------------------
// Table
// ------------------------------------------------------------------------------------------------

/// Column-major state of one table.
#[derive(Debug)]
pub struct Table {
    pub schema: TableSchema,
    /// Column buffers in schema order, keyed by column name.
    data: HashMap<String, Vec<Value>>,
    /// Row id of every buffered row, position-aligned with the buffers.
    row_ids: Vec<u64>,
    row_positions: HashMap<u64, usize>,
    next_row_id: u64,
    auto_increment: i64,
}

impl Table {
    pub fn new(schema: TableSchema) -> Self {
        let data = schema
            .columns
            .iter()
            .map(|column| (column.name.clone(), Vec::new()))
            .collect();
        Self {
            schema,
            data,
            row_ids: Vec::new(),
            row_positions: HashMap::new(),
            next_row_id: 0,
            auto_increment: 1,
        }
    }

    pub fn row_count(&self) -> usize {
        self.row_ids.len()
    }

    /// Issues the next row id; never reused.
    pub fn allocate_row_id(&mut self) -> u64 {
        let row_id = self.next_row_id;
        self.next_row_id += 1;
        row_id
    }

    /// Issues the next auto-increment column value (starts at 1).
    pub fn allocate_auto_increment(&mut self) -> i64 {
        let value = self.auto_increment;
        self.auto_increment += 1;
        value
    }

    /// Fast-forwards both counters past externally observed values.
    pub fn observe_row_id(&mut self, row_id: u64) {
        self.next_row_id = self.next_row_id.max(row_id + 1);
    }

    pub fn observe_auto_increment(&mut self, value: i64) {
        self.auto_increment = self.auto_increment.max(value + 1);
    }

    /// Appends a row. Cells missing from `row` fill with the column default,
    /// then null. Replaces the previous version when the row id exists.
    pub fn upsert_row(&mut self, row_id: u64, row: &Row) {
        if let Some(position) = self.row_positions.get(&row_id).copied() {
            for column in &self.schema.columns {
                if let Some(value) = row.get(&column.name) {
                    let buffer = self.data.get_mut(&column.name).expect("schema column");
                    buffer[position] = value.clone();
                }
            }
            return;
        }

        let position = self.row_ids.len();
        for column in &self.schema.columns {
            let value = row
                .get(&column.name)
                .cloned()
                .or_else(|| column.default.clone())
                .unwrap_or(Value::Null);
            self.data
                .get_mut(&column.name)
                .expect("schema column")
                .push(value);
        }
        self.row_ids.push(row_id);
        self.row_positions.insert(row_id, position);
        self.observe_row_id(row_id);
    }

    /// Removes a row from the buffers. The id is never reissued.
    pub fn remove_row(&mut self, row_id: u64) -> Result<(), TableError> {
        let position =
            self.row_positions
                .remove(&row_id)
                .ok_or_else(|| TableError::RowNotFound {
                    table: self.schema.name.clone(),
                    row_id,
                })?;
        for buffer in self.data.values_mut() {
            buffer.remove(position);
        }
        self.row_ids.remove(position);
        for (moved_position, moved_id) in self.row_ids.iter().enumerate().skip(position) {
            self.row_positions.insert(*moved_id, moved_position);
        }
        Ok(())
    }

    /// One materialized row; non-null cells only.
    pub fn get_row(&self, row_id: u64) -> Option<Row> {
        let position = *self.row_positions.get(&row_id)?;
        Some(self.row_at(position))
    }

    fn row_at(&self, position: usize) -> Row {
        let mut row = Row::new();
        for column in &self.schema.columns {
            if let Some(value) = self.data.get(&column.name).and_then(|b| b.get(position))
                && !value.is_null()
            {
                row.insert(column.name.clone(), value.clone());
            }
        }
        row
    }

    /// All rows, position order, as a query-ready stream.
    pub fn rows(&self) -> Vec<Row> {
        (0..self.row_ids.len()).map(|p| self.row_at(p)).collect()
    }

    /// All rows paired with their row ids.
    pub fn rows_with_ids(&self) -> Vec<(u64, Row)> {
        self.row_ids
            .iter()
            .enumerate()
            .map(|(position, row_id)| (*row_id, self.row_at(position)))
            .collect()
    }

    /// One column's `(value, row_id)` pairs, for index builds.
    pub fn column_entries(&self, column: &str) -> Result<Vec<(Value, u64)>, TableError> {
        let buffer = self.data.get(column).ok_or_else(|| TableError::UnknownColumn {
            table: self.schema.name.clone(),
            column: column.to_string(),
        })?;
        Ok(buffer
            .iter()
            .zip(self.row_ids.iter())
            .map(|(value, row_id)| (value.clone(), *row_id))
            .collect())
    }

    /// One cell, nulls included.
    pub fn cell(&self, row_id: u64, column: &str) -> Option<Value> {
        let position = *self.row_positions.get(&row_id)?;
        self.data.get(column)?.get(position).cloned()
    }

    // -- persistence -----------------------------------------------------------------------------

    /// Serializes schema and buffers as a checksummed table file.
    pub fn to_file_bytes(&self) -> Result<Vec<u8>, TableError> {
        let buffers: Vec<Vec<Value>> = self
            .schema
            .columns
            .iter()
            .map(|column| self.data.get(&column.name).cloned().unwrap_or_default())
            .collect();
        Ok(codec::encode_table_file(
            &self.schema.name,
            &self.schema.columns,
            &buffers,
            self.row_count() as u64,
        )?)
    }

    /// Rebuilds a table from a table file. Row ids are positional (the file
    /// stores no id column); callers overlay the durable backend state
    /// afterwards. Constraint flags beyond nullable/indexed/compressed are
    /// not part of the file format and come back at their defaults.
    pub fn from_file_bytes(bytes: &[u8]) -> Result<Self, TableError> {
        let file = codec::decode_table_file(bytes)?;
        let schema = TableSchema {
            name: file.table_name.clone(),
            primary_key: None,
            index_columns: file
                .columns
                .iter()
                .filter(|column| column.indexed)
                .map(|column| column.name.clone())
                .collect(),
            partition_key: None,
            created_at: 0,
            columns: file.columns,
        };
        let mut table = Table::new(schema);
        for position in 0..file.row_count as usize {
            let row: Row = table
                .schema
                .columns
                .iter()
                .enumerate()
                .filter_map(|(column_index, column)| {
                    file.data[column_index]
                        .get(position)
                        .filter(|value| !value.is_null())
                        .map(|value| (column.name.clone(), value.clone()))
                })
                .collect();
            let row_id = table.allocate_row_id();
            table.upsert_row(row_id, &row);
        }
        Ok(table)
    }

    /// Checks the column-length invariant; used by tests and recovery.
    pub fn check_invariants(&self) -> bool {
        self.schema
            .columns
            .iter()
            .all(|column| {
                self.data
                    .get(&column.name)
                    .is_some_and(|buffer| buffer.len() == self.row_count())
            })
            && self.row_positions.len() == self.row_count()
    }
}
