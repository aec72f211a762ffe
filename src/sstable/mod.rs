//! # SSTable Module
//!
//! Immutable, sorted, on-disk segments produced by flushing memtables.
//! Row ids are stored as one compressed run; cell data is stored
//! column-major so point lookups decode only the blocks they need.
//!
//! # On-disk layout
//!
//! ```text
//! [magic "SSTB"][version u8]
//! [name_len u16][table name]
//! [entry_count u32][min_row_id u64][max_row_id u64][level u8]
//! [col_count u16]{[name_len u16][name][type_tag u8]}×col_count
//! [bloom_len u32][bloom filter bytes]
//! [index_offset u32]                  ← patched after the data block is sized
//! data block:
//!   [row_ids_len u32][zlib(row_ids i64×n)]
//!   {[col_block_len u32][column block]}×col_count
//! sparse index:
//!   [index_count u32]{[row_id u64][anchor u32]}×index_count
//! footer (28 bytes):
//!   [bloom_off u64][data_off u64][index_off u64][magic "SSTB"]
//! ```
//!
//! The sparse index holds one anchor every ⌈n/100⌉ rows; in this columnar
//! layout the anchor is the entry's ordinal within the row-id run.
//!
//! ## Tombstones
//!
//! A flushed tombstone is an entry whose every column is null. Readers treat
//! such rows as deletions: `get` returns `None`, `scan` skips them, and the
//! raw iteration used by compaction reports them with a deleted flag.
//!
//! # Guarantees
//!
//! - **Immutability:** files are published atomically (write temp → fsync →
//!   rename) and never modified afterwards.
//! - **Fast negative lookups:** min/max range check, then bloom filter,
//!   before any data block is touched.
//! - **Lazy decode:** the reader mmaps the file; the row-id run is inflated
//!   once on first use, column blocks only when accessed.

// ------------------------------------------------------------------------------------------------
// Sub-modules
// ------------------------------------------------------------------------------------------------

pub mod builder;

#[cfg(test)]
mod tests;

pub use builder::SstableWriter;

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use memmap2::Mmap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::bloom::{BloomError, BloomFilter};
use crate::codec::{self, CodecError, Cursor};
use crate::schema::{DataType, Row, SchemaError, Value};

// ------------------------------------------------------------------------------------------------
// Constants
// ------------------------------------------------------------------------------------------------

/// Segment file magic, repeated in the footer.
pub const SSTABLE_MAGIC: &[u8; 4] = b"SSTB";

/// Current segment format version.
pub const SSTABLE_VERSION: u8 = 1;

/// Segment file extension.
pub const SSTABLE_EXT: &str = "sst";

/// Footer: three u64 offsets plus the repeated magic.
pub const FOOTER_LEN: usize = 8 + 8 + 8 + 4;

/// Compaction never raises a segment beyond this level.
pub const MAX_LEVEL: u8 = 7;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by segment read/write operations.
#[derive(Debug, Error)]
pub enum SstableError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Magic/footer/structure verification failure.
    #[error("Integrity failure in {path}: {reason}")]
    Integrity { path: String, reason: String },

    /// Column block or value codec failure.
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    /// Bloom filter deserialization failure.
    #[error("Bloom error: {0}")]
    Bloom(#[from] BloomError),

    /// Bad type tag in the column directory.
    #[error(transparent)]
    Schema(#[from] SchemaError),
}

// ------------------------------------------------------------------------------------------------
// Metadata
// ------------------------------------------------------------------------------------------------

/// Registry-persisted description of one segment file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SstableMetadata {
    pub segment_id: String,
    pub table_name: String,
    pub level: u8,
    pub min_row_id: u64,
    pub max_row_id: u64,
    pub entry_count: u32,
    pub size_bytes: u64,
    /// Milliseconds since the UNIX epoch.
    pub created_at: u64,
    pub columns: Vec<String>,
    pub bloom_filter_offset: u64,
    pub data_offset: u64,
    pub index_offset: u64,
}

impl SstableMetadata {
    /// Path of the segment file under `base`.
    pub fn path(&self, base: &Path) -> PathBuf {
        base.join(format!("{}.{SSTABLE_EXT}", self.segment_id))
    }
}

// ------------------------------------------------------------------------------------------------
// Reader
// ------------------------------------------------------------------------------------------------

struct ColumnBlock {
    name: String,
    data_type: DataType,
    /// Block byte range within the mapped file.
    offset: usize,
    len: usize,
}

/// Memory-mapped reader over one segment file.
pub struct Sstable {
    path: PathBuf,
    mmap: Mmap,
    table_name: String,
    entry_count: u32,
    min_row_id: u64,
    max_row_id: u64,
    level: u8,
    bloom: BloomFilter,
    columns: Vec<ColumnBlock>,
    sparse_index: Vec<(u64, u32)>,
    /// Row-id run byte range (compressed) within the mapped file.
    row_id_run: (usize, usize),
    /// Inflated row-id run, decoded once on first use.
    row_ids: OnceLock<Vec<u64>>,
}

impl Sstable {
    /// Opens and validates a segment file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SstableError> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        let mmap = unsafe { Mmap::map(&file)? };
        let integrity = |reason: &str| SstableError::Integrity {
            path: path.display().to_string(),
            reason: reason.to_string(),
        };

        if mmap.len() < FOOTER_LEN {
            return Err(integrity("file shorter than footer"));
        }
        let footer = &mmap[mmap.len() - FOOTER_LEN..];
        if &footer[24..28] != SSTABLE_MAGIC {
            return Err(integrity("bad footer magic"));
        }
        let bloom_off = u64::from_le_bytes(footer[0..8].try_into().unwrap()) as usize;
        let data_off = u64::from_le_bytes(footer[8..16].try_into().unwrap()) as usize;
        let index_off = u64::from_le_bytes(footer[16..24].try_into().unwrap()) as usize;
        if bloom_off >= mmap.len() || data_off >= mmap.len() || index_off >= mmap.len() {
            return Err(integrity("footer offsets out of range"));
        }

        // Header.
        let mut cursor = Cursor::new(&mmap);
        if cursor.take(4).map_err(SstableError::Codec)? != SSTABLE_MAGIC {
            return Err(integrity("bad header magic"));
        }
        let version = cursor.u8()?;
        if version != SSTABLE_VERSION {
            return Err(integrity(&format!("unsupported version {version}")));
        }
        let name_len = cursor.u16()? as usize;
        let table_name = String::from_utf8_lossy(cursor.take(name_len)?).into_owned();
        let entry_count = cursor.u32()?;
        let min_row_id = cursor.u64()?;
        let max_row_id = cursor.u64()?;
        let level = cursor.u8()?;
        let col_count = cursor.u16()? as usize;
        let mut column_defs = Vec::with_capacity(col_count);
        for _ in 0..col_count {
            let len = cursor.u16()? as usize;
            let name = String::from_utf8_lossy(cursor.take(len)?).into_owned();
            let data_type = DataType::from_tag(cursor.u8()?)?;
            column_defs.push((name, data_type));
        }

        // Bloom filter.
        let mut cursor = Cursor::new(&mmap[bloom_off..]);
        let bloom_len = cursor.u32()? as usize;
        let bloom = BloomFilter::from_bytes(cursor.take(bloom_len)?)?;

        // Data block: row-id run, then one block per column.
        let mut cursor = Cursor::new(&mmap[data_off..]);
        let run_len = cursor.u32()? as usize;
        let row_id_run = (data_off + cursor.position(), run_len);
        cursor.take(run_len)?;
        let mut columns = Vec::with_capacity(col_count);
        for (name, data_type) in column_defs {
            let block_len = cursor.u32()? as usize;
            let offset = data_off + cursor.position();
            cursor.take(block_len)?;
            columns.push(ColumnBlock {
                name,
                data_type,
                offset,
                len: block_len,
            });
        }

        // Sparse index.
        let mut cursor = Cursor::new(&mmap[index_off..]);
        let index_count = cursor.u32()? as usize;
        let mut sparse_index = Vec::with_capacity(index_count);
        for _ in 0..index_count {
            let row_id = cursor.u64()?;
            let anchor = cursor.u32()?;
            sparse_index.push((row_id, anchor));
        }

        Ok(Self {
            path,
            mmap,
            table_name,
            entry_count,
            min_row_id,
            max_row_id,
            level,
            bloom,
            columns,
            sparse_index,
            row_id_run,
            row_ids: OnceLock::new(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    pub fn entry_count(&self) -> u32 {
        self.entry_count
    }

    pub fn level(&self) -> u8 {
        self.level
    }

    pub fn min_row_id(&self) -> u64 {
        self.min_row_id
    }

    pub fn max_row_id(&self) -> u64 {
        self.max_row_id
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    /// Column directory with types, as needed to write merged segments.
    pub fn columns_with_types(&self) -> Vec<(String, DataType)> {
        self.columns
            .iter()
            .map(|c| (c.name.clone(), c.data_type))
            .collect()
    }

    pub fn sparse_index(&self) -> &[(u64, u32)] {
        &self.sparse_index
    }

    pub fn in_range(&self, row_id: u64) -> bool {
        row_id >= self.min_row_id && row_id <= self.max_row_id
    }

    /// Cheap negative test: min/max range, then bloom filter.
    pub fn might_contain(&self, row_id: u64) -> bool {
        self.in_range(row_id) && self.bloom.might_contain(row_id)
    }

    /// Inflates (once) and returns the row-id run.
    fn load_row_ids(&self) -> Result<&[u64], SstableError> {
        if let Some(ids) = self.row_ids.get() {
            return Ok(ids);
        }
        let (offset, len) = self.row_id_run;
        let raw = codec::zlib_decompress(&self.mmap[offset..offset + len])?;
        if raw.len() != self.entry_count as usize * 8 {
            return Err(SstableError::Integrity {
                path: self.path.display().to_string(),
                reason: format!(
                    "row-id run inflated to {} bytes for {} entries",
                    raw.len(),
                    self.entry_count
                ),
            });
        }
        let ids: Vec<u64> = raw
            .chunks_exact(8)
            .map(|chunk| i64::from_le_bytes(chunk.try_into().unwrap()) as u64)
            .collect();
        Ok(self.row_ids.get_or_init(|| ids))
    }

    fn column_slice(&self, block: &ColumnBlock) -> &[u8] {
        &self.mmap[block.offset..block.offset + block.len]
    }

    /// Decodes the row at ordinal `position`. Returns `(row, deleted)`;
    /// tombstones decode as all-null and report `deleted = true`.
    fn decode_row_at(&self, position: usize) -> Result<(Row, bool), SstableError> {
        let mut row = Row::new();
        let mut any_value = false;
        for block in &self.columns {
            let value =
                codec::decode_column_value_at(self.column_slice(block), block.data_type, position)?
                    .unwrap_or(Value::Null);
            if !value.is_null() {
                any_value = true;
                row.insert(block.name.clone(), value);
            }
        }
        Ok((row, !any_value))
    }

    /// Point lookup. `None` for absent or tombstoned row ids.
    pub fn get(&self, row_id: u64) -> Result<Option<Row>, SstableError> {
        Ok(self.get_raw(row_id)?.and_then(|(row, deleted)| (!deleted).then_some(row)))
    }

    /// Point lookup that surfaces tombstones; merge paths need to know that
    /// a segment explicitly deletes a row.
    pub fn get_raw(&self, row_id: u64) -> Result<Option<(Row, bool)>, SstableError> {
        if !self.might_contain(row_id) {
            return Ok(None);
        }
        let row_ids = self.load_row_ids()?;

        // Narrow the search window with the sparse index before bisecting.
        let (mut lo, mut hi) = (0usize, row_ids.len());
        if let Some(pos) = self
            .sparse_index
            .partition_point(|(anchor_id, _)| *anchor_id <= row_id)
            .checked_sub(1)
        {
            lo = self.sparse_index[pos].1 as usize;
            if let Some((_, next_anchor)) = self.sparse_index.get(pos + 1) {
                hi = (*next_anchor as usize).min(row_ids.len());
            }
        }

        match row_ids[lo..hi].binary_search(&row_id) {
            Ok(offset) => self.decode_row_at(lo + offset).map(Some),
            Err(_) => Ok(None),
        }
    }

    /// Ordered scan of live rows with optional inclusive bounds.
    pub fn scan(&self, lo: Option<u64>, hi: Option<u64>) -> Result<Vec<(u64, Row)>, SstableError> {
        Ok(self
            .scan_raw(lo, hi)?
            .into_iter()
            .filter(|(_, _, deleted)| !deleted)
            .map(|(row_id, row, _)| (row_id, row))
            .collect())
    }

    /// Ordered scan including tombstones, for merges and compaction.
    pub fn scan_raw(
        &self,
        lo: Option<u64>,
        hi: Option<u64>,
    ) -> Result<Vec<(u64, Row, bool)>, SstableError> {
        let row_ids = self.load_row_ids()?;
        let lo = lo.unwrap_or(0);
        let hi = hi.unwrap_or(u64::MAX);

        // Decode each needed column fully once, then assemble rows.
        let mut decoded: Vec<(&str, Vec<Value>)> = Vec::with_capacity(self.columns.len());
        for block in &self.columns {
            let values = codec::decode_column(self.column_slice(block), block.data_type)?;
            decoded.push((&block.name, values));
        }

        let mut out = Vec::new();
        for (position, row_id) in row_ids.iter().enumerate() {
            if *row_id < lo || *row_id > hi {
                continue;
            }
            let mut row = Row::new();
            let mut any_value = false;
            for (name, values) in &decoded {
                if let Some(value) = values.get(position)
                    && !value.is_null()
                {
                    any_value = true;
                    row.insert((*name).to_string(), value.clone());
                }
            }
            out.push((*row_id, row, !any_value));
        }
        Ok(out)
    }
}
