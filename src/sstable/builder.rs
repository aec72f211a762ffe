//! Segment writer. Drains a sorted entry set into the on-disk layout
//! described in the [module docs](super) and publishes the file atomically.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::{debug, info};
use uuid::Uuid;

use crate::bloom::BloomFilter;
use crate::codec;
use crate::memtable::MemTableEntry;
use crate::schema::{DataType, Value, now_millis};

use super::{SSTABLE_EXT, SSTABLE_MAGIC, SSTABLE_VERSION, SstableError, SstableMetadata};

/// Bloom sizing target for segment row-id filters.
const BLOOM_FALSE_POSITIVE_RATE: f64 = 0.01;

/// Writes segments for one table.
pub struct SstableWriter {
    base_path: PathBuf,
    table_name: String,
    columns: Vec<(String, DataType)>,
}

impl SstableWriter {
    pub fn new(
        base_path: impl AsRef<Path>,
        table_name: impl Into<String>,
        columns: Vec<(String, DataType)>,
    ) -> Self {
        Self {
            base_path: base_path.as_ref().to_path_buf(),
            table_name: table_name.into(),
            columns,
        }
    }

    fn generate_segment_id(&self) -> String {
        let suffix = Uuid::new_v4().simple().to_string();
        format!("{}_{}_{}", self.table_name, now_millis(), &suffix[..8])
    }

    /// Writes one segment at `level` from entries sorted by row id.
    ///
    /// Tombstones are written as all-null rows so deletions survive the
    /// flush. Returns `None` for an empty entry set.
    pub fn write(
        &self,
        mut entries: Vec<MemTableEntry>,
        level: u8,
    ) -> Result<Option<SstableMetadata>, SstableError> {
        if entries.is_empty() {
            return Ok(None);
        }
        entries.sort_by_key(|entry| entry.row_id);
        entries.dedup_by_key(|entry| entry.row_id);

        let segment_id = self.generate_segment_id();
        let final_path = self
            .base_path
            .join(format!("{segment_id}.{SSTABLE_EXT}"));
        let temp_path = self.base_path.join(format!("{segment_id}.tmp"));
        fs::create_dir_all(&self.base_path)?;

        let min_row_id = entries.first().map(|e| e.row_id).unwrap_or(0);
        let max_row_id = entries.last().map(|e| e.row_id).unwrap_or(0);

        let mut bloom = BloomFilter::new(entries.len(), BLOOM_FALSE_POSITIVE_RATE);
        for entry in &entries {
            bloom.add(entry.row_id);
        }

        // Header.
        let mut body = Vec::new();
        body.extend_from_slice(SSTABLE_MAGIC);
        body.push(SSTABLE_VERSION);
        body.extend_from_slice(&(self.table_name.len() as u16).to_le_bytes());
        body.extend_from_slice(self.table_name.as_bytes());
        body.extend_from_slice(&(entries.len() as u32).to_le_bytes());
        body.extend_from_slice(&min_row_id.to_le_bytes());
        body.extend_from_slice(&max_row_id.to_le_bytes());
        body.push(level);
        body.extend_from_slice(&(self.columns.len() as u16).to_le_bytes());
        for (name, data_type) in &self.columns {
            body.extend_from_slice(&(name.len() as u16).to_le_bytes());
            body.extend_from_slice(name.as_bytes());
            body.push(data_type.tag());
        }

        // Bloom filter block.
        let bloom_offset = body.len() as u64;
        let bloom_bytes = bloom.to_bytes();
        body.extend_from_slice(&(bloom_bytes.len() as u32).to_le_bytes());
        body.extend_from_slice(&bloom_bytes);

        // Placeholder for the sparse-index offset, patched below.
        let index_placeholder = body.len();
        body.extend_from_slice(&0u32.to_le_bytes());

        // Data block: compressed row-id run, then one block per column.
        let data_offset = body.len() as u64;
        let index_interval = (entries.len() / 100).max(1);
        let sparse_index: Vec<(u64, u32)> = entries
            .iter()
            .enumerate()
            .filter(|(position, _)| position % index_interval == 0)
            .map(|(position, entry)| (entry.row_id, position as u32))
            .collect();

        let mut run = Vec::with_capacity(entries.len() * 8);
        for entry in &entries {
            run.extend_from_slice(&(entry.row_id as i64).to_le_bytes());
        }
        let compressed_run = codec::zlib_compress(&run)?;
        body.extend_from_slice(&(compressed_run.len() as u32).to_le_bytes());
        body.extend_from_slice(&compressed_run);

        for (name, data_type) in &self.columns {
            let values: Vec<Value> = entries
                .iter()
                .map(|entry| entry.data.get(name).cloned().unwrap_or(Value::Null))
                .collect();
            let block = codec::encode_column(&values, *data_type, true)?;
            body.extend_from_slice(&(block.len() as u32).to_le_bytes());
            body.extend_from_slice(&block);
        }

        // Sparse index.
        let index_offset = body.len() as u64;
        body.extend_from_slice(&(sparse_index.len() as u32).to_le_bytes());
        for (row_id, anchor) in &sparse_index {
            body.extend_from_slice(&row_id.to_le_bytes());
            body.extend_from_slice(&anchor.to_le_bytes());
        }
        body[index_placeholder..index_placeholder + 4]
            .copy_from_slice(&(index_offset as u32).to_le_bytes());

        // Footer.
        body.extend_from_slice(&bloom_offset.to_le_bytes());
        body.extend_from_slice(&data_offset.to_le_bytes());
        body.extend_from_slice(&index_offset.to_le_bytes());
        body.extend_from_slice(SSTABLE_MAGIC);

        // Atomic publish: temp file, fsync, rename.
        {
            let mut file = File::create(&temp_path)?;
            file.write_all(&body)?;
            file.sync_all()?;
        }
        fs::rename(&temp_path, &final_path)?;

        debug!(
            segment = %segment_id,
            entries = entries.len(),
            level,
            bytes = body.len(),
            "segment written"
        );
        info!(table = %self.table_name, segment = %segment_id, "segment published");

        Ok(Some(SstableMetadata {
            segment_id,
            table_name: self.table_name.clone(),
            level,
            min_row_id,
            max_row_id,
            entry_count: entries.len() as u32,
            size_bytes: body.len() as u64,
            created_at: now_millis(),
            columns: self.columns.iter().map(|(name, _)| name.clone()).collect(),
            bloom_filter_offset: bloom_offset,
            data_offset,
            index_offset,
        }))
    }
}
