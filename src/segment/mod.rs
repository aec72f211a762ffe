//! # Direct-Flush Segment Module
//!
//! The alternative persistence path: every write batch produces a new,
//! immutable micro-segment on disk, with each row stored as a zlib-compressed,
//! encrypted JSON blob. No memtable, no write-ahead buffering — durability is
//! immediate at the cost of many small files, reclaimed by merge-all
//! compaction.
//!
//! # On-disk layout (`*.sstd`)
//!
//! ```text
//! [magic "KTDB"][version u8 = 3]
//! [name_len u16][table name]
//! [entry_count u32][min_row_id u64][max_row_id u64][encrypted u8 = 1]
//! [col_count u16]{[name_len u16][name][type_tag u8]}×col_count
//! data block, per entry:
//!   [row_id u64][compressed_len u32][zlib(json(ciphertext row))]
//! index:
//!   [index_count u32]{[row_id u64][data_offset u32]}×index_count
//! footer:
//!   [data_start u64][index_off u64][footer_off u64][magic "KTDB"]
//! ```
//!
//! Index offsets are relative to the start of the data block.
//!
//! ## Deletions
//!
//! A delete appends a newer version of the row carrying the reserved
//! `__deleted__` marker. Reads resolve newest-segment-first, so the marker
//! shadows older versions until compaction drops both.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------


// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use memmap2::Mmap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::codec::{self, CodecError, Cursor};
use crate::crypto::{CryptoError, CryptoManager};
use crate::schema::{DataType, Row, Value, now_millis, row_from_json};

// ------------------------------------------------------------------------------------------------
// Constants
// ------------------------------------------------------------------------------------------------

/// Segment file magic, repeated in the footer.
pub const SEGMENT_MAGIC: &[u8; 4] = b"KTDB";

/// Current direct-flush format version.
pub const SEGMENT_VERSION: u8 = 3;

/// Direct-flush segment extension.
pub const SEGMENT_EXT: &str = "sstd";

/// Reserved column marking a row version as a deletion.
pub const DELETED_MARKER: &str = "__deleted__";

const FOOTER_LEN: usize = 8 + 8 + 8 + 4;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by direct-flush operations.
#[derive(Debug, Error)]
pub enum SegmentError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Magic/footer/structure verification failure.
    #[error("Integrity failure in {path}: {reason}")]
    Integrity { path: String, reason: String },

    /// Compression codec failure.
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    /// Row decryption failure.
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Row blob is not valid JSON.
    #[error("Row payload error: {0}")]
    Payload(#[from] serde_json::Error),

    /// Table was never registered with the manager.
    #[error("Table '{0}' is not registered")]
    UnknownTable(String),

    /// Background task failure.
    #[error("Internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Metadata
// ------------------------------------------------------------------------------------------------

/// Description of one direct-flush segment file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TableSegment {
    pub segment_id: String,
    pub table_name: String,
    pub min_row_id: u64,
    pub max_row_id: u64,
    pub entry_count: u32,
    pub size_bytes: u64,
    /// Milliseconds since the UNIX epoch.
    pub created_at: u64,
    pub columns: Vec<String>,
    pub encrypted: bool,
}

// ------------------------------------------------------------------------------------------------
// Writer
// ------------------------------------------------------------------------------------------------

/// Writes micro-segments for one table.
pub struct DirectFlushWriter {
    base_path: PathBuf,
    table_name: String,
    columns: Vec<(String, DataType)>,
    crypto: Arc<CryptoManager>,
}

impl DirectFlushWriter {
    pub fn new(
        base_path: impl AsRef<Path>,
        table_name: impl Into<String>,
        columns: Vec<(String, DataType)>,
        crypto: Arc<CryptoManager>,
    ) -> Self {
        Self {
            base_path: base_path.as_ref().to_path_buf(),
            table_name: table_name.into(),
            columns,
            crypto,
        }
    }

    fn generate_segment_id(&self) -> String {
        let suffix = Uuid::new_v4().simple().to_string();
        format!("{}_{}_{}", self.table_name, now_millis(), &suffix[..8])
    }

    /// Writes one row as its own micro-segment.
    pub fn write_single(&self, row_id: u64, row: &Row) -> Result<TableSegment, SegmentError> {
        self.write_batch(vec![(row_id, row.clone())])
            .map(|meta| meta.expect("single-row batch is never empty"))
    }

    /// Writes a batch of rows as one segment. Returns `None` for an empty
    /// batch.
    pub fn write_batch(
        &self,
        mut rows: Vec<(u64, Row)>,
    ) -> Result<Option<TableSegment>, SegmentError> {
        if rows.is_empty() {
            return Ok(None);
        }
        rows.sort_by_key(|(row_id, _)| *row_id);
        rows.dedup_by_key(|(row_id, _)| *row_id);

        let segment_id = self.generate_segment_id();
        let final_path = self.base_path.join(format!("{segment_id}.{SEGMENT_EXT}"));
        let temp_path = self.base_path.join(format!("{segment_id}.tmp"));
        fs::create_dir_all(&self.base_path)?;

        let min_row_id = rows.first().map(|(id, _)| *id).unwrap_or(0);
        let max_row_id = rows.last().map(|(id, _)| *id).unwrap_or(0);

        // Header.
        let mut body = Vec::new();
        body.extend_from_slice(SEGMENT_MAGIC);
        body.push(SEGMENT_VERSION);
        body.extend_from_slice(&(self.table_name.len() as u16).to_le_bytes());
        body.extend_from_slice(self.table_name.as_bytes());
        body.extend_from_slice(&(rows.len() as u32).to_le_bytes());
        body.extend_from_slice(&min_row_id.to_le_bytes());
        body.extend_from_slice(&max_row_id.to_le_bytes());
        body.push(u8::from(self.crypto.enabled()));
        body.extend_from_slice(&(self.columns.len() as u16).to_le_bytes());
        for (name, data_type) in &self.columns {
            body.extend_from_slice(&(name.len() as u16).to_le_bytes());
            body.extend_from_slice(name.as_bytes());
            body.push(data_type.tag());
        }

        // Data block: each row as an encrypted, compressed JSON blob.
        let data_start = body.len() as u64;
        let mut index = Vec::with_capacity(rows.len());
        for (row_id, row) in &rows {
            let offset = (body.len() as u64 - data_start) as u32;
            index.push((*row_id, offset));

            let ciphertext = self.crypto.encrypt_row(row);
            // The token is itself JSON-framed as a string so the blob stays
            // self-describing when encryption is disabled.
            let blob = serde_json::to_vec(&serde_json::Value::String(
                String::from_utf8_lossy(&ciphertext).into_owned(),
            ))?;
            let compressed = codec::zlib_compress(&blob)?;

            body.extend_from_slice(&row_id.to_le_bytes());
            body.extend_from_slice(&(compressed.len() as u32).to_le_bytes());
            body.extend_from_slice(&compressed);
        }

        // Index.
        let index_off = body.len() as u64;
        body.extend_from_slice(&(index.len() as u32).to_le_bytes());
        for (row_id, offset) in &index {
            body.extend_from_slice(&row_id.to_le_bytes());
            body.extend_from_slice(&offset.to_le_bytes());
        }

        // Footer.
        let footer_off = body.len() as u64;
        body.extend_from_slice(&data_start.to_le_bytes());
        body.extend_from_slice(&index_off.to_le_bytes());
        body.extend_from_slice(&footer_off.to_le_bytes());
        body.extend_from_slice(SEGMENT_MAGIC);

        {
            let mut file = File::create(&temp_path)?;
            file.write_all(&body)?;
            file.sync_all()?;
        }
        fs::rename(&temp_path, &final_path)?;

        debug!(segment = %segment_id, rows = rows.len(), "direct-flush segment written");

        Ok(Some(TableSegment {
            segment_id,
            table_name: self.table_name.clone(),
            min_row_id,
            max_row_id,
            entry_count: rows.len() as u32,
            size_bytes: body.len() as u64,
            created_at: now_millis(),
            columns: self.columns.iter().map(|(name, _)| name.clone()).collect(),
            encrypted: self.crypto.enabled(),
        }))
    }
}

// ------------------------------------------------------------------------------------------------
// Reader
// ------------------------------------------------------------------------------------------------

/// Memory-mapped reader over one direct-flush segment.
pub struct DirectFlushReader {
    path: PathBuf,
    mmap: Mmap,
    metadata: TableSegment,
    /// `(row_id, offset relative to data_start)`, sorted by row id.
    index: Vec<(u64, u32)>,
    data_start: usize,
    crypto: Arc<CryptoManager>,
}

impl DirectFlushReader {
    /// Opens and validates a segment file.
    pub fn open(path: impl AsRef<Path>, crypto: Arc<CryptoManager>) -> Result<Self, SegmentError> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        let mmap = unsafe { Mmap::map(&file)? };
        let integrity = |reason: &str| SegmentError::Integrity {
            path: path.display().to_string(),
            reason: reason.to_string(),
        };

        if mmap.len() < FOOTER_LEN {
            return Err(integrity("file shorter than footer"));
        }
        let footer = &mmap[mmap.len() - FOOTER_LEN..];
        if &footer[24..28] != SEGMENT_MAGIC {
            return Err(integrity("bad footer magic"));
        }
        let data_start = u64::from_le_bytes(footer[0..8].try_into().unwrap()) as usize;
        let index_off = u64::from_le_bytes(footer[8..16].try_into().unwrap()) as usize;
        if data_start >= mmap.len() || index_off >= mmap.len() {
            return Err(integrity("footer offsets out of range"));
        }

        let mut cursor = Cursor::new(&mmap);
        if cursor.take(4)? != SEGMENT_MAGIC {
            return Err(integrity("bad header magic"));
        }
        let version = cursor.u8()?;
        if version != SEGMENT_VERSION {
            return Err(integrity(&format!("unsupported version {version}")));
        }
        let name_len = cursor.u16()? as usize;
        let table_name = String::from_utf8_lossy(cursor.take(name_len)?).into_owned();
        let entry_count = cursor.u32()?;
        let min_row_id = cursor.u64()?;
        let max_row_id = cursor.u64()?;
        let encrypted = cursor.u8()? == 1;
        let col_count = cursor.u16()? as usize;
        let mut columns = Vec::with_capacity(col_count);
        for _ in 0..col_count {
            let len = cursor.u16()? as usize;
            columns.push(String::from_utf8_lossy(cursor.take(len)?).into_owned());
            cursor.u8()?; // type tag, unused by the blob reader
        }

        let mut cursor = Cursor::new(&mmap[index_off..]);
        let index_count = cursor.u32()? as usize;
        let mut index = Vec::with_capacity(index_count);
        for _ in 0..index_count {
            let row_id = cursor.u64()?;
            let offset = cursor.u32()?;
            index.push((row_id, offset));
        }
        index.sort_by_key(|(row_id, _)| *row_id);

        let segment_id = path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .unwrap_or_default()
            .to_string();

        Ok(Self {
            metadata: TableSegment {
                segment_id,
                table_name,
                min_row_id,
                max_row_id,
                entry_count,
                size_bytes: mmap.len() as u64,
                created_at: 0,
                columns,
                encrypted,
            },
            path,
            mmap,
            index,
            data_start,
            crypto,
        })
    }

    pub fn metadata(&self) -> &TableSegment {
        &self.metadata
    }

    pub fn contains_row(&self, row_id: u64) -> bool {
        row_id >= self.metadata.min_row_id && row_id <= self.metadata.max_row_id
    }

    fn read_row_at(&self, row_id: u64, offset: u32) -> Result<Row, SegmentError> {
        let integrity = |reason: String| SegmentError::Integrity {
            path: self.path.display().to_string(),
            reason,
        };
        let at = self.data_start + offset as usize;
        let mut cursor = Cursor::new(&self.mmap[at..]);
        let stored_row_id = cursor.u64()?;
        if stored_row_id != row_id {
            return Err(integrity(format!(
                "index points row {row_id} at a frame holding row {stored_row_id}"
            )));
        }
        let compressed_len = cursor.u32()? as usize;
        let blob = codec::zlib_decompress(cursor.take(compressed_len)?)?;
        let framed: serde_json::Value = serde_json::from_slice(&blob)?;
        let token = framed
            .as_str()
            .ok_or_else(|| integrity("row blob frame is not a string".into()))?;
        let plain = self.crypto.decrypt(token.as_bytes())?;
        let json: serde_json::Value = serde_json::from_slice(&plain)?;
        Ok(row_from_json(&json))
    }

    /// Point lookup within this segment. Deletion markers are returned as-is;
    /// resolution across segments happens in the manager.
    pub fn get(&self, row_id: u64) -> Result<Option<Row>, SegmentError> {
        let Ok(position) = self.index.binary_search_by_key(&row_id, |(id, _)| *id) else {
            return Ok(None);
        };
        self.read_row_at(row_id, self.index[position].1).map(Some)
    }

    /// Ordered scan with optional inclusive bounds, markers included.
    pub fn scan(
        &self,
        min_row_id: Option<u64>,
        max_row_id: Option<u64>,
    ) -> Result<Vec<(u64, Row)>, SegmentError> {
        let lo = min_row_id.unwrap_or(0);
        let hi = max_row_id.unwrap_or(u64::MAX);
        let mut out = Vec::new();
        for (row_id, offset) in &self.index {
            if *row_id < lo || *row_id > hi {
                continue;
            }
            out.push((*row_id, self.read_row_at(*row_id, *offset)?));
        }
        Ok(out)
    }
}

/// True when the row version is a deletion marker.
pub fn is_deleted(row: &Row) -> bool {
    matches!(row.get(DELETED_MARKER), Some(Value::Bool(true)))
}

/// The deletion marker row appended by `delete`.
pub fn deleted_row() -> Row {
    [(DELETED_MARKER.to_string(), Value::Bool(true))]
        .into_iter()
        .collect()
}

// ------------------------------------------------------------------------------------------------
// Manager
// ------------------------------------------------------------------------------------------------

struct ManagerInner {
    writers: HashMap<String, Arc<DirectFlushWriter>>,
    segments: HashMap<String, Vec<TableSegment>>,
    row_counters: HashMap<String, u64>,
}

/// Owns direct-flush segments for every table: write dispatch, newest-first
/// reads, merge-all compaction, and startup discovery.
pub struct DirectFlushManager {
    base_path: PathBuf,
    crypto: Arc<CryptoManager>,
    inner: RwLock<ManagerInner>,
}

impl DirectFlushManager {
    pub fn new(base_path: impl AsRef<Path>, crypto: Arc<CryptoManager>) -> Self {
        Self {
            base_path: base_path.as_ref().to_path_buf(),
            crypto,
            inner: RwLock::new(ManagerInner {
                writers: HashMap::new(),
                segments: HashMap::new(),
                row_counters: HashMap::new(),
            }),
        }
    }

    fn table_dir(&self, table: &str) -> PathBuf {
        self.base_path.join(table)
    }

    fn segment_path(&self, table: &str, segment_id: &str) -> PathBuf {
        self.table_dir(table).join(format!("{segment_id}.{SEGMENT_EXT}"))
    }

    /// Discovers existing segments on disk and rebuilds per-table state.
    /// Unreadable segments are skipped with a warning.
    pub async fn initialize(&self) -> Result<(), SegmentError> {
        fs::create_dir_all(&self.base_path)?;
        let mut inner = self.inner.write().await;
        for table_entry in fs::read_dir(&self.base_path)? {
            let table_dir = table_entry?.path();
            if !table_dir.is_dir() {
                continue;
            }
            for entry in fs::read_dir(&table_dir)? {
                let path = entry?.path();
                if path.extension().and_then(|ext| ext.to_str()) != Some(SEGMENT_EXT) {
                    continue;
                }
                match DirectFlushReader::open(&path, Arc::clone(&self.crypto)) {
                    Ok(reader) => {
                        let mut meta = reader.metadata().clone();
                        meta.created_at = segment_created_at(&meta.segment_id);
                        let counter = inner
                            .row_counters
                            .entry(meta.table_name.clone())
                            .or_insert(0);
                        *counter = (*counter).max(meta.max_row_id + 1);
                        inner
                            .segments
                            .entry(meta.table_name.clone())
                            .or_default()
                            .push(meta);
                    }
                    Err(err) => {
                        warn!("Skipping unreadable segment {}: {err}", path.display());
                    }
                }
            }
        }
        // Oldest-first so newest-first reads can just iterate in reverse.
        for segments in inner.segments.values_mut() {
            segments.sort_by(|a, b| {
                a.created_at
                    .cmp(&b.created_at)
                    .then_with(|| a.segment_id.cmp(&b.segment_id))
            });
        }
        info!(
            tables = inner.segments.len(),
            "direct-flush manager initialized"
        );
        Ok(())
    }

    /// Registers a table, creating its directory and writer.
    pub async fn register_table(
        &self,
        table: &str,
        columns: Vec<(String, DataType)>,
    ) -> Result<(), SegmentError> {
        let dir = self.table_dir(table);
        fs::create_dir_all(&dir)?;
        let mut inner = self.inner.write().await;
        inner.writers.insert(
            table.to_string(),
            Arc::new(DirectFlushWriter::new(
                dir,
                table,
                columns,
                Arc::clone(&self.crypto),
            )),
        );
        inner.segments.entry(table.to_string()).or_default();
        inner.row_counters.entry(table.to_string()).or_insert(0);
        Ok(())
    }

    /// Drops a table's segments and state.
    pub async fn drop_table(&self, table: &str) -> Result<(), SegmentError> {
        let mut inner = self.inner.write().await;
        inner.writers.remove(table);
        inner.segments.remove(table);
        inner.row_counters.remove(table);
        let dir = self.table_dir(table);
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
        }
        Ok(())
    }

    /// Allocates the next row id for a table.
    pub async fn next_row_id(&self, table: &str) -> u64 {
        let mut inner = self.inner.write().await;
        let counter = inner.row_counters.entry(table.to_string()).or_insert(0);
        let row_id = *counter;
        *counter += 1;
        row_id
    }

    async fn writer_for(&self, table: &str) -> Result<Arc<DirectFlushWriter>, SegmentError> {
        self.inner
            .read()
            .await
            .writers
            .get(table)
            .cloned()
            .ok_or_else(|| SegmentError::UnknownTable(table.to_string()))
    }

    async fn record_segment(&self, table: &str, segment: TableSegment) {
        let mut inner = self.inner.write().await;
        let counter = inner.row_counters.entry(table.to_string()).or_insert(0);
        *counter = (*counter).max(segment.max_row_id + 1);
        inner
            .segments
            .entry(table.to_string())
            .or_default()
            .push(segment);
    }

    /// Writes one row as a new segment.
    pub async fn insert(&self, table: &str, row_id: u64, row: Row) -> Result<(), SegmentError> {
        let writer = self.writer_for(table).await?;
        let segment = tokio::task::spawn_blocking(move || writer.write_single(row_id, &row))
            .await
            .map_err(|err| SegmentError::Internal(format!("write task failed: {err}")))??;
        self.record_segment(table, segment).await;
        Ok(())
    }

    /// Writes a batch of rows as one segment.
    pub async fn insert_batch(
        &self,
        table: &str,
        rows: Vec<(u64, Row)>,
    ) -> Result<(), SegmentError> {
        if rows.is_empty() {
            return Ok(());
        }
        let writer = self.writer_for(table).await?;
        let segment = tokio::task::spawn_blocking(move || writer.write_batch(rows))
            .await
            .map_err(|err| SegmentError::Internal(format!("write task failed: {err}")))??;
        if let Some(segment) = segment {
            self.record_segment(table, segment).await;
        }
        Ok(())
    }

    /// Newest-first point lookup. Deletion markers resolve to `None`.
    pub async fn get(&self, table: &str, row_id: u64) -> Result<Option<Row>, SegmentError> {
        let candidates: Vec<TableSegment> = {
            let inner = self.inner.read().await;
            let Some(segments) = inner.segments.get(table) else {
                return Ok(None);
            };
            segments
                .iter()
                .rev()
                .filter(|meta| row_id >= meta.min_row_id && row_id <= meta.max_row_id)
                .cloned()
                .collect()
        };

        for meta in candidates {
            let path = self.segment_path(table, &meta.segment_id);
            if !path.exists() {
                continue;
            }
            let crypto = Arc::clone(&self.crypto);
            let found = tokio::task::spawn_blocking(move || {
                DirectFlushReader::open(&path, crypto)?.get(row_id)
            })
            .await
            .map_err(|err| SegmentError::Internal(format!("read task failed: {err}")))??;
            if let Some(row) = found {
                return Ok((!is_deleted(&row)).then_some(row));
            }
        }
        Ok(None)
    }

    /// Merged scan across all segments, newest version per row id winning.
    /// Deletion markers shadow older versions and are then dropped.
    pub async fn scan(
        &self,
        table: &str,
        min_row_id: Option<u64>,
        max_row_id: Option<u64>,
    ) -> Result<Vec<(u64, Row)>, SegmentError> {
        Ok(self
            .scan_raw(table, min_row_id, max_row_id)
            .await?
            .into_iter()
            .filter(|(_, row)| !is_deleted(row))
            .collect())
    }

    /// Merged scan keeping deletion markers; compaction feeds on this.
    async fn scan_raw(
        &self,
        table: &str,
        min_row_id: Option<u64>,
        max_row_id: Option<u64>,
    ) -> Result<Vec<(u64, Row)>, SegmentError> {
        let segments: Vec<TableSegment> = {
            let inner = self.inner.read().await;
            inner.segments.get(table).cloned().unwrap_or_default()
        };

        let mut merged: BTreeMap<u64, Row> = BTreeMap::new();
        // Oldest first; later (newer) segments overwrite.
        for meta in segments {
            if let Some(lo) = min_row_id
                && meta.max_row_id < lo
            {
                continue;
            }
            if let Some(hi) = max_row_id
                && meta.min_row_id > hi
            {
                continue;
            }
            let path = self.segment_path(table, &meta.segment_id);
            if !path.exists() {
                continue;
            }
            let crypto = Arc::clone(&self.crypto);
            let rows = tokio::task::spawn_blocking(move || {
                DirectFlushReader::open(&path, crypto)?.scan(min_row_id, max_row_id)
            })
            .await
            .map_err(|err| SegmentError::Internal(format!("scan task failed: {err}")))??;
            for (row_id, row) in rows {
                merged.insert(row_id, row);
            }
        }
        Ok(merged.into_iter().collect())
    }

    /// All live rows of a table.
    pub async fn get_all(&self, table: &str) -> Result<Vec<(u64, Row)>, SegmentError> {
        self.scan(table, None, None).await
    }

    /// Linear equality search over live rows.
    pub async fn find_by_column(
        &self,
        table: &str,
        column: &str,
        value: &Value,
    ) -> Result<Vec<(u64, Row)>, SegmentError> {
        Ok(self
            .get_all(table)
            .await?
            .into_iter()
            .filter(|(_, row)| {
                row.get(column).is_some_and(|cell| {
                    cell == value || cell.display_string() == value.display_string()
                })
            })
            .collect())
    }

    /// Appends a merged newer version of the row.
    pub async fn update(&self, table: &str, row_id: u64, partial: Row) -> Result<bool, SegmentError> {
        let Some(mut existing) = self.get(table, row_id).await? else {
            return Ok(false);
        };
        existing.extend(partial);
        self.insert(table, row_id, existing).await?;
        Ok(true)
    }

    /// Appends a deletion marker for the row.
    pub async fn delete(&self, table: &str, row_id: u64) -> Result<(), SegmentError> {
        self.insert(table, row_id, deleted_row()).await
    }

    /// Merges every segment of a table into one, dropping deleted rows and
    /// old versions, then removes the inputs.
    pub async fn compact_table(&self, table: &str) -> Result<(), SegmentError> {
        let live = self
            .scan_raw(table, None, None)
            .await?
            .into_iter()
            .filter(|(_, row)| !is_deleted(row))
            .collect::<Vec<_>>();

        let old_segments: Vec<TableSegment> = {
            let inner = self.inner.read().await;
            inner.segments.get(table).cloned().unwrap_or_default()
        };
        if old_segments.len() <= 1 {
            return Ok(());
        }

        let replacement = if live.is_empty() {
            None
        } else {
            let writer = self.writer_for(table).await?;
            tokio::task::spawn_blocking(move || writer.write_batch(live))
                .await
                .map_err(|err| SegmentError::Internal(format!("compact task failed: {err}")))??
        };

        {
            let mut inner = self.inner.write().await;
            let slot = inner.segments.entry(table.to_string()).or_default();
            *slot = replacement.clone().into_iter().collect();
        }

        let keep = replacement.as_ref().map(|meta| meta.segment_id.clone());
        for old in old_segments {
            if Some(&old.segment_id) == keep.as_ref() {
                continue;
            }
            let path = self.segment_path(table, &old.segment_id);
            if path.exists()
                && let Err(err) = fs::remove_file(&path)
            {
                warn!("Failed to remove compacted segment {}: {err}", path.display());
            }
        }
        info!(table, "direct-flush compaction finished");
        Ok(())
    }

    pub async fn entry_count(&self, table: &str) -> u64 {
        self.inner
            .read()
            .await
            .segments
            .get(table)
            .map(|segments| segments.iter().map(|s| u64::from(s.entry_count)).sum())
            .unwrap_or(0)
    }

    /// Per-table segment statistics.
    pub async fn stats(&self) -> serde_json::Value {
        let inner = self.inner.read().await;
        let tables: serde_json::Map<String, serde_json::Value> = inner
            .segments
            .iter()
            .map(|(table, segments)| {
                (
                    table.clone(),
                    serde_json::json!({
                        "segments": segments.len(),
                        "entries": segments.iter().map(|s| u64::from(s.entry_count)).sum::<u64>(),
                        "size_bytes": segments.iter().map(|s| s.size_bytes).sum::<u64>(),
                    }),
                )
            })
            .collect();
        serde_json::json!({
            "backend": "direct_flush",
            "tables": tables,
        })
    }
}

/// Extracts the creation timestamp embedded in a segment id.
fn segment_created_at(segment_id: &str) -> u64 {
    segment_id
        .rsplit('_')
        .nth(1)
        .and_then(|millis| millis.parse().ok())
        .unwrap_or(0)
}
