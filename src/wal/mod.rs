//! # Write-Ahead Log Module
//!
//! Durable, append-only log of transactional mutations. Every record is
//! fsynced before the append returns, which is what lets a commit be
//! acknowledged only once it is crash-safe.
//!
//! # On-disk layout
//!
//! One or more `wal_<millis>.wal` files under the WAL directory, each a
//! sequence of frames:
//!
//! ```text
//! [magic "WAL1"][payload_len u32 LE][payload][crc32(payload) u32 LE]
//! ```
//!
//! The payload is a UTF-8 JSON object carrying the record kind (operation,
//! COMMIT, ABORT), transaction id, operation type, table, row id, data, and
//! timestamp.
//!
//! # Guarantees
//!
//! - **Durability:** every `append` ends with `File::sync_all`.
//! - **Corruption detection:** replay verifies magic and CRC per frame and
//!   stops a file at the first damaged frame, keeping everything before it.
//! - **Ordering:** records of one transaction appear in append order; the
//!   commit record strictly follows all of its operation records.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------


// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::schema::now_millis;

// ------------------------------------------------------------------------------------------------
// Constants
// ------------------------------------------------------------------------------------------------

/// Frame magic.
pub const WAL_MAGIC: &[u8; 4] = b"WAL1";

/// Default retention for [`Wal::cleanup`]: 24 hours.
pub const DEFAULT_RETENTION_MS: u64 = 24 * 60 * 60 * 1000;

const FRAME_OVERHEAD: usize = 4 + 4 + 4;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by WAL operations.
#[derive(Debug, Error)]
pub enum WalError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Payload (de)serialization failure.
    #[error("Payload error: {0}")]
    Payload(#[from] serde_json::Error),

    /// Frame failed magic or CRC verification.
    #[error("Corrupt WAL frame: {0}")]
    Corrupt(String),
}

// ------------------------------------------------------------------------------------------------
// Records
// ------------------------------------------------------------------------------------------------

/// Kind of row mutation carried by an operation record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OpType {
    Insert,
    Update,
    Delete,
    CreateTable,
    DropTable,
}

/// One WAL record. Serialized as the frame's JSON payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WalRecord {
    Operation {
        txn_id: String,
        op_type: OpType,
        table: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        row_id: Option<u64>,
        data: serde_json::Value,
        timestamp: u64,
    },
    Commit {
        txn_id: String,
        timestamp: u64,
    },
    Abort {
        txn_id: String,
        timestamp: u64,
    },
}

impl WalRecord {
    pub fn txn_id(&self) -> &str {
        match self {
            WalRecord::Operation { txn_id, .. }
            | WalRecord::Commit { txn_id, .. }
            | WalRecord::Abort { txn_id, .. } => txn_id,
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Wal
// ------------------------------------------------------------------------------------------------

/// Append-only write-ahead log over a directory of frame files.
///
/// All appends serialize on one internal lock; the active file is created
/// lazily on first append and named after its creation time so age-based
/// cleanup can parse it back.
pub struct Wal {
    dir: PathBuf,
    active: Mutex<Option<(PathBuf, File)>>,
}

impl Wal {
    /// Opens (or creates) the WAL directory.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, WalError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        info!("Opened WAL directory at {}", dir.display());
        Ok(Self {
            dir,
            active: Mutex::new(None),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn frame(record: &WalRecord) -> Result<Vec<u8>, WalError> {
        let payload = serde_json::to_vec(record)?;
        let mut out = Vec::with_capacity(payload.len() + FRAME_OVERHEAD);
        out.extend_from_slice(WAL_MAGIC);
        out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        out.extend_from_slice(&payload);
        out.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
        Ok(out)
    }

    /// Appends one record and fsyncs before returning.
    pub fn append(&self, record: &WalRecord) -> Result<(), WalError> {
        let frame = Self::frame(record)?;
        let mut guard = self.active.lock().expect("WAL lock poisoned");
        if guard.is_none() {
            let path = self.dir.join(format!("wal_{}.wal", now_millis()));
            let file = OpenOptions::new().create(true).append(true).open(&path)?;
            info!("Created WAL file {}", path.display());
            *guard = Some((path, file));
        }
        let (_, file) = guard.as_mut().expect("just initialized");
        file.write_all(&frame)?;
        file.sync_all()?;
        Ok(())
    }

    /// WAL file paths in name (= creation time) order.
    fn wal_files(&self) -> Result<Vec<PathBuf>, WalError> {
        let mut files: Vec<PathBuf> = fs::read_dir(&self.dir)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.extension().and_then(|ext| ext.to_str()) == Some("wal"))
            .collect();
        files.sort();
        Ok(files)
    }

    /// Replays every intact record across all WAL files, oldest file first.
    ///
    /// A damaged frame ends its file's replay with a warning; earlier frames
    /// in that file and all other files are still returned.
    pub fn replay(&self) -> Result<Vec<WalRecord>, WalError> {
        let mut records = Vec::new();
        for path in self.wal_files()? {
            let data = fs::read(&path)?;
            let mut offset = 0usize;
            while offset + FRAME_OVERHEAD <= data.len() {
                if &data[offset..offset + 4] != WAL_MAGIC {
                    warn!(
                        "WAL {} has bad magic at offset {offset}, truncating replay",
                        path.display()
                    );
                    break;
                }
                let len =
                    u32::from_le_bytes(data[offset + 4..offset + 8].try_into().unwrap()) as usize;
                let payload_start = offset + 8;
                let crc_start = payload_start + len;
                if crc_start + 4 > data.len() {
                    warn!(
                        "WAL {} ends mid-frame at offset {offset}, truncating replay",
                        path.display()
                    );
                    break;
                }
                let payload = &data[payload_start..crc_start];
                let stored_crc =
                    u32::from_le_bytes(data[crc_start..crc_start + 4].try_into().unwrap());
                if crc32fast::hash(payload) != stored_crc {
                    warn!(
                        "WAL {} CRC mismatch at offset {offset}, truncating replay",
                        path.display()
                    );
                    break;
                }
                match serde_json::from_slice::<WalRecord>(payload) {
                    Ok(record) => records.push(record),
                    Err(err) => {
                        warn!(
                            "WAL {} undecodable payload at offset {offset}: {err}",
                            path.display()
                        );
                        break;
                    }
                }
                offset = crc_start + 4;
            }
        }
        info!("Replayed {} WAL records", records.len());
        Ok(records)
    }

    /// Deletes WAL files created more than `max_age_ms` ago. The active file
    /// is rotated out first if it is old enough to qualify.
    pub fn cleanup(&self, max_age_ms: u64) -> Result<usize, WalError> {
        let cutoff = now_millis().saturating_sub(max_age_ms);
        let mut removed = 0usize;
        let mut guard = self.active.lock().expect("WAL lock poisoned");
        for path in self.wal_files()? {
            let Some(created) = path
                .file_stem()
                .and_then(|stem| stem.to_str())
                .and_then(|stem| stem.strip_prefix("wal_"))
                .and_then(|millis| millis.parse::<u64>().ok())
            else {
                continue;
            };
            if created < cutoff {
                if let Some((active_path, _)) = guard.as_ref()
                    && active_path == &path
                {
                    *guard = None;
                }
                fs::remove_file(&path)?;
                removed += 1;
            }
        }
        if removed > 0 {
            info!("WAL cleanup removed {removed} file(s)");
        }
        Ok(removed)
    }
}
