//! # Segment Registry Module
//!
//! Persistent metadata index of every SSTable, keyed by table. The registry
//! is the durable source of truth for which segments exist and in what
//! creation order — the order that read-path merges and compaction rely on.
//!
//! # On-disk layout
//!
//! `sstable_registry.json` under the segments directory: a JSON map
//! `table_name → [metadata…]`. Both `register` and `unregister` persist
//! synchronously via an atomic temp-write-then-rename so a crash never leaves
//! a half-written registry.
//!
//! ## Startup
//!
//! [`SstableRegistry::load`] drops metadata whose segment file has gone
//! missing (a crash between segment deletion and registry persist), logging
//! each drop.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests;

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use thiserror::Error;
use tracing::{info, warn};

use crate::sstable::SstableMetadata;

// ------------------------------------------------------------------------------------------------
// Constants
// ------------------------------------------------------------------------------------------------

/// Registry file name under the segments directory.
pub const REGISTRY_FILE: &str = "sstable_registry.json";

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by registry operations.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Registry file is not valid JSON.
    #[error("Registry file error: {0}")]
    Format(#[from] serde_json::Error),
}

// ------------------------------------------------------------------------------------------------
// SstableRegistry
// ------------------------------------------------------------------------------------------------

/// Durable index of segment metadata per table.
pub struct SstableRegistry {
    base_path: PathBuf,
    inner: RwLock<HashMap<String, Vec<SstableMetadata>>>,
}

impl SstableRegistry {
    pub fn new(base_path: impl AsRef<Path>) -> Self {
        Self {
            base_path: base_path.as_ref().to_path_buf(),
            inner: RwLock::new(HashMap::new()),
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn registry_path(&self) -> PathBuf {
        self.base_path.join(REGISTRY_FILE)
    }

    /// Loads the registry file, dropping entries whose segment file is gone.
    pub fn load(&self) -> Result<(), RegistryError> {
        fs::create_dir_all(&self.base_path)?;
        let path = self.registry_path();
        if !path.exists() {
            info!("No segment registry at {}, starting empty", path.display());
            return Ok(());
        }

        let data = fs::read(&path)?;
        let mut map: HashMap<String, Vec<SstableMetadata>> = serde_json::from_slice(&data)?;
        for (table, segments) in &mut map {
            segments.retain(|meta| {
                let exists = meta.path(&self.base_path).exists();
                if !exists {
                    warn!(
                        table = %table,
                        segment = %meta.segment_id,
                        "dropping registry entry for missing segment file"
                    );
                }
                exists
            });
            Self::sort_segments(segments);
        }
        map.retain(|_, segments| !segments.is_empty());

        let total: usize = map.values().map(Vec::len).sum();
        info!(tables = map.len(), segments = total, "segment registry loaded");
        *self.inner.write().expect("registry lock poisoned") = map;
        Ok(())
    }

    fn sort_segments(segments: &mut [SstableMetadata]) {
        segments.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.segment_id.cmp(&b.segment_id))
        });
    }

    fn persist_locked(
        &self,
        map: &HashMap<String, Vec<SstableMetadata>>,
    ) -> Result<(), RegistryError> {
        fs::create_dir_all(&self.base_path)?;
        let body = serde_json::to_vec_pretty(map)?;
        let temp = self.base_path.join(format!("{REGISTRY_FILE}.tmp"));
        {
            let mut file = File::create(&temp)?;
            file.write_all(&body)?;
            file.sync_all()?;
        }
        fs::rename(&temp, self.registry_path())?;
        Ok(())
    }

    /// Adds a segment and persists the registry before returning.
    pub fn register(&self, meta: SstableMetadata) -> Result<(), RegistryError> {
        let mut map = self.inner.write().expect("registry lock poisoned");
        let segments = map.entry(meta.table_name.clone()).or_default();
        segments.push(meta);
        Self::sort_segments(segments);
        self.persist_locked(&map)
    }

    /// Removes segments by id and persists the registry before returning.
    pub fn unregister(&self, table: &str, segment_ids: &[String]) -> Result<(), RegistryError> {
        let mut map = self.inner.write().expect("registry lock poisoned");
        if let Some(segments) = map.get_mut(table) {
            segments.retain(|meta| !segment_ids.contains(&meta.segment_id));
            if segments.is_empty() {
                map.remove(table);
            }
        }
        self.persist_locked(&map)
    }

    /// Removes every segment of a table and persists.
    pub fn unregister_table(&self, table: &str) -> Result<Vec<SstableMetadata>, RegistryError> {
        let mut map = self.inner.write().expect("registry lock poisoned");
        let removed = map.remove(table).unwrap_or_default();
        self.persist_locked(&map)?;
        Ok(removed)
    }

    /// Segment metadata for a table, creation-time sorted (oldest first).
    pub fn get_sstables(&self, table: &str) -> Vec<SstableMetadata> {
        self.inner
            .read()
            .expect("registry lock poisoned")
            .get(table)
            .cloned()
            .unwrap_or_default()
    }

    /// All tables with at least one registered segment.
    pub fn tables(&self) -> Vec<String> {
        self.inner
            .read()
            .expect("registry lock poisoned")
            .keys()
            .cloned()
            .collect()
    }

    /// Total registered segment count.
    pub fn segment_count(&self) -> usize {
        self.inner
            .read()
            .expect("registry lock poisoned")
            .values()
            .map(Vec::len)
            .sum()
    }
}
