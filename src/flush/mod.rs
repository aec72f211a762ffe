//! # Flush Service Module
//!
//! Background drain of immutable memtables into SSTable segments.
//!
//! ## Design Overview
//!
//! The service owns a FIFO queue. Each queued item pairs an immutable
//! memtable with the segment writer for its table. A single long-running
//! task drains the queue:
//!
//! 1. transition the memtable `Immutable → Flushing`,
//! 2. write the segment on the blocking pool,
//! 3. fire the registered completion callback (the engine registers the
//!    segment and releases the memtable there),
//! 4. transition to `Flushed`.
//!
//! On a write failure the memtable is rolled back to `Immutable` and
//! re-queued after a short delay, so flushes are retried until shutdown.
//! [`FlushService::flush_immediately`] bypasses the queue for shutdown paths.

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::memtable::MemTable;
use crate::sstable::{SstableError, SstableMetadata, SstableWriter};

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by flush operations.
#[derive(Debug, Error)]
pub enum FlushError {
    /// Segment write failure.
    #[error("Segment write error: {0}")]
    Sstable(#[from] SstableError),

    /// Service is shut down; the queue no longer accepts work.
    #[error("Flush service is stopped")]
    Stopped,

    /// Background task failure.
    #[error("Internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Types
// ------------------------------------------------------------------------------------------------

/// Callback fired once a segment is durably written, before the memtable is
/// marked `Flushed`.
pub type FlushCallback =
    Arc<dyn Fn(SstableMetadata) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

struct FlushJob {
    memtable: Arc<MemTable>,
    writer: Arc<SstableWriter>,
}

// ------------------------------------------------------------------------------------------------
// FlushService
// ------------------------------------------------------------------------------------------------

/// FIFO background flusher of immutable memtables.
pub struct FlushService {
    tx: mpsc::UnboundedSender<FlushJob>,
    handle: Mutex<Option<JoinHandle<()>>>,
    pending: Arc<AtomicUsize>,
    on_complete: FlushCallback,
}

impl FlushService {
    /// Starts the drain task. `on_complete` runs for every written segment.
    pub fn start(on_complete: FlushCallback) -> Self {
        let (tx, rx) = mpsc::unbounded_channel::<FlushJob>();
        let pending = Arc::new(AtomicUsize::new(0));
        let handle = tokio::spawn(Self::run(
            rx,
            tx.clone(),
            Arc::clone(&pending),
            Arc::clone(&on_complete),
        ));
        Self {
            tx,
            handle: Mutex::new(Some(handle)),
            pending,
            on_complete,
        }
    }

    async fn run(
        mut rx: mpsc::UnboundedReceiver<FlushJob>,
        retry_tx: mpsc::UnboundedSender<FlushJob>,
        pending: Arc<AtomicUsize>,
        on_complete: FlushCallback,
    ) {
        while let Some(job) = rx.recv().await {
            pending.fetch_sub(1, Ordering::SeqCst);
            match Self::flush_one(&job.memtable, &job.writer, &on_complete).await {
                Ok(_) => {}
                Err(err) => {
                    error!(
                        table = %job.memtable.table_name(),
                        "flush failed, memtable rolled back for retry: {err}"
                    );
                    job.memtable.revert_to_immutable();
                    tokio::time::sleep(Duration::from_millis(500)).await;
                    pending.fetch_add(1, Ordering::SeqCst);
                    if retry_tx.send(job).is_err() {
                        warn!("flush service stopping with a failed memtable still immutable");
                        break;
                    }
                }
            }
        }
    }

    async fn flush_one(
        memtable: &Arc<MemTable>,
        writer: &Arc<SstableWriter>,
        on_complete: &FlushCallback,
    ) -> Result<Option<SstableMetadata>, FlushError> {
        if let Err(err) = memtable.mark_flushing() {
            // Already flushed or never made immutable; nothing to do.
            warn!("skipping flush job: {err}");
            return Ok(None);
        }

        let entries = memtable.entries_for_flush();
        let writer = Arc::clone(writer);
        let written = tokio::task::spawn_blocking(move || writer.write(entries, 0))
            .await
            .map_err(|err| FlushError::Internal(format!("flush task failed: {err}")))?;

        match written {
            Ok(Some(meta)) => {
                on_complete(meta.clone()).await;
                memtable.mark_flushed();
                info!(
                    table = %meta.table_name,
                    segment = %meta.segment_id,
                    entries = meta.entry_count,
                    "memtable flushed"
                );
                Ok(Some(meta))
            }
            Ok(None) => {
                memtable.mark_flushed();
                Ok(None)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Enqueues an immutable memtable for background flushing.
    pub fn enqueue(
        &self,
        memtable: Arc<MemTable>,
        writer: Arc<SstableWriter>,
    ) -> Result<(), FlushError> {
        self.pending.fetch_add(1, Ordering::SeqCst);
        self.tx
            .send(FlushJob { memtable, writer })
            .map_err(|_| {
                self.pending.fetch_sub(1, Ordering::SeqCst);
                FlushError::Stopped
            })
    }

    /// Flushes one memtable inline, bypassing the queue. Used at shutdown.
    pub async fn flush_immediately(
        &self,
        memtable: Arc<MemTable>,
        writer: Arc<SstableWriter>,
    ) -> Result<Option<SstableMetadata>, FlushError> {
        Self::flush_one(&memtable, &writer, &self.on_complete).await
    }

    /// Number of queued, not-yet-processed memtables.
    pub fn pending_count(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Waits for the queue to drain, then stops the task.
    pub async fn stop(&self) {
        // Give queued jobs a chance to finish before closing the channel.
        for _ in 0..100 {
            if self.pending_count() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        if let Some(handle) = self.handle.lock().await.take() {
            handle.abort();
            let _ = handle.await;
        }
        info!("flush service stopped");
    }
}
