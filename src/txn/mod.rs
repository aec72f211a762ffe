//! # Transaction Module
//!
//! Transaction lifecycle on top of the write-ahead log: begin, buffer
//! operations, commit or abort, and crash recovery by WAL replay.
//!
//! ## Design Invariants
//!
//! - Every operation is appended (and fsynced) to the WAL *before* it is
//!   buffered into the transaction.
//! - A commit is acknowledged only after its COMMIT record is durably on
//!   disk; if that write fails the transaction is aborted and the error
//!   surfaces to the caller.
//! - Operations against a committed or aborted transaction fail with
//!   [`TxnError::IllegalState`].
//!
//! ## Recovery
//!
//! [`TransactionManager::recover`] replays all WAL files, groups records by
//! transaction id, and classifies each transaction as `Committed`, `Aborted`,
//! or `Pending` (crashed mid-flight). Policy for `Pending` is the caller's;
//! the engine treats them as aborted.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests;

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::schema::now_millis;
use crate::wal::{OpType, Wal, WalError, WalRecord};

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by transaction operations.
#[derive(Debug, Error)]
pub enum TxnError {
    /// Unknown transaction id.
    #[error("Transaction {0} not found")]
    NotFound(String),

    /// Operation attempted on a committed/aborted transaction.
    #[error("Transaction {id} is {state:?}")]
    IllegalState { id: String, state: TransactionState },

    /// Underlying WAL failure.
    #[error("WAL error: {0}")]
    Wal(#[from] WalError),

    /// Background task failure.
    #[error("Internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Types
// ------------------------------------------------------------------------------------------------

/// Lifecycle state of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Active,
    Committed,
    Aborted,
    /// Found in the WAL with neither COMMIT nor ABORT — crashed mid-flight.
    Pending,
}

/// One buffered row mutation inside a transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct Operation {
    pub op_type: OpType,
    pub table: String,
    pub row_id: Option<u64>,
    /// Row payload as its JSON wire form.
    pub data: serde_json::Value,
    pub timestamp: u64,
}

impl Operation {
    pub fn new(op_type: OpType, table: impl Into<String>, row_id: Option<u64>, data: serde_json::Value) -> Self {
        Self {
            op_type,
            table: table.into(),
            row_id,
            data,
            timestamp: now_millis(),
        }
    }
}

/// A transaction and its buffered operations.
#[derive(Debug, Clone)]
pub struct Transaction {
    pub id: String,
    pub state: TransactionState,
    pub operations: Vec<Operation>,
    pub started_at: u64,
    pub committed_at: Option<u64>,
}

/// Callback fired after a commit or abort record is durable.
pub type TxnCallback =
    Arc<dyn Fn(Transaction) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Outcome of [`TransactionManager::recover`].
#[derive(Debug, Default)]
pub struct RecoveryReport {
    pub committed: Vec<Transaction>,
    pub aborted: Vec<Transaction>,
    pub pending: Vec<Transaction>,
}

// ------------------------------------------------------------------------------------------------
// TransactionManager
// ------------------------------------------------------------------------------------------------

/// Owns active transactions and the WAL they are logged to.
pub struct TransactionManager {
    wal: Arc<Wal>,
    transactions: Mutex<HashMap<String, Transaction>>,
    commit_callbacks: std::sync::RwLock<Vec<TxnCallback>>,
    abort_callbacks: std::sync::RwLock<Vec<TxnCallback>>,
}

impl TransactionManager {
    pub fn new(wal: Arc<Wal>) -> Self {
        Self {
            wal,
            transactions: Mutex::new(HashMap::new()),
            commit_callbacks: std::sync::RwLock::new(Vec::new()),
            abort_callbacks: std::sync::RwLock::new(Vec::new()),
        }
    }

    pub fn wal(&self) -> &Arc<Wal> {
        &self.wal
    }

    /// Registers a callback fired after every durable commit.
    pub fn on_commit(&self, callback: TxnCallback) {
        self.commit_callbacks
            .write()
            .expect("callback lock poisoned")
            .push(callback);
    }

    /// Registers a callback fired after every durable abort.
    pub fn on_abort(&self, callback: TxnCallback) {
        self.abort_callbacks
            .write()
            .expect("callback lock poisoned")
            .push(callback);
    }

    async fn append_record(&self, record: WalRecord) -> Result<(), TxnError> {
        let wal = Arc::clone(&self.wal);
        tokio::task::spawn_blocking(move || wal.append(&record))
            .await
            .map_err(|err| TxnError::Internal(format!("WAL append task failed: {err}")))??;
        Ok(())
    }

    /// Starts a transaction and returns its id.
    pub async fn begin(&self) -> String {
        let id = Uuid::new_v4().to_string();
        let txn = Transaction {
            id: id.clone(),
            state: TransactionState::Active,
            operations: Vec::new(),
            started_at: now_millis(),
            committed_at: None,
        };
        self.transactions.lock().await.insert(id.clone(), txn);
        info!(txn_id = %id, "transaction begun");
        id
    }

    /// Logs an operation to the WAL, then buffers it into the transaction.
    pub async fn add_operation(&self, txn_id: &str, operation: Operation) -> Result<(), TxnError> {
        {
            let transactions = self.transactions.lock().await;
            let txn = transactions
                .get(txn_id)
                .ok_or_else(|| TxnError::NotFound(txn_id.to_string()))?;
            if txn.state != TransactionState::Active {
                return Err(TxnError::IllegalState {
                    id: txn_id.to_string(),
                    state: txn.state,
                });
            }
        }

        self.append_record(WalRecord::Operation {
            txn_id: txn_id.to_string(),
            op_type: operation.op_type,
            table: operation.table.clone(),
            row_id: operation.row_id,
            data: operation.data.clone(),
            timestamp: operation.timestamp,
        })
        .await?;

        let mut transactions = self.transactions.lock().await;
        let txn = transactions
            .get_mut(txn_id)
            .ok_or_else(|| TxnError::NotFound(txn_id.to_string()))?;
        txn.operations.push(operation);
        Ok(())
    }

    /// Durably commits the transaction and fires commit callbacks.
    ///
    /// A failed COMMIT fsync aborts the transaction and surfaces the error:
    /// success must never be reported for a commit record that did not reach
    /// disk.
    pub async fn commit(&self, txn_id: &str) -> Result<(), TxnError> {
        {
            let transactions = self.transactions.lock().await;
            let txn = transactions
                .get(txn_id)
                .ok_or_else(|| TxnError::NotFound(txn_id.to_string()))?;
            if txn.state != TransactionState::Active {
                return Err(TxnError::IllegalState {
                    id: txn_id.to_string(),
                    state: txn.state,
                });
            }
        }

        if let Err(err) = self
            .append_record(WalRecord::Commit {
                txn_id: txn_id.to_string(),
                timestamp: now_millis(),
            })
            .await
        {
            warn!(txn_id, "commit record failed to reach disk, aborting: {err}");
            let mut transactions = self.transactions.lock().await;
            if let Some(txn) = transactions.get_mut(txn_id) {
                txn.state = TransactionState::Aborted;
            }
            return Err(err);
        }

        let committed = {
            let mut transactions = self.transactions.lock().await;
            let txn = transactions
                .get_mut(txn_id)
                .ok_or_else(|| TxnError::NotFound(txn_id.to_string()))?;
            txn.state = TransactionState::Committed;
            txn.committed_at = Some(now_millis());
            txn.clone()
        };

        info!(txn_id, ops = committed.operations.len(), "transaction committed");
        let callbacks = self
            .commit_callbacks
            .read()
            .expect("callback lock poisoned")
            .clone();
        for callback in callbacks {
            callback(committed.clone()).await;
        }
        Ok(())
    }

    /// Durably aborts the transaction and fires abort callbacks.
    pub async fn abort(&self, txn_id: &str) -> Result<(), TxnError> {
        {
            let transactions = self.transactions.lock().await;
            let txn = transactions
                .get(txn_id)
                .ok_or_else(|| TxnError::NotFound(txn_id.to_string()))?;
            if txn.state != TransactionState::Active {
                return Err(TxnError::IllegalState {
                    id: txn_id.to_string(),
                    state: txn.state,
                });
            }
        }

        self.append_record(WalRecord::Abort {
            txn_id: txn_id.to_string(),
            timestamp: now_millis(),
        })
        .await?;

        let aborted = {
            let mut transactions = self.transactions.lock().await;
            let txn = transactions
                .get_mut(txn_id)
                .ok_or_else(|| TxnError::NotFound(txn_id.to_string()))?;
            txn.state = TransactionState::Aborted;
            txn.clone()
        };

        info!(txn_id, "transaction aborted");
        let callbacks = self
            .abort_callbacks
            .read()
            .expect("callback lock poisoned")
            .clone();
        for callback in callbacks {
            callback(aborted.clone()).await;
        }
        Ok(())
    }

    /// Replays the WAL and classifies every transaction found there.
    pub async fn recover(&self) -> Result<RecoveryReport, TxnError> {
        let wal = Arc::clone(&self.wal);
        let records = tokio::task::spawn_blocking(move || wal.replay())
            .await
            .map_err(|err| TxnError::Internal(format!("WAL replay task failed: {err}")))??;

        let mut grouped: HashMap<String, (Vec<Operation>, Option<TransactionState>, u64)> =
            HashMap::new();
        for record in records {
            match record {
                WalRecord::Operation {
                    txn_id,
                    op_type,
                    table,
                    row_id,
                    data,
                    timestamp,
                } => {
                    let slot = grouped.entry(txn_id).or_insert((Vec::new(), None, timestamp));
                    slot.0.push(Operation {
                        op_type,
                        table,
                        row_id,
                        data,
                        timestamp,
                    });
                }
                WalRecord::Commit { txn_id, timestamp } => {
                    let slot = grouped.entry(txn_id).or_insert((Vec::new(), None, timestamp));
                    slot.1 = Some(TransactionState::Committed);
                }
                WalRecord::Abort { txn_id, timestamp } => {
                    let slot = grouped.entry(txn_id).or_insert((Vec::new(), None, timestamp));
                    slot.1 = Some(TransactionState::Aborted);
                }
            }
        }

        let mut report = RecoveryReport::default();
        for (id, (operations, outcome, started_at)) in grouped {
            let state = outcome.unwrap_or(TransactionState::Pending);
            let txn = Transaction {
                id,
                state,
                operations,
                started_at,
                committed_at: None,
            };
            match state {
                TransactionState::Committed => report.committed.push(txn),
                TransactionState::Aborted => report.aborted.push(txn),
                _ => {
                    warn!(txn_id = %txn.id, "transaction found pending after crash");
                    report.pending.push(txn);
                }
            }
        }

        // Deterministic replay order for committed work.
        report
            .committed
            .sort_by(|a, b| a.started_at.cmp(&b.started_at).then(a.id.cmp(&b.id)));
        info!(
            committed = report.committed.len(),
            aborted = report.aborted.len(),
            pending = report.pending.len(),
            "WAL recovery classified transactions"
        );
        Ok(report)
    }

    pub async fn get_transaction(&self, txn_id: &str) -> Option<Transaction> {
        self.transactions.lock().await.get(txn_id).cloned()
    }

    pub async fn active_transactions(&self) -> Vec<Transaction> {
        self.transactions
            .lock()
            .await
            .values()
            .filter(|txn| txn.state == TransactionState::Active)
            .cloned()
            .collect()
    }

    /// Removes WAL files older than `max_age_ms`.
    pub async fn cleanup(&self, max_age_ms: u64) -> Result<usize, TxnError> {
        let wal = Arc::clone(&self.wal);
        let removed = tokio::task::spawn_blocking(move || wal.cleanup(max_age_ms))
            .await
            .map_err(|err| TxnError::Internal(format!("WAL cleanup task failed: {err}")))??;
        Ok(removed)
    }
}
