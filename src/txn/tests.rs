use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tempfile::TempDir;

use super::*;

fn manager(dir: &TempDir) -> TransactionManager {
    TransactionManager::new(Arc::new(Wal::open(dir.path()).unwrap()))
}

fn insert_op(row_id: u64, name: &str) -> Operation {
    Operation::new(
        OpType::Insert,
        "t",
        Some(row_id),
        serde_json::json!({ "name": name }),
    )
}

#[tokio::test]
async fn test_commit_flow_and_callbacks() {
    let tmp = TempDir::new().unwrap();
    let manager = manager(&tmp);

    let fired = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&fired);
    manager.on_commit(Arc::new(move |txn| {
        let counter = Arc::clone(&counter);
        Box::pin(async move {
            assert_eq!(txn.operations.len(), 2);
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }));

    let txn_id = manager.begin().await;
    manager.add_operation(&txn_id, insert_op(1, "a")).await.unwrap();
    manager.add_operation(&txn_id, insert_op(2, "b")).await.unwrap();
    manager.commit(&txn_id).await.unwrap();

    assert_eq!(fired.load(Ordering::SeqCst), 1);
    let txn = manager.get_transaction(&txn_id).await.unwrap();
    assert_eq!(txn.state, TransactionState::Committed);
    assert!(txn.committed_at.is_some());
}

#[tokio::test]
async fn test_operations_rejected_after_commit() {
    let tmp = TempDir::new().unwrap();
    let manager = manager(&tmp);

    let txn_id = manager.begin().await;
    manager.commit(&txn_id).await.unwrap();

    assert!(matches!(
        manager.add_operation(&txn_id, insert_op(1, "late")).await,
        Err(TxnError::IllegalState { .. })
    ));
    assert!(matches!(
        manager.commit(&txn_id).await,
        Err(TxnError::IllegalState { .. })
    ));
    assert!(matches!(
        manager.abort(&txn_id).await,
        Err(TxnError::IllegalState { .. })
    ));
}

#[tokio::test]
async fn test_unknown_transaction() {
    let tmp = TempDir::new().unwrap();
    let manager = manager(&tmp);
    assert!(matches!(
        manager.commit("nope").await,
        Err(TxnError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_abort_fires_abort_callbacks() {
    let tmp = TempDir::new().unwrap();
    let manager = manager(&tmp);

    let fired = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&fired);
    manager.on_abort(Arc::new(move |_| {
        let counter = Arc::clone(&counter);
        Box::pin(async move {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }));

    let txn_id = manager.begin().await;
    manager.add_operation(&txn_id, insert_op(1, "y")).await.unwrap();
    manager.abort(&txn_id).await.unwrap();

    assert_eq!(fired.load(Ordering::SeqCst), 1);
    let txn = manager.get_transaction(&txn_id).await.unwrap();
    assert_eq!(txn.state, TransactionState::Aborted);
}

#[tokio::test]
async fn test_recover_classifies_transactions() {
    let tmp = TempDir::new().unwrap();

    // First lifetime: one committed, one aborted, one left hanging.
    let (committed_id, aborted_id, pending_id) = {
        let manager = manager(&tmp);

        let committed = manager.begin().await;
        manager.add_operation(&committed, insert_op(1, "x")).await.unwrap();
        manager.commit(&committed).await.unwrap();

        let aborted = manager.begin().await;
        manager.add_operation(&aborted, insert_op(2, "y")).await.unwrap();
        manager.abort(&aborted).await.unwrap();

        let pending = manager.begin().await;
        manager.add_operation(&pending, insert_op(3, "z")).await.unwrap();
        // No commit/abort: simulates a crash mid-flight.
        (committed, aborted, pending)
    };

    // Second lifetime over the same directory.
    let manager = manager(&tmp);
    let report = manager.recover().await.unwrap();

    assert_eq!(report.committed.len(), 1);
    assert_eq!(report.committed[0].id, committed_id);
    assert_eq!(report.committed[0].operations.len(), 1);

    assert_eq!(report.aborted.len(), 1);
    assert_eq!(report.aborted[0].id, aborted_id);

    assert_eq!(report.pending.len(), 1);
    assert_eq!(report.pending[0].id, pending_id);
}

#[tokio::test]
async fn test_active_transactions_listing() {
    let tmp = TempDir::new().unwrap();
    let manager = manager(&tmp);

    let a = manager.begin().await;
    let b = manager.begin().await;
    manager.commit(&a).await.unwrap();

    let active = manager.active_transactions().await;
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].id, b);
}
