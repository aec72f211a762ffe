use tempfile::TempDir;

use crate::schema::Value;

use super::super::Engine;
use super::helpers::{lsm_config, row, small_memtable_config, standard_schema};

#[tokio::test]
async fn test_committed_transaction_survives_crash() {
    let tmp = TempDir::new().unwrap();

    // First lifetime: commit and then "crash" (drop without close, so the
    // memtable never flushes).
    {
        let engine = Engine::open(lsm_config(tmp.path())).await.unwrap();
        engine.create_table(standard_schema(), false).await.unwrap();

        let txn = engine.begin().await;
        engine.insert("t", row("x", 1), Some(&txn)).await.unwrap();
        engine.commit(&txn).await.unwrap();
        // No close: in-memory state is dropped on the floor.
    }

    let engine = Engine::open(lsm_config(tmp.path())).await.unwrap();
    engine.create_table(standard_schema(), true).await.unwrap();

    let query = engine.query("t").where_eq("name", Value::Str("x".into()));
    let rows = engine.select(&query).await.unwrap();
    assert_eq!(rows.len(), 1, "committed row must survive the crash");

    engine.close().await.unwrap();
}

#[tokio::test]
async fn test_aborted_transaction_leaves_no_trace() {
    let tmp = TempDir::new().unwrap();
    {
        let engine = Engine::open(lsm_config(tmp.path())).await.unwrap();
        engine.create_table(standard_schema(), false).await.unwrap();

        let txn = engine.begin().await;
        engine.insert("t", row("y", 1), Some(&txn)).await.unwrap();
        engine.rollback(&txn).await.unwrap();

        // Nothing visible before the restart either.
        let query = engine.query("t").where_eq("name", Value::Str("y".into()));
        assert!(engine.select(&query).await.unwrap().is_empty());
    }

    let engine = Engine::open(lsm_config(tmp.path())).await.unwrap();
    engine.create_table(standard_schema(), true).await.unwrap();
    let query = engine.query("t").where_eq("name", Value::Str("y".into()));
    assert!(engine.select(&query).await.unwrap().is_empty());
    engine.close().await.unwrap();
}

#[tokio::test]
async fn test_pending_transaction_is_treated_as_aborted() {
    let tmp = TempDir::new().unwrap();
    {
        let engine = Engine::open(lsm_config(tmp.path())).await.unwrap();
        engine.create_table(standard_schema(), false).await.unwrap();

        let txn = engine.begin().await;
        engine.insert("t", row("z", 1), Some(&txn)).await.unwrap();
        // Crash mid-transaction: neither COMMIT nor ABORT hits the WAL.
    }

    let engine = Engine::open(lsm_config(tmp.path())).await.unwrap();
    engine.create_table(standard_schema(), true).await.unwrap();
    let query = engine.query("t").where_eq("name", Value::Str("z".into()));
    assert!(engine.select(&query).await.unwrap().is_empty());
    engine.close().await.unwrap();
}

#[tokio::test]
async fn test_replay_is_idempotent_for_explicit_row_ids() {
    let tmp = TempDir::new().unwrap();
    {
        let engine = Engine::open(lsm_config(tmp.path())).await.unwrap();
        engine.create_table(standard_schema(), false).await.unwrap();
        let txn = engine.begin().await;
        engine.insert("t", row("once", 5), Some(&txn)).await.unwrap();
        engine.commit(&txn).await.unwrap();
    }

    // Two recoveries over the same WAL: the row must appear exactly once.
    for _ in 0..2 {
        let engine = Engine::open(lsm_config(tmp.path())).await.unwrap();
        engine.create_table(standard_schema(), true).await.unwrap();
        let rows = engine
            .select(&engine.query("t").where_eq("name", Value::Str("once".into())))
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        // A clean close flushes, so the next lifetime reads from segments
        // AND replays the WAL on top.
        engine.close().await.unwrap();
    }
}

#[tokio::test]
async fn test_flushed_segments_survive_restart() {
    let tmp = TempDir::new().unwrap();
    {
        let engine = Engine::open(small_memtable_config(tmp.path())).await.unwrap();
        engine.create_table(standard_schema(), false).await.unwrap();
        for i in 0..5 {
            engine
                .insert("t", row(&format!("r{i}"), i), None)
                .await
                .unwrap();
        }
        engine.close().await.unwrap();
    }

    let engine = Engine::open(small_memtable_config(tmp.path())).await.unwrap();
    engine.create_table(standard_schema(), true).await.unwrap();
    assert_eq!(engine.count("t", None).await.unwrap(), 5);

    // Auto-increment resumes past persisted values instead of reissuing.
    engine.insert("t", row("r5", 5), None).await.unwrap();
    let newest = engine
        .find_one("t", "name", &Value::Str("r5".into()))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(newest["id"], Value::Int64(6));

    engine.close().await.unwrap();
}

#[tokio::test]
async fn test_deletes_survive_restart() {
    let tmp = TempDir::new().unwrap();
    {
        let engine = Engine::open(small_memtable_config(tmp.path())).await.unwrap();
        engine.create_table(standard_schema(), false).await.unwrap();
        for i in 0..4 {
            engine
                .insert("t", row(&format!("r{i}"), i), None)
                .await
                .unwrap();
        }
        // Flush rows into segments first, then delete one; the tombstone
        // must shadow the flushed row after restart.
        engine.flush_all().await.unwrap();
        let victim = engine
            .find_one("t", "name", &Value::Str("r1".into()))
            .await
            .unwrap()
            .unwrap();
        let victim_id = victim["id"].as_i64().unwrap() as u64 - 1;
        engine.delete("t", victim_id, None).await.unwrap();
        engine.close().await.unwrap();
    }

    let engine = Engine::open(small_memtable_config(tmp.path())).await.unwrap();
    engine.create_table(standard_schema(), true).await.unwrap();
    assert_eq!(engine.count("t", None).await.unwrap(), 3);
    assert!(
        engine
            .find_one("t", "name", &Value::Str("r1".into()))
            .await
            .unwrap()
            .is_none()
    );
    engine.close().await.unwrap();
}
