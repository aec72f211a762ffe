use std::sync::Arc;
use std::time::Duration;

use super::super::manager::{ClusterManager, MergeStrategy};
use super::super::proto::NodeInfo;
use super::helpers::{json_row, spawn_stub_peer};
use crate::schema::{Row, Value};

fn local_node() -> NodeInfo {
    let mut node = NodeInfo::new("local", "127.0.0.1", 0);
    node.cluster_id = Some("local".to_string());
    node
}

fn manager() -> Arc<ClusterManager> {
    ClusterManager::new(local_node(), 150, 1.0, Duration::from_secs(60), 10_000)
}

fn ids(rows: &[Row]) -> Vec<i64> {
    let mut out: Vec<i64> = rows
        .iter()
        .filter_map(|row| row.get("id").and_then(Value::as_i64))
        .collect();
    out.sort_unstable();
    out
}

#[tokio::test]
async fn test_union_merges_and_dedupes_across_clusters() {
    let manager = manager();

    // Three clusters, two peers each; rows 1 and 2 are duplicated across
    // clusters, six ids are distinct in total.
    let mut servers = Vec::new();
    for (cluster, rows) in [
        ("x", vec![json_row(1, "a"), json_row(2, "b")]),
        ("y", vec![json_row(3, "c"), json_row(4, "d"), json_row(1, "a")]),
        ("z", vec![json_row(5, "e"), json_row(6, "f"), json_row(2, "b")]),
    ] {
        for replica in 0..2 {
            let (server, node) = spawn_stub_peer(
                &format!("{cluster}-{replica}"),
                cluster,
                rows.clone(),
                Duration::ZERO,
            )
            .await;
            manager.registry().add_peer(node).await;
            servers.push(server);
        }
    }

    let report = manager
        .fan_out_query(
            "t",
            serde_json::json!({}),
            || async { Vec::new() },
            MergeStrategy::Union,
            Duration::from_secs(1),
        )
        .await
        .unwrap();

    assert_eq!(ids(&report.rows), vec![1, 2, 3, 4, 5, 6]);
    // Local plus one pick per cluster responded.
    assert_eq!(report.responded_clusters.len(), 4);
    assert!(report.failed_clusters.is_empty());
    assert_eq!(report.cluster_times_ms.len(), 4);

    for server in &servers {
        server.stop().await;
    }
}

#[tokio::test]
async fn test_first_positive_returns_one_cluster() {
    let manager = manager();

    let (server_a, node_a) = spawn_stub_peer(
        "a-0",
        "a",
        vec![json_row(1, "a"), json_row(2, "b")],
        Duration::ZERO,
    )
    .await;
    let (server_b, node_b) = spawn_stub_peer(
        "b-0",
        "b",
        vec![json_row(3, "c"), json_row(4, "d")],
        Duration::ZERO,
    )
    .await;
    manager.registry().add_peer(node_a).await;
    manager.registry().add_peer(node_b).await;

    let rows = manager
        .fan_out_read(
            "t",
            serde_json::json!({}),
            || async { Vec::new() },
            MergeStrategy::FirstPositive,
            Duration::from_secs(1),
        )
        .await
        .unwrap();

    // Exactly one peer's non-empty response, never a union of both.
    let got = ids(&rows);
    assert!(
        got == vec![1, 2] || got == vec![3, 4],
        "unexpected first_positive rows: {got:?}"
    );

    server_a.stop().await;
    server_b.stop().await;
}

#[tokio::test]
async fn test_fastest_wins_over_delayed_peer() {
    let manager = manager();

    let (fast_server, fast_node) =
        spawn_stub_peer("fast-0", "fast", vec![json_row(7, "quick")], Duration::ZERO).await;
    let (slow_server, slow_node) = spawn_stub_peer(
        "slow-0",
        "slow",
        vec![json_row(8, "late")],
        Duration::from_secs(2),
    )
    .await;
    manager.registry().add_peer(fast_node).await;
    manager.registry().add_peer(slow_node).await;

    let started = std::time::Instant::now();
    let rows = manager
        .fan_out_read(
            "t",
            serde_json::json!({}),
            || async {
                // The local node is slow too, so the fast peer must win.
                tokio::time::sleep(Duration::from_secs(1)).await;
                Vec::new()
            },
            MergeStrategy::Fastest,
            Duration::from_secs(5),
        )
        .await
        .unwrap();

    assert_eq!(ids(&rows), vec![7]);
    assert!(
        started.elapsed() < Duration::from_secs(1),
        "fastest strategy waited for a slow participant"
    );

    fast_server.stop().await;
    slow_server.stop().await;
}

#[tokio::test]
async fn test_timed_out_peer_contributes_empty() {
    let manager = manager();

    let (fast_server, fast_node) =
        spawn_stub_peer("fast-0", "fast", vec![json_row(1, "a")], Duration::ZERO).await;
    let (slow_server, slow_node) = spawn_stub_peer(
        "slow-0",
        "slow",
        vec![json_row(9, "never")],
        Duration::from_secs(3),
    )
    .await;
    manager.registry().add_peer(fast_node).await;
    manager.registry().add_peer(slow_node).await;

    let report = manager
        .fan_out_query(
            "t",
            serde_json::json!({}),
            || async { Vec::new() },
            MergeStrategy::Union,
            Duration::from_millis(300),
        )
        .await
        .unwrap();

    assert_eq!(ids(&report.rows), vec![1], "slow peer must contribute empty");

    fast_server.stop().await;
    slow_server.stop().await;
}

#[tokio::test]
async fn test_unhealthy_peers_are_not_picked() {
    use super::super::proto::NodeState;

    let manager = manager();

    // The peer is reachable but not Active, so the health filter skips it.
    let (server, mut node) =
        spawn_stub_peer("stale-0", "stale", vec![json_row(1, "x")], Duration::ZERO).await;
    node.state = NodeState::Suspect;
    manager.registry().add_peer(node).await;

    let rows = manager
        .fan_out_read(
            "t",
            serde_json::json!({}),
            || async { vec![[("id".to_string(), Value::Int64(42))].into_iter().collect()] },
            MergeStrategy::Union,
            Duration::from_secs(1),
        )
        .await
        .unwrap();

    assert_eq!(ids(&rows), vec![42], "only the local rows may appear");
    server.stop().await;
}
