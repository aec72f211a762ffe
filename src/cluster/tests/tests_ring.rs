use super::super::proto::NodeInfo;
use super::super::ring::ConsistentHashRing;
use super::super::snowflake::synthesize;

fn node(id: &str) -> NodeInfo {
    NodeInfo::new(id, "10.0.0.1", 7400)
}

fn day_of_ids(count: u64) -> Vec<u64> {
    let base_ms = 1_700_000_000_000u64;
    (0..count)
        .map(|i| {
            synthesize(
                base_ms + (i * 8_640) % 86_400_000,
                (i % 32) as u16,
                (i % 4096) as u16,
            )
        })
        .collect()
}

#[tokio::test]
async fn test_owner_requires_nodes() {
    let ring = ConsistentHashRing::new(150);
    assert!(ring.owner(1234).await.is_none());
}

#[tokio::test]
async fn test_ownership_is_insertion_order_independent() {
    let ids = day_of_ids(10_000);

    let forward = ConsistentHashRing::new(150);
    forward.add_node(node("a"), 1.0).await;
    forward.add_node(node("b"), 1.0).await;
    forward.add_node(node("c"), 2.0).await;

    let backward = ConsistentHashRing::new(150);
    backward.add_node(node("c"), 2.0).await;
    backward.add_node(node("b"), 1.0).await;
    backward.add_node(node("a"), 1.0).await;

    for id in &ids {
        let lhs = forward.owner(*id).await.unwrap().node_id;
        let rhs = backward.owner(*id).await.unwrap().node_id;
        assert_eq!(lhs, rhs, "owner of {id} depends on insertion order");
    }
}

#[tokio::test]
async fn test_weighted_share() {
    let ring = ConsistentHashRing::new(150);
    ring.add_node(node("a"), 1.0).await;
    ring.add_node(node("b"), 1.0).await;
    ring.add_node(node("c"), 2.0).await;

    let stats = ring.stats().await;
    assert_eq!(stats.vnodes_per_node["a"], 150);
    assert_eq!(stats.vnodes_per_node["c"], 300);

    let ids = day_of_ids(10_000);
    let counts = ring.analyze_distribution(&ids).await;
    let c_share = counts.get("c").copied().unwrap_or(0) as f64 / ids.len() as f64;
    assert!(
        (0.45..=0.55).contains(&c_share),
        "double-weight node owns {:.1}% instead of ~50%",
        c_share * 100.0
    );
}

#[tokio::test]
async fn test_equal_weight_balance() {
    let ring = ConsistentHashRing::new(150);
    for id in ["a", "b", "c"] {
        ring.add_node(node(id), 1.0).await;
    }

    // One-hour window of snowflakes, the clustered case whitening fixes.
    let base_ms = 1_700_000_000_000u64;
    let ids: Vec<u64> = (0..10_000u64)
        .map(|i| synthesize(base_ms + (i * 360) % 3_600_000, 1, (i % 4096) as u16))
        .collect();

    let counts = ring.analyze_distribution(&ids).await;
    let expected = ids.len() as f64 / 3.0;
    for (node_id, count) in counts {
        let deviation = (count as f64 - expected).abs() / expected;
        assert!(
            deviation <= 0.25,
            "node {node_id} holds {count} ids, {:.1}% off uniform",
            deviation * 100.0
        );
    }
}

#[tokio::test]
async fn test_remove_node_moves_only_its_partitions() {
    let ring = ConsistentHashRing::new(150);
    for id in ["a", "b", "c"] {
        ring.add_node(node(id), 1.0).await;
    }
    let ids = day_of_ids(2_000);

    let mut before = Vec::with_capacity(ids.len());
    for id in &ids {
        before.push(ring.owner(*id).await.unwrap().node_id);
    }

    ring.remove_node("b").await;

    for (id, owner_before) in ids.iter().zip(before) {
        let owner_after = ring.owner(*id).await.unwrap().node_id;
        if owner_before != "b" {
            assert_eq!(owner_before, owner_after, "partition {id} moved needlessly");
        } else {
            assert_ne!(owner_after, "b");
        }
    }
}

#[tokio::test]
async fn test_update_weight_rebuilds_points() {
    let ring = ConsistentHashRing::new(150);
    ring.add_node(node("a"), 1.0).await;
    ring.add_node(node("b"), 1.0).await;
    assert_eq!(ring.stats().await.point_count, 300);

    ring.update_weight("a", 0.5).await;
    let stats = ring.stats().await;
    assert_eq!(stats.vnodes_per_node["a"], 75);
    assert_eq!(stats.point_count, 225);
}

#[tokio::test]
async fn test_replicas_are_distinct_successors() {
    let ring = ConsistentHashRing::new(150);
    for id in ["a", "b", "c", "d"] {
        ring.add_node(node(id), 1.0).await;
    }

    for partition in day_of_ids(200) {
        let owner = ring.owner(partition).await.unwrap().node_id;
        let replicas = ring.replicas(partition, 2).await;
        assert_eq!(replicas.len(), 2);
        let mut seen = vec![owner];
        for replica in replicas {
            assert!(
                !seen.contains(&replica.node_id),
                "replica set repeats node {}",
                replica.node_id
            );
            seen.push(replica.node_id);
        }
    }
}
