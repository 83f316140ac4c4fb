//! Cluster bootstrap: empty -> prepare -> stable

mod common;

use std::time::Duration;

use common::TestCluster;
use metasrv::metadata::{ClusterState, TopologyType};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_static_cluster_bootstrap() {
    let _ = tracing_subscriber::fmt().try_init();
    let cluster = TestCluster::start(TopologyType::Static, 8, 2).await;

    // First node alone does not reach the required node count.
    cluster.heartbeat("n1", &[]).await;
    assert_eq!(cluster.cluster_state().await, ClusterState::Empty);

    // Second heartbeat completes the count, the cluster starts preparing.
    cluster.heartbeat("n2", &[]).await;
    assert_eq!(cluster.cluster_state().await, ClusterState::Prepare);

    // One scheduling round assigns every shard across the two nodes.
    let runtime = cluster.runtime().await;
    runtime.scheduler_manager().run_once().await;

    let assigned = cluster.wait_for_assignments(8, Duration::from_secs(5)).await;
    assert!(assigned, "all 8 shards should get a node binding");

    let assignments = cluster.assignments().await;
    assert_eq!(assignments.len(), 2, "both nodes should host shards");
    let total: usize = assignments.values().map(|s| s.len()).sum();
    assert_eq!(total, 8);

    // Nodes report their shards ready, the next round promotes the
    // cluster to stable.
    for (node, shards) in &assignments {
        cluster.heartbeat(node, shards).await;
    }
    runtime.scheduler_manager().run_once().await;
    assert_eq!(cluster.cluster_state().await, ClusterState::Stable);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_scheduler_emits_nothing_while_empty() {
    let cluster = TestCluster::start(TopologyType::Static, 4, 2).await;
    let runtime = cluster.runtime().await;

    runtime.scheduler_manager().run_once().await;

    let snapshot = runtime.metadata().get_cluster_snapshot().await;
    assert_eq!(snapshot.topology.cluster_view.state, ClusterState::Empty);
    assert!(snapshot.topology.cluster_view.shard_nodes.is_empty());
    assert!(cluster.dispatch.calls.lock().is_empty());
}
