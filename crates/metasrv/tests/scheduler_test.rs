//! Scheduler behavior against crafted snapshots

mod common;

use std::collections::HashMap;
use std::time::Duration;

use common::TestCluster;
use metasrv::error::ErrorCode;
use metasrv::metadata::{
    now_ms, ClusterState, ClusterView, Node, NodeState, NodeStats, RegisteredNode, ShardId,
    ShardInfo, ShardNode, ShardRole, ShardStatus, ShardView, Snapshot, Topology, TopologyType,
};
use metasrv::scheduler::{
    ConsistentHashNodePicker, RebalancedShardScheduler, ReopenShardScheduler, Scheduler,
    ShardAffinityRule,
};
use std::sync::Arc;

fn registered_node(name: &str, shard_infos: Vec<ShardInfo>, expired: bool) -> RegisteredNode {
    let last_touch_time = if expired { 0 } else { now_ms() };
    RegisteredNode::new(
        Node {
            name: name.to_string(),
            stats: NodeStats {
                lease: 10,
                zone: String::new(),
                node_version: String::new(),
            },
            last_touch_time,
            state: NodeState::Online,
        },
        shard_infos,
    )
}

fn snapshot(
    state: ClusterState,
    bindings: &[(ShardId, &str)],
    shard_ids: &[ShardId],
    nodes: Vec<RegisteredNode>,
) -> Snapshot {
    let mut shard_nodes: Vec<ShardNode> = bindings
        .iter()
        .map(|(shard_id, node)| ShardNode {
            shard_id: *shard_id,
            role: ShardRole::Leader,
            node_name: node.to_string(),
        })
        .collect();
    shard_nodes.sort_by_key(|n| n.shard_id);
    let shard_views: HashMap<ShardId, ShardView> = shard_ids
        .iter()
        .map(|shard_id| {
            (
                *shard_id,
                ShardView {
                    shard_id: *shard_id,
                    version: 1,
                    table_ids: vec![],
                },
            )
        })
        .collect();
    Snapshot {
        topology: Topology {
            cluster_view: ClusterView {
                cluster_id: 0,
                version: 1,
                state,
                shard_nodes,
            },
            shard_views,
        },
        registered_nodes: nodes,
    }
}

fn shard_report(shard_id: ShardId, status: ShardStatus) -> ShardInfo {
    ShardInfo {
        id: shard_id,
        role: ShardRole::Leader,
        version: 1,
        status,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_reopen_scheduler_skips_unstable_cluster() {
    let cluster = TestCluster::start(TopologyType::Static, 2, 1).await;
    let runtime = cluster.runtime().await;
    let scheduler = ReopenShardScheduler::new(runtime.procedure_factory().clone(), 4);

    let snapshot = snapshot(
        ClusterState::Prepare,
        &[(0, "n1")],
        &[0, 1],
        vec![registered_node(
            "n1",
            vec![shard_report(0, ShardStatus::PartialOpen)],
            false,
        )],
    );
    let result = scheduler.schedule(&snapshot).await.unwrap();
    assert!(result.procedure.is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_reopen_scheduler_ignores_ready_shards() {
    let cluster = TestCluster::start(TopologyType::Static, 2, 1).await;
    let runtime = cluster.runtime().await;
    let scheduler = ReopenShardScheduler::new(runtime.procedure_factory().clone(), 4);

    let ready = snapshot(
        ClusterState::Stable,
        &[(0, "n1")],
        &[0, 1],
        vec![registered_node(
            "n1",
            vec![shard_report(0, ShardStatus::Ready)],
            false,
        )],
    );
    let result = scheduler.schedule(&ready).await.unwrap();
    assert!(result.procedure.is_none());

    let partial = snapshot(
        ClusterState::Stable,
        &[(0, "n1"), (1, "n1")],
        &[0, 1],
        vec![registered_node(
            "n1",
            vec![
                shard_report(0, ShardStatus::Ready),
                shard_report(1, ShardStatus::PartialOpen),
            ],
            false,
        )],
    );
    let result = scheduler.schedule(&partial).await.unwrap();
    assert!(result.procedure.is_some(), "partial_open shard must reopen");
    assert!(result.reason.contains("shardID:1"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_expired_node_is_invisible_to_schedulers() {
    let cluster = TestCluster::start(TopologyType::Static, 2, 1).await;
    let runtime = cluster.runtime().await;
    let scheduler = ReopenShardScheduler::new(runtime.procedure_factory().clone(), 4);

    // The only node reporting a partial_open shard is expired.
    let snapshot = snapshot(
        ClusterState::Stable,
        &[(0, "n1")],
        &[0],
        vec![registered_node(
            "n1",
            vec![shard_report(0, ShardStatus::PartialOpen)],
            true,
        )],
    );
    let result = scheduler.schedule(&snapshot).await.unwrap();
    assert!(result.procedure.is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_rebalanced_scheduler_respects_disable() {
    let cluster = TestCluster::start(TopologyType::Dynamic, 2, 1).await;
    let runtime = cluster.runtime().await;
    let scheduler = RebalancedShardScheduler::new(
        runtime.procedure_factory().clone(),
        Arc::new(ConsistentHashNodePicker::default()),
        4,
        true,
    );

    // Shard 0 is pinned to n2 but bound to n1: a move must be emitted.
    scheduler
        .add_shard_affinity_rule(ShardAffinityRule {
            shard_id: 0,
            nodes: vec!["n2".to_string()],
            priority: 1,
        })
        .unwrap();
    let crafted = snapshot(
        ClusterState::Stable,
        &[(0, "n1")],
        &[0],
        vec![
            registered_node("n1", vec![], false),
            registered_node("n2", vec![], false),
        ],
    );
    let result = scheduler.schedule(&crafted).await.unwrap();
    assert!(result.procedure.is_some());
    assert!(result.reason.contains("to:n2"));

    // Disabled scheduling pauses emission entirely.
    scheduler.update_enable_schedule(false);
    let result = scheduler.schedule(&crafted).await.unwrap();
    assert!(result.procedure.is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_pinned_shard_stays_on_target() {
    let cluster = TestCluster::start(TopologyType::Dynamic, 2, 1).await;
    let runtime = cluster.runtime().await;
    let scheduler = RebalancedShardScheduler::new(
        runtime.procedure_factory().clone(),
        Arc::new(ConsistentHashNodePicker::default()),
        4,
        true,
    );
    scheduler
        .add_shard_affinity_rule(ShardAffinityRule {
            shard_id: 0,
            nodes: vec!["n1".to_string()],
            priority: 1,
        })
        .unwrap();

    // Already on its pinned node: nothing to do.
    let crafted = snapshot(
        ClusterState::Stable,
        &[(0, "n1")],
        &[0],
        vec![
            registered_node("n1", vec![], false),
            registered_node("n2", vec![], false),
        ],
    );
    let result = scheduler.schedule(&crafted).await.unwrap();
    assert!(result.procedure.is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_static_scheduler_rejects_affinity_rules() {
    let cluster = TestCluster::start(TopologyType::Static, 2, 1).await;
    let runtime = cluster.runtime().await;

    let err = runtime
        .scheduler_manager()
        .add_shard_affinity_rule(ShardAffinityRule {
            shard_id: 0,
            nodes: vec!["n1".to_string()],
            priority: 1,
        })
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::NotImplemented);

    let err = runtime
        .scheduler_manager()
        .update_enable_schedule(false)
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::PreconditionFailed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_conflicting_procedures_rejected() {
    let cluster = TestCluster::start(TopologyType::Static, 2, 2).await;
    let runtime = cluster.runtime().await;
    *cluster.dispatch.open_delay.lock() = Some(Duration::from_millis(300));

    let real = runtime.metadata().get_cluster_snapshot().await;

    let first = runtime
        .procedure_factory()
        .create_transfer_leader_procedure(metasrv::procedure::TransferLeaderRequest {
            snapshot: real.clone(),
            shard_id: 0,
            old_leader_node: None,
            new_leader_node: "n1".to_string(),
        })
        .await
        .unwrap();
    let second = runtime
        .procedure_factory()
        .create_transfer_leader_procedure(metasrv::procedure::TransferLeaderRequest {
            snapshot: real,
            shard_id: 0,
            old_leader_node: None,
            new_leader_node: "n2".to_string(),
        })
        .await
        .unwrap();

    runtime.procedure_manager().submit(first).await.unwrap();
    let err = runtime
        .procedure_manager()
        .submit(second)
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::AlreadyExists);
}
