//! DDL procedures end to end against a mock node dispatch

mod common;

use std::sync::atomic::Ordering;
use std::time::Duration;

use common::TestCluster;
use metasrv::error::ErrorCode;
use metasrv::metadata::{ClusterState, PartitionInfo, TopologyType};
use metasrv::procedure::{CreateTableRequest, DropTableRequest};
use tokio::sync::oneshot;

/// Drive the cluster through bootstrap into the stable state.
async fn stable_cluster(shard_total: u32, node_count: u32) -> TestCluster {
    let cluster = TestCluster::start(TopologyType::Static, shard_total, node_count).await;
    for i in 1..=node_count {
        cluster.heartbeat(&format!("n{}", i), &[]).await;
    }
    let runtime = cluster.runtime().await;
    runtime.scheduler_manager().run_once().await;
    let assigned = cluster
        .wait_for_assignments(shard_total as usize, Duration::from_secs(5))
        .await;
    assert!(assigned, "bootstrap assignment did not finish");
    for (node, shards) in cluster.assignments().await {
        cluster.heartbeat(&node, &shards).await;
    }
    runtime.scheduler_manager().run_once().await;
    assert_eq!(cluster.cluster_state().await, ClusterState::Stable);
    cluster
}

async fn submit_create_table(
    cluster: &TestCluster,
    schema: &str,
    name: &str,
    partition: Option<PartitionInfo>,
) -> metasrv::error::Result<metasrv::metadata::CreateTableResult> {
    let runtime = cluster.runtime().await;
    let (tx, rx) = oneshot::channel();
    let procedure = runtime
        .procedure_factory()
        .make_create_table_procedure(CreateTableRequest {
            schema_name: schema.to_string(),
            table_name: name.to_string(),
            partition_table_info: partition,
            done: Some(tx),
        })
        .await?;
    runtime.procedure_manager().submit(procedure).await?;
    tokio::time::timeout(Duration::from_secs(5), rx)
        .await
        .expect("create table timed out")
        .expect("callback dropped")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_create_table_happy_path() {
    let _ = tracing_subscriber::fmt().try_init();
    let cluster = stable_cluster(8, 2).await;

    let result = submit_create_table(&cluster, "public", "t1", None)
        .await
        .unwrap();

    // Least-loaded pick with the tie broken by shard ID lands on shard 0,
    // and the dispatch bumped its version by one.
    assert_eq!(result.shard_version_update.shard_id, 0);
    let runtime = cluster.runtime().await;
    let snapshot = runtime.metadata().get_cluster_snapshot().await;
    let view = &snapshot.topology.shard_views[&0];
    assert_eq!(view.version, result.shard_version_update.latest_version);
    assert!(view.table_ids.contains(&result.table.id));

    let table = runtime
        .metadata()
        .get_table("public", "t1")
        .await
        .unwrap()
        .expect("table metadata must exist");
    assert_eq!(table.id, result.table.id);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_duplicate_create_rejected() {
    let cluster = stable_cluster(4, 2).await;
    let first = submit_create_table(&cluster, "public", "t1", None)
        .await
        .unwrap();

    let err = submit_create_table(&cluster, "public", "t1", None)
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::AlreadyExists);

    // No duplicate was created.
    let runtime = cluster.runtime().await;
    let table = runtime
        .metadata()
        .get_table("public", "t1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(table.id, first.table.id);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_create_table_node_lost_then_retry() {
    let cluster = stable_cluster(4, 2).await;

    // The node dies between metadata creation and the on-shard create.
    cluster.dispatch.fail_table_ops.store(true, Ordering::Release);
    let err = submit_create_table(&cluster, "public", "t1", None)
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::Unavailable);

    // The metadata record survives the failed procedure.
    let runtime = cluster.runtime().await;
    let table = runtime
        .metadata()
        .get_table("public", "t1")
        .await
        .unwrap()
        .expect("metadata must survive the failed dispatch");
    assert_eq!(runtime.metadata().get_table_shard(table.id).await, None);

    // Once the shard is reachable again the replay finishes idempotently
    // with the same table ID, on the originally assigned shard.
    cluster.dispatch.fail_table_ops.store(false, Ordering::Release);
    let result = submit_create_table(&cluster, "public", "t1", None)
        .await
        .unwrap();
    assert_eq!(result.table.id, table.id);
    assert_eq!(
        runtime.metadata().get_table_shard(table.id).await,
        Some(result.shard_version_update.shard_id)
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_drop_table_roundtrip() {
    let cluster = stable_cluster(4, 2).await;
    let created = submit_create_table(&cluster, "public", "t1", None)
        .await
        .unwrap();

    let runtime = cluster.runtime().await;
    let (tx, rx) = oneshot::channel();
    let procedure = runtime
        .procedure_factory()
        .create_drop_table_procedure(DropTableRequest {
            schema_name: "public".to_string(),
            table_name: "t1".to_string(),
            done: Some(tx),
        })
        .await
        .unwrap()
        .expect("procedure must be created for an existing table");
    runtime.procedure_manager().submit(procedure).await.unwrap();
    let dropped = tokio::time::timeout(Duration::from_secs(5), rx)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(dropped.id, created.table.id);

    assert!(runtime
        .metadata()
        .get_table("public", "t1")
        .await
        .unwrap()
        .is_none());
    assert_eq!(
        runtime.metadata().get_table_shard(created.table.id).await,
        None
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_drop_nonexistent_table_is_noop() {
    let cluster = stable_cluster(4, 2).await;
    let runtime = cluster.runtime().await;

    let procedure = runtime
        .procedure_factory()
        .create_drop_table_procedure(DropTableRequest {
            schema_name: "public".to_string(),
            table_name: "ghost".to_string(),
            done: None,
        })
        .await
        .unwrap();
    assert!(procedure.is_none(), "no procedure for a nonexistent table");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_create_partition_table_fans_out() {
    let cluster = stable_cluster(8, 2).await;

    let result = submit_create_table(
        &cluster,
        "public",
        "pt",
        Some(PartitionInfo {
            sub_table_names: vec!["pt_0".to_string(), "pt_1".to_string(), "pt_2".to_string()],
        }),
    )
    .await
    .unwrap();
    assert_eq!(result.table.name, "pt");

    let runtime = cluster.runtime().await;
    for sub in ["pt_0", "pt_1", "pt_2"] {
        let table = runtime
            .metadata()
            .get_table("public", sub)
            .await
            .unwrap()
            .unwrap_or_else(|| panic!("sub table {} must exist", sub));
        assert!(
            runtime.metadata().get_table_shard(table.id).await.is_some(),
            "sub table {} must be placed on a shard",
            sub
        );
    }
    let parent = runtime
        .metadata()
        .get_table("public", "pt")
        .await
        .unwrap()
        .unwrap();
    assert!(parent.is_partition_table());

    // Every table ID lives in exactly one shard view.
    let snapshot = runtime.metadata().get_cluster_snapshot().await;
    for view in snapshot.topology.shard_views.values() {
        for other in snapshot.topology.shard_views.values() {
            if view.shard_id == other.shard_id {
                continue;
            }
            for id in &view.table_ids {
                assert!(!other.table_ids.contains(id));
            }
        }
    }
}
