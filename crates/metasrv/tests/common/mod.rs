//! Shared helpers for integration tests

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use metasrv::cluster::{ClusterManager, ClusterRuntime};
use metasrv::config::Config;
use metasrv::dispatch::{
    CloseShardRequest, CreateTableOnShardRequest, CloseTableOnShardRequest, Dispatch,
    DropTableOnShardRequest, OpenShardRequest, OpenTableOnShardRequest,
};
use metasrv::error::{MetaError, Result};
use metasrv::metadata::{
    now_ms, ClusterState, MetaStorage, Node, NodeState, NodeStats, RegisteredNode, ShardInfo,
    ShardRole, ShardStatus, TopologyType,
};

/// Dispatch stub: every call succeeds and bumps the shard version by one,
/// unless told to fail.
#[derive(Default)]
pub struct MockDispatch {
    pub fail_table_ops: AtomicBool,
    /// Artificial latency for openShard, to keep procedures in flight.
    pub open_delay: Mutex<Option<Duration>>,
    pub calls: Mutex<Vec<String>>,
}

impl MockDispatch {
    fn record(&self, op: &str, addr: &str) {
        self.calls.lock().push(format!("{}@{}", op, addr));
    }

    fn check_available(&self, op: &str) -> Result<()> {
        if self.fail_table_ops.load(Ordering::Acquire) {
            return Err(MetaError::unavailable(format!("{}: node is gone", op)));
        }
        Ok(())
    }
}

#[async_trait]
impl Dispatch for MockDispatch {
    async fn open_shard(&self, addr: &str, _req: OpenShardRequest) -> Result<()> {
        let delay = *self.open_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.record("openShard", addr);
        Ok(())
    }

    async fn close_shard(&self, addr: &str, _req: CloseShardRequest) -> Result<()> {
        self.record("closeShard", addr);
        Ok(())
    }

    async fn create_table_on_shard(
        &self,
        addr: &str,
        req: CreateTableOnShardRequest,
    ) -> Result<u64> {
        self.check_available("createTableOnShard")?;
        self.record("createTableOnShard", addr);
        Ok(req.update_shard_info.curr_shard_info.version + 1)
    }

    async fn drop_table_on_shard(&self, addr: &str, req: DropTableOnShardRequest) -> Result<u64> {
        self.check_available("dropTableOnShard")?;
        self.record("dropTableOnShard", addr);
        Ok(req.update_shard_info.curr_shard_info.version + 1)
    }

    async fn open_table_on_shard(&self, addr: &str, _req: OpenTableOnShardRequest) -> Result<()> {
        self.record("openTableOnShard", addr);
        Ok(())
    }

    async fn close_table_on_shard(&self, addr: &str, _req: CloseTableOnShardRequest) -> Result<()> {
        self.record("closeTableOnShard", addr);
        Ok(())
    }
}

pub struct TestCluster {
    pub manager: Arc<ClusterManager>,
    pub dispatch: Arc<MockDispatch>,
    pub cluster_name: String,
}

impl TestCluster {
    /// Cluster manager over a fresh in-memory store, default cluster
    /// created and opened.
    pub async fn start(topology_type: TopologyType, shard_total: u32, node_count: u32) -> Self {
        let config = Config {
            default_cluster_shard_total: shard_total,
            default_cluster_node_count: node_count,
            topology_type,
            // One scheduling round must be able to cover every shard.
            procedure_executing_batch_size: shard_total.max(4),
            ..Config::default()
        };
        let kv = Arc::new(kv::MemKv::new());
        let storage = MetaStorage::new(kv, config.storage_root_path.clone());
        let dispatch = Arc::new(MockDispatch::default());
        let manager = Arc::new(ClusterManager::new(
            storage,
            dispatch.clone(),
            config.clone(),
        ));
        manager.bootstrap().await.unwrap();
        manager.start_all().await;
        Self {
            manager,
            dispatch,
            cluster_name: config.default_cluster_name,
        }
    }

    pub async fn runtime(&self) -> Arc<ClusterRuntime> {
        self.manager.get_cluster(&self.cluster_name).await.unwrap()
    }

    /// Heartbeat reporting the given shards as ready.
    pub async fn heartbeat(&self, node_name: &str, ready_shards: &[u32]) {
        let runtime = self.runtime().await;
        let snapshot = runtime.metadata().get_cluster_snapshot().await;
        let shard_infos: Vec<ShardInfo> = ready_shards
            .iter()
            .map(|shard_id| ShardInfo {
                id: *shard_id,
                role: ShardRole::Leader,
                version: snapshot
                    .topology
                    .shard_views
                    .get(shard_id)
                    .map(|v| v.version)
                    .unwrap_or(0),
                status: ShardStatus::Ready,
            })
            .collect();
        self.manager
            .register_node(
                &self.cluster_name,
                RegisteredNode::new(
                    Node {
                        name: node_name.to_string(),
                        stats: NodeStats {
                            lease: 10,
                            zone: String::new(),
                            node_version: "1.0.0".to_string(),
                        },
                        last_touch_time: now_ms(),
                        state: NodeState::Online,
                    },
                    shard_infos,
                ),
            )
            .await
            .unwrap();
    }

    pub async fn cluster_state(&self) -> ClusterState {
        let runtime = self.runtime().await;
        runtime
            .metadata()
            .get_cluster_snapshot()
            .await
            .topology
            .cluster_view
            .state
    }

    /// Shards each node currently owns, according to the cluster view.
    pub async fn assignments(&self) -> HashMap<String, Vec<u32>> {
        let runtime = self.runtime().await;
        let snapshot = runtime.metadata().get_cluster_snapshot().await;
        let mut result: HashMap<String, Vec<u32>> = HashMap::new();
        for shard_node in &snapshot.topology.cluster_view.shard_nodes {
            result
                .entry(shard_node.node_name.clone())
                .or_default()
                .push(shard_node.shard_id);
        }
        result
    }

    /// Poll until the cluster view holds `expect` shard bindings.
    pub async fn wait_for_assignments(&self, expect: usize, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let snapshot = self.runtime().await.metadata().get_cluster_snapshot().await;
            if snapshot.topology.cluster_view.shard_nodes.len() == expect {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}
