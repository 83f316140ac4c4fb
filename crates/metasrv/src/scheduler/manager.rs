//! Scheduler manager
//!
//! Registers the scheduler set matching the cluster's topology type, runs
//! them on a five-second tick against a fresh snapshot, and submits the
//! emitted procedures. Also owns the shard watch (expired shard leases turn
//! into dropped bindings) and the persisted shard-affinity rules.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{error, info, warn};

use super::{
    ConsistentHashNodePicker, RebalancedShardScheduler, ReopenShardScheduler, ScheduleResult,
    Scheduler, ShardAffinityRule, StaticTopologyShardScheduler,
};
use crate::error::{MetaError, Result};
use crate::metadata::{
    ClusterMetadata, ClusterState, MetaStorage, ShardId, ShardNode, ShardRole, Snapshot,
    TopologyType,
};
use crate::procedure::{Factory, ProcedureManager};
use crate::watch::{
    KvShardWatch, NoopShardWatch, ShardExpireEvent, ShardRegisterEvent, ShardWatch,
    ShardWatchCallback,
};

const SCHEDULE_INTERVAL: Duration = Duration::from_secs(5);

/// Drops the expired leader's binding so the next scheduler tick reassigns
/// the shard.
struct ExpiryCallback {
    metadata: Arc<ClusterMetadata>,
}

#[async_trait]
impl ShardWatchCallback for ExpiryCallback {
    async fn on_shard_registered(&self, _event: ShardRegisterEvent) -> Result<()> {
        Ok(())
    }

    async fn on_shard_expired(&self, event: ShardExpireEvent) -> Result<()> {
        self.metadata
            .drop_shard_nodes(vec![ShardNode {
                shard_id: event.shard_id,
                role: ShardRole::Leader,
                node_name: event.old_leader_node,
            }])
            .await
    }
}

pub struct SchedulerManager {
    metadata: Arc<ClusterMetadata>,
    procedure_manager: Arc<ProcedureManager>,
    storage: MetaStorage,
    topology_type: TopologyType,
    schedulers: Mutex<Vec<Arc<dyn Scheduler>>>,
    shard_watch: Arc<dyn ShardWatch>,
    enable_schedule: AtomicBool,
    running: Arc<AtomicBool>,
    handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl SchedulerManager {
    pub fn new(
        metadata: Arc<ClusterMetadata>,
        procedure_manager: Arc<ProcedureManager>,
        factory: Arc<Factory>,
        storage: MetaStorage,
        topology_type: TopologyType,
        procedure_executing_batch_size: u32,
        enable_schedule: bool,
    ) -> Self {
        let node_picker = Arc::new(ConsistentHashNodePicker::default());
        let mut schedulers: Vec<Arc<dyn Scheduler>> = Vec::new();
        let shard_watch: Arc<dyn ShardWatch> = match topology_type {
            TopologyType::Static => {
                schedulers.push(Arc::new(StaticTopologyShardScheduler::new(
                    factory.clone(),
                    node_picker.clone(),
                    procedure_executing_batch_size,
                )));
                Arc::new(NoopShardWatch)
            }
            TopologyType::Dynamic => {
                schedulers.push(Arc::new(RebalancedShardScheduler::new(
                    factory.clone(),
                    node_picker,
                    procedure_executing_batch_size,
                    enable_schedule,
                )));
                Arc::new(KvShardWatch::new(
                    storage.kv(),
                    storage.key_shard_leases_prefix(metadata.cluster_id()),
                ))
            }
        };
        schedulers.push(Arc::new(ReopenShardScheduler::new(
            factory,
            procedure_executing_batch_size,
        )));
        for scheduler in &schedulers {
            info!("registered scheduler {}", scheduler.name());
        }

        shard_watch.register_callback(Arc::new(ExpiryCallback {
            metadata: metadata.clone(),
        }));

        Self {
            metadata,
            procedure_manager,
            storage,
            topology_type,
            schedulers: Mutex::new(schedulers),
            shard_watch,
            enable_schedule: AtomicBool::new(enable_schedule),
            running: Arc::new(AtomicBool::new(false)),
            handle: Mutex::new(None),
        }
    }

    pub async fn start(self: Arc<Self>) -> Result<()> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.load_affinity_rules().await?;
        self.shard_watch.start().await?;

        let manager = self.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SCHEDULE_INTERVAL);
            // The first tick fires immediately; skip it so a freshly started
            // manager sees at least one heartbeat round first.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if !manager.running.load(Ordering::Acquire) {
                    info!("scheduler manager stopped");
                    return;
                }
                manager.run_once().await;
            }
        });
        *self.handle.lock() = Some(handle);
        Ok(())
    }

    pub async fn stop(&self) -> Result<()> {
        if !self.running.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        if let Some(handle) = self.handle.lock().take() {
            handle.abort();
        }
        self.shard_watch.stop().await
    }

    /// One scheduling round: promote a finished prepare to stable, or run
    /// every scheduler and submit what they emit.
    pub async fn run_once(&self) {
        let snapshot = self.metadata.get_cluster_snapshot().await;

        // Assignment finished: promote the cluster to stable and let the
        // next tick schedule against the new state.
        if snapshot.is_prepare_finished() {
            info!("try to update cluster state to stable");
            if let Err(e) = self
                .metadata
                .update_cluster_view(
                    ClusterState::Stable,
                    snapshot.topology.cluster_view.shard_nodes.clone(),
                )
                .await
            {
                error!("update cluster view to stable failed: {}", e);
            }
            return;
        }

        let results = self.schedule(&snapshot).await;
        for result in results {
            if let Some(procedure) = result.procedure {
                info!(
                    "scheduler submits procedure {}, reason: {}",
                    procedure.id(),
                    result.reason
                );
                if let Err(e) = self.procedure_manager.submit(procedure).await {
                    warn!("scheduler submit procedure failed: {}", e);
                }
            }
        }
    }

    /// Run every registered scheduler against one snapshot.
    pub async fn schedule(&self, snapshot: &Snapshot) -> Vec<ScheduleResult> {
        let schedulers = self.schedulers.lock().clone();
        let mut results = Vec::with_capacity(schedulers.len());
        for scheduler in schedulers {
            match scheduler.schedule(snapshot).await {
                Ok(result) => results.push(result),
                Err(e) => error!("scheduler {} failed: {}", scheduler.name(), e),
            }
        }
        results
    }

    pub fn list_schedulers(&self) -> Vec<&'static str> {
        self.schedulers.lock().iter().map(|s| s.name()).collect()
    }

    /// Pause or resume dynamic scheduling; static topologies reject the
    /// call.
    pub fn update_enable_schedule(&self, enable: bool) -> Result<()> {
        if self.topology_type != TopologyType::Dynamic {
            return Err(MetaError::precondition_failed(
                "schedule toggling is only supported by the dynamic topology",
            ));
        }
        self.enable_schedule.store(enable, Ordering::Release);
        for scheduler in self.schedulers.lock().iter() {
            scheduler.update_enable_schedule(enable);
        }
        info!("enable_schedule updated to {}", enable);
        Ok(())
    }

    pub fn get_enable_schedule(&self) -> Result<bool> {
        if self.topology_type != TopologyType::Dynamic {
            return Err(MetaError::precondition_failed(
                "schedule toggling is only supported by the dynamic topology",
            ));
        }
        Ok(self.enable_schedule.load(Ordering::Acquire))
    }

    // Shard affinity rules: fanned out to the schedulers, persisted with
    // the scheduler state.

    pub async fn add_shard_affinity_rule(&self, rule: ShardAffinityRule) -> Result<()> {
        let mut last_err = None;
        for scheduler in self.schedulers.lock().iter() {
            if let Err(e) = scheduler.add_shard_affinity_rule(rule.clone()) {
                last_err = Some(e);
            } else {
                last_err = None;
                break;
            }
        }
        if let Some(e) = last_err {
            return Err(e);
        }
        let key = self
            .storage
            .key_affinity(self.metadata.cluster_id(), rule.shard_id);
        self.storage.put_record(&key, &rule).await
    }

    pub async fn remove_shard_affinity_rule(&self, shard_id: ShardId) -> Result<()> {
        let mut last_err = None;
        for scheduler in self.schedulers.lock().iter() {
            if let Err(e) = scheduler.remove_shard_affinity_rule(shard_id) {
                last_err = Some(e);
            } else {
                last_err = None;
                break;
            }
        }
        if let Some(e) = last_err {
            return Err(e);
        }
        let key = self.storage.key_affinity(self.metadata.cluster_id(), shard_id);
        self.storage.delete(&key).await
    }

    pub fn list_shard_affinity_rules(&self) -> Result<Vec<ShardAffinityRule>> {
        let mut last_err = None;
        for scheduler in self.schedulers.lock().iter() {
            match scheduler.list_shard_affinity_rules() {
                Ok(rules) => return Ok(rules),
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err
            .unwrap_or_else(|| MetaError::not_implemented("no scheduler supports shard affinity")))
    }

    async fn load_affinity_rules(&self) -> Result<()> {
        let prefix = self.storage.key_affinities_prefix(self.metadata.cluster_id());
        let rules: Vec<ShardAffinityRule> = self.storage.list_records(&prefix).await?;
        if rules.is_empty() {
            return Ok(());
        }
        info!("loaded {} persisted shard affinity rules", rules.len());
        for rule in rules {
            for scheduler in self.schedulers.lock().iter() {
                if scheduler.add_shard_affinity_rule(rule.clone()).is_ok() {
                    break;
                }
            }
        }
        Ok(())
    }
}
