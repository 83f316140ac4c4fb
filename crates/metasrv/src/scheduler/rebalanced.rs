//! Rebalancing scheduler for dynamic topologies
//!
//! Computes each shard's target node with the consistent-hash picker over
//! the alive nodes and moves shards sitting elsewhere, which converges on
//! an even distribution. Affinity rules pin shards: the picker targets the
//! pinned node, so the scheduler moves a pinned shard toward its target
//! and never off it. Emission pauses while scheduling is disabled (cluster
//! deploys).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;

use super::{NodePicker, NodePickerConfig, ScheduleResult, Scheduler, ShardAffinityRule};
use crate::error::Result;
use crate::metadata::{ClusterState, ShardId, Snapshot};
use crate::procedure::{Factory, TransferLeaderProcedure, TransferLeaderRequest};

pub struct RebalancedShardScheduler {
    factory: Arc<Factory>,
    node_picker: Arc<dyn NodePicker>,
    procedure_executing_batch_size: u32,
    enabled: AtomicBool,
    affinities: Mutex<HashMap<ShardId, ShardAffinityRule>>,
}

impl RebalancedShardScheduler {
    pub fn new(
        factory: Arc<Factory>,
        node_picker: Arc<dyn NodePicker>,
        procedure_executing_batch_size: u32,
        enabled: bool,
    ) -> Self {
        Self {
            factory,
            node_picker,
            procedure_executing_batch_size,
            enabled: AtomicBool::new(enabled),
            affinities: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl Scheduler for RebalancedShardScheduler {
    fn name(&self) -> &'static str {
        "rebalanced_scheduler"
    }

    async fn schedule(&self, snapshot: &Snapshot) -> Result<ScheduleResult> {
        if snapshot.topology.cluster_view.state == ClusterState::Empty {
            return Ok(ScheduleResult::empty());
        }
        if !self.enabled.load(Ordering::Acquire) {
            debug!("rebalanced scheduler paused, schedule disabled");
            return Ok(ScheduleResult::empty());
        }

        let shard_ids: Vec<ShardId> = snapshot.topology.shard_views.keys().copied().collect();
        let config = NodePickerConfig {
            num_total_shards: shard_ids.len() as u32,
            shard_affinities: self.affinities.lock().clone(),
        };
        let targets = self
            .node_picker
            .pick_node(&config, &shard_ids, &snapshot.registered_nodes)?;

        let mut transfers: Vec<Arc<TransferLeaderProcedure>> = Vec::new();
        let mut reasons = String::new();
        for shard_id in shard_ids {
            let Some(target) = targets.get(&shard_id) else {
                continue;
            };
            let current = snapshot.topology.cluster_view.find_shard_node(shard_id);
            if current.map(|n| n.node_name.as_str()) == Some(target.as_str()) {
                continue;
            }
            let procedure = self
                .factory
                .create_transfer_leader_procedure(TransferLeaderRequest {
                    snapshot: snapshot.clone(),
                    shard_id,
                    old_leader_node: current.map(|n| n.node_name.clone()),
                    new_leader_node: target.clone(),
                })
                .await?;
            transfers.push(procedure);
            reasons.push_str(&format!(
                "Rebalance shard, shardID:{}, from:{}, to:{}. ",
                shard_id,
                current.map(|n| n.node_name.as_str()).unwrap_or(""),
                target
            ));
            if transfers.len() >= self.procedure_executing_batch_size as usize {
                break;
            }
        }

        if transfers.is_empty() {
            return Ok(ScheduleResult::empty());
        }
        let procedure = self
            .factory
            .create_batch_transfer_leader_procedure(transfers)
            .await?;
        Ok(ScheduleResult::new(procedure, reasons))
    }

    fn update_enable_schedule(&self, enable: bool) {
        self.enabled.store(enable, Ordering::Release);
    }

    fn add_shard_affinity_rule(&self, rule: ShardAffinityRule) -> Result<()> {
        let mut affinities = self.affinities.lock();
        match affinities.get(&rule.shard_id) {
            Some(existing) if existing.priority > rule.priority => {}
            _ => {
                affinities.insert(rule.shard_id, rule);
            }
        }
        Ok(())
    }

    fn remove_shard_affinity_rule(&self, shard_id: ShardId) -> Result<()> {
        self.affinities.lock().remove(&shard_id);
        Ok(())
    }

    fn list_shard_affinity_rules(&self) -> Result<Vec<ShardAffinityRule>> {
        let mut rules: Vec<ShardAffinityRule> = self.affinities.lock().values().cloned().collect();
        rules.sort_by_key(|r| r.shard_id);
        Ok(rules)
    }
}
