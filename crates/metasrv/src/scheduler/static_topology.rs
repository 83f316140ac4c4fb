//! Static-topology scheduler
//!
//! In `prepare` it assigns every unassigned shard across the registered
//! nodes with the consistent-hash picker and emits one batched
//! transfer-leader. In `stable` it re-opens shards whose owning node is
//! alive but no longer reports them. Emits nothing in `empty`.

use std::sync::Arc;

use async_trait::async_trait;

use super::{NodePicker, NodePickerConfig, ScheduleResult, Scheduler};
use crate::error::Result;
use crate::metadata::{now_ms, ClusterState, ShardId, Snapshot};
use crate::procedure::{Factory, TransferLeaderProcedure, TransferLeaderRequest};

pub struct StaticTopologyShardScheduler {
    factory: Arc<Factory>,
    node_picker: Arc<dyn NodePicker>,
    procedure_executing_batch_size: u32,
}

impl StaticTopologyShardScheduler {
    pub fn new(
        factory: Arc<Factory>,
        node_picker: Arc<dyn NodePicker>,
        procedure_executing_batch_size: u32,
    ) -> Self {
        Self {
            factory,
            node_picker,
            procedure_executing_batch_size,
        }
    }

    async fn schedule_prepare(&self, snapshot: &Snapshot) -> Result<ScheduleResult> {
        let unassigned: Vec<ShardId> = snapshot
            .topology
            .shard_views
            .values()
            .filter(|v| {
                snapshot
                    .topology
                    .cluster_view
                    .find_shard_node(v.shard_id)
                    .is_none()
            })
            .map(|v| v.shard_id)
            .collect();
        if unassigned.is_empty() {
            return Ok(ScheduleResult::empty());
        }

        let config = NodePickerConfig {
            num_total_shards: snapshot.topology.shard_views.len() as u32,
            shard_affinities: Default::default(),
        };
        let mapping =
            self.node_picker
                .pick_node(&config, &unassigned, &snapshot.registered_nodes)?;

        let mut transfers: Vec<Arc<TransferLeaderProcedure>> = Vec::new();
        let mut reasons = String::new();
        for (shard_id, node_name) in mapping {
            let procedure = self
                .factory
                .create_transfer_leader_procedure(TransferLeaderRequest {
                    snapshot: snapshot.clone(),
                    shard_id,
                    old_leader_node: None,
                    new_leader_node: node_name.clone(),
                })
                .await?;
            transfers.push(procedure);
            reasons.push_str(&format!(
                "Cluster initialization, assign shard to node, shardID:{}, nodeName:{}. ",
                shard_id, node_name
            ));
            if transfers.len() >= self.procedure_executing_batch_size as usize {
                break;
            }
        }
        self.batch(transfers, reasons).await
    }

    async fn schedule_stable(&self, snapshot: &Snapshot) -> Result<ScheduleResult> {
        let now = now_ms();
        let mut transfers: Vec<Arc<TransferLeaderProcedure>> = Vec::new();
        let mut reasons = String::new();
        for shard_node in &snapshot.topology.cluster_view.shard_nodes {
            let Some(node) = snapshot
                .registered_nodes
                .iter()
                .find(|n| n.node.name == shard_node.node_name && !n.is_expired(now))
            else {
                continue;
            };
            if node.shard_infos.iter().any(|s| s.id == shard_node.shard_id) {
                continue;
            }
            // Alive node lost the shard, reopen it there.
            let procedure = self
                .factory
                .create_transfer_leader_procedure(TransferLeaderRequest {
                    snapshot: snapshot.clone(),
                    shard_id: shard_node.shard_id,
                    old_leader_node: None,
                    new_leader_node: node.node.name.clone(),
                })
                .await?;
            transfers.push(procedure);
            reasons.push_str(&format!(
                "Cluster recover, assign shard to node, shardID:{}, nodeName:{}. ",
                shard_node.shard_id, shard_node.node_name
            ));
            if transfers.len() >= self.procedure_executing_batch_size as usize {
                break;
            }
        }
        self.batch(transfers, reasons).await
    }

    async fn batch(
        &self,
        transfers: Vec<Arc<TransferLeaderProcedure>>,
        reasons: String,
    ) -> Result<ScheduleResult> {
        if transfers.is_empty() {
            return Ok(ScheduleResult::empty());
        }
        let procedure = self
            .factory
            .create_batch_transfer_leader_procedure(transfers)
            .await?;
        Ok(ScheduleResult::new(procedure, reasons))
    }
}

#[async_trait]
impl Scheduler for StaticTopologyShardScheduler {
    fn name(&self) -> &'static str {
        "static_scheduler"
    }

    async fn schedule(&self, snapshot: &Snapshot) -> Result<ScheduleResult> {
        match snapshot.topology.cluster_view.state {
            ClusterState::Empty => Ok(ScheduleResult::empty()),
            ClusterState::Prepare => self.schedule_prepare(snapshot).await,
            ClusterState::Stable => self.schedule_stable(snapshot).await,
        }
    }
}
