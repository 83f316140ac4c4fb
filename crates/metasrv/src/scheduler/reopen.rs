//! Reopen scheduler
//!
//! A node that reports a shard as `partial_open` got stuck opening it; the
//! scheduler emits a transfer-leader back to the same node, which amounts
//! to a re-open. Only runs once the cluster is stable.

use std::sync::Arc;

use async_trait::async_trait;

use super::{ScheduleResult, Scheduler};
use crate::error::Result;
use crate::metadata::{now_ms, ClusterState, ShardStatus, Snapshot};
use crate::procedure::{Factory, TransferLeaderProcedure, TransferLeaderRequest};

pub struct ReopenShardScheduler {
    factory: Arc<Factory>,
    procedure_executing_batch_size: u32,
}

impl ReopenShardScheduler {
    pub fn new(factory: Arc<Factory>, procedure_executing_batch_size: u32) -> Self {
        Self {
            factory,
            procedure_executing_batch_size,
        }
    }
}

#[async_trait]
impl Scheduler for ReopenShardScheduler {
    fn name(&self) -> &'static str {
        "reopen_scheduler"
    }

    async fn schedule(&self, snapshot: &Snapshot) -> Result<ScheduleResult> {
        if snapshot.topology.cluster_view.state != ClusterState::Stable {
            return Ok(ScheduleResult::empty());
        }

        let now = now_ms();
        let mut transfers: Vec<Arc<TransferLeaderProcedure>> = Vec::new();
        let mut reasons = String::new();
        'outer: for node in &snapshot.registered_nodes {
            if node.is_expired(now) {
                continue;
            }
            for shard_info in &node.shard_infos {
                if shard_info.status != ShardStatus::PartialOpen {
                    continue;
                }
                let procedure = self
                    .factory
                    .create_transfer_leader_procedure(TransferLeaderRequest {
                        snapshot: snapshot.clone(),
                        shard_id: shard_info.id,
                        old_leader_node: None,
                        new_leader_node: node.node.name.clone(),
                    })
                    .await?;
                transfers.push(procedure);
                reasons.push_str(&format!(
                    "Shard is partially open, reopen it, shardID:{}, nodeName:{}. ",
                    shard_info.id, node.node.name
                ));
                if transfers.len() >= self.procedure_executing_batch_size as usize {
                    break 'outer;
                }
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
}
