//! Transfer-leader procedure
//!
//! Moves a shard's leader binding: close on the old leader, commit the new
//! cluster view (both the cluster version and the shard version bump), then
//! open on the new leader. The batch variant wraps the transfers emitted by
//! one scheduler round and runs them back to back.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use super::{Kind, Priority, ProcMeta, Procedure, ProcedureParams, RelatedVersionInfo, State, TransferLeaderParams};
use crate::dispatch::{CloseShardRequest, Dispatch, OpenShardRequest};
use crate::error::{MetaError, Result};
use crate::metadata::{
    ClusterMetadata, NodeName, ShardId, ShardInfo, ShardRole, ShardStatus, Snapshot,
};

enum Step {
    Begin,
    CloseOldLeader,
    UpdateMetadata,
    OpenNewLeader,
    Finish,
}

pub struct TransferLeaderProcedure {
    id: u64,
    shard_id: ShardId,
    old_leader_node: Option<NodeName>,
    new_leader_node: NodeName,
    related: RelatedVersionInfo,
    metadata: Arc<ClusterMetadata>,
    dispatch: Arc<dyn Dispatch>,
    meta: ProcMeta,
}

impl TransferLeaderProcedure {
    pub fn new(
        id: u64,
        shard_id: ShardId,
        old_leader_node: Option<NodeName>,
        new_leader_node: NodeName,
        snapshot: &Snapshot,
        metadata: Arc<ClusterMetadata>,
        dispatch: Arc<dyn Dispatch>,
    ) -> Result<Self> {
        let related = RelatedVersionInfo::for_shard(snapshot, shard_id)?;
        Ok(Self {
            id,
            shard_id,
            old_leader_node,
            new_leader_node,
            related,
            metadata,
            dispatch,
            meta: ProcMeta::new(),
        })
    }

    async fn close_old_leader(&self) -> Result<()> {
        let Some(old_leader) = &self.old_leader_node else {
            return Ok(());
        };
        // Best effort: the old leader is frequently already gone when a
        // shard gets reassigned.
        if let Err(e) = self
            .dispatch
            .close_shard(
                old_leader,
                CloseShardRequest {
                    shard_id: self.shard_id,
                },
            )
            .await
        {
            warn!(
                "close shard {} on old leader {} failed: {}",
                self.shard_id, old_leader, e
            );
        }
        Ok(())
    }

    async fn run(&self) -> Result<()> {
        let mut step = Step::Begin;
        let mut latest_version = 0;
        loop {
            self.meta.check_cancelled()?;
            step = match step {
                Step::Begin => Step::CloseOldLeader,
                Step::CloseOldLeader => {
                    self.close_old_leader().await?;
                    Step::UpdateMetadata
                }
                Step::UpdateMetadata => {
                    let update = self
                        .metadata
                        .transfer_leader(self.shard_id, &self.new_leader_node)
                        .await?;
                    latest_version = update.latest_version;
                    Step::OpenNewLeader
                }
                Step::OpenNewLeader => {
                    self.dispatch
                        .open_shard(
                            &self.new_leader_node,
                            OpenShardRequest {
                                shard: ShardInfo {
                                    id: self.shard_id,
                                    role: ShardRole::Leader,
                                    version: latest_version,
                                    status: ShardStatus::Unknown,
                                },
                            },
                        )
                        .await?;
                    Step::Finish
                }
                Step::Finish => {
                    info!(
                        "shard {} leader transferred to {}",
                        self.shard_id, self.new_leader_node
                    );
                    return Ok(());
                }
            };
        }
    }
}

#[async_trait]
impl Procedure for TransferLeaderProcedure {
    fn id(&self) -> u64 {
        self.id
    }

    fn kind(&self) -> Kind {
        Kind::TransferLeader
    }

    fn priority(&self) -> Priority {
        Priority::High
    }

    fn related_version_info(&self) -> &RelatedVersionInfo {
        &self.related
    }

    fn params(&self) -> ProcedureParams {
        ProcedureParams::TransferLeader(TransferLeaderParams {
            shard_id: self.shard_id,
            old_leader_node: self.old_leader_node.clone(),
            new_leader_node: self.new_leader_node.clone(),
        })
    }

    async fn start(&self) -> Result<()> {
        self.meta.set(State::Running);
        match self.run().await {
            Ok(()) => {
                self.meta.set(State::Finished);
                Ok(())
            }
            Err(e) => {
                self.meta.set(ProcMeta::terminal_for(&e));
                Err(e)
            }
        }
    }

    fn cancel(&self) {
        self.meta.cancel();
    }

    fn state(&self) -> State {
        self.meta.get()
    }
}

/// One scheduler round's transfers, executed as a single procedure
pub struct BatchTransferLeaderProcedure {
    id: u64,
    children: Vec<Arc<TransferLeaderProcedure>>,
    related: RelatedVersionInfo,
    meta: ProcMeta,
}

impl BatchTransferLeaderProcedure {
    pub fn new(id: u64, children: Vec<Arc<TransferLeaderProcedure>>) -> Result<Self> {
        let first = children
            .first()
            .ok_or_else(|| MetaError::invalid_argument("empty transfer-leader batch"))?;
        let mut shard_with_version = HashMap::with_capacity(children.len());
        for child in &children {
            for (shard_id, version) in &child.related.shard_with_version {
                shard_with_version.insert(*shard_id, *version);
            }
        }
        let related = RelatedVersionInfo {
            cluster_id: first.related.cluster_id,
            cluster_version: first.related.cluster_version,
            shard_with_version,
        };
        Ok(Self {
            id,
            children,
            related,
            meta: ProcMeta::new(),
        })
    }
}

#[async_trait]
impl Procedure for BatchTransferLeaderProcedure {
    fn id(&self) -> u64 {
        self.id
    }

    fn kind(&self) -> Kind {
        Kind::BatchTransferLeader
    }

    fn priority(&self) -> Priority {
        Priority::High
    }

    fn related_version_info(&self) -> &RelatedVersionInfo {
        &self.related
    }

    fn params(&self) -> ProcedureParams {
        ProcedureParams::BatchTransferLeader {
            transfers: self
                .children
                .iter()
                .map(|c| TransferLeaderParams {
                    shard_id: c.shard_id,
                    old_leader_node: c.old_leader_node.clone(),
                    new_leader_node: c.new_leader_node.clone(),
                })
                .collect(),
        }
    }

    async fn start(&self) -> Result<()> {
        self.meta.set(State::Running);
        for child in &self.children {
            if let Err(e) = self.meta.check_cancelled() {
                self.meta.set(State::Cancelled);
                return Err(e);
            }
            if let Err(e) = child.start().await {
                self.meta.set(ProcMeta::terminal_for(&e));
                return Err(e);
            }
        }
        self.meta.set(State::Finished);
        Ok(())
    }

    fn cancel(&self) {
        self.meta.cancel();
        for child in &self.children {
            child.cancel();
        }
    }

    fn state(&self) -> State {
        self.meta.get()
    }
}
