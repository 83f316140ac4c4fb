//! Shard-split procedure
//!
//! Carves the given tables out of a shard into a freshly allocated one:
//! create the new shard view, bind it to the target node, move the table
//! IDs across (both shard versions bump), then open the new shard on its
//! node.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use super::{Kind, Priority, ProcMeta, Procedure, ProcedureParams, RelatedVersionInfo, State};
use crate::dispatch::{Dispatch, OpenShardRequest};
use crate::error::Result;
use crate::metadata::{
    ClusterMetadata, MigrateTableRequest, NodeName, ShardId, ShardInfo, ShardRole, ShardStatus,
    Snapshot,
};

enum Step {
    Begin,
    CreateNewShardView,
    UpdateShardTables,
    OpenNewShard,
    Finish,
}

pub struct SplitProcedure {
    id: u64,
    schema_name: String,
    table_names: Vec<String>,
    shard_id: ShardId,
    new_shard_id: ShardId,
    target_node_name: NodeName,
    related: RelatedVersionInfo,
    metadata: Arc<ClusterMetadata>,
    dispatch: Arc<dyn Dispatch>,
    meta: ProcMeta,
}

impl SplitProcedure {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: u64,
        schema_name: String,
        table_names: Vec<String>,
        shard_id: ShardId,
        new_shard_id: ShardId,
        target_node_name: NodeName,
        snapshot: &Snapshot,
        metadata: Arc<ClusterMetadata>,
        dispatch: Arc<dyn Dispatch>,
    ) -> Result<Self> {
        let related = RelatedVersionInfo::for_shard(snapshot, shard_id)?;
        Ok(Self {
            id,
            schema_name,
            table_names,
            shard_id,
            new_shard_id,
            target_node_name,
            related,
            metadata,
            dispatch,
            meta: ProcMeta::new(),
        })
    }

    async fn run(&self) -> Result<()> {
        let mut step = Step::Begin;
        let mut latest_version = 0;
        loop {
            self.meta.check_cancelled()?;
            step = match step {
                Step::Begin => Step::CreateNewShardView,
                Step::CreateNewShardView => {
                    self.metadata.create_shard_view(self.new_shard_id).await?;
                    let update = self
                        .metadata
                        .transfer_leader(self.new_shard_id, &self.target_node_name)
                        .await?;
                    latest_version = update.latest_version;
                    Step::UpdateShardTables
                }
                Step::UpdateShardTables => {
                    self.metadata
                        .migrate_table(MigrateTableRequest {
                            schema_name: self.schema_name.clone(),
                            table_names: self.table_names.clone(),
                            old_shard_id: self.shard_id,
                            new_shard_id: self.new_shard_id,
                        })
                        .await?;
                    Step::OpenNewShard
                }
                Step::OpenNewShard => {
                    self.dispatch
                        .open_shard(
                            &self.target_node_name,
                            OpenShardRequest {
                                shard: ShardInfo {
                                    id: self.new_shard_id,
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
                        "shard {} split: {} tables moved to shard {} on {}",
                        self.shard_id,
                        self.table_names.len(),
                        self.new_shard_id,
                        self.target_node_name
                    );
                    return Ok(());
                }
            };
        }
    }
}

#[async_trait]
impl Procedure for SplitProcedure {
    fn id(&self) -> u64 {
        self.id
    }

    fn kind(&self) -> Kind {
        Kind::Split
    }

    fn priority(&self) -> Priority {
        Priority::Medium
    }

    fn related_version_info(&self) -> &RelatedVersionInfo {
        &self.related
    }

    fn params(&self) -> ProcedureParams {
        ProcedureParams::Split {
            schema_name: self.schema_name.clone(),
            table_names: self.table_names.clone(),
            shard_id: self.shard_id,
            new_shard_id: self.new_shard_id,
            target_node_name: self.target_node_name.clone(),
        }
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
