//! Create-table procedure
//!
//! `Begin -> CheckTableExists -> CreateMetadata -> CreateOnShard -> Finish`.
//! Every step is idempotent: a replay after a crash or a node failure skips
//! work that already committed and the shard-version fence rejects stale
//! writes.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use super::{
    copy_error, Kind, ProcMeta, Procedure, ProcedureParams, RelatedVersionInfo, State,
};
use crate::dispatch::{CreateTableOnShardRequest, Dispatch, UpdateShardInfo};
use crate::error::{MetaError, Result};
use crate::metadata::{
    ClusterMetadata, CreateTableMetadataRequest, CreateTableResult, PartitionInfo, ShardId,
    ShardInfo, ShardRole, ShardStatus, ShardVersionUpdate, Snapshot,
};

/// Completion channel handed in by the request handler
pub type CreateTableSender = oneshot::Sender<Result<CreateTableResult>>;

enum Step {
    Begin,
    CheckTableExists,
    CreateMetadata,
    CreateOnShard,
    Finish,
}

pub struct CreateTableProcedure {
    id: u64,
    schema_name: String,
    table_name: String,
    partition_info: Option<PartitionInfo>,
    shard_id: ShardId,
    related: RelatedVersionInfo,
    snapshot: Snapshot,
    metadata: Arc<ClusterMetadata>,
    dispatch: Arc<dyn Dispatch>,
    meta: ProcMeta,
    done: Mutex<Option<CreateTableSender>>,
}

impl CreateTableProcedure {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: u64,
        schema_name: String,
        table_name: String,
        partition_info: Option<PartitionInfo>,
        shard_id: ShardId,
        snapshot: Snapshot,
        metadata: Arc<ClusterMetadata>,
        dispatch: Arc<dyn Dispatch>,
        done: Option<CreateTableSender>,
    ) -> Result<Self> {
        let related = RelatedVersionInfo::for_shard(&snapshot, shard_id)?;
        Ok(Self {
            id,
            schema_name,
            table_name,
            partition_info,
            shard_id,
            related,
            snapshot,
            metadata,
            dispatch,
            meta: ProcMeta::new(),
            done: Mutex::new(done),
        })
    }

    fn fail(&self, err: MetaError) -> MetaError {
        self.meta.set(ProcMeta::terminal_for(&err));
        if let Some(done) = self.done.lock().take() {
            let _ = done.send(Err(copy_error(&err)));
        }
        err
    }

    async fn check_table_exists(&self) -> Result<()> {
        let table = self
            .metadata
            .get_table(&self.schema_name, &self.table_name)
            .await?;
        let Some(table) = table else {
            return Ok(());
        };
        // Metadata plus a shard mapping means the table is fully created; a
        // record without mapping is the retry path of a failed create.
        if self.metadata.get_table_shard(table.id).await.is_some() {
            return Err(MetaError::already_exists(format!(
                "table {}.{} already exists",
                self.schema_name, self.table_name
            )));
        }
        Ok(())
    }

    async fn create_metadata(&self) -> Result<()> {
        self.metadata
            .create_table_metadata(CreateTableMetadataRequest {
                schema_name: self.schema_name.clone(),
                table_name: self.table_name.clone(),
                partition_info: self.partition_info.clone(),
            })
            .await?;
        debug!("create table metadata finished, table {}", self.table_name);
        Ok(())
    }

    async fn create_on_shard(&self) -> Result<CreateTableResult> {
        let table = self
            .metadata
            .get_table_info(&self.schema_name, &self.table_name)
            .await?
            .ok_or_else(|| {
                MetaError::not_found(format!(
                    "table metadata {}.{} not found",
                    self.schema_name, self.table_name
                ))
            })?;

        let shard_node = self
            .snapshot
            .topology
            .cluster_view
            .find_shard_node(self.shard_id)
            .ok_or_else(|| {
                MetaError::not_found(format!("shard {} has no node binding", self.shard_id))
            })?;
        let expected_version = self.related.shard_with_version[&self.shard_id];

        let latest_version = self
            .dispatch
            .create_table_on_shard(
                &shard_node.node_name,
                CreateTableOnShardRequest {
                    update_shard_info: UpdateShardInfo {
                        curr_shard_info: ShardInfo {
                            id: self.shard_id,
                            role: ShardRole::Leader,
                            version: expected_version,
                            status: ShardStatus::Unknown,
                        },
                    },
                    table_info: table.clone(),
                    create_if_not_exist: true,
                    options: HashMap::new(),
                },
            )
            .await?;
        debug!(
            "dispatched createTableOnShard, table {}, latest version {}",
            self.table_name, latest_version
        );

        let update = ShardVersionUpdate {
            shard_id: self.shard_id,
            latest_version,
        };
        self.metadata.add_table_topology(update, table.id).await?;

        Ok(CreateTableResult {
            table,
            shard_version_update: update,
        })
    }

    async fn finish(&self, result: CreateTableResult) -> Result<()> {
        if let Err(e) = self
            .metadata
            .delete_table_assigned_shard(&self.schema_name, &self.table_name)
            .await
        {
            warn!(
                "delete assigned shard of {}.{} failed: {}",
                self.schema_name, self.table_name, e
            );
        }
        if let Some(done) = self.done.lock().take() {
            let _ = done.send(Ok(result));
        }
        Ok(())
    }
}

#[async_trait]
impl Procedure for CreateTableProcedure {
    fn id(&self) -> u64 {
        self.id
    }

    fn kind(&self) -> Kind {
        Kind::CreateTable
    }

    fn related_version_info(&self) -> &RelatedVersionInfo {
        &self.related
    }

    fn params(&self) -> ProcedureParams {
        ProcedureParams::CreateTable {
            schema_name: self.schema_name.clone(),
            table_name: self.table_name.clone(),
            partition_info: self.partition_info.clone(),
            shard_id: self.shard_id,
        }
    }

    async fn start(&self) -> Result<()> {
        self.meta.set(State::Running);
        let mut step = Step::Begin;
        let mut result: Option<CreateTableResult> = None;
        loop {
            if let Err(e) = self.meta.check_cancelled() {
                return Err(self.fail(e));
            }
            step = match step {
                Step::Begin => Step::CheckTableExists,
                Step::CheckTableExists => {
                    if let Err(e) = self.check_table_exists().await {
                        return Err(self.fail(e));
                    }
                    Step::CreateMetadata
                }
                Step::CreateMetadata => {
                    if let Err(e) = self.create_metadata().await {
                        return Err(self.fail(e));
                    }
                    Step::CreateOnShard
                }
                Step::CreateOnShard => match self.create_on_shard().await {
                    Ok(r) => {
                        result = Some(r);
                        Step::Finish
                    }
                    Err(e) => return Err(self.fail(e)),
                },
                Step::Finish => {
                    let result = result.take().ok_or_else(|| {
                        MetaError::internal("create table finished without result")
                    })?;
                    if let Err(e) = self.finish(result).await {
                        return Err(self.fail(e));
                    }
                    self.meta.set(State::Finished);
                    return Ok(());
                }
            };
        }
    }

    fn cancel(&self) {
        self.meta.cancel();
    }

    fn state(&self) -> State {
        self.meta.get()
    }
}
