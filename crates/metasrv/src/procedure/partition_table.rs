//! Partition-table procedures
//!
//! A partition table is a parent table plus one data table per partition.
//! Create picks a shard per sub table, fans the creates out, then creates
//! the parent on its own shard. Drop removes the sub tables first and the
//! parent last. Each sub-table operation is individually idempotent, so a
//! failed fan-out reports one aggregated error after best-effort cleanup
//! and can simply be retried until clean.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, warn};

use super::create_table::CreateTableSender;
use super::drop_table::DropTableSender;
use super::{copy_error, Kind, ProcMeta, Procedure, ProcedureParams, RelatedVersionInfo, State};
use crate::dispatch::{
    CreateTableOnShardRequest, Dispatch, DropTableOnShardRequest, UpdateShardInfo,
};
use crate::error::{MetaError, Result};
use crate::metadata::{
    ClusterMetadata, CreateTableMetadataRequest, CreateTableResult,
    DropTableRequest as MetaDropTableRequest, PartitionInfo, ShardId, ShardInfo, ShardNode,
    ShardRole, ShardStatus, ShardVersionUpdate, Snapshot, TableInfo,
};

/// Tracks the moving shard versions across a fan-out: two sub tables on the
/// same shard must fence against consecutive versions.
struct VersionTracker {
    versions: Mutex<HashMap<ShardId, u64>>,
}

impl VersionTracker {
    fn new(related: &RelatedVersionInfo) -> Self {
        Self {
            versions: Mutex::new(related.shard_with_version.clone()),
        }
    }

    fn current(&self, shard_id: ShardId) -> Result<u64> {
        self.versions
            .lock()
            .get(&shard_id)
            .copied()
            .ok_or_else(|| MetaError::internal(format!("shard {} not tracked", shard_id)))
    }

    fn commit(&self, shard_id: ShardId, latest: u64) {
        self.versions.lock().insert(shard_id, latest);
    }
}

fn shard_info(shard_id: ShardId, version: u64) -> ShardInfo {
    ShardInfo {
        id: shard_id,
        role: ShardRole::Leader,
        version,
        status: ShardStatus::Unknown,
    }
}

pub struct CreatePartitionTableProcedure {
    id: u64,
    schema_name: String,
    table_name: String,
    sub_table_names: Vec<String>,
    /// Shard picked per table (parent included), fixed at admission.
    table_shards: HashMap<String, ShardNode>,
    related: RelatedVersionInfo,
    metadata: Arc<ClusterMetadata>,
    dispatch: Arc<dyn Dispatch>,
    versions: VersionTracker,
    meta: ProcMeta,
    done: Mutex<Option<CreateTableSender>>,
}

impl CreatePartitionTableProcedure {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: u64,
        schema_name: String,
        table_name: String,
        sub_table_names: Vec<String>,
        table_shards: HashMap<String, ShardNode>,
        snapshot: &Snapshot,
        metadata: Arc<ClusterMetadata>,
        dispatch: Arc<dyn Dispatch>,
        done: Option<CreateTableSender>,
    ) -> Result<Self> {
        let mut shard_with_version = HashMap::new();
        for shard_node in table_shards.values() {
            let view = snapshot
                .topology
                .shard_views
                .get(&shard_node.shard_id)
                .ok_or_else(|| {
                    MetaError::not_found(format!("shard {} not found", shard_node.shard_id))
                })?;
            shard_with_version.insert(shard_node.shard_id, view.version);
        }
        let related = RelatedVersionInfo {
            cluster_id: snapshot.topology.cluster_view.cluster_id,
            cluster_version: snapshot.topology.cluster_view.version,
            shard_with_version,
        };
        let versions = VersionTracker::new(&related);
        Ok(Self {
            id,
            schema_name,
            table_name,
            sub_table_names,
            table_shards,
            related,
            metadata,
            dispatch,
            versions,
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

    fn shard_of(&self, table_name: &str) -> Result<&ShardNode> {
        self.table_shards.get(table_name).ok_or_else(|| {
            MetaError::internal(format!("no shard picked for table {}", table_name))
        })
    }

    /// Create one table (metadata + on-shard + topology) on its picked shard.
    async fn create_one(
        &self,
        table_name: &str,
        partition_info: Option<PartitionInfo>,
    ) -> Result<CreateTableResult> {
        let shard_node = self.shard_of(table_name)?.clone();
        self.metadata
            .create_table_metadata(CreateTableMetadataRequest {
                schema_name: self.schema_name.clone(),
                table_name: table_name.to_string(),
                partition_info,
            })
            .await?;
        let table = self
            .metadata
            .get_table_info(&self.schema_name, table_name)
            .await?
            .ok_or_else(|| {
                MetaError::not_found(format!(
                    "table metadata {}.{} not found",
                    self.schema_name, table_name
                ))
            })?;

        let current = self.versions.current(shard_node.shard_id)?;
        let latest = self
            .dispatch
            .create_table_on_shard(
                &shard_node.node_name,
                CreateTableOnShardRequest {
                    update_shard_info: UpdateShardInfo {
                        curr_shard_info: shard_info(shard_node.shard_id, current),
                    },
                    table_info: table.clone(),
                    create_if_not_exist: true,
                    options: HashMap::new(),
                },
            )
            .await?;
        let update = ShardVersionUpdate {
            shard_id: shard_node.shard_id,
            latest_version: latest,
        };
        self.metadata.add_table_topology(update, table.id).await?;
        self.versions.commit(shard_node.shard_id, latest);
        debug!("created sub table {}.{}", self.schema_name, table_name);
        Ok(CreateTableResult {
            table,
            shard_version_update: update,
        })
    }

    /// Best-effort removal of tables created before a fan-out error.
    async fn cleanup(&self, created: &[String]) {
        for table_name in created {
            let Ok(shard_node) = self.shard_of(table_name) else {
                continue;
            };
            let Ok(current) = self.versions.current(shard_node.shard_id) else {
                continue;
            };
            let result = self
                .metadata
                .drop_table(MetaDropTableRequest {
                    schema_name: self.schema_name.clone(),
                    table_name: table_name.clone(),
                    version_update: Some(ShardVersionUpdate {
                        shard_id: shard_node.shard_id,
                        latest_version: current + 1,
                    }),
                })
                .await;
            match result {
                Ok(()) => self.versions.commit(shard_node.shard_id, current + 1),
                Err(e) => warn!(
                    "cleanup of sub table {}.{} failed: {}",
                    self.schema_name, table_name, e
                ),
            }
        }
    }

    async fn run(&self) -> Result<CreateTableResult> {
        // Existing parent with a shard mapping means the whole create
        // already succeeded once.
        if let Some(parent) = self
            .metadata
            .get_table(&self.schema_name, &self.table_name)
            .await?
        {
            if self.metadata.get_table_shard(parent.id).await.is_some() {
                return Err(MetaError::already_exists(format!(
                    "table {}.{} already exists",
                    self.schema_name, self.table_name
                )));
            }
        }

        // Fan out the sub tables; on the first error, undo what this run
        // created and fail aggregated.
        let mut created = Vec::with_capacity(self.sub_table_names.len());
        for sub_table in self.sub_table_names.clone() {
            self.meta.check_cancelled()?;
            match self.create_one(&sub_table, None).await {
                Ok(_) => created.push(sub_table),
                Err(e) => {
                    self.cleanup(&created).await;
                    return Err(MetaError::new(
                        e.code,
                        format!(
                            "create partition table {}.{}: sub table {} failed after {} created: {}",
                            self.schema_name,
                            self.table_name,
                            sub_table,
                            created.len(),
                            e.msg
                        ),
                    ));
                }
            }
        }

        self.meta.check_cancelled()?;
        let result = self
            .create_one(
                &self.table_name,
                Some(PartitionInfo {
                    sub_table_names: self.sub_table_names.clone(),
                }),
            )
            .await?;

        for table_name in std::iter::once(&self.table_name).chain(self.sub_table_names.iter()) {
            if let Err(e) = self
                .metadata
                .delete_table_assigned_shard(&self.schema_name, table_name)
                .await
            {
                warn!("delete assigned shard of {} failed: {}", table_name, e);
            }
        }
        Ok(result)
    }
}

#[async_trait]
impl Procedure for CreatePartitionTableProcedure {
    fn id(&self) -> u64 {
        self.id
    }

    fn kind(&self) -> Kind {
        Kind::CreatePartitionTable
    }

    fn related_version_info(&self) -> &RelatedVersionInfo {
        &self.related
    }

    fn params(&self) -> ProcedureParams {
        ProcedureParams::CreatePartitionTable {
            schema_name: self.schema_name.clone(),
            table_name: self.table_name.clone(),
            sub_table_names: self.sub_table_names.clone(),
        }
    }

    async fn start(&self) -> Result<()> {
        self.meta.set(State::Running);
        match self.run().await {
            Ok(result) => {
                if let Some(done) = self.done.lock().take() {
                    let _ = done.send(Ok(result));
                }
                self.meta.set(State::Finished);
                Ok(())
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    fn cancel(&self) {
        self.meta.cancel();
    }

    fn state(&self) -> State {
        self.meta.get()
    }
}

pub struct DropPartitionTableProcedure {
    id: u64,
    schema_name: String,
    table_name: String,
    related: RelatedVersionInfo,
    snapshot: Snapshot,
    metadata: Arc<ClusterMetadata>,
    dispatch: Arc<dyn Dispatch>,
    versions: VersionTracker,
    meta: ProcMeta,
    done: Mutex<Option<DropTableSender>>,
}

impl DropPartitionTableProcedure {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: u64,
        schema_name: String,
        table_name: String,
        involved_shards: Vec<ShardId>,
        snapshot: Snapshot,
        metadata: Arc<ClusterMetadata>,
        dispatch: Arc<dyn Dispatch>,
        done: Option<DropTableSender>,
    ) -> Result<Self> {
        let mut shard_with_version = HashMap::new();
        for shard_id in involved_shards {
            let view = snapshot
                .topology
                .shard_views
                .get(&shard_id)
                .ok_or_else(|| MetaError::not_found(format!("shard {} not found", shard_id)))?;
            shard_with_version.insert(shard_id, view.version);
        }
        let related = RelatedVersionInfo {
            cluster_id: snapshot.topology.cluster_view.cluster_id,
            cluster_version: snapshot.topology.cluster_view.version,
            shard_with_version,
        };
        let versions = VersionTracker::new(&related);
        Ok(Self {
            id,
            schema_name,
            table_name,
            related,
            snapshot,
            metadata,
            dispatch,
            versions,
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

    /// Drop one table if it still exists. Missing tables are fine: a retry
    /// of a partially finished drop must not fail on them.
    async fn drop_one(&self, table_name: &str) -> Result<()> {
        let Some(table) = self
            .metadata
            .get_table_info(&self.schema_name, table_name)
            .await?
        else {
            return Ok(());
        };

        let version_update = match self.metadata.get_table_shard(table.id).await {
            Some(shard_id) => {
                let current = self.versions.current(shard_id)?;
                let latest = match self.snapshot.topology.cluster_view.find_shard_node(shard_id) {
                    Some(shard_node) => {
                        self.dispatch
                            .drop_table_on_shard(
                                &shard_node.node_name,
                                DropTableOnShardRequest {
                                    update_shard_info: UpdateShardInfo {
                                        curr_shard_info: shard_info(shard_id, current),
                                    },
                                    table_info: table.clone(),
                                },
                            )
                            .await?
                    }
                    None => current + 1,
                };
                Some(ShardVersionUpdate {
                    shard_id,
                    latest_version: latest,
                })
            }
            None => None,
        };

        self.metadata
            .drop_table(MetaDropTableRequest {
                schema_name: self.schema_name.clone(),
                table_name: table_name.to_string(),
                version_update,
            })
            .await?;
        if let Some(update) = version_update {
            self.versions.commit(update.shard_id, update.latest_version);
        }
        Ok(())
    }

    async fn run(&self) -> Result<TableInfo> {
        let parent = self
            .metadata
            .get_table_info(&self.schema_name, &self.table_name)
            .await?
            .ok_or_else(|| {
                MetaError::not_found(format!(
                    "table {}.{} not found",
                    self.schema_name, self.table_name
                ))
            })?;
        let sub_table_names = parent
            .partition_info
            .clone()
            .map(|p| p.sub_table_names)
            .unwrap_or_default();

        // Sub tables first, the parent last; a failure keeps the parent so
        // the whole drop can be retried until clean.
        let mut failures = Vec::new();
        for sub_table in &sub_table_names {
            self.meta.check_cancelled()?;
            if let Err(e) = self.drop_one(sub_table).await {
                warn!("drop sub table {}.{} failed: {}", self.schema_name, sub_table, e);
                failures.push(format!("{}: {}", sub_table, e));
            }
        }
        if !failures.is_empty() {
            return Err(MetaError::unavailable(format!(
                "drop partition table {}.{}: {} of {} sub tables failed: {}",
                self.schema_name,
                self.table_name,
                failures.len(),
                sub_table_names.len(),
                failures.join("; ")
            )));
        }

        self.meta.check_cancelled()?;
        self.drop_one(&self.table_name).await?;
        Ok(parent)
    }
}

#[async_trait]
impl Procedure for DropPartitionTableProcedure {
    fn id(&self) -> u64 {
        self.id
    }

    fn kind(&self) -> Kind {
        Kind::DropPartitionTable
    }

    fn related_version_info(&self) -> &RelatedVersionInfo {
        &self.related
    }

    fn params(&self) -> ProcedureParams {
        ProcedureParams::DropPartitionTable {
            schema_name: self.schema_name.clone(),
            table_name: self.table_name.clone(),
        }
    }

    async fn start(&self) -> Result<()> {
        self.meta.set(State::Running);
        match self.run().await {
            Ok(parent) => {
                if let Some(done) = self.done.lock().take() {
                    let _ = done.send(Ok(parent));
                }
                self.meta.set(State::Finished);
                Ok(())
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    fn cancel(&self) {
        self.meta.cancel();
    }

    fn state(&self) -> State {
        self.meta.get()
    }
}
