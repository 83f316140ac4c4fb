//! Procedure factory
//!
//! Builds every procedure kind, allocating procedure IDs from the KV-backed
//! allocator and resolving target shards through the persistent shard
//! picker. The same build paths rebuild persisted in-flight procedures
//! after a leader restart, keeping their original IDs.

use std::sync::Arc;

use tracing::warn;

use super::create_table::CreateTableSender;
use super::drop_table::DropTableSender;
use super::{
    BatchTransferLeaderProcedure, CreatePartitionTableProcedure, CreateTableProcedure,
    DropPartitionTableProcedure, DropTableProcedure, Procedure, ProcedureParams, ProcedureRecord,
    SplitProcedure, TransferLeaderProcedure,
};
use crate::dispatch::Dispatch;
use crate::error::{MetaError, Result};
use crate::id::IdAllocator;
use crate::metadata::{ClusterMetadata, NodeName, PartitionInfo, ShardId, Snapshot};
use crate::picker::{LeastTableShardPicker, PersistShardPicker};

/// Create-table request accepted by the factory
pub struct CreateTableRequest {
    pub schema_name: String,
    pub table_name: String,
    pub partition_table_info: Option<PartitionInfo>,
    pub done: Option<CreateTableSender>,
}

impl CreateTableRequest {
    fn is_partition_table(&self) -> bool {
        self.partition_table_info.is_some()
    }
}

pub struct DropTableRequest {
    pub schema_name: String,
    pub table_name: String,
    pub done: Option<DropTableSender>,
}

pub struct TransferLeaderRequest {
    pub snapshot: Snapshot,
    pub shard_id: ShardId,
    pub old_leader_node: Option<NodeName>,
    pub new_leader_node: NodeName,
}

pub struct SplitRequest {
    pub snapshot: Snapshot,
    pub schema_name: String,
    pub table_names: Vec<String>,
    pub shard_id: ShardId,
    pub new_shard_id: ShardId,
    pub target_node_name: NodeName,
}

pub struct Factory {
    ids: IdAllocator,
    metadata: Arc<ClusterMetadata>,
    dispatch: Arc<dyn Dispatch>,
    picker: PersistShardPicker,
}

impl Factory {
    pub fn new(ids: IdAllocator, metadata: Arc<ClusterMetadata>, dispatch: Arc<dyn Dispatch>) -> Self {
        let picker = PersistShardPicker::new(metadata.clone(), Box::new(LeastTableShardPicker));
        Self {
            ids,
            metadata,
            dispatch,
            picker,
        }
    }

    async fn alloc_procedure_id(&self) -> Result<u64> {
        self.ids.alloc().await
    }

    pub async fn make_create_table_procedure(
        &self,
        request: CreateTableRequest,
    ) -> Result<Arc<dyn Procedure>> {
        let id = self.alloc_procedure_id().await?;
        self.build_create_table(id, request).await
    }

    async fn build_create_table(
        &self,
        id: u64,
        request: CreateTableRequest,
    ) -> Result<Arc<dyn Procedure>> {
        if request.is_partition_table() {
            return self.build_create_partition_table(id, request).await;
        }

        let snapshot = self.metadata.get_cluster_snapshot().await;
        let picked = self
            .picker
            .pick_shards(
                &snapshot,
                &request.schema_name,
                std::slice::from_ref(&request.table_name),
            )
            .await?;
        let shard_id = picked
            .get(&request.table_name)
            .map(|n| n.shard_id)
            .ok_or_else(|| MetaError::internal("shard picker returned no shard"))?;

        let procedure = CreateTableProcedure::new(
            id,
            request.schema_name,
            request.table_name,
            None,
            shard_id,
            snapshot,
            self.metadata.clone(),
            self.dispatch.clone(),
            request.done,
        )?;
        Ok(Arc::new(procedure))
    }

    async fn build_create_partition_table(
        &self,
        id: u64,
        request: CreateTableRequest,
    ) -> Result<Arc<dyn Procedure>> {
        let partition_info = request
            .partition_table_info
            .ok_or_else(|| MetaError::invalid_argument("missing partition info"))?;
        if partition_info.sub_table_names.is_empty() {
            return Err(MetaError::invalid_argument(
                "partition table needs at least one sub table",
            ));
        }

        let snapshot = self.metadata.get_cluster_snapshot().await;
        // One shard per sub table plus one for the parent, sticky across
        // retries.
        let mut names = partition_info.sub_table_names.clone();
        names.push(request.table_name.clone());
        let table_shards = self
            .picker
            .pick_shards(&snapshot, &request.schema_name, &names)
            .await?;

        let procedure = CreatePartitionTableProcedure::new(
            id,
            request.schema_name,
            request.table_name,
            partition_info.sub_table_names,
            table_shards,
            &snapshot,
            self.metadata.clone(),
            self.dispatch.clone(),
            request.done,
        )?;
        Ok(Arc::new(procedure))
    }

    /// Returns `None` when the table does not exist: dropping a nonexistent
    /// table is a successful no-op and no procedure is created.
    pub async fn create_drop_table_procedure(
        &self,
        request: DropTableRequest,
    ) -> Result<Option<Arc<dyn Procedure>>> {
        let id = self.alloc_procedure_id().await?;
        self.build_drop_table(id, request).await
    }

    async fn build_drop_table(
        &self,
        id: u64,
        request: DropTableRequest,
    ) -> Result<Option<Arc<dyn Procedure>>> {
        let Some(table) = self
            .metadata
            .get_table(&request.schema_name, &request.table_name)
            .await?
        else {
            warn!(
                "drop non-existing table {}.{}",
                request.schema_name, request.table_name
            );
            return Ok(None);
        };
        let snapshot = self.metadata.get_cluster_snapshot().await;

        if let Some(partition_info) = &table.partition_info {
            let mut involved = Vec::new();
            for name in partition_info
                .sub_table_names
                .iter()
                .chain(std::iter::once(&request.table_name))
            {
                if let Some(sub) = self
                    .metadata
                    .get_table(&request.schema_name, name)
                    .await?
                {
                    if let Some(shard_id) = self.metadata.get_table_shard(sub.id).await {
                        if !involved.contains(&shard_id) {
                            involved.push(shard_id);
                        }
                    }
                }
            }
            let procedure = DropPartitionTableProcedure::new(
                id,
                request.schema_name,
                request.table_name,
                involved,
                snapshot,
                self.metadata.clone(),
                self.dispatch.clone(),
                request.done,
            )?;
            return Ok(Some(Arc::new(procedure)));
        }

        let shard_id = self.metadata.get_table_shard(table.id).await;
        let procedure = DropTableProcedure::new(
            id,
            request.schema_name,
            request.table_name,
            shard_id,
            snapshot,
            self.metadata.clone(),
            self.dispatch.clone(),
            request.done,
        )?;
        Ok(Some(Arc::new(procedure)))
    }

    pub async fn create_transfer_leader_procedure(
        &self,
        request: TransferLeaderRequest,
    ) -> Result<Arc<TransferLeaderProcedure>> {
        let id = self.alloc_procedure_id().await?;
        let procedure = TransferLeaderProcedure::new(
            id,
            request.shard_id,
            request.old_leader_node,
            request.new_leader_node,
            &request.snapshot,
            self.metadata.clone(),
            self.dispatch.clone(),
        )?;
        Ok(Arc::new(procedure))
    }

    pub async fn create_batch_transfer_leader_procedure(
        &self,
        children: Vec<Arc<TransferLeaderProcedure>>,
    ) -> Result<Arc<dyn Procedure>> {
        let id = self.alloc_procedure_id().await?;
        Ok(Arc::new(BatchTransferLeaderProcedure::new(id, children)?))
    }

    pub async fn create_split_procedure(
        &self,
        request: SplitRequest,
    ) -> Result<Arc<dyn Procedure>> {
        let id = self.alloc_procedure_id().await?;
        let procedure = SplitProcedure::new(
            id,
            request.schema_name,
            request.table_names,
            request.shard_id,
            request.new_shard_id,
            request.target_node_name,
            &request.snapshot,
            self.metadata.clone(),
            self.dispatch.clone(),
        )?;
        Ok(Arc::new(procedure))
    }

    /// Rebuild a persisted in-flight procedure so it can re-run from the
    /// beginning under its original ID. Procedures whose subject is gone
    /// (e.g. a drop of a table that no longer exists) resolve to `None`.
    pub async fn recover_procedure(
        &self,
        record: ProcedureRecord,
    ) -> Result<Option<Arc<dyn Procedure>>> {
        match record.params {
            ProcedureParams::CreateTable {
                schema_name,
                table_name,
                partition_info,
                ..
            } => self
                .build_create_table(
                    record.id,
                    CreateTableRequest {
                        schema_name,
                        table_name,
                        partition_table_info: partition_info,
                        done: None,
                    },
                )
                .await
                .map(Some),
            ProcedureParams::CreatePartitionTable {
                schema_name,
                table_name,
                sub_table_names,
            } => self
                .build_create_table(
                    record.id,
                    CreateTableRequest {
                        schema_name,
                        table_name,
                        partition_table_info: Some(PartitionInfo { sub_table_names }),
                        done: None,
                    },
                )
                .await
                .map(Some),
            ProcedureParams::DropTable {
                schema_name,
                table_name,
                ..
            }
            | ProcedureParams::DropPartitionTable {
                schema_name,
                table_name,
            } => {
                self.build_drop_table(
                    record.id,
                    DropTableRequest {
                        schema_name,
                        table_name,
                        done: None,
                    },
                )
                .await
            }
            ProcedureParams::TransferLeader(params) => {
                let snapshot = self.metadata.get_cluster_snapshot().await;
                let procedure = TransferLeaderProcedure::new(
                    record.id,
                    params.shard_id,
                    params.old_leader_node,
                    params.new_leader_node,
                    &snapshot,
                    self.metadata.clone(),
                    self.dispatch.clone(),
                )?;
                Ok(Some(Arc::new(procedure)))
            }
            ProcedureParams::BatchTransferLeader { transfers } => {
                let snapshot = self.metadata.get_cluster_snapshot().await;
                let mut children = Vec::with_capacity(transfers.len());
                for params in transfers {
                    match TransferLeaderProcedure::new(
                        record.id,
                        params.shard_id,
                        params.old_leader_node,
                        params.new_leader_node,
                        &snapshot,
                        self.metadata.clone(),
                        self.dispatch.clone(),
                    ) {
                        Ok(child) => children.push(Arc::new(child)),
                        Err(e) => warn!(
                            "skip unrecoverable transfer of shard {}: {}",
                            params.shard_id, e
                        ),
                    }
                }
                if children.is_empty() {
                    return Ok(None);
                }
                Ok(Some(Arc::new(BatchTransferLeaderProcedure::new(
                    record.id, children,
                )?)))
            }
            ProcedureParams::Split {
                schema_name,
                table_names,
                shard_id,
                new_shard_id,
                target_node_name,
            } => {
                let snapshot = self.metadata.get_cluster_snapshot().await;
                let procedure = SplitProcedure::new(
                    record.id,
                    schema_name,
                    table_names,
                    shard_id,
                    new_shard_id,
                    target_node_name,
                    &snapshot,
                    self.metadata.clone(),
                    self.dispatch.clone(),
                )?;
                Ok(Some(Arc::new(procedure)))
            }
        }
    }
}
