//! Drop-table procedure
//!
//! `Begin -> Waiting -> Finish | Failed`. One prepare step locates the
//! shard hosting the table and dispatches the drop; when the shard is gone
//! (a half-created table) only the metadata is cleaned up. The factory
//! returns no procedure at all for a nonexistent table, so the request
//! succeeds as a no-op.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::debug;

use super::{copy_error, Kind, ProcMeta, Procedure, ProcedureParams, RelatedVersionInfo, State};
use crate::dispatch::{Dispatch, DropTableOnShardRequest, UpdateShardInfo};
use crate::error::{MetaError, Result};
use crate::metadata::{
    ClusterMetadata, DropTableRequest as MetaDropTableRequest, ShardId, ShardInfo, ShardRole,
    ShardStatus, ShardVersionUpdate, Snapshot, TableInfo,
};

pub type DropTableSender = oneshot::Sender<Result<TableInfo>>;

pub struct DropTableProcedure {
    id: u64,
    schema_name: String,
    table_name: String,
    /// Hosting shard at admission; `None` when only metadata is left.
    shard_id: Option<ShardId>,
    related: RelatedVersionInfo,
    snapshot: Snapshot,
    metadata: Arc<ClusterMetadata>,
    dispatch: Arc<dyn Dispatch>,
    meta: ProcMeta,
    done: Mutex<Option<DropTableSender>>,
}

impl DropTableProcedure {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: u64,
        schema_name: String,
        table_name: String,
        shard_id: Option<ShardId>,
        snapshot: Snapshot,
        metadata: Arc<ClusterMetadata>,
        dispatch: Arc<dyn Dispatch>,
        done: Option<DropTableSender>,
    ) -> Result<Self> {
        let related = match shard_id {
            Some(shard_id) => RelatedVersionInfo::for_shard(&snapshot, shard_id)?,
            None => RelatedVersionInfo {
                cluster_id: snapshot.topology.cluster_view.cluster_id,
                cluster_version: snapshot.topology.cluster_view.version,
                shard_with_version: Default::default(),
            },
        };
        Ok(Self {
            id,
            schema_name,
            table_name,
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

    async fn prepare(&self) -> Result<TableInfo> {
        let table = self
            .metadata
            .get_table_info(&self.schema_name, &self.table_name)
            .await?
            .ok_or_else(|| {
                MetaError::not_found(format!(
                    "table {}.{} not found",
                    self.schema_name, self.table_name
                ))
            })?;

        let Some(shard_id) = self.shard_id else {
            // The hosting shard is gone; the create never fully succeeded.
            // Delete the leftover metadata so the name becomes usable again.
            self.metadata
                .drop_table(MetaDropTableRequest {
                    schema_name: self.schema_name.clone(),
                    table_name: self.table_name.clone(),
                    version_update: None,
                })
                .await?;
            return Ok(table);
        };

        let expected_version = self.related.shard_with_version[&shard_id];
        let latest_version = match self.snapshot.topology.cluster_view.find_shard_node(shard_id) {
            Some(shard_node) => {
                self.dispatch
                    .drop_table_on_shard(
                        &shard_node.node_name,
                        DropTableOnShardRequest {
                            update_shard_info: UpdateShardInfo {
                                curr_shard_info: ShardInfo {
                                    id: shard_id,
                                    role: ShardRole::Leader,
                                    version: expected_version,
                                    status: ShardStatus::Unknown,
                                },
                            },
                            table_info: table.clone(),
                        },
                    )
                    .await?
            }
            // Unassigned shard: nothing to dispatch, only the fenced
            // metadata cleanup remains.
            None => expected_version + 1,
        };
        debug!(
            "dispatched dropTableOnShard, table {}, procedure {}",
            self.table_name, self.id
        );

        self.metadata
            .drop_table(MetaDropTableRequest {
                schema_name: self.schema_name.clone(),
                table_name: self.table_name.clone(),
                version_update: Some(ShardVersionUpdate {
                    shard_id,
                    latest_version,
                }),
            })
            .await?;
        debug!("drop table finished, table {}, procedure {}", self.table_name, self.id);
        Ok(table)
    }
}

#[async_trait]
impl Procedure for DropTableProcedure {
    fn id(&self) -> u64 {
        self.id
    }

    fn kind(&self) -> Kind {
        Kind::DropTable
    }

    fn related_version_info(&self) -> &RelatedVersionInfo {
        &self.related
    }

    fn params(&self) -> ProcedureParams {
        ProcedureParams::DropTable {
            schema_name: self.schema_name.clone(),
            table_name: self.table_name.clone(),
            shard_id: self.shard_id,
        }
    }

    async fn start(&self) -> Result<()> {
        self.meta.set(State::Running);
        if let Err(e) = self.meta.check_cancelled() {
            return Err(self.fail(e));
        }
        match self.prepare().await {
            Ok(table) => {
                if let Some(done) = self.done.lock().take() {
                    let _ = done.send(Ok(table));
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
