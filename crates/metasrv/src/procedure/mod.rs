//! Procedure engine
//!
//! Multi-step cluster operations (DDL, shard moves) run as procedures:
//! deterministic state machines persisted at submit time, fenced by the
//! shard versions they observed at admission, and driven to a terminal
//! state by the manager. Success or failure is reported to the originating
//! caller exactly once through a oneshot channel.

mod create_table;
mod drop_table;
mod factory;
mod manager;
mod partition_table;
mod split;
mod storage;
mod transfer_leader;

pub use create_table::CreateTableProcedure;
pub use drop_table::DropTableProcedure;
pub use factory::{
    CreateTableRequest, DropTableRequest, Factory, SplitRequest, TransferLeaderRequest,
};
pub use manager::ProcedureManager;
pub use partition_table::{CreatePartitionTableProcedure, DropPartitionTableProcedure};
pub use split::SplitProcedure;
pub use storage::{ProcedureRecord, ProcedureStorage};
pub use transfer_leader::{BatchTransferLeaderProcedure, TransferLeaderProcedure};

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{MetaError, Result};
use crate::metadata::{ClusterId, PartitionInfo, ShardId, Snapshot};

/// Procedure lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum State {
    Init,
    Running,
    Finished,
    Failed,
    Cancelled,
}

impl State {
    pub fn is_terminal(self) -> bool {
        matches!(self, State::Finished | State::Failed | State::Cancelled)
    }
}

/// Procedure kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Kind {
    CreateTable,
    DropTable,
    CreatePartitionTable,
    DropPartitionTable,
    TransferLeader,
    Split,
    BatchTransferLeader,
}

/// Execution priority; higher runs first when the queue has a choice
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    High,
    Medium,
    Low,
}

/// Shard versions a procedure observed at admission
///
/// The manager uses the shard set for conflict detection; the procedure
/// itself uses the versions for fenced mutations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelatedVersionInfo {
    pub cluster_id: ClusterId,
    pub cluster_version: u64,
    pub shard_with_version: HashMap<ShardId, u64>,
}

impl RelatedVersionInfo {
    /// Build the single-shard info every DDL procedure needs.
    pub fn for_shard(snapshot: &Snapshot, shard_id: ShardId) -> Result<Self> {
        let shard_view = snapshot
            .topology
            .shard_views
            .get(&shard_id)
            .ok_or_else(|| MetaError::not_found(format!("shard {} not found", shard_id)))?;
        let mut shard_with_version = HashMap::with_capacity(1);
        shard_with_version.insert(shard_id, shard_view.version);
        Ok(Self {
            cluster_id: snapshot.topology.cluster_view.cluster_id,
            cluster_version: snapshot.topology.cluster_view.version,
            shard_with_version,
        })
    }
}

/// Typed payload persisted with each procedure so a restarted leader can
/// rebuild and re-run it from `Begin`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProcedureParams {
    CreateTable {
        schema_name: String,
        table_name: String,
        partition_info: Option<PartitionInfo>,
        shard_id: ShardId,
    },
    DropTable {
        schema_name: String,
        table_name: String,
        shard_id: Option<ShardId>,
    },
    CreatePartitionTable {
        schema_name: String,
        table_name: String,
        sub_table_names: Vec<String>,
    },
    DropPartitionTable {
        schema_name: String,
        table_name: String,
    },
    TransferLeader(TransferLeaderParams),
    BatchTransferLeader {
        transfers: Vec<TransferLeaderParams>,
    },
    Split {
        schema_name: String,
        table_names: Vec<String>,
        shard_id: ShardId,
        new_shard_id: ShardId,
        target_node_name: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferLeaderParams {
    pub shard_id: ShardId,
    pub old_leader_node: Option<String>,
    pub new_leader_node: String,
}

/// A resumable multi-step cluster operation
#[async_trait]
pub trait Procedure: Send + Sync {
    fn id(&self) -> u64;

    fn kind(&self) -> Kind;

    fn priority(&self) -> Priority {
        Priority::Low
    }

    fn related_version_info(&self) -> &RelatedVersionInfo;

    /// Payload persisted alongside the record.
    fn params(&self) -> ProcedureParams;

    /// Run the state machine to completion. Errors leave the procedure in a
    /// terminal state with the failure callback already fired.
    async fn start(&self) -> Result<()>;

    /// Request cooperative cancellation; observed between steps.
    fn cancel(&self);

    fn state(&self) -> State;
}

/// Shared state/cancellation bookkeeping embedded in every procedure
pub(crate) struct ProcMeta {
    state: Mutex<State>,
    cancelled: AtomicBool,
}

impl ProcMeta {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::Init),
            cancelled: AtomicBool::new(false),
        }
    }

    pub fn get(&self) -> State {
        *self.state.lock()
    }

    pub fn set(&self, state: State) {
        *self.state.lock() = state;
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// Errors with `cancelled` when cancellation was requested.
    pub fn check_cancelled(&self) -> Result<()> {
        if self.cancelled.load(Ordering::Acquire) {
            Err(MetaError::cancelled("procedure cancelled"))
        } else {
            Ok(())
        }
    }

    /// Terminal state matching a step error.
    pub fn terminal_for(err: &MetaError) -> State {
        if err.code == crate::error::ErrorCode::Cancelled {
            State::Cancelled
        } else {
            State::Failed
        }
    }
}

/// Errors are not clonable; the completion channel gets a copy built from
/// the code and message.
pub(crate) fn copy_error(err: &MetaError) -> MetaError {
    MetaError::new(err.code, err.msg.clone())
}
