//! Procedure persistence
//!
//! Each procedure is stored under `clusters/<cluster_id>/procedures/<id>`
//! at submit time and updated on every state transition. Records carry the
//! typed params so in-flight procedures survive a leader restart.

use serde::{Deserialize, Serialize};

use super::{Kind, Priority, ProcedureParams, RelatedVersionInfo, State};
use crate::error::{MetaError, Result};
use crate::metadata::{now_ms, ClusterId, MetaStorage};

/// Persisted form of a procedure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcedureRecord {
    pub id: u64,
    pub kind: Kind,
    pub priority: Priority,
    pub state: State,
    pub related_version_info: RelatedVersionInfo,
    pub params: ProcedureParams,
    pub created_at: u64,
}

impl ProcedureRecord {
    pub fn new(procedure: &dyn super::Procedure) -> Self {
        Self {
            id: procedure.id(),
            kind: procedure.kind(),
            priority: procedure.priority(),
            state: procedure.state(),
            related_version_info: procedure.related_version_info().clone(),
            params: procedure.params(),
            created_at: now_ms(),
        }
    }
}

/// Typed store of procedure records for one cluster
#[derive(Clone)]
pub struct ProcedureStorage {
    storage: MetaStorage,
    cluster_id: ClusterId,
}

impl ProcedureStorage {
    pub fn new(storage: MetaStorage, cluster_id: ClusterId) -> Self {
        Self {
            storage,
            cluster_id,
        }
    }

    pub async fn save(&self, record: &ProcedureRecord) -> Result<()> {
        let key = self.storage.key_procedure(self.cluster_id, record.id);
        self.storage.put_record(&key, record).await
    }

    pub async fn update_state(&self, id: u64, state: State) -> Result<()> {
        let key = self.storage.key_procedure(self.cluster_id, id);
        let mut record: ProcedureRecord = self
            .storage
            .get_record(&key)
            .await?
            .ok_or_else(|| MetaError::not_found(format!("procedure {} not found", id)))?;
        record.state = state;
        self.storage.put_record(&key, &record).await
    }

    /// Records whose procedure has not reached a terminal state, in ID order.
    pub async fn list_unfinished(&self) -> Result<Vec<ProcedureRecord>> {
        let records: Vec<ProcedureRecord> = self
            .storage
            .list_records(&self.storage.key_procedures_prefix(self.cluster_id))
            .await?;
        Ok(records
            .into_iter()
            .filter(|r| !r.state.is_terminal())
            .collect())
    }

    pub async fn list(&self) -> Result<Vec<ProcedureRecord>> {
        self.storage
            .list_records(&self.storage.key_procedures_prefix(self.cluster_id))
            .await
    }
}
