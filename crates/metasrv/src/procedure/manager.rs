//! Procedure manager
//!
//! Owns the submitted-procedure queue and the executor. A submission is
//! rejected when its related shard set intersects any queued or running
//! procedure; admitted procedures are persisted, then executed with up to
//! `procedure_executing_batch_size` running concurrently. Procedures over
//! disjoint shard sets run in parallel; those sharing a shard serialize
//! through the conflict check.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{error, info, warn};

use super::storage::{ProcedureRecord, ProcedureStorage};
use super::{Procedure, State};
use crate::error::{MetaError, Result};
use crate::metadata::ShardId;

struct Queued {
    procedure: Arc<dyn Procedure>,
}

#[derive(Default)]
struct Inner {
    queue: Vec<Queued>,
    queued_shards: HashMap<ShardId, u64>,
    running_shards: HashMap<ShardId, u64>,
    running: usize,
    live: HashMap<u64, Arc<dyn Procedure>>,
}

impl Inner {
    fn conflicts(&self, procedure: &dyn Procedure) -> Option<u64> {
        for shard_id in procedure.related_version_info().shard_with_version.keys() {
            if let Some(other) = self.queued_shards.get(shard_id) {
                return Some(*other);
            }
            if let Some(other) = self.running_shards.get(shard_id) {
                return Some(*other);
            }
        }
        None
    }

    /// Best runnable candidate: highest priority first, then submission
    /// order; skips anything conflicting with a running procedure.
    fn take_runnable(&mut self) -> Option<Arc<dyn Procedure>> {
        let mut best: Option<usize> = None;
        for (i, queued) in self.queue.iter().enumerate() {
            let conflict = queued
                .procedure
                .related_version_info()
                .shard_with_version
                .keys()
                .any(|shard| self.running_shards.contains_key(shard));
            if conflict {
                continue;
            }
            match best {
                Some(b)
                    if (self.queue[b].procedure.priority(), self.queue[b].procedure.id())
                        <= (queued.procedure.priority(), queued.procedure.id()) => {}
                _ => best = Some(i),
            }
        }
        let i = best?;
        let queued = self.queue.remove(i);
        let id = queued.procedure.id();
        for shard_id in queued
            .procedure
            .related_version_info()
            .shard_with_version
            .keys()
        {
            self.queued_shards.remove(shard_id);
            self.running_shards.insert(*shard_id, id);
        }
        self.running += 1;
        Some(queued.procedure)
    }

    fn release(&mut self, procedure: &dyn Procedure) {
        for shard_id in procedure.related_version_info().shard_with_version.keys() {
            self.running_shards.remove(shard_id);
        }
        self.running -= 1;
        self.live.remove(&procedure.id());
    }
}

/// Admission, persistence and concurrent execution of procedures
pub struct ProcedureManager {
    batch_size: usize,
    storage: ProcedureStorage,
    inner: Mutex<Inner>,
    notify: Notify,
    handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl ProcedureManager {
    pub fn new(storage: ProcedureStorage, batch_size: u32) -> Self {
        Self {
            batch_size: batch_size as usize,
            storage,
            inner: Mutex::new(Inner::default()),
            notify: Notify::new(),
            handle: Mutex::new(None),
        }
    }

    /// Persist and enqueue a procedure. Rejected when its shard set
    /// conflicts with an in-flight procedure.
    pub async fn submit(&self, procedure: Arc<dyn Procedure>) -> Result<()> {
        {
            let inner = self.inner.lock();
            if let Some(other) = inner.conflicts(procedure.as_ref()) {
                return Err(MetaError::already_exists(format!(
                    "procedure {} conflicts with in-flight procedure {} on shared shards",
                    procedure.id(),
                    other
                )));
            }
        }

        let record = ProcedureRecord::new(procedure.as_ref());
        self.storage.save(&record).await?;

        {
            let mut inner = self.inner.lock();
            // Re-check: another submission may have won the race while the
            // record was being written.
            if let Some(other) = inner.conflicts(procedure.as_ref()) {
                return Err(MetaError::already_exists(format!(
                    "procedure {} conflicts with in-flight procedure {} on shared shards",
                    procedure.id(),
                    other
                )));
            }
            let id = procedure.id();
            for shard_id in procedure.related_version_info().shard_with_version.keys() {
                inner.queued_shards.insert(*shard_id, id);
            }
            inner.live.insert(id, procedure.clone());
            inner.queue.push(Queued { procedure });
        }
        info!("procedure {} submitted, kind {:?}", record.id, record.kind);
        self.notify.notify_one();
        Ok(())
    }

    /// Start the executor task.
    pub fn start(self: Arc<Self>) {
        let manager = self.clone();
        let handle = tokio::spawn(async move {
            loop {
                manager.clone().drain();
                manager.notify.notified().await;
            }
        });
        *self.handle.lock() = Some(handle);
    }

    pub fn stop(&self) {
        if let Some(handle) = self.handle.lock().take() {
            handle.abort();
        }
    }

    fn drain(self: Arc<Self>) {
        loop {
            let procedure = {
                let mut inner = self.inner.lock();
                if inner.running >= self.batch_size {
                    return;
                }
                match inner.take_runnable() {
                    Some(p) => p,
                    None => return,
                }
            };
            let manager = self.clone();
            tokio::spawn(async move {
                manager.run_one(procedure).await;
            });
        }
    }

    async fn run_one(self: Arc<Self>, procedure: Arc<dyn Procedure>) {
        let id = procedure.id();
        if let Err(e) = self.storage.update_state(id, State::Running).await {
            error!("persist running state of procedure {}: {}", id, e);
        }

        match procedure.start().await {
            Ok(()) => info!("procedure {} finished", id),
            Err(e) => warn!("procedure {} failed: {}", id, e),
        }

        let terminal = procedure.state();
        if let Err(e) = self.storage.update_state(id, terminal).await {
            error!("persist terminal state of procedure {}: {}", id, e);
        }

        self.inner.lock().release(procedure.as_ref());
        self.notify.notify_one();
    }

    /// Cooperatively cancel everything in flight; used on leadership loss.
    pub fn cancel_all(&self) {
        let inner = self.inner.lock();
        for procedure in inner.live.values() {
            procedure.cancel();
        }
    }

    pub async fn list(&self) -> Result<Vec<ProcedureRecord>> {
        self.storage.list().await
    }

    pub async fn list_unfinished(&self) -> Result<Vec<ProcedureRecord>> {
        self.storage.list_unfinished().await
    }
}
