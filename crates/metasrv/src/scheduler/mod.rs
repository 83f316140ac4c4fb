//! Scheduler manager and schedulers
//!
//! Every five seconds the manager takes a fresh snapshot and asks each
//! registered scheduler for a procedure closing the gap between observed
//! and target topology. Which schedulers are registered depends on the
//! topology type: static clusters get the one-shot assignment scheduler,
//! dynamic clusters get the rebalancer; both get the reopen scheduler.

mod manager;
mod nodepicker;
mod rebalanced;
mod reopen;
mod static_topology;

pub use manager::SchedulerManager;
pub use nodepicker::{ConsistentHashNodePicker, NodePicker, NodePickerConfig};
pub use rebalanced::RebalancedShardScheduler;
pub use reopen::ReopenShardScheduler;
pub use static_topology::StaticTopologyShardScheduler;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{MetaError, Result};
use crate::metadata::{NodeName, ShardId, Snapshot};
use crate::procedure::Procedure;

/// Outcome of one scheduler invocation
pub struct ScheduleResult {
    pub procedure: Option<Arc<dyn Procedure>>,
    pub reason: String,
}

impl ScheduleResult {
    pub fn empty() -> Self {
        Self {
            procedure: None,
            reason: String::new(),
        }
    }

    pub fn new(procedure: Arc<dyn Procedure>, reason: String) -> Self {
        Self {
            procedure: Some(procedure),
            reason,
        }
    }
}

/// Pins a shard to a preferred set of nodes
///
/// Dynamic schedulers refuse to move a pinned shard off its target and move
/// it toward the target when possible. Higher priority wins when rules
/// overlap.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardAffinityRule {
    pub shard_id: ShardId,
    pub nodes: Vec<NodeName>,
    pub priority: u32,
}

/// A registered scheduler
///
/// Affinity rules and the enable toggle only make sense for dynamic
/// schedulers; the defaults answer `not_implemented` the way the static
/// scheduler must.
#[async_trait]
pub trait Scheduler: Send + Sync {
    fn name(&self) -> &'static str;

    async fn schedule(&self, snapshot: &Snapshot) -> Result<ScheduleResult>;

    fn update_enable_schedule(&self, _enable: bool) {}

    fn add_shard_affinity_rule(&self, _rule: ShardAffinityRule) -> Result<()> {
        Err(MetaError::not_implemented(format!(
            "{} doesn't support shard affinity",
            self.name()
        )))
    }

    fn remove_shard_affinity_rule(&self, _shard_id: ShardId) -> Result<()> {
        Err(MetaError::not_implemented(format!(
            "{} doesn't support shard affinity",
            self.name()
        )))
    }

    fn list_shard_affinity_rules(&self) -> Result<Vec<ShardAffinityRule>> {
        Err(MetaError::not_implemented(format!(
            "{} doesn't support shard affinity",
            self.name()
        )))
    }
}
