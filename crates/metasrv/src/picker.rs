//! Shard picking for new tables
//!
//! New tables land on the assigned shard with the fewest tables, ties broken
//! by shard ID. The persistent wrapper records the choice so a retried
//! create-table keeps hitting the same shard.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{MetaError, Result};
use crate::metadata::{ClusterMetadata, ShardNode, Snapshot};

/// Picks target shards for new tables
#[async_trait]
pub trait ShardPicker: Send + Sync {
    /// Pick `expect` shards from the assigned ones. Picks repeat in
    /// round-robin order when `expect` exceeds the number of assigned shards.
    async fn pick_shards(&self, snapshot: &Snapshot, expect: usize) -> Result<Vec<ShardNode>>;
}

/// Always selects the assigned shard currently holding the fewest tables
pub struct LeastTableShardPicker;

#[async_trait]
impl ShardPicker for LeastTableShardPicker {
    async fn pick_shards(&self, snapshot: &Snapshot, expect: usize) -> Result<Vec<ShardNode>> {
        let shard_nodes = &snapshot.topology.cluster_view.shard_nodes;
        if shard_nodes.is_empty() {
            return Err(MetaError::precondition_failed(
                "node number not enough, no shard is assigned",
            ));
        }

        // Only shards that have been assigned to a node are candidates.
        let mut candidates: Vec<ShardNode> = shard_nodes.clone();
        candidates.sort_by_key(|shard_node| {
            let table_count = snapshot
                .topology
                .shard_views
                .get(&shard_node.shard_id)
                .map(|v| v.table_ids.len())
                .unwrap_or(0);
            (table_count, shard_node.shard_id)
        });

        let mut picked = Vec::with_capacity(expect);
        for i in 0..expect {
            picked.push(candidates[i % candidates.len()].clone());
        }
        Ok(picked)
    }
}

/// Wrapper persisting each `(schema, table) -> shard` choice
///
/// A create-table that fails mid-procedure and retries must land on the
/// shard it originally picked, otherwise the node-side create and the
/// metadata commit could diverge.
pub struct PersistShardPicker {
    metadata: Arc<ClusterMetadata>,
    inner: Box<dyn ShardPicker>,
}

impl PersistShardPicker {
    pub fn new(metadata: Arc<ClusterMetadata>, inner: Box<dyn ShardPicker>) -> Self {
        Self { metadata, inner }
    }

    /// Pick one shard per table name, honoring previously persisted picks.
    pub async fn pick_shards(
        &self,
        snapshot: &Snapshot,
        schema_name: &str,
        table_names: &[String],
    ) -> Result<HashMap<String, ShardNode>> {
        let mut result = HashMap::with_capacity(table_names.len());
        let mut missing = Vec::new();

        for name in table_names {
            match self
                .metadata
                .get_table_assigned_shard(schema_name, name)
                .await?
            {
                Some(shard_id) => {
                    let shard_node = snapshot
                        .topology
                        .cluster_view
                        .find_shard_node(shard_id)
                        .cloned()
                        .ok_or_else(|| {
                            MetaError::not_found(format!(
                                "assigned shard {} has no node binding",
                                shard_id
                            ))
                        })?;
                    result.insert(name.clone(), shard_node);
                }
                None => missing.push(name.clone()),
            }
        }

        let picked = self.inner.pick_shards(snapshot, missing.len()).await?;
        for (name, shard_node) in missing.into_iter().zip(picked) {
            self.metadata
                .assign_table_to_shard(schema_name, &name, shard_node.shard_id)
                .await?;
            result.insert(name, shard_node);
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{
        ClusterId, ClusterState, ClusterView, ShardId, ShardRole, ShardView, Topology,
    };

    fn snapshot(assigned: &[(ShardId, &str)], table_counts: &[(ShardId, usize)]) -> Snapshot {
        let shard_nodes = assigned
            .iter()
            .map(|(shard_id, node)| ShardNode {
                shard_id: *shard_id,
                role: ShardRole::Leader,
                node_name: node.to_string(),
            })
            .collect();
        let mut shard_views = HashMap::new();
        for (shard_id, count) in table_counts {
            shard_views.insert(
                *shard_id,
                ShardView {
                    shard_id: *shard_id,
                    version: 0,
                    table_ids: (0..*count as u64).collect(),
                },
            );
        }
        Snapshot {
            topology: Topology {
                cluster_view: ClusterView {
                    cluster_id: 0 as ClusterId,
                    version: 1,
                    state: ClusterState::Stable,
                    shard_nodes,
                },
                shard_views,
            },
            registered_nodes: vec![],
        }
    }

    #[tokio::test]
    async fn test_no_assigned_shard_is_an_error() {
        let picker = LeastTableShardPicker;
        let snapshot = snapshot(&[], &[(0, 0)]);
        let err = picker.pick_shards(&snapshot, 1).await.unwrap_err();
        assert_eq!(err.code, crate::error::ErrorCode::PreconditionFailed);
        assert!(err.to_string().contains("node number not enough"));
    }

    #[tokio::test]
    async fn test_picks_least_loaded_shard() {
        let picker = LeastTableShardPicker;
        let snapshot = snapshot(
            &[(0, "n1"), (1, "n2"), (2, "n1")],
            &[(0, 5), (1, 2), (2, 9)],
        );
        let picked = picker.pick_shards(&snapshot, 1).await.unwrap();
        assert_eq!(picked[0].shard_id, 1);
    }

    #[tokio::test]
    async fn test_tie_breaks_by_shard_id() {
        let picker = LeastTableShardPicker;
        let snapshot = snapshot(&[(3, "n1"), (0, "n2"), (7, "n1")], &[(3, 1), (0, 1), (7, 1)]);
        let picked = picker.pick_shards(&snapshot, 2).await.unwrap();
        assert_eq!(picked[0].shard_id, 0);
        assert_eq!(picked[1].shard_id, 3);
    }

    #[tokio::test]
    async fn test_round_robin_beyond_shard_count() {
        let picker = LeastTableShardPicker;
        let snapshot = snapshot(&[(0, "n1"), (1, "n2")], &[(0, 0), (1, 1)]);
        let picked = picker.pick_shards(&snapshot, 5).await.unwrap();
        assert_eq!(picked.len(), 5);
        assert_eq!(picked[0].shard_id, 0);
        assert_eq!(picked[1].shard_id, 1);
        assert_eq!(picked[2].shard_id, 0);
    }
}
