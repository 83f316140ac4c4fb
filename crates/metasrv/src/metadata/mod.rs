//! Cluster metadata model
//!
//! Defines the persisted records (clusters, shards, schemas, tables, nodes),
//! the versioned topology views and the immutable snapshot handed to
//! schedulers and procedures.

mod cluster;
mod storage;

pub use cluster::ClusterMetadata;
pub use storage::MetaStorage;

use std::collections::HashMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::MetaError;

/// Cluster ID
pub type ClusterId = u32;
/// Shard ID, unique within a cluster
pub type ShardId = u32;
/// Schema ID
pub type SchemaId = u32;
/// Table ID, never reused
pub type TableId = u64;
/// Node name, doubles as the node's reachable endpoint (host:port)
pub type NodeName = String;

pub const MIN_SHARD_ID: ShardId = 0;

/// Fallback liveness lease when a node does not report one
pub const DEFAULT_LEASE_SEC: u32 = 10;

/// Role of a shard replica
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShardRole {
    Leader,
    Follower,
}

/// Open state of a shard as reported by its owning node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShardStatus {
    Unknown,
    Ready,
    PartialOpen,
    Frozen,
}

/// Cluster lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterState {
    Empty,
    Prepare,
    Stable,
}

/// Scheduling strategy of a cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TopologyType {
    /// Shards are assigned once by the static scheduler
    Static,
    /// The meta server rebalances shards continuously
    Dynamic,
}

impl std::str::FromStr for TopologyType {
    type Err = MetaError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "static" => Ok(TopologyType::Static),
            "dynamic" => Ok(TopologyType::Dynamic),
            _ => Err(MetaError::invalid_argument(format!(
                "unknown topology type: {}",
                raw
            ))),
        }
    }
}

impl std::fmt::Display for TopologyType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TopologyType::Static => write!(f, "static"),
            TopologyType::Dynamic => write!(f, "dynamic"),
        }
    }
}

/// Node liveness state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    Online,
    Offline,
}

/// Persisted cluster record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cluster {
    pub id: ClusterId,
    pub name: String,
    /// Total number of shards, fixed at creation
    pub shard_total: u32,
    /// Number of nodes required before assignment starts
    pub node_count: u32,
    pub topology_type: TopologyType,
    pub procedure_executing_batch_size: u32,
    pub created_at: u64,
}

/// Binding of a shard to a node; the full sorted set forms the cluster view
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardNode {
    pub shard_id: ShardId,
    pub role: ShardRole,
    pub node_name: NodeName,
}

/// Persisted cluster view: shard-node bindings plus a monotonic version
///
/// `shard_nodes` stays sorted by shard ID so lookups can binary-search;
/// the `(version, shard_nodes)` pair only ever changes atomically.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterView {
    pub cluster_id: ClusterId,
    pub version: u64,
    pub state: ClusterState,
    pub shard_nodes: Vec<ShardNode>,
}

impl ClusterView {
    pub fn find_shard_node(&self, shard_id: ShardId) -> Option<&ShardNode> {
        self.shard_nodes
            .binary_search_by_key(&shard_id, |n| n.shard_id)
            .ok()
            .map(|i| &self.shard_nodes[i])
    }
}

/// Persisted shard view: resident table IDs plus a monotonic version
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardView {
    pub shard_id: ShardId,
    pub version: u64,
    pub table_ids: Vec<TableId>,
}

/// Persisted schema record, unique by name within a cluster
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schema {
    pub id: SchemaId,
    pub name: String,
    pub created_at: u64,
}

/// Partition layout of a partition table: the parent plus its sub tables
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionInfo {
    pub sub_table_names: Vec<String>,
}

/// Persisted table record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Table {
    pub id: TableId,
    pub schema_id: SchemaId,
    pub name: String,
    pub partition_info: Option<PartitionInfo>,
    pub created_at: u64,
}

impl Table {
    pub fn is_partition_table(&self) -> bool {
        self.partition_info.is_some()
    }
}

/// Static facts a node reports about itself
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeStats {
    /// Liveness lease in seconds
    pub lease: u32,
    pub zone: String,
    pub node_version: String,
}

/// Persisted node record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub name: NodeName,
    pub stats: NodeStats,
    /// Milliseconds since epoch of the latest heartbeat
    pub last_touch_time: u64,
    pub state: NodeState,
}

/// Runtime view of a shard carried in heartbeats and dispatch requests
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardInfo {
    pub id: ShardId,
    pub role: ShardRole,
    /// Shard view version
    pub version: u64,
    /// Open state, drives the reopen scheduler
    pub status: ShardStatus,
}

/// A node plus the shard list it reported last
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisteredNode {
    pub node: Node,
    pub shard_infos: Vec<ShardInfo>,
}

impl RegisteredNode {
    pub fn new(node: Node, shard_infos: Vec<ShardInfo>) -> Self {
        Self { node, shard_infos }
    }

    /// A node is expired once its heartbeat lease has run out.
    pub fn is_expired(&self, now_ms: u64) -> bool {
        let lease = if self.node.stats.lease == 0 {
            DEFAULT_LEASE_SEC
        } else {
            self.node.stats.lease
        };
        now_ms > self.node.last_touch_time + u64::from(lease) * 1000
    }
}

/// Current milliseconds since epoch
pub fn now_ms() -> u64 {
    Utc::now().timestamp_millis() as u64
}

/// Cluster view plus every shard view
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Topology {
    pub cluster_view: ClusterView,
    pub shard_views: HashMap<ShardId, ShardView>,
}

/// Immutable point-in-time copy of the topology and the node registry
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub topology: Topology,
    pub registered_nodes: Vec<RegisteredNode>,
}

impl Snapshot {
    /// Assignment is finished when every shard has a binding and every
    /// binding's node reports the shard ready.
    pub fn is_prepare_finished(&self) -> bool {
        if self.topology.cluster_view.state != ClusterState::Prepare {
            return false;
        }
        let now = now_ms();
        for shard_view in self.topology.shard_views.values() {
            let Some(shard_node) = self.topology.cluster_view.find_shard_node(shard_view.shard_id)
            else {
                return false;
            };
            let ready = self.registered_nodes.iter().any(|n| {
                n.node.name == shard_node.node_name
                    && !n.is_expired(now)
                    && n.shard_infos
                        .iter()
                        .any(|s| s.id == shard_view.shard_id && s.status == ShardStatus::Ready)
            });
            if !ready {
                return false;
            }
        }
        true
    }
}

/// Expected-to-new shard version carried by every fenced mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardVersionUpdate {
    pub shard_id: ShardId,
    /// The version the mutation commits; must directly succeed the
    /// persisted one.
    pub latest_version: u64,
}

/// Flattened table description used in responses and dispatch requests
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableInfo {
    pub id: TableId,
    pub name: String,
    pub schema_id: SchemaId,
    pub schema_name: String,
    pub partition_info: Option<PartitionInfo>,
    pub created_at: u64,
}

/// Tables resident on one shard
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardTables {
    pub shard: ShardInfo,
    pub tables: Vec<TableInfo>,
}

/// Shard binding paired with its runtime view
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardNodeWithVersion {
    pub shard_info: ShardInfo,
    pub shard_node: ShardNode,
}

/// Route of a single table: where its shard currently lives
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteEntry {
    pub table: TableInfo,
    pub node_shards: Vec<ShardNodeWithVersion>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteTablesResult {
    pub cluster_view_version: u64,
    pub entries: HashMap<String, RouteEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetNodeShardsResult {
    pub cluster_topology_version: u64,
    pub node_shards: Vec<ShardNodeWithVersion>,
}

/// Request for [`ClusterMetadata::create_table_metadata`]
#[derive(Debug, Clone)]
pub struct CreateTableMetadataRequest {
    pub schema_name: String,
    pub table_name: String,
    pub partition_info: Option<PartitionInfo>,
}

/// Request for [`ClusterMetadata::drop_table`]
#[derive(Debug, Clone)]
pub struct DropTableRequest {
    pub schema_name: String,
    pub table_name: String,
    /// Fenced shard-view update; `None` when the hosting shard is gone and
    /// only the metadata needs cleanup.
    pub version_update: Option<ShardVersionUpdate>,
}

/// Request for [`ClusterMetadata::migrate_table`], used by shard split
#[derive(Debug, Clone)]
pub struct MigrateTableRequest {
    pub schema_name: String,
    pub table_names: Vec<String>,
    pub old_shard_id: ShardId,
    pub new_shard_id: ShardId,
}

/// Result returned to a create-table caller
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateTableResult {
    pub table: TableInfo,
    pub shard_version_update: ShardVersionUpdate,
}

/// Options for creating a cluster
#[derive(Debug, Clone)]
pub struct CreateClusterOpts {
    pub node_count: u32,
    pub shard_total: u32,
    pub topology_type: TopologyType,
    pub procedure_executing_batch_size: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_node(name: &str, last_touch_time: u64, lease: u32) -> RegisteredNode {
        RegisteredNode::new(
            Node {
                name: name.to_string(),
                stats: NodeStats {
                    lease,
                    zone: String::new(),
                    node_version: String::new(),
                },
                last_touch_time,
                state: NodeState::Online,
            },
            vec![],
        )
    }

    #[test]
    fn test_node_expiry() {
        let node = make_node("n1", 1_000, 10);
        assert!(!node.is_expired(1_000));
        assert!(!node.is_expired(11_000));
        assert!(node.is_expired(11_001));
    }

    #[test]
    fn test_node_expiry_default_lease() {
        let node = make_node("n1", 0, 0);
        assert!(node.is_expired(u64::from(DEFAULT_LEASE_SEC) * 1000 + 1));
    }

    #[test]
    fn test_find_shard_node_binary_search() {
        let view = ClusterView {
            cluster_id: 0,
            version: 1,
            state: ClusterState::Stable,
            shard_nodes: vec![
                ShardNode {
                    shard_id: 0,
                    role: ShardRole::Leader,
                    node_name: "n1".to_string(),
                },
                ShardNode {
                    shard_id: 2,
                    role: ShardRole::Leader,
                    node_name: "n2".to_string(),
                },
                ShardNode {
                    shard_id: 5,
                    role: ShardRole::Leader,
                    node_name: "n1".to_string(),
                },
            ],
        };
        assert_eq!(view.find_shard_node(2).unwrap().node_name, "n2");
        assert!(view.find_shard_node(3).is_none());
    }
}
