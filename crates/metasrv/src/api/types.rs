//! HTTP request/response types
//!
//! Every response is wrapped in the `{code, msg, data}` envelope; code 0
//! means OK, anything else is an error-taxonomy code with a message.

use serde::{Deserialize, Serialize};

use crate::error::MetaError;
use crate::metadata::{
    PartitionInfo, ShardId, ShardInfo, ShardStatus, TableInfo, TopologyType,
};

/// Response envelope shared by every endpoint
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub code: u32,
    pub msg: String,
    pub data: Option<T>,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            code: 0,
            msg: String::new(),
            data: Some(data),
        }
    }

    pub fn err(err: &MetaError) -> Self {
        Self {
            code: err.code.as_u32(),
            msg: err.to_string(),
            data: None,
        }
    }
}

// Meta service surface (storage nodes)

#[derive(Debug, Deserialize)]
pub struct NodeHeartbeatRequest {
    pub cluster_name: String,
    pub endpoint: String,
    #[serde(default)]
    pub lease: u32,
    #[serde(default)]
    pub zone: String,
    #[serde(default)]
    pub binary_version: String,
    #[serde(default)]
    pub shard_infos: Vec<ShardInfo>,
}

#[derive(Debug, Deserialize)]
pub struct AllocSchemaIdRequest {
    pub cluster_name: String,
    pub name: String,
}

#[derive(Debug, Serialize)]
pub struct AllocSchemaIdResponse {
    pub name: String,
    pub id: u32,
}

#[derive(Debug, Deserialize)]
pub struct GetTablesOfShardsRequest {
    pub cluster_name: String,
    #[serde(default)]
    pub shard_ids: Vec<ShardId>,
}

#[derive(Debug, Deserialize)]
pub struct CreateTableRequest {
    pub cluster_name: String,
    pub schema_name: String,
    pub name: String,
    #[serde(default)]
    pub partition_table_info: Option<PartitionInfo>,
}

#[derive(Debug, Serialize)]
pub struct CreateTableResponse {
    pub created_table: TableInfo,
    pub shard_info: ShardInfo,
}

#[derive(Debug, Deserialize)]
pub struct DropTableRequest {
    pub cluster_name: String,
    pub schema_name: String,
    pub name: String,
}

#[derive(Debug, Serialize)]
pub struct DropTableResponse {
    pub dropped_table: Option<TableInfo>,
}

#[derive(Debug, Deserialize)]
pub struct RouteRequest {
    pub cluster_name: String,
    pub schema_name: String,
    pub tables: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct GetNodesRequest {
    pub cluster_name: String,
}

// Admin surface

#[derive(Debug, Deserialize)]
pub struct GetShardTablesRequest {
    pub cluster_name: String,
    /// Empty means every shard in the cluster.
    #[serde(default)]
    pub shard_ids: Vec<ShardId>,
}

#[derive(Debug, Deserialize)]
pub struct TransferLeaderRequest {
    pub cluster_name: String,
    pub shard_id: ShardId,
    #[serde(default)]
    pub old_leader_node_name: String,
    pub new_leader_node_name: String,
}

#[derive(Debug, Deserialize)]
pub struct SplitRequest {
    pub cluster_name: String,
    pub schema_name: String,
    pub shard_id: ShardId,
    pub split_tables: Vec<String>,
    pub node_name: String,
}

#[derive(Debug, Serialize)]
pub struct SplitResponse {
    pub new_shard_id: ShardId,
}

#[derive(Debug, Deserialize)]
pub struct DropNodeShardsRequest {
    pub cluster_name: String,
    pub shard_ids: Vec<ShardId>,
}

#[derive(Debug, Deserialize)]
pub struct CreateClusterRequest {
    pub name: String,
    pub node_count: u32,
    pub shard_total: u32,
    #[serde(default = "default_topology_type")]
    pub topology_type: TopologyType,
    #[serde(default = "default_batch_size")]
    pub procedure_executing_batch_size: u32,
}

fn default_topology_type() -> TopologyType {
    TopologyType::Static
}

fn default_batch_size() -> u32 {
    4
}

#[derive(Debug, Deserialize)]
pub struct UpdateClusterRequest {
    pub topology_type: TopologyType,
    pub procedure_executing_batch_size: u32,
}

#[derive(Debug, Deserialize)]
pub struct RemoveShardAffinitiesRequest {
    pub shard_ids: Vec<ShardId>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateEnableScheduleRequest {
    pub enable: bool,
}

#[derive(Debug, Serialize)]
pub struct DiagnoseShardEntry {
    pub shard_id: ShardId,
    pub node_name: String,
    pub status: ShardStatus,
}

#[derive(Debug, Serialize)]
pub struct DiagnoseShardsResult {
    /// Shards without a binding or whose node does not report them
    pub unregistered_shards: Vec<ShardId>,
    pub registered_shards: Vec<DiagnoseShardEntry>,
}
