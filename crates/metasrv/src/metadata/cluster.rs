//! Per-cluster metadata store
//!
//! `ClusterMetadata` is the only owner of mutable cluster state. Reads go
//! through snapshots; every mutation takes the writer lock, which also
//! covers the KV commit, so in-memory state never runs ahead of storage.
//! Topology mutations are fenced by shard version: a mutation whose version
//! does not directly succeed the persisted one is rejected as recoverable
//! `version_mismatch`.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{info, warn};

use super::storage::MetaStorage;
use super::{
    now_ms, Cluster, ClusterId, ClusterState, ClusterView, CreateTableMetadataRequest,
    DropTableRequest, GetNodeShardsResult, MigrateTableRequest, NodeName, RegisteredNode,
    RouteEntry, RouteTablesResult, Schema, SchemaId, ShardId, ShardInfo, ShardNode,
    ShardNodeWithVersion, ShardRole, ShardStatus, ShardTables, ShardVersionUpdate, ShardView,
    Snapshot, Table, TableId, TableInfo, Topology, TopologyType,
};
use crate::error::{MetaError, Result};
use crate::id::IdAllocator;

struct TopologyState {
    cluster: Cluster,
    view: ClusterView,
    shard_views: HashMap<ShardId, ShardView>,
    schemas: HashMap<String, Schema>,
    tables: HashMap<SchemaId, HashMap<String, Table>>,
    nodes: HashMap<NodeName, RegisteredNode>,
    assignments: HashMap<(String, String), ShardId>,
}

impl TopologyState {
    fn schema_name(&self, id: SchemaId) -> Option<&str> {
        self.schemas
            .values()
            .find(|s| s.id == id)
            .map(|s| s.name.as_str())
    }

    fn table_info(&self, table: &Table) -> TableInfo {
        TableInfo {
            id: table.id,
            name: table.name.clone(),
            schema_id: table.schema_id,
            schema_name: self.schema_name(table.schema_id).unwrap_or_default().to_string(),
            partition_info: table.partition_info.clone(),
            created_at: table.created_at,
        }
    }

    fn find_table_by_id(&self, id: TableId) -> Option<&Table> {
        self.tables
            .values()
            .flat_map(|by_name| by_name.values())
            .find(|t| t.id == id)
    }

    /// Reported status of a shard, taken from the binding node's last
    /// heartbeat.
    fn reported_status(&self, shard_id: ShardId) -> ShardStatus {
        let Some(shard_node) = self.view.find_shard_node(shard_id) else {
            return ShardStatus::Unknown;
        };
        self.nodes
            .get(&shard_node.node_name)
            .and_then(|n| n.shard_infos.iter().find(|s| s.id == shard_id))
            .map(|s| s.status)
            .unwrap_or(ShardStatus::Unknown)
    }
}

/// The authoritative, versioned metadata of one cluster
pub struct ClusterMetadata {
    cluster_id: ClusterId,
    cluster_name: String,
    storage: MetaStorage,
    state: RwLock<TopologyState>,
    schema_ids: IdAllocator,
    table_ids: IdAllocator,
    shard_ids: IdAllocator,
}

impl ClusterMetadata {
    pub fn new(cluster: Cluster, storage: MetaStorage, id_step: u64) -> Self {
        let kv = storage.kv();
        let schema_ids = IdAllocator::new(
            kv.clone(),
            storage.key_ids(cluster.id, "schema"),
            id_step,
        );
        let table_ids = IdAllocator::new(kv.clone(), storage.key_ids(cluster.id, "table"), id_step);
        let shard_ids = IdAllocator::new(kv, storage.key_ids(cluster.id, "shard"), id_step);
        let cluster_id = cluster.id;
        let cluster_name = cluster.name.clone();
        let view = ClusterView {
            cluster_id,
            version: 0,
            state: ClusterState::Empty,
            shard_nodes: Vec::new(),
        };
        Self {
            cluster_id,
            cluster_name,
            storage,
            state: RwLock::new(TopologyState {
                cluster,
                view,
                shard_views: HashMap::new(),
                schemas: HashMap::new(),
                tables: HashMap::new(),
                nodes: HashMap::new(),
                assignments: HashMap::new(),
            }),
            schema_ids,
            table_ids,
            shard_ids,
        }
    }

    pub fn cluster_id(&self) -> ClusterId {
        self.cluster_id
    }

    pub fn name(&self) -> &str {
        &self.cluster_name
    }

    /// Initialize a freshly created cluster: one empty shard view per shard,
    /// an empty cluster view, and the shard-ID allocator floor above the
    /// pre-created range.
    pub async fn init(&self) -> Result<()> {
        let mut state = self.state.write().await;
        let mut records = vec![(
            self.storage.key_cluster_view(self.cluster_id),
            serde_json::to_vec(&state.view)?,
        )];
        for shard_id in 0..state.cluster.shard_total {
            let view = ShardView {
                shard_id,
                version: 0,
                table_ids: Vec::new(),
            };
            records.push((
                self.storage.key_shard(self.cluster_id, shard_id),
                serde_json::to_vec(&view)?,
            ));
            state.shard_views.insert(shard_id, view);
        }
        records.push((
            self.storage.key_ids(self.cluster_id, "shard"),
            state.cluster.shard_total.to_string().into_bytes(),
        ));
        self.storage.put_records(records).await?;
        info!(
            "initialized cluster {} with {} shards",
            self.cluster_name, state.cluster.shard_total
        );
        Ok(())
    }

    /// Rebuild the in-memory cache from storage. Called once on startup and
    /// after winning an election.
    pub async fn load(&self) -> Result<()> {
        let mut state = self.state.write().await;
        if let Some(view) = self.storage.load_cluster_view(self.cluster_id).await? {
            state.view = view;
        }
        state.shard_views = self
            .storage
            .list_shard_views(self.cluster_id)
            .await?
            .into_iter()
            .map(|v| (v.shard_id, v))
            .collect();
        state.schemas = self
            .storage
            .list_schemas(self.cluster_id)
            .await?
            .into_iter()
            .map(|s| (s.name.clone(), s))
            .collect();
        let mut tables: HashMap<SchemaId, HashMap<String, Table>> = HashMap::new();
        for table in self.storage.list_tables(self.cluster_id).await? {
            tables
                .entry(table.schema_id)
                .or_default()
                .insert(table.name.clone(), table);
        }
        state.tables = tables;
        state.nodes = self
            .storage
            .list_nodes(self.cluster_id)
            .await?
            .into_iter()
            .map(|n| (n.name.clone(), RegisteredNode::new(n, Vec::new())))
            .collect();
        state.assignments = self
            .storage
            .list_assignments(self.cluster_id)
            .await?
            .into_iter()
            .collect();
        info!(
            "loaded cluster {}: {} shards, {} schemas, {} nodes, view version {}",
            self.cluster_name,
            state.shard_views.len(),
            state.schemas.len(),
            state.nodes.len(),
            state.view.version
        );
        Ok(())
    }

    pub async fn get_cluster(&self) -> Cluster {
        self.state.read().await.cluster.clone()
    }

    /// Update the mutable cluster options.
    pub async fn update_cluster(
        &self,
        topology_type: TopologyType,
        procedure_executing_batch_size: u32,
    ) -> Result<Cluster> {
        let mut state = self.state.write().await;
        state.cluster.topology_type = topology_type;
        state.cluster.procedure_executing_batch_size = procedure_executing_batch_size;
        self.storage.save_cluster(&state.cluster).await?;
        Ok(state.cluster.clone())
    }

    /// Point-in-time copy of topology and registered nodes.
    pub async fn get_cluster_snapshot(&self) -> Snapshot {
        let state = self.state.read().await;
        Snapshot {
            topology: Topology {
                cluster_view: state.view.clone(),
                shard_views: state.shard_views.clone(),
            },
            registered_nodes: state.nodes.values().cloned().collect(),
        }
    }

    // Schema and table metadata

    /// Look up a schema by name, allocating it on first use.
    pub async fn get_or_create_schema(&self, schema_name: &str) -> Result<(Schema, bool)> {
        {
            let state = self.state.read().await;
            if let Some(schema) = state.schemas.get(schema_name) {
                return Ok((schema.clone(), false));
            }
        }
        let mut state = self.state.write().await;
        // Re-check under the writer lock, another request may have created it.
        if let Some(schema) = state.schemas.get(schema_name) {
            return Ok((schema.clone(), false));
        }
        let id = self.schema_ids.alloc().await? as SchemaId;
        let schema = Schema {
            id,
            name: schema_name.to_string(),
            created_at: now_ms(),
        };
        self.storage.save_schema(self.cluster_id, &schema).await?;
        state.schemas.insert(schema_name.to_string(), schema.clone());
        info!("created schema {} with id {}", schema_name, id);
        Ok((schema, true))
    }

    pub async fn get_table(&self, schema_name: &str, table_name: &str) -> Result<Option<Table>> {
        let state = self.state.read().await;
        let Some(schema) = state.schemas.get(schema_name) else {
            return Ok(None);
        };
        Ok(state
            .tables
            .get(&schema.id)
            .and_then(|by_name| by_name.get(table_name))
            .cloned())
    }

    pub async fn get_table_info(
        &self,
        schema_name: &str,
        table_name: &str,
    ) -> Result<Option<TableInfo>> {
        let state = self.state.read().await;
        let Some(schema) = state.schemas.get(schema_name) else {
            return Ok(None);
        };
        Ok(state
            .tables
            .get(&schema.id)
            .and_then(|by_name| by_name.get(table_name))
            .map(|t| state.table_info(t)))
    }

    /// Create the table record if it does not exist. Idempotent: a replayed
    /// procedure gets the already-persisted record back.
    pub async fn create_table_metadata(&self, req: CreateTableMetadataRequest) -> Result<Table> {
        let (schema, _) = self.get_or_create_schema(&req.schema_name).await?;
        let mut state = self.state.write().await;
        if let Some(existing) = state
            .tables
            .get(&schema.id)
            .and_then(|by_name| by_name.get(&req.table_name))
        {
            return Ok(existing.clone());
        }
        let id = self.table_ids.alloc().await?;
        let table = Table {
            id,
            schema_id: schema.id,
            name: req.table_name.clone(),
            partition_info: req.partition_info,
            created_at: now_ms(),
        };
        self.storage.save_table(self.cluster_id, &table).await?;
        state
            .tables
            .entry(schema.id)
            .or_default()
            .insert(req.table_name.clone(), table.clone());
        info!(
            "created table metadata {}.{} with id {}",
            req.schema_name, req.table_name, id
        );
        Ok(table)
    }

    /// Drop the table record and, when the hosting shard still exists,
    /// remove the table from its fenced shard view in the same commit.
    pub async fn drop_table(&self, req: DropTableRequest) -> Result<()> {
        let mut state = self.state.write().await;
        let schema_id = state
            .schemas
            .get(&req.schema_name)
            .map(|s| s.id)
            .ok_or_else(|| MetaError::not_found(format!("schema {} not found", req.schema_name)))?;
        let table = state
            .tables
            .get(&schema_id)
            .and_then(|by_name| by_name.get(&req.table_name))
            .cloned()
            .ok_or_else(|| {
                MetaError::not_found(format!(
                    "table {}.{} not found",
                    req.schema_name, req.table_name
                ))
            })?;

        let mut records = Vec::new();
        let mut new_shard_view = None;
        if let Some(update) = req.version_update {
            let view = state.shard_views.get(&update.shard_id).ok_or_else(|| {
                MetaError::not_found(format!("shard {} not found", update.shard_id))
            })?;
            check_version(view, update.latest_version)?;
            let mut view = view.clone();
            view.table_ids.retain(|id| *id != table.id);
            view.version = update.latest_version;
            records.push((
                self.storage.key_shard(self.cluster_id, view.shard_id),
                serde_json::to_vec(&view)?,
            ));
            new_shard_view = Some(view);
        }
        // Table record and shard view change atomically.
        self.storage
            .kv()
            .txn(
                vec![],
                records
                    .into_iter()
                    .map(|(key, value)| kv::Op::Put { key, value })
                    .chain(std::iter::once(kv::Op::Delete {
                        key: self.storage.key_table(self.cluster_id, table.id),
                    }))
                    .collect(),
            )
            .await?;

        if let Some(view) = new_shard_view {
            state.shard_views.insert(view.shard_id, view);
        }
        if let Some(by_name) = state.tables.get_mut(&schema_id) {
            by_name.remove(&req.table_name);
        }
        state
            .assignments
            .remove(&(req.schema_name.clone(), req.table_name.clone()));
        info!("dropped table {}.{}", req.schema_name, req.table_name);
        Ok(())
    }

    /// Record table residency on a shard at the fenced version.
    pub async fn add_table_topology(
        &self,
        update: ShardVersionUpdate,
        table_id: TableId,
    ) -> Result<()> {
        let mut state = self.state.write().await;
        let view = state
            .shard_views
            .get(&update.shard_id)
            .ok_or_else(|| MetaError::not_found(format!("shard {} not found", update.shard_id)))?;
        check_version(view, update.latest_version)?;
        let mut view = view.clone();
        if !view.table_ids.contains(&table_id) {
            view.table_ids.push(table_id);
        }
        view.version = update.latest_version;
        self.storage.save_shard_view(self.cluster_id, &view).await?;
        state.shard_views.insert(update.shard_id, view);
        Ok(())
    }

    /// The shard currently hosting a table, if any.
    pub async fn get_table_shard(&self, table_id: TableId) -> Option<ShardId> {
        let state = self.state.read().await;
        state
            .shard_views
            .values()
            .find(|v| v.table_ids.contains(&table_id))
            .map(|v| v.shard_id)
    }

    // Shards and topology

    /// Allocate a fresh shard ID and materialize its empty view, so the
    /// next snapshot already carries the new shard.
    pub async fn alloc_shard_id(&self) -> Result<ShardId> {
        let id = self.shard_ids.alloc().await? as ShardId;
        self.create_shard_view(id).await?;
        Ok(id)
    }

    /// Create an empty shard view for a newly allocated shard (split).
    pub async fn create_shard_view(&self, shard_id: ShardId) -> Result<()> {
        let mut state = self.state.write().await;
        if state.shard_views.contains_key(&shard_id) {
            return Ok(());
        }
        let view = ShardView {
            shard_id,
            version: 0,
            table_ids: Vec::new(),
        };
        self.storage.save_shard_view(self.cluster_id, &view).await?;
        state.shard_views.insert(shard_id, view);
        Ok(())
    }

    /// Replace the whole cluster view. Bindings are deduplicated by shard,
    /// sorted, and committed with a version bump.
    pub async fn update_cluster_view(
        &self,
        cluster_state: ClusterState,
        mut shard_nodes: Vec<ShardNode>,
    ) -> Result<()> {
        shard_nodes.sort_by_key(|n| n.shard_id);
        if shard_nodes.windows(2).any(|w| w[0].shard_id == w[1].shard_id) {
            return Err(MetaError::invalid_argument(
                "a shard may not be assigned to two nodes",
            ));
        }
        let mut state = self.state.write().await;
        let mut view = state.view.clone();
        view.version += 1;
        view.state = cluster_state;
        view.shard_nodes = shard_nodes;
        self.storage.save_cluster_view(&view).await?;
        info!(
            "cluster {} view updated to version {}, state {:?}",
            self.cluster_name, view.version, view.state
        );
        state.view = view;
        Ok(())
    }

    /// Remove exactly the given bindings from the cluster view.
    pub async fn drop_shard_nodes(&self, dropped: Vec<ShardNode>) -> Result<()> {
        if dropped.is_empty() {
            return Ok(());
        }
        let mut state = self.state.write().await;
        let mut view = state.view.clone();
        let before = view.shard_nodes.len();
        view.shard_nodes.retain(|n| !dropped.contains(n));
        if view.shard_nodes.len() == before {
            return Ok(());
        }
        view.version += 1;
        self.storage.save_cluster_view(&view).await?;
        warn!(
            "cluster {} dropped {} shard nodes, view version {}",
            self.cluster_name,
            before - view.shard_nodes.len(),
            view.version
        );
        state.view = view;
        Ok(())
    }

    /// Move a shard's leader binding to `new_node`, bumping both the cluster
    /// view and the shard view in one commit. Returns the new shard version
    /// for the open dispatch.
    pub async fn transfer_leader(
        &self,
        shard_id: ShardId,
        new_node: &str,
    ) -> Result<ShardVersionUpdate> {
        let mut state = self.state.write().await;
        let shard_view = state
            .shard_views
            .get(&shard_id)
            .ok_or_else(|| MetaError::not_found(format!("shard {} not found", shard_id)))?;
        let mut shard_view = shard_view.clone();
        shard_view.version += 1;

        let mut view = state.view.clone();
        view.shard_nodes.retain(|n| n.shard_id != shard_id);
        view.shard_nodes.push(ShardNode {
            shard_id,
            role: ShardRole::Leader,
            node_name: new_node.to_string(),
        });
        view.shard_nodes.sort_by_key(|n| n.shard_id);
        view.version += 1;

        self.storage
            .put_records(vec![
                (
                    self.storage.key_cluster_view(self.cluster_id),
                    serde_json::to_vec(&view)?,
                ),
                (
                    self.storage.key_shard(self.cluster_id, shard_id),
                    serde_json::to_vec(&shard_view)?,
                ),
            ])
            .await?;

        let update = ShardVersionUpdate {
            shard_id,
            latest_version: shard_view.version,
        };
        state.view = view;
        state.shard_views.insert(shard_id, shard_view);
        Ok(update)
    }

    /// Move tables between two shard views, bumping both versions atomically.
    pub async fn migrate_table(&self, req: MigrateTableRequest) -> Result<()> {
        let mut state = self.state.write().await;
        let schema_id = state
            .schemas
            .get(&req.schema_name)
            .map(|s| s.id)
            .ok_or_else(|| MetaError::not_found(format!("schema {} not found", req.schema_name)))?;
        let mut moved_ids = Vec::with_capacity(req.table_names.len());
        for name in &req.table_names {
            let table = state
                .tables
                .get(&schema_id)
                .and_then(|by_name| by_name.get(name))
                .ok_or_else(|| {
                    MetaError::not_found(format!("table {}.{} not found", req.schema_name, name))
                })?;
            moved_ids.push(table.id);
        }

        let mut old_view = state
            .shard_views
            .get(&req.old_shard_id)
            .cloned()
            .ok_or_else(|| MetaError::not_found(format!("shard {} not found", req.old_shard_id)))?;
        let mut new_view = state
            .shard_views
            .get(&req.new_shard_id)
            .cloned()
            .ok_or_else(|| MetaError::not_found(format!("shard {} not found", req.new_shard_id)))?;

        old_view.table_ids.retain(|id| !moved_ids.contains(id));
        for id in &moved_ids {
            if !new_view.table_ids.contains(id) {
                new_view.table_ids.push(*id);
            }
        }
        old_view.version += 1;
        new_view.version += 1;

        self.storage
            .put_records(vec![
                (
                    self.storage.key_shard(self.cluster_id, old_view.shard_id),
                    serde_json::to_vec(&old_view)?,
                ),
                (
                    self.storage.key_shard(self.cluster_id, new_view.shard_id),
                    serde_json::to_vec(&new_view)?,
                ),
            ])
            .await?;
        state.shard_views.insert(old_view.shard_id, old_view);
        state.shard_views.insert(new_view.shard_id, new_view);
        Ok(())
    }

    // Queries

    pub async fn get_shard_tables(&self, shard_ids: &[ShardId]) -> HashMap<ShardId, ShardTables> {
        let state = self.state.read().await;
        let mut result = HashMap::with_capacity(shard_ids.len());
        for shard_id in shard_ids {
            let Some(view) = state.shard_views.get(shard_id) else {
                continue;
            };
            let tables = view
                .table_ids
                .iter()
                .filter_map(|id| state.find_table_by_id(*id))
                .map(|t| state.table_info(t))
                .collect();
            result.insert(
                *shard_id,
                ShardTables {
                    shard: ShardInfo {
                        id: *shard_id,
                        role: ShardRole::Leader,
                        version: view.version,
                        status: state.reported_status(*shard_id),
                    },
                    tables,
                },
            );
        }
        result
    }

    pub async fn route_tables(&self, schema_name: &str, table_names: &[String]) -> RouteTablesResult {
        let state = self.state.read().await;
        let mut entries = HashMap::new();
        let Some(schema) = state.schemas.get(schema_name) else {
            return RouteTablesResult {
                cluster_view_version: state.view.version,
                entries,
            };
        };
        for name in table_names {
            let Some(table) = state.tables.get(&schema.id).and_then(|t| t.get(name)) else {
                continue;
            };
            let mut node_shards = Vec::new();
            if let Some(view) = state
                .shard_views
                .values()
                .find(|v| v.table_ids.contains(&table.id))
            {
                if let Some(shard_node) = state.view.find_shard_node(view.shard_id) {
                    node_shards.push(ShardNodeWithVersion {
                        shard_info: ShardInfo {
                            id: view.shard_id,
                            role: shard_node.role,
                            version: view.version,
                            status: state.reported_status(view.shard_id),
                        },
                        shard_node: shard_node.clone(),
                    });
                }
            }
            entries.insert(
                name.clone(),
                RouteEntry {
                    table: state.table_info(table),
                    node_shards,
                },
            );
        }
        RouteTablesResult {
            cluster_view_version: state.view.version,
            entries,
        }
    }

    pub async fn get_node_shards(&self) -> GetNodeShardsResult {
        let state = self.state.read().await;
        let node_shards = state
            .view
            .shard_nodes
            .iter()
            .map(|shard_node| ShardNodeWithVersion {
                shard_info: ShardInfo {
                    id: shard_node.shard_id,
                    role: shard_node.role,
                    version: state
                        .shard_views
                        .get(&shard_node.shard_id)
                        .map(|v| v.version)
                        .unwrap_or_default(),
                    status: state.reported_status(shard_node.shard_id),
                },
                shard_node: shard_node.clone(),
            })
            .collect();
        GetNodeShardsResult {
            cluster_topology_version: state.view.version,
            node_shards,
        }
    }

    // Node registry

    /// Record a heartbeat: refresh last-touch, the reported shard list and
    /// the persisted node record. The first heartbeat that completes the
    /// required node count moves the cluster from `empty` to `prepare`.
    pub async fn register_node(&self, registered: RegisteredNode) -> Result<()> {
        let mut state = self.state.write().await;
        self.storage.save_node(self.cluster_id, &registered.node).await?;
        state
            .nodes
            .insert(registered.node.name.clone(), registered);

        if state.view.state == ClusterState::Empty {
            let now = now_ms();
            let alive = state.nodes.values().filter(|n| !n.is_expired(now)).count();
            if alive >= state.cluster.node_count as usize {
                let mut view = state.view.clone();
                view.version += 1;
                view.state = ClusterState::Prepare;
                self.storage.save_cluster_view(&view).await?;
                info!(
                    "cluster {} has {} nodes, entering prepare",
                    self.cluster_name, alive
                );
                state.view = view;
            }
        }
        Ok(())
    }

    pub async fn list_registered_nodes(&self) -> Vec<RegisteredNode> {
        let state = self.state.read().await;
        state.nodes.values().cloned().collect()
    }

    // Sticky table assignments

    /// Pre-committed `(schema, table) -> shard` choice; a retried create
    /// lands on the same shard.
    pub async fn assign_table_to_shard(
        &self,
        schema_name: &str,
        table_name: &str,
        shard_id: ShardId,
    ) -> Result<()> {
        let mut state = self.state.write().await;
        self.storage
            .save_assignment(self.cluster_id, schema_name, table_name, shard_id)
            .await?;
        state
            .assignments
            .insert((schema_name.to_string(), table_name.to_string()), shard_id);
        Ok(())
    }

    /// A sticky assignment is only honored while its shard is still part of
    /// the topology; stale ones are discarded on read.
    pub async fn get_table_assigned_shard(
        &self,
        schema_name: &str,
        table_name: &str,
    ) -> Result<Option<ShardId>> {
        let stale = {
            let state = self.state.read().await;
            match state
                .assignments
                .get(&(schema_name.to_string(), table_name.to_string()))
            {
                Some(shard_id) if state.shard_views.contains_key(shard_id) => {
                    return Ok(Some(*shard_id))
                }
                Some(_) => true,
                None => false,
            }
        };
        if stale {
            warn!(
                "discarding stale shard assignment for {}.{}",
                schema_name, table_name
            );
            self.delete_table_assigned_shard(schema_name, table_name)
                .await?;
        }
        Ok(None)
    }

    pub async fn delete_table_assigned_shard(
        &self,
        schema_name: &str,
        table_name: &str,
    ) -> Result<()> {
        let mut state = self.state.write().await;
        self.storage
            .delete_assignment(self.cluster_id, schema_name, table_name)
            .await?;
        state
            .assignments
            .remove(&(schema_name.to_string(), table_name.to_string()));
        Ok(())
    }
}

fn check_version(view: &ShardView, latest_version: u64) -> Result<()> {
    if latest_version != view.version + 1 {
        return Err(MetaError::version_mismatch(format!(
            "shard {} at version {}, mutation carries {}",
            view.shard_id, view.version, latest_version
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{Node, NodeState};
    use kv::MemKv;

    async fn test_metadata(shard_total: u32, node_count: u32) -> ClusterMetadata {
        let storage = MetaStorage::new(Arc::new(MemKv::new()), "/meta");
        let cluster = Cluster {
            id: 0,
            name: "test".to_string(),
            shard_total,
            node_count,
            topology_type: TopologyType::Static,
            procedure_executing_batch_size: 4,
            created_at: now_ms(),
        };
        let metadata = ClusterMetadata::new(cluster, storage, 10);
        metadata.init().await.unwrap();
        metadata
    }

    fn registered(name: &str) -> RegisteredNode {
        RegisteredNode::new(
            Node {
                name: name.to_string(),
                stats: Default::default(),
                last_touch_time: now_ms(),
                state: NodeState::Online,
            },
            vec![],
        )
    }

    #[tokio::test]
    async fn test_init_creates_shard_views() {
        let metadata = test_metadata(4, 2).await;
        let snapshot = metadata.get_cluster_snapshot().await;
        assert_eq!(snapshot.topology.shard_views.len(), 4);
        assert_eq!(snapshot.topology.cluster_view.state, ClusterState::Empty);
    }

    #[tokio::test]
    async fn test_register_node_moves_empty_to_prepare() {
        let metadata = test_metadata(4, 2).await;

        metadata.register_node(registered("n1")).await.unwrap();
        let snapshot = metadata.get_cluster_snapshot().await;
        assert_eq!(snapshot.topology.cluster_view.state, ClusterState::Empty);

        metadata.register_node(registered("n2")).await.unwrap();
        let snapshot = metadata.get_cluster_snapshot().await;
        assert_eq!(snapshot.topology.cluster_view.state, ClusterState::Prepare);
    }

    #[tokio::test]
    async fn test_create_table_metadata_idempotent() {
        let metadata = test_metadata(4, 1).await;
        let req = CreateTableMetadataRequest {
            schema_name: "public".to_string(),
            table_name: "t1".to_string(),
            partition_info: None,
        };
        let first = metadata.create_table_metadata(req.clone()).await.unwrap();
        let second = metadata.create_table_metadata(req).await.unwrap();
        assert_eq!(first.id, second.id, "retry must not allocate a new table id");
    }

    #[tokio::test]
    async fn test_add_table_topology_fencing() {
        let metadata = test_metadata(4, 1).await;
        let table = metadata
            .create_table_metadata(CreateTableMetadataRequest {
                schema_name: "public".to_string(),
                table_name: "t1".to_string(),
                partition_info: None,
            })
            .await
            .unwrap();

        // Stale version is rejected as recoverable.
        let err = metadata
            .add_table_topology(
                ShardVersionUpdate {
                    shard_id: 0,
                    latest_version: 5,
                },
                table.id,
            )
            .await
            .unwrap_err();
        assert_eq!(err.code, crate::error::ErrorCode::VersionMismatch);
        assert!(err.is_recoverable());

        metadata
            .add_table_topology(
                ShardVersionUpdate {
                    shard_id: 0,
                    latest_version: 1,
                },
                table.id,
            )
            .await
            .unwrap();
        assert_eq!(metadata.get_table_shard(table.id).await, Some(0));

        let snapshot = metadata.get_cluster_snapshot().await;
        assert_eq!(snapshot.topology.shard_views[&0].version, 1);
    }

    #[tokio::test]
    async fn test_table_appears_in_exactly_one_shard_view() {
        let metadata = test_metadata(4, 1).await;
        let table = metadata
            .create_table_metadata(CreateTableMetadataRequest {
                schema_name: "public".to_string(),
                table_name: "t1".to_string(),
                partition_info: None,
            })
            .await
            .unwrap();
        metadata
            .add_table_topology(
                ShardVersionUpdate {
                    shard_id: 2,
                    latest_version: 1,
                },
                table.id,
            )
            .await
            .unwrap();

        let snapshot = metadata.get_cluster_snapshot().await;
        let holders = snapshot
            .topology
            .shard_views
            .values()
            .filter(|v| v.table_ids.contains(&table.id))
            .count();
        assert_eq!(holders, 1);
    }

    #[tokio::test]
    async fn test_drop_table_removes_from_shard_view() {
        let metadata = test_metadata(4, 1).await;
        let table = metadata
            .create_table_metadata(CreateTableMetadataRequest {
                schema_name: "public".to_string(),
                table_name: "t1".to_string(),
                partition_info: None,
            })
            .await
            .unwrap();
        metadata
            .add_table_topology(
                ShardVersionUpdate {
                    shard_id: 0,
                    latest_version: 1,
                },
                table.id,
            )
            .await
            .unwrap();

        metadata
            .drop_table(DropTableRequest {
                schema_name: "public".to_string(),
                table_name: "t1".to_string(),
                version_update: Some(ShardVersionUpdate {
                    shard_id: 0,
                    latest_version: 2,
                }),
            })
            .await
            .unwrap();

        assert!(metadata.get_table("public", "t1").await.unwrap().is_none());
        assert_eq!(metadata.get_table_shard(table.id).await, None);
    }

    #[tokio::test]
    async fn test_update_cluster_view_rejects_double_assignment() {
        let metadata = test_metadata(4, 1).await;
        let err = metadata
            .update_cluster_view(
                ClusterState::Stable,
                vec![
                    ShardNode {
                        shard_id: 0,
                        role: ShardRole::Leader,
                        node_name: "n1".to_string(),
                    },
                    ShardNode {
                        shard_id: 0,
                        role: ShardRole::Leader,
                        node_name: "n2".to_string(),
                    },
                ],
            )
            .await
            .unwrap_err();
        assert_eq!(err.code, crate::error::ErrorCode::InvalidArgument);
    }

    #[tokio::test]
    async fn test_drop_shard_nodes_removes_exact_bindings() {
        let metadata = test_metadata(2, 1).await;
        metadata
            .update_cluster_view(
                ClusterState::Stable,
                vec![
                    ShardNode {
                        shard_id: 0,
                        role: ShardRole::Leader,
                        node_name: "n1".to_string(),
                    },
                    ShardNode {
                        shard_id: 1,
                        role: ShardRole::Leader,
                        node_name: "n2".to_string(),
                    },
                ],
            )
            .await
            .unwrap();
        let before = metadata.get_cluster_snapshot().await;

        metadata
            .drop_shard_nodes(vec![ShardNode {
                shard_id: 0,
                role: ShardRole::Leader,
                node_name: "n1".to_string(),
            }])
            .await
            .unwrap();

        let snapshot = metadata.get_cluster_snapshot().await;
        assert_eq!(snapshot.topology.cluster_view.shard_nodes.len(), 1);
        assert_eq!(snapshot.topology.cluster_view.shard_nodes[0].shard_id, 1);
        assert!(snapshot.topology.cluster_view.version > before.topology.cluster_view.version);
    }

    #[tokio::test]
    async fn test_alloc_shard_id_starts_above_initial_range() {
        let metadata = test_metadata(8, 1).await;
        let id = metadata.alloc_shard_id().await.unwrap();
        assert!(id >= 8, "allocated id {} collides with pre-created shards", id);

        // The new shard is already visible to snapshot readers.
        let snapshot = metadata.get_cluster_snapshot().await;
        assert!(snapshot.topology.shard_views.contains_key(&id));
    }

    #[tokio::test]
    async fn test_stale_assignment_discarded() {
        let metadata = test_metadata(2, 1).await;
        metadata
            .assign_table_to_shard("public", "t1", 99)
            .await
            .unwrap();
        // Shard 99 is not part of the topology, the record must be dropped.
        assert_eq!(
            metadata.get_table_assigned_shard("public", "t1").await.unwrap(),
            None
        );

        metadata.assign_table_to_shard("public", "t1", 1).await.unwrap();
        assert_eq!(
            metadata.get_table_assigned_shard("public", "t1").await.unwrap(),
            Some(1)
        );
    }

    #[tokio::test]
    async fn test_reload_from_storage() {
        let storage = MetaStorage::new(Arc::new(MemKv::new()), "/meta");
        let cluster = Cluster {
            id: 0,
            name: "test".to_string(),
            shard_total: 2,
            node_count: 1,
            topology_type: TopologyType::Static,
            procedure_executing_batch_size: 4,
            created_at: now_ms(),
        };
        let metadata = ClusterMetadata::new(cluster.clone(), storage.clone(), 10);
        metadata.init().await.unwrap();
        let table = metadata
            .create_table_metadata(CreateTableMetadataRequest {
                schema_name: "public".to_string(),
                table_name: "t1".to_string(),
                partition_info: None,
            })
            .await
            .unwrap();

        // A fresh instance over the same storage sees the same state.
        let reloaded = ClusterMetadata::new(cluster, storage, 10);
        reloaded.load().await.unwrap();
        let found = reloaded.get_table("public", "t1").await.unwrap().unwrap();
        assert_eq!(found.id, table.id);
    }
}
