//! Persisted metadata layout
//!
//! Every record is a JSON value under `storage_root_path`:
//!
//! ```text
//! <root>/clusters/ids                                    cluster id allocator
//! <root>/clusters/<cluster_id>/meta                      cluster record
//! <root>/clusters/<cluster_id>/view                      cluster view
//! <root>/clusters/<cluster_id>/schemas/<schema_id>       schema record
//! <root>/clusters/<cluster_id>/tables/<table_id>         table record
//! <root>/clusters/<cluster_id>/shards/<shard_id>         shard view
//! <root>/clusters/<cluster_id>/nodes/<node_name>         last known node state
//! <root>/clusters/<cluster_id>/procedures/<procedure_id> persisted procedure
//! <root>/clusters/<cluster_id>/shard_assignments/<schema>/<table>
//! <root>/clusters/<cluster_id>/affinities/<shard_id>     shard affinity rule
//! <root>/clusters/<cluster_id>/shard_leases/<shard_id>   lease key watched for expiry
//! <root>/leader                                          lease-protected leader address
//! ```

use std::sync::Arc;

use kv::{KvStore, Op};
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::{
    Cluster, ClusterId, ClusterView, Node, NodeName, Schema, ShardId, ShardView, Table, TableId,
};
use crate::error::Result;

/// Typed access to the persisted metadata of one storage root
#[derive(Clone)]
pub struct MetaStorage {
    kv: Arc<dyn KvStore>,
    root: String,
}

impl MetaStorage {
    pub fn new(kv: Arc<dyn KvStore>, root: impl Into<String>) -> Self {
        Self {
            kv,
            root: root.into(),
        }
    }

    pub fn kv(&self) -> Arc<dyn KvStore> {
        self.kv.clone()
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    // Key helpers. Shard and table IDs are zero-padded so lexicographic
    // scan order matches numeric order.

    pub fn key_leader(&self) -> String {
        format!("{}/leader", self.root)
    }

    pub fn key_cluster_ids(&self) -> String {
        format!("{}/clusters/ids", self.root)
    }

    pub fn key_clusters_prefix(&self) -> String {
        format!("{}/clusters/", self.root)
    }

    pub fn key_cluster_meta(&self, cluster: ClusterId) -> String {
        format!("{}/clusters/{}/meta", self.root, cluster)
    }

    pub fn key_cluster_view(&self, cluster: ClusterId) -> String {
        format!("{}/clusters/{}/view", self.root, cluster)
    }

    pub fn key_schema(&self, cluster: ClusterId, schema: u32) -> String {
        format!("{}/clusters/{}/schemas/{:010}", self.root, cluster, schema)
    }

    pub fn key_schemas_prefix(&self, cluster: ClusterId) -> String {
        format!("{}/clusters/{}/schemas/", self.root, cluster)
    }

    pub fn key_table(&self, cluster: ClusterId, table: TableId) -> String {
        format!("{}/clusters/{}/tables/{:020}", self.root, cluster, table)
    }

    pub fn key_tables_prefix(&self, cluster: ClusterId) -> String {
        format!("{}/clusters/{}/tables/", self.root, cluster)
    }

    pub fn key_shard(&self, cluster: ClusterId, shard: ShardId) -> String {
        format!("{}/clusters/{}/shards/{:010}", self.root, cluster, shard)
    }

    pub fn key_shards_prefix(&self, cluster: ClusterId) -> String {
        format!("{}/clusters/{}/shards/", self.root, cluster)
    }

    pub fn key_node(&self, cluster: ClusterId, node: &str) -> String {
        format!("{}/clusters/{}/nodes/{}", self.root, cluster, node)
    }

    pub fn key_nodes_prefix(&self, cluster: ClusterId) -> String {
        format!("{}/clusters/{}/nodes/", self.root, cluster)
    }

    pub fn key_procedure(&self, cluster: ClusterId, procedure: u64) -> String {
        format!(
            "{}/clusters/{}/procedures/{:020}",
            self.root, cluster, procedure
        )
    }

    pub fn key_procedures_prefix(&self, cluster: ClusterId) -> String {
        format!("{}/clusters/{}/procedures/", self.root, cluster)
    }

    pub fn key_assignment(&self, cluster: ClusterId, schema: &str, table: &str) -> String {
        format!(
            "{}/clusters/{}/shard_assignments/{}/{}",
            self.root, cluster, schema, table
        )
    }

    pub fn key_assignments_prefix(&self, cluster: ClusterId) -> String {
        format!("{}/clusters/{}/shard_assignments/", self.root, cluster)
    }

    pub fn key_affinity(&self, cluster: ClusterId, shard: ShardId) -> String {
        format!("{}/clusters/{}/affinities/{:010}", self.root, cluster, shard)
    }

    pub fn key_affinities_prefix(&self, cluster: ClusterId) -> String {
        format!("{}/clusters/{}/affinities/", self.root, cluster)
    }

    pub fn key_shard_leases_prefix(&self, cluster: ClusterId) -> String {
        format!("{}/clusters/{}/shard_leases/", self.root, cluster)
    }

    pub fn key_ids(&self, cluster: ClusterId, name: &str) -> String {
        format!("{}/clusters/{}/ids/{}", self.root, cluster, name)
    }

    // Typed record access

    pub async fn put_record<T: Serialize>(&self, key: &str, record: &T) -> Result<()> {
        let raw = serde_json::to_vec(record)?;
        self.kv.put(key, raw).await?;
        Ok(())
    }

    /// Write several records in one atomic commit.
    pub async fn put_records(&self, records: Vec<(String, Vec<u8>)>) -> Result<()> {
        let ops = records
            .into_iter()
            .map(|(key, value)| Op::Put { key, value })
            .collect();
        self.kv.txn(vec![], ops).await?;
        Ok(())
    }

    pub async fn get_record<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.kv.get(key).await? {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            None => Ok(None),
        }
    }

    pub async fn delete(&self, key: &str) -> Result<()> {
        self.kv.delete(key).await?;
        Ok(())
    }

    pub async fn list_records<T: DeserializeOwned>(&self, prefix: &str) -> Result<Vec<T>> {
        let pairs = self.kv.scan_prefix(prefix, 0).await?;
        let mut records = Vec::with_capacity(pairs.len());
        for (_, raw) in pairs {
            records.push(serde_json::from_slice(&raw)?);
        }
        Ok(records)
    }

    pub async fn list_raw(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        Ok(self.kv.scan_prefix(prefix, 0).await?)
    }

    // Convenience wrappers for the record types written on hot paths.

    pub async fn save_cluster(&self, cluster: &Cluster) -> Result<()> {
        self.put_record(&self.key_cluster_meta(cluster.id), cluster)
            .await
    }

    pub async fn list_clusters(&self) -> Result<Vec<Cluster>> {
        let pairs = self.list_raw(&self.key_clusters_prefix()).await?;
        let mut clusters = Vec::new();
        for (key, raw) in pairs {
            if key.ends_with("/meta") {
                clusters.push(serde_json::from_slice(&raw)?);
            }
        }
        Ok(clusters)
    }

    pub async fn save_cluster_view(&self, view: &ClusterView) -> Result<()> {
        self.put_record(&self.key_cluster_view(view.cluster_id), view)
            .await
    }

    pub async fn load_cluster_view(&self, cluster: ClusterId) -> Result<Option<ClusterView>> {
        self.get_record(&self.key_cluster_view(cluster)).await
    }

    pub async fn save_schema(&self, cluster: ClusterId, schema: &Schema) -> Result<()> {
        self.put_record(&self.key_schema(cluster, schema.id), schema)
            .await
    }

    pub async fn list_schemas(&self, cluster: ClusterId) -> Result<Vec<Schema>> {
        self.list_records(&self.key_schemas_prefix(cluster)).await
    }

    pub async fn save_table(&self, cluster: ClusterId, table: &Table) -> Result<()> {
        self.put_record(&self.key_table(cluster, table.id), table)
            .await
    }

    pub async fn list_tables(&self, cluster: ClusterId) -> Result<Vec<Table>> {
        self.list_records(&self.key_tables_prefix(cluster)).await
    }

    pub async fn save_shard_view(&self, cluster: ClusterId, view: &ShardView) -> Result<()> {
        self.put_record(&self.key_shard(cluster, view.shard_id), view)
            .await
    }

    pub async fn list_shard_views(&self, cluster: ClusterId) -> Result<Vec<ShardView>> {
        self.list_records(&self.key_shards_prefix(cluster)).await
    }

    pub async fn save_node(&self, cluster: ClusterId, node: &Node) -> Result<()> {
        self.put_record(&self.key_node(cluster, &node.name), node)
            .await
    }

    pub async fn list_nodes(&self, cluster: ClusterId) -> Result<Vec<Node>> {
        self.list_records(&self.key_nodes_prefix(cluster)).await
    }

    pub async fn save_assignment(
        &self,
        cluster: ClusterId,
        schema: &str,
        table: &str,
        shard: ShardId,
    ) -> Result<()> {
        self.put_record(&self.key_assignment(cluster, schema, table), &shard)
            .await
    }

    pub async fn delete_assignment(
        &self,
        cluster: ClusterId,
        schema: &str,
        table: &str,
    ) -> Result<()> {
        self.delete(&self.key_assignment(cluster, schema, table))
            .await
    }

    pub async fn list_assignments(
        &self,
        cluster: ClusterId,
    ) -> Result<Vec<((String, String), ShardId)>> {
        let prefix = self.key_assignments_prefix(cluster);
        let pairs = self.list_raw(&prefix).await?;
        let mut assignments = Vec::with_capacity(pairs.len());
        for (key, raw) in pairs {
            let rest = &key[prefix.len()..];
            if let Some((schema, table)) = rest.split_once('/') {
                let shard: ShardId = serde_json::from_slice(&raw)?;
                assignments.push(((schema.to_string(), table.to_string()), shard));
            }
        }
        Ok(assignments)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{ClusterState, TopologyType};
    use kv::MemKv;

    fn storage() -> MetaStorage {
        MetaStorage::new(Arc::new(MemKv::new()), "/meta")
    }

    #[tokio::test]
    async fn test_cluster_roundtrip() {
        let storage = storage();
        let cluster = Cluster {
            id: 1,
            name: "prod".to_string(),
            shard_total: 8,
            node_count: 2,
            topology_type: TopologyType::Static,
            procedure_executing_batch_size: 4,
            created_at: 1,
        };
        storage.save_cluster(&cluster).await.unwrap();

        let clusters = storage.list_clusters().await.unwrap();
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].name, "prod");
    }

    #[tokio::test]
    async fn test_shard_views_scan_in_numeric_order() {
        let storage = storage();
        for shard_id in [11u32, 2, 100] {
            storage
                .save_shard_view(
                    0,
                    &ShardView {
                        shard_id,
                        version: 0,
                        table_ids: vec![],
                    },
                )
                .await
                .unwrap();
        }
        let views = storage.list_shard_views(0).await.unwrap();
        let ids: Vec<ShardId> = views.iter().map(|v| v.shard_id).collect();
        assert_eq!(ids, vec![2, 11, 100]);
    }

    #[tokio::test]
    async fn test_cluster_view_roundtrip() {
        let storage = storage();
        let view = ClusterView {
            cluster_id: 3,
            version: 7,
            state: ClusterState::Prepare,
            shard_nodes: vec![],
        };
        storage.save_cluster_view(&view).await.unwrap();
        let loaded = storage.load_cluster_view(3).await.unwrap().unwrap();
        assert_eq!(loaded.version, 7);
        assert_eq!(loaded.state, ClusterState::Prepare);
    }

    #[tokio::test]
    async fn test_assignments_roundtrip() {
        let storage = storage();
        storage.save_assignment(0, "public", "t1", 5).await.unwrap();
        storage.save_assignment(0, "public", "t2", 6).await.unwrap();

        let assignments = storage.list_assignments(0).await.unwrap();
        assert_eq!(assignments.len(), 2);
        assert!(assignments.contains(&(("public".to_string(), "t1".to_string()), 5)));

        storage.delete_assignment(0, "public", "t1").await.unwrap();
        assert_eq!(storage.list_assignments(0).await.unwrap().len(), 1);
    }
}
