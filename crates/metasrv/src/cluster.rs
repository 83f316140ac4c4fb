//! Cluster manager
//!
//! The meta server can host several named clusters; each gets its own
//! metadata store, procedure factory/manager and scheduler manager. The
//! manager creates the default cluster from config at bootstrap, opens
//! every cluster when this node becomes leader and shuts them down when
//! leadership is lost.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::dispatch::Dispatch;
use crate::error::{MetaError, Result};
use crate::id::IdAllocator;
use crate::metadata::{
    now_ms, Cluster, ClusterMetadata, CreateClusterOpts, MetaStorage, RegisteredNode, SchemaId,
    TopologyType,
};
use crate::procedure::{Factory, ProcedureManager, ProcedureStorage};
use crate::scheduler::SchedulerManager;

/// Everything needed to run one cluster
pub struct ClusterRuntime {
    metadata: Arc<ClusterMetadata>,
    factory: Arc<Factory>,
    procedure_manager: Arc<ProcedureManager>,
    scheduler_manager: Arc<SchedulerManager>,
}

impl ClusterRuntime {
    fn build(
        cluster: Cluster,
        storage: MetaStorage,
        dispatch: Arc<dyn Dispatch>,
        config: &Config,
    ) -> Self {
        let batch_size = cluster.procedure_executing_batch_size;
        let topology_type = cluster.topology_type;
        let cluster_id = cluster.id;
        let metadata = Arc::new(ClusterMetadata::new(
            cluster,
            storage.clone(),
            config.id_allocator_step,
        ));
        let procedure_ids = IdAllocator::new(
            storage.kv(),
            storage.key_ids(cluster_id, "procedure"),
            config.id_allocator_step,
        );
        let factory = Arc::new(Factory::new(procedure_ids, metadata.clone(), dispatch));
        let procedure_manager = Arc::new(ProcedureManager::new(
            ProcedureStorage::new(storage.clone(), cluster_id),
            batch_size,
        ));
        let scheduler_manager = Arc::new(SchedulerManager::new(
            metadata.clone(),
            procedure_manager.clone(),
            factory.clone(),
            storage,
            topology_type,
            batch_size,
            config.enable_schedule,
        ));
        Self {
            metadata,
            factory,
            procedure_manager,
            scheduler_manager,
        }
    }

    /// Bring the cluster online on the leader: reload the cache, start the
    /// executors and re-run persisted in-flight procedures from the
    /// beginning.
    async fn open(&self) -> Result<()> {
        self.metadata.load().await?;
        self.procedure_manager.clone().start();
        self.scheduler_manager.clone().start().await?;
        self.recover_procedures().await;
        Ok(())
    }

    async fn close(&self) {
        self.procedure_manager.cancel_all();
        self.procedure_manager.stop();
        if let Err(e) = self.scheduler_manager.stop().await {
            error!("stop scheduler manager: {}", e);
        }
    }

    async fn recover_procedures(&self) {
        let records = match self.procedure_manager.list_unfinished().await {
            Ok(records) => records,
            Err(e) => {
                error!("list unfinished procedures: {}", e);
                return;
            }
        };
        for record in records {
            let id = record.id;
            match self.factory.recover_procedure(record).await {
                Ok(Some(procedure)) => {
                    info!("recovered procedure {}", id);
                    if let Err(e) = self.procedure_manager.submit(procedure).await {
                        warn!("resubmit recovered procedure {}: {}", id, e);
                    }
                }
                Ok(None) => info!("procedure {} no longer applies, skipped", id),
                Err(e) => warn!("recover procedure {}: {}", id, e),
            }
        }
    }

    pub fn metadata(&self) -> &Arc<ClusterMetadata> {
        &self.metadata
    }

    pub fn procedure_factory(&self) -> &Arc<Factory> {
        &self.factory
    }

    pub fn procedure_manager(&self) -> &Arc<ProcedureManager> {
        &self.procedure_manager
    }

    pub fn scheduler_manager(&self) -> &Arc<SchedulerManager> {
        &self.scheduler_manager
    }
}

/// Registry of the clusters hosted by this meta server
pub struct ClusterManager {
    storage: MetaStorage,
    dispatch: Arc<dyn Dispatch>,
    config: Config,
    cluster_ids: IdAllocator,
    clusters: RwLock<HashMap<String, Arc<ClusterRuntime>>>,
    running: RwLock<bool>,
}

impl ClusterManager {
    pub fn new(storage: MetaStorage, dispatch: Arc<dyn Dispatch>, config: Config) -> Self {
        let cluster_ids = IdAllocator::new(
            storage.kv(),
            storage.key_cluster_ids(),
            config.id_allocator_step,
        );
        Self {
            storage,
            dispatch,
            config,
            cluster_ids,
            clusters: RwLock::new(HashMap::new()),
            running: RwLock::new(false),
        }
    }

    /// Load persisted clusters and make sure the default cluster exists.
    pub async fn bootstrap(&self) -> Result<()> {
        let persisted = self.storage.list_clusters().await?;
        {
            let mut clusters = self.clusters.write().await;
            for cluster in persisted {
                let name = cluster.name.clone();
                let runtime = Arc::new(ClusterRuntime::build(
                    cluster,
                    self.storage.clone(),
                    self.dispatch.clone(),
                    &self.config,
                ));
                clusters.insert(name, runtime);
            }
        }

        let default_name = self.config.default_cluster_name.clone();
        if self.get_cluster(&default_name).await.is_err() {
            info!("creating default cluster {}", default_name);
            self.create_cluster(
                &default_name,
                CreateClusterOpts {
                    node_count: self.config.default_cluster_node_count,
                    shard_total: self.config.default_cluster_shard_total,
                    topology_type: self.config.topology_type,
                    procedure_executing_batch_size: self.config.procedure_executing_batch_size,
                },
            )
            .await?;
        }
        Ok(())
    }

    pub async fn create_cluster(
        &self,
        name: &str,
        opts: CreateClusterOpts,
    ) -> Result<Arc<ClusterRuntime>> {
        if opts.shard_total == 0 {
            return Err(MetaError::invalid_argument("shard_total must be positive"));
        }
        {
            let clusters = self.clusters.read().await;
            if clusters.contains_key(name) {
                return Err(MetaError::already_exists(format!(
                    "cluster {} already exists",
                    name
                )));
            }
        }

        let id = self.cluster_ids.alloc().await? as u32;
        let cluster = Cluster {
            id,
            name: name.to_string(),
            shard_total: opts.shard_total,
            node_count: opts.node_count,
            topology_type: opts.topology_type,
            procedure_executing_batch_size: opts.procedure_executing_batch_size,
            created_at: now_ms(),
        };
        self.storage.save_cluster(&cluster).await?;

        let runtime = Arc::new(ClusterRuntime::build(
            cluster,
            self.storage.clone(),
            self.dispatch.clone(),
            &self.config,
        ));
        runtime.metadata().init().await?;
        if *self.running.read().await {
            runtime.open().await?;
        }

        let mut clusters = self.clusters.write().await;
        clusters.insert(name.to_string(), runtime.clone());
        info!("cluster {} created with id {}", name, id);
        Ok(runtime)
    }

    pub async fn update_cluster(
        &self,
        name: &str,
        topology_type: TopologyType,
        procedure_executing_batch_size: u32,
    ) -> Result<Cluster> {
        let runtime = self.get_cluster(name).await?;
        runtime
            .metadata()
            .update_cluster(topology_type, procedure_executing_batch_size)
            .await
    }

    pub async fn get_cluster(&self, name: &str) -> Result<Arc<ClusterRuntime>> {
        let clusters = self.clusters.read().await;
        clusters
            .get(name)
            .cloned()
            .ok_or_else(|| MetaError::not_found(format!("cluster {} not found", name)))
    }

    pub async fn list_clusters(&self) -> Vec<Cluster> {
        let clusters = self.clusters.read().await;
        let mut result = Vec::with_capacity(clusters.len());
        for runtime in clusters.values() {
            result.push(runtime.metadata().get_cluster().await);
        }
        result.sort_by_key(|c| c.id);
        result
    }

    /// Open every cluster; called when this node becomes leader.
    pub async fn start_all(&self) {
        {
            let mut running = self.running.write().await;
            if *running {
                return;
            }
            *running = true;
        }
        let clusters = self.clusters.read().await;
        for (name, runtime) in clusters.iter() {
            if let Err(e) = runtime.open().await {
                error!("open cluster {}: {}", name, e);
            }
        }
    }

    /// Shut every cluster down; called when leadership is lost.
    pub async fn stop_all(&self) {
        {
            let mut running = self.running.write().await;
            if !*running {
                return;
            }
            *running = false;
        }
        let clusters = self.clusters.read().await;
        for runtime in clusters.values() {
            runtime.close().await;
        }
    }

    // Service entry points used by the API layer.

    pub async fn register_node(&self, cluster_name: &str, node: RegisteredNode) -> Result<()> {
        let runtime = self.get_cluster(cluster_name).await?;
        runtime.metadata().register_node(node).await
    }

    pub async fn alloc_schema_id(
        &self,
        cluster_name: &str,
        schema_name: &str,
    ) -> Result<SchemaId> {
        let runtime = self.get_cluster(cluster_name).await?;
        let (schema, _) = runtime.metadata().get_or_create_schema(schema_name).await?;
        Ok(schema.id)
    }
}
