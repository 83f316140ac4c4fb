//! Meta server - cluster control plane
//!
//! Leader-elected coordinator of a distributed time-series database:
//! owns the authoritative table/shard/node topology, drives DDL and shard
//! operations as resumable procedures, and reconciles observed cluster
//! state toward the target topology.
//!
//! # Usage example
//! ```ignore
//! use metasrv::{Config, MetaSrv};
//!
//! let config = Config::load(Some("meta.toml"))?;
//! let srv = MetaSrv::new(config).await?;
//! srv.run().await?;
//! ```

pub mod api;
pub mod cluster;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod id;
pub mod limiter;
pub mod member;
pub mod metadata;
pub mod picker;
pub mod procedure;
pub mod scheduler;
pub mod watch;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kv::MemKv;
use tracing::{error, info};

use api::ApiState;
use cluster::ClusterManager;
use config::Config;
use dispatch::NodeDispatcher;
use error::{MetaError, Result};
use limiter::FlowLimiter;
use member::{ForwardClient, LeadershipListener, Member};
use metadata::MetaStorage;

/// The meta server process
pub struct MetaSrv {
    config: Config,
    kv: Arc<MemKv>,
    cluster_manager: Arc<ClusterManager>,
    member: Arc<Member>,
    limiter: Arc<FlowLimiter>,
}

/// Opens and closes the hosted clusters as leadership moves
struct ClusterLifecycle {
    cluster_manager: Arc<ClusterManager>,
}

#[async_trait]
impl LeadershipListener for ClusterLifecycle {
    async fn on_elected(&self) {
        // Only the leader creates the default cluster; followers pick the
        // persisted record up when they get elected later.
        if let Err(e) = self.cluster_manager.bootstrap().await {
            error!("cluster bootstrap failed: {}", e);
            return;
        }
        self.cluster_manager.start_all().await;
    }

    async fn on_lost(&self) {
        self.cluster_manager.stop_all().await;
    }
}

impl MetaSrv {
    pub async fn new(config: Config) -> Result<Self> {
        let kv = Arc::new(MemKv::new());
        let storage = MetaStorage::new(kv.clone(), config.storage_root_path.clone());
        let dispatch = Arc::new(NodeDispatcher::new(config.grpc_handle_timeout()));
        let cluster_manager = Arc::new(ClusterManager::new(
            storage.clone(),
            dispatch,
            config.clone(),
        ));
        let member = Arc::new(Member::new(
            config.endpoint(),
            kv.clone(),
            storage.key_leader(),
            config.lease(),
        ));
        let limiter = Arc::new(FlowLimiter::new(config.flow_limiter));

        info!(
            "meta server initialized: endpoint {}, storage root {}, topology {}",
            config.endpoint(),
            config.storage_root_path,
            config.topology_type
        );
        Ok(Self {
            config,
            kv,
            cluster_manager,
            member,
            limiter,
        })
    }

    pub fn cluster_manager(&self) -> &Arc<ClusterManager> {
        &self.cluster_manager
    }

    pub fn member(&self) -> &Arc<Member> {
        &self.member
    }

    /// Start the background tasks and serve HTTP until a shutdown signal.
    pub async fn run(self) -> Result<()> {
        let _sweeper = self.kv.clone().start_sweeper(Duration::from_millis(100));
        self.member.clone().start(Arc::new(ClusterLifecycle {
            cluster_manager: self.cluster_manager.clone(),
        }));

        let forward = Arc::new(ForwardClient::new(
            self.member.clone(),
            self.config.grpc_handle_timeout(),
        )?);
        let state = ApiState {
            cluster_manager: self.cluster_manager.clone(),
            forward,
            limiter: self.limiter.clone(),
            handle_timeout: self.config.grpc_handle_timeout(),
            max_request_bytes: self.config.max_request_bytes,
        };
        let app = api::router(state);

        let listen_addr = format!("{}:{}", self.config.addr, self.config.http_port);
        let listener = tokio::net::TcpListener::bind(&listen_addr)
            .await
            .map_err(|e| {
                MetaError::unavailable(format!("bind http listener on {}", listen_addr))
                    .with_cause(e)
            })?;
        info!("http api listening on {}", listen_addr);

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await
            .map_err(|e| MetaError::internal("http server failed").with_cause(e))?;

        info!("shutting down");
        self.member.stop();
        self.cluster_manager.stop_all().await;
        Ok(())
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("listen for shutdown signal: {}", e);
    }
}
