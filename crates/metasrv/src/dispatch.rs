//! Outbound node-event dispatch
//!
//! Procedures drive storage nodes through a small RPC surface: open/close
//! shard and create/drop/open/close table on shard. Requests carry the
//! current shard view so the node can fence stale senders; responses return
//! the node's latest shard version, which procedures feed back into the
//! metadata store.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{MetaError, Result};
use crate::metadata::{ShardId, ShardInfo, TableInfo};

/// Shard view attached to every table-level dispatch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateShardInfo {
    pub curr_shard_info: ShardInfo,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenShardRequest {
    pub shard: ShardInfo,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloseShardRequest {
    pub shard_id: ShardId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateTableOnShardRequest {
    pub update_shard_info: UpdateShardInfo,
    pub table_info: TableInfo,
    pub create_if_not_exist: bool,
    pub options: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DropTableOnShardRequest {
    pub update_shard_info: UpdateShardInfo,
    pub table_info: TableInfo,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenTableOnShardRequest {
    pub update_shard_info: UpdateShardInfo,
    pub table_info: TableInfo,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloseTableOnShardRequest {
    pub update_shard_info: UpdateShardInfo,
    pub table_info: TableInfo,
}

/// Envelope returned by every node-event endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchResponse {
    pub code: u32,
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub latest_shard_version: Option<u64>,
}

/// Node-event RPC client used by procedures
#[async_trait]
pub trait Dispatch: Send + Sync {
    async fn open_shard(&self, addr: &str, req: OpenShardRequest) -> Result<()>;

    async fn close_shard(&self, addr: &str, req: CloseShardRequest) -> Result<()>;

    /// Returns the node's latest shard version after the create.
    async fn create_table_on_shard(
        &self,
        addr: &str,
        req: CreateTableOnShardRequest,
    ) -> Result<u64>;

    /// Returns the node's latest shard version after the drop.
    async fn drop_table_on_shard(&self, addr: &str, req: DropTableOnShardRequest) -> Result<u64>;

    async fn open_table_on_shard(&self, addr: &str, req: OpenTableOnShardRequest) -> Result<()>;

    async fn close_table_on_shard(&self, addr: &str, req: CloseTableOnShardRequest) -> Result<()>;
}

/// HTTP/JSON dispatcher with a per-address client pool
///
/// Clients live in a lock-free map keyed by address; a client whose call
/// fails at the transport level is evicted so the next call redials.
pub struct NodeDispatcher {
    conns: DashMap<String, reqwest::Client>,
    call_timeout: Duration,
}

impl NodeDispatcher {
    pub fn new(call_timeout: Duration) -> Self {
        Self {
            conns: DashMap::new(),
            call_timeout,
        }
    }

    fn client(&self, addr: &str) -> Result<reqwest::Client> {
        if let Some(client) = self.conns.get(addr) {
            return Ok(client.value().clone());
        }
        let client = reqwest::Client::builder()
            .timeout(self.call_timeout)
            .build()
            .map_err(|e| MetaError::internal("build node client").with_cause(e))?;
        self.conns.insert(addr.to_string(), client.clone());
        debug!("dialed node {}", addr);
        Ok(client)
    }

    async fn call<Req: Serialize, Resp: DeserializeOwned>(
        &self,
        addr: &str,
        op: &str,
        req: &Req,
    ) -> Result<Resp> {
        let client = self.client(addr)?;
        let url = format!("http://{}/meta-event/{}", addr, op);
        let resp = match client.post(&url).json(req).send().await {
            Ok(resp) => resp,
            Err(e) => {
                // Broken connection, force a redial on the next call.
                self.conns.remove(addr);
                warn!("node {} unreachable for {}: {}", addr, op, e);
                return Err(
                    MetaError::unavailable(format!("{} dispatch to {} failed", op, addr))
                        .with_cause(e),
                );
            }
        };
        resp.json().await.map_err(|e| {
            MetaError::unavailable(format!("decode {} response from {}", op, addr)).with_cause(e)
        })
    }

    fn check(addr: &str, op: &str, resp: &DispatchResponse) -> Result<()> {
        if resp.code != 0 {
            return Err(MetaError::unavailable(format!(
                "{} dispatch to {} failed, code:{}, err:{}",
                op, addr, resp.code, resp.error
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Dispatch for NodeDispatcher {
    async fn open_shard(&self, addr: &str, req: OpenShardRequest) -> Result<()> {
        let resp: DispatchResponse = self.call(addr, "openShard", &req).await?;
        Self::check(addr, "openShard", &resp)
    }

    async fn close_shard(&self, addr: &str, req: CloseShardRequest) -> Result<()> {
        let resp: DispatchResponse = self.call(addr, "closeShard", &req).await?;
        Self::check(addr, "closeShard", &resp)
    }

    async fn create_table_on_shard(
        &self,
        addr: &str,
        req: CreateTableOnShardRequest,
    ) -> Result<u64> {
        let resp: DispatchResponse = self.call(addr, "createTableOnShard", &req).await?;
        Self::check(addr, "createTableOnShard", &resp)?;
        resp.latest_shard_version.ok_or_else(|| {
            MetaError::unavailable(format!(
                "createTableOnShard response from {} misses latest shard version",
                addr
            ))
        })
    }

    async fn drop_table_on_shard(&self, addr: &str, req: DropTableOnShardRequest) -> Result<u64> {
        let resp: DispatchResponse = self.call(addr, "dropTableOnShard", &req).await?;
        Self::check(addr, "dropTableOnShard", &resp)?;
        resp.latest_shard_version.ok_or_else(|| {
            MetaError::unavailable(format!(
                "dropTableOnShard response from {} misses latest shard version",
                addr
            ))
        })
    }

    async fn open_table_on_shard(&self, addr: &str, req: OpenTableOnShardRequest) -> Result<()> {
        let resp: DispatchResponse = self.call(addr, "openTableOnShard", &req).await?;
        Self::check(addr, "openTableOnShard", &resp)
    }

    async fn close_table_on_shard(&self, addr: &str, req: CloseTableOnShardRequest) -> Result<()> {
        let resp: DispatchResponse = self.call(addr, "closeTableOnShard", &req).await?;
        Self::check(addr, "closeTableOnShard", &resp)
    }
}
