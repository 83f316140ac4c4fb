//! HTTP management and meta-service API
//!
//! All endpoints live under `/api/v1` (debug endpoints under `/debug`).
//! Handlers are thin translators: decode the request, find the cluster,
//! drive the metadata store or the procedure engine, wrap the outcome in
//! the response envelope.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Path, Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use serde::Serialize;
use tokio::sync::oneshot;
use tracing::{info, warn};

use super::types::*;
use crate::cluster::ClusterManager;
use crate::config::FlowLimiterConfig;
use crate::error::MetaError;
use crate::limiter::FlowLimiter;
use crate::member::ForwardClient;
use crate::metadata::{
    now_ms, CreateClusterOpts, Node, NodeState, NodeStats, RegisteredNode, ShardId, ShardInfo,
    ShardRole, ShardStatus,
};
use crate::procedure::{
    CreateTableRequest as ProcCreateTableRequest, DropTableRequest as ProcDropTableRequest,
    SplitRequest as ProcSplitRequest, TransferLeaderRequest as ProcTransferLeaderRequest,
};
use crate::scheduler::ShardAffinityRule;

/// Endpoints always answered by the receiving node, leader or not.
const LOCAL_PATHS: &[&str] = &["/api/v1/health", "/debug/leader"];

#[derive(Clone)]
pub struct ApiState {
    pub cluster_manager: Arc<ClusterManager>,
    pub forward: Arc<ForwardClient>,
    pub limiter: Arc<FlowLimiter>,
    pub handle_timeout: Duration,
    pub max_request_bytes: usize,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        // Meta service (storage nodes)
        .route("/api/v1/nodeHeartbeat", post(node_heartbeat))
        .route("/api/v1/allocSchemaId", post(alloc_schema_id))
        .route("/api/v1/getTablesOfShards", post(get_tables_of_shards))
        .route("/api/v1/createTable", post(create_table))
        .route("/api/v1/dropTable", post(drop_table))
        .route("/api/v1/route", post(route))
        .route("/api/v1/getNodes", post(get_nodes))
        // Admin
        .route("/api/v1/getShardTables", post(get_shard_tables))
        .route("/api/v1/transferLeader", post(transfer_leader))
        .route("/api/v1/split", post(split))
        .route("/api/v1/table", delete(admin_drop_table))
        .route("/api/v1/getNodeShards", post(get_node_shards))
        .route("/api/v1/nodeShards", delete(drop_node_shards))
        .route("/api/v1/flowLimiter", get(get_flow_limiter).put(update_flow_limiter))
        .route("/api/v1/health", get(health))
        .route("/api/v1/clusters", get(list_clusters).post(create_cluster))
        .route("/api/v1/clusters/:name", put(update_cluster))
        .route("/api/v1/clusters/:name/procedure", get(list_procedures))
        .route(
            "/api/v1/clusters/:name/shardAffinities",
            get(list_shard_affinities)
                .post(add_shard_affinities)
                .delete(remove_shard_affinities),
        )
        .route(
            "/api/v1/clusters/:name/enableSchedule",
            get(get_enable_schedule).put(update_enable_schedule),
        )
        // Debug
        .route("/debug/leader", get(get_leader))
        .route("/debug/diagnose/:name/shards", get(diagnose_shards))
        .layer(middleware::from_fn_with_state(state.clone(), forward_to_leader))
        .with_state(state)
}

fn ok_response<T: Serialize>(data: T) -> Response {
    (StatusCode::OK, Json(ApiResponse::ok(data))).into_response()
}

fn err_response(err: &MetaError) -> Response {
    let status =
        StatusCode::from_u16(err.code.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(ApiResponse::<serde_json::Value>::err(err))).into_response()
}

/// Proxy mutating requests on a non-leader to the leader, relaying the
/// response as-is.
async fn forward_to_leader(State(state): State<ApiState>, req: Request, next: Next) -> Response {
    if state.forward.member().is_leader() {
        return next.run(req).await;
    }
    let path = req.uri().path().to_string();
    if LOCAL_PATHS.contains(&path.as_str()) {
        return next.run(req).await;
    }

    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|p| p.as_str().to_string())
        .unwrap_or(path);
    let method = match reqwest::Method::from_bytes(req.method().as_str().as_bytes()) {
        Ok(method) => method,
        Err(_) => return err_response(&MetaError::invalid_argument("unsupported method")),
    };
    let content_type = req
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string());
    let body = match axum::body::to_bytes(req.into_body(), state.max_request_bytes).await {
        Ok(body) => body.to_vec(),
        Err(_) => return err_response(&MetaError::invalid_argument("request body too large")),
    };

    match state
        .forward
        .forward(method, &path_and_query, content_type, body)
        .await
    {
        Ok(resp) => {
            let mut builder = axum::http::Response::builder()
                .status(StatusCode::from_u16(resp.status).unwrap_or(StatusCode::BAD_GATEWAY));
            if let Some(content_type) = resp.content_type {
                builder = builder.header(header::CONTENT_TYPE, content_type);
            }
            builder
                .body(Body::from(resp.body))
                .unwrap_or_else(|_| err_response(&MetaError::internal("relay leader response")))
        }
        Err(e) => err_response(&e),
    }
}

// Meta service handlers

async fn node_heartbeat(
    State(state): State<ApiState>,
    Json(req): Json<NodeHeartbeatRequest>,
) -> Response {
    info!(
        "[NodeHeartbeat] cluster {}, node {}, {} shards",
        req.cluster_name,
        req.endpoint,
        req.shard_infos.len()
    );
    let registered = RegisteredNode::new(
        Node {
            name: req.endpoint,
            stats: NodeStats {
                lease: req.lease,
                zone: req.zone,
                node_version: req.binary_version,
            },
            last_touch_time: now_ms(),
            state: NodeState::Online,
        },
        req.shard_infos,
    );
    match state
        .cluster_manager
        .register_node(&req.cluster_name, registered)
        .await
    {
        Ok(()) => ok_response(()),
        Err(e) => err_response(&e),
    }
}

async fn alloc_schema_id(
    State(state): State<ApiState>,
    Json(req): Json<AllocSchemaIdRequest>,
) -> Response {
    info!("[AllocSchemaID] cluster {}, schema {}", req.cluster_name, req.name);
    match state
        .cluster_manager
        .alloc_schema_id(&req.cluster_name, &req.name)
        .await
    {
        Ok(id) => ok_response(AllocSchemaIdResponse { name: req.name, id }),
        Err(e) => err_response(&e),
    }
}

async fn get_tables_of_shards(
    State(state): State<ApiState>,
    Json(req): Json<GetTablesOfShardsRequest>,
) -> Response {
    let runtime = match state.cluster_manager.get_cluster(&req.cluster_name).await {
        Ok(runtime) => runtime,
        Err(e) => return err_response(&e),
    };
    let shard_ids = if req.shard_ids.is_empty() {
        let snapshot = runtime.metadata().get_cluster_snapshot().await;
        snapshot.topology.shard_views.keys().copied().collect()
    } else {
        req.shard_ids
    };
    ok_response(runtime.metadata().get_shard_tables(&shard_ids).await)
}

async fn create_table(
    State(state): State<ApiState>,
    Json(req): Json<CreateTableRequest>,
) -> Response {
    if let Err(e) = state.limiter.take() {
        return err_response(&e);
    }
    info!(
        "[CreateTable] cluster {}, table {}.{}",
        req.cluster_name, req.schema_name, req.name
    );
    let runtime = match state.cluster_manager.get_cluster(&req.cluster_name).await {
        Ok(runtime) => runtime,
        Err(e) => return err_response(&e),
    };

    let (tx, rx) = oneshot::channel();
    let procedure = match runtime
        .procedure_factory()
        .make_create_table_procedure(ProcCreateTableRequest {
            schema_name: req.schema_name,
            table_name: req.name,
            partition_table_info: req.partition_table_info,
            done: Some(tx),
        })
        .await
    {
        Ok(procedure) => procedure,
        Err(e) => return err_response(&e),
    };
    if let Err(e) = runtime.procedure_manager().submit(procedure).await {
        return err_response(&e);
    }

    match tokio::time::timeout(state.handle_timeout, rx).await {
        Ok(Ok(Ok(result))) => ok_response(CreateTableResponse {
            created_table: result.table,
            shard_info: ShardInfo {
                id: result.shard_version_update.shard_id,
                role: ShardRole::Leader,
                version: result.shard_version_update.latest_version,
                status: ShardStatus::Ready,
            },
        }),
        Ok(Ok(Err(e))) => err_response(&e),
        Ok(Err(_)) => err_response(&MetaError::internal("create table callback dropped")),
        Err(_) => err_response(&MetaError::unavailable("create table timed out")),
    }
}

async fn drop_table_inner(state: &ApiState, req: DropTableRequest) -> Response {
    if let Err(e) = state.limiter.take() {
        return err_response(&e);
    }
    info!(
        "[DropTable] cluster {}, table {}.{}",
        req.cluster_name, req.schema_name, req.name
    );
    let runtime = match state.cluster_manager.get_cluster(&req.cluster_name).await {
        Ok(runtime) => runtime,
        Err(e) => return err_response(&e),
    };

    let (tx, rx) = oneshot::channel();
    let procedure = match runtime
        .procedure_factory()
        .create_drop_table_procedure(ProcDropTableRequest {
            schema_name: req.schema_name,
            table_name: req.name,
            done: Some(tx),
        })
        .await
    {
        Ok(Some(procedure)) => procedure,
        // The table does not exist: a successful no-op.
        Ok(None) => return ok_response(DropTableResponse { dropped_table: None }),
        Err(e) => return err_response(&e),
    };
    if let Err(e) = runtime.procedure_manager().submit(procedure).await {
        return err_response(&e);
    }

    match tokio::time::timeout(state.handle_timeout, rx).await {
        Ok(Ok(Ok(table))) => ok_response(DropTableResponse {
            dropped_table: Some(table),
        }),
        Ok(Ok(Err(e))) => err_response(&e),
        Ok(Err(_)) => err_response(&MetaError::internal("drop table callback dropped")),
        Err(_) => err_response(&MetaError::unavailable("drop table timed out")),
    }
}

async fn drop_table(State(state): State<ApiState>, Json(req): Json<DropTableRequest>) -> Response {
    drop_table_inner(&state, req).await
}

async fn route(State(state): State<ApiState>, Json(req): Json<RouteRequest>) -> Response {
    if let Err(e) = state.limiter.take() {
        return err_response(&e);
    }
    let runtime = match state.cluster_manager.get_cluster(&req.cluster_name).await {
        Ok(runtime) => runtime,
        Err(e) => return err_response(&e),
    };
    ok_response(
        runtime
            .metadata()
            .route_tables(&req.schema_name, &req.tables)
            .await,
    )
}

async fn get_nodes(State(state): State<ApiState>, Json(req): Json<GetNodesRequest>) -> Response {
    let runtime = match state.cluster_manager.get_cluster(&req.cluster_name).await {
        Ok(runtime) => runtime,
        Err(e) => return err_response(&e),
    };
    ok_response(runtime.metadata().get_node_shards().await)
}

// Admin handlers

async fn get_shard_tables(
    State(state): State<ApiState>,
    Json(req): Json<GetShardTablesRequest>,
) -> Response {
    get_tables_of_shards(
        State(state),
        Json(GetTablesOfShardsRequest {
            cluster_name: req.cluster_name,
            shard_ids: req.shard_ids,
        }),
    )
    .await
}

async fn transfer_leader(
    State(state): State<ApiState>,
    Json(req): Json<TransferLeaderRequest>,
) -> Response {
    info!(
        "[TransferLeader] cluster {}, shard {}, {} -> {}",
        req.cluster_name, req.shard_id, req.old_leader_node_name, req.new_leader_node_name
    );
    let runtime = match state.cluster_manager.get_cluster(&req.cluster_name).await {
        Ok(runtime) => runtime,
        Err(e) => return err_response(&e),
    };
    let snapshot = runtime.metadata().get_cluster_snapshot().await;
    let old_leader_node = if req.old_leader_node_name.is_empty() {
        None
    } else {
        Some(req.old_leader_node_name)
    };
    let procedure = match runtime
        .procedure_factory()
        .create_transfer_leader_procedure(ProcTransferLeaderRequest {
            snapshot,
            shard_id: req.shard_id,
            old_leader_node,
            new_leader_node: req.new_leader_node_name,
        })
        .await
    {
        Ok(procedure) => procedure,
        Err(e) => return err_response(&e),
    };
    match runtime.procedure_manager().submit(procedure).await {
        Ok(()) => ok_response("ok"),
        Err(e) => err_response(&e),
    }
}

async fn split(State(state): State<ApiState>, Json(req): Json<SplitRequest>) -> Response {
    info!(
        "[Split] cluster {}, shard {}, {} tables to {}",
        req.cluster_name,
        req.shard_id,
        req.split_tables.len(),
        req.node_name
    );
    let runtime = match state.cluster_manager.get_cluster(&req.cluster_name).await {
        Ok(runtime) => runtime,
        Err(e) => return err_response(&e),
    };
    let new_shard_id = match runtime.metadata().alloc_shard_id().await {
        Ok(id) => id,
        Err(e) => return err_response(&e),
    };
    let snapshot = runtime.metadata().get_cluster_snapshot().await;
    let procedure = match runtime
        .procedure_factory()
        .create_split_procedure(ProcSplitRequest {
            snapshot,
            schema_name: req.schema_name,
            table_names: req.split_tables,
            shard_id: req.shard_id,
            new_shard_id,
            target_node_name: req.node_name,
        })
        .await
    {
        Ok(procedure) => procedure,
        Err(e) => return err_response(&e),
    };
    match runtime.procedure_manager().submit(procedure).await {
        Ok(()) => ok_response(SplitResponse { new_shard_id }),
        Err(e) => err_response(&e),
    }
}

async fn admin_drop_table(
    State(state): State<ApiState>,
    Json(req): Json<DropTableRequest>,
) -> Response {
    drop_table_inner(&state, req).await
}

async fn get_node_shards(
    State(state): State<ApiState>,
    Json(req): Json<GetNodesRequest>,
) -> Response {
    get_nodes(State(state), Json(req)).await
}

async fn drop_node_shards(
    State(state): State<ApiState>,
    Json(req): Json<DropNodeShardsRequest>,
) -> Response {
    let runtime = match state.cluster_manager.get_cluster(&req.cluster_name).await {
        Ok(runtime) => runtime,
        Err(e) => return err_response(&e),
    };
    let snapshot = runtime.metadata().get_cluster_snapshot().await;
    let targets: Vec<_> = snapshot
        .topology
        .cluster_view
        .shard_nodes
        .iter()
        .filter(|n| req.shard_ids.contains(&n.shard_id))
        .cloned()
        .collect();
    match runtime.metadata().drop_shard_nodes(targets.clone()).await {
        Ok(()) => ok_response(targets),
        Err(e) => err_response(&e),
    }
}

async fn get_flow_limiter(State(state): State<ApiState>) -> Response {
    ok_response(state.limiter.config())
}

async fn update_flow_limiter(
    State(state): State<ApiState>,
    Json(config): Json<FlowLimiterConfig>,
) -> Response {
    state.limiter.update(config);
    ok_response("ok")
}

async fn health() -> Response {
    ok_response("ok")
}

async fn list_clusters(State(state): State<ApiState>) -> Response {
    ok_response(state.cluster_manager.list_clusters().await)
}

async fn create_cluster(
    State(state): State<ApiState>,
    Json(req): Json<CreateClusterRequest>,
) -> Response {
    info!("[CreateCluster] name {}, {} shards", req.name, req.shard_total);
    match state
        .cluster_manager
        .create_cluster(
            &req.name,
            CreateClusterOpts {
                node_count: req.node_count,
                shard_total: req.shard_total,
                topology_type: req.topology_type,
                procedure_executing_batch_size: req.procedure_executing_batch_size,
            },
        )
        .await
    {
        Ok(runtime) => ok_response(runtime.metadata().get_cluster().await),
        Err(e) => err_response(&e),
    }
}

async fn update_cluster(
    State(state): State<ApiState>,
    Path(name): Path<String>,
    Json(req): Json<UpdateClusterRequest>,
) -> Response {
    match state
        .cluster_manager
        .update_cluster(&name, req.topology_type, req.procedure_executing_batch_size)
        .await
    {
        Ok(cluster) => ok_response(cluster),
        Err(e) => err_response(&e),
    }
}

async fn list_procedures(State(state): State<ApiState>, Path(name): Path<String>) -> Response {
    let runtime = match state.cluster_manager.get_cluster(&name).await {
        Ok(runtime) => runtime,
        Err(e) => return err_response(&e),
    };
    match runtime.procedure_manager().list().await {
        Ok(records) => ok_response(records),
        Err(e) => err_response(&e),
    }
}

async fn list_shard_affinities(State(state): State<ApiState>, Path(name): Path<String>) -> Response {
    let runtime = match state.cluster_manager.get_cluster(&name).await {
        Ok(runtime) => runtime,
        Err(e) => return err_response(&e),
    };
    match runtime.scheduler_manager().list_shard_affinity_rules() {
        Ok(rules) => ok_response(rules),
        Err(e) => err_response(&e),
    }
}

async fn add_shard_affinities(
    State(state): State<ApiState>,
    Path(name): Path<String>,
    Json(rules): Json<Vec<ShardAffinityRule>>,
) -> Response {
    let runtime = match state.cluster_manager.get_cluster(&name).await {
        Ok(runtime) => runtime,
        Err(e) => return err_response(&e),
    };
    for rule in rules {
        if let Err(e) = runtime.scheduler_manager().add_shard_affinity_rule(rule).await {
            return err_response(&e);
        }
    }
    ok_response("ok")
}

async fn remove_shard_affinities(
    State(state): State<ApiState>,
    Path(name): Path<String>,
    Json(req): Json<RemoveShardAffinitiesRequest>,
) -> Response {
    let runtime = match state.cluster_manager.get_cluster(&name).await {
        Ok(runtime) => runtime,
        Err(e) => return err_response(&e),
    };
    for shard_id in req.shard_ids {
        if let Err(e) = runtime
            .scheduler_manager()
            .remove_shard_affinity_rule(shard_id)
            .await
        {
            return err_response(&e);
        }
    }
    ok_response("ok")
}

async fn get_enable_schedule(State(state): State<ApiState>, Path(name): Path<String>) -> Response {
    let runtime = match state.cluster_manager.get_cluster(&name).await {
        Ok(runtime) => runtime,
        Err(e) => return err_response(&e),
    };
    match runtime.scheduler_manager().get_enable_schedule() {
        Ok(enable) => ok_response(enable),
        Err(e) => err_response(&e),
    }
}

async fn update_enable_schedule(
    State(state): State<ApiState>,
    Path(name): Path<String>,
    Json(req): Json<UpdateEnableScheduleRequest>,
) -> Response {
    let runtime = match state.cluster_manager.get_cluster(&name).await {
        Ok(runtime) => runtime,
        Err(e) => return err_response(&e),
    };
    match runtime.scheduler_manager().update_enable_schedule(req.enable) {
        Ok(()) => ok_response(req.enable),
        Err(e) => err_response(&e),
    }
}

// Debug handlers

async fn get_leader(State(state): State<ApiState>) -> Response {
    match state.forward.member().get_leader_addr().await {
        Ok(addr) => ok_response(addr),
        Err(e) => err_response(&e),
    }
}

async fn diagnose_shards(State(state): State<ApiState>, Path(name): Path<String>) -> Response {
    let runtime = match state.cluster_manager.get_cluster(&name).await {
        Ok(runtime) => runtime,
        Err(e) => return err_response(&e),
    };
    let snapshot = runtime.metadata().get_cluster_snapshot().await;

    let mut unregistered: Vec<ShardId> = Vec::new();
    let mut registered = Vec::new();
    for shard_view in snapshot.topology.shard_views.values() {
        let Some(shard_node) = snapshot
            .topology
            .cluster_view
            .find_shard_node(shard_view.shard_id)
        else {
            unregistered.push(shard_view.shard_id);
            continue;
        };
        let reported = snapshot
            .registered_nodes
            .iter()
            .find(|n| n.node.name == shard_node.node_name)
            .and_then(|n| n.shard_infos.iter().find(|s| s.id == shard_view.shard_id));
        match reported {
            Some(shard_info) => registered.push(DiagnoseShardEntry {
                shard_id: shard_view.shard_id,
                node_name: shard_node.node_name.clone(),
                status: shard_info.status,
            }),
            None => {
                warn!(
                    "shard {} bound to {} but not reported",
                    shard_view.shard_id, shard_node.node_name
                );
                unregistered.push(shard_view.shard_id);
            }
        }
    }
    unregistered.sort_unstable();
    registered.sort_by_key(|e| e.shard_id);
    ok_response(DiagnoseShardsResult {
        unregistered_shards: unregistered,
        registered_shards: registered,
    })
}
