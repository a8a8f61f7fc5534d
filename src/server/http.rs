//! Cluster RPC surface over HTTP
//!
//! Peer traffic (`/raft/*`), metadata proposals and queries from client
//! agents, membership changes, health probes and Prometheus metrics.

use crate::common::api::{
    ClusterStatus, MemberAction, MemberRequest, ProposeRequest, ProposeResponse, QueryRequest,
    QueryResponse,
};
use crate::common::raft::{
    AppendRequest, AppendResponse, SnapshotRequest, SnapshotResponse, VoteRequest, VoteResponse,
};
use crate::common::tracing_middleware::request_id_middleware;
use crate::common::{Error, Result};
use crate::server::node::ClusterServer;
use axum::{
    extract::{DefaultBodyLimit, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use tower::ServiceBuilder;
use tower_http::{limit::RequestBodyLimitLayer, trace::TraceLayer};

/// Snapshots travel as one request body
const MAX_BODY_BYTES: usize = 256 * 1024 * 1024;

pub fn create_router(server: ClusterServer) -> Router {
    Router::new()
        // Consensus
        .route("/raft/vote", post(raft_vote))
        .route("/raft/append", post(raft_append))
        .route("/raft/snapshot", post(raft_snapshot))
        // Metadata
        .route("/meta/propose", post(meta_propose))
        .route("/meta/query", post(meta_query))
        // Cluster
        .route("/cluster/status", get(cluster_status))
        .route("/cluster/members", post(cluster_members))
        // Health and metrics
        .route("/health/live", get(health_live))
        .route("/health/ready", get(health_ready))
        .route("/metrics", get(metrics))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(axum::middleware::from_fn(request_id_middleware))
                .layer(DefaultBodyLimit::disable())
                .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES)),
        )
        .with_state(server)
}

async fn raft_vote(
    State(server): State<ClusterServer>,
    Json(req): Json<VoteRequest>,
) -> Result<Json<VoteResponse>> {
    Ok(Json(server.raft().request_vote(req).await?))
}

async fn raft_append(
    State(server): State<ClusterServer>,
    Json(req): Json<AppendRequest>,
) -> Result<Json<AppendResponse>> {
    Ok(Json(server.raft().append_entries(req).await?))
}

async fn raft_snapshot(
    State(server): State<ClusterServer>,
    Json(req): Json<SnapshotRequest>,
) -> Result<Json<SnapshotResponse>> {
    Ok(Json(server.raft().install_snapshot(req).await?))
}

async fn meta_propose(
    State(server): State<ClusterServer>,
    Json(req): Json<ProposeRequest>,
) -> Result<Json<ProposeResponse>> {
    let index = server.propose(req.op).await?;
    Ok(Json(ProposeResponse { index }))
}

async fn meta_query(
    State(server): State<ClusterServer>,
    Json(req): Json<QueryRequest>,
) -> Result<Json<QueryResponse>> {
    Ok(Json(server.query(req).await?))
}

async fn cluster_status(State(server): State<ClusterServer>) -> Json<ClusterStatus> {
    Json(server.cluster_status())
}

async fn cluster_members(
    State(server): State<ClusterServer>,
    Json(req): Json<MemberRequest>,
) -> Result<Json<ProposeResponse>> {
    let index = match req.action {
        MemberAction::Add => {
            let addr = req
                .addr
                .ok_or_else(|| Error::InvalidConfig("adding a voter requires addr".into()))?;
            server.add_voter(req.id, addr).await?
        }
        MemberAction::Remove => server.remove_voter(req.id).await?,
    };
    Ok(Json(ProposeResponse { index }))
}

/// Liveness probe: the process answers
async fn health_live() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(json!({
            "alive": true,
            "version": crate::VERSION,
            "timestamp": chrono::Utc::now().to_rfc3339(),
        })),
    )
}

/// Readiness probe: a leader is known and storage is healthy
async fn health_ready(State(server): State<ClusterServer>) -> impl IntoResponse {
    let status = server.status();
    let ready = status.initialized && status.leader_id.is_some() && !status.faulted;
    let code = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        code,
        Json(json!({
            "ready": ready,
            "role": status.role.to_string(),
            "leader": status.leader_id,
            "faulted": status.faulted,
        })),
    )
}

async fn metrics(State(server): State<ClusterServer>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        server.render_metrics(),
    )
}
