//! # swarm-server
//!
//! HTTP API in front of a running mesh node. Every request goes through the
//! node's [`NodeHandle`], so the node itself stays single-threaded.

use std::sync::Arc;

use axum::{
    Router,
    extract::{Path, State},
    http::{HeaderMap, Request, StatusCode},
    middleware::{self, Next},
    response::{Json, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use swarm_config::ServerConfig;
use swarm_core::SwarmError;
use swarm_mesh::{NodeHandle, WILDCARD};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

/// Shared server state.
pub struct AppState {
    pub config: ServerConfig,
    pub node: NodeHandle,
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    uptime_secs: u64,
}

#[derive(Deserialize)]
struct SetStateRequest {
    key: String,
    value: String,
}

/// Build the Axum router.
pub fn build_router(config: ServerConfig, node: NodeHandle) -> Router {
    let state = Arc::new(AppState {
        config: config.clone(),
        node,
    });

    let api_routes = Router::new()
        .route("/api/status", get(status_handler))
        .route("/api/nodes", get(nodes_handler))
        .route("/api/state", get(state_handler).post(set_state_handler))
        .route("/api/state/{key}", get(get_state_handler))
        .route("/api/command", post(command_handler))
        .route("/api/sync", post(sync_handler))
        .route("/api/telemetry/push", post(push_telemetry_handler));

    let api_routes = if config.api_key.is_some() {
        api_routes.layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ))
    } else {
        api_routes
    };

    let mut router = Router::new()
        .route("/health", get(health_handler))
        .merge(api_routes)
        .with_state(state)
        .layer(TraceLayer::new_for_http());

    if config.cors {
        router = router.layer(CorsLayer::permissive());
    }

    router
}

/// Middleware that checks the Authorization header against the configured API key.
async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    request: Request<axum::body::Body>,
    next: Next,
) -> Result<Response, StatusCode> {
    if let Some(ref expected_key) = state.config.api_key {
        let provided = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "));

        match provided {
            Some(key) if key == expected_key => {}
            _ => {
                warn!("unauthorized API request, invalid or missing API key");
                return Err(StatusCode::UNAUTHORIZED);
            }
        }
    }
    Ok(next.run(request).await)
}

fn node_error(e: SwarmError) -> StatusCode {
    match e {
        SwarmError::RuntimeStopped => StatusCode::SERVICE_UNAVAILABLE,
        other => {
            warn!(error = %other, "node request failed");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let uptime = match state.node.status().await {
        Ok(s) => s.uptime_secs,
        Err(_) => 0,
    };
    Json(HealthResponse {
        status: "ok".into(),
        version: env!("CARGO_PKG_VERSION").into(),
        uptime_secs: uptime,
    })
}

async fn status_handler(State(state): State<Arc<AppState>>) -> Result<Json<Value>, StatusCode> {
    let status = state.node.status().await.map_err(node_error)?;
    Ok(Json(json!(status)))
}

async fn nodes_handler(State(state): State<Arc<AppState>>) -> Result<Json<Value>, StatusCode> {
    let nodes = state.node.peers().await.map_err(node_error)?;
    Ok(Json(json!({ "count": nodes.len(), "nodes": nodes })))
}

async fn state_handler(State(state): State<Arc<AppState>>) -> Result<Json<Value>, StatusCode> {
    let entries = state.node.state().await.map_err(node_error)?;
    Ok(Json(json!({ "count": entries.len(), "state": entries })))
}

async fn get_state_handler(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
) -> Result<Json<Value>, StatusCode> {
    match state.node.get_state(key.clone()).await.map_err(node_error)? {
        Some(value) => Ok(Json(json!({ "key": key, "value": value }))),
        None => Err(StatusCode::NOT_FOUND),
    }
}

async fn set_state_handler(
    State(state): State<Arc<AppState>>,
    Json(body): Json<SetStateRequest>,
) -> Result<Json<Value>, StatusCode> {
    if body.key.is_empty() || body.key == WILDCARD {
        return Err(StatusCode::BAD_REQUEST);
    }
    let changed = state
        .node
        .set_state(body.key.clone(), body.value)
        .await
        .map_err(node_error)?;
    info!(key = %body.key, changed, "state set via API");
    Ok(Json(json!({ "key": body.key, "changed": changed })))
}

async fn command_handler(
    State(state): State<Arc<AppState>>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, StatusCode> {
    if !body.is_object() {
        return Err(StatusCode::BAD_REQUEST);
    }
    state.node.send_command(body).await.map_err(node_error)?;
    Ok(Json(json!({ "sent": true })))
}

async fn sync_handler(State(state): State<Arc<AppState>>) -> Result<Json<Value>, StatusCode> {
    state.node.broadcast_state().await.map_err(node_error)?;
    Ok(Json(json!({ "synced": true })))
}

async fn push_telemetry_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Value>, StatusCode> {
    let pushed = state.node.push_telemetry().await.map_err(node_error)?;
    Ok(Json(json!({ "pushed": pushed })))
}

/// Start the HTTP server.
pub async fn start_server(config: ServerConfig, node: NodeHandle) -> swarm_core::Result<()> {
    let listen = config.listen.clone();
    let router = build_router(config, node);

    info!(listen = %listen, "starting HTTP server");

    let listener = tokio::net::TcpListener::bind(&listen)
        .await
        .map_err(|e| SwarmError::Api(format!("failed to bind {listen}: {e}")))?;

    axum::serve(listener, router)
        .await
        .map_err(|e| SwarmError::Api(format!("server error: {e}")))?;

    Ok(())
}
