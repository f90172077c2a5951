//! HTTP surface for machine callbacks and viewer WebSockets.
//!
//! Node agents report workspace readiness, heartbeats and error batches
//! here; browser viewers attach to a project's session store over `/ws`.
//! User-facing routes (task submission, project CRUD) live in an external
//! gateway and are not part of this service.

use crate::auth::{create_auth_state, extract_token, node_auth_middleware, token_matches, AuthState};
use crate::cms::CmsStore;
use crate::config::ApiConfig;
use crate::models::NodeMetrics;
use crate::observability::{AgentErrorEntry, ObservabilityStore};
use crate::orchestrator::{TaskOrchestrator, WorkspaceReadyStatus};
use crate::session_store::SessionStoreRuntime;
use crate::{Result, StratoError};
use axum::{
    extract::{
        ws::{Message, WebSocket},
        DefaultBodyLimit, Path, State, WebSocketUpgrade,
    },
    http::StatusCode,
    middleware,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{debug, info, warn};

const ROUTE_HEALTH: &str = "/health";
const ROUTE_WORKSPACE_READY: &str = "/workspaces/{workspace_id}/ready";
const ROUTE_NODE_ERRORS: &str = "/nodes/{node_id}/errors";
const ROUTE_NODE_HEARTBEAT: &str = "/nodes/{node_id}/heartbeat";
const ROUTE_TASK_STATUS: &str = "/tasks/{task_id}/status";
const ROUTE_PROJECT_WS: &str = "/projects/{project_id}/ws";

pub struct ApiState {
    pub cms: CmsStore,
    pub orchestrator: TaskOrchestrator,
    pub session_stores: SessionStoreRuntime,
    pub observability: ObservabilityStore,
}

#[derive(Clone)]
pub struct ApiServer {
    state: Arc<ApiState>,
    auth: Arc<AuthState>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceReadyRequest {
    pub status: String,
    #[serde(default)]
    pub error_message: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct AgentErrorBatch {
    pub entries: Vec<AgentErrorEntry>,
}

#[derive(Debug, Deserialize)]
pub struct HeartbeatRequest {
    #[serde(default)]
    pub metrics: Option<NodeMetrics>,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

fn error_response(status: StatusCode, error: &str, details: Option<String>) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: error.to_string(),
            details,
        }),
    )
        .into_response()
}

impl ApiServer {
    pub fn new(config: ApiConfig, state: ApiState) -> Self {
        let auth = create_auth_state(config);
        Self {
            state: Arc::new(state),
            auth,
        }
    }

    pub fn router(&self) -> Router {
        let node_routes = Router::new()
            .route(ROUTE_NODE_ERRORS, post(report_node_errors))
            .route(ROUTE_NODE_HEARTBEAT, post(node_heartbeat))
            .route(ROUTE_TASK_STATUS, get(task_status))
            .layer(middleware::from_fn_with_state(
                self.auth.clone(),
                node_auth_middleware,
            ))
            .layer(DefaultBodyLimit::max(self.auth.config.max_error_body_bytes));

        let origins: Vec<axum::http::HeaderValue> = self
            .auth
            .config
            .allowed_origins
            .iter()
            .filter_map(|origin| origin.parse().ok())
            .collect();
        let cors = CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(tower_http::cors::Any)
            .allow_headers(tower_http::cors::Any);

        Router::new()
            .route(ROUTE_HEALTH, get(health))
            .route(ROUTE_WORKSPACE_READY, post(workspace_ready))
            .route(ROUTE_PROJECT_WS, get(project_ws))
            .merge(node_routes)
            .layer(
                ServiceBuilder::new()
                    .layer(TraceLayer::new_for_http())
                    .layer(cors),
            )
            .with_state(self.state.clone())
    }

    pub async fn run(&self) -> Result<()> {
        let addr = format!("{}:{}", self.auth.config.host, self.auth.config.port);
        info!("API server listening on {}", addr);
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| StratoError::Configuration(format!("cannot bind {addr}: {e}")))?;
        axum::serve(listener, self.router())
            .await
            .map_err(|e| StratoError::Configuration(format!("API server failed: {e}")))?;
        Ok(())
    }
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok"}))
}

/// Workspace-ready callback from the node agent, authenticated by the
/// per-workspace token issued at creation.
async fn workspace_ready(
    State(state): State<Arc<ApiState>>,
    Path(workspace_id): Path<String>,
    headers: axum::http::HeaderMap,
    Json(body): Json<WorkspaceReadyRequest>,
) -> Response {
    let workspace = match state.cms.get_workspace(&workspace_id).await {
        Ok(Some(workspace)) => workspace,
        Ok(None) => {
            return error_response(StatusCode::NOT_FOUND, "Workspace not found", None);
        }
        Err(e) => {
            warn!("Workspace lookup failed for callback {}: {}", workspace_id, e);
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error", None);
        }
    };

    let authorised = match (&workspace.callback_token, extract_token(&headers)) {
        (Some(expected), Some(provided)) => token_matches(provided, expected),
        _ => false,
    };
    if !authorised {
        warn!("Rejected workspace-ready callback for {}", workspace_id);
        return error_response(StatusCode::UNAUTHORIZED, "Unauthorized", None);
    }

    let status: WorkspaceReadyStatus = match body.status.parse() {
        Ok(status) => status,
        Err(_) => {
            return error_response(
                StatusCode::UNPROCESSABLE_ENTITY,
                "Invalid status",
                Some(format!("unknown workspace status {:?}", body.status)),
            );
        }
    };

    let task = match state.cms.find_task_by_workspace(&workspace_id).await {
        Ok(Some(task)) => task,
        Ok(None) => {
            return error_response(StatusCode::NOT_FOUND, "No task owns this workspace", None);
        }
        Err(e) => {
            warn!("Task lookup failed for workspace {}: {}", workspace_id, e);
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error", None);
        }
    };

    match state
        .orchestrator
        .advance_workspace_ready(&task.id, status, body.error_message)
        .await
    {
        Ok(()) => (StatusCode::ACCEPTED, Json(serde_json::json!({"accepted": true}))).into_response(),
        Err(StratoError::NotFound(_)) => {
            error_response(StatusCode::NOT_FOUND, "No runner for this task", None)
        }
        Err(e) => {
            warn!("Workspace-ready dispatch failed for task {}: {}", task.id, e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error", None)
        }
    }
}

/// Batched error ingest from a node agent. Hard caps on entry count and
/// entry size; the route body limit bounds the total payload.
async fn report_node_errors(
    State(state): State<Arc<ApiState>>,
    Path(node_id): Path<String>,
    Json(batch): Json<AgentErrorBatch>,
) -> Response {
    if batch.entries.is_empty() {
        return error_response(StatusCode::UNPROCESSABLE_ENTITY, "Empty batch", None);
    }
    if batch.entries.len() > crate::constants::MAX_VM_AGENT_ERROR_BATCH_ENTRIES {
        return error_response(
            StatusCode::UNPROCESSABLE_ENTITY,
            "Too many entries",
            Some(format!(
                "batch of {} exceeds {}",
                batch.entries.len(),
                crate::constants::MAX_VM_AGENT_ERROR_BATCH_ENTRIES
            )),
        );
    }
    if batch
        .entries
        .iter()
        .any(|entry| entry.message.len() > crate::constants::MAX_VM_AGENT_ERROR_ENTRY_BYTES)
    {
        return error_response(StatusCode::UNPROCESSABLE_ENTITY, "Entry too large", None);
    }

    state.observability.record_agent_errors(&node_id, &batch.entries).await;
    (StatusCode::ACCEPTED, Json(serde_json::json!({"accepted": batch.entries.len()}))).into_response()
}

async fn node_heartbeat(
    State(state): State<Arc<ApiState>>,
    Path(node_id): Path<String>,
    Json(body): Json<HeartbeatRequest>,
) -> Response {
    match state
        .cms
        .record_node_heartbeat(&node_id, body.metrics.as_ref())
        .await
    {
        Ok(true) => StatusCode::NO_CONTENT.into_response(),
        Ok(false) => error_response(StatusCode::NOT_FOUND, "Node not found", None),
        Err(e) => {
            warn!("Heartbeat update failed for node {}: {}", node_id, e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error", None)
        }
    }
}

async fn task_status(
    State(state): State<Arc<ApiState>>,
    Path(task_id): Path<String>,
) -> Response {
    match state.orchestrator.get_status(&task_id).await {
        Ok(Some(status)) => (StatusCode::OK, Json(status)).into_response(),
        Ok(None) => error_response(StatusCode::NOT_FOUND, "Task runner not found", None),
        Err(e) => {
            warn!("Status read failed for task {}: {}", task_id, e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error", None)
        }
    }
}

/// Viewer WebSocket: upgrades, attaches to the project's session store and
/// relays broadcasts until either side goes away.
async fn project_ws(
    State(state): State<Arc<ApiState>>,
    Path(project_id): Path<String>,
    upgrade: WebSocketUpgrade,
) -> Response {
    let handle = match state.session_stores.handle_for(&project_id).await {
        Ok(handle) => handle,
        Err(e) => {
            warn!("Cannot open session store for project {}: {}", project_id, e);
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error", None);
        }
    };

    upgrade.on_upgrade(move |socket| viewer_loop(socket, handle, project_id))
}

async fn viewer_loop(
    mut socket: WebSocket,
    handle: crate::session_store::SessionStoreHandle,
    project_id: String,
) {
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let viewer_id = match handle.attach_viewer(tx).await {
        Ok(viewer_id) => viewer_id,
        Err(e) => {
            warn!("Viewer attach failed for project {}: {}", project_id, e);
            return;
        }
    };
    debug!("Viewer {} attached to project {}", viewer_id, project_id);

    loop {
        tokio::select! {
            outbound = rx.recv() => {
                match outbound {
                    Some(text) => {
                        if socket.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            inbound = socket.recv() => {
                match inbound {
                    // Pings are answered here without waking the instance
                    Some(Ok(Message::Text(text))) => {
                        let is_ping = serde_json::from_str::<serde_json::Value>(&text)
                            .map(|value| value["type"] == "ping")
                            .unwrap_or(false);
                        if is_ping
                            && socket
                                .send(Message::Text(r#"{"type":"pong"}"#.into()))
                                .await
                                .is_err()
                        {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    handle.detach_viewer(viewer_id);
    debug!("Viewer {} detached from project {}", viewer_id, project_id);
}

#[cfg(test)]
mod tests;
