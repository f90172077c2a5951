//! Callback authentication.
//!
//! Two token flavours guard the machine-facing surface: a shared bearer
//! token presented by node agents on `/nodes/*`, and a per-workspace
//! callback token issued at workspace creation and checked on
//! `/workspaces/{id}/ready`. All comparisons are constant-time.

use crate::config::ApiConfig;
use axum::{
    extract::{Request, State},
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Json, Response},
};
use rand::RngCore;
use serde_json::json;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tracing::warn;

#[derive(Clone)]
pub struct AuthState {
    pub config: ApiConfig,
}

pub fn create_auth_state(config: ApiConfig) -> Arc<AuthState> {
    Arc::new(AuthState { config })
}

/// Random 64-hex capability issued per workspace.
pub fn generate_callback_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Constant-time token comparison; length differences short-circuit without
/// leaking content.
pub fn token_matches(provided: &str, expected: &str) -> bool {
    provided.as_bytes().ct_eq(expected.as_bytes()).into()
}

/// Pull a bearer token out of `authorization` or `x-callback-token`.
pub fn extract_token(headers: &HeaderMap) -> Option<&str> {
    if let Some(value) = headers.get("x-callback-token") {
        return value.to_str().ok();
    }
    headers
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({"error": "Unauthorized"})),
    )
        .into_response()
}

/// Middleware for the node-agent callback routes. Every request must carry
/// the shared node-agent token.
pub async fn node_auth_middleware(
    State(auth_state): State<Arc<AuthState>>,
    request: Request,
    next: Next,
) -> Result<Response, Response> {
    let path = request.uri().path().to_string();
    let Some(provided) = extract_token(request.headers()) else {
        warn!("Missing agent token on request to {}", path);
        return Err(unauthorized());
    };

    if !token_matches(provided, &auth_state.config.node_agent_token) {
        warn!("Invalid agent token on request to {}", path);
        return Err(unauthorized());
    }

    Ok(next.run(request).await)
}
