//! Axum route handlers for the ember node API.

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};
use ember_core::SandboxConfig;
use ember_executor::{SandboxInfo, SandboxOrchestrator};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;

use crate::error::GatewayError;

// ── Shared state ─────────────────────────────────────────────────────────────

type Orchestrator = Arc<SandboxOrchestrator>;

// ── Request / response types ─────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateSandboxResponse {
    pub client_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub node_id: String,
    pub sandboxes: usize,
}

// ── Router ───────────────────────────────────────────────────────────────────

/// Build the application router around `orchestrator`.
pub fn create_router(orchestrator: Orchestrator) -> Router {
    Router::new()
        .route("/sandboxes", post(create_sandbox).get(list_sandboxes))
        .route("/sandboxes/{sandbox_id}", delete(delete_sandbox))
        .route("/health", get(health))
        .with_state(orchestrator)
        .layer(TraceLayer::new_for_http())
}

// ── Handlers ─────────────────────────────────────────────────────────────────

/// `GET /health`: liveness check with the running sandbox count.
pub async fn health(State(orchestrator): State<Orchestrator>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_owned(),
        node_id: orchestrator.node_id().to_owned(),
        sandboxes: orchestrator.count(),
    })
}

/// `POST /sandboxes`: create a sandbox and return this node's identity.
///
/// # Errors
/// 400 for a malformed body, an invalid config, a missing template or a
/// duplicate id; 500 for any provisioning failure.
pub async fn create_sandbox(
    State(orchestrator): State<Orchestrator>,
    body: Result<Json<SandboxConfig>, JsonRejection>,
) -> Result<impl IntoResponse, GatewayError> {
    let Json(config) = body.map_err(|e| GatewayError::MalformedBody(e.body_text()))?;
    let sandbox = orchestrator.create(config).await?;
    Ok((
        StatusCode::CREATED,
        Json(CreateSandboxResponse { client_id: sandbox.info().client_id }),
    ))
}

/// `DELETE /sandboxes/{sandbox_id}`: stop a sandbox.
///
/// Returns once the stop is signalled; cleanup finishes in the background.
///
/// # Errors
/// 404 if no running sandbox has this id.
pub async fn delete_sandbox(
    State(orchestrator): State<Orchestrator>,
    Path(sandbox_id): Path<String>,
) -> Result<impl IntoResponse, GatewayError> {
    orchestrator.stop(&sandbox_id)?;
    Ok(StatusCode::NO_CONTENT)
}

/// `GET /sandboxes`: every running sandbox.
pub async fn list_sandboxes(State(orchestrator): State<Orchestrator>) -> Json<Vec<SandboxInfo>> {
    Json(orchestrator.list())
}
