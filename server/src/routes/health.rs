//! Health check endpoint.

use axum::{extract::State, routing::get, Json, Router};
use fieldsync_engine::NodeRole;
use serde::Serialize;

use crate::AppState;

/// Health check response.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub node_role: NodeRole,
    pub record_types: usize,
}

/// Create health routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health_check))
        .route("/", get(root))
}

/// Health check handler.
async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        node_role: state.manager.settings().node_role,
        record_types: state.manager.outgoing_order().len(),
    })
}

/// Root handler.
async fn root() -> &'static str {
    "FieldSync Server"
}
