//! Health check endpoint.

use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use unified_inference_common::HealthResponse;

use crate::state::AppState;

/// GET /health - Liveness of the orchestrator itself, not of its backends.
pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        execution_mode: state.config.execution_mode,
    })
}
