//! Backend status endpoint.

use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use unified_inference_common::StatusResponse;

use crate::state::AppState;

/// GET /v1/status - Snapshot of every backend started at least once.
pub async fn status(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    Json(StatusResponse {
        execution_mode: state.config.execution_mode,
        backends: state.lifecycle.status().await,
    })
}
