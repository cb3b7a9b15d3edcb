//! Manual backend control.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::routing::post;
use axum::{Json, Router};
use serde_json::{json, Value};

use crate::error::Result;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/v1/admin/models/:name/start", post(start_model))
        .route("/v1/admin/models/:name/stop", post(stop_model))
}

/// POST /v1/admin/models/:name/start
async fn start_model(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Json<Value>> {
    state.lifecycle.start_model(&name).await?;
    Ok(Json(json!({ "status": "started", "model": name })))
}

/// POST /v1/admin/models/:name/stop
async fn stop_model(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Json<Value>> {
    state.lifecycle.stop_model(&name).await?;
    Ok(Json(json!({ "status": "stopped", "model": name })))
}
