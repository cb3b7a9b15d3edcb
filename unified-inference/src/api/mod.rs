//! HTTP surface of the orchestrator.

pub mod admin;
pub mod health;
pub mod models;
pub mod proxy;
pub mod status;

use std::sync::Arc;

use axum::routing::get;
use axum::Router;

use crate::state::AppState;

/// Build the API router. Anything not matched here is proxied to a backend.
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/health", get(health::health))
        .route("/v1/status", get(status::status))
        .merge(models::router())
        .merge(admin::router())
        .fallback(proxy::proxy)
}
