//! Unified Inference - one request surface in front of lazily started,
//! supervised embedding, rerank and LLM backends.

pub mod api;
pub mod backend;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod logging;
pub mod registry;
pub mod router;
pub mod state;
pub mod test_util;

pub use config::Config;
pub use error::{Error, Result};
pub use lifecycle::{LifecycleManager, LifecycleSettings};
pub use registry::{ModelDescriptor, ModelRegistry, RegistryOptions};
pub use state::AppState;

use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::{middleware, Router};
use tower_http::cors::CorsLayer;

/// Build the HTTP application.
pub fn app(state: Arc<AppState>) -> Router {
    let body_limit = state.config.server.max_body_mb * 1024 * 1024;

    api::router()
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(middleware::from_fn(logging::request_logger))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
