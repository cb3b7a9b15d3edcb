//! Model listing and installation guidance.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use unified_inference_common::{BackendKind, ModelFormat, ModelList};

use crate::error::{Error, Result};
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/v1/models", get(list_models))
        .route("/v1/models/install", get(install_guide))
}

#[derive(Debug, Deserialize)]
struct ModelsQuery {
    model: Option<String>,
}

/// GET /v1/models[?model=name]
///
/// Without a filter (or with an empty one), lists the models of this service's execution mode. With
/// one, describes any registered model.
async fn list_models(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ModelsQuery>,
) -> Result<Response> {
    if let Some(name) = query.model.filter(|name| !name.is_empty()) {
        let descriptor = state
            .registry
            .get(&name)
            .ok_or_else(|| Error::ModelNotFound {
                available: state.registry.names(),
                model: name,
            })?;
        return Ok(Json(descriptor.projection()).into_response());
    }

    let data = state
        .registry
        .list(Some(state.config.execution_mode), None)
        .iter()
        .map(|d| d.projection())
        .collect();
    Ok(Json(ModelList::new(data)).into_response())
}

/// GET /v1/models/install - Static guidance. Installs nothing.
async fn install_guide() -> Json<Value> {
    Json(json!({
        "message": "Model installation guidance",
        "supported_formats": {
            "gpu": {
                "formats": [ModelFormat::Native, ModelFormat::Quantized],
                "backend": BackendKind::Process,
                "examples": [
                    "Qwen/Qwen2.5-Coder-1.5B-Instruct-AWQ",
                    "BAAI/bge-base-en-v1.5",
                    "BAAI/bge-reranker-v2-m3"
                ]
            },
            "cpu": {
                "formats": [ModelFormat::LegacyQuantized],
                "backend": BackendKind::Placeholder,
                "examples": ["TheBloke/Llama-2-7B-GGUF"],
                "note": "The CPU backend is a placeholder; starting a CPU model fails until one is implemented"
            }
        },
        "unsupported": {
            "legacy_quantized_on_process": "legacy_quantized (GGUF) weights cannot be served by process backends",
            "legacy_quantized_on_gpu": "gpu execution mode rejects legacy_quantized weights"
        },
        "requirements": {
            "gpu": "NVIDIA GPU with CUDA 11.8+",
            "memory": "Varies by model (1.5B ~3GB, 7B ~14GB, 70B ~140GB)"
        },
        "installation_steps": [
            "1. Download the model from HuggingFace",
            "2. Add a model entry to the models file (models_config_path)",
            "3. Restart the orchestrator",
            "4. The model starts on its first request"
        ]
    }))
}
