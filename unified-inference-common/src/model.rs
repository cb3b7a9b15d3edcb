//! Model classification types shared by the orchestrator and its clients.

use serde::{Deserialize, Serialize};

/// What kind of work a model serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelType {
    /// Vector embeddings generation
    Embedding,
    /// Query/document relevance scoring
    Rerank,
    /// Generative text
    Llm,
}

impl std::fmt::Display for ModelType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ModelType::Embedding => write!(f, "embedding"),
            ModelType::Rerank => write!(f, "rerank"),
            ModelType::Llm => write!(f, "llm"),
        }
    }
}

/// Where inference runs. A whole orchestrator instance runs in exactly one mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    #[default]
    Gpu,
    Cpu,
}

impl std::fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionMode::Gpu => write!(f, "gpu"),
            ExecutionMode::Cpu => write!(f, "cpu"),
        }
    }
}

/// How a model is served.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// A dedicated inference server subprocess per model.
    #[serde(alias = "sglang")]
    Process,
    /// Deliberately unimplemented; every start fails loudly.
    #[serde(alias = "cpu_backend")]
    Placeholder,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendKind::Process => write!(f, "process"),
            BackendKind::Placeholder => write!(f, "placeholder"),
        }
    }
}

/// On-disk weight format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelFormat {
    /// Full-precision checkpoint (e.g. HuggingFace safetensors).
    #[serde(alias = "hf")]
    Native,
    /// GPU-friendly quantization (e.g. AWQ).
    #[serde(alias = "awq")]
    Quantized,
    /// CPU-oriented quantized container (e.g. GGUF).
    #[serde(alias = "gguf", alias = "legacy-quantized")]
    LegacyQuantized,
}

impl ModelFormat {
    /// Formats every backend kind and execution mode accepts.
    pub const PREFERRED: [ModelFormat; 2] = [ModelFormat::Native, ModelFormat::Quantized];
}

impl std::fmt::Display for ModelFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ModelFormat::Native => write!(f, "native"),
            ModelFormat::Quantized => write!(f, "quantized"),
            ModelFormat::LegacyQuantized => write!(f, "legacy_quantized"),
        }
    }
}

/// Public view of a registered model, as returned by `/v1/models`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelProjection {
    pub id: String,
    #[serde(default = "default_object")]
    pub object: String,
    #[serde(rename = "type")]
    pub model_type: ModelType,
    pub execution_mode: ExecutionMode,
    pub backend: BackendKind,
    pub format: ModelFormat,
    /// Whether this is the default model for its type.
    #[serde(default)]
    pub default: bool,
}

fn default_object() -> String {
    "model".to_string()
}

/// Response of `GET /v1/models` without a filter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelList {
    pub object: String,
    pub data: Vec<ModelProjection>,
}

impl ModelList {
    pub fn new(data: Vec<ModelProjection>) -> Self {
        Self {
            object: "list".to_string(),
            data,
        }
    }
}
