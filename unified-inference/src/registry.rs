//! Model registry.
//!
//! Parses the YAML descriptor list, validates every entry and indexes the result by
//! name. Descriptors are immutable once loaded; `reload` swaps in a freshly parsed
//! index and needs `&mut self`, so it cannot run while lookups hold a borrow.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use unified_inference_common::{
    BackendKind, ExecutionMode, ModelFormat, ModelProjection, ModelType,
};

use crate::config::Config;

/// Errors raised while loading descriptors. All of them are fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Failed to read model config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid model config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Invalid model config: missing 'models' key")]
    MissingModels,

    #[error("Invalid model '{model}': {reason}")]
    Invalid { model: String, reason: String },

    #[error("Duplicate model name '{0}'")]
    DuplicateName(String),

    #[error("Port {port} is claimed by both '{first}' and '{second}'")]
    DuplicatePort {
        port: u16,
        first: String,
        second: String,
    },
}

/// Raw descriptor as written in the YAML file.
#[derive(Debug, Clone, Deserialize)]
struct ModelEntry {
    name: String,
    #[serde(rename = "type")]
    model_type: ModelType,
    execution_mode: ExecutionMode,
    backend: BackendKind,
    model_path: String,
    format: ModelFormat,
    #[serde(default)]
    gpu_id: Option<u32>,
    #[serde(default)]
    port: Option<u16>,
    /// Seconds; falls back to the lifecycle default.
    #[serde(default)]
    idle_timeout: Option<u64>,
    #[serde(default)]
    default: bool,
    #[serde(default)]
    is_embedding: bool,
    #[serde(default = "default_true")]
    trust_remote_code: bool,
    #[serde(default = "default_dtype")]
    dtype: Option<String>,
    #[serde(default, alias = "cpu_offload_model")]
    cpu_offload_target: Option<String>,
}

fn default_true() -> bool {
    true
}

fn default_dtype() -> Option<String> {
    Some("auto".to_string())
}

#[derive(Debug, Deserialize)]
struct ModelsFile {
    #[serde(default)]
    models: Option<Vec<ModelEntry>>,
}

/// Validated, immutable description of one model and how to run it.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelDescriptor {
    pub name: String,
    pub model_type: ModelType,
    pub execution_mode: ExecutionMode,
    pub backend: BackendKind,
    pub model_path: String,
    pub format: ModelFormat,
    pub gpu_id: Option<u32>,
    pub port: u16,
    /// Zero means the model is never stopped for idleness.
    pub idle_timeout: Duration,
    pub is_default: bool,
    pub is_embedding: bool,
    pub trust_remote_code: bool,
    pub dtype: Option<String>,
    pub cpu_offload_target: Option<String>,
}

impl ModelDescriptor {
    pub fn projection(&self) -> ModelProjection {
        ModelProjection {
            id: self.name.clone(),
            object: "model".to_string(),
            model_type: self.model_type,
            execution_mode: self.execution_mode,
            backend: self.backend,
            format: self.format,
            default: self.is_default,
        }
    }
}

/// Check that a format can be served by a backend kind in an execution mode.
pub fn check_compatibility(
    backend: BackendKind,
    execution_mode: ExecutionMode,
    format: ModelFormat,
) -> Result<(), String> {
    if backend == BackendKind::Process && format == ModelFormat::LegacyQuantized {
        return Err(format!(
            "{} backends do not support {} weights; use native or quantized",
            backend, format
        ));
    }
    if execution_mode == ExecutionMode::Gpu && format == ModelFormat::LegacyQuantized {
        return Err(format!(
            "{} execution does not support {} weights; use native or quantized",
            execution_mode, format
        ));
    }
    Ok(())
}

/// Load-time knobs that come from the service configuration.
#[derive(Debug, Clone, Copy)]
pub struct RegistryOptions {
    pub base_port: u16,
    pub default_idle_timeout: Duration,
}

impl From<&Config> for RegistryOptions {
    fn from(config: &Config) -> Self {
        Self {
            base_port: config.lifecycle.base_port,
            default_idle_timeout: Duration::from_secs(config.lifecycle.default_idle_timeout_secs),
        }
    }
}

impl Default for RegistryOptions {
    fn default() -> Self {
        Self {
            base_port: 30000,
            default_idle_timeout: Duration::from_secs(300),
        }
    }
}

/// Index of every registered model.
#[derive(Debug, Default)]
pub struct ModelRegistry {
    /// Descriptors in file order.
    models: Vec<Arc<ModelDescriptor>>,
    by_name: HashMap<String, usize>,
    source: Option<PathBuf>,
    options: RegistryOptions,
}

impl ModelRegistry {
    /// Read and validate the descriptor file at `path`.
    pub fn load(path: impl AsRef<Path>, options: RegistryOptions) -> Result<Self, RegistryError> {
        let path = path.as_ref().to_path_buf();
        let mut registry = Self::parse_file(&path, options)?;
        registry.source = Some(path);
        Ok(registry)
    }

    /// Build a registry from YAML text.
    pub fn from_yaml(yaml: &str, options: RegistryOptions) -> Result<Self, RegistryError> {
        let file: ModelsFile = serde_yaml::from_str(yaml)?;
        let entries = file.models.ok_or(RegistryError::MissingModels)?;
        Self::from_entries(entries, options)
    }

    /// Re-read the file this registry was loaded from.
    ///
    /// The current index is kept if the new file does not validate.
    pub fn reload(&mut self) -> Result<(), RegistryError> {
        let Some(path) = self.source.clone() else {
            return Ok(());
        };
        let mut fresh = Self::parse_file(&path, self.options)?;
        fresh.source = Some(path);
        *self = fresh;
        tracing::info!("Reloaded {} model descriptors", self.models.len());
        Ok(())
    }

    fn parse_file(path: &Path, options: RegistryOptions) -> Result<Self, RegistryError> {
        let yaml = std::fs::read_to_string(path).map_err(|source| RegistryError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&yaml, options)
    }

    fn from_entries(
        entries: Vec<ModelEntry>,
        options: RegistryOptions,
    ) -> Result<Self, RegistryError> {
        // Explicit ports are claimed first so the counter can skip them.
        let mut claimed: HashMap<u16, String> = HashMap::new();
        let mut names = HashSet::new();
        for entry in &entries {
            if !names.insert(entry.name.as_str()) {
                return Err(RegistryError::DuplicateName(entry.name.clone()));
            }
            if let Some(port) = entry.port {
                if let Some(first) = claimed.insert(port, entry.name.clone()) {
                    return Err(RegistryError::DuplicatePort {
                        port,
                        first,
                        second: entry.name.clone(),
                    });
                }
            }
        }

        let mut next_port = options.base_port;
        let mut models = Vec::with_capacity(entries.len());
        let mut by_name = HashMap::with_capacity(entries.len());

        for entry in entries {
            check_compatibility(entry.backend, entry.execution_mode, entry.format).map_err(
                |reason| RegistryError::Invalid {
                    model: entry.name.clone(),
                    reason,
                },
            )?;

            let port = match entry.port {
                Some(port) => port,
                None => {
                    while claimed.contains_key(&next_port) {
                        next_port = next_port.checked_add(1).ok_or_else(|| {
                            RegistryError::Invalid {
                                model: entry.name.clone(),
                                reason: "ran out of ports to assign".to_string(),
                            }
                        })?;
                    }
                    let port = next_port;
                    claimed.insert(port, entry.name.clone());
                    port
                }
            };

            let descriptor = ModelDescriptor {
                idle_timeout: entry
                    .idle_timeout
                    .map(Duration::from_secs)
                    .unwrap_or(options.default_idle_timeout),
                name: entry.name,
                model_type: entry.model_type,
                execution_mode: entry.execution_mode,
                backend: entry.backend,
                model_path: entry.model_path,
                format: entry.format,
                gpu_id: entry.gpu_id,
                port,
                is_default: entry.default,
                is_embedding: entry.is_embedding,
                trust_remote_code: entry.trust_remote_code,
                dtype: entry.dtype,
                cpu_offload_target: entry.cpu_offload_target,
            };

            by_name.insert(descriptor.name.clone(), models.len());
            models.push(Arc::new(descriptor));
        }

        Ok(Self {
            models,
            by_name,
            source: None,
            options,
        })
    }

    pub fn get(&self, name: &str) -> Option<Arc<ModelDescriptor>> {
        self.by_name.get(name).map(|&idx| self.models[idx].clone())
    }

    /// Descriptors in file order, optionally filtered.
    pub fn list(
        &self,
        execution_mode: Option<ExecutionMode>,
        model_type: Option<ModelType>,
    ) -> Vec<Arc<ModelDescriptor>> {
        self.models
            .iter()
            .filter(|m| execution_mode.map_or(true, |mode| m.execution_mode == mode))
            .filter(|m| model_type.map_or(true, |ty| m.model_type == ty))
            .cloned()
            .collect()
    }

    /// First descriptor flagged as default for a model type.
    pub fn default_for(&self, model_type: ModelType) -> Option<Arc<ModelDescriptor>> {
        self.models
            .iter()
            .find(|m| m.model_type == model_type && m.is_default)
            .cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.models.iter().map(|m| m.name.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    /// `(model, target)` pairs whose offload target is not registered.
    pub fn dangling_offload_targets(&self) -> Vec<(String, String)> {
        self.models
            .iter()
            .filter_map(|m| {
                let target = m.cpu_offload_target.as_ref()?;
                (!self.by_name.contains_key(target)).then(|| (m.name.clone(), target.clone()))
            })
            .collect()
    }
}
