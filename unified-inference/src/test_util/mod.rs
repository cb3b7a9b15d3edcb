pub mod fake_backend;

pub use fake_backend::{FakeBackend, FakeBackendFactory, FakeBehavior};

use std::sync::Arc;
use std::time::Duration;

use unified_inference_common::{BackendKind, ExecutionMode, ModelFormat, ModelType};

use crate::config::Config;
use crate::registry::{ModelDescriptor, ModelRegistry, RegistryError, RegistryOptions};

/// A process-kind, native-format descriptor on the base port.
pub fn descriptor(name: &str, model_type: ModelType, mode: ExecutionMode) -> ModelDescriptor {
    ModelDescriptor {
        name: name.to_string(),
        model_type,
        execution_mode: mode,
        backend: BackendKind::Process,
        model_path: format!("test/{}", name),
        format: ModelFormat::Native,
        gpu_id: None,
        port: 30000,
        idle_timeout: Duration::from_secs(300),
        is_default: false,
        is_embedding: model_type == ModelType::Embedding,
        trust_remote_code: true,
        dtype: Some("auto".to_string()),
        cpu_offload_target: None,
    }
}

pub fn registry_from_yaml(yaml: &str) -> Result<Arc<ModelRegistry>, RegistryError> {
    ModelRegistry::from_yaml(yaml, RegistryOptions::default()).map(Arc::new)
}

pub fn test_config() -> Config {
    let mut config = Config::default();
    config.server.host = "127.0.0.1".to_string();
    config.logging.level = "debug".to_string();
    config
}
