//! Model selection and validation.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use unified_inference_common::ModelType;

use crate::backend::Backend;
use crate::error::{Error, Result};
use crate::lifecycle::LifecycleManager;
use crate::registry::{check_compatibility, ModelDescriptor, ModelRegistry};

/// Model name from the `model` field of a JSON body, else the `model` query parameter.
pub fn extract_model_name(body: Option<&Value>, query: &HashMap<String, String>) -> Result<String> {
    let from_body = body
        .and_then(|b| b.get("model"))
        .and_then(Value::as_str)
        .filter(|m| !m.is_empty());

    from_body
        .or_else(|| query.get("model").map(String::as_str).filter(|m| !m.is_empty()))
        .map(str::to_string)
        .ok_or(Error::ModelRequired)
}

const WORK_ENDPOINTS: [(&str, ModelType); 5] = [
    ("/v1/embeddings", ModelType::Embedding),
    ("/v1/rerank", ModelType::Rerank),
    ("/v1/completions", ModelType::Llm),
    ("/v1/chat/completions", ModelType::Llm),
    ("/v1/generate", ModelType::Llm),
];

/// Model type served by a well-known work endpoint or a sub-path of one.
pub fn endpoint_model_type(path: &str) -> Option<ModelType> {
    let path = path.trim_end_matches('/');
    WORK_ENDPOINTS
        .iter()
        .find(|(endpoint, _)| {
            path.strip_prefix(endpoint)
                .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'))
        })
        .map(|(_, model_type)| *model_type)
}

/// Resolves which model a request is for and produces a backend for it.
pub struct ModelSelector {
    registry: Arc<ModelRegistry>,
    lifecycle: Arc<LifecycleManager>,
    infer_default_model: bool,
}

impl ModelSelector {
    pub fn new(
        registry: Arc<ModelRegistry>,
        lifecycle: Arc<LifecycleManager>,
        infer_default_model: bool,
    ) -> Self {
        Self {
            registry,
            lifecycle,
            infer_default_model,
        }
    }

    /// Model named by the request, or the default for the endpoint when enabled.
    pub fn model_for_request(
        &self,
        body: Option<&Value>,
        query: &HashMap<String, String>,
        path: &str,
    ) -> Result<String> {
        match extract_model_name(body, query) {
            Err(Error::ModelRequired) if self.infer_default_model => {
                let Some(model_type) = endpoint_model_type(path) else {
                    return Err(Error::ModelRequired);
                };
                self.registry
                    .default_for(model_type)
                    .map(|d| d.name.clone())
                    .ok_or(Error::NoDefaultModel(model_type))
            }
            other => other,
        }
    }

    pub fn validate_model(&self, name: &str) -> Result<Arc<ModelDescriptor>> {
        let descriptor = self.registry.get(name).ok_or_else(|| Error::ModelNotFound {
            model: name.to_string(),
            available: self.registry.names(),
        })?;

        check_compatibility(descriptor.backend, descriptor.execution_mode, descriptor.format)
            .map_err(|reason| Error::FormatNotSupported {
                model: name.to_string(),
                reason,
            })?;

        Ok(descriptor)
    }

    /// A healthy backend for `name`, auto-starting it.
    pub async fn select_backend(&self, name: &str) -> Result<Arc<dyn Backend>> {
        self.lifecycle.get_backend(name, true).await.map_err(|e| {
            tracing::warn!("No backend available for {}: {}", name, e);
            Error::ModelUnavailable(name.to_string())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::LifecycleSettings;
    use crate::test_util::{registry_from_yaml, FakeBackendFactory, FakeBehavior};
    use serde_json::json;
    use std::time::Duration;
    use unified_inference_common::ExecutionMode;

    const MODELS: &str = r#"
models:
  - {name: embedder, type: embedding, execution_mode: gpu, backend: process, model_path: e, format: native, default: true}
  - {name: reranker, type: rerank, execution_mode: gpu, backend: process, model_path: r, format: native}
  - {name: chat-cpu, type: llm, execution_mode: cpu, backend: placeholder, model_path: c, format: gguf}
"#;

    fn selector(factory: Arc<FakeBackendFactory>, infer_default_model: bool) -> ModelSelector {
        let registry = registry_from_yaml(MODELS).unwrap();
        let lifecycle = Arc::new(LifecycleManager::new(
            registry.clone(),
            factory,
            LifecycleSettings {
                execution_mode: ExecutionMode::Gpu,
                health_check_interval: Duration::from_secs(10),
                idle_check_interval: Duration::from_secs(30),
            },
        ));
        ModelSelector::new(registry, lifecycle, infer_default_model)
    }

    fn query(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_extract_prefers_body() {
        let body = json!({"model": "embedder", "input": "hi"});
        let name = extract_model_name(Some(&body), &query(&[("model", "other")])).unwrap();
        assert_eq!(name, "embedder");
    }

    #[test]
    fn test_extract_falls_back_to_query() {
        let body = json!({"input": "hi"});
        let name = extract_model_name(Some(&body), &query(&[("model", "reranker")])).unwrap();
        assert_eq!(name, "reranker");

        let name = extract_model_name(None, &query(&[("model", "reranker")])).unwrap();
        assert_eq!(name, "reranker");
    }

    #[test]
    fn test_extract_requires_model() {
        let body = json!({"model": 42});
        assert!(matches!(
            extract_model_name(Some(&body), &HashMap::new()),
            Err(Error::ModelRequired)
        ));
        assert!(matches!(
            extract_model_name(None, &query(&[("model", "")])),
            Err(Error::ModelRequired)
        ));
    }

    #[test]
    fn test_endpoint_model_type() {
        assert_eq!(endpoint_model_type("/v1/embeddings"), Some(ModelType::Embedding));
        assert_eq!(endpoint_model_type("/v1/rerank/"), Some(ModelType::Rerank));
        assert_eq!(endpoint_model_type("/v1/chat/completions"), Some(ModelType::Llm));
        assert_eq!(
            endpoint_model_type("/v1/chat/completions/stream"),
            Some(ModelType::Llm)
        );
        assert_eq!(endpoint_model_type("/v1/embeddings_v2"), None);
        assert_eq!(endpoint_model_type("/v1/models"), None);
        assert_eq!(endpoint_model_type("/"), None);
    }

    #[test]
    fn test_default_model_by_endpoint() {
        let selector = selector(Arc::new(FakeBackendFactory::new()), true);
        let body = json!({"input": "hi"});

        let name = selector
            .model_for_request(Some(&body), &HashMap::new(), "/v1/embeddings")
            .unwrap();
        assert_eq!(name, "embedder");

        assert!(matches!(
            selector.model_for_request(Some(&body), &HashMap::new(), "/v1/rerank"),
            Err(Error::NoDefaultModel(ModelType::Rerank))
        ));
        assert!(matches!(
            selector.model_for_request(Some(&body), &HashMap::new(), "/custom"),
            Err(Error::ModelRequired)
        ));
    }

    #[test]
    fn test_default_model_disabled() {
        let selector = selector(Arc::new(FakeBackendFactory::new()), false);
        assert!(matches!(
            selector.model_for_request(None, &HashMap::new(), "/v1/embeddings"),
            Err(Error::ModelRequired)
        ));
    }

    #[test]
    fn test_validate_unknown_model_lists_available() {
        let selector = selector(Arc::new(FakeBackendFactory::new()), false);
        match selector.validate_model("ghost") {
            Err(Error::ModelNotFound { model, available }) => {
                assert_eq!(model, "ghost");
                assert_eq!(available, vec!["embedder", "reranker", "chat-cpu"]);
            }
            other => panic!("expected ModelNotFound, got {:?}", other.map(|d| d.name.clone())),
        }
        assert_eq!(selector.validate_model("embedder").unwrap().name, "embedder");
    }

    #[tokio::test]
    async fn test_select_backend_auto_starts() {
        let factory = Arc::new(FakeBackendFactory::new());
        let selector = selector(factory.clone(), false);

        let backend = selector.select_backend("embedder").await.unwrap();
        assert_eq!(backend.name(), "embedder");
        assert_eq!(factory.start_count("embedder"), 1);
    }

    #[tokio::test]
    async fn test_select_backend_unavailable() {
        let factory = Arc::new(FakeBackendFactory::new());
        factory.set_behavior("reranker", FakeBehavior::fail_start("out of memory"));
        let selector = selector(factory.clone(), false);

        assert!(matches!(
            selector.select_backend("reranker").await,
            Err(Error::ModelUnavailable(ref name)) if name == "reranker"
        ));
        // Other execution mode
        assert!(matches!(
            selector.select_backend("chat-cpu").await,
            Err(Error::ModelUnavailable(_))
        ));
        assert_eq!(factory.start_count("chat-cpu"), 0);
    }
}
