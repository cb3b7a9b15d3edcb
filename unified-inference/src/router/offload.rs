//! GPU to CPU offload.
//!
//! When a GPU backend's queue reaches the threshold, requests are sent to the
//! descriptor's CPU offload target instead. Without a usable target the request
//! is rejected with a retry hint; nothing is queued here.

use std::sync::Arc;

use unified_inference_common::ExecutionMode;

use crate::backend::Backend;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::lifecycle::LifecycleManager;

#[derive(Debug, Clone, Copy)]
pub struct OffloadSettings {
    pub enabled: bool,
    pub execution_mode: ExecutionMode,
    pub queue_threshold: u32,
    pub retry_after_secs: u64,
}

impl From<&Config> for OffloadSettings {
    fn from(config: &Config) -> Self {
        Self {
            enabled: config.offload.enabled,
            execution_mode: config.execution_mode,
            queue_threshold: config.offload.queue_threshold,
            retry_after_secs: config.offload.retry_after_secs,
        }
    }
}

pub struct OffloadPolicy {
    lifecycle: Arc<LifecycleManager>,
    settings: OffloadSettings,
}

impl OffloadPolicy {
    pub fn new(lifecycle: Arc<LifecycleManager>, settings: OffloadSettings) -> Self {
        Self {
            lifecycle,
            settings,
        }
    }

    pub async fn should_offload(&self, backend: &dyn Backend) -> bool {
        if !self.settings.enabled || self.settings.execution_mode != ExecutionMode::Gpu {
            return false;
        }
        backend.metrics().await.queue_length >= self.settings.queue_threshold
    }

    /// The backend that should serve a request for `name`.
    pub async fn select_backend_with_offload(
        &self,
        name: &str,
        primary: Arc<dyn Backend>,
    ) -> Result<Arc<dyn Backend>> {
        if !self.should_offload(primary.as_ref()).await {
            return Ok(primary);
        }

        let overloaded = || Error::Backpressure {
            model: name.to_string(),
            retry_after: self.settings.retry_after_secs,
        };

        let Some(target) = primary.descriptor().cpu_offload_target.clone() else {
            tracing::warn!("GPU backend for {} overloaded and no offload target configured", name);
            return Err(overloaded());
        };

        match self.lifecycle.get_offload_backend(&target).await {
            Ok(backend) => {
                tracing::info!("GPU backend for {} overloaded, offloading to {}", name, target);
                Ok(backend)
            }
            Err(e) => {
                tracing::warn!(
                    "GPU backend for {} overloaded and offload target {} is unavailable: {}",
                    name,
                    target,
                    e
                );
                Err(overloaded())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::LifecycleSettings;
    use crate::test_util::{registry_from_yaml, FakeBackendFactory, FakeBehavior};
    use std::time::Duration;

    const MODELS: &str = r#"
models:
  - {name: embedder, type: embedding, execution_mode: gpu, backend: process, model_path: e, format: native, cpu_offload_target: embedder-cpu}
  - {name: embedder-cpu, type: embedding, execution_mode: cpu, backend: process, model_path: e, format: native}
  - {name: chat, type: llm, execution_mode: gpu, backend: process, model_path: c, format: native}
  - {name: reranker, type: rerank, execution_mode: gpu, backend: process, model_path: r, format: native, cpu_offload_target: ghost}
"#;

    fn setup(factory: Arc<FakeBackendFactory>, settings: OffloadSettings) -> (Arc<LifecycleManager>, OffloadPolicy) {
        let registry = registry_from_yaml(MODELS).unwrap();
        let lifecycle = Arc::new(LifecycleManager::new(
            registry,
            factory,
            LifecycleSettings {
                execution_mode: settings.execution_mode,
                health_check_interval: Duration::from_secs(10),
                idle_check_interval: Duration::from_secs(30),
            },
        ));
        let policy = OffloadPolicy::new(lifecycle.clone(), settings);
        (lifecycle, policy)
    }

    fn gpu_settings() -> OffloadSettings {
        OffloadSettings {
            enabled: true,
            execution_mode: ExecutionMode::Gpu,
            queue_threshold: 3,
            retry_after_secs: 5,
        }
    }

    #[tokio::test]
    async fn test_below_threshold_keeps_primary() {
        let factory = Arc::new(FakeBackendFactory::new());
        factory.set_behavior("embedder", FakeBehavior::default().with_queue_length(2));
        let (lifecycle, policy) = setup(factory, gpu_settings());

        let primary = lifecycle.start_model("embedder").await.unwrap();
        assert!(!policy.should_offload(primary.as_ref()).await);
        let chosen = policy
            .select_backend_with_offload("embedder", primary)
            .await
            .unwrap();
        assert_eq!(chosen.name(), "embedder");
    }

    #[tokio::test]
    async fn test_overloaded_with_target_offloads_to_cpu() {
        let factory = Arc::new(FakeBackendFactory::new());
        factory.set_behavior("embedder", FakeBehavior::default().with_queue_length(3));
        let (lifecycle, policy) = setup(factory.clone(), gpu_settings());

        let primary = lifecycle.start_model("embedder").await.unwrap();
        let chosen = policy
            .select_backend_with_offload("embedder", primary)
            .await
            .unwrap();
        assert_eq!(chosen.name(), "embedder-cpu");
        assert_eq!(factory.start_count("embedder-cpu"), 1);
    }

    #[tokio::test]
    async fn test_overloaded_without_target_is_backpressure() {
        let factory = Arc::new(FakeBackendFactory::new());
        factory.set_behavior("chat", FakeBehavior::default().with_queue_length(10));
        let (lifecycle, policy) = setup(factory, gpu_settings());

        let primary = lifecycle.start_model("chat").await.unwrap();
        let err = policy
            .select_backend_with_offload("chat", primary)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::Backpressure { retry_after: 5, .. }));
    }

    #[tokio::test]
    async fn test_overloaded_with_dangling_target_is_backpressure() {
        let factory = Arc::new(FakeBackendFactory::new());
        factory.set_behavior("reranker", FakeBehavior::default().with_queue_length(3));
        let (lifecycle, policy) = setup(factory, gpu_settings());

        let primary = lifecycle.start_model("reranker").await.unwrap();
        let err = policy
            .select_backend_with_offload("reranker", primary)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::Backpressure { .. }));
    }

    #[tokio::test]
    async fn test_disabled_or_cpu_mode_never_offloads() {
        let factory = Arc::new(FakeBackendFactory::new());
        factory.set_behavior("embedder", FakeBehavior::default().with_queue_length(100));
        let mut settings = gpu_settings();
        settings.enabled = false;
        let (lifecycle, policy) = setup(factory, settings);

        let primary = lifecycle.start_model("embedder").await.unwrap();
        assert!(!policy.should_offload(primary.as_ref()).await);

        let factory = Arc::new(FakeBackendFactory::new());
        factory.set_behavior("embedder-cpu", FakeBehavior::default().with_queue_length(100));
        let mut settings = gpu_settings();
        settings.execution_mode = ExecutionMode::Cpu;
        let (lifecycle, policy) = setup(factory, settings);

        let primary = lifecycle.start_model("embedder-cpu").await.unwrap();
        assert!(!policy.should_offload(primary.as_ref()).await);
    }
}
