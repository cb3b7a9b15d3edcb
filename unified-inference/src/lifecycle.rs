//! Backend lifecycle management.
//!
//! The manager owns the map of started backends and the two background loops
//! that keep it honest: a health loop that restarts crashed backends and an
//! idle loop that stops backends nobody used for a while.
//!
//! Starts are serialized per model name. Two requests racing to start the same
//! model share one launch; different models start concurrently.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use unified_inference_common::{BackendStatusSnapshot, ExecutionMode, LifecycleState};

use crate::backend::{Backend, BackendFactory};
use crate::config::Config;
use crate::registry::{ModelDescriptor, ModelRegistry};

/// Errors from lifecycle operations.
#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("Model '{0}' is not registered")]
    UnknownModel(String),

    #[error("Model '{model}' requires {required} execution but this service runs in {service} mode")]
    ModeMismatch {
        model: String,
        required: ExecutionMode,
        service: ExecutionMode,
    },

    #[error("Failed to start model '{model}': {reason}")]
    StartFailed { model: String, reason: String },

    #[error("Failed to stop model '{model}': {reason}")]
    StopFailed { model: String, reason: String },

    #[error("Model '{0}' is running but unhealthy")]
    Unhealthy(String),

    #[error("Model '{0}' is not running")]
    NotRunning(String),
}

/// Why a backend is being started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// A caller asked for this model; its mode must match the service mode.
    Request,
    /// GPU to CPU degrade. A gpu service also admits cpu descriptors here.
    Offload,
}

#[derive(Debug, Clone, Copy)]
pub struct LifecycleSettings {
    pub execution_mode: ExecutionMode,
    pub health_check_interval: Duration,
    pub idle_check_interval: Duration,
}

impl From<&Config> for LifecycleSettings {
    fn from(config: &Config) -> Self {
        Self {
            execution_mode: config.execution_mode,
            health_check_interval: config.health_check_interval(),
            idle_check_interval: config.idle_check_interval(),
        }
    }
}

struct Tracked {
    backend: Arc<dyn Backend>,
    admission: Admission,
    restarts: u32,
}

/// Owns every started backend.
pub struct LifecycleManager {
    registry: Arc<ModelRegistry>,
    factory: Arc<dyn BackendFactory>,
    settings: LifecycleSettings,
    /// Name -> backend, for models started at least once.
    backends: RwLock<HashMap<String, Tracked>>,
    /// Per-name start/stop serialization.
    start_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl LifecycleManager {
    pub fn new(
        registry: Arc<ModelRegistry>,
        factory: Arc<dyn BackendFactory>,
        settings: LifecycleSettings,
    ) -> Self {
        Self {
            registry,
            factory,
            settings,
            backends: RwLock::new(HashMap::new()),
            start_locks: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn execution_mode(&self) -> ExecutionMode {
        self.settings.execution_mode
    }

    /// Start a model on behalf of a caller. Idempotent for healthy backends.
    pub async fn start_model(&self, name: &str) -> Result<Arc<dyn Backend>, LifecycleError> {
        self.start_with(name, Admission::Request).await
    }

    /// Stop a model. Untracked models are already stopped.
    pub async fn stop_model(&self, name: &str) -> Result<(), LifecycleError> {
        if self.registry.get(name).is_none() {
            return Err(LifecycleError::UnknownModel(name.to_string()));
        }

        let lock = self.start_lock(name).await;
        let _guard = lock.lock().await;

        let Some(backend) = self.tracked_backend(name).await else {
            return Ok(());
        };

        tracing::info!("Stopping model {}", name);
        backend
            .stop()
            .await
            .map_err(|e| LifecycleError::StopFailed {
                model: name.to_string(),
                reason: e.to_string(),
            })
    }

    /// A healthy backend for `name`, starting it first if allowed.
    ///
    /// An unhealthy backend is probed again; if it still fails it is replaced.
    pub async fn get_backend(
        &self,
        name: &str,
        auto_start: bool,
    ) -> Result<Arc<dyn Backend>, LifecycleError> {
        self.get_with(name, auto_start, Admission::Request).await
    }

    /// Like `get_backend` for an offload target.
    pub async fn get_offload_backend(&self, name: &str) -> Result<Arc<dyn Backend>, LifecycleError> {
        self.get_with(name, true, Admission::Offload).await
    }

    async fn get_with(
        &self,
        name: &str,
        auto_start: bool,
        admission: Admission,
    ) -> Result<Arc<dyn Backend>, LifecycleError> {
        if let Some(backend) = self.tracked_backend(name).await {
            match backend.status().state().await {
                LifecycleState::RunningHealthy => return Ok(backend),
                LifecycleState::RunningUnhealthy if !auto_start => {
                    return Err(LifecycleError::Unhealthy(name.to_string()))
                }
                _ => {}
            }
        }

        if !auto_start {
            return Err(LifecycleError::NotRunning(name.to_string()));
        }
        self.start_with(name, admission).await
    }

    fn check_admission(
        &self,
        descriptor: &ModelDescriptor,
        admission: Admission,
    ) -> Result<(), LifecycleError> {
        let service = self.settings.execution_mode;
        let required = descriptor.execution_mode;
        let admitted = required == service
            || (admission == Admission::Offload
                && service == ExecutionMode::Gpu
                && required == ExecutionMode::Cpu);

        if admitted {
            Ok(())
        } else {
            Err(LifecycleError::ModeMismatch {
                model: descriptor.name.clone(),
                required,
                service,
            })
        }
    }

    async fn start_with(
        &self,
        name: &str,
        admission: Admission,
    ) -> Result<Arc<dyn Backend>, LifecycleError> {
        let descriptor = self
            .registry
            .get(name)
            .ok_or_else(|| LifecycleError::UnknownModel(name.to_string()))?;
        self.check_admission(&descriptor, admission)?;

        if let Some(backend) = self.healthy_backend(name).await {
            return Ok(backend);
        }

        let lock = self.start_lock(name).await;
        let _guard = lock.lock().await;

        // Someone else may have finished starting it while we waited.
        if let Some(backend) = self.healthy_backend(name).await {
            return Ok(backend);
        }

        let mut replacing = false;
        if let Some(backend) = self.tracked_backend(name).await {
            if backend.status().state().await == LifecycleState::RunningUnhealthy {
                if backend.health_check().await {
                    tracing::info!("Model {} is healthy again", name);
                    return Ok(backend);
                }
                tracing::warn!("Model {} is still unhealthy, replacing it", name);
                replacing = true;
            }
        }

        let backend = self.factory.create(descriptor);
        let previous = {
            let mut backends = self.backends.write().await;
            let restarts = backends.get(name).map_or(0, |t| t.restarts) + u32::from(replacing);
            backends.insert(
                name.to_string(),
                Tracked {
                    backend: Arc::clone(&backend),
                    admission,
                    restarts,
                },
            )
        };

        if let Some(previous) = previous {
            if previous.backend.status().state().await != LifecycleState::Stopped {
                if let Err(e) = previous.backend.stop().await {
                    tracing::warn!("Failed to stop previous backend for {}: {}", name, e);
                }
            }
        }

        tracing::info!("Starting model {} ({} backend)", name, backend.kind());
        match backend.start().await {
            Ok(()) => {
                tracing::info!("Model {} is running at {}", name, backend.url());
                Ok(backend)
            }
            Err(e) => {
                // Never leave the entry in Starting.
                backend.status().fail(e.to_string()).await;
                tracing::error!("Failed to start model {}: {}", name, e);
                Err(LifecycleError::StartFailed {
                    model: name.to_string(),
                    reason: e.to_string(),
                })
            }
        }
    }

    async fn start_lock(&self, name: &str) -> Arc<Mutex<()>> {
        let mut locks = self.start_locks.lock().await;
        Arc::clone(locks.entry(name.to_string()).or_default())
    }

    async fn tracked_backend(&self, name: &str) -> Option<Arc<dyn Backend>> {
        let backends = self.backends.read().await;
        backends.get(name).map(|t| Arc::clone(&t.backend))
    }

    async fn healthy_backend(&self, name: &str) -> Option<Arc<dyn Backend>> {
        let backend = self.tracked_backend(name).await?;
        let healthy = backend.status().state().await == LifecycleState::RunningHealthy;
        healthy.then_some(backend)
    }

    /// Lifecycle state of a name; `Absent` if it was never started.
    pub async fn state(&self, name: &str) -> LifecycleState {
        match self.tracked_backend(name).await {
            Some(backend) => backend.status().state().await,
            None => LifecycleState::Absent,
        }
    }

    /// Tracked entries that are currently running, copied out of the lock.
    async fn running(&self) -> Vec<(String, Arc<dyn Backend>, Admission)> {
        let entries: Vec<_> = {
            let backends = self.backends.read().await;
            backends
                .iter()
                .map(|(name, t)| (name.clone(), Arc::clone(&t.backend), t.admission))
                .collect()
        };

        let mut running = Vec::with_capacity(entries.len());
        for (name, backend, admission) in entries {
            if backend.status().state().await.is_running() {
                running.push((name, backend, admission));
            }
        }
        running
    }

    /// One pass of the health loop.
    ///
    /// Failing backends whose process is confirmed dead are stopped and
    /// restarted immediately, without backoff.
    pub async fn check_health(&self) {
        for (name, backend, admission) in self.running().await {
            if backend.health_check().await {
                continue;
            }
            tracing::warn!("Model {} failed its health check", name);

            if !backend.has_exited().await {
                continue;
            }

            tracing::error!("Model {} process died, restarting", name);
            if let Err(e) = backend.stop().await {
                tracing::warn!("Failed to clean up crashed model {}: {}", name, e);
            }

            let restarts = {
                let mut backends = self.backends.write().await;
                match backends.get_mut(&name) {
                    Some(tracked) => {
                        tracked.restarts += 1;
                        tracked.restarts
                    }
                    None => continue,
                }
            };
            tracing::warn!("Restarting model {} (restart #{})", name, restarts);

            if let Err(e) = self.start_with(&name, admission).await {
                tracing::error!("Restart of model {} failed: {}", name, e);
            }
        }
    }

    /// One pass of the idle loop.
    pub async fn check_idle(&self) {
        for (name, backend, _) in self.running().await {
            if !backend.is_idle().await {
                continue;
            }
            tracing::info!(
                "Model {} idle for more than {:?}, stopping",
                name,
                backend.descriptor().idle_timeout
            );
            if let Err(e) = self.stop_model(&name).await {
                tracing::warn!("Failed to stop idle model {}: {}", name, e);
            }
        }
    }

    /// Spawn the health and idle loops. They run until `shutdown`.
    pub async fn spawn_background_tasks(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock().await;
        if !tasks.is_empty() {
            tracing::debug!("Background tasks already running");
            return;
        }

        let health = {
            let manager = Arc::clone(self);
            let interval = self.settings.health_check_interval;
            self.spawn_loop("health", interval, move || {
                let manager = Arc::clone(&manager);
                async move { manager.check_health().await }
            })
        };
        let idle = {
            let manager = Arc::clone(self);
            let interval = self.settings.idle_check_interval;
            self.spawn_loop("idle", interval, move || {
                let manager = Arc::clone(&manager);
                async move { manager.check_idle().await }
            })
        };

        tasks.extend([health, idle]);
    }

    fn spawn_loop<F, Fut>(&self, label: &'static str, period: Duration, pass: F) -> JoinHandle<()>
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let token = self.shutdown.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = pass() => {}
                }
            }
            tracing::debug!("{} check loop stopped", label);
        })
    }

    /// Cancel and join the background loops, then stop every tracked backend.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();

        let tasks: Vec<_> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!("Background task ended abnormally: {}", e);
            }
        }

        let backends: Vec<_> = {
            let backends = self.backends.read().await;
            backends
                .iter()
                .map(|(name, t)| (name.clone(), Arc::clone(&t.backend)))
                .collect()
        };
        for (name, backend) in backends {
            if backend.status().state().await == LifecycleState::Stopped {
                continue;
            }
            tracing::info!("Stopping model {} for shutdown", name);
            if let Err(e) = backend.stop().await {
                tracing::warn!("Failed to stop model {}: {}", name, e);
            }
        }
    }

    /// Snapshot of every tracked backend.
    pub async fn status(&self) -> BTreeMap<String, BackendStatusSnapshot> {
        let entries: Vec<_> = {
            let backends = self.backends.read().await;
            backends
                .iter()
                .map(|(name, t)| (name.clone(), Arc::clone(&t.backend), t.restarts))
                .collect()
        };

        let mut snapshots = BTreeMap::new();
        for (name, backend, restarts) in entries {
            let snapshot = backend.status().snapshot(backend.url(), restarts).await;
            snapshots.insert(name, snapshot);
        }
        snapshots
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendSettings, DefaultBackendFactory};
    use crate::config::ProcessConfig;
    use crate::registry::RegistryOptions;
    use crate::test_util::{FakeBackendFactory, FakeBehavior};
    use std::time::Instant;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const MODELS: &str = r#"
models:
  - {name: embedder, type: embedding, execution_mode: gpu, backend: process, model_path: e, format: native, default: true, idle_timeout: 1, cpu_offload_target: embedder-cpu}
  - {name: embedder-cpu, type: embedding, execution_mode: cpu, backend: process, model_path: e, format: native}
  - {name: chat, type: llm, execution_mode: gpu, backend: process, model_path: c, format: native, idle_timeout: 0}
"#;

    fn manager(factory: Arc<FakeBackendFactory>) -> Arc<LifecycleManager> {
        let registry = ModelRegistry::from_yaml(MODELS, RegistryOptions::default()).unwrap();
        Arc::new(LifecycleManager::new(
            Arc::new(registry),
            factory,
            LifecycleSettings {
                execution_mode: ExecutionMode::Gpu,
                health_check_interval: Duration::from_millis(50),
                idle_check_interval: Duration::from_millis(50),
            },
        ))
    }

    #[tokio::test]
    async fn test_concurrent_starts_spawn_once() {
        let factory = Arc::new(FakeBackendFactory::new());
        factory.set_behavior("embedder", FakeBehavior::start_delay(Duration::from_millis(100)));
        let manager = manager(factory.clone());

        let mut handles = Vec::new();
        for _ in 0..8 {
            let manager = Arc::clone(&manager);
            handles.push(tokio::spawn(async move {
                manager.start_model("embedder").await.is_ok()
            }));
        }
        for handle in handles {
            assert!(handle.await.unwrap());
        }

        assert_eq!(factory.start_count("embedder"), 1);
        assert_eq!(manager.state("embedder").await, LifecycleState::RunningHealthy);
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let factory = Arc::new(FakeBackendFactory::new());
        let manager = manager(factory.clone());

        manager.start_model("embedder").await.unwrap();
        manager.start_model("embedder").await.unwrap();
        assert_eq!(factory.start_count("embedder"), 1);
    }

    #[tokio::test]
    async fn test_mode_mismatch_fails_without_state_change() {
        let factory = Arc::new(FakeBackendFactory::new());
        let manager = manager(factory.clone());

        let err = manager.start_model("embedder-cpu").await.err().unwrap();
        assert!(matches!(err, LifecycleError::ModeMismatch { .. }));
        assert_eq!(factory.start_count("embedder-cpu"), 0);
        assert_eq!(manager.state("embedder-cpu").await, LifecycleState::Absent);
        assert!(manager.status().await.is_empty());
    }

    #[tokio::test]
    async fn test_offload_admits_cpu_model_in_gpu_mode() {
        let factory = Arc::new(FakeBackendFactory::new());
        let manager = manager(factory.clone());

        let backend = manager.get_offload_backend("embedder-cpu").await.unwrap();
        assert_eq!(backend.name(), "embedder-cpu");
    }

    #[tokio::test]
    async fn test_unknown_model() {
        let manager = manager(Arc::new(FakeBackendFactory::new()));
        let err = manager.start_model("ghost").await.err().unwrap();
        assert!(matches!(err, LifecycleError::UnknownModel(_)));
        assert!(matches!(
            manager.stop_model("ghost").await,
            Err(LifecycleError::UnknownModel(_))
        ));
    }

    #[tokio::test]
    async fn test_get_backend_auto_starts() {
        let factory = Arc::new(FakeBackendFactory::new());
        let manager = manager(factory.clone());

        assert_eq!(manager.state("embedder").await, LifecycleState::Absent);
        assert!(matches!(
            manager.get_backend("embedder", false).await,
            Err(LifecycleError::NotRunning(_))
        ));

        let backend = manager.get_backend("embedder", true).await.unwrap();
        assert_eq!(backend.name(), "embedder");
        assert_eq!(manager.state("embedder").await, LifecycleState::RunningHealthy);
    }

    #[tokio::test]
    async fn test_failed_start_leaves_stopped() {
        let factory = Arc::new(FakeBackendFactory::new());
        factory.set_behavior("embedder", FakeBehavior::fail_start("boom"));
        let manager = manager(factory.clone());

        assert!(manager.get_backend("embedder", true).await.is_err());
        assert_eq!(manager.state("embedder").await, LifecycleState::Stopped);

        let status = manager.status().await;
        assert!(status["embedder"].error.as_deref().unwrap().contains("boom"));
    }

    #[tokio::test]
    async fn test_stop_model() {
        let factory = Arc::new(FakeBackendFactory::new());
        let manager = manager(factory.clone());

        // Never started: nothing to do
        manager.stop_model("chat").await.unwrap();

        manager.start_model("chat").await.unwrap();
        manager.stop_model("chat").await.unwrap();
        assert_eq!(manager.state("chat").await, LifecycleState::Stopped);
        assert_eq!(factory.stop_count("chat"), 1);

        // Restartable after a manual stop
        manager.start_model("chat").await.unwrap();
        assert_eq!(factory.start_count("chat"), 2);
    }

    #[tokio::test]
    async fn test_idle_backends_are_stopped() {
        let factory = Arc::new(FakeBackendFactory::new());
        let manager = manager(factory.clone());

        let idle = manager.start_model("embedder").await.unwrap();
        idle.status()
            .mark_request_at(Instant::now() - Duration::from_secs(2))
            .await;

        let busy = manager.start_model("chat").await.unwrap();
        busy.status()
            .mark_request_at(Instant::now() - Duration::from_secs(2))
            .await;

        manager.check_idle().await;
        assert_eq!(manager.state("embedder").await, LifecycleState::Stopped);
        // chat has idle_timeout 0
        assert_eq!(manager.state("chat").await, LifecycleState::RunningHealthy);
    }

    #[tokio::test]
    async fn test_recently_used_backend_is_left_running() {
        let factory = Arc::new(FakeBackendFactory::new());
        let manager = manager(factory.clone());

        let backend = manager.start_model("embedder").await.unwrap();
        backend.mark_request().await;

        manager.check_idle().await;
        assert_eq!(manager.state("embedder").await, LifecycleState::RunningHealthy);
    }

    #[tokio::test]
    async fn test_crashed_backend_is_restarted() {
        let factory = Arc::new(FakeBackendFactory::new());
        let manager = manager(factory.clone());

        manager.start_model("embedder").await.unwrap();
        let backend = factory.last("embedder").unwrap();
        backend.set_healthy(false);
        backend.set_exited(true);

        manager.check_health().await;

        assert_eq!(factory.start_count("embedder"), 2);
        assert_eq!(manager.state("embedder").await, LifecycleState::RunningHealthy);
        assert_eq!(manager.status().await["embedder"].restarts, 1);
    }

    #[tokio::test]
    async fn test_unhealthy_backend_recovers_on_request() {
        let factory = Arc::new(FakeBackendFactory::new());
        let manager = manager(factory.clone());

        manager.start_model("chat").await.unwrap();
        let backend = factory.last("chat").unwrap();
        backend.set_healthy(false);

        // Alive but failing: the health loop leaves it alone.
        for _ in 0..3 {
            manager.check_health().await;
            manager.check_idle().await;
        }
        assert_eq!(factory.start_count("chat"), 1);
        assert_eq!(manager.state("chat").await, LifecycleState::RunningUnhealthy);
        assert!(matches!(
            manager.get_backend("chat", false).await,
            Err(LifecycleError::Unhealthy(_))
        ));

        backend.set_healthy(true);
        let recovered = manager.get_backend("chat", true).await.unwrap();
        assert_eq!(recovered.name(), "chat");
        assert_eq!(factory.start_count("chat"), 1);
        assert_eq!(factory.created_count("chat"), 1);
        assert_eq!(manager.state("chat").await, LifecycleState::RunningHealthy);
        assert_eq!(manager.status().await["chat"].restarts, 0);
    }

    #[tokio::test]
    async fn test_unhealthy_backend_is_replaced_on_request() {
        let factory = Arc::new(FakeBackendFactory::new());
        let manager = manager(factory.clone());

        manager.start_model("chat").await.unwrap();
        factory.last("chat").unwrap().set_healthy(false);
        manager.check_health().await;
        assert_eq!(manager.state("chat").await, LifecycleState::RunningUnhealthy);

        let backend = manager.get_backend("chat", true).await.unwrap();
        assert_eq!(backend.name(), "chat");
        assert_eq!(factory.created_count("chat"), 2);
        assert_eq!(factory.start_count("chat"), 2);
        assert_eq!(factory.stop_count("chat"), 1);
        assert_eq!(manager.state("chat").await, LifecycleState::RunningHealthy);
        assert_eq!(manager.status().await["chat"].restarts, 1);

        // The replacement is reused from then on
        manager.get_backend("chat", true).await.unwrap();
        assert_eq!(factory.start_count("chat"), 2);
    }

    async fn adopted_manager(server: &MockServer) -> Arc<LifecycleManager> {
        let yaml = format!(
            "models:\n  - {{name: chat, type: llm, execution_mode: gpu, backend: process, model_path: c, format: native, idle_timeout: 0, port: {}}}\n",
            server.address().port()
        );
        let registry = ModelRegistry::from_yaml(&yaml, RegistryOptions::default()).unwrap();
        // Spawning always fails, so any running backend was adopted.
        let settings = BackendSettings {
            process: ProcessConfig {
                program: "/nonexistent/inference-server".to_string(),
                startup_poll_interval_ms: 20,
                probe_timeout_secs: 1,
                ..ProcessConfig::default()
            },
            startup_timeout: Duration::from_secs(2),
            shutdown_grace_period: Duration::from_secs(1),
        };
        Arc::new(LifecycleManager::new(
            Arc::new(registry),
            Arc::new(DefaultBackendFactory::new(settings)),
            LifecycleSettings {
                execution_mode: ExecutionMode::Gpu,
                health_check_interval: Duration::from_secs(10),
                idle_check_interval: Duration::from_secs(30),
            },
        ))
    }

    async fn mount_health(server: &MockServer, status: u16) {
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(status))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn test_adopted_server_recovers_on_request() {
        let server = MockServer::start().await;
        mount_health(&server, 200).await;
        let manager = adopted_manager(&server).await;

        let adopted = manager.start_model("chat").await.unwrap();
        assert!(adopted.status().pid().await.is_none());

        server.reset().await;
        mount_health(&server, 503).await;
        manager.check_health().await;
        assert_eq!(manager.state("chat").await, LifecycleState::RunningUnhealthy);
        assert!(!adopted.has_exited().await);

        server.reset().await;
        mount_health(&server, 200).await;
        let backend = manager.get_backend("chat", true).await.unwrap();
        assert!(Arc::ptr_eq(&backend, &adopted));
        assert_eq!(manager.state("chat").await, LifecycleState::RunningHealthy);
    }

    #[tokio::test]
    async fn test_adopted_server_is_replaced_when_still_unhealthy() {
        let server = MockServer::start().await;
        mount_health(&server, 200).await;
        let manager = adopted_manager(&server).await;

        let adopted = manager.start_model("chat").await.unwrap();

        // Two failed probes (health loop, then the request's re-check),
        // after which the server answers again and is adopted anew.
        server.reset().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(2)
            .with_priority(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(200))
            .with_priority(2)
            .mount(&server)
            .await;

        manager.check_health().await;
        assert_eq!(manager.state("chat").await, LifecycleState::RunningUnhealthy);

        let backend = manager.get_backend("chat", true).await.unwrap();
        assert!(!Arc::ptr_eq(&backend, &adopted));
        assert_eq!(adopted.status().state().await, LifecycleState::Stopped);
        assert_eq!(manager.state("chat").await, LifecycleState::RunningHealthy);
        assert_eq!(manager.status().await["chat"].restarts, 1);
    }

    #[tokio::test]
    async fn test_background_tasks_spawn_once() {
        let manager = manager(Arc::new(FakeBackendFactory::new()));
        manager.spawn_background_tasks().await;
        manager.spawn_background_tasks().await;
        assert_eq!(manager.tasks.lock().await.len(), 2);

        manager.shutdown().await;
        assert!(manager.tasks.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_background_loops_and_shutdown() {
        let factory = Arc::new(FakeBackendFactory::new());
        let manager = manager(factory.clone());
        manager.spawn_background_tasks().await;

        manager.start_model("embedder").await.unwrap();
        let backend = factory.last("embedder").unwrap();
        backend.set_healthy(false);
        backend.set_exited(true);

        // The health loop picks the crash up within a few intervals.
        let deadline = Instant::now() + Duration::from_secs(5);
        while factory.start_count("embedder") < 2 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(factory.start_count("embedder"), 2);

        manager.shutdown().await;
        assert_eq!(manager.state("embedder").await, LifecycleState::Stopped);
        assert!(manager.tasks.lock().await.is_empty());
    }
}
