//! Backend abstraction layer.
//!
//! A backend owns one model server (usually a subprocess) and its health and
//! metrics contract. The lifecycle manager only talks to backends through the
//! `Backend` trait, which keeps fakes easy to substitute in tests.

mod placeholder;
mod process;

pub use placeholder::PlaceholderBackend;
pub use process::{command_args, command_env, ProcessBackend};

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::RwLock;
use unified_inference_common::{BackendKind, BackendStatusSnapshot, LifecycleState};

use crate::config::{Config, ProcessConfig};
use crate::registry::ModelDescriptor;

/// Errors from starting or stopping a backend.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Process died: {0}")]
    Died(String),

    #[error("Backend did not become healthy within {0:?}")]
    StartupTimeout(Duration),

    #[error("{0} backend is not implemented")]
    NotImplemented(BackendKind),

    #[error("Failed to stop backend: {0}")]
    Stop(String),
}

/// Load reported by a backend.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BackendMetrics {
    pub queue_length: u32,
    pub capacity: u32,
    /// Raw introspection payload, when the backend exposes one.
    pub details: Option<Value>,
}

#[derive(Debug, Default)]
struct StatusInner {
    state: LifecycleState,
    pid: Option<u32>,
    started_at: Option<(Instant, DateTime<Utc>)>,
    last_request: Option<(Instant, DateTime<Utc>)>,
    error: Option<String>,
}

/// Mutable runtime status of one backend.
///
/// Written by the backend's own start/stop/health operations; the proxy only
/// touches it through `mark_request`.
#[derive(Debug, Default)]
pub struct BackendStatus {
    inner: RwLock<StatusInner>,
}

impl BackendStatus {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn state(&self) -> LifecycleState {
        self.inner.read().await.state
    }

    pub async fn pid(&self) -> Option<u32> {
        self.inner.read().await.pid
    }

    pub async fn error(&self) -> Option<String> {
        self.inner.read().await.error.clone()
    }

    pub async fn set_starting(&self, pid: Option<u32>) {
        let mut inner = self.inner.write().await;
        inner.state = LifecycleState::Starting;
        inner.pid = pid;
        inner.error = None;
    }

    /// Backend answered its health endpoint for the first time.
    pub async fn set_ready(&self) {
        let mut inner = self.inner.write().await;
        inner.state = LifecycleState::RunningHealthy;
        inner.started_at = Some((Instant::now(), Utc::now()));
        inner.error = None;
    }

    /// Record a health probe result. Ignored unless the backend is running.
    pub async fn set_healthy(&self, healthy: bool) {
        let mut inner = self.inner.write().await;
        if inner.state.is_running() {
            inner.state = if healthy {
                LifecycleState::RunningHealthy
            } else {
                LifecycleState::RunningUnhealthy
            };
        }
    }

    pub async fn set_stopped(&self) {
        let mut inner = self.inner.write().await;
        inner.state = LifecycleState::Stopped;
        inner.pid = None;
        inner.started_at = None;
    }

    /// Stopped with a reason, shown in the status snapshot.
    pub async fn fail(&self, error: impl Into<String>) {
        let mut inner = self.inner.write().await;
        inner.state = LifecycleState::Stopped;
        inner.pid = None;
        inner.started_at = None;
        inner.error = Some(error.into());
    }

    pub async fn mark_request(&self) {
        self.mark_request_at(Instant::now()).await;
    }

    pub async fn mark_request_at(&self, at: Instant) {
        let wall = Utc::now()
            - chrono::Duration::from_std(at.elapsed()).unwrap_or_else(|_| chrono::Duration::zero());
        self.inner.write().await.last_request = Some((at, wall));
    }

    /// True once a request has been served and nothing arrived for longer than `timeout`.
    /// A zero timeout never goes idle.
    pub async fn is_idle(&self, timeout: Duration) -> bool {
        if timeout.is_zero() {
            return false;
        }
        match self.inner.read().await.last_request {
            Some((at, _)) => at.elapsed() > timeout,
            None => false,
        }
    }

    pub async fn snapshot(&self, url: String, restarts: u32) -> BackendStatusSnapshot {
        let inner = self.inner.read().await;
        BackendStatusSnapshot {
            state: inner.state,
            is_running: inner.state.is_running(),
            is_healthy: inner.state.is_healthy(),
            pid: inner.pid,
            url,
            uptime_secs: inner
                .started_at
                .map(|(at, _)| at.elapsed().as_secs_f64()),
            last_request_time: inner.last_request.map(|(_, wall)| wall),
            error: inner.error.clone(),
            restarts,
        }
    }
}

/// Contract every model backend implements.
#[async_trait]
pub trait Backend: Send + Sync {
    fn kind(&self) -> BackendKind;

    fn descriptor(&self) -> &Arc<ModelDescriptor>;

    fn status(&self) -> &BackendStatus;

    /// Base URL work requests are forwarded to.
    fn url(&self) -> String;

    fn name(&self) -> &str {
        &self.descriptor().name
    }

    /// Bring the backend up and wait until it is healthy.
    async fn start(&self) -> Result<(), BackendError>;

    /// Graceful termination, then force after the grace period.
    async fn stop(&self) -> Result<(), BackendError>;

    /// Short probe of the health endpoint. Updates the running state.
    async fn health_check(&self) -> bool;

    /// Current load. Never fails; unreachable backends report zeros.
    async fn metrics(&self) -> BackendMetrics;

    /// Whether the underlying process is confirmed dead.
    async fn has_exited(&self) -> bool {
        false
    }

    async fn is_idle(&self) -> bool {
        self.status().is_idle(self.descriptor().idle_timeout).await
    }

    async fn mark_request(&self) {
        self.status().mark_request().await;
    }
}

/// Knobs shared by every backend the factory creates.
#[derive(Debug, Clone)]
pub struct BackendSettings {
    pub process: ProcessConfig,
    pub startup_timeout: Duration,
    pub shutdown_grace_period: Duration,
}

impl From<&Config> for BackendSettings {
    fn from(config: &Config) -> Self {
        Self {
            process: config.process.clone(),
            startup_timeout: config.startup_timeout(),
            shutdown_grace_period: config.shutdown_grace_period(),
        }
    }
}

impl BackendSettings {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.process.probe_timeout_secs)
    }

    pub fn url_for(&self, descriptor: &ModelDescriptor) -> String {
        format!("http://{}:{}", self.process.host, descriptor.port)
    }
}

/// Builds a backend for a descriptor.
pub trait BackendFactory: Send + Sync {
    fn create(&self, descriptor: Arc<ModelDescriptor>) -> Arc<dyn Backend>;
}

/// Picks the backend variant from the descriptor's backend kind.
pub struct DefaultBackendFactory {
    settings: Arc<BackendSettings>,
    http_client: reqwest::Client,
}

impl DefaultBackendFactory {
    pub fn new(settings: BackendSettings) -> Self {
        Self {
            settings: Arc::new(settings),
            http_client: reqwest::Client::new(),
        }
    }
}

impl BackendFactory for DefaultBackendFactory {
    fn create(&self, descriptor: Arc<ModelDescriptor>) -> Arc<dyn Backend> {
        match descriptor.backend {
            BackendKind::Process => Arc::new(ProcessBackend::new(
                descriptor,
                self.settings.clone(),
                self.http_client.clone(),
            )),
            BackendKind::Placeholder => {
                Arc::new(PlaceholderBackend::new(descriptor, &self.settings))
            }
        }
    }
}
