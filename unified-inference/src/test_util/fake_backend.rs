//! In-memory backends for exercising the lifecycle manager and router.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use unified_inference_common::BackendKind;

use crate::backend::{Backend, BackendError, BackendFactory, BackendMetrics, BackendStatus};
use crate::registry::ModelDescriptor;

/// How a fake backend behaves when started.
#[derive(Debug, Clone, Default)]
pub struct FakeBehavior {
    pub start_delay: Duration,
    /// Every start fails with this output.
    pub start_error: Option<String>,
    /// Serve from this URL instead of the descriptor port.
    pub url: Option<String>,
    pub queue_length: u32,
}

impl FakeBehavior {
    pub fn start_delay(delay: Duration) -> Self {
        Self {
            start_delay: delay,
            ..Self::default()
        }
    }

    pub fn fail_start(output: &str) -> Self {
        Self {
            start_error: Some(output.to_string()),
            ..Self::default()
        }
    }

    pub fn serving_at(url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            ..Self::default()
        }
    }

    pub fn with_queue_length(mut self, queue_length: u32) -> Self {
        self.queue_length = queue_length;
        self
    }
}

pub struct FakeBackend {
    descriptor: Arc<ModelDescriptor>,
    behavior: FakeBehavior,
    status: BackendStatus,
    healthy: AtomicBool,
    exited: AtomicBool,
    queue_length: AtomicU32,
    starts: Arc<AtomicUsize>,
    stops: Arc<AtomicUsize>,
}

impl FakeBackend {
    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    pub fn set_exited(&self, exited: bool) {
        self.exited.store(exited, Ordering::SeqCst);
    }
}

#[async_trait]
impl Backend for FakeBackend {
    fn kind(&self) -> BackendKind {
        self.descriptor.backend
    }

    fn descriptor(&self) -> &Arc<ModelDescriptor> {
        &self.descriptor
    }

    fn status(&self) -> &BackendStatus {
        &self.status
    }

    fn url(&self) -> String {
        self.behavior
            .url
            .clone()
            .unwrap_or_else(|| format!("http://127.0.0.1:{}", self.descriptor.port))
    }

    async fn start(&self) -> Result<(), BackendError> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        self.status.set_starting(None).await;

        if !self.behavior.start_delay.is_zero() {
            tokio::time::sleep(self.behavior.start_delay).await;
        }

        if let Some(output) = &self.behavior.start_error {
            let err = BackendError::Died(output.clone());
            self.status.fail(err.to_string()).await;
            return Err(err);
        }

        self.healthy.store(true, Ordering::SeqCst);
        self.exited.store(false, Ordering::SeqCst);
        self.status.set_ready().await;
        Ok(())
    }

    async fn stop(&self) -> Result<(), BackendError> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.status.set_stopped().await;
        Ok(())
    }

    async fn health_check(&self) -> bool {
        let healthy = self.healthy.load(Ordering::SeqCst);
        self.status.set_healthy(healthy).await;
        healthy
    }

    async fn metrics(&self) -> BackendMetrics {
        BackendMetrics {
            queue_length: self.queue_length.load(Ordering::SeqCst),
            capacity: 3,
            details: None,
        }
    }

    async fn has_exited(&self) -> bool {
        self.exited.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
struct FactoryState {
    behaviors: HashMap<String, FakeBehavior>,
    starts: HashMap<String, Arc<AtomicUsize>>,
    stops: HashMap<String, Arc<AtomicUsize>>,
    created: HashMap<String, Vec<Arc<FakeBackend>>>,
}

/// Builds fake backends and counts what happens to them per model name.
#[derive(Default)]
pub struct FakeBackendFactory {
    state: Mutex<FactoryState>,
}

impl FakeBackendFactory {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, FactoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Applies to backends created after this call.
    pub fn set_behavior(&self, name: &str, behavior: FakeBehavior) {
        self.state().behaviors.insert(name.to_string(), behavior);
    }

    pub fn start_count(&self, name: &str) -> usize {
        self.state()
            .starts
            .get(name)
            .map_or(0, |c| c.load(Ordering::SeqCst))
    }

    pub fn stop_count(&self, name: &str) -> usize {
        self.state()
            .stops
            .get(name)
            .map_or(0, |c| c.load(Ordering::SeqCst))
    }

    pub fn created_count(&self, name: &str) -> usize {
        self.state().created.get(name).map_or(0, Vec::len)
    }

    /// Most recently created backend for a name.
    pub fn last(&self, name: &str) -> Option<Arc<FakeBackend>> {
        self.state()
            .created
            .get(name)
            .and_then(|backends| backends.last().cloned())
    }
}

impl BackendFactory for FakeBackendFactory {
    fn create(&self, descriptor: Arc<ModelDescriptor>) -> Arc<dyn Backend> {
        let mut state = self.state();
        let name = descriptor.name.clone();
        let behavior = state.behaviors.get(&name).cloned().unwrap_or_default();
        let starts = Arc::clone(state.starts.entry(name.clone()).or_default());
        let stops = Arc::clone(state.stops.entry(name.clone()).or_default());

        let backend = Arc::new(FakeBackend {
            descriptor,
            queue_length: AtomicU32::new(behavior.queue_length),
            behavior,
            status: BackendStatus::new(),
            healthy: AtomicBool::new(false),
            exited: AtomicBool::new(false),
            starts,
            stops,
        });
        state
            .created
            .entry(name)
            .or_default()
            .push(Arc::clone(&backend));
        backend
    }
}
