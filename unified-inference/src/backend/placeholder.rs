//! Placeholder backend.
//!
//! Stands in for backend kinds that have no implementation yet. Every start
//! fails and is logged, so unsupported paths surface as errors.

use std::sync::Arc;

use async_trait::async_trait;
use unified_inference_common::BackendKind;

use super::{Backend, BackendError, BackendMetrics, BackendSettings, BackendStatus};
use crate::registry::ModelDescriptor;

pub struct PlaceholderBackend {
    descriptor: Arc<ModelDescriptor>,
    url: String,
    status: BackendStatus,
}

impl PlaceholderBackend {
    pub fn new(descriptor: Arc<ModelDescriptor>, settings: &BackendSettings) -> Self {
        Self {
            url: settings.url_for(&descriptor),
            descriptor,
            status: BackendStatus::new(),
        }
    }
}

#[async_trait]
impl Backend for PlaceholderBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Placeholder
    }

    fn descriptor(&self) -> &Arc<ModelDescriptor> {
        &self.descriptor
    }

    fn status(&self) -> &BackendStatus {
        &self.status
    }

    fn url(&self) -> String {
        self.url.clone()
    }

    async fn start(&self) -> Result<(), BackendError> {
        tracing::warn!(
            "Backend kind '{}' for model {} is not implemented; refusing to start",
            BackendKind::Placeholder,
            self.descriptor.name
        );
        let err = BackendError::NotImplemented(BackendKind::Placeholder);
        self.status.fail(err.to_string()).await;
        Err(err)
    }

    async fn stop(&self) -> Result<(), BackendError> {
        self.status.set_stopped().await;
        Ok(())
    }

    async fn health_check(&self) -> bool {
        false
    }

    async fn metrics(&self) -> BackendMetrics {
        BackendMetrics::default()
    }
}
