//! Shared application state.

use std::sync::Arc;

use crate::config::Config;
use crate::lifecycle::LifecycleManager;
use crate::registry::ModelRegistry;
use crate::router::{ModelSelector, OffloadPolicy, OffloadSettings, RequestProxy};

/// Shared application state passed to all handlers.
pub struct AppState {
    pub config: Config,
    pub registry: Arc<ModelRegistry>,
    pub lifecycle: Arc<LifecycleManager>,
    pub selector: ModelSelector,
    pub offload: OffloadPolicy,
    pub proxy: RequestProxy,
}

impl AppState {
    pub fn new(
        config: Config,
        registry: Arc<ModelRegistry>,
        lifecycle: Arc<LifecycleManager>,
    ) -> Result<Self, reqwest::Error> {
        let selector = ModelSelector::new(
            Arc::clone(&registry),
            Arc::clone(&lifecycle),
            config.proxy.infer_default_model,
        );
        let offload = OffloadPolicy::new(Arc::clone(&lifecycle), OffloadSettings::from(&config));
        let proxy = RequestProxy::from_config(&config)?;

        Ok(Self {
            config,
            registry,
            lifecycle,
            selector,
            offload,
            proxy,
        })
    }
}
