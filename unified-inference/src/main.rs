//! Unified Inference - lazily starts, supervises and proxies to model backends.

use std::env;
use std::sync::Arc;

use tokio::net::TcpListener;
use unified_inference::backend::{BackendSettings, DefaultBackendFactory};
use unified_inference::logging::init_tracing;
use unified_inference::{
    AppState, Config, LifecycleManager, LifecycleSettings, ModelRegistry, RegistryOptions,
};

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn print_version() {
    println!("unified-inference {}", VERSION);
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Handle --version / -V and --config <path>
    let args: Vec<String> = env::args().collect();
    if args.iter().any(|a| a == "--version" || a == "-V") {
        print_version();
        return Ok(());
    }
    let config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(String::as_str);

    // Load configuration
    let config = Config::load(config_path).map_err(|e| {
        format!(
            "Failed to load configuration: {}. \
             Use --config <path> or ORCHESTRATOR__* environment variables.",
            e
        )
    })?;

    init_tracing(&config.logging.level);
    tracing::info!(
        "Starting unified-inference {} in {} mode",
        VERSION,
        config.execution_mode
    );

    // A broken descriptor file is fatal: no partial service.
    let registry = ModelRegistry::load(&config.models_config_path, RegistryOptions::from(&config))
        .map_err(|e| format!("Failed to load {}: {}", config.models_config_path, e))?;
    tracing::info!(
        "Loaded {} models from {}",
        registry.len(),
        config.models_config_path
    );
    for (model, target) in registry.dangling_offload_targets() {
        tracing::warn!(
            "Model {} offloads to unregistered model {}; offload will be rejected",
            model,
            target
        );
    }
    if registry.is_empty() {
        tracing::warn!("No models registered; every proxied request will be rejected");
    }
    let registry = Arc::new(registry);

    let factory = Arc::new(DefaultBackendFactory::new(BackendSettings::from(&config)));
    let lifecycle = Arc::new(LifecycleManager::new(
        Arc::clone(&registry),
        factory,
        LifecycleSettings::from(&config),
    ));
    lifecycle.spawn_background_tasks().await;

    let state = Arc::new(AppState::new(
        config.clone(),
        registry,
        Arc::clone(&lifecycle),
    )?);
    let app = unified_inference::app(state);

    // Start server
    let addr = format!("{}:{}", config.server.host, config.server.port);
    tracing::info!("Listening on {}", addr);

    let listener = TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Shutting down backends");
    lifecycle.shutdown().await;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("Shutdown signal received");
}
