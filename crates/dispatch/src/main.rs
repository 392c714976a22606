//! EngineLink Dispatch - Main Entry Point
//!
//! Starts an engine process for every configured model version and keeps
//! the registry up to date. Protocol handlers serve requests by embedding
//! `enginelink_dispatch::Dispatcher` over the same registry.

use enginelink_common::telemetry::init_tracing;
use enginelink_common::{EngineLinkConfig, Result, METRICS};
use enginelink_dispatch::{EngineSupervisor, ModelRegistry};
use std::sync::Arc;
use tokio::signal;
use tokio::signal::unix::{signal as unix_signal, SignalKind};
use tracing::{debug, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config_path = std::env::var("ENGINELINK_CONFIG")
        .unwrap_or_else(|_| "configs/enginelink.yaml".to_string());
    let config = EngineLinkConfig::from_file(&config_path)?;

    init_tracing("enginelink_dispatch", &config.observability);
    info!("Starting EngineLink Dispatch");
    info!(
        "Configuration loaded from {}: {} models, sockets in {}",
        config_path,
        config.models.len(),
        config.socket_dir.display()
    );

    tokio::fs::create_dir_all(&config.socket_dir).await?;
    let registry = ModelRegistry::new(
        config.socket_dir.clone(),
        config.dispatch.failure_threshold,
    );

    let supervisor = Arc::new(EngineSupervisor::new(&config, registry.clone())?);
    supervisor.spawn_all(&config).await;

    for model in &config.models {
        match registry.status(&model.name, None).await {
            Ok(status) => {
                for version in status.model_version_status {
                    info!(
                        "[model: {}, version: {}] {:?}",
                        model.name, version.version, version.state
                    );
                }
            }
            Err(e) => warn!("No status for model {}: {}", model.name, e),
        }
    }

    let health_check_handle = supervisor.clone().start_health_checks();

    info!("EngineLink Dispatch running");

    // Wait for shutdown signal
    let mut terminate = unix_signal(SignalKind::terminate())?;
    tokio::select! {
        _ = signal::ctrl_c() => info!("Received interrupt"),
        _ = terminate.recv() => info!("Received terminate signal"),
    }

    health_check_handle.abort();
    supervisor.shutdown().await;
    debug!("Final metrics:\n{}", METRICS.gather());

    info!("EngineLink Dispatch shutdown complete");
    Ok(())
}
