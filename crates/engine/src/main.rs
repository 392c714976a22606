//! EngineLink Engine - Main Entry Point
//!
//! Serves one model version named by the environment. Normally started by
//! the dispatch front-end's supervisor.

use enginelink_common::telemetry::init_tracing;
use enginelink_common::{BufferManager, EngineLinkConfig, EngineLinkError, Result};
use enginelink_engine::{build_backend, EngineOptions, EngineProcess, ModelIdentity};
use tokio::signal;
use tokio::signal::unix::{signal as unix_signal, SignalKind};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration, inline document first
    let config = match std::env::var("ENGINELINK_CONFIG_YAML") {
        Ok(document) => EngineLinkConfig::from_yaml_str(&document)?,
        Err(_) => {
            let config_path = std::env::var("ENGINELINK_CONFIG")
                .unwrap_or_else(|_| "configs/enginelink.yaml".to_string());
            EngineLinkConfig::from_file(&config_path)?
        }
    };

    init_tracing("enginelink_engine", &config.observability);

    let model_name = std::env::var("ENGINELINK_MODEL")
        .map_err(|_| EngineLinkError::config("ENGINELINK_MODEL is not set"))?;
    let version = std::env::var("ENGINELINK_VERSION")
        .map_err(|_| EngineLinkError::config("ENGINELINK_VERSION is not set"))?
        .parse::<i64>()
        .map_err(|e| EngineLinkError::config(format!("Invalid ENGINELINK_VERSION: {}", e)))?;

    let model = config
        .model(&model_name)
        .ok_or_else(|| EngineLinkError::model_not_found(format!("{} is not configured", model_name)))?;
    if !model.versions.contains(&version) {
        return Err(EngineLinkError::model_not_found(format!(
            "{} has no version {}",
            model_name, version
        )));
    }

    let identity = ModelIdentity::new(&model.name, version);
    info!("{} Starting EngineLink Engine", identity);

    let backend = build_backend(model, config.backend_threads())?;
    let buffers = BufferManager::new(&config.shm)?;
    let engine = EngineProcess::start(
        identity.clone(),
        backend,
        &model.mapping,
        EngineOptions::from_config(&config, model),
        buffers,
    )
    .await?;

    let mut terminate = unix_signal(SignalKind::terminate())?;
    engine
        .run_until(async move {
            tokio::select! {
                _ = signal::ctrl_c() => info!("{} Received interrupt", identity),
                _ = terminate.recv() => info!("{} Received terminate signal", identity),
            }
        })
        .await?;

    info!("EngineLink Engine shutdown complete");
    Ok(())
}
