//! Engine process supervision
//!
//! Spawns one engine process per configured (model, version), waits for it
//! to start listening, tracks its exit and periodically probes its socket.

use crate::engine_client::EngineClient;
use crate::registry::ModelRegistry;
use enginelink_common::error::{EngineLinkError, Result};
use enginelink_common::EngineLinkConfig;
use enginelink_proto::ModelVersionState;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const STARTUP_POLL: Duration = Duration::from_millis(20);

/// One spawned engine
struct ManagedEngine {
    model_name: String,
    version: i64,
    pid: Option<u32>,
    monitor: JoinHandle<()>,
}

/// Owns the engine processes of a deployment
pub struct EngineSupervisor {
    engine_binary: PathBuf,
    config_document: String,
    registry: ModelRegistry,
    io_timeout: Duration,
    startup_timeout: Duration,
    health_check_interval: Duration,
    engines: Mutex<Vec<ManagedEngine>>,
}

impl EngineSupervisor {
    pub fn new(config: &EngineLinkConfig, registry: ModelRegistry) -> Result<Self> {
        // Engines get the exact configuration the front-end resolved
        let config_document = serde_yaml::to_string(config)?;

        Ok(Self {
            engine_binary: config.dispatch.engine_binary.clone(),
            config_document,
            registry,
            io_timeout: Duration::from_millis(config.dispatch.io_timeout_ms),
            startup_timeout: Duration::from_millis(config.dispatch.startup_timeout_ms),
            health_check_interval: Duration::from_secs(
                config.dispatch.health_check_interval_secs.max(1),
            ),
            engines: Mutex::new(Vec::new()),
        })
    }

    /// Start every configured version, logging the ones that fail
    pub async fn spawn_all(&self, config: &EngineLinkConfig) {
        for model in &config.models {
            for &version in &model.versions {
                if let Err(e) = self.spawn(&model.name, version).await {
                    error!("[model: {}, version: {}] Failed to start: {}", model.name, version, e);
                }
            }
        }
    }

    /// Start one engine and wait until it accepts connections
    pub async fn spawn(&self, model_name: &str, version: i64) -> Result<()> {
        let address = self.registry.load(model_name, version).await;

        let mut child = match Command::new(&self.engine_binary)
            .env("ENGINELINK_CONFIG_YAML", &self.config_document)
            .env("ENGINELINK_MODEL", model_name)
            .env("ENGINELINK_VERSION", version.to_string())
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                let reason = format!(
                    "cannot execute {}: {}",
                    self.engine_binary.display(),
                    e
                );
                self.registry
                    .mark_ended(model_name, version, Some(reason.clone()))
                    .await;
                return Err(EngineLinkError::internal(reason));
            }
        };

        let pid = child.id();
        debug!("[model: {}, version: {}] Spawned pid {:?}", model_name, version, pid);

        let registry = self.registry.clone();
        let name = model_name.to_string();
        let monitor = tokio::spawn(async move {
            let reason = match child.wait().await {
                Ok(status) if status.success() => None,
                Ok(status) => Some(format!("engine exited with {}", status)),
                Err(e) => Some(format!("failed to wait for engine: {}", e)),
            };
            registry.mark_ended(&name, version, reason).await;
        });

        self.engines.lock().await.push(ManagedEngine {
            model_name: model_name.to_string(),
            version,
            pid,
            monitor,
        });

        let client = EngineClient::new(address, self.io_timeout);
        let deadline = Instant::now() + self.startup_timeout;
        loop {
            if let Some(entry) = self.registry.entry(model_name, version).await {
                if entry.state == ModelVersionState::End {
                    return Err(EngineLinkError::internal(format!(
                        "engine exited during startup{}",
                        entry.error.map(|e| format!(": {}", e)).unwrap_or_default()
                    )));
                }
            }

            if let Ok(true) = client.health_check().await {
                self.registry.mark_available(model_name, version).await?;
                return Ok(());
            }

            if Instant::now() >= deadline {
                warn!(
                    "[model: {}, version: {}] Not listening after {:?}, terminating",
                    model_name, version, self.startup_timeout
                );
                terminate(pid);
                return Err(EngineLinkError::timeout(format!(
                    "engine for {} version {} did not start",
                    model_name, version
                )));
            }
            tokio::time::sleep(STARTUP_POLL).await;
        }
    }

    /// Probe every live engine once
    pub async fn check_health(&self) {
        for engine in self.registry.live_engines().await {
            let client = EngineClient::new(&engine.address, self.io_timeout);
            match client.health_check().await {
                Ok(true) => {
                    self.registry
                        .mark_healthy(&engine.model_name, engine.version)
                        .await
                }
                Ok(false) => {
                    self.registry
                        .mark_failed(&engine.model_name, engine.version)
                        .await
                }
                Err(e) => {
                    warn!(
                        "Health check failed for {} version {}: {}",
                        engine.model_name, engine.version, e
                    );
                    self.registry
                        .mark_failed(&engine.model_name, engine.version)
                        .await;
                }
            }
        }
    }

    /// Start background health check task
    pub fn start_health_checks(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.health_check_interval);

            loop {
                interval.tick().await;
                self.check_health().await;
            }
        })
    }

    /// Stop routing to every engine, terminate them and wait for their exit
    pub async fn shutdown(&self) {
        let engines: Vec<ManagedEngine> = self.engines.lock().await.drain(..).collect();

        for engine in &engines {
            let ended = self
                .registry
                .entry(&engine.model_name, engine.version)
                .await
                .map_or(true, |entry| entry.state == ModelVersionState::End);
            if ended {
                continue;
            }
            if let Err(e) = self.registry.unload(&engine.model_name, engine.version).await {
                debug!("Unload during shutdown: {}", e);
            }
            terminate(engine.pid);
        }

        for engine in engines {
            let abort = engine.monitor.abort_handle();
            if tokio::time::timeout(self.startup_timeout, engine.monitor)
                .await
                .is_err()
            {
                warn!(
                    "[model: {}, version: {}] Did not exit, killing",
                    engine.model_name, engine.version
                );
                // dropping the child inside the monitor kills it
                abort.abort();
            }
        }
        info!("All engines stopped");
    }
}

/// Ask an engine process to drain and exit
fn terminate(pid: Option<u32>) {
    let Some(pid) = pid else { return };
    if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        debug!("SIGTERM to {} failed: {}", pid, e);
    }
}
