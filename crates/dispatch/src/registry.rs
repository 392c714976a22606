//! Model registry
//!
//! Tracks every (model, version) the front-end knows about, its lifecycle
//! state, the engine socket serving it and the outcome of health probes.
//! Passed explicitly to the dispatcher and the supervisor.

use enginelink_common::error::{EngineLinkError, Result};
use enginelink_common::transport;
use enginelink_proto::{GetModelStatusResponse, ModelVersionState, ModelVersionStatus, StatusProto};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Registry entry for one model version
#[derive(Debug, Clone)]
pub struct VersionEntry {
    pub version: i64,

    pub state: ModelVersionState,

    /// Engine request socket
    pub address: PathBuf,

    /// Health status
    pub healthy: bool,

    /// Number of consecutive failed probes
    pub failure_count: u32,

    /// Last successful probe
    pub last_health_check: Instant,

    /// Why the version ended, if it did not end cleanly
    pub error: Option<String>,
}

impl VersionEntry {
    fn new(version: i64, address: PathBuf) -> Self {
        Self {
            version,
            state: ModelVersionState::Loading,
            address,
            healthy: true,
            failure_count: 0,
            last_health_check: Instant::now(),
            error: None,
        }
    }

    /// Able to take requests
    pub fn is_serving(&self) -> bool {
        self.state == ModelVersionState::Available && self.healthy
    }
}

/// Engine chosen for one request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedEngine {
    pub model_name: String,
    pub version: i64,
    pub address: PathBuf,
}

/// Loaded models and their versions
#[derive(Debug, Clone)]
pub struct ModelRegistry {
    models: Arc<RwLock<HashMap<String, BTreeMap<i64, VersionEntry>>>>,
    socket_dir: PathBuf,
    failure_threshold: u32,
}

impl ModelRegistry {
    /// Create an empty registry for engines listening under `socket_dir`
    pub fn new(socket_dir: impl Into<PathBuf>, failure_threshold: u32) -> Self {
        Self {
            models: Arc::new(RwLock::new(HashMap::new())),
            socket_dir: socket_dir.into(),
            failure_threshold: failure_threshold.max(1),
        }
    }

    pub fn socket_dir(&self) -> &Path {
        &self.socket_dir
    }

    /// Register a version as LOADING and return its engine address
    pub async fn load(&self, model_name: &str, version: i64) -> PathBuf {
        let address = transport::engine_address(&self.socket_dir, model_name, version);
        let mut models = self.models.write().await;
        models
            .entry(model_name.to_string())
            .or_default()
            .insert(version, VersionEntry::new(version, address.clone()));

        info!("[model: {}, version: {}] Loading", model_name, version);
        address
    }

    /// Mark a loaded version as ready to serve
    pub async fn mark_available(&self, model_name: &str, version: i64) -> Result<()> {
        self.transition(model_name, version, |entry| {
            entry.state = ModelVersionState::Available;
            entry.healthy = true;
            entry.failure_count = 0;
            entry.last_health_check = Instant::now();
        })
        .await?;
        info!("[model: {}, version: {}] Available", model_name, version);
        Ok(())
    }

    /// Stop routing to a version before its engine goes away
    pub async fn unload(&self, model_name: &str, version: i64) -> Result<()> {
        self.transition(model_name, version, |entry| {
            entry.state = ModelVersionState::Unloading;
        })
        .await?;
        info!("[model: {}, version: {}] Unloading", model_name, version);
        Ok(())
    }

    /// Record that a version's engine is gone
    pub async fn mark_ended(&self, model_name: &str, version: i64, error: Option<String>) {
        let result = self
            .transition(model_name, version, |entry| {
                entry.state = ModelVersionState::End;
                entry.healthy = false;
                entry.error = error.clone();
            })
            .await;

        match (result, error) {
            (Err(e), _) => warn!("Cannot end unknown version: {}", e),
            (Ok(()), Some(reason)) => {
                warn!("[model: {}, version: {}] Ended: {}", model_name, version, reason)
            }
            (Ok(()), None) => info!("[model: {}, version: {}] Ended", model_name, version),
        }
    }

    /// Pick the engine for a request
    ///
    /// Without a version (or with version 0) the highest serving version
    /// is chosen.
    pub async fn resolve(&self, model_name: &str, version: Option<i64>) -> Result<ResolvedEngine> {
        let models = self.models.read().await;
        let versions = models.get(model_name).ok_or_else(|| {
            EngineLinkError::model_not_found(format!("Model {} is not served", model_name))
        })?;

        let entry = match version {
            None | Some(0) => versions
                .values()
                .rev()
                .find(|entry| entry.is_serving())
                .ok_or_else(|| {
                    EngineLinkError::model_not_found(format!(
                        "Model {} has no available version",
                        model_name
                    ))
                })?,
            Some(requested) => {
                let entry = versions
                    .get(&requested)
                    .filter(|entry| entry.state == ModelVersionState::Available)
                    .ok_or_else(|| {
                        EngineLinkError::model_not_found(format!(
                            "Model {} version {} is not available",
                            model_name, requested
                        ))
                    })?;
                if !entry.healthy {
                    return Err(EngineLinkError::Connection(format!(
                        "Model {} version {} is unhealthy",
                        model_name, requested
                    )));
                }
                entry
            }
        };

        debug!("Resolved {} {:?} to version {}", model_name, version, entry.version);
        Ok(ResolvedEngine {
            model_name: model_name.to_string(),
            version: entry.version,
            address: entry.address.clone(),
        })
    }

    /// Version states as reported by `GetModelStatus`
    pub async fn status(
        &self,
        model_name: &str,
        version: Option<i64>,
    ) -> Result<GetModelStatusResponse> {
        let models = self.models.read().await;
        let versions = models.get(model_name).ok_or_else(|| {
            EngineLinkError::model_not_found(format!("Model {} is not served", model_name))
        })?;

        let selected: Vec<&VersionEntry> = match version {
            None | Some(0) => versions.values().collect(),
            Some(requested) => vec![versions.get(&requested).ok_or_else(|| {
                EngineLinkError::model_not_found(format!(
                    "Model {} has no version {}",
                    model_name, requested
                ))
            })?],
        };

        let model_version_status = selected
            .into_iter()
            .map(|entry| ModelVersionStatus {
                version: entry.version,
                state: entry.state,
                status: match &entry.error {
                    None => StatusProto::ok(),
                    Some(reason) => StatusProto {
                        error_code: tonic::Code::Unknown as i32,
                        error_message: reason.clone(),
                    },
                },
            })
            .collect();

        Ok(GetModelStatusResponse {
            model_version_status,
        })
    }

    /// Record a failed probe
    pub async fn mark_failed(&self, model_name: &str, version: i64) {
        let threshold = self.failure_threshold;
        let _ = self
            .transition(model_name, version, |entry| {
                entry.failure_count += 1;
                if entry.failure_count >= threshold && entry.healthy {
                    entry.healthy = false;
                    warn!(
                        "[model: {}, version: {}] Marked unhealthy after {} failures",
                        model_name, version, entry.failure_count
                    );
                }
            })
            .await;
    }

    /// Record a successful probe
    pub async fn mark_healthy(&self, model_name: &str, version: i64) {
        let _ = self
            .transition(model_name, version, |entry| {
                entry.healthy = true;
                entry.failure_count = 0;
                entry.last_health_check = Instant::now();
            })
            .await;
    }

    /// Versions that have a live engine, for health probes
    pub async fn live_engines(&self) -> Vec<ResolvedEngine> {
        let models = self.models.read().await;
        models
            .iter()
            .flat_map(|(name, versions)| {
                versions
                    .values()
                    .filter(|entry| entry.state == ModelVersionState::Available)
                    .map(move |entry| ResolvedEngine {
                        model_name: name.clone(),
                        version: entry.version,
                        address: entry.address.clone(),
                    })
            })
            .collect()
    }

    /// Snapshot of one version's entry
    pub async fn entry(&self, model_name: &str, version: i64) -> Option<VersionEntry> {
        let models = self.models.read().await;
        models.get(model_name)?.get(&version).cloned()
    }

    async fn transition<F>(&self, model_name: &str, version: i64, update: F) -> Result<()>
    where
        F: FnOnce(&mut VersionEntry),
    {
        let mut models = self.models.write().await;
        let entry = models
            .get_mut(model_name)
            .and_then(|versions| versions.get_mut(&version))
            .ok_or_else(|| {
                EngineLinkError::model_not_found(format!(
                    "Model {} has no version {}",
                    model_name, version
                ))
            })?;
        update(entry);
        Ok(())
    }
}
