//! Configuration structures for EngineLink
//!
//! This module defines all configuration types used by the dispatch
//! front-end and the engine processes. Configurations are loaded from YAML
//! files and can be overridden by `ENGINELINK__<SECTION>__<KEY>` environment
//! variables.

use crate::envelope::DType;
use crate::error::{EngineLinkError, Result};
use crate::transport;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Longest path a Unix domain socket address may have (`sun_path` minus NUL)
pub const MAX_SOCKET_PATH: usize = 107;

/// Top-level configuration for EngineLink components
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineLinkConfig {
    /// Directory holding engine request sockets and per-request reply sockets
    #[serde(default = "default_socket_dir")]
    pub socket_dir: PathBuf,

    /// Shared-memory segment settings
    #[serde(default)]
    pub shm: ShmConfig,

    /// Dispatch front-end settings
    #[serde(default)]
    pub dispatch: DispatchConfig,

    /// Defaults applied to every engine process
    #[serde(default)]
    pub engine: EngineConfig,

    /// Served models
    pub models: Vec<ModelConfig>,

    /// Observability configuration
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

/// Shared-memory configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShmConfig {
    /// Directory backing POSIX shared memory (tmpfs)
    #[serde(default = "default_shm_root")]
    pub root: PathBuf,

    /// Prefix of every segment name created by this deployment
    #[serde(default = "default_shm_prefix")]
    pub prefix: String,
}

/// Dispatch front-end configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Deadline for one predict exchange, in milliseconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,

    /// Timeout for individual socket reads and writes
    #[serde(default = "default_io_timeout")]
    pub io_timeout_ms: u64,

    /// Engine executable spawned for each model version
    #[serde(default = "default_engine_binary")]
    pub engine_binary: PathBuf,

    /// Health check interval in seconds
    #[serde(default = "default_health_check_interval")]
    pub health_check_interval_secs: u64,

    /// Consecutive failed probes before a version is marked unhealthy
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// How long a freshly spawned engine has to start listening
    #[serde(default = "default_startup_timeout")]
    pub startup_timeout_ms: u64,
}

/// Engine process configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Inference request slots per model version
    #[serde(default = "default_num_ireq")]
    pub num_ireq: usize,

    /// Backend worker threads (0 = CPU count)
    #[serde(default)]
    pub backend_threads: usize,

    /// Timeout for reading a request frame and for reply delivery
    #[serde(default = "default_io_timeout")]
    pub io_timeout_ms: u64,

    /// Largest accepted envelope frame
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
}

/// Model configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Model name, also part of the engine socket address
    pub name: String,

    /// Versions to serve
    pub versions: Vec<i64>,

    /// Override of `engine.num_ireq` for this model
    #[serde(default)]
    pub num_ireq: Option<usize>,

    /// What to do when a request's input shape differs from the network
    #[serde(default)]
    pub reshape: ReshapePolicy,

    /// Backend executing the network
    #[serde(default)]
    pub backend: BackendKind,

    /// Network inputs
    pub inputs: Vec<TensorConfig>,

    /// Network outputs
    pub outputs: Vec<OutputConfig>,

    /// Optional aliases exposed to clients instead of tensor names
    #[serde(default)]
    pub mapping: KeyMapping,
}

/// One network input
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TensorConfig {
    pub name: String,
    pub dtype: DType,
    pub shape: Vec<u64>,
}

/// One network output; dtype and shape follow the `source` input
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    pub name: String,
    pub source: String,
}

/// Tensor name to client-facing alias tables
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KeyMapping {
    #[serde(default)]
    pub inputs: BTreeMap<String, String>,

    #[serde(default)]
    pub outputs: BTreeMap<String, String>,
}

/// Reshape policy
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReshapePolicy {
    /// Reshape the network to whatever the request carries
    #[default]
    Auto,

    /// Only the leading batch dimension may change
    BatchSizeOnly,

    /// Any mismatch is rejected
    Disabled,
}

/// Inference backend selection
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackendKind {
    /// Every output is a copy of its source input
    #[default]
    Passthrough,

    /// Float32 outputs are the source input multiplied by `factor`
    Scale { factor: f32 },
}

/// Observability configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Emit JSON log lines
    #[serde(default)]
    pub structured_logging: bool,
}

impl Default for ShmConfig {
    fn default() -> Self {
        Self {
            root: default_shm_root(),
            prefix: default_shm_prefix(),
        }
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: default_request_timeout(),
            io_timeout_ms: default_io_timeout(),
            engine_binary: default_engine_binary(),
            health_check_interval_secs: default_health_check_interval(),
            failure_threshold: default_failure_threshold(),
            startup_timeout_ms: default_startup_timeout(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            num_ireq: default_num_ireq(),
            backend_threads: 0,
            io_timeout_ms: default_io_timeout(),
            max_frame_bytes: default_max_frame_bytes(),
        }
    }
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            structured_logging: false,
        }
    }
}

/// Default value functions
fn default_socket_dir() -> PathBuf {
    PathBuf::from("/tmp/enginelink")
}

fn default_shm_root() -> PathBuf {
    PathBuf::from("/dev/shm")
}

fn default_shm_prefix() -> String {
    "enginelink".to_string()
}

fn default_request_timeout() -> u64 {
    30_000
}

fn default_io_timeout() -> u64 {
    5_000
}

fn default_engine_binary() -> PathBuf {
    PathBuf::from("enginelink-engine")
}

fn default_health_check_interval() -> u64 {
    5
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_startup_timeout() -> u64 {
    10_000
}

fn default_num_ireq() -> usize {
    4
}

fn default_max_frame_bytes() -> usize {
    1024 * 1024
}

fn default_log_level() -> String {
    "info".to_string()
}

impl EngineLinkConfig {
    /// Load configuration from a YAML file, applying environment overrides
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let settings = config::Config::builder()
            .add_source(config::File::from(path))
            .add_source(config::Environment::with_prefix("ENGINELINK").separator("__"))
            .build()
            .map_err(|e| {
                EngineLinkError::Config(format!(
                    "Failed to read config file {}: {}",
                    path.display(),
                    e
                ))
            })?;

        let config: EngineLinkConfig = settings.try_deserialize().map_err(|e| {
            EngineLinkError::Config(format!(
                "Failed to parse config file {}: {}",
                path.display(),
                e
            ))
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Parse an inline YAML document
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let config: EngineLinkConfig = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.models.is_empty() {
            return Err(EngineLinkError::config("At least one model must be configured"));
        }
        if self.engine.num_ireq == 0 {
            return Err(EngineLinkError::config("engine.num_ireq must be positive"));
        }
        if self.dispatch.request_timeout_ms == 0 {
            return Err(EngineLinkError::config(
                "dispatch.request_timeout_ms must be positive",
            ));
        }
        if self.shm.prefix.is_empty() || self.shm.prefix.contains('/') {
            return Err(EngineLinkError::config(format!(
                "Invalid shm prefix: {:?}",
                self.shm.prefix
            )));
        }

        let mut names = HashSet::new();
        for model in &self.models {
            if !names.insert(model.name.as_str()) {
                return Err(EngineLinkError::config(format!(
                    "Model {} configured twice",
                    model.name
                )));
            }
            model.validate()?;

            for &version in &model.versions {
                let address = transport::engine_address(&self.socket_dir, &model.name, version);
                if address.as_os_str().len() > MAX_SOCKET_PATH {
                    return Err(EngineLinkError::config(format!(
                        "Socket path {} exceeds {} bytes",
                        address.display(),
                        MAX_SOCKET_PATH
                    )));
                }
            }
        }

        // Reply sockets carry the longest generated names
        let reply = transport::reply_address(&self.socket_dir);
        if reply.as_os_str().len() > MAX_SOCKET_PATH {
            return Err(EngineLinkError::config(format!(
                "socket_dir {} is too long for reply sockets",
                self.socket_dir.display()
            )));
        }

        Ok(())
    }

    /// Look up a model by name
    pub fn model(&self, name: &str) -> Option<&ModelConfig> {
        self.models.iter().find(|m| m.name == name)
    }

    /// Get request timeout as Duration
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.dispatch.request_timeout_ms)
    }

    /// Slot pool size for a model, honouring its override
    pub fn num_ireq_for(&self, model: &ModelConfig) -> usize {
        model.num_ireq.unwrap_or(self.engine.num_ireq)
    }

    /// Backend thread count, resolving 0 to the number of CPUs
    pub fn backend_threads(&self) -> usize {
        if self.engine.backend_threads > 0 {
            return self.engine.backend_threads;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }
}

impl ModelConfig {
    /// Validate one model entry
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() || self.name.contains('/') {
            return Err(EngineLinkError::config(format!(
                "Invalid model name: {:?}",
                self.name
            )));
        }
        if self.versions.is_empty() || self.versions.iter().any(|&v| v <= 0) {
            return Err(EngineLinkError::config(format!(
                "Model {} needs positive versions, got {:?}",
                self.name, self.versions
            )));
        }
        if self.num_ireq == Some(0) {
            return Err(EngineLinkError::config(format!(
                "Model {} num_ireq must be positive",
                self.name
            )));
        }
        if self.inputs.is_empty() {
            return Err(EngineLinkError::config(format!(
                "Model {} declares no inputs",
                self.name
            )));
        }

        let mut inputs = HashSet::new();
        for input in &self.inputs {
            if !inputs.insert(input.name.as_str()) {
                return Err(EngineLinkError::config(format!(
                    "Model {} declares input {} twice",
                    self.name, input.name
                )));
            }
        }

        let mut outputs = HashSet::new();
        for output in &self.outputs {
            if !outputs.insert(output.name.as_str()) {
                return Err(EngineLinkError::config(format!(
                    "Model {} declares output {} twice",
                    self.name, output.name
                )));
            }
            if !inputs.contains(output.source.as_str()) {
                return Err(EngineLinkError::config(format!(
                    "Output {} of model {} refers to unknown input {}",
                    output.name, self.name, output.source
                )));
            }
        }

        if let BackendKind::Scale { .. } = self.backend {
            for output in &self.outputs {
                let source = self.inputs.iter().find(|i| i.name == output.source);
                if source.map(|s| s.dtype) != Some(DType::Float32) {
                    return Err(EngineLinkError::config(format!(
                        "Scale backend of model {} needs float32 sources",
                        self.name
                    )));
                }
            }
        }

        Ok(())
    }
}
