//! EngineLink common library
//!
//! This crate contains the pieces both sides of the engine protocol share:
//! configuration, the error taxonomy, metrics, named shared-memory buffers,
//! the envelope codec and the local socket transport.

pub mod config;
pub mod envelope;
pub mod error;
pub mod metrics;
pub mod shm;
pub mod telemetry;
pub mod transport;

// Re-export commonly used types
pub use config::EngineLinkConfig;
pub use envelope::{DType, Envelope, ReplyStatus, TensorEntry, TensorSpec};
pub use error::{EngineLinkError, ErrorCode, Result};
pub use metrics::{MetricsRegistry, METRICS};
pub use shm::{BufferManager, NamedBuffer, Ownership};
