//! Common error types for EngineLink
//!
//! This module defines the error taxonomy shared by the dispatch front-end
//! and the engine processes. Errors are convertible to gRPC status codes for
//! the external protocol, and to a compact wire code for the reply envelope
//! that carries them across the process boundary.

use thiserror::Error;

/// Main error type for EngineLink
#[derive(Error, Debug)]
pub enum EngineLinkError {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Model or version not loaded
    #[error("Model not found: {0}")]
    ModelNotFound(String),

    /// A named shared-memory buffer does not exist (protocol desync)
    #[error("Buffer not found: {0}")]
    BufferNotFound(String),

    /// Unknown or missing input key, or a tensor incompatible with the model
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Input shape differs from the network and cannot be reshaped
    #[error("Invalid shape: {0}")]
    InvalidShape(String),

    /// Reshape attempted and rejected by the backend
    #[error("Reshape error: {0}")]
    Reshape(String),

    /// The inference backend failed
    #[error("Backend inference error: {0}")]
    BackendInference(String),

    /// Shared-memory allocation failure, double unlink or use after unlink
    #[error("Resource error: {0}")]
    Resource(String),

    /// Wire envelope failed to decode
    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    /// No reply within the configured deadline
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Connection errors on the local transport
    #[error("Connection error: {0}")]
    Connection(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<config::ConfigError> for EngineLinkError {
    fn from(err: config::ConfigError) -> Self {
        EngineLinkError::Config(err.to_string())
    }
}

impl From<serde_yaml::Error> for EngineLinkError {
    fn from(err: serde_yaml::Error) -> Self {
        EngineLinkError::Config(err.to_string())
    }
}

/// Error code carried in a reply envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ErrorCode {
    ModelNotFound = 1,
    BufferNotFound = 2,
    InvalidInput = 3,
    InvalidShape = 4,
    Reshape = 5,
    BackendInference = 6,
    Resource = 7,
    MalformedMessage = 8,
    Timeout = 9,
    Unavailable = 10,
    Internal = 11,
}

impl ErrorCode {
    pub fn from_u8(value: u8) -> Option<Self> {
        let code = match value {
            1 => ErrorCode::ModelNotFound,
            2 => ErrorCode::BufferNotFound,
            3 => ErrorCode::InvalidInput,
            4 => ErrorCode::InvalidShape,
            5 => ErrorCode::Reshape,
            6 => ErrorCode::BackendInference,
            7 => ErrorCode::Resource,
            8 => ErrorCode::MalformedMessage,
            9 => ErrorCode::Timeout,
            10 => ErrorCode::Unavailable,
            11 => ErrorCode::Internal,
            _ => return None,
        };
        Some(code)
    }
}

impl EngineLinkError {
    /// Convert error to gRPC status code
    ///
    /// Buffer desync and malformed envelopes are internal failures from the
    /// caller's point of view and are reported as such.
    pub fn to_status(&self) -> tonic::Status {
        match self {
            EngineLinkError::ModelNotFound(msg) => tonic::Status::not_found(msg.clone()),
            EngineLinkError::InvalidInput(msg) => {
                tonic::Status::invalid_argument(format!("Invalid input: {}", msg))
            }
            EngineLinkError::InvalidShape(msg) => {
                tonic::Status::invalid_argument(format!("Invalid shape: {}", msg))
            }
            EngineLinkError::Reshape(msg) => {
                tonic::Status::invalid_argument(format!("Reshape error: {}", msg))
            }
            EngineLinkError::Timeout(msg) => {
                tonic::Status::deadline_exceeded(format!("Timeout: {}", msg))
            }
            EngineLinkError::Resource(msg) => {
                tonic::Status::resource_exhausted(format!("Resource error: {}", msg))
            }
            EngineLinkError::Connection(msg) => {
                tonic::Status::unavailable(format!("Connection error: {}", msg))
            }
            EngineLinkError::BackendInference(msg) => {
                tonic::Status::internal(format!("Inference failed: {}", msg))
            }
            EngineLinkError::BufferNotFound(msg) => {
                tonic::Status::internal(format!("Shared buffer missing: {}", msg))
            }
            EngineLinkError::MalformedMessage(msg) => {
                tonic::Status::internal(format!("Malformed engine message: {}", msg))
            }
            EngineLinkError::Config(msg) => {
                tonic::Status::internal(format!("Configuration error: {}", msg))
            }
            EngineLinkError::Io(err) => tonic::Status::internal(format!("I/O error: {}", err)),
            EngineLinkError::Internal(msg) => {
                tonic::Status::internal(format!("Internal error: {}", msg))
            }
        }
    }

    /// Wire code used when this error is sent back in a reply envelope
    pub fn code(&self) -> ErrorCode {
        match self {
            EngineLinkError::ModelNotFound(_) => ErrorCode::ModelNotFound,
            EngineLinkError::BufferNotFound(_) => ErrorCode::BufferNotFound,
            EngineLinkError::InvalidInput(_) => ErrorCode::InvalidInput,
            EngineLinkError::InvalidShape(_) => ErrorCode::InvalidShape,
            EngineLinkError::Reshape(_) => ErrorCode::Reshape,
            EngineLinkError::BackendInference(_) => ErrorCode::BackendInference,
            EngineLinkError::Resource(_) => ErrorCode::Resource,
            EngineLinkError::MalformedMessage(_) => ErrorCode::MalformedMessage,
            EngineLinkError::Timeout(_) => ErrorCode::Timeout,
            EngineLinkError::Connection(_) => ErrorCode::Unavailable,
            EngineLinkError::Config(_) | EngineLinkError::Io(_) | EngineLinkError::Internal(_) => {
                ErrorCode::Internal
            }
        }
    }

    /// Message part without the variant prefix, for the reply envelope
    pub fn message(&self) -> String {
        match self {
            EngineLinkError::Config(msg)
            | EngineLinkError::ModelNotFound(msg)
            | EngineLinkError::BufferNotFound(msg)
            | EngineLinkError::InvalidInput(msg)
            | EngineLinkError::InvalidShape(msg)
            | EngineLinkError::Reshape(msg)
            | EngineLinkError::BackendInference(msg)
            | EngineLinkError::Resource(msg)
            | EngineLinkError::MalformedMessage(msg)
            | EngineLinkError::Timeout(msg)
            | EngineLinkError::Connection(msg)
            | EngineLinkError::Internal(msg) => msg.clone(),
            EngineLinkError::Io(err) => err.to_string(),
        }
    }

    /// Rebuild an error received in a reply envelope
    pub fn from_wire(code: ErrorCode, message: String) -> Self {
        match code {
            ErrorCode::ModelNotFound => EngineLinkError::ModelNotFound(message),
            ErrorCode::BufferNotFound => EngineLinkError::BufferNotFound(message),
            ErrorCode::InvalidInput => EngineLinkError::InvalidInput(message),
            ErrorCode::InvalidShape => EngineLinkError::InvalidShape(message),
            ErrorCode::Reshape => EngineLinkError::Reshape(message),
            ErrorCode::BackendInference => EngineLinkError::BackendInference(message),
            ErrorCode::Resource => EngineLinkError::Resource(message),
            ErrorCode::MalformedMessage => EngineLinkError::MalformedMessage(message),
            ErrorCode::Timeout => EngineLinkError::Timeout(message),
            ErrorCode::Unavailable => EngineLinkError::Connection(message),
            ErrorCode::Internal => EngineLinkError::Internal(message),
        }
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        EngineLinkError::Config(msg.into())
    }

    /// Create a model-not-found error
    pub fn model_not_found(msg: impl Into<String>) -> Self {
        EngineLinkError::ModelNotFound(msg.into())
    }

    /// Create an invalid input error
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        EngineLinkError::InvalidInput(msg.into())
    }

    /// Create an invalid shape error
    pub fn invalid_shape(msg: impl Into<String>) -> Self {
        EngineLinkError::InvalidShape(msg.into())
    }

    /// Create a resource error
    pub fn resource(msg: impl Into<String>) -> Self {
        EngineLinkError::Resource(msg.into())
    }

    /// Create a malformed message error
    pub fn malformed(msg: impl Into<String>) -> Self {
        EngineLinkError::MalformedMessage(msg.into())
    }

    /// Create a timeout error
    pub fn timeout(msg: impl Into<String>) -> Self {
        EngineLinkError::Timeout(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        EngineLinkError::Internal(msg.into())
    }
}

/// Result type alias for EngineLink operations
pub type Result<T> = std::result::Result<T, EngineLinkError>;
