//! Client side of the engine socket protocol

use enginelink_common::error::{EngineLinkError, Result};
use enginelink_common::transport::{self, SocketListener};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::net::UnixStream;
use tokio::time::timeout;
use tracing::trace;

/// Connection details of one engine
#[derive(Debug, Clone)]
pub struct EngineClient {
    address: PathBuf,
    io_timeout: Duration,
}

impl EngineClient {
    pub fn new(address: impl Into<PathBuf>, io_timeout: Duration) -> Self {
        Self {
            address: address.into(),
            io_timeout,
        }
    }

    pub fn address(&self) -> &Path {
        &self.address
    }

    /// Deliver one request frame
    ///
    /// A missing or refusing socket means the version is not loaded.
    pub async fn send(&self, payload: &[u8]) -> Result<()> {
        let mut stream = self.connect().await?;
        transport::write_frame(&mut stream, payload).await?;
        trace!("Sent {} bytes to {}", payload.len(), self.address.display());
        Ok(())
    }

    /// Probe the engine socket
    ///
    /// Returns `false` when nothing listens at the address.
    pub async fn health_check(&self) -> Result<bool> {
        match self.connect().await {
            Ok(_) => Ok(true),
            Err(EngineLinkError::ModelNotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn connect(&self) -> Result<UnixStream> {
        match timeout(self.io_timeout, transport::connect(&self.address)).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(e)) if transport::is_absent(&e) => Err(EngineLinkError::model_not_found(
                format!("No engine listening at {}", self.address.display()),
            )),
            Ok(Err(e)) => Err(EngineLinkError::Connection(format!(
                "Failed to connect to {}: {}",
                self.address.display(),
                e
            ))),
            Err(_) => Err(EngineLinkError::timeout(format!(
                "connecting to {}",
                self.address.display()
            ))),
        }
    }
}

/// Per-request reply socket, removed when dropped
#[derive(Debug)]
pub struct ReplyChannel {
    listener: SocketListener,
    address: String,
}

impl ReplyChannel {
    /// Bind a fresh reply socket under `socket_dir`
    pub async fn open(socket_dir: &Path) -> Result<Self> {
        let path = transport::reply_address(socket_dir);
        let address = path
            .to_str()
            .ok_or_else(|| EngineLinkError::config("socket_dir is not valid UTF-8"))?
            .to_string();
        let listener = SocketListener::bind(&path).await?;
        Ok(Self { listener, address })
    }

    /// Address to put in the request envelope
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Wait for the single reply frame
    ///
    /// Connections that close without a frame are skipped. The stream stays
    /// open so the caller can acknowledge the reply.
    pub async fn receive(&self, max_frame_bytes: usize) -> Result<(Vec<u8>, UnixStream)> {
        loop {
            let mut stream = self.listener.accept().await?;
            match transport::read_frame_or_eof(&mut stream, max_frame_bytes).await? {
                Some(frame) => return Ok((frame, stream)),
                None => trace!("Empty connection on {}", self.address),
            }
        }
    }
}
