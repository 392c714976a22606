//! Local socket transport
//!
//! Engines listen on a Unix domain socket whose path is derived from the
//! model name and version. Each predict exchange uses a second, short-lived
//! socket owned by the caller for the reply. One connection carries one
//! length-prefixed frame (`u32` little-endian length, then the envelope),
//! optionally answered by a single acknowledgement byte.

use crate::error::{EngineLinkError, Result};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::time::timeout;
use tracing::{debug, warn};
use uuid::Uuid;

/// Byte sent back once the receiver took ownership of a reply
pub const ACK: u8 = 0x06;

/// Deterministic request socket of one model version
pub fn engine_address(socket_dir: &Path, model_name: &str, model_version: i64) -> PathBuf {
    socket_dir.join(format!("{}-{}.sock", model_name, model_version))
}

/// Fresh reply socket path, unique per request
pub fn reply_address(socket_dir: &Path) -> PathBuf {
    socket_dir.join(format!(
        "reply-{}-{}.sock",
        std::process::id(),
        Uuid::new_v4().simple()
    ))
}

/// Write one length-prefixed frame
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let len = u32::try_from(payload.len())
        .map_err(|_| EngineLinkError::internal("frame larger than 4 GiB"))?;
    writer.write_all(&len.to_le_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed frame of at most `max_len` bytes
pub async fn read_frame<R>(reader: &mut R, max_len: usize) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    read_frame_or_eof(reader, max_len)
        .await?
        .ok_or_else(|| EngineLinkError::malformed("connection closed before frame"))
}

/// Like [`read_frame`], but a peer that hangs up before sending anything
/// yields `None`. Health probes connect and close this way.
pub async fn read_frame_or_eof<R>(reader: &mut R, max_len: usize) -> Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; 4];
    let mut filled = 0;
    while filled < prefix.len() {
        let n = reader.read(&mut prefix[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(EngineLinkError::malformed("truncated frame length"));
        }
        filled += n;
    }

    let len = u32::from_le_bytes(prefix) as usize;
    if len > max_len {
        return Err(EngineLinkError::malformed(format!(
            "frame of {} bytes exceeds limit of {}",
            len, max_len
        )));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await.map_err(|e| match e.kind() {
        ErrorKind::UnexpectedEof => EngineLinkError::malformed("truncated frame"),
        _ => EngineLinkError::Io(e),
    })?;
    Ok(Some(payload))
}

/// Send the acknowledgement byte
pub async fn write_ack(stream: &mut UnixStream) -> Result<()> {
    stream.write_all(&[ACK]).await?;
    stream.flush().await?;
    Ok(())
}

/// Wait for the acknowledgement byte or for the peer to hang up
///
/// No deadline: the receiver of a reply always acknowledges it or closes
/// the stream, and until then it may hold the segments the reply names.
pub async fn read_ack(stream: &mut UnixStream) -> Result<()> {
    let mut byte = [0u8; 1];
    match stream.read_exact(&mut byte).await {
        Ok(_) if byte[0] == ACK => Ok(()),
        Ok(_) => Err(EngineLinkError::malformed(format!(
            "unexpected acknowledgement byte {:#x}",
            byte[0]
        ))),
        Err(e) => Err(EngineLinkError::Connection(format!(
            "peer closed before acknowledging: {}",
            e
        ))),
    }
}

/// Connect to a socket path
pub async fn connect(address: &Path) -> std::io::Result<UnixStream> {
    UnixStream::connect(address).await
}

/// Whether a connect error means nobody is listening at the address
pub fn is_absent(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        ErrorKind::NotFound | ErrorKind::ConnectionRefused
    )
}

/// Connect, send one frame and close the write half
pub async fn send_frame(address: &Path, payload: &[u8], io_timeout: Duration) -> Result<UnixStream> {
    let exchange = async {
        let mut stream = connect(address).await?;
        write_frame(&mut stream, payload).await?;
        Ok::<_, EngineLinkError>(stream)
    };

    timeout(io_timeout, exchange).await.map_err(|_| {
        EngineLinkError::timeout(format!("sending frame to {}", address.display()))
    })?
}

/// Unix listener that removes its socket file when dropped
#[derive(Debug)]
pub struct SocketListener {
    listener: UnixListener,
    path: PathBuf,
}

impl SocketListener {
    /// Bind at `path`, replacing a stale socket left by a dead process
    ///
    /// A live owner of `path` sees the liveness check as a connection that
    /// closes without a frame.
    pub async fn bind(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        if tokio::fs::symlink_metadata(path).await.is_ok() {
            if UnixStream::connect(path).await.is_ok() {
                return Err(EngineLinkError::Connection(format!(
                    "address {} already in use",
                    path.display()
                )));
            }
            warn!("Removing stale socket {}", path.display());
            tokio::fs::remove_file(path).await?;
        }

        let listener = UnixListener::bind(path)?;
        debug!("Listening on {}", path.display());

        Ok(Self {
            listener,
            path: path.to_path_buf(),
        })
    }

    /// Accept one connection
    pub async fn accept(&self) -> Result<UnixStream> {
        let (stream, _) = self.listener.accept().await?;
        Ok(stream)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for SocketListener {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != ErrorKind::NotFound {
                warn!("Failed to remove socket {}: {}", self.path.display(), e);
            }
        }
    }
}
