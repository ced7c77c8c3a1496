//! IPC transport layer
//!
//! Length-prefixed bincode frames over Unix domain sockets. One socket path
//! serves all four channels; each connection identifies itself with a
//! [`ChannelKind`](crate::protocol::ChannelKind) handshake frame right after
//! connecting.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};

use crate::error::{BridgeError, Result};

/// Upper bound on a single frame. Audio samples go through shared memory, so
/// any frame near this size means a corrupted length prefix.
const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// One framed connection.
pub struct MessageTransport {
    stream: UnixStream,
}

impl MessageTransport {
    pub fn new(stream: UnixStream) -> Self {
        Self { stream }
    }

    /// Connect to the bridge socket. Must be called within a tokio runtime.
    pub async fn connect(socket_path: &Path) -> Result<Self> {
        let stream = UnixStream::connect(socket_path).await?;
        Ok(Self { stream })
    }

    /// Re-register a blocking stream with the current runtime's reactor.
    /// Used to hand accepted connections to their service threads, each of
    /// which owns its own runtime.
    pub fn from_std(stream: std::os::unix::net::UnixStream) -> Result<Self> {
        stream.set_nonblocking(true)?;
        Ok(Self {
            stream: UnixStream::from_std(stream)?,
        })
    }

    /// Detach the connection from this runtime so another thread can adopt
    /// it via [`MessageTransport::from_std`].
    pub fn into_std(self) -> Result<std::os::unix::net::UnixStream> {
        Ok(self.stream.into_std()?)
    }

    /// Send one length-prefixed frame.
    pub async fn send<T: Serialize>(&mut self, message: &T) -> Result<()> {
        let payload = bincode::serialize(message)?;
        if payload.len() > MAX_FRAME_BYTES {
            return Err(BridgeError::LimitExceeded {
                what: "frame",
                len: payload.len(),
                max: MAX_FRAME_BYTES,
            });
        }
        self.stream.write_u32(payload.len() as u32).await?;
        self.stream.write_all(&payload).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Receive one length-prefixed frame.
    pub async fn recv<T: DeserializeOwned>(&mut self) -> Result<T> {
        let len = self.stream.read_u32().await? as usize;
        if len > MAX_FRAME_BYTES {
            return Err(BridgeError::Corrupt(format!(
                "frame length {len} exceeds {MAX_FRAME_BYTES}"
            )));
        }
        let mut payload = vec![0u8; len];
        self.stream.read_exact(&mut payload).await?;
        Ok(bincode::deserialize(&payload)?)
    }
}

/// Accepts the four channel connections for one instance.
pub struct TransportListener {
    listener: UnixListener,
}

impl TransportListener {
    /// Bind the bridge socket, replacing any stale file from a previous run.
    pub fn bind(socket_path: &Path) -> Result<Self> {
        if socket_path.exists() {
            std::fs::remove_file(socket_path)?;
        }
        if let Some(parent) = socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let listener = UnixListener::bind(socket_path)?;
        Ok(Self { listener })
    }

    pub async fn accept(&self) -> Result<MessageTransport> {
        let (stream, _addr) = self.listener.accept().await?;
        Ok(MessageTransport::new(stream))
    }
}
