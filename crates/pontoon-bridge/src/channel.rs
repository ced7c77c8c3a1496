//! Synchronous call channels over the framed transport
//!
//! Every channel is a strict request/response pair: the caller blocks until
//! the matching reply arrives. Reordering is impossible by construction, so
//! there are no sequence numbers to check. Each channel owns a
//! current-thread runtime and drives its socket with `block_on`, keeping the
//! public surface fully synchronous.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::runtime::Runtime;

use crate::error::{BridgeError, Result};
use crate::protocol::{ChannelKind, ClientMessage, Envelope, Notification, Reply};
use crate::transport::MessageTransport;

/// One blocking request/response connection. Fatal transport failures flip
/// the shared `failed` latch, after which every call on any channel of the
/// same instance returns [`BridgeError::InstanceDead`].
pub struct SyncChannel {
    transport: Mutex<MessageTransport>,
    runtime: Runtime,
    failed: Arc<AtomicBool>,
    timeout_ms: u64,
}

impl SyncChannel {
    /// Connect and identify this connection's role with a handshake frame.
    /// Retries until the server has bound its socket or the timeout lapses.
    pub fn connect(
        socket_path: &Path,
        kind: ChannelKind,
        timeout_ms: u64,
        failed: Arc<AtomicBool>,
    ) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let deadline = Instant::now() + Duration::from_millis(timeout_ms);
        let mut transport = loop {
            match runtime.block_on(MessageTransport::connect(socket_path)) {
                Ok(transport) => break transport,
                Err(e) if Instant::now() < deadline => {
                    tracing::trace!("bridge socket not ready yet: {e}");
                    std::thread::sleep(Duration::from_millis(10));
                }
                Err(e) => return Err(e),
            }
        };
        runtime.block_on(transport.send(&kind))?;
        Ok(Self {
            transport: Mutex::new(transport),
            runtime,
            failed,
            timeout_ms,
        })
    }

    /// Adopt an already-accepted connection. Used by the remote side for the
    /// host-callback channel, where it plays the requester role.
    pub fn from_std(
        stream: std::os::unix::net::UnixStream,
        timeout_ms: u64,
        failed: Arc<AtomicBool>,
    ) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let transport = {
            let _guard = runtime.enter();
            MessageTransport::from_std(stream)?
        };
        Ok(Self {
            transport: Mutex::new(transport),
            runtime,
            failed,
            timeout_ms,
        })
    }

    fn check_alive(&self) -> Result<()> {
        if self.failed.load(Ordering::Acquire) {
            return Err(BridgeError::InstanceDead);
        }
        Ok(())
    }

    fn latch_on_fatal<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(err) = &result {
            if err.is_fatal() {
                self.failed.store(true, Ordering::Release);
            }
        }
        result
    }

    /// Send one request and block for its reply.
    pub fn request<Q: Serialize, R: DeserializeOwned>(&self, message: &Q) -> Result<R> {
        self.check_alive()?;
        let mut transport = self.transport.lock();
        let timeout = Duration::from_millis(self.timeout_ms);
        let result = self.runtime.block_on(async {
            transport.send(message).await?;
            match tokio::time::timeout(timeout, transport.recv()).await {
                Ok(reply) => reply,
                Err(_) => Err(BridgeError::Timeout(self.timeout_ms)),
            }
        });
        self.latch_on_fatal(result)
    }

    /// Send one message without waiting for a reply.
    pub fn send<Q: Serialize>(&self, message: &Q) -> Result<()> {
        self.check_alive()?;
        let mut transport = self.transport.lock();
        let result = self.runtime.block_on(transport.send(message));
        self.latch_on_fatal(result)
    }
}

/// Routing seam between proxies and the wire. Production code routes through
/// [`CallChannels`]; tests substitute a scripted implementation to count
/// round trips.
pub trait CallDispatch: Send + Sync {
    fn request(&self, category: ChannelKind, envelope: Envelope) -> Result<Reply>;
    fn notify(&self, category: ChannelKind, notification: Notification) -> Result<()>;
}

/// The three native-to-remote channels of one instance.
pub struct CallChannels {
    main: SyncChannel,
    audio: SyncChannel,
    expedited: SyncChannel,
    failed: Arc<AtomicBool>,
}

impl CallChannels {
    pub fn connect(socket_path: &Path, timeout_ms: u64, failed: Arc<AtomicBool>) -> Result<Self> {
        let main = SyncChannel::connect(socket_path, ChannelKind::Main, timeout_ms, failed.clone())?;
        let audio =
            SyncChannel::connect(socket_path, ChannelKind::Audio, timeout_ms, failed.clone())?;
        let expedited = SyncChannel::connect(
            socket_path,
            ChannelKind::Expedited,
            timeout_ms,
            failed.clone(),
        )?;
        Ok(Self {
            main,
            audio,
            expedited,
            failed,
        })
    }

    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    fn channel(&self, category: ChannelKind) -> &SyncChannel {
        match category {
            ChannelKind::Main => &self.main,
            ChannelKind::Audio => &self.audio,
            ChannelKind::Expedited => &self.expedited,
            // The callback channel flows the other way; anything misrouted
            // here goes over the main channel.
            ChannelKind::HostCallback => &self.main,
        }
    }
}

impl CallDispatch for CallChannels {
    fn request(&self, category: ChannelKind, envelope: Envelope) -> Result<Reply> {
        self.channel(category)
            .request(&ClientMessage::Request(envelope))
    }

    fn notify(&self, category: ChannelKind, notification: Notification) -> Result<()> {
        self.channel(category)
            .send(&ClientMessage::Notify(notification))
    }
}
