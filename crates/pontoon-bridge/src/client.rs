//! Native-side bridge client
//!
//! Owns one remote instance: the three outbound call channels, the callback
//! listener, the proxy directory, and the client event loop on which
//! deferred callbacks run. The remote process itself is usually spawned with
//! [`BridgeClient::spawn_host_process`] right before connecting.

use std::path::Path;
use std::process::{Child, Command};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::channel::{CallChannels, CallDispatch};
use crate::callback::{CallbackService, HostCallbackHandler};
use crate::error::{BridgeError, Result};
use crate::event_loop::{EventLoop, EventLoopHandle};
use crate::protocol::{
    BridgeConfig, ChannelKind, Envelope, ObjectHandle, Operation, Reply, ReplyValue,
};
use crate::proxy::{ObjectProxy, ProxyDirectory};
use crate::transport::MessageTransport;

pub struct BridgeClient {
    channels: Arc<CallChannels>,
    directory: Arc<ProxyDirectory>,
    config: BridgeConfig,
    failed: Arc<AtomicBool>,
    #[allow(dead_code)]
    callback_thread: thread::JoinHandle<()>,
}

impl BridgeClient {
    /// Spawn the remote host process for `config`. The binary is expected
    /// next to the current executable unless an explicit path is given.
    pub fn spawn_host_process(config: &BridgeConfig, binary: Option<&Path>) -> Result<Child> {
        let default_path = std::env::current_exe().map(|mut p| {
            p.pop();
            p.push("pontoon-host");
            p
        })?;
        let binary = binary.unwrap_or(&default_path);
        Ok(Command::new(binary).arg(&config.socket_path).spawn()?)
    }

    /// Connect all four channels and start the callback listener. Returns
    /// the client plus the event loop the caller must run on its UI thread
    /// (or any thread it designates as such).
    pub fn connect(
        config: BridgeConfig,
        handler: Arc<dyn HostCallbackHandler>,
    ) -> Result<(Self, EventLoop)> {
        let failed = Arc::new(AtomicBool::new(false));
        let channels = Arc::new(CallChannels::connect(
            &config.socket_path,
            config.timeout_ms,
            failed.clone(),
        )?);
        let (event_loop, loop_handle) =
            EventLoop::new(Duration::from_millis(config.event_loop_tick_ms));
        let directory = Arc::new(ProxyDirectory::new());
        let callback_thread = Self::start_callback_listener(
            &config,
            handler,
            directory.clone(),
            channels.clone(),
            loop_handle,
            failed.clone(),
        )?;
        Ok((
            Self {
                channels,
                directory,
                config,
                failed,
                callback_thread,
            },
            event_loop,
        ))
    }

    fn start_callback_listener(
        config: &BridgeConfig,
        handler: Arc<dyn HostCallbackHandler>,
        directory: Arc<ProxyDirectory>,
        dispatch: Arc<dyn CallDispatch>,
        loop_handle: EventLoopHandle,
        failed: Arc<AtomicBool>,
    ) -> Result<thread::JoinHandle<()>> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let deadline = Instant::now() + Duration::from_millis(config.timeout_ms);
        let mut transport = loop {
            match runtime.block_on(MessageTransport::connect(&config.socket_path)) {
                Ok(transport) => break transport,
                Err(e) if Instant::now() < deadline => {
                    tracing::trace!("bridge socket not ready yet: {e}");
                    thread::sleep(Duration::from_millis(10));
                }
                Err(e) => return Err(e),
            }
        };
        runtime.block_on(transport.send(&ChannelKind::HostCallback))?;
        Ok(CallbackService::spawn(
            transport,
            runtime,
            handler,
            directory,
            dispatch,
            loop_handle,
            failed,
        ))
    }

    /// Create one bridged object and wrap it in a proxy. The handle and the
    /// capability set both come from the remote side's single creation
    /// round trip.
    pub fn create_object(&self) -> Result<Arc<ObjectProxy>> {
        let reply = self.channels.request(
            ChannelKind::Main,
            Envelope {
                category: ChannelKind::Main,
                object: ObjectHandle::FACTORY,
                operation: Operation::CreateInstance,
            },
        )?;
        let (handle, capabilities) = match reply {
            Reply::Ok(ReplyValue::Created {
                handle,
                capabilities,
            }) => (handle, capabilities),
            Reply::Err(msg) => return Err(BridgeError::ProtocolError(msg)),
            other => {
                return Err(BridgeError::Corrupt(format!(
                    "unexpected reply to CreateInstance: {other:?}"
                )))
            }
        };
        let proxy = Arc::new(ObjectProxy::new(
            handle,
            capabilities,
            self.channels.clone() as Arc<dyn CallDispatch>,
            &self.config.shm_prefix,
        ));
        self.directory.insert(&proxy);
        Ok(proxy)
    }

    /// Whether the instance has been poisoned by a fatal error. Once true,
    /// every call on every proxy of this client fails with `InstanceDead`.
    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn directory(&self) -> &Arc<ProxyDirectory> {
        &self.directory
    }
}
