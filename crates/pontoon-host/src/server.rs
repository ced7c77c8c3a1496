//! The remote host server
//!
//! One server process serves one bridge instance. It accepts the four
//! channel connections, then dedicates a thread to each: main-channel
//! requests are trampolined onto the event loop thread (which also pumps
//! native events between tasks), audio and expedited requests are answered
//! directly on their own threads, and the callback connection is wrapped in
//! a [`HostCallbackChannel`] for plugin-initiated calls in the other
//! direction.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use pontoon_bridge::error::{BridgeError, Result};
use pontoon_bridge::event_loop::{EventLoop, EventLoopHandle};
use pontoon_bridge::protocol::{
    BridgeConfig, ChannelKind, ClientMessage, Envelope, Notification, ObjectHandle, Operation,
    ProcessEnvelope, Reply, ReplyValue, ShmDescriptor,
};
use pontoon_bridge::shared_memory::{stage_result, unstage_block, AudioShmBuffer, OffsetPlan};
use pontoon_bridge::transport::{MessageTransport, TransportListener};
use pontoon_bridge::codec;

use crate::callback::HostCallbackChannel;
use crate::object::{BridgedObject, ObjectRegistry};
use crate::passthrough::PassthroughObject;

/// Builds one bridged object per `CreateInstance`. Real deployments wrap
/// their plugin loader here; the callback channel is what the new object
/// uses to reach back into the native host.
pub type ObjectFactory =
    Box<dyn Fn(Arc<HostCallbackChannel>) -> Arc<dyn BridgedObject> + Send + Sync>;

pub struct HostServer {
    config: BridgeConfig,
    factory: ObjectFactory,
}

struct ServerShared {
    registry: Mutex<ObjectRegistry>,
    factory: ObjectFactory,
    callback: Arc<HostCallbackChannel>,
}

impl HostServer {
    pub fn new(config: BridgeConfig, factory: ObjectFactory) -> Self {
        Self { config, factory }
    }

    /// Server whose factory hands out passthrough objects. Used by the
    /// binary when no embedding code supplies a loader, and by tests.
    pub fn with_passthrough(config: BridgeConfig) -> Self {
        Self::new(
            config,
            Box::new(|callback| {
                Arc::new(PassthroughObject::new(callback)) as Arc<dyn BridgedObject>
            }),
        )
    }

    /// Serve until the native side disconnects. `pump` runs on this thread
    /// between main-channel calls; native event loops (windowing, plugin
    /// timers) go there.
    pub fn run<F: FnMut()>(self, pump: F) -> Result<()> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let listener = {
            let _guard = runtime.enter();
            TransportListener::bind(&self.config.socket_path)?
        };
        tracing::info!(
            "serving bridge instance on {}",
            self.config.socket_path.display()
        );

        let mut main_stream = None;
        let mut audio_stream = None;
        let mut expedited_stream = None;
        let mut callback_stream = None;
        while main_stream.is_none()
            || audio_stream.is_none()
            || expedited_stream.is_none()
            || callback_stream.is_none()
        {
            let mut transport = runtime.block_on(listener.accept())?;
            let kind: ChannelKind = runtime.block_on(transport.recv())?;
            let stream = transport.into_std()?;
            let slot = match kind {
                ChannelKind::Main => &mut main_stream,
                ChannelKind::Audio => &mut audio_stream,
                ChannelKind::Expedited => &mut expedited_stream,
                ChannelKind::HostCallback => &mut callback_stream,
            };
            if slot.replace(stream).is_some() {
                return Err(BridgeError::ProtocolError(format!(
                    "duplicate {kind:?} channel handshake"
                )));
            }
            tracing::debug!("{kind:?} channel connected");
        }
        let (main_stream, audio_stream, expedited_stream, callback_stream) = match (
            main_stream,
            audio_stream,
            expedited_stream,
            callback_stream,
        ) {
            (Some(m), Some(a), Some(e), Some(c)) => (m, a, e, c),
            _ => unreachable!("accept loop exits only with all four channels"),
        };

        let failed = Arc::new(AtomicBool::new(false));
        let callback = Arc::new(HostCallbackChannel::new(
            callback_stream,
            self.config.timeout_ms,
            failed,
        )?);
        let shared = Arc::new(ServerShared {
            registry: Mutex::new(ObjectRegistry::new()),
            factory: self.factory,
            callback,
        });
        let (event_loop, loop_handle) =
            EventLoop::new(Duration::from_millis(self.config.event_loop_tick_ms));

        Self::spawn_main_thread(main_stream, shared.clone(), loop_handle.clone())?;
        Self::spawn_audio_thread(audio_stream, shared.clone())?;
        Self::spawn_expedited_thread(expedited_stream, shared)?;

        // The loop must exit once the channel threads are gone, so this
        // thread keeps no handle of its own.
        drop(loop_handle);
        event_loop.run(pump);
        tracing::info!("all channels closed, shutting down");
        Ok(())
    }

    fn spawn_main_thread(
        stream: std::os::unix::net::UnixStream,
        shared: Arc<ServerShared>,
        handle: EventLoopHandle,
    ) -> Result<()> {
        thread::Builder::new()
            .name("pontoon-main-channel".to_string())
            .spawn(move || {
                let on_request = |envelope: Envelope| {
                    let shared = shared.clone();
                    handle.dispatch(move || shared.handle(ChannelKind::Main, envelope))
                };
                let on_notification = |notification: Notification| {
                    let shared = shared.clone();
                    // Destruction may touch main-thread-only plugin state,
                    // so it queues behind the in-flight main-channel work.
                    let _ = handle.schedule(move || shared.handle_notification(notification));
                };
                service_loop("main", stream, on_request, on_notification);
            })?;
        Ok(())
    }

    fn spawn_audio_thread(
        stream: std::os::unix::net::UnixStream,
        shared: Arc<ServerShared>,
    ) -> Result<()> {
        thread::Builder::new()
            .name("pontoon-audio-channel".to_string())
            .spawn(move || {
                // The opener-side mapping lives on this thread alone.
                let mut region: Option<AudioShmBuffer> = None;
                let on_request = |envelope: Envelope| {
                    Ok(match &envelope.operation {
                        Operation::SetupProcessing { .. } | Operation::Process(_) => {
                            shared.handle_audio(&mut region, envelope)
                        }
                        _ => shared.handle(ChannelKind::Audio, envelope),
                    })
                };
                let on_notification = |notification: Notification| {
                    shared.handle_notification(notification);
                };
                service_loop("audio", stream, on_request, on_notification);
            })?;
        Ok(())
    }

    fn spawn_expedited_thread(
        stream: std::os::unix::net::UnixStream,
        shared: Arc<ServerShared>,
    ) -> Result<()> {
        thread::Builder::new()
            .name("pontoon-expedited-channel".to_string())
            .spawn(move || {
                let on_request =
                    |envelope: Envelope| Ok(shared.handle(ChannelKind::Expedited, envelope));
                let on_notification = |notification: Notification| {
                    shared.handle_notification(notification);
                };
                service_loop("expedited", stream, on_request, on_notification);
            })?;
        Ok(())
    }
}

impl ServerShared {
    /// Serve one request. Local failures become `Reply::Err` and keep the
    /// instance alive; only transport-level trouble tears channels down.
    fn handle(&self, expected: ChannelKind, envelope: Envelope) -> Reply {
        if envelope.category != expected {
            return Reply::Err(format!(
                "envelope for the {:?} channel arrived on {expected:?}",
                envelope.category
            ));
        }
        if matches!(envelope.operation, Operation::CreateInstance) {
            if envelope.object != ObjectHandle::FACTORY {
                return Reply::Err("CreateInstance must address the factory handle".to_string());
            }
            let object = (self.factory)(self.callback.clone());
            let capabilities = object.capabilities();
            let handle = self.registry.lock().register(object);
            tracing::debug!("created object {handle}");
            return Reply::Ok(ReplyValue::Created {
                handle,
                capabilities,
            });
        }

        // The registry lock covers only the lookup. The call itself runs on
        // the shared object handle, so a slow call on one channel never
        // holds up requests for the same instance on another.
        let Some(object) = self.registry.lock().get(envelope.object) else {
            return Reply::Err(format!("unknown object {}", envelope.object));
        };
        match envelope.operation {
            Operation::QueryCapability(capability) => {
                Reply::Ok(ReplyValue::Bool(object.capabilities().contains(capability)))
            }
            Operation::GetBusCount {
                media_type,
                direction,
            } => Reply::Ok(ReplyValue::Count(object.bus_count(media_type, direction))),
            Operation::GetBusInfo {
                media_type,
                direction,
                index,
            } => match object.bus_info(media_type, direction, index) {
                Some(info) => Reply::Ok(ReplyValue::BusInfo(info)),
                None => Reply::Unsupported,
            },
            Operation::CanProcessSampleSize(width) => {
                Reply::Ok(ReplyValue::Bool(object.can_process_sample_size(width)))
            }
            Operation::GetParameterCount => {
                Reply::Ok(ReplyValue::Count(object.parameter_count()))
            }
            Operation::GetParameterInfo { index } => match object.parameter_info(index) {
                Some(info) => Reply::Ok(ReplyValue::ParameterInfo(info)),
                None => Reply::Unsupported,
            },
            Operation::SetProcessing(active) => {
                object.set_processing(active);
                Reply::Ok(ReplyValue::Unit)
            }
            Operation::MenuItemSelected { tag } => {
                if object.menu_item_selected(tag) {
                    Reply::Ok(ReplyValue::Unit)
                } else {
                    Reply::Unsupported
                }
            }
            Operation::Generic { tag, args } => match object.generic(tag, &args) {
                Some(bytes) => Reply::Ok(ReplyValue::Bytes(bytes)),
                None => Reply::Unsupported,
            },
            // CreateInstance is handled above; processing operations belong
            // on the audio thread, which intercepts them before this point.
            Operation::CreateInstance
            | Operation::SetupProcessing { .. }
            | Operation::Process(_) => {
                Reply::Err("operation misrouted to the wrong channel".to_string())
            }
        }
    }

    fn handle_audio(&self, region: &mut Option<AudioShmBuffer>, envelope: Envelope) -> Reply {
        if envelope.category != ChannelKind::Audio {
            return Reply::Err(format!(
                "envelope for the {:?} channel arrived on Audio",
                envelope.category
            ));
        }
        let object_handle = envelope.object;
        match envelope.operation {
            Operation::SetupProcessing { setup, shm } => {
                if let Err(e) = Self::adopt_region(region, &shm) {
                    return Reply::Err(e.to_string());
                }
                let object = self.registry.lock().get(object_handle);
                match object {
                    Some(object) => {
                        object.setup_processing(&setup);
                        Reply::Ok(ReplyValue::Unit)
                    }
                    None => Reply::Err(format!("unknown object {object_handle}")),
                }
            }
            Operation::Process(process) => self
                .process_block(region, object_handle, *process)
                .unwrap_or_else(|e| Reply::Err(e.to_string())),
            _ => Reply::Err("operation misrouted to the audio fast path".to_string()),
        }
    }

    fn process_block(
        &self,
        slot: &mut Option<AudioShmBuffer>,
        object_handle: ObjectHandle,
        envelope: ProcessEnvelope,
    ) -> Result<Reply> {
        let region = Self::adopt_region(slot, &envelope.shm)?;
        let plan = OffsetPlan::for_envelope(&envelope);
        let width = envelope.width;
        let num_samples = envelope.num_samples as usize;
        let declared_outputs = envelope.output_channel_counts.clone();
        let block = unstage_block(region, &plan, envelope)?;

        let object = self
            .registry
            .lock()
            .get(object_handle)
            .ok_or(BridgeError::HandleInvalid(object_handle))?;
        let result = object.process(block);

        // A plugin that renders the wrong shape must not reach the wire.
        codec::validate_result(&result, width, num_samples, &declared_outputs)?;
        let response = stage_result(region, &plan, &result)?;
        Ok(Reply::Ok(ReplyValue::Process(Box::new(response))))
    }

    /// Map or remap the shared region to match the descriptor the native
    /// side sent with this cycle.
    fn adopt_region<'a>(
        slot: &'a mut Option<AudioShmBuffer>,
        descriptor: &ShmDescriptor,
    ) -> Result<&'a AudioShmBuffer> {
        let stale = slot.as_ref().map_or(true, |r| !r.matches(descriptor));
        if stale {
            tracing::debug!(
                "mapping shared region {} generation {}",
                descriptor.name,
                descriptor.generation
            );
            *slot = Some(AudioShmBuffer::open(descriptor)?);
        }
        slot.as_ref()
            .ok_or_else(|| BridgeError::ShmExhausted("shared region not mapped".to_string()))
    }

    fn handle_notification(&self, notification: Notification) {
        match notification {
            Notification::Destroy { object } => {
                if self.registry.lock().release(object) {
                    tracing::debug!("destroyed object {object}");
                } else {
                    tracing::warn!("destroy notification for unknown object {object}");
                }
            }
        }
    }
}

/// Drive one channel: receive, serve, reply, until the peer hangs up. A
/// request handler error means the event loop is gone and the thread must
/// exit; everything recoverable has already been folded into the reply.
fn service_loop<R, N>(
    name: &str,
    stream: std::os::unix::net::UnixStream,
    mut on_request: R,
    mut on_notification: N,
) where
    R: FnMut(Envelope) -> Result<Reply>,
    N: FnMut(Notification),
{
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            tracing::error!("{name} channel could not build its runtime: {e}");
            return;
        }
    };
    let mut transport = {
        let _guard = runtime.enter();
        match MessageTransport::from_std(stream) {
            Ok(transport) => transport,
            Err(e) => {
                tracing::error!("{name} channel could not adopt its socket: {e}");
                return;
            }
        }
    };
    loop {
        let message: ClientMessage = match runtime.block_on(transport.recv()) {
            Ok(message) => message,
            Err(e) => {
                tracing::debug!("{name} channel closed: {e}");
                return;
            }
        };
        match message {
            ClientMessage::Request(envelope) => {
                let reply = match on_request(envelope) {
                    Ok(reply) => reply,
                    Err(e) => {
                        tracing::debug!("{name} channel stopping: {e}");
                        return;
                    }
                };
                if let Err(e) = runtime.block_on(transport.send(&reply)) {
                    tracing::debug!("{name} channel closed while replying: {e}");
                    return;
                }
            }
            ClientMessage::Notify(notification) => on_notification(notification),
        }
    }
}
