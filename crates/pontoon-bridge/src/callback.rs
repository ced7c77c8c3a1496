//! Host-callback channel, native side
//!
//! The one channel where the remote process plays the requester. A dedicated
//! listener thread blocks on the socket, answers each callback in arrival
//! order, and hands the side effects to the embedding host through
//! [`HostCallbackHandler`]. Cache invalidation and context-menu bookkeeping
//! happen here before the host sees anything, so a handler cannot forget
//! them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use crate::channel::CallDispatch;
use crate::context_menu::{HostContextMenu, MenuTarget};
use crate::error::Result;
use crate::event_loop::EventLoopHandle;
use crate::protocol::{
    CallbackEnvelope, CallbackReply, ChannelKind, Envelope, HostCallback, ObjectHandle, Operation,
    Reply,
};
use crate::proxy::ProxyDirectory;
use crate::transport::MessageTransport;

/// What the embedding host must provide to service remote callbacks. Every
/// method is called from the listener thread except `deferred_callback`,
/// which runs on the thread driving the client event loop.
pub trait HostCallbackHandler: Send + Sync {
    fn restart_component(&self, object: ObjectHandle, flags: u32);
    fn parameter_values_changed(&self, object: ObjectHandle);
    fn begin_edit(&self, object: ObjectHandle, parameter_id: u32);
    fn perform_edit(&self, object: ObjectHandle, parameter_id: u32, value: f64);
    fn end_edit(&self, object: ObjectHandle, parameter_id: u32);
    fn deferred_callback(&self, object: ObjectHandle);
    /// `None` if the host has no context-menu support at this moment.
    fn create_context_menu(
        &self,
        object: ObjectHandle,
        parameter_id: Option<u32>,
    ) -> Option<Box<dyn HostContextMenu>>;
}

/// Menu-item target whose selection is forwarded to the remote plugin over
/// the expedited channel.
struct RemoteMenuTarget {
    dispatch: Arc<dyn CallDispatch>,
    object: ObjectHandle,
    tag: i32,
}

impl MenuTarget for RemoteMenuTarget {
    fn item_selected(&self) -> Result<()> {
        let reply = self.dispatch.request(
            ChannelKind::Expedited,
            Envelope {
                category: ChannelKind::Expedited,
                object: self.object,
                operation: Operation::MenuItemSelected { tag: self.tag },
            },
        )?;
        if let Reply::Err(msg) = reply {
            tracing::warn!("menu item {} rejected by plugin: {msg}", self.tag);
        }
        Ok(())
    }
}

/// Listener thread servicing the host-callback channel.
pub struct CallbackService;

impl CallbackService {
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        mut transport: MessageTransport,
        runtime: tokio::runtime::Runtime,
        handler: Arc<dyn HostCallbackHandler>,
        directory: Arc<ProxyDirectory>,
        dispatch: Arc<dyn CallDispatch>,
        loop_handle: EventLoopHandle,
        failed: Arc<AtomicBool>,
    ) -> thread::JoinHandle<()> {
        thread::Builder::new()
            .name("pontoon-callbacks".to_string())
            .spawn(move || {
                loop {
                    let envelope: CallbackEnvelope = match runtime.block_on(transport.recv()) {
                        Ok(envelope) => envelope,
                        Err(e) => {
                            // The remote side hanging up is the shutdown
                            // signal; anything else poisons the instance.
                            tracing::debug!("callback channel closed: {e}");
                            failed.store(true, Ordering::Release);
                            break;
                        }
                    };
                    let reply =
                        Self::handle(&envelope, &handler, &directory, &dispatch, &loop_handle);
                    if let Err(e) = runtime.block_on(transport.send(&reply)) {
                        tracing::debug!("callback reply not delivered: {e}");
                        failed.store(true, Ordering::Release);
                        break;
                    }
                }
            })
            .expect("failed to spawn callback listener thread")
    }

    fn handle(
        envelope: &CallbackEnvelope,
        handler: &Arc<dyn HostCallbackHandler>,
        directory: &Arc<ProxyDirectory>,
        dispatch: &Arc<dyn CallDispatch>,
        loop_handle: &EventLoopHandle,
    ) -> CallbackReply {
        let object = envelope.object;
        let Some(proxy) = directory.get(object) else {
            return CallbackReply::Err(format!("no live proxy for object {object}"));
        };
        match &envelope.callback {
            HostCallback::RestartComponent { flags } => {
                proxy.on_component_restarted();
                handler.restart_component(object, *flags);
                CallbackReply::Ok
            }
            HostCallback::ParameterValuesChanged => {
                proxy.on_parameter_values_changed();
                handler.parameter_values_changed(object);
                CallbackReply::Ok
            }
            HostCallback::BeginEdit { parameter_id } => {
                handler.begin_edit(object, *parameter_id);
                CallbackReply::Ok
            }
            HostCallback::PerformEdit {
                parameter_id,
                value,
            } => {
                handler.perform_edit(object, *parameter_id, *value);
                CallbackReply::Ok
            }
            HostCallback::EndEdit { parameter_id } => {
                handler.end_edit(object, *parameter_id);
                CallbackReply::Ok
            }
            HostCallback::RequestCallback => {
                let handler = handler.clone();
                match proxy
                    .debouncer()
                    .try_schedule(loop_handle, move || handler.deferred_callback(object))
                {
                    // Dropped duplicates are a success from the plugin's
                    // point of view; the callback it asked for is coming.
                    Ok(_queued) => CallbackReply::Ok,
                    Err(e) => CallbackReply::Err(e.to_string()),
                }
            }
            HostCallback::CreateContextMenu { parameter_id } => {
                match handler.create_context_menu(object, *parameter_id) {
                    Some(menu) => CallbackReply::Handle(proxy.context_menus().register(menu)),
                    None => CallbackReply::Unsupported,
                }
            }
            HostCallback::ContextMenuAddItem { menu, tag, name } => {
                let target = Box::new(RemoteMenuTarget {
                    dispatch: dispatch.clone(),
                    object,
                    tag: *tag,
                });
                match proxy.context_menus().add_item(*menu, *tag, name, target) {
                    Ok(()) => CallbackReply::Ok,
                    Err(e) => CallbackReply::Err(e.to_string()),
                }
            }
            HostCallback::ContextMenuPopup { menu, x, y } => {
                match proxy.context_menus().popup(*menu, *x, *y) {
                    Ok(true) => CallbackReply::Ok,
                    Ok(false) => CallbackReply::Unsupported,
                    Err(e) => CallbackReply::Err(e.to_string()),
                }
            }
            HostCallback::ReleaseContextMenu { menu } => {
                match proxy.context_menus().unregister(*menu) {
                    Ok(()) => CallbackReply::Ok,
                    Err(e) => CallbackReply::Err(e.to_string()),
                }
            }
        }
    }
}
