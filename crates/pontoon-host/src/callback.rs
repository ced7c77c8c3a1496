//! Host-callback channel, remote side
//!
//! The remote process is the requester here: plugin code calls back into
//! the native host for parameter edits, restarts, deferred callbacks, and
//! context menus. Callbacks can originate from any plugin thread, so the
//! whole channel is serialized behind the [`SyncChannel`]'s lock; each call
//! blocks until the native side has answered.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use pontoon_bridge::protocol::{
    CallbackEnvelope, CallbackReply, ContextMenuHandle, HostCallback, ObjectHandle,
};
use pontoon_bridge::{BridgeError, Result, SyncChannel};

pub struct HostCallbackChannel {
    channel: SyncChannel,
}

impl HostCallbackChannel {
    pub(crate) fn new(
        stream: std::os::unix::net::UnixStream,
        timeout_ms: u64,
        failed: Arc<AtomicBool>,
    ) -> Result<Self> {
        Ok(Self {
            channel: SyncChannel::from_std(stream, timeout_ms, failed)?,
        })
    }

    fn call(&self, object: ObjectHandle, callback: HostCallback) -> Result<CallbackReply> {
        self.channel.request(&CallbackEnvelope { object, callback })
    }

    /// Unit-reply callbacks: `Unsupported` from the native side is a normal
    /// negative, not a failure.
    fn call_unit(&self, object: ObjectHandle, callback: HostCallback) -> Result<()> {
        match self.call(object, callback)? {
            CallbackReply::Ok | CallbackReply::Unsupported => Ok(()),
            CallbackReply::Err(msg) => Err(BridgeError::ProtocolError(msg)),
            CallbackReply::Handle(_) => Err(BridgeError::Corrupt(
                "unexpected handle reply to unit callback".to_string(),
            )),
        }
    }

    pub fn restart_component(&self, object: ObjectHandle, flags: u32) -> Result<()> {
        self.call_unit(object, HostCallback::RestartComponent { flags })
    }

    pub fn parameter_values_changed(&self, object: ObjectHandle) -> Result<()> {
        self.call_unit(object, HostCallback::ParameterValuesChanged)
    }

    pub fn begin_edit(&self, object: ObjectHandle, parameter_id: u32) -> Result<()> {
        self.call_unit(object, HostCallback::BeginEdit { parameter_id })
    }

    pub fn perform_edit(&self, object: ObjectHandle, parameter_id: u32, value: f64) -> Result<()> {
        self.call_unit(object, HostCallback::PerformEdit {
            parameter_id,
            value,
        })
    }

    pub fn end_edit(&self, object: ObjectHandle, parameter_id: u32) -> Result<()> {
        self.call_unit(object, HostCallback::EndEdit { parameter_id })
    }

    /// Ask the native side for a deferred main-thread callback. Always
    /// acknowledged; duplicates are collapsed over there.
    pub fn request_callback(&self, object: ObjectHandle) -> Result<()> {
        self.call_unit(object, HostCallback::RequestCallback)
    }

    /// `None` when the native host offers no context menu right now.
    pub fn create_context_menu(
        &self,
        object: ObjectHandle,
        parameter_id: Option<u32>,
    ) -> Result<Option<ContextMenuHandle>> {
        match self.call(object, HostCallback::CreateContextMenu { parameter_id })? {
            CallbackReply::Handle(handle) => Ok(Some(handle)),
            CallbackReply::Unsupported => Ok(None),
            CallbackReply::Err(msg) => Err(BridgeError::ProtocolError(msg)),
            CallbackReply::Ok => Err(BridgeError::Corrupt(
                "context menu creation replied without a handle".to_string(),
            )),
        }
    }

    pub fn add_context_menu_item(
        &self,
        object: ObjectHandle,
        menu: ContextMenuHandle,
        tag: i32,
        name: &str,
    ) -> Result<()> {
        self.call_unit(
            object,
            HostCallback::ContextMenuAddItem {
                menu,
                tag,
                name: name.to_string(),
            },
        )
    }

    /// Returns whether the native host displayed the menu.
    pub fn popup_context_menu(
        &self,
        object: ObjectHandle,
        menu: ContextMenuHandle,
        x: i32,
        y: i32,
    ) -> Result<bool> {
        match self.call(object, HostCallback::ContextMenuPopup { menu, x, y })? {
            CallbackReply::Ok => Ok(true),
            CallbackReply::Unsupported => Ok(false),
            CallbackReply::Err(msg) => Err(BridgeError::ProtocolError(msg)),
            CallbackReply::Handle(_) => Err(BridgeError::Corrupt(
                "unexpected handle reply to popup".to_string(),
            )),
        }
    }

    /// Release the menu and everything registered against it on the native
    /// side.
    pub fn release_context_menu(
        &self,
        object: ObjectHandle,
        menu: ContextMenuHandle,
    ) -> Result<()> {
        self.call_unit(object, HostCallback::ReleaseContextMenu { menu })
    }
}
