//! Split-process plugin bridging.
//!
//! A plugin that cannot live inside the host process (incompatible binary
//! environment, crash isolation) runs in a separate host process instead.
//! This crate is the native side: for every remote object it exposes an
//! [`ObjectProxy`] whose synchronous methods marshal calls over four Unix
//! socket channels, while audio blocks travel through a growable
//! shared-memory region negotiated per instance.
//!
//! The channels are strict request/response lanes split by calling context:
//! main-thread calls, audio-thread calls, latency-sensitive expedited
//! calls, and a reverse channel for plugin-to-host callbacks. Within a
//! channel replies cannot reorder by construction; across channels the
//! remote side keeps main-thread work on one event loop and serves the rest
//! on dedicated threads.
//!
//! The remote half lives in the `pontoon-host` crate and is normally
//! spawned with [`BridgeClient::spawn_host_process`].

pub mod cache;
pub mod callback;
pub mod channel;
pub mod codec;
pub mod context_menu;
pub mod error;
pub mod event_loop;
pub mod protocol;
pub mod shared_memory;
pub mod transport;

mod client;
mod proxy;

pub use callback::HostCallbackHandler;
pub use channel::{CallChannels, CallDispatch, SyncChannel};
pub use client::BridgeClient;
pub use context_menu::{ContextMenuRegistry, HostContextMenu, MenuTarget};
pub use error::{BridgeError, Result};
pub use event_loop::{CallbackDebouncer, EventLoop, EventLoopHandle};
pub use protocol::BridgeConfig;
pub use proxy::{ObjectProxy, ProxyDirectory};
