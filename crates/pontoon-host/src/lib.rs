//! Remote half of the pontoon plugin bridge.
//!
//! One process serves one bridge instance: it accepts the four channel
//! connections from the native side, keeps main-thread plugin work on a
//! single event loop, and answers audio-channel requests by mapping the
//! shared region the native side negotiated. Embedders implement
//! [`BridgedObject`] around their plugin loader and hand a factory to
//! [`HostServer`]; the bundled [`PassthroughObject`] is the loader-less
//! default used by the binary and by tests.

pub mod callback;
pub mod object;
pub mod passthrough;
pub mod server;

pub use callback::HostCallbackChannel;
pub use object::{BridgedObject, ObjectRegistry};
pub use passthrough::PassthroughObject;
pub use server::{HostServer, ObjectFactory};
