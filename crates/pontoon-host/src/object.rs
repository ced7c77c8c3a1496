//! Server-side object registry
//!
//! A [`BridgedObject`] is the remote half of one proxied object: the thing
//! that actually wraps a loaded plugin interface. The registry owns every
//! live object of the instance and maps the wire handles onto them. Handles
//! start at 1; handle 0 is the creation pseudo-object and is never
//! registered.
//!
//! Objects are handed out as shared `Arc` handles. All four channel threads
//! may call into the same object concurrently, so implementations take
//! `&self` and guard their own state; the registry's only job is the
//! handle map.

use std::collections::HashMap;
use std::sync::Arc;

use pontoon_bridge::protocol::{
    BusDirection, BusInfo, CapabilitySet, MediaType, ObjectHandle, ParameterInfo, ProcessBlock,
    ProcessResult, ProcessSetup, SampleWidth,
};

/// One object served over the bridge. Implementations wrap the actual
/// plugin interface; the trivial [`crate::passthrough::PassthroughObject`]
/// serves as the test double and smoke-test plugin.
///
/// Calls arrive from every channel thread at once. An implementation splits
/// its interior locks by calling context so a blocked main-thread call
/// never holds up the audio path.
pub trait BridgedObject: Send + Sync {
    /// Capability set reported to the native side at creation.
    fn capabilities(&self) -> CapabilitySet;

    /// Called once right after registration with the handle the native side
    /// will use, so the object can identify itself in host callbacks.
    fn attached(&self, handle: ObjectHandle);

    fn bus_count(&self, media_type: MediaType, direction: BusDirection) -> i32;

    /// `None` for an out-of-range index; mapped to a normal negative reply.
    fn bus_info(
        &self,
        media_type: MediaType,
        direction: BusDirection,
        index: i32,
    ) -> Option<BusInfo>;

    fn can_process_sample_size(&self, width: SampleWidth) -> bool;

    fn parameter_count(&self) -> i32;

    fn parameter_info(&self, index: i32) -> Option<ParameterInfo>;

    fn setup_processing(&self, setup: &ProcessSetup);

    fn set_processing(&self, active: bool);

    /// Render one block. Outputs must match the block's declared output
    /// channel counts exactly; the server validates before replying.
    fn process(&self, block: ProcessBlock) -> ProcessResult;

    /// A context-menu item owned by this object was selected. Returns
    /// whether the tag was recognized.
    fn menu_item_selected(&self, tag: i32) -> bool {
        let _ = tag;
        false
    }

    /// Escape hatch for interface calls without a dedicated operation.
    /// `None` means unimplemented.
    fn generic(&self, tag: u32, args: &[u8]) -> Option<Vec<u8>> {
        let _ = (tag, args);
        None
    }
}

pub struct ObjectRegistry {
    next_handle: u32,
    objects: HashMap<u32, Arc<dyn BridgedObject>>,
}

impl Default for ObjectRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ObjectRegistry {
    pub fn new() -> Self {
        Self {
            next_handle: 1,
            objects: HashMap::new(),
        }
    }

    pub fn register(&mut self, object: Arc<dyn BridgedObject>) -> ObjectHandle {
        let handle = ObjectHandle(self.next_handle);
        self.next_handle += 1;
        object.attached(handle);
        self.objects.insert(handle.0, object);
        handle
    }

    /// Clone out the shared handle. Callers drop the registry lock before
    /// calling into the object.
    pub fn get(&self, handle: ObjectHandle) -> Option<Arc<dyn BridgedObject>> {
        self.objects.get(&handle.0).cloned()
    }

    /// Tear down one object. Returns whether the handle was live.
    pub fn release(&mut self, handle: ObjectHandle) -> bool {
        self.objects.remove(&handle.0).is_some()
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::passthrough::PassthroughObject;
    use pontoon_bridge::protocol::Capability;

    #[test]
    fn test_handles_start_at_one_and_never_repeat() {
        let mut registry = ObjectRegistry::new();
        let first = registry.register(Arc::new(PassthroughObject::detached()));
        let second = registry.register(Arc::new(PassthroughObject::detached()));
        assert_eq!(first, ObjectHandle(1));
        assert_eq!(second, ObjectHandle(2));

        assert!(registry.release(first));
        assert!(!registry.release(first));
        let third = registry.register(Arc::new(PassthroughObject::detached()));
        assert_eq!(third, ObjectHandle(3));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_factory_handle_is_never_assigned() {
        let mut registry = ObjectRegistry::new();
        let handle = registry.register(Arc::new(PassthroughObject::detached()));
        assert_ne!(handle, ObjectHandle::FACTORY);
        assert!(registry.get(ObjectHandle::FACTORY).is_none());
    }

    #[test]
    fn test_objects_are_shared_handles_not_borrows() {
        let mut registry = ObjectRegistry::new();
        let handle = registry.register(Arc::new(PassthroughObject::detached()));

        // The handle stays usable with the registry untouched, from any
        // thread that looked it up.
        let object = registry.get(handle).unwrap();
        assert!(object.menu_item_selected(5));

        // A clone taken before release keeps the object alive; the registry
        // no longer serves the handle.
        assert!(registry.release(handle));
        assert!(registry.get(handle).is_none());
        assert!(object.capabilities().contains(Capability::Component));
    }
}
