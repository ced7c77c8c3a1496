//! Native-side object proxies
//!
//! An [`ObjectProxy`] stands in for one object living in the remote process.
//! It owns the object's shared audio region, its call-result caches, its
//! context-menu registry, and a local reference count. The remote side is
//! told about the object exactly once, when the count reaches zero.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::cache::ProxyCache;
use crate::channel::CallDispatch;
use crate::codec;
use crate::context_menu::ContextMenuRegistry;
use crate::error::{BridgeError, Result};
use crate::event_loop::CallbackDebouncer;
use crate::protocol::{
    BusDirection, BusInfo, Capability, CapabilitySet, ChannelKind, Envelope, MediaType,
    Notification, ObjectHandle, Operation, ParameterInfo, ProcessBlock, ProcessResult,
    ProcessSetup, Reply, ReplyValue, SampleWidth,
};
use crate::shared_memory::{stage_block, unstage_result, AudioShmBuffer};

pub struct ObjectProxy {
    handle: ObjectHandle,
    capabilities: CapabilitySet,
    dispatch: Arc<dyn CallDispatch>,
    shm_name: String,
    /// Local references to this proxy; starts at one for the creator.
    refs: AtomicUsize,
    /// Set once the destroy notification has been sent.
    released: AtomicBool,
    cache: ProxyCache,
    shm: Mutex<Option<AudioShmBuffer>>,
    menus: ContextMenuRegistry,
    debouncer: Arc<CallbackDebouncer>,
}

impl ObjectProxy {
    pub fn new(
        handle: ObjectHandle,
        capabilities: CapabilitySet,
        dispatch: Arc<dyn CallDispatch>,
        shm_prefix: &str,
    ) -> Self {
        Self {
            handle,
            capabilities,
            dispatch,
            shm_name: format!("{shm_prefix}-obj{}", handle.0),
            refs: AtomicUsize::new(1),
            released: AtomicBool::new(false),
            cache: ProxyCache::new(),
            shm: Mutex::new(None),
            menus: ContextMenuRegistry::new(),
            debouncer: CallbackDebouncer::new(),
        }
    }

    pub fn handle(&self) -> ObjectHandle {
        self.handle
    }

    /// Capabilities reported when the object was created.
    pub fn capabilities(&self) -> &CapabilitySet {
        &self.capabilities
    }

    pub fn context_menus(&self) -> &ContextMenuRegistry {
        &self.menus
    }

    pub fn debouncer(&self) -> &Arc<CallbackDebouncer> {
        &self.debouncer
    }

    fn call(&self, category: ChannelKind, operation: Operation) -> Result<Reply> {
        self.dispatch.request(
            category,
            Envelope {
                category,
                object: self.handle,
                operation,
            },
        )
    }

    // --- reference counting -------------------------------------------------

    pub fn add_ref(&self) -> usize {
        self.refs.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Drop one reference. At zero the remote object is destroyed with a
    /// one-way notification; no reply is waited for.
    pub fn release(&self) -> usize {
        let previous = self.refs.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "released more times than referenced");
        if previous == 1 {
            self.destroy();
        }
        previous - 1
    }

    fn destroy(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Err(e) = self.dispatch.notify(
            ChannelKind::Main,
            Notification::Destroy {
                object: self.handle,
            },
        ) {
            tracing::debug!("destroy notification for {} not delivered: {e}", self.handle);
        }
    }

    // --- capability queries -------------------------------------------------

    /// Whether the remote object implements `capability`. Hits in the
    /// creation-time set answer locally; everything else asks the remote
    /// side, and negatives are deliberately never cached so late-bound
    /// interfaces can appear.
    pub fn supports(&self, capability: Capability) -> Result<bool> {
        if self.capabilities.contains(capability) {
            return Ok(true);
        }
        match self.call(ChannelKind::Main, Operation::QueryCapability(capability))? {
            Reply::Ok(ReplyValue::Bool(supported)) => Ok(supported),
            Reply::Unsupported => Ok(false),
            Reply::Err(msg) => Err(BridgeError::ProtocolError(msg)),
            other => Err(corrupt_reply("QueryCapability", &other)),
        }
    }

    // --- bus topology -------------------------------------------------------

    pub fn bus_count(&self, media_type: MediaType, direction: BusDirection) -> Result<i32> {
        if let Some(count) = self.cache.bus_count(media_type, direction) {
            return Ok(count);
        }
        match self.call(
            ChannelKind::Main,
            Operation::GetBusCount {
                media_type,
                direction,
            },
        )? {
            Reply::Ok(ReplyValue::Count(count)) => {
                self.cache.store_bus_count(media_type, direction, count);
                Ok(count)
            }
            Reply::Unsupported => Ok(0),
            Reply::Err(msg) => Err(BridgeError::ProtocolError(msg)),
            other => Err(corrupt_reply("GetBusCount", &other)),
        }
    }

    /// `None` means the object has no such bus; a normal negative result.
    pub fn bus_info(
        &self,
        media_type: MediaType,
        direction: BusDirection,
        index: i32,
    ) -> Result<Option<BusInfo>> {
        if let Some(info) = self.cache.bus_info(media_type, direction, index) {
            return Ok(Some(info));
        }
        match self.call(
            ChannelKind::Main,
            Operation::GetBusInfo {
                media_type,
                direction,
                index,
            },
        )? {
            Reply::Ok(ReplyValue::BusInfo(info)) => {
                self.cache
                    .store_bus_info(media_type, direction, index, info.clone());
                Ok(Some(info))
            }
            Reply::Unsupported => Ok(None),
            Reply::Err(msg) => Err(BridgeError::ProtocolError(msg)),
            other => Err(corrupt_reply("GetBusInfo", &other)),
        }
    }

    // --- parameters ---------------------------------------------------------

    pub fn can_process_sample_size(&self, width: SampleWidth) -> Result<bool> {
        if let Some(supported) = self.cache.can_process(width) {
            return Ok(supported);
        }
        match self.call(ChannelKind::Audio, Operation::CanProcessSampleSize(width))? {
            Reply::Ok(ReplyValue::Bool(supported)) => {
                self.cache.store_can_process(width, supported);
                Ok(supported)
            }
            Reply::Unsupported => {
                self.cache.store_can_process(width, false);
                Ok(false)
            }
            Reply::Err(msg) => Err(BridgeError::ProtocolError(msg)),
            other => Err(corrupt_reply("CanProcessSampleSize", &other)),
        }
    }

    pub fn parameter_count(&self) -> Result<i32> {
        if let Some(count) = self.cache.parameter_count() {
            return Ok(count);
        }
        match self.call(ChannelKind::Main, Operation::GetParameterCount)? {
            Reply::Ok(ReplyValue::Count(count)) => {
                self.cache.store_parameter_count(count);
                Ok(count)
            }
            Reply::Unsupported => Ok(0),
            Reply::Err(msg) => Err(BridgeError::ProtocolError(msg)),
            other => Err(corrupt_reply("GetParameterCount", &other)),
        }
    }

    pub fn parameter_info(&self, index: i32) -> Result<Option<ParameterInfo>> {
        if let Some(info) = self.cache.parameter_info(index) {
            return Ok(Some(info));
        }
        match self.call(ChannelKind::Main, Operation::GetParameterInfo { index })? {
            Reply::Ok(ReplyValue::ParameterInfo(info)) => {
                self.cache.store_parameter_info(index, info.clone());
                Ok(Some(info))
            }
            Reply::Unsupported => Ok(None),
            Reply::Err(msg) => Err(BridgeError::ProtocolError(msg)),
            other => Err(corrupt_reply("GetParameterInfo", &other)),
        }
    }

    // --- processing ---------------------------------------------------------

    /// Negotiate processing and create the shared audio region on first use.
    /// Serialized with [`ObjectProxy::process`] by the host contract; the
    /// internal lock only guards against accidental overlap.
    pub fn setup_processing(&self, setup: ProcessSetup) -> Result<()> {
        let mut guard = self.shm.lock();
        if guard.is_none() {
            // Sized for a typical stereo in/out layout; process() grows the
            // region when the real layout needs more.
            let initial = setup.max_block_samples as usize * setup.width.bytes() * 8;
            *guard = Some(AudioShmBuffer::create(self.shm_name.clone(), initial)?);
        }
        let shm = guard
            .as_ref()
            .ok_or_else(|| BridgeError::ProtocolError("shared region missing".to_string()))?;
        let descriptor = shm.descriptor();
        match self.call(
            ChannelKind::Audio,
            Operation::SetupProcessing {
                setup,
                shm: descriptor,
            },
        )? {
            Reply::Ok(ReplyValue::Unit) => Ok(()),
            Reply::Unsupported => Err(BridgeError::ProtocolError(
                "object cannot process audio".to_string(),
            )),
            Reply::Err(msg) => Err(BridgeError::ProtocolError(msg)),
            other => Err(corrupt_reply("SetupProcessing", &other)),
        }
    }

    /// Toggle the processing state. Starting opens the bus-cache window;
    /// stopping closes it.
    pub fn set_processing(&self, active: bool) -> Result<()> {
        match self.call(ChannelKind::Audio, Operation::SetProcessing(active))? {
            Reply::Ok(ReplyValue::Unit) => {
                if active {
                    self.cache.on_processing_started();
                } else {
                    self.cache.on_processing_stopped();
                }
                Ok(())
            }
            Reply::Unsupported => Err(BridgeError::ProtocolError(
                "object cannot process audio".to_string(),
            )),
            Reply::Err(msg) => Err(BridgeError::ProtocolError(msg)),
            other => Err(corrupt_reply("SetProcessing", &other)),
        }
    }

    /// Run one processing cycle. Inputs are staged into shared memory, the
    /// envelope crosses the audio channel, and the rendered outputs are read
    /// back out of the region.
    pub fn process(&self, block: &ProcessBlock) -> Result<ProcessResult> {
        codec::validate_block(block)?;
        let mut guard = self.shm.lock();
        let shm = guard.as_mut().ok_or_else(|| {
            BridgeError::ProtocolError("process called before setup_processing".to_string())
        })?;
        let (plan, envelope) = stage_block(shm, block)?;
        match self.call(ChannelKind::Audio, Operation::Process(Box::new(envelope)))? {
            Reply::Ok(ReplyValue::Process(response)) => {
                let result = unstage_result(shm, &plan, *response)?;
                codec::validate_result(
                    &result,
                    block.width,
                    block.num_samples as usize,
                    &block.output_channel_counts,
                )?;
                Ok(result)
            }
            Reply::Unsupported => Err(BridgeError::ProtocolError(
                "object cannot process audio".to_string(),
            )),
            Reply::Err(msg) => Err(BridgeError::ProtocolError(msg)),
            other => Err(corrupt_reply("Process", &other)),
        }
    }

    // --- escape hatch -------------------------------------------------------

    /// Interface call without a dedicated operation. `None` means the object
    /// does not implement the tagged call.
    pub fn generic(
        &self,
        category: ChannelKind,
        tag: u32,
        args: Vec<u8>,
    ) -> Result<Option<Vec<u8>>> {
        match self.call(category, Operation::Generic { tag, args })? {
            Reply::Ok(ReplyValue::Bytes(bytes)) => Ok(Some(bytes)),
            Reply::Ok(ReplyValue::Unit) => Ok(Some(Vec::new())),
            Reply::Unsupported => Ok(None),
            Reply::Err(msg) => Err(BridgeError::ProtocolError(msg)),
            other => Err(corrupt_reply("Generic", &other)),
        }
    }

    // --- cache invalidation hooks -------------------------------------------

    pub fn on_component_restarted(&self) {
        self.cache.on_component_restarted();
    }

    pub fn on_parameter_values_changed(&self) {
        self.cache.on_parameter_values_changed();
    }
}

impl Drop for ObjectProxy {
    /// Backstop for hosts that drop the proxy without balancing releases.
    fn drop(&mut self) {
        self.destroy();
    }
}

fn corrupt_reply(operation: &str, reply: &Reply) -> BridgeError {
    BridgeError::Corrupt(format!("unexpected reply to {operation}: {reply:?}"))
}

/// Weak map from handles to live proxies, used by the callback listener to
/// route remote-initiated callbacks to the right proxy.
#[derive(Default)]
pub struct ProxyDirectory {
    inner: Mutex<HashMap<u32, Weak<ObjectProxy>>>,
}

impl ProxyDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, proxy: &Arc<ObjectProxy>) {
        let mut inner = self.inner.lock();
        inner.retain(|_, weak| weak.strong_count() > 0);
        inner.insert(proxy.handle().0, Arc::downgrade(proxy));
    }

    pub fn get(&self, handle: ObjectHandle) -> Option<Arc<ObjectProxy>> {
        self.inner.lock().get(&handle.0).and_then(Weak::upgrade)
    }
}
