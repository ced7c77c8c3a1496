//! Call-result caches for one proxied object
//!
//! Two independent groups with different lifetimes:
//!
//! * Bus topology is immutable while audio is running, so counts and infos
//!   are cached only between `set_processing(true)` and
//!   `set_processing(false)`. Outside that window every query goes to the
//!   remote side.
//! * Parameter identity survives processing but not a component restart, so
//!   sample-size support, the parameter count, and per-index parameter infos
//!   live until the plugin announces a restart or changed parameter values,
//!   at which point the whole group drops atomically.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::protocol::{BusDirection, BusInfo, MediaType, ParameterInfo, SampleWidth};

#[derive(Default)]
struct BusCache {
    counts: HashMap<(MediaType, BusDirection), i32>,
    infos: HashMap<(MediaType, BusDirection, i32), BusInfo>,
}

#[derive(Default)]
struct FunctionCache {
    can_process: HashMap<SampleWidth, bool>,
    parameter_count: Option<i32>,
    parameter_infos: HashMap<i32, ParameterInfo>,
}

#[derive(Default)]
pub struct ProxyCache {
    /// `Some` only while processing is active.
    bus: Mutex<Option<BusCache>>,
    function: Mutex<FunctionCache>,
}

impl ProxyCache {
    pub fn new() -> Self {
        Self::default()
    }

    // --- lifecycle ---------------------------------------------------------

    pub fn on_processing_started(&self) {
        *self.bus.lock() = Some(BusCache::default());
    }

    pub fn on_processing_stopped(&self) {
        *self.bus.lock() = None;
    }

    /// Drop the parameter/identity group in one shot. Partial invalidation
    /// would let a stale count coexist with fresh infos.
    pub fn on_component_restarted(&self) {
        *self.function.lock() = FunctionCache::default();
    }

    /// The plugin rewired its parameters without a full restart; identity
    /// answers are stale all the same.
    pub fn on_parameter_values_changed(&self) {
        self.on_component_restarted();
    }

    // --- bus group ---------------------------------------------------------

    pub fn bus_count(&self, media_type: MediaType, direction: BusDirection) -> Option<i32> {
        self.bus
            .lock()
            .as_ref()
            .and_then(|cache| cache.counts.get(&(media_type, direction)).copied())
    }

    /// No-op when processing is inactive.
    pub fn store_bus_count(&self, media_type: MediaType, direction: BusDirection, count: i32) {
        if let Some(cache) = self.bus.lock().as_mut() {
            cache.counts.insert((media_type, direction), count);
        }
    }

    pub fn bus_info(
        &self,
        media_type: MediaType,
        direction: BusDirection,
        index: i32,
    ) -> Option<BusInfo> {
        self.bus
            .lock()
            .as_ref()
            .and_then(|cache| cache.infos.get(&(media_type, direction, index)).cloned())
    }

    pub fn store_bus_info(
        &self,
        media_type: MediaType,
        direction: BusDirection,
        index: i32,
        info: BusInfo,
    ) {
        if let Some(cache) = self.bus.lock().as_mut() {
            cache.infos.insert((media_type, direction, index), info);
        }
    }

    // --- parameter/identity group ------------------------------------------

    pub fn can_process(&self, width: SampleWidth) -> Option<bool> {
        self.function.lock().can_process.get(&width).copied()
    }

    pub fn store_can_process(&self, width: SampleWidth, supported: bool) {
        self.function.lock().can_process.insert(width, supported);
    }

    pub fn parameter_count(&self) -> Option<i32> {
        self.function.lock().parameter_count
    }

    pub fn store_parameter_count(&self, count: i32) {
        self.function.lock().parameter_count = Some(count);
    }

    pub fn parameter_info(&self, index: i32) -> Option<ParameterInfo> {
        self.function.lock().parameter_infos.get(&index).cloned()
    }

    pub fn store_parameter_info(&self, index: i32, info: ParameterInfo) {
        self.function.lock().parameter_infos.insert(index, info);
    }
}
