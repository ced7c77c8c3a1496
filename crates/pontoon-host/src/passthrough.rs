//! Passthrough object: the trivial plugin
//!
//! Copies input buses to output buses sample for sample. Stands in for a
//! real plugin wrapper in the binary's default factory and in loopback
//! tests, and exposes a few generic tags that poke the host-callback
//! channel so the reverse path can be exercised end to end.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use pontoon_bridge::protocol::{
    BusDirection, BusInfo, BusType, Capability, CapabilitySet, ContextMenuHandle, MediaType,
    ObjectHandle, ParameterInfo, ProcessBlock, ProcessResult, ProcessSetup, SampleWidth,
};

use crate::callback::HostCallbackChannel;
use crate::object::BridgedObject;

/// Ask the native side for a deferred main-thread callback.
pub const GENERIC_REQUEST_DEFERRED: u32 = 1;
/// Run a begin/perform/end edit gesture; args = bincode `(u32, f64)`.
pub const GENERIC_EDIT_GESTURE: u32 = 2;
/// Create a context menu, add one item, pop it up; args = bincode
/// `(i32, String)`; reply = bincode `bool` (menu shown).
pub const GENERIC_OPEN_MENU: u32 = 3;
/// Reply = bincode `Vec<i32>` of menu tags selected so far.
pub const GENERIC_SELECTED_TAGS: u32 = 4;
/// Release the menu created by `GENERIC_OPEN_MENU`.
pub const GENERIC_CLOSE_MENU: u32 = 5;

/// Interior state is split by calling context: the audio channel only ever
/// touches `audio`, the main and expedited channels only `menu`, so a call
/// parked on one lock never delays the other path.
pub struct PassthroughObject {
    handle: AtomicU32,
    callback: Option<Arc<HostCallbackChannel>>,
    audio: Mutex<AudioState>,
    menu: Mutex<MenuState>,
}

#[derive(Default)]
struct AudioState {
    setup: Option<ProcessSetup>,
    processing: bool,
}

#[derive(Default)]
struct MenuState {
    menu: Option<ContextMenuHandle>,
    selected_tags: Vec<i32>,
}

impl PassthroughObject {
    pub fn new(callback: Arc<HostCallbackChannel>) -> Self {
        Self {
            handle: AtomicU32::new(ObjectHandle::FACTORY.0),
            callback: Some(callback),
            audio: Mutex::new(AudioState::default()),
            menu: Mutex::new(MenuState::default()),
        }
    }

    /// For registry tests that never touch the callback channel.
    #[cfg(test)]
    pub(crate) fn detached() -> Self {
        Self {
            handle: AtomicU32::new(ObjectHandle::FACTORY.0),
            callback: None,
            audio: Mutex::new(AudioState::default()),
            menu: Mutex::new(MenuState::default()),
        }
    }

    fn handle(&self) -> ObjectHandle {
        ObjectHandle(self.handle.load(Ordering::Relaxed))
    }

    fn stereo_bus(&self, direction: BusDirection) -> BusInfo {
        BusInfo {
            media_type: MediaType::Audio,
            direction,
            channel_count: 2,
            name: match direction {
                BusDirection::Input => "Stereo In".to_string(),
                BusDirection::Output => "Stereo Out".to_string(),
            },
            bus_type: BusType::Main,
            is_default_active: true,
        }
    }
}

impl BridgedObject for PassthroughObject {
    fn capabilities(&self) -> CapabilitySet {
        CapabilitySet::from_iter([
            Capability::Component,
            Capability::AudioProcessor,
            Capability::EditController,
            Capability::ContextMenuTarget,
        ])
    }

    fn attached(&self, handle: ObjectHandle) {
        self.handle.store(handle.0, Ordering::Relaxed);
    }

    fn bus_count(&self, media_type: MediaType, direction: BusDirection) -> i32 {
        match (media_type, direction) {
            (MediaType::Audio, _) => 1,
            (MediaType::Event, BusDirection::Input) => 1,
            (MediaType::Event, BusDirection::Output) => 0,
        }
    }

    fn bus_info(
        &self,
        media_type: MediaType,
        direction: BusDirection,
        index: i32,
    ) -> Option<BusInfo> {
        if media_type != MediaType::Audio || index != 0 {
            return None;
        }
        Some(self.stereo_bus(direction))
    }

    fn can_process_sample_size(&self, width: SampleWidth) -> bool {
        width == SampleWidth::F32
    }

    fn parameter_count(&self) -> i32 {
        2
    }

    fn parameter_info(&self, index: i32) -> Option<ParameterInfo> {
        match index {
            0 => Some(ParameterInfo {
                id: 100,
                title: "Gain".to_string(),
                short_title: "Gain".to_string(),
                units: "dB".to_string(),
                step_count: 0,
                default_normalized_value: 0.5,
                unit_id: 0,
                can_automate: true,
                is_read_only: false,
                is_bypass: false,
            }),
            1 => Some(ParameterInfo {
                id: 101,
                title: "Bypass".to_string(),
                short_title: "Byp".to_string(),
                units: String::new(),
                step_count: 1,
                default_normalized_value: 0.0,
                unit_id: 0,
                can_automate: true,
                is_read_only: false,
                is_bypass: true,
            }),
            _ => None,
        }
    }

    fn setup_processing(&self, setup: &ProcessSetup) {
        self.audio.lock().setup = Some(*setup);
    }

    fn set_processing(&self, active: bool) {
        self.audio.lock().processing = active;
    }

    fn process(&self, block: ProcessBlock) -> ProcessResult {
        let mut outputs = block.allocate_outputs();
        let active = {
            let audio = self.audio.lock();
            audio.processing && audio.setup.is_some()
        };
        if active {
            for (output, input) in outputs.iter_mut().zip(&block.inputs) {
                if output.channel_count() == input.channel_count() {
                    *output = input.clone();
                }
            }
        }
        ProcessResult {
            outputs,
            parameter_changes: None,
            events: None,
        }
    }

    fn menu_item_selected(&self, tag: i32) -> bool {
        self.menu.lock().selected_tags.push(tag);
        true
    }

    fn generic(&self, tag: u32, args: &[u8]) -> Option<Vec<u8>> {
        let callback = self.callback.as_ref()?;
        match tag {
            GENERIC_REQUEST_DEFERRED => {
                callback.request_callback(self.handle()).ok()?;
                Some(Vec::new())
            }
            GENERIC_EDIT_GESTURE => {
                let (parameter_id, value): (u32, f64) = bincode::deserialize(args).ok()?;
                let handle = self.handle();
                callback.begin_edit(handle, parameter_id).ok()?;
                callback.perform_edit(handle, parameter_id, value).ok()?;
                callback.end_edit(handle, parameter_id).ok()?;
                Some(Vec::new())
            }
            GENERIC_OPEN_MENU => {
                let (item_tag, name): (i32, String) = bincode::deserialize(args).ok()?;
                let handle = self.handle();
                let menu = callback.create_context_menu(handle, None).ok()??;
                callback
                    .add_context_menu_item(handle, menu, item_tag, &name)
                    .ok()?;
                // No state lock across the popup: a modal menu may fire its
                // selection back into this object before it returns.
                let shown = callback.popup_context_menu(handle, menu, 0, 0).ok()?;
                self.menu.lock().menu = Some(menu);
                bincode::serialize(&shown).ok()
            }
            GENERIC_SELECTED_TAGS => {
                let tags = self.menu.lock().selected_tags.clone();
                bincode::serialize(&tags).ok()
            }
            GENERIC_CLOSE_MENU => {
                let menu = self.menu.lock().menu.take()?;
                callback.release_context_menu(self.handle(), menu).ok()?;
                Some(Vec::new())
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pontoon_bridge::protocol::{AudioBusBuffer, ParameterChanges, ProcessMode};

    fn stereo_block() -> ProcessBlock {
        ProcessBlock {
            mode: ProcessMode::Realtime,
            width: SampleWidth::F32,
            num_samples: 8,
            inputs: vec![AudioBusBuffer::from_f32(
                vec![vec![0.5; 8], vec![-0.5; 8]],
                0,
            )],
            output_channel_counts: vec![2, 1],
            parameter_changes: ParameterChanges::default(),
            events: None,
            context: None,
        }
    }

    fn started(object: &PassthroughObject) {
        object.setup_processing(&ProcessSetup {
            mode: ProcessMode::Realtime,
            width: SampleWidth::F32,
            max_block_samples: 512,
            sample_rate: 48_000.0,
        });
        object.set_processing(true);
    }

    #[test]
    fn test_passthrough_copies_matching_buses() {
        let object = PassthroughObject::detached();
        started(&object);
        let block = stereo_block();
        let result = object.process(block.clone());
        assert_eq!(result.outputs.len(), 2);
        assert_eq!(result.outputs[0], block.inputs[0]);
        // The unmatched mono bus stays silent.
        assert_eq!(
            result.outputs[1],
            AudioBusBuffer::zeroed(SampleWidth::F32, 1, 8)
        );
    }

    #[test]
    fn test_idle_object_renders_silence() {
        let object = PassthroughObject::detached();
        let result = object.process(stereo_block());
        assert_eq!(
            result.outputs[0],
            AudioBusBuffer::zeroed(SampleWidth::F32, 2, 8)
        );
    }

    #[test]
    fn test_only_f32_supported() {
        let object = PassthroughObject::detached();
        assert!(object.can_process_sample_size(SampleWidth::F32));
        assert!(!object.can_process_sample_size(SampleWidth::F64));
    }
}
