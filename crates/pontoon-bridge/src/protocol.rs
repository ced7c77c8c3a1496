//! Wire protocol: data model and message envelopes
//!
//! Everything that crosses a call channel is defined here. All types are
//! serialized with bincode behind a length-prefixed frame (see `transport`).
//! Audio samples never travel through these messages; `Process` envelopes
//! carry shapes and an offset plan while the samples go through shared memory.

use std::collections::BTreeSet;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

// ============================================================================
// Handles
// ============================================================================

/// Identifies one bridged object within a single remote instance. Handles are
/// assigned by the remote side at object-creation time and are meaningless
/// across instances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectHandle(pub u32);

impl ObjectHandle {
    /// Pseudo-object addressed by `CreateInstance`. Never assigned to a real
    /// object; the registry hands out handles starting at 1.
    pub const FACTORY: ObjectHandle = ObjectHandle(0);
}

impl std::fmt::Display for ObjectHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Identifies a host-provided context menu registered on the native side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContextMenuHandle(pub u64);

// ============================================================================
// Capabilities
// ============================================================================

/// Optional interfaces a bridged object may implement. Queried once at
/// creation; later queries for the same object go over the main channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Capability {
    AudioProcessor,
    Component,
    EditController,
    EditController2,
    ConnectionPoint,
    UnitInfo,
    UnitData,
    ProgramListData,
    NoteExpressionController,
    KeyswitchController,
    MidiMapping,
    MidiLearn,
    XmlRepresentationController,
    AutomationState,
    PrefetchableSupport,
    ContextMenuTarget,
}

/// The set of capabilities reported for one object at creation time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilitySet {
    caps: BTreeSet<Capability>,
}

impl CapabilitySet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, cap: Capability) {
        self.caps.insert(cap);
    }

    pub fn contains(&self, cap: Capability) -> bool {
        self.caps.contains(&cap)
    }

    pub fn len(&self) -> usize {
        self.caps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.caps.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = Capability> + '_ {
        self.caps.iter().copied()
    }
}

impl FromIterator<Capability> for CapabilitySet {
    fn from_iter<I: IntoIterator<Item = Capability>>(iter: I) -> Self {
        Self {
            caps: iter.into_iter().collect(),
        }
    }
}

// ============================================================================
// Buses and parameters
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MediaType {
    Audio,
    Event,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BusDirection {
    Input,
    Output,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BusType {
    Main,
    Aux,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusInfo {
    pub media_type: MediaType,
    pub direction: BusDirection,
    pub channel_count: i32,
    pub name: String,
    pub bus_type: BusType,
    pub is_default_active: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterInfo {
    pub id: u32,
    pub title: String,
    pub short_title: String,
    pub units: String,
    pub step_count: i32,
    pub default_normalized_value: f64,
    pub unit_id: i32,
    pub can_automate: bool,
    pub is_read_only: bool,
    pub is_bypass: bool,
}

// ============================================================================
// Audio buffers
// ============================================================================

/// Per-block sample precision negotiated at setup time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SampleWidth {
    F32,
    F64,
}

impl SampleWidth {
    pub fn bytes(self) -> usize {
        match self {
            SampleWidth::F32 => 4,
            SampleWidth::F64 => 8,
        }
    }
}

/// One bus worth of deinterleaved audio, all channels the same length.
/// The variant tag is the single source of truth for sample width; a block
/// never mixes widths across buses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BusSamples {
    F32(Vec<Vec<f32>>),
    F64(Vec<Vec<f64>>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioBusBuffer {
    /// Bit N set means channel N contains only silence. Channels >= 64 are
    /// never marked silent.
    pub silence_flags: u64,
    pub samples: BusSamples,
}

impl AudioBusBuffer {
    pub fn from_f32(channels: Vec<Vec<f32>>, silence_flags: u64) -> Self {
        Self {
            silence_flags,
            samples: BusSamples::F32(channels),
        }
    }

    pub fn from_f64(channels: Vec<Vec<f64>>, silence_flags: u64) -> Self {
        Self {
            silence_flags,
            samples: BusSamples::F64(channels),
        }
    }

    /// An all-silent bus of the given shape.
    pub fn zeroed(width: SampleWidth, channels: usize, samples: usize) -> Self {
        let silence = if channels >= 64 {
            u64::MAX
        } else {
            (1u64 << channels) - 1
        };
        match width {
            SampleWidth::F32 => Self::from_f32(vec![vec![0.0; samples]; channels], silence),
            SampleWidth::F64 => Self::from_f64(vec![vec![0.0; samples]; channels], silence),
        }
    }

    pub fn width(&self) -> SampleWidth {
        match self.samples {
            BusSamples::F32(_) => SampleWidth::F32,
            BusSamples::F64(_) => SampleWidth::F64,
        }
    }

    pub fn channel_count(&self) -> usize {
        match &self.samples {
            BusSamples::F32(c) => c.len(),
            BusSamples::F64(c) => c.len(),
        }
    }

    pub fn sample_count(&self) -> usize {
        match &self.samples {
            BusSamples::F32(c) => c.first().map_or(0, Vec::len),
            BusSamples::F64(c) => c.first().map_or(0, Vec::len),
        }
    }
}

// ============================================================================
// Parameter changes and events
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ParameterPoint {
    pub sample_offset: i32,
    pub value: f64,
}

/// Automation curve for one parameter over one block, points in ascending
/// sample-offset order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterQueue {
    pub parameter_id: u32,
    pub points: Vec<ParameterPoint>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParameterChanges {
    pub queues: Vec<ParameterQueue>,
}

impl ParameterChanges {
    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EventPayload {
    NoteOn {
        channel: i16,
        pitch: i16,
        velocity: f32,
        note_id: i32,
        tuning: f32,
    },
    NoteOff {
        channel: i16,
        pitch: i16,
        velocity: f32,
        note_id: i32,
        tuning: f32,
    },
    PolyPressure {
        channel: i16,
        pitch: i16,
        pressure: f32,
        note_id: i32,
    },
    NoteExpressionValue {
        type_id: u32,
        note_id: i32,
        value: f64,
    },
    /// Raw three-byte MIDI message, passed through unchanged.
    Midi { data: [u8; 3] },
    SysEx { data: Vec<u8> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub bus_index: i32,
    pub sample_offset: i32,
    pub flags: u16,
    pub payload: EventPayload,
}

/// Events for one block in sample-offset order. Stack-allocated for the
/// common small batch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventBatch {
    pub events: SmallVec<[Event; 64]>,
}

impl EventBatch {
    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

// ============================================================================
// Process context
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Chord {
    pub key_note: u8,
    pub root_note: u8,
    pub chord_mask: u16,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct FrameRate {
    pub frames_per_second: u32,
    pub flags: u32,
}

/// Transport snapshot for one block. Serialized field by field with a flags
/// word up front; fields not named here are intentionally dropped at the
/// bridge boundary rather than forwarded opaquely.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessContext {
    pub state_flags: u32,
    pub sample_rate: f64,
    pub project_time_samples: i64,
    pub system_time: i64,
    pub continuous_time_samples: i64,
    pub project_time_music: f64,
    pub bar_position_music: f64,
    pub cycle_start_music: f64,
    pub cycle_end_music: f64,
    pub tempo: f64,
    pub time_sig_numerator: i32,
    pub time_sig_denominator: i32,
    pub chord: Chord,
    pub smpte_offset_subframes: i32,
    pub frame_rate: FrameRate,
    pub samples_to_next_clock: i32,
}

// ============================================================================
// Processing setup and blocks
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessMode {
    Realtime,
    Prefetch,
    Offline,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProcessSetup {
    pub mode: ProcessMode,
    pub width: SampleWidth,
    pub max_block_samples: u32,
    pub sample_rate: f64,
}

/// Everything the native host hands the bridge for one processing cycle.
/// Inputs carry samples; outputs are declared by channel count only and come
/// back in the matching [`ProcessResult`].
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessBlock {
    pub mode: ProcessMode,
    pub width: SampleWidth,
    pub num_samples: u32,
    pub inputs: Vec<AudioBusBuffer>,
    pub output_channel_counts: Vec<u32>,
    pub parameter_changes: ParameterChanges,
    pub events: Option<EventBatch>,
    pub context: Option<ProcessContext>,
}

impl ProcessBlock {
    /// Zeroed output buses matching the declared shapes, used by the remote
    /// side as the plugin's render destination.
    pub fn allocate_outputs(&self) -> Vec<AudioBusBuffer> {
        self.output_channel_counts
            .iter()
            .map(|&c| AudioBusBuffer::zeroed(self.width, c as usize, self.num_samples as usize))
            .collect()
    }
}

/// What comes back from one processing cycle: rendered outputs plus the
/// plugin's outbound parameter changes and events. Inputs are never echoed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProcessResult {
    pub outputs: Vec<AudioBusBuffer>,
    pub parameter_changes: Option<ParameterChanges>,
    pub events: Option<EventBatch>,
}

// ============================================================================
// Shared-memory negotiation
// ============================================================================

/// Names a shared audio region and its current generation. Sent whenever the
/// region may have been replaced so the opener can remap.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShmDescriptor {
    pub name: String,
    pub generation: u64,
    pub capacity: usize,
}

/// Shape of one bus as staged in shared memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusShape {
    pub channels: u32,
    pub silence_flags: u64,
}

/// The audio-channel request for one processing cycle. Samples live in the
/// shared region described by `shm`; this envelope carries only the shapes
/// needed to reconstruct them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessEnvelope {
    pub mode: ProcessMode,
    pub width: SampleWidth,
    pub num_samples: u32,
    pub input_shapes: Vec<BusShape>,
    pub output_channel_counts: Vec<u32>,
    pub parameter_changes: ParameterChanges,
    pub events: Option<EventBatch>,
    pub context: Option<ProcessContext>,
    pub shm: ShmDescriptor,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessResultEnvelope {
    pub output_shapes: Vec<BusShape>,
    pub parameter_changes: Option<ParameterChanges>,
    pub events: Option<EventBatch>,
}

// ============================================================================
// Call channels
// ============================================================================

/// Which of the four sockets a connection serves. Sent once by the client as
/// a handshake right after connecting; also used to route outbound calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChannelKind {
    /// Main-thread calls, dispatched into the remote event loop.
    Main,
    /// Audio-thread calls: processing and processing setup.
    Audio,
    /// Latency-sensitive non-main calls served directly on their thread.
    Expedited,
    /// Remote-to-native callbacks; the only channel where the remote side
    /// initiates requests.
    HostCallback,
}

/// One call addressed to one bridged object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub category: ChannelKind,
    pub object: ObjectHandle,
    pub operation: Operation,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Operation {
    /// Addressed to [`ObjectHandle::FACTORY`]; creates a bridged object and
    /// returns its handle plus capability set.
    CreateInstance,
    QueryCapability(Capability),
    GetBusCount {
        media_type: MediaType,
        direction: BusDirection,
    },
    GetBusInfo {
        media_type: MediaType,
        direction: BusDirection,
        index: i32,
    },
    CanProcessSampleSize(SampleWidth),
    GetParameterCount,
    GetParameterInfo {
        index: i32,
    },
    SetupProcessing {
        setup: ProcessSetup,
        shm: ShmDescriptor,
    },
    SetProcessing(bool),
    Process(Box<ProcessEnvelope>),
    /// A popped context-menu item was chosen by the user.
    MenuItemSelected {
        tag: i32,
    },
    /// Escape hatch for interface calls without a dedicated variant. `args`
    /// is a bincode payload interpreted by the object itself.
    Generic {
        tag: u32,
        args: Vec<u8>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Reply {
    Ok(ReplyValue),
    /// The object does not implement the requested operation. A normal
    /// negative result, never an error.
    Unsupported,
    /// The remote side failed locally; the instance itself is still alive.
    Err(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ReplyValue {
    Unit,
    Bool(bool),
    Count(i32),
    Created {
        handle: ObjectHandle,
        capabilities: CapabilitySet,
    },
    BusInfo(BusInfo),
    ParameterInfo(ParameterInfo),
    Process(Box<ProcessResultEnvelope>),
    Bytes(Vec<u8>),
}

/// Fire-and-forget messages. The server never replies to these.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Notification {
    /// Last native reference dropped; the remote object can be torn down.
    Destroy { object: ObjectHandle },
}

/// Top-level frame on the three native-to-remote channels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClientMessage {
    Request(Envelope),
    Notify(Notification),
}

// ============================================================================
// Host callbacks (remote-to-native)
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallbackEnvelope {
    pub object: ObjectHandle,
    pub callback: HostCallback,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum HostCallback {
    RestartComponent { flags: u32 },
    ParameterValuesChanged,
    BeginEdit { parameter_id: u32 },
    PerformEdit { parameter_id: u32, value: f64 },
    EndEdit { parameter_id: u32 },
    /// Ask for a deferred main-thread callback. Duplicates while one is
    /// pending are dropped on the native side.
    RequestCallback,
    CreateContextMenu { parameter_id: Option<u32> },
    ContextMenuAddItem {
        menu: ContextMenuHandle,
        tag: i32,
        name: String,
    },
    ContextMenuPopup {
        menu: ContextMenuHandle,
        x: i32,
        y: i32,
    },
    ReleaseContextMenu { menu: ContextMenuHandle },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CallbackReply {
    Ok,
    Handle(ContextMenuHandle),
    Unsupported,
    Err(String),
}

// ============================================================================
// Configuration
// ============================================================================

/// Connection-level settings shared by both sides of the bridge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Unix socket path all four channels connect to.
    pub socket_path: PathBuf,
    /// Name prefix for shared audio regions.
    pub shm_prefix: String,
    /// How long a blocked call waits for its response before the instance is
    /// declared dead.
    pub timeout_ms: u64,
    /// Remote event loop wakeup interval for native event pumping.
    pub event_loop_tick_ms: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            socket_path: std::env::temp_dir().join(format!("pontoon-{}.sock", std::process::id())),
            shm_prefix: format!("pontoon-{}", std::process::id()),
            timeout_ms: 10_000,
            event_loop_tick_ms: 16,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capability_set() {
        let mut caps = CapabilitySet::new();
        assert!(caps.is_empty());
        caps.insert(Capability::AudioProcessor);
        caps.insert(Capability::EditController);
        caps.insert(Capability::AudioProcessor);
        assert_eq!(caps.len(), 2);
        assert!(caps.contains(Capability::AudioProcessor));
        assert!(!caps.contains(Capability::MidiMapping));
    }

    #[test]
    fn test_zeroed_bus_shape() {
        let bus = AudioBusBuffer::zeroed(SampleWidth::F32, 2, 256);
        assert_eq!(bus.width(), SampleWidth::F32);
        assert_eq!(bus.channel_count(), 2);
        assert_eq!(bus.sample_count(), 256);
        assert_eq!(bus.silence_flags, 0b11);

        let wide = AudioBusBuffer::zeroed(SampleWidth::F64, 1, 64);
        assert_eq!(wide.width(), SampleWidth::F64);
        assert_eq!(wide.silence_flags, 0b1);
    }

    #[test]
    fn test_allocate_outputs_matches_declared_counts() {
        let block = ProcessBlock {
            mode: ProcessMode::Realtime,
            width: SampleWidth::F32,
            num_samples: 128,
            inputs: vec![AudioBusBuffer::zeroed(SampleWidth::F32, 2, 128)],
            output_channel_counts: vec![2, 1],
            parameter_changes: ParameterChanges::default(),
            events: None,
            context: None,
        };
        let outputs = block.allocate_outputs();
        assert_eq!(outputs.len(), 2);
        assert_eq!(outputs[0].channel_count(), 2);
        assert_eq!(outputs[1].channel_count(), 1);
        assert_eq!(outputs[1].sample_count(), 128);
    }

    #[test]
    fn test_envelope_roundtrip() {
        let envelope = Envelope {
            category: ChannelKind::Main,
            object: ObjectHandle(3),
            operation: Operation::GetBusInfo {
                media_type: MediaType::Audio,
                direction: BusDirection::Output,
                index: 1,
            },
        };
        let bytes = bincode::serialize(&ClientMessage::Request(envelope.clone())).unwrap();
        let decoded: ClientMessage = bincode::deserialize(&bytes).unwrap();
        assert_eq!(decoded, ClientMessage::Request(envelope));
    }

    #[test]
    fn test_process_context_defaults_to_stopped_transport() {
        let ctx = ProcessContext::default();
        assert_eq!(ctx.state_flags, 0);
        assert_eq!(ctx.tempo, 0.0);
        let bytes = bincode::serialize(&ctx).unwrap();
        let decoded: ProcessContext = bincode::deserialize(&bytes).unwrap();
        assert_eq!(decoded, ctx);
    }
}
