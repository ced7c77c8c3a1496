//! Shared memory for zero-copy audio block passing.
//!
//! Each plugin instance owns one growable region. The native side creates it
//! and is the only side allowed to grow it; every growth allocates a fresh
//! backing file with a bumped generation and the old one is unlinked. The
//! remote side remaps whenever a descriptor with a newer generation arrives.
//! Offsets into the region are always carried by an [`OffsetPlan`] tagged
//! with the generation it was computed against, so a plan from before a
//! growth can never read or write through the wrong mapping.

use std::cell::UnsafeCell;
use std::fs::OpenOptions;
use std::path::PathBuf;

use memmap2::MmapMut;

use crate::error::{BridgeError, Result};
use crate::protocol::{
    AudioBusBuffer, BusSamples, BusShape, ProcessBlock, ProcessEnvelope, ProcessResult,
    ProcessResultEnvelope, SampleWidth, ShmDescriptor,
};

/// Regions never shrink below this, so tiny blocks don't thrash remaps.
const MIN_CAPACITY: usize = 64 * 1024;

/// Which half of an offset plan a bus lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusLane {
    Input,
    Output,
}

/// Byte offsets for every channel of every bus of one block, inputs first,
/// then outputs. Valid only for the region generation it was computed
/// against.
#[derive(Debug, Clone, PartialEq)]
pub struct OffsetPlan {
    generation: u64,
    width: SampleWidth,
    num_samples: u32,
    input_buses: Vec<Vec<usize>>,
    output_buses: Vec<Vec<usize>>,
    total_bytes: usize,
}

impl OffsetPlan {
    pub fn new(
        width: SampleWidth,
        num_samples: u32,
        input_channels: &[u32],
        output_channels: &[u32],
        generation: u64,
    ) -> Self {
        let channel_bytes = num_samples as usize * width.bytes();
        let mut cursor = 0usize;
        let mut lay = |counts: &[u32]| -> Vec<Vec<usize>> {
            counts
                .iter()
                .map(|&channels| {
                    (0..channels)
                        .map(|_| {
                            let offset = cursor;
                            cursor += channel_bytes;
                            offset
                        })
                        .collect()
                })
                .collect()
        };
        let input_buses = lay(input_channels);
        let output_buses = lay(output_channels);
        Self {
            generation,
            width,
            num_samples,
            input_buses,
            output_buses,
            total_bytes: cursor,
        }
    }

    /// Rebuild the remote side's plan from a process envelope. Both sides
    /// must lay out the same shapes identically for the offsets to agree.
    pub fn for_envelope(envelope: &ProcessEnvelope) -> Self {
        let input_channels: Vec<u32> = envelope.input_shapes.iter().map(|s| s.channels).collect();
        Self::new(
            envelope.width,
            envelope.num_samples,
            &input_channels,
            &envelope.output_channel_counts,
            envelope.shm.generation,
        )
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }

    /// Reissue the same layout against a newer generation, after the region
    /// grew.
    fn regenerate(&self, generation: u64) -> Self {
        Self {
            generation,
            ..self.clone()
        }
    }

    fn bus_offsets(&self, lane: BusLane, index: usize) -> Result<&[usize]> {
        let buses = match lane {
            BusLane::Input => &self.input_buses,
            BusLane::Output => &self.output_buses,
        };
        buses.get(index).map(Vec::as_slice).ok_or_else(|| {
            BridgeError::ProtocolError(format!("offset plan has no {lane:?} bus {index}"))
        })
    }
}

/// Growable shared audio region.
///
/// Uses `UnsafeCell` for interior mutability since the memory-mapped region
/// is shared between processes and written through an immutable reference.
/// This is safe because processing cycles are externally serialized: exactly
/// one side touches the region at a time, and the request/response rendezvous
/// on the audio channel is the synchronization point.
pub struct AudioShmBuffer {
    mmap: UnsafeCell<MmapMut>,
    name: String,
    generation: u64,
    capacity: usize,
    /// Creator owns the backing file and unlinks it on drop.
    owns_memory: bool,
}

// SAFETY: all mutation goes through `&self` methods whose callers serialize
// access per the audio-channel protocol; the UnsafeCell never hands out
// overlapping mutable views.
unsafe impl Send for AudioShmBuffer {}
unsafe impl Sync for AudioShmBuffer {}

impl AudioShmBuffer {
    /// Create a fresh region at generation zero. Native side only.
    pub fn create(name: String, capacity: usize) -> Result<Self> {
        let capacity = capacity.max(MIN_CAPACITY);
        let mmap = Self::map_new(&name, 0, capacity)?;
        Ok(Self {
            mmap: UnsafeCell::new(mmap),
            name,
            generation: 0,
            capacity,
            owns_memory: true,
        })
    }

    /// Map an existing region from its descriptor. Remote side only.
    pub fn open(descriptor: &ShmDescriptor) -> Result<Self> {
        let path = Self::region_path(&descriptor.name, descriptor.generation);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| {
                BridgeError::ShmExhausted(format!("failed to open region {}: {e}", path.display()))
            })?;
        let mmap = unsafe { MmapMut::map_mut(&file) }
            .map_err(|e| BridgeError::ShmExhausted(format!("failed to map region: {e}")))?;
        if mmap.len() < descriptor.capacity {
            return Err(BridgeError::Corrupt(format!(
                "region {} is {} bytes, descriptor says {}",
                path.display(),
                mmap.len(),
                descriptor.capacity
            )));
        }
        Ok(Self {
            mmap: UnsafeCell::new(mmap),
            name: descriptor.name.clone(),
            generation: descriptor.generation,
            capacity: descriptor.capacity,
            owns_memory: false,
        })
    }

    /// Whether this mapping still matches the descriptor. A `false` means
    /// the creator replaced the region and the caller must `open` again.
    pub fn matches(&self, descriptor: &ShmDescriptor) -> bool {
        self.name == descriptor.name && self.generation == descriptor.generation
    }

    /// Grow the region if `bytes` doesn't fit, replacing the backing file
    /// under a bumped generation. Returns whether a growth happened.
    pub fn ensure_capacity(&mut self, bytes: usize) -> Result<bool> {
        if bytes <= self.capacity {
            return Ok(false);
        }
        if !self.owns_memory {
            return Err(BridgeError::ProtocolError(
                "only the creating side may grow a shared region".to_string(),
            ));
        }
        // Double instead of growing to the exact fit, to amortize remaps.
        let new_capacity = bytes.max(self.capacity * 2);
        let new_generation = self.generation + 1;
        let mmap = Self::map_new(&self.name, new_generation, new_capacity)?;
        let old_path = Self::region_path(&self.name, self.generation);
        if let Err(e) = std::fs::remove_file(&old_path) {
            tracing::warn!("failed to unlink old region {}: {e}", old_path.display());
        }
        self.mmap = UnsafeCell::new(mmap);
        self.generation = new_generation;
        self.capacity = new_capacity;
        Ok(true)
    }

    pub fn descriptor(&self) -> ShmDescriptor {
        ShmDescriptor {
            name: self.name.clone(),
            generation: self.generation,
            capacity: self.capacity,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn map_new(name: &str, generation: u64, capacity: usize) -> Result<MmapMut> {
        use std::os::unix::fs::OpenOptionsExt;

        let path = Self::region_path(name, generation);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(&path)
            .map_err(|e| {
                BridgeError::ShmExhausted(format!(
                    "failed to create region {}: {e}",
                    path.display()
                ))
            })?;
        file.set_len(capacity as u64)
            .map_err(|e| BridgeError::ShmExhausted(format!("failed to size region: {e}")))?;
        unsafe { MmapMut::map_mut(&file) }
            .map_err(|e| BridgeError::ShmExhausted(format!("failed to map region: {e}")))
    }

    fn region_path(name: &str, generation: u64) -> PathBuf {
        // On Linux, /dev/shm keeps the backing file off disk.
        #[cfg(target_os = "linux")]
        let base = PathBuf::from("/dev/shm");

        #[cfg(not(target_os = "linux"))]
        let base = std::env::temp_dir();

        base.join(format!("{name}-g{generation}"))
    }

    fn check_plan(&self, plan: &OffsetPlan) -> Result<()> {
        if plan.generation != self.generation {
            return Err(BridgeError::StalePlan {
                plan: plan.generation,
                region: self.generation,
            });
        }
        if plan.total_bytes > self.capacity {
            return Err(BridgeError::ShmExhausted(format!(
                "plan needs {} bytes, region holds {}",
                plan.total_bytes, self.capacity
            )));
        }
        Ok(())
    }

    /// Write one bus's channels at the plan's offsets.
    pub fn write_bus(
        &self,
        plan: &OffsetPlan,
        lane: BusLane,
        index: usize,
        bus: &AudioBusBuffer,
    ) -> Result<()> {
        self.check_plan(plan)?;
        let offsets = plan.bus_offsets(lane, index)?;
        if offsets.len() != bus.channel_count() {
            return Err(BridgeError::ProtocolError(format!(
                "plan expects {} channels for {lane:?} bus {index}, got {}",
                offsets.len(),
                bus.channel_count()
            )));
        }
        // SAFETY: callers serialize cycles; no overlapping writers.
        let mmap = unsafe { &mut *self.mmap.get() };
        match &bus.samples {
            BusSamples::F32(channels) => {
                for (channel, &offset) in channels.iter().zip(offsets) {
                    let bytes = unsafe {
                        std::slice::from_raw_parts(
                            channel.as_ptr() as *const u8,
                            std::mem::size_of_val(channel.as_slice()),
                        )
                    };
                    mmap[offset..offset + bytes.len()].copy_from_slice(bytes);
                }
            }
            BusSamples::F64(channels) => {
                for (channel, &offset) in channels.iter().zip(offsets) {
                    let bytes = unsafe {
                        std::slice::from_raw_parts(
                            channel.as_ptr() as *const u8,
                            std::mem::size_of_val(channel.as_slice()),
                        )
                    };
                    mmap[offset..offset + bytes.len()].copy_from_slice(bytes);
                }
            }
        }
        Ok(())
    }

    /// Read one bus back out of the region into a freshly allocated buffer.
    pub fn read_bus(
        &self,
        plan: &OffsetPlan,
        lane: BusLane,
        index: usize,
        silence_flags: u64,
    ) -> Result<AudioBusBuffer> {
        self.check_plan(plan)?;
        let offsets = plan.bus_offsets(lane, index)?;
        let samples = plan.num_samples as usize;
        // SAFETY: reads never race with a writer within one cycle.
        let mmap = unsafe { &*self.mmap.get() };
        let bus = match plan.width {
            SampleWidth::F32 => {
                let channels = offsets
                    .iter()
                    .map(|&offset| {
                        let mut data = vec![0.0f32; samples];
                        let bytes = unsafe {
                            std::slice::from_raw_parts_mut(
                                data.as_mut_ptr() as *mut u8,
                                samples * std::mem::size_of::<f32>(),
                            )
                        };
                        bytes.copy_from_slice(&mmap[offset..offset + bytes.len()]);
                        data
                    })
                    .collect();
                AudioBusBuffer::from_f32(channels, silence_flags)
            }
            SampleWidth::F64 => {
                let channels = offsets
                    .iter()
                    .map(|&offset| {
                        let mut data = vec![0.0f64; samples];
                        let bytes = unsafe {
                            std::slice::from_raw_parts_mut(
                                data.as_mut_ptr() as *mut u8,
                                samples * std::mem::size_of::<f64>(),
                            )
                        };
                        bytes.copy_from_slice(&mmap[offset..offset + bytes.len()]);
                        data
                    })
                    .collect();
                AudioBusBuffer::from_f64(channels, silence_flags)
            }
        };
        Ok(bus)
    }
}

impl Drop for AudioShmBuffer {
    fn drop(&mut self) {
        if self.owns_memory {
            let path = Self::region_path(&self.name, self.generation);
            let _ = std::fs::remove_file(path);
        }
    }
}

// ============================================================================
// Block staging
// ============================================================================

/// Native side: lay out one block, grow the region if needed, write the
/// input samples, and build the wire envelope. The returned plan is tagged
/// with the (possibly new) generation and matches the envelope's descriptor.
pub fn stage_block(
    shm: &mut AudioShmBuffer,
    block: &ProcessBlock,
) -> Result<(OffsetPlan, ProcessEnvelope)> {
    let input_channels: Vec<u32> = block.inputs.iter().map(|b| b.channel_count() as u32).collect();
    let mut plan = OffsetPlan::new(
        block.width,
        block.num_samples,
        &input_channels,
        &block.output_channel_counts,
        shm.generation(),
    );
    if shm.ensure_capacity(plan.total_bytes())? {
        plan = plan.regenerate(shm.generation());
    }
    for (index, bus) in block.inputs.iter().enumerate() {
        shm.write_bus(&plan, BusLane::Input, index, bus)?;
    }
    let envelope = ProcessEnvelope {
        mode: block.mode,
        width: block.width,
        num_samples: block.num_samples,
        input_shapes: block
            .inputs
            .iter()
            .map(|b| BusShape {
                channels: b.channel_count() as u32,
                silence_flags: b.silence_flags,
            })
            .collect(),
        output_channel_counts: block.output_channel_counts.clone(),
        parameter_changes: block.parameter_changes.clone(),
        events: block.events.clone(),
        context: block.context,
        shm: shm.descriptor(),
    };
    Ok((plan, envelope))
}

/// Remote side: reconstruct the block a [`stage_block`] call described.
pub fn unstage_block(
    shm: &AudioShmBuffer,
    plan: &OffsetPlan,
    envelope: ProcessEnvelope,
) -> Result<ProcessBlock> {
    let inputs = envelope
        .input_shapes
        .iter()
        .enumerate()
        .map(|(index, shape)| shm.read_bus(plan, BusLane::Input, index, shape.silence_flags))
        .collect::<Result<Vec<_>>>()?;
    Ok(ProcessBlock {
        mode: envelope.mode,
        width: envelope.width,
        num_samples: envelope.num_samples,
        inputs,
        output_channel_counts: envelope.output_channel_counts,
        parameter_changes: envelope.parameter_changes,
        events: envelope.events,
        context: envelope.context,
    })
}

/// Remote side: write rendered outputs into the region and build the
/// response envelope. Inputs are not echoed back.
pub fn stage_result(
    shm: &AudioShmBuffer,
    plan: &OffsetPlan,
    result: &ProcessResult,
) -> Result<ProcessResultEnvelope> {
    for (index, bus) in result.outputs.iter().enumerate() {
        shm.write_bus(plan, BusLane::Output, index, bus)?;
    }
    Ok(ProcessResultEnvelope {
        output_shapes: result
            .outputs
            .iter()
            .map(|b| BusShape {
                channels: b.channel_count() as u32,
                silence_flags: b.silence_flags,
            })
            .collect(),
        parameter_changes: result.parameter_changes.clone(),
        events: result.events.clone(),
    })
}

/// Native side: read rendered outputs back out of the region.
pub fn unstage_result(
    shm: &AudioShmBuffer,
    plan: &OffsetPlan,
    response: ProcessResultEnvelope,
) -> Result<ProcessResult> {
    let outputs = response
        .output_shapes
        .iter()
        .enumerate()
        .map(|(index, shape)| shm.read_bus(plan, BusLane::Output, index, shape.silence_flags))
        .collect::<Result<Vec<_>>>()?;
    Ok(ProcessResult {
        outputs,
        parameter_changes: response.parameter_changes,
        events: response.events,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ParameterChanges, ProcessMode};

    fn unique_name(tag: &str) -> String {
        format!("pontoon-test-{tag}-{}", std::process::id())
    }

    fn test_block(samples: u32) -> ProcessBlock {
        let ramp: Vec<f32> = (0..samples).map(|i| i as f32 / samples as f32).collect();
        ProcessBlock {
            mode: ProcessMode::Realtime,
            width: SampleWidth::F32,
            num_samples: samples,
            inputs: vec![AudioBusBuffer::from_f32(vec![ramp.clone(), ramp], 0)],
            output_channel_counts: vec![2],
            parameter_changes: ParameterChanges::default(),
            events: None,
            context: None,
        }
    }

    #[test]
    fn test_stage_and_unstage_roundtrip() {
        let mut shm = AudioShmBuffer::create(unique_name("roundtrip"), MIN_CAPACITY).unwrap();
        let block = test_block(256);
        let (plan, envelope) = stage_block(&mut shm, &block).unwrap();

        let opened = AudioShmBuffer::open(&envelope.shm).unwrap();
        let remote_plan = OffsetPlan::for_envelope(&envelope);
        assert_eq!(remote_plan, plan);

        let rebuilt = unstage_block(&opened, &remote_plan, envelope).unwrap();
        assert_eq!(rebuilt.inputs, block.inputs);

        // Remote renders into the output lane and the native side reads it.
        let result = ProcessResult {
            outputs: vec![AudioBusBuffer::from_f32(
                vec![vec![0.5; 256], vec![-0.5; 256]],
                0,
            )],
            parameter_changes: None,
            events: None,
        };
        let response = stage_result(&opened, &remote_plan, &result).unwrap();
        let read_back = unstage_result(&shm, &plan, response).unwrap();
        assert_eq!(read_back.outputs, result.outputs);
    }

    #[test]
    fn test_growth_bumps_generation_and_invalidates_old_plans() {
        let mut shm = AudioShmBuffer::create(unique_name("growth"), MIN_CAPACITY).unwrap();
        let small = test_block(64);
        let (old_plan, _) = stage_block(&mut shm, &small).unwrap();
        assert_eq!(shm.generation(), 0);

        // 32 channels of 16384 f32 samples will not fit in MIN_CAPACITY.
        let big = ProcessBlock {
            inputs: vec![AudioBusBuffer::zeroed(SampleWidth::F32, 16, 1 << 14)],
            output_channel_counts: vec![16],
            num_samples: 1 << 14,
            ..test_block(64)
        };
        let (new_plan, envelope) = stage_block(&mut shm, &big).unwrap();
        assert_eq!(shm.generation(), 1);
        assert_eq!(envelope.shm.generation, 1);
        assert_eq!(new_plan.generation(), 1);

        // The pre-growth plan is rejected rather than misread.
        let bus = AudioBusBuffer::zeroed(SampleWidth::F32, 2, 64);
        let err = shm.write_bus(&old_plan, BusLane::Input, 0, &bus).unwrap_err();
        assert!(matches!(err, BridgeError::StalePlan { plan: 0, region: 1 }));
    }

    #[test]
    fn test_opener_may_not_grow() {
        let shm = AudioShmBuffer::create(unique_name("nogrow"), MIN_CAPACITY).unwrap();
        let mut opened = AudioShmBuffer::open(&shm.descriptor()).unwrap();
        assert!(opened.ensure_capacity(shm.capacity() * 4).is_err());
    }

    #[test]
    fn test_descriptor_mismatch_detection() {
        let shm = AudioShmBuffer::create(unique_name("match"), MIN_CAPACITY).unwrap();
        let opened = AudioShmBuffer::open(&shm.descriptor()).unwrap();
        assert!(opened.matches(&shm.descriptor()));
        let mut newer = shm.descriptor();
        newer.generation += 1;
        assert!(!opened.matches(&newer));
    }

    #[test]
    fn test_creator_unlinks_on_drop() {
        let name = unique_name("unlink");
        let path = AudioShmBuffer::region_path(&name, 0);
        let shm = AudioShmBuffer::create(name, MIN_CAPACITY).unwrap();
        assert!(path.exists());
        drop(shm);
        assert!(!path.exists());
    }
}
