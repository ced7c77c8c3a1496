//! Audio block codec: validation plus lossless encode/decode
//!
//! Limits are enforced before serialization so an oversized block fails fast
//! on the sending side instead of being truncated or rejected remotely. On
//! decode, any shape that violates the block invariants means the peer sent
//! something we could never have produced, which is treated as corruption.

use crate::error::{BridgeError, Result};
use crate::protocol::{AudioBusBuffer, BusSamples, ProcessBlock, ProcessResult, SampleWidth};

/// Hard cap on buses per direction.
pub const MAX_BUSES: usize = 32;
/// Hard cap on channels per bus.
pub const MAX_CHANNELS: usize = 32;
/// Hard cap on samples per block.
pub const MAX_BLOCK_SAMPLES: usize = 1 << 16;
/// Hard cap on events per block.
pub const MAX_EVENTS: usize = 4096;

/// Check a single bus against the channel limit and the equal-length
/// invariant, in the context of a block of `num_samples` frames at `width`.
pub fn validate_bus(bus: &AudioBusBuffer, width: SampleWidth, num_samples: usize) -> Result<()> {
    if bus.width() != width {
        return Err(BridgeError::Corrupt(format!(
            "bus sample width {:?} does not match block width {:?}",
            bus.width(),
            width
        )));
    }
    if bus.channel_count() > MAX_CHANNELS {
        return Err(BridgeError::LimitExceeded {
            what: "channels per bus",
            len: bus.channel_count(),
            max: MAX_CHANNELS,
        });
    }
    let lengths_ok = match &bus.samples {
        BusSamples::F32(channels) => channels.iter().all(|c| c.len() == num_samples),
        BusSamples::F64(channels) => channels.iter().all(|c| c.len() == num_samples),
    };
    if !lengths_ok {
        return Err(BridgeError::Corrupt(format!(
            "channel length does not match block sample count {num_samples}"
        )));
    }
    Ok(())
}

/// Validate a full request block before it leaves the native side.
pub fn validate_block(block: &ProcessBlock) -> Result<()> {
    let num_samples = block.num_samples as usize;
    if num_samples > MAX_BLOCK_SAMPLES {
        return Err(BridgeError::LimitExceeded {
            what: "block samples",
            len: num_samples,
            max: MAX_BLOCK_SAMPLES,
        });
    }
    if block.inputs.len() > MAX_BUSES {
        return Err(BridgeError::LimitExceeded {
            what: "input buses",
            len: block.inputs.len(),
            max: MAX_BUSES,
        });
    }
    if block.output_channel_counts.len() > MAX_BUSES {
        return Err(BridgeError::LimitExceeded {
            what: "output buses",
            len: block.output_channel_counts.len(),
            max: MAX_BUSES,
        });
    }
    for bus in &block.inputs {
        validate_bus(bus, block.width, num_samples)?;
    }
    for &channels in &block.output_channel_counts {
        if channels as usize > MAX_CHANNELS {
            return Err(BridgeError::LimitExceeded {
                what: "channels per bus",
                len: channels as usize,
                max: MAX_CHANNELS,
            });
        }
    }
    if let Some(events) = &block.events {
        if events.len() > MAX_EVENTS {
            return Err(BridgeError::LimitExceeded {
                what: "events per block",
                len: events.len(),
                max: MAX_EVENTS,
            });
        }
    }
    Ok(())
}

/// Validate a result against the request it answers.
pub fn validate_result(
    result: &ProcessResult,
    width: SampleWidth,
    num_samples: usize,
    declared_outputs: &[u32],
) -> Result<()> {
    if result.outputs.len() != declared_outputs.len() {
        return Err(BridgeError::Corrupt(format!(
            "result has {} output buses, request declared {}",
            result.outputs.len(),
            declared_outputs.len()
        )));
    }
    for (bus, &declared) in result.outputs.iter().zip(declared_outputs) {
        validate_bus(bus, width, num_samples)?;
        if bus.channel_count() != declared as usize {
            return Err(BridgeError::Corrupt(format!(
                "result bus has {} channels, request declared {}",
                bus.channel_count(),
                declared
            )));
        }
    }
    if let Some(events) = &result.events {
        if events.len() > MAX_EVENTS {
            return Err(BridgeError::LimitExceeded {
                what: "events per block",
                len: events.len(),
                max: MAX_EVENTS,
            });
        }
    }
    Ok(())
}

/// Encode one bus with its samples inline. Used for state snapshots and
/// tests; the live audio path stages samples through shared memory instead.
pub fn encode_bus(bus: &AudioBusBuffer) -> Result<Vec<u8>> {
    if bus.channel_count() > MAX_CHANNELS {
        return Err(BridgeError::LimitExceeded {
            what: "channels per bus",
            len: bus.channel_count(),
            max: MAX_CHANNELS,
        });
    }
    validate_bus(bus, bus.width(), bus.sample_count())?;
    Ok(bincode::serialize(bus)?)
}

pub fn decode_bus(bytes: &[u8]) -> Result<AudioBusBuffer> {
    let bus: AudioBusBuffer = bincode::deserialize(bytes)?;
    // All channels of a bus must share one length.
    validate_bus(&bus, bus.width(), bus.sample_count())?;
    if bus.channel_count() > MAX_CHANNELS {
        return Err(BridgeError::Corrupt(format!(
            "decoded bus has {} channels, limit is {}",
            bus.channel_count(),
            MAX_CHANNELS
        )));
    }
    Ok(bus)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{EventBatch, ParameterChanges, ProcessMode};

    fn block_with(inputs: Vec<AudioBusBuffer>, num_samples: u32) -> ProcessBlock {
        ProcessBlock {
            mode: ProcessMode::Realtime,
            width: SampleWidth::F32,
            num_samples,
            inputs,
            output_channel_counts: vec![2],
            parameter_changes: ParameterChanges::default(),
            events: None,
            context: None,
        }
    }

    #[test]
    fn test_bus_roundtrip_is_lossless() {
        let bus = AudioBusBuffer::from_f32(
            vec![vec![0.25, -0.5, 1.0, f32::MIN_POSITIVE], vec![0.0; 4]],
            0b10,
        );
        let decoded = decode_bus(&encode_bus(&bus).unwrap()).unwrap();
        assert_eq!(decoded, bus);

        let wide = AudioBusBuffer::from_f64(vec![vec![f64::EPSILON, -1.0, 0.125]], 0);
        let decoded = decode_bus(&encode_bus(&wide).unwrap()).unwrap();
        assert_eq!(decoded, wide);
    }

    #[test]
    fn test_empty_shapes_roundtrip() {
        // Deactivated buses travel with zero channels.
        let empty_f32 = AudioBusBuffer::from_f32(vec![], 0);
        assert_eq!(
            decode_bus(&encode_bus(&empty_f32).unwrap()).unwrap(),
            empty_f32
        );
        let empty_f64 = AudioBusBuffer::from_f64(vec![], 0);
        assert_eq!(
            decode_bus(&encode_bus(&empty_f64).unwrap()).unwrap(),
            empty_f64
        );

        // A zero-sample flush cycle keeps its channel shape.
        let flush_f32 = AudioBusBuffer::from_f32(vec![vec![], vec![]], 0b11);
        assert_eq!(
            decode_bus(&encode_bus(&flush_f32).unwrap()).unwrap(),
            flush_f32
        );
        let flush_f64 = AudioBusBuffer::from_f64(vec![vec![]], 0b1);
        assert_eq!(
            decode_bus(&encode_bus(&flush_f64).unwrap()).unwrap(),
            flush_f64
        );
    }

    #[test]
    fn test_channel_limit_rejected_before_encode() {
        let bus = AudioBusBuffer::zeroed(SampleWidth::F32, MAX_CHANNELS + 1, 4);
        let err = encode_bus(&bus).unwrap_err();
        assert!(matches!(
            err,
            BridgeError::LimitExceeded {
                what: "channels per bus",
                len,
                max: MAX_CHANNELS,
            } if len == MAX_CHANNELS + 1
        ));
    }

    #[test]
    fn test_block_limits() {
        let ok = block_with(vec![AudioBusBuffer::zeroed(SampleWidth::F32, 2, 64)], 64);
        validate_block(&ok).unwrap();

        let too_many_buses = block_with(
            vec![AudioBusBuffer::zeroed(SampleWidth::F32, 1, 4); MAX_BUSES + 1],
            4,
        );
        assert!(matches!(
            validate_block(&too_many_buses).unwrap_err(),
            BridgeError::LimitExceeded {
                what: "input buses",
                ..
            }
        ));

        let mut too_long = block_with(vec![], (MAX_BLOCK_SAMPLES + 1) as u32);
        too_long.inputs.clear();
        assert!(matches!(
            validate_block(&too_long).unwrap_err(),
            BridgeError::LimitExceeded {
                what: "block samples",
                ..
            }
        ));
    }

    #[test]
    fn test_ragged_channels_are_corrupt() {
        let bus = AudioBusBuffer::from_f32(vec![vec![0.0; 64], vec![0.0; 63]], 0);
        let block = block_with(vec![bus], 64);
        assert!(matches!(
            validate_block(&block).unwrap_err(),
            BridgeError::Corrupt(_)
        ));
    }

    #[test]
    fn test_width_mismatch_is_corrupt() {
        let mut block = block_with(vec![AudioBusBuffer::zeroed(SampleWidth::F64, 2, 64)], 64);
        block.width = SampleWidth::F32;
        assert!(matches!(
            validate_block(&block).unwrap_err(),
            BridgeError::Corrupt(_)
        ));
    }

    #[test]
    fn test_event_limit() {
        use crate::protocol::{Event, EventPayload};
        let mut batch = EventBatch::default();
        for i in 0..(MAX_EVENTS + 1) {
            batch.events.push(Event {
                bus_index: 0,
                sample_offset: i as i32,
                flags: 0,
                payload: EventPayload::Midi { data: [0x90, 60, 100] },
            });
        }
        let mut block = block_with(vec![], 64);
        block.events = Some(batch);
        assert!(matches!(
            validate_block(&block).unwrap_err(),
            BridgeError::LimitExceeded {
                what: "events per block",
                ..
            }
        ));
    }

    #[test]
    fn test_result_shape_must_match_request() {
        let result = ProcessResult {
            outputs: vec![AudioBusBuffer::zeroed(SampleWidth::F32, 2, 64)],
            parameter_changes: None,
            events: None,
        };
        validate_result(&result, SampleWidth::F32, 64, &[2]).unwrap();

        assert!(matches!(
            validate_result(&result, SampleWidth::F32, 64, &[2, 2]).unwrap_err(),
            BridgeError::Corrupt(_)
        ));
        assert!(matches!(
            validate_result(&result, SampleWidth::F32, 64, &[1]).unwrap_err(),
            BridgeError::Corrupt(_)
        ));
    }

    #[test]
    fn test_truncated_frame_is_corrupt() {
        let bus = AudioBusBuffer::zeroed(SampleWidth::F32, 1, 16);
        let mut bytes = encode_bus(&bus).unwrap();
        bytes.truncate(bytes.len() - 3);
        assert!(matches!(
            decode_bus(&bytes).unwrap_err(),
            BridgeError::Corrupt(_)
        ));
    }
}
