//! Turning decoded events into output payloads.
//!
//! ```text
//! w0        0xE << 28 | event size in words
//! w1        board id << 27 | pattern << 8 | group mask
//! w2        event counter
//! w3        event trigger time tag
//! per group (ascending group number, only groups in the mask)
//!   g0      start index cell << 16 | samples per channel (n)
//!   g1      group trigger time tag
//!   ...     8 channels x n samples, channel-major, two 12 bit samples per word
//! ```

use crate::{
    frame::FrameError, DaqError, DecodedEvent, EventInfo, RunContext, CHANNELS_PER_GROUP,
    MAX_GROUPS,
};

pub const EVENT_TAG: u32 = 0xE;
pub const EVENT_HEADER_WORDS: usize = 4;
pub const GROUP_HEADER_WORDS: usize = 2;
/// Largest value a sample can take on a 12 bit ADC.
pub const SAMPLE_MAX: f32 = 4095.0;

/// Encodes one decoded event into `out`.
///
/// Returns the payload length in bytes, or `Ok(0)` when the event is rejected
/// and must not be written.
pub trait EventEncoder {
    fn encode(
        &mut self,
        info: &EventInfo,
        event: &DecodedEvent,
        out: &mut Vec<u8>,
    ) -> Result<usize, DaqError>;
}

/// Keeps every sample of every enabled group.
#[derive(Clone, Debug)]
pub struct RawEncoder {
    board_id: u32,
    group_enable_mask: u8,
}

impl RawEncoder {
    pub fn new(ctx: &RunContext) -> Self {
        Self {
            board_id: ctx.board.board_id,
            group_enable_mask: ctx.board.group_enable_mask,
        }
    }
}

impl EventEncoder for RawEncoder {
    fn encode(
        &mut self,
        info: &EventInfo,
        event: &DecodedEvent,
        out: &mut Vec<u8>,
    ) -> Result<usize, DaqError> {
        out.clear();
        let accepted = event.group_mask() & self.group_enable_mask;
        if accepted == 0 {
            return Ok(0);
        }
        let encoding = |reason: String| DaqError::Encoding {
            event_counter: info.event_counter,
            reason,
        };

        push(out, 0); // size, patched below
        push(
            out,
            (self.board_id & 0x1F) << 27 | (info.pattern & 0x3FFF) << 8 | u32::from(accepted),
        );
        push(out, info.event_counter & 0x3F_FFFF);
        push(out, info.trigger_time_tag);

        for (g, group) in event.groups.iter().enumerate() {
            let Some(group) = group.as_ref().filter(|_| accepted & (1 << g) != 0) else {
                continue;
            };
            let (channels, n) = group.samples.dim();
            if channels != CHANNELS_PER_GROUP {
                return Err(encoding(format!(
                    "group {g} has {channels} channels, expected {CHANNELS_PER_GROUP}"
                )));
            }
            if n > 0xFFFF {
                return Err(encoding(format!("group {g} has {n} samples per channel")));
            }
            push(
                out,
                u32::from(group.start_index_cell & 0x3FF) << 16 | n as u32,
            );
            push(out, group.trigger_time_tag);
            for &sample in group.samples.iter() {
                if !sample.is_finite() {
                    return Err(encoding(format!("group {g} holds a {sample} sample")));
                }
                let adc = sample.round().clamp(0.0, SAMPLE_MAX) as u16;
                out.extend_from_slice(&adc.to_le_bytes());
            }
        }

        let words = out.len() / 4;
        let w0 = EVENT_TAG << 28 | (words as u32 & 0x0FFF_FFFF);
        out[..4].copy_from_slice(&w0.to_le_bytes());
        Ok(out.len())
    }
}

fn push(out: &mut Vec<u8>, word: u32) {
    out.extend_from_slice(&word.to_le_bytes());
}

/// Split the payload region of an output unit into single events using the
/// size word of each event.
pub fn payloads(mut bytes: &[u8]) -> Result<Vec<&[u8]>, FrameError> {
    let mut events = Vec::new();
    while !bytes.is_empty() {
        if bytes.len() < EVENT_HEADER_WORDS * 4 {
            return Err(FrameError::Truncated(bytes.len()));
        }
        let w0 = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        if w0 >> 28 != EVENT_TAG {
            return Err(FrameError::BadTag {
                frame: "event",
                tag: w0 >> 28,
            });
        }
        let len = (w0 & 0x0FFF_FFFF) as usize * 4;
        if len < EVENT_HEADER_WORDS * 4 || len > bytes.len() {
            return Err(FrameError::Truncated(bytes.len()));
        }
        let (event, rest) = bytes.split_at(len);
        events.push(event);
        bytes = rest;
    }
    Ok(events)
}

/// Group mask stored in an encoded event.
pub fn payload_group_mask(payload: &[u8]) -> Option<u8> {
    payload
        .get(4..8)
        .map(|w| (u32::from_le_bytes([w[0], w[1], w[2], w[3]]) & 0xFF) as u8)
        .filter(|mask| mask >> MAX_GROUPS == 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Conf, GroupData};
    use confique::Config;
    use ndarray::Array2;

    fn encoder(mask: u8) -> RawEncoder {
        let mut conf = Conf::builder().load().unwrap();
        conf.board.board_id = 3;
        conf.board.group_enable_mask = mask;
        RawEncoder::new(&RunContext::from_conf(&conf).unwrap())
    }

    fn group(n: usize, fill: f32) -> Option<GroupData> {
        Some(GroupData {
            trigger_time_tag: 0xABCD,
            start_index_cell: 517,
            samples: Array2::from_elem((CHANNELS_PER_GROUP, n), fill),
        })
    }

    fn info() -> EventInfo {
        EventInfo {
            event_counter: 41,
            pattern: 0x12,
            trigger_time_tag: 99,
            ..Default::default()
        }
    }

    fn word(bytes: &[u8], i: usize) -> u32 {
        u32::from_le_bytes(bytes[i * 4..i * 4 + 4].try_into().unwrap())
    }

    #[test]
    fn packs_enabled_groups_only() {
        let mut event = DecodedEvent::default();
        event.groups[0] = group(4, 1000.4);
        event.groups[2] = group(4, 5000.0);

        let mut out = Vec::new();
        let len = encoder(0b0001).encode(&info(), &event, &mut out).unwrap();

        // header + one group header + 8 x 4 samples of 2 bytes
        assert_eq!(len, 16 + 8 + 64);
        assert_eq!(len, out.len());
        assert_eq!(word(&out, 0), 0xE << 28 | (len / 4) as u32);
        assert_eq!(word(&out, 1), 3 << 27 | 0x12 << 8 | 0b0001);
        assert_eq!(word(&out, 2), 41);
        assert_eq!(word(&out, 3), 99);
        assert_eq!(word(&out, 4), 517 << 16 | 4);
        assert_eq!(word(&out, 5), 0xABCD);
        assert_eq!(u16::from_le_bytes([out[24], out[25]]), 1000);
        assert_eq!(payload_group_mask(&out), Some(0b0001));
    }

    #[test]
    fn samples_are_clamped_to_twelve_bits() {
        let mut event = DecodedEvent::default();
        event.groups[1] = group(2, 9000.0);
        let mut out = Vec::new();
        encoder(0b1111).encode(&info(), &event, &mut out).unwrap();
        assert_eq!(u16::from_le_bytes([out[24], out[25]]), 4095);

        event.groups[1] = group(2, -3.0);
        encoder(0b1111).encode(&info(), &event, &mut out).unwrap();
        assert_eq!(u16::from_le_bytes([out[24], out[25]]), 0);
    }

    #[test]
    fn events_without_enabled_groups_are_rejected() {
        let mut event = DecodedEvent::default();
        event.groups[3] = group(4, 1.0);
        let mut out = vec![0xFF; 8];
        assert_eq!(encoder(0b0011).encode(&info(), &event, &mut out).unwrap(), 0);
        assert!(out.is_empty());
    }

    #[test]
    fn non_finite_samples_fail_encoding() {
        for bad in [f32::NAN, f32::INFINITY, f32::NEG_INFINITY] {
            let mut event = DecodedEvent::default();
            event.groups[0] = group(4, bad);
            let mut out = Vec::new();
            assert!(
                matches!(
                    encoder(0b0001).encode(&info(), &event, &mut out),
                    Err(DaqError::Encoding {
                        event_counter: 41,
                        ..
                    })
                ),
                "{bad} was encoded"
            );
        }
    }

    #[test]
    fn payload_region_splits_back_into_events() {
        let mut enc = encoder(0b1111);
        let mut region = Vec::new();
        let mut out = Vec::new();
        for n in [2, 6, 4] {
            let mut event = DecodedEvent::default();
            event.groups[0] = group(n, 7.0);
            event.groups[3] = group(n, 8.0);
            enc.encode(&info(), &event, &mut out).unwrap();
            region.extend_from_slice(&out);
        }
        let events = payloads(&region).unwrap();
        assert_eq!(events.len(), 3);
        assert_eq!(events[1].len(), 16 + 2 * (8 + 8 * 6 * 2));
        assert!(events.iter().all(|e| payload_group_mask(e) == Some(0b1001)));

        region.truncate(region.len() - 2);
        assert!(payloads(&region).is_err());
    }
}
