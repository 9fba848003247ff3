//! A software stand-in for the V1742 digitizer on the `EMULATED` link.
//!
//! Events accumulate at the configured mean rate while acquisition runs and
//! are handed out in block transfers of at most `max_num_events_blt` events,
//! using the same readout layout the board driver parses:
//!
//! ```text
//! w0..w5   event size in bytes, board id, pattern, group mask, counter, TTT
//! per group in the mask
//!   w0     group trigger time tag
//!   w1     start index cell << 16 | samples per channel (n)
//!   ...    8 x n u16 samples, channel-major
//! ```

use crate::{
    AcqStatus, BoardConfig, BoardInfo, ConnectMode, DecodedEvent, Digitizer, DgtzError,
    EventInfo, GroupData, GroupStatus, LinkConfig, SamplingFrequency, Setting,
    CHANNELS_PER_GROUP, MAX_GROUPS,
};
use log::debug;
use ndarray::Array2;
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::time::Instant;

const INFO_WORDS: usize = 6;
/// Events the board memory holds before the groups report full.
pub const MEMORY_EVENTS: u32 = 128;
const BASELINE: f32 = 3600.0;
const DRS4_CELLS: u16 = 1024;

pub struct Emulator {
    rng: StdRng,
    board_id: u32,
    rate: f64,
    connected: bool,
    running: bool,
    record_length: usize,
    group_mask: u8,
    max_blt: u32,
    sampling: SamplingFrequency,
    event_counter: u32,
    trigger_time_tag: u32,
    stored: u32,
    owed: f64,
    last_poll: Instant,
    readout: ReadoutIndex,
}

impl Emulator {
    pub fn new(board: &BoardConfig, seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            board_id: board.board_id,
            rate: board.emulator_rate,
            connected: false,
            running: false,
            record_length: board.record_length as usize,
            group_mask: board.group_enable_mask,
            max_blt: board.max_num_events_blt.max(1),
            sampling: board.sampling,
            event_counter: 0,
            trigger_time_tag: 0,
            stored: 0,
            owed: 0.0,
            last_poll: Instant::now(),
            readout: ReadoutIndex::default(),
        }
    }

    fn ensure_open(&self) -> Result<(), DgtzError> {
        if self.connected {
            Ok(())
        } else {
            Err(DgtzError::InvalidHandle)
        }
    }

    /// Move triggers that happened since the last poll into board memory.
    fn accumulate(&mut self) {
        let now = Instant::now();
        if self.running {
            self.owed += now.duration_since(self.last_poll).as_secs_f64() * self.rate;
            let new = self.owed.floor();
            self.owed -= new;
            self.stored = (self.stored as f64 + new).min(MEMORY_EVENTS as f64) as u32;
        }
        self.last_poll = now;
    }

    /// Trigger time tag counts in 8.5 ns units regardless of sampling.
    fn ttt_step(&mut self) -> u32 {
        let mean_ticks = if self.rate > 0.0 {
            (1.0 / self.rate / 8.5e-9).min(u32::MAX as f64) as u32
        } else {
            0
        };
        mean_ticks.saturating_add(self.rng.random_range(0..64))
    }

    fn make_event(&mut self) -> DecodedEvent {
        self.event_counter = self.event_counter.wrapping_add(1) & 0x3F_FFFF;
        self.trigger_time_tag = self.trigger_time_tag.wrapping_add(self.ttt_step()) & 0x3FFF_FFFF;

        let n = self.record_length;
        let pulse_width = match self.sampling {
            SamplingFrequency::GHz5 => 40,
            SamplingFrequency::GHz2_5 => 20,
            SamplingFrequency::GHz1 => 8,
        };
        let mut event = DecodedEvent::default();
        for g in 0..MAX_GROUPS {
            if self.group_mask & (1 << g) == 0 {
                continue;
            }
            let start_index_cell = self.rng.random_range(0..DRS4_CELLS);
            let mut samples = Array2::<f32>::zeros((CHANNELS_PER_GROUP, n));
            for mut channel in samples.rows_mut() {
                let amplitude: f32 = self.rng.random_range(50.0..1500.0);
                let peak = self.rng.random_range(0..n.max(1));
                for (i, s) in channel.iter_mut().enumerate() {
                    let noise: f32 = self.rng.random_range(-4.0..4.0);
                    let pulse = if i >= peak && i < peak + pulse_width {
                        amplitude
                    } else {
                        0.0
                    };
                    // negative pulses on a high baseline
                    *s = (BASELINE - pulse + noise).round();
                }
            }
            event.groups[g] = Some(GroupData {
                trigger_time_tag: self.trigger_time_tag,
                start_index_cell,
                samples,
            });
        }
        event
    }
}

impl Digitizer for Emulator {
    fn connect(&mut self, link: &LinkConfig) -> Result<BoardInfo, DgtzError> {
        if link.mode != ConnectMode::Emulated {
            return Err(DgtzError::InvalidLinkType);
        }
        if self.connected {
            return Err(DgtzError::DigitizerAlreadyOpen);
        }
        self.connected = true;
        Ok(BoardInfo {
            model_name: "V1742".into(),
            model: 1742,
            family_code: 6,
            channels: 32,
            adc_bits: 12,
            serial_number: 0xE000 | (link.link & 0xF) << 8 | (link.slot & 0xFF),
            roc_firmware: "04.19 - Build 1A17 (emulated)".into(),
            amc_firmware: "01.07 - Build 1919 (emulated)".into(),
            pcb_revision: 4,
        })
    }

    fn apply(&mut self, setting: &Setting) -> Result<(), DgtzError> {
        self.ensure_open()?;
        match *setting {
            Setting::Reset => {
                self.running = false;
                self.stored = 0;
                self.owed = 0.0;
            }
            Setting::SamplingFrequency(f) | Setting::LoadDrs4Correction(f) => self.sampling = f,
            Setting::RecordLength(n) => self.record_length = n as usize,
            Setting::GroupEnableMask(mask) => {
                if mask == 0 || mask >> MAX_GROUPS != 0 {
                    return Err(DgtzError::InvalidParam);
                }
                self.group_mask = mask;
            }
            Setting::ChannelDcOffset { channel, .. } => {
                if channel as usize >= CHANNELS_PER_GROUP * MAX_GROUPS {
                    return Err(DgtzError::InvalidChannelNumber);
                }
            }
            Setting::MaxNumEventsBlt(n) => self.max_blt = n.max(1),
            _ => (),
        }
        debug!("Emulator applied {setting:?}");
        Ok(())
    }

    fn acquisition_status(&mut self) -> Result<AcqStatus, DgtzError> {
        self.ensure_open()?;
        self.accumulate();
        let mut status = 0;
        if self.running {
            status |= AcqStatus::RUNNING;
        }
        if self.stored > 0 {
            status |= AcqStatus::EVENT_READY;
        }
        Ok(AcqStatus(status))
    }

    fn group_status(&mut self, group: usize) -> Result<GroupStatus, DgtzError> {
        self.ensure_open()?;
        if group >= MAX_GROUPS {
            return Err(DgtzError::InvalidParam);
        }
        Ok(GroupStatus(if self.stored >= MEMORY_EVENTS {
            GroupStatus::MEMORY_FULL
        } else {
            0
        }))
    }

    fn read_data(&mut self, buffer: &mut Vec<u8>) -> Result<(), DgtzError> {
        self.ensure_open()?;
        self.readout.invalidate();
        buffer.clear();
        let n = self.stored.min(self.max_blt);
        for _ in 0..n {
            let event = self.make_event();
            let info = EventInfo {
                board_id: self.board_id,
                pattern: 0,
                event_counter: self.event_counter,
                trigger_time_tag: self.trigger_time_tag,
                ..Default::default()
            };
            pack_event(&info, &event, buffer);
        }
        self.stored -= n;
        Ok(())
    }

    fn num_events(&mut self, buffer: &[u8]) -> Result<u32, DgtzError> {
        self.readout.count(buffer)
    }

    fn event_info<'b>(
        &mut self,
        buffer: &'b [u8],
        index: u32,
    ) -> Result<(EventInfo, &'b [u8]), DgtzError> {
        self.readout.locate(buffer, index)
    }

    fn decode_event(&mut self, raw: &[u8], event: &mut DecodedEvent) -> Result<(), DgtzError> {
        decode_raw(raw, event)
    }

    fn start(&mut self) -> Result<(), DgtzError> {
        self.ensure_open()?;
        if self.running {
            return Err(DgtzError::FunctionNotAllowed);
        }
        self.running = true;
        self.owed = 0.0;
        self.last_poll = Instant::now();
        Ok(())
    }

    fn stop(&mut self) -> Result<(), DgtzError> {
        self.ensure_open()?;
        self.running = false;
        Ok(())
    }

    fn close(&mut self) -> Result<(), DgtzError> {
        self.ensure_open()?;
        self.running = false;
        self.connected = false;
        Ok(())
    }
}

fn word(bytes: &[u8], i: usize) -> Option<u32> {
    bytes
        .get(i * 4..i * 4 + 4)
        .map(|w| u32::from_le_bytes([w[0], w[1], w[2], w[3]]))
}

/// Append one event in readout layout. `info.event_size` and
/// `info.channel_mask` are derived from `event`.
pub(crate) fn pack_event(info: &EventInfo, event: &DecodedEvent, buffer: &mut Vec<u8>) {
    let start = buffer.len();
    let header = [
        0,
        info.board_id,
        info.pattern,
        u32::from(event.group_mask()),
        info.event_counter,
        info.trigger_time_tag,
    ];
    for w in header {
        buffer.extend_from_slice(&w.to_le_bytes());
    }
    for group in event.groups.iter().flatten() {
        let n = group.samples.ncols() as u32;
        buffer.extend_from_slice(&group.trigger_time_tag.to_le_bytes());
        buffer.extend_from_slice(&(u32::from(group.start_index_cell) << 16 | n).to_le_bytes());
        for &s in group.samples.iter() {
            buffer.extend_from_slice(&(s.clamp(0.0, u16::MAX as f32) as u16).to_le_bytes());
        }
    }
    let size = (buffer.len() - start) as u32;
    buffer[start..start + 4].copy_from_slice(&size.to_le_bytes());
}

/// Event offsets of the current readout buffer.
///
/// `count` indexes the buffer once per readout and `locate` reuses that
/// index, so walking a readout stays linear in its event count.
#[derive(Debug, Default)]
pub(crate) struct ReadoutIndex {
    /// Address and length of the indexed buffer.
    key: Option<(usize, usize)>,
    spans: Vec<(usize, usize)>,
}

fn buffer_key(buffer: &[u8]) -> (usize, usize) {
    (buffer.as_ptr() as usize, buffer.len())
}

impl ReadoutIndex {
    /// Forget the index, the buffer is about to be refilled.
    pub(crate) fn invalidate(&mut self) {
        self.key = None;
        self.spans.clear();
    }

    fn rebuild(&mut self, buffer: &[u8]) -> Result<(), DgtzError> {
        self.invalidate();
        let mut offset = 0;
        while offset < buffer.len() {
            let size = word(&buffer[offset..], 0).ok_or(DgtzError::InvalidBuffer)? as usize;
            if size < INFO_WORDS * 4 || offset + size > buffer.len() {
                self.spans.clear();
                return Err(DgtzError::InvalidBuffer);
            }
            self.spans.push((offset, offset + size));
            offset += size;
        }
        self.key = Some(buffer_key(buffer));
        Ok(())
    }

    pub(crate) fn count(&mut self, buffer: &[u8]) -> Result<u32, DgtzError> {
        self.rebuild(buffer)?;
        Ok(self.spans.len() as u32)
    }

    pub(crate) fn locate<'b>(
        &mut self,
        buffer: &'b [u8],
        index: u32,
    ) -> Result<(EventInfo, &'b [u8]), DgtzError> {
        if self.key != Some(buffer_key(buffer)) {
            self.rebuild(buffer)?;
        }
        let (start, end) = *self
            .spans
            .get(index as usize)
            .ok_or(DgtzError::BadEventNumber)?;
        let raw = &buffer[start..end];
        let w = |i| word(raw, i).ok_or(DgtzError::InvalidEvent);
        let info = EventInfo {
            event_size: w(0)?,
            board_id: w(1)?,
            pattern: w(2)?,
            channel_mask: w(3)?,
            event_counter: w(4)?,
            trigger_time_tag: w(5)?,
        };
        Ok((info, raw))
    }
}

pub(crate) fn decode_raw(raw: &[u8], event: &mut DecodedEvent) -> Result<(), DgtzError> {
    event.clear();
    let mask = word(raw, 3).ok_or(DgtzError::InvalidEvent)?;
    let mut offset = INFO_WORDS * 4;
    for g in 0..MAX_GROUPS {
        if mask & (1 << g) == 0 {
            continue;
        }
        let at = &raw[offset.min(raw.len())..];
        let ttt = word(at, 0).ok_or(DgtzError::InvalidEvent)?;
        let desc = word(at, 1).ok_or(DgtzError::InvalidEvent)?;
        let n = (desc & 0xFFFF) as usize;
        let body = at
            .get(8..8 + CHANNELS_PER_GROUP * n * 2)
            .ok_or(DgtzError::InvalidEvent)?;
        let samples = body
            .chunks_exact(2)
            .map(|b| f32::from(u16::from_le_bytes([b[0], b[1]])))
            .collect::<Vec<_>>();
        let samples = Array2::from_shape_vec((CHANNELS_PER_GROUP, n), samples)
            .map_err(|_| DgtzError::InvalidEvent)?;
        event.groups[g] = Some(GroupData {
            trigger_time_tag: ttt,
            start_index_cell: (desc >> 16) as u16,
            samples,
        });
        offset += 8 + body.len();
    }
    Ok(())
}
