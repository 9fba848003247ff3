//! Test doubles for the digitizer and the run control markers.

use crate::{
    emulator::{decode_raw, pack_event, ReadoutIndex},
    encoder::{EventEncoder, RawEncoder},
    signals::Coordination,
    AcqStatus, BoardInfo, DaqError, DecodedEvent, Digitizer, DgtzError, EventInfo, GroupData,
    GroupStatus, LinkConfig, MarkerFiles, Setting, CHANNELS_PER_GROUP, MAX_GROUPS,
};
use ndarray::Array2;
use std::{
    cell::Cell,
    collections::{HashSet, VecDeque},
    path::{Path, PathBuf},
};

/// Samples per channel in scripted events.
pub const SCRIPTED_SAMPLES: usize = 4;

/// A digitizer that hands out pre-arranged readouts.
///
/// Each batch is one readout; each entry of a batch is the group mask of one
/// event.
#[derive(Default)]
pub struct ScriptedDigitizer {
    pub batches: VecDeque<Vec<u8>>,
    pub fail_connect: Option<DgtzError>,
    /// Index of the setting to reject.
    pub fail_setting: Option<(usize, DgtzError)>,
    /// 1-based number of the read call to fail.
    pub fail_read_on: Option<(usize, DgtzError)>,
    /// 1-based number of the acquisition status poll to fail.
    pub fail_status_on: Option<(usize, DgtzError)>,
    /// 1-based number of the group status poll to fail.
    pub fail_group_status_on: Option<(usize, DgtzError)>,
    pub fail_stop: Option<DgtzError>,
    pub buffer_full: bool,

    pub applied: Vec<Setting>,
    pub starts: usize,
    pub stops: usize,
    pub reads: usize,
    pub status_polls: usize,
    pub group_polls: usize,
    pub closes: usize,
    counter: u32,
    readout: ReadoutIndex,
}

impl ScriptedDigitizer {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn with_batches(batches: impl IntoIterator<Item = Vec<u8>>) -> Self {
        Self {
            batches: batches.into_iter().collect(),
            ..Default::default()
        }
    }

    fn read_pending(&self) -> bool {
        !self.batches.is_empty()
            || self
                .fail_read_on
                .is_some_and(|(n, _)| n == self.reads + 1)
    }
}

/// `count` events all carrying the same group mask.
pub fn events(count: usize, mask: u8) -> Vec<u8> {
    vec![mask; count]
}

impl Digitizer for ScriptedDigitizer {
    fn connect(&mut self, _link: &LinkConfig) -> Result<BoardInfo, DgtzError> {
        match self.fail_connect {
            Some(code) => Err(code),
            None => Ok(BoardInfo {
                model_name: "V1742".into(),
                serial_number: 404,
                channels: 32,
                adc_bits: 12,
                ..Default::default()
            }),
        }
    }

    fn apply(&mut self, setting: &Setting) -> Result<(), DgtzError> {
        if let Some((index, code)) = self.fail_setting {
            if index == self.applied.len() {
                return Err(code);
            }
        }
        self.applied.push(*setting);
        Ok(())
    }

    fn acquisition_status(&mut self) -> Result<AcqStatus, DgtzError> {
        self.status_polls += 1;
        if let Some((n, code)) = self.fail_status_on {
            if n == self.status_polls {
                return Err(code);
            }
        }
        let mut status = AcqStatus::RUNNING;
        if self.read_pending() {
            status |= AcqStatus::EVENT_READY;
        }
        Ok(AcqStatus(status))
    }

    fn group_status(&mut self, _group: usize) -> Result<GroupStatus, DgtzError> {
        self.group_polls += 1;
        if let Some((n, code)) = self.fail_group_status_on {
            if n == self.group_polls {
                return Err(code);
            }
        }
        Ok(GroupStatus(if self.buffer_full {
            GroupStatus::MEMORY_FULL
        } else {
            0
        }))
    }

    fn read_data(&mut self, buffer: &mut Vec<u8>) -> Result<(), DgtzError> {
        self.reads += 1;
        if let Some((n, code)) = self.fail_read_on {
            if n == self.reads {
                return Err(code);
            }
        }
        self.readout.invalidate();
        buffer.clear();
        for mask in self.batches.pop_front().unwrap_or_default() {
            self.counter += 1;
            let mut event = DecodedEvent::default();
            for g in (0..MAX_GROUPS).filter(|g| mask & (1 << g) != 0) {
                event.groups[g] = Some(GroupData {
                    trigger_time_tag: self.counter * 10,
                    start_index_cell: g as u16,
                    samples: Array2::from_elem(
                        (CHANNELS_PER_GROUP, SCRIPTED_SAMPLES),
                        self.counter as f32,
                    ),
                });
            }
            let info = EventInfo {
                event_counter: self.counter,
                trigger_time_tag: self.counter * 10,
                ..Default::default()
            };
            pack_event(&info, &event, buffer);
        }
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
        self.starts += 1;
        Ok(())
    }

    fn stop(&mut self) -> Result<(), DgtzError> {
        self.stops += 1;
        match self.fail_stop {
            Some(code) => Err(code),
            None => Ok(()),
        }
    }

    fn close(&mut self) -> Result<(), DgtzError> {
        self.closes += 1;
        Ok(())
    }
}

/// Packs events like `RawEncoder` but rejects the event with counter
/// `fail_on`.
pub struct FailingEncoder {
    inner: RawEncoder,
    fail_on: u32,
}

impl FailingEncoder {
    pub fn new(inner: RawEncoder, fail_on: u32) -> Self {
        Self { inner, fail_on }
    }
}

impl EventEncoder for FailingEncoder {
    fn encode(
        &mut self,
        info: &EventInfo,
        event: &DecodedEvent,
        out: &mut Vec<u8>,
    ) -> Result<usize, DaqError> {
        if info.event_counter == self.fail_on {
            return Err(DaqError::Encoding {
                event_counter: info.event_counter,
                reason: "rejected by test encoder".into(),
            });
        }
        self.inner.encode(info, event, out)
    }
}

/// Markers kept in memory. The quit marker can be made to appear after a
/// number of checks.
pub struct MemorySignals {
    pub files: HashSet<PathBuf>,
    quit_file: PathBuf,
    quit_after: Option<usize>,
    quit_checks: Cell<usize>,
}

impl MemorySignals {
    pub fn new(markers: &MarkerFiles) -> Self {
        Self {
            files: HashSet::new(),
            quit_file: markers.quit_file.clone(),
            quit_after: None,
            quit_checks: Cell::new(0),
        }
    }

    /// Start marker present from the beginning.
    pub fn started(markers: &MarkerFiles) -> Self {
        let mut signals = Self::new(markers);
        signals.files.insert(markers.start_file.clone());
        signals
    }

    /// The first `checks` quit checks see no marker, every later one does.
    pub fn quit_after(mut self, checks: usize) -> Self {
        self.quit_after = Some(checks);
        self
    }

    pub fn has(&self, path: &Path) -> bool {
        self.files.contains(path)
    }

    pub fn quit_checks(&self) -> usize {
        self.quit_checks.get()
    }
}

impl Coordination for MemorySignals {
    fn exists(&self, path: &Path) -> bool {
        if path == self.quit_file {
            let checks = self.quit_checks.get() + 1;
            self.quit_checks.set(checks);
            if self.quit_after.is_some_and(|n| checks > n) {
                return true;
            }
        }
        self.has(path)
    }

    fn create_marker(&mut self, path: &Path) -> Result<(), DaqError> {
        self.files.insert(path.to_path_buf());
        Ok(())
    }
}
