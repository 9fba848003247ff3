//! The digitizer as the acquisition loop sees it.
//!
//! Register addresses and bit layouts stay behind [`Digitizer`]; the loop only
//! deals with the typed status words, event metadata and decoded events below.

use crate::{ConnectMode, StartMode};
use log::info;
use ndarray::Array2;
use std::fmt;

/// Number of channel groups on the board.
pub const MAX_GROUPS: usize = 4;
/// Channels sharing one group enable bit.
pub const CHANNELS_PER_GROUP: usize = 8;
/// Total channel count (groups x channels per group).
pub const MAX_CHANNELS: usize = MAX_GROUPS * CHANNELS_PER_GROUP;

/// Status codes returned by the digitizer driver.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum DgtzError {
    CommError,
    GenericError,
    InvalidParam,
    InvalidLinkType,
    InvalidHandle,
    MaxDevicesError,
    BadBoardType,
    BadEventNumber,
    ReadDeviceRegisterFail,
    WriteDeviceRegisterFail,
    InvalidChannelNumber,
    ChannelBusy,
    WrongAcqMode,
    FunctionNotAllowed,
    Timeout,
    InvalidBuffer,
    EventNotFound,
    InvalidEvent,
    OutOfMemory,
    CalibrationError,
    DigitizerNotFound,
    DigitizerAlreadyOpen,
    DigitizerNotReady,
    NotYetImplemented,
    Unknown(i32),
}

impl From<i32> for DgtzError {
    fn from(value: i32) -> Self {
        match value {
            -1 => Self::CommError,
            -2 => Self::GenericError,
            -3 => Self::InvalidParam,
            -4 => Self::InvalidLinkType,
            -5 => Self::InvalidHandle,
            -6 => Self::MaxDevicesError,
            -7 => Self::BadBoardType,
            -9 => Self::BadEventNumber,
            -10 => Self::ReadDeviceRegisterFail,
            -11 => Self::WriteDeviceRegisterFail,
            -13 => Self::InvalidChannelNumber,
            -14 => Self::ChannelBusy,
            -16 => Self::WrongAcqMode,
            -17 => Self::FunctionNotAllowed,
            -18 => Self::Timeout,
            -19 => Self::InvalidBuffer,
            -20 => Self::EventNotFound,
            -21 => Self::InvalidEvent,
            -22 => Self::OutOfMemory,
            -23 => Self::CalibrationError,
            -24 => Self::DigitizerNotFound,
            -25 => Self::DigitizerAlreadyOpen,
            -26 => Self::DigitizerNotReady,
            -99 => Self::NotYetImplemented,
            other => Self::Unknown(other),
        }
    }
}

impl DgtzError {
    /// Turn a raw driver return value into a `Result`.
    pub fn check(ret: i32) -> Result<(), DgtzError> {
        match ret {
            0 => Ok(()),
            code => Err(Self::from(code)),
        }
    }

    pub fn code(&self) -> i32 {
        match self {
            Self::CommError => -1,
            Self::GenericError => -2,
            Self::InvalidParam => -3,
            Self::InvalidLinkType => -4,
            Self::InvalidHandle => -5,
            Self::MaxDevicesError => -6,
            Self::BadBoardType => -7,
            Self::BadEventNumber => -9,
            Self::ReadDeviceRegisterFail => -10,
            Self::WriteDeviceRegisterFail => -11,
            Self::InvalidChannelNumber => -13,
            Self::ChannelBusy => -14,
            Self::WrongAcqMode => -16,
            Self::FunctionNotAllowed => -17,
            Self::Timeout => -18,
            Self::InvalidBuffer => -19,
            Self::EventNotFound => -20,
            Self::InvalidEvent => -21,
            Self::OutOfMemory => -22,
            Self::CalibrationError => -23,
            Self::DigitizerNotFound => -24,
            Self::DigitizerAlreadyOpen => -25,
            Self::DigitizerNotReady => -26,
            Self::NotYetImplemented => -99,
            Self::Unknown(code) => *code,
        }
    }

    fn describe(&self) -> &'static str {
        match self {
            Self::CommError => "communication error",
            Self::GenericError => "unspecified error",
            Self::InvalidParam => "invalid parameter",
            Self::InvalidLinkType => "invalid link type",
            Self::InvalidHandle => "invalid device handle",
            Self::MaxDevicesError => "maximum number of devices exceeded",
            Self::BadBoardType => "operation not allowed on this board type",
            Self::BadEventNumber => "event number out of range",
            Self::ReadDeviceRegisterFail => "unable to read register",
            Self::WriteDeviceRegisterFail => "unable to write register",
            Self::InvalidChannelNumber => "invalid channel number",
            Self::ChannelBusy => "channel busy",
            Self::WrongAcqMode => "wrong acquisition mode",
            Self::FunctionNotAllowed => "function not allowed",
            Self::Timeout => "communication timeout",
            Self::InvalidBuffer => "invalid buffer",
            Self::EventNotFound => "event not found",
            Self::InvalidEvent => "invalid event",
            Self::OutOfMemory => "out of memory",
            Self::CalibrationError => "calibration error",
            Self::DigitizerNotFound => "digitizer not found",
            Self::DigitizerAlreadyOpen => "digitizer already open",
            Self::DigitizerNotReady => "digitizer not ready",
            Self::NotYetImplemented => "not yet implemented",
            Self::Unknown(_) => "unknown error",
        }
    }
}

impl fmt::Display for DgtzError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.describe(), self.code())
    }
}

impl std::error::Error for DgtzError {}

/// Where to find the board.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LinkConfig {
    pub mode: ConnectMode,
    pub link: u32,
    pub slot: u32,
}

/// Identity reported by the board after connecting.
#[derive(Clone, Debug, Default)]
pub struct BoardInfo {
    pub model_name: String,
    pub model: u32,
    pub family_code: u32,
    pub channels: u32,
    pub adc_bits: u32,
    pub serial_number: u32,
    pub roc_firmware: String,
    pub amc_firmware: String,
    pub pcb_revision: u32,
}

impl BoardInfo {
    pub fn log(&self) {
        info!(
            "Connected to digitizer model {} (model {} family {})",
            self.model_name, self.model, self.family_code
        );
        info!("{} channels, {} bits ADC samples", self.channels, self.adc_bits);
        info!("Serial number: {}", self.serial_number);
        info!("ROC FPGA release: {}", self.roc_firmware);
        info!("AMC FPGA release: {}", self.amc_firmware);
        info!("PCB revision number: {}", self.pcb_revision);
    }
}

/// Board-level acquisition status word.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AcqStatus(pub u32);

impl AcqStatus {
    pub const RUNNING: u32 = 1 << 2;
    pub const EVENT_READY: u32 = 1 << 3;

    pub fn event_ready(self) -> bool {
        self.0 & Self::EVENT_READY != 0
    }

    pub fn running(self) -> bool {
        self.0 & Self::RUNNING != 0
    }
}

/// Per-group status word.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GroupStatus(pub u32);

impl GroupStatus {
    pub const MEMORY_FULL: u32 = 1;

    pub fn buffer_full(self) -> bool {
        self.0 & Self::MEMORY_FULL != 0
    }
}

/// Metadata the driver extracts for one event of a readout buffer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EventInfo {
    pub event_size: u32,
    pub board_id: u32,
    pub pattern: u32,
    pub channel_mask: u32,
    pub event_counter: u32,
    pub trigger_time_tag: u32,
}

/// Samples of one group: `CHANNELS_PER_GROUP` rows, one column per sample.
#[derive(Clone, Debug, PartialEq)]
pub struct GroupData {
    pub trigger_time_tag: u32,
    pub start_index_cell: u16,
    pub samples: Array2<f32>,
}

/// A decoded event. Groups without data are `None`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DecodedEvent {
    pub groups: [Option<GroupData>; MAX_GROUPS],
}

impl DecodedEvent {
    pub fn clear(&mut self) {
        self.groups = Default::default();
    }

    pub fn group_mask(&self) -> u8 {
        self.groups
            .iter()
            .enumerate()
            .filter(|(_, g)| g.is_some())
            .fold(0, |mask, (i, _)| mask | (1 << i))
    }
}

/// DRS4 sampling frequency.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SamplingFrequency {
    GHz5,
    GHz2_5,
    GHz1,
}

impl SamplingFrequency {
    /// Configuration code: 0 = 5 GHz, 1 = 2.5 GHz, 2 = 1 GHz.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::GHz5),
            1 => Some(Self::GHz2_5),
            2 => Some(Self::GHz1),
            _ => None,
        }
    }
}

/// How a trigger source is routed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TriggerUse {
    Disabled,
    AcqOnly,
    AcqAndExtOut,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SignalLevel {
    Nim,
    Ttl,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Edge {
    Rising,
    Falling,
}

/// One step of the board configuration sequence.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Setting {
    Reset,
    SamplingFrequency(SamplingFrequency),
    RecordLength(u32),
    GroupEnableMask(u8),
    ChannelDcOffset { channel: u8, offset: u32 },
    PostTriggerSize(u32),
    SwTriggerMode(TriggerUse),
    ExtTriggerInputMode(TriggerUse),
    FastTriggerMode(TriggerUse),
    FastTriggerDigitizing(bool),
    IoLevel(SignalLevel),
    TriggerPolarity(Edge),
    FastTriggerDcOffset { group: u8, offset: u32 },
    FastTriggerThreshold { group: u8, threshold: u32 },
    MaxNumEventsBlt(u32),
    LoadDrs4Correction(SamplingFrequency),
    Drs4Correction(bool),
    AcquisitionMode(StartMode),
}

/// Primitives the acquisition loop needs from a digitizer.
///
/// Implementations own their device handle: it is created by `connect` and
/// released by `close`.
pub trait Digitizer {
    fn connect(&mut self, link: &LinkConfig) -> Result<BoardInfo, DgtzError>;

    /// Apply one configuration step.
    fn apply(&mut self, setting: &Setting) -> Result<(), DgtzError>;

    fn acquisition_status(&mut self) -> Result<AcqStatus, DgtzError>;

    fn group_status(&mut self, group: usize) -> Result<GroupStatus, DgtzError>;

    /// Replace the contents of `buffer` with whatever the board has ready.
    fn read_data(&mut self, buffer: &mut Vec<u8>) -> Result<(), DgtzError>;

    /// Number of whole events in a readout buffer.
    fn num_events(&mut self, buffer: &[u8]) -> Result<u32, DgtzError>;

    /// Metadata and raw bytes of event `index` within `buffer`.
    fn event_info<'b>(
        &mut self,
        buffer: &'b [u8],
        index: u32,
    ) -> Result<(EventInfo, &'b [u8]), DgtzError>;

    fn decode_event(&mut self, raw: &[u8], event: &mut DecodedEvent) -> Result<(), DgtzError>;

    fn start(&mut self) -> Result<(), DgtzError>;

    fn stop(&mut self) -> Result<(), DgtzError>;

    fn close(&mut self) -> Result<(), DgtzError>;
}
