use crate::{
    Conf, DaqError, IoLevel, LinkConfig, OutputMode, SamplingFrequency, StartMode, TriggerMode,
    MAX_CHANNELS, MAX_GROUPS,
};
use std::path::PathBuf;

/// Upper bound on `max_output_files`, the header frame carries a 16-bit index.
pub const MAX_OUTPUT_FILES: usize = u16::MAX as usize + 1;

/// Where accepted events go.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OutputTarget {
    /// Rotating files `<template>_<time>_<index>` under `data_dir`.
    Files { data_dir: PathBuf, template: String },
    /// A single pre-existing stream (usually a FIFO) that never rotates.
    Stream { path: PathBuf },
}

impl OutputTarget {
    pub fn mode(&self) -> OutputMode {
        match self {
            Self::Files { .. } => OutputMode::File,
            Self::Stream { .. } => OutputMode::Stream,
        }
    }
}

/// Thresholds for closing the active file and opening the next one.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RotationLimits {
    pub max_duration: time::Duration,
    pub max_size: u64,
    pub max_events: u32,
    pub max_files: usize,
}

/// Coordination files shared with the run control.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MarkerFiles {
    pub quit_file: PathBuf,
    pub start_file: PathBuf,
    pub initok_file: PathBuf,
    pub initfail_file: PathBuf,
    pub lock_file: PathBuf,
}

/// Validated board configuration.
#[derive(Clone, Debug, PartialEq)]
pub struct BoardConfig {
    pub board_id: u32,
    pub link: LinkConfig,
    pub sampling: SamplingFrequency,
    pub record_length: u32,
    pub trigger_mode: TriggerMode,
    pub io_level: IoLevel,
    pub group_enable_mask: u8,
    /// DC offset per channel, already resolved against the global default.
    pub offsets: [u32; MAX_CHANNELS],
    pub post_trigger_size: u32,
    pub max_num_events_blt: u32,
    pub drs4_correction: bool,
    pub start_mode: StartMode,
    pub emulator_rate: f64,
}

impl BoardConfig {
    pub fn group_enabled(&self, group: usize) -> bool {
        group < MAX_GROUPS && self.group_enable_mask & (1 << group) != 0
    }
}

/// Everything the controller needs to know about a run. Read-only once built.
#[derive(Clone, Debug, PartialEq)]
pub struct RunContext {
    pub run_number: i32,
    pub board: BoardConfig,
    pub output: OutputTarget,
    pub limits: RotationLimits,
    /// `None` runs until another stop condition fires.
    pub total_daq_time: Option<time::Duration>,
    pub poll_delay: std::time::Duration,
    pub debug_scale: u32,
    pub files: MarkerFiles,
    pub report_interval: std::time::Duration,
}

const RECORD_LENGTHS: [u32; 4] = [1024, 520, 256, 136];

impl RunContext {
    pub fn from_conf(conf: &Conf) -> Result<Self, DaqError> {
        let output = match conf.output.output_mode {
            OutputMode::File => {
                if conf.output.data_file.is_empty() {
                    return Err(invalid("data_file template must not be empty"));
                }
                OutputTarget::Files {
                    data_dir: PathBuf::from(&conf.output.data_dir),
                    template: conf.output.data_file.clone(),
                }
            }
            OutputMode::Stream => {
                if conf.output.output_stream.is_empty() {
                    return Err(invalid("STREAM output mode requires output_stream"));
                }
                OutputTarget::Stream {
                    path: PathBuf::from(&conf.output.output_stream),
                }
            }
        };

        if !(1..=MAX_OUTPUT_FILES).contains(&conf.output.max_output_files) {
            return Err(invalid(format!(
                "max_output_files must be between 1 and {MAX_OUTPUT_FILES}"
            )));
        }
        if conf.run.debug_scale == 0 {
            return Err(invalid("debug_scale must be at least 1"));
        }
        let total_daq_time = match conf.run.total_daq_time {
            0 => None,
            secs => Some(seconds(secs)?),
        };

        Ok(Self {
            run_number: conf.run.run_number,
            board: board_config(conf)?,
            output,
            limits: RotationLimits {
                max_duration: seconds(conf.output.file_max_duration)?,
                max_size: conf.output.file_max_size,
                max_events: conf.output.file_max_events,
                max_files: conf.output.max_output_files,
            },
            total_daq_time,
            poll_delay: std::time::Duration::from_micros(conf.run.daq_loop_delay),
            debug_scale: conf.run.debug_scale,
            files: MarkerFiles {
                quit_file: PathBuf::from(&conf.process.quit_file),
                start_file: PathBuf::from(&conf.process.start_file),
                initok_file: PathBuf::from(&conf.process.initok_file),
                initfail_file: PathBuf::from(&conf.process.initfail_file),
                lock_file: PathBuf::from(&conf.process.lock_file),
            },
            report_interval: std::time::Duration::from_secs(conf.process.report_interval),
        })
    }

    pub fn output_mode(&self) -> OutputMode {
        self.output.mode()
    }
}

fn board_config(conf: &Conf) -> Result<BoardConfig, DaqError> {
    let board = &conf.board;

    let sampling = SamplingFrequency::from_code(board.drs4_sampfreq).ok_or_else(|| {
        invalid(format!(
            "drs4_sampfreq set to {}, accepted: 0, 1, 2",
            board.drs4_sampfreq
        ))
    })?;
    if !RECORD_LENGTHS.contains(&board.record_length) {
        return Err(invalid(format!(
            "record_length {} not one of {:?}",
            board.record_length, RECORD_LENGTHS
        )));
    }
    if board.group_enable_mask == 0 || board.group_enable_mask >> MAX_GROUPS != 0 {
        return Err(invalid(format!(
            "group_enable_mask 0x{:x} must enable at least one of {} groups",
            board.group_enable_mask, MAX_GROUPS
        )));
    }
    if board.post_trigger_size > 100 {
        return Err(invalid(format!(
            "post_trigger_size {} is not a percentage",
            board.post_trigger_size
        )));
    }
    if board.trigger_mode == TriggerMode::Software {
        return Err(invalid("software triggers are not implemented"));
    }
    if conf.run.startdaq_mode == StartMode::FirstTrigger {
        return Err(invalid("trigger controlled start is not implemented"));
    }
    if !(board.emulator_rate.is_finite() && board.emulator_rate >= 0.0) {
        return Err(invalid("emulator_rate must be a non-negative number"));
    }

    let mut offsets = [board.offset_global; MAX_CHANNELS];
    if let Some(ref per_channel) = board.offset_ch {
        for (chan, offset) in per_channel {
            let ch = chan
                .trim()
                .parse::<usize>()
                .ok()
                .filter(|ch| *ch < MAX_CHANNELS)
                .ok_or_else(|| invalid(format!("offset_ch has invalid channel '{chan}'")))?;
            offsets[ch] = *offset;
        }
    }

    Ok(BoardConfig {
        board_id: board.board_id,
        link: LinkConfig {
            mode: board.connect_mode,
            link: board.conet2_link,
            slot: board.conet2_slot,
        },
        sampling,
        record_length: board.record_length,
        trigger_mode: board.trigger_mode,
        io_level: board.trigger_iolevel,
        group_enable_mask: board.group_enable_mask,
        offsets,
        post_trigger_size: board.post_trigger_size,
        max_num_events_blt: board.max_num_events_blt,
        drs4_correction: board.drs4corr_enable,
        start_mode: conf.run.startdaq_mode,
        emulator_rate: board.emulator_rate,
    })
}

fn seconds(secs: u64) -> Result<time::Duration, DaqError> {
    i64::try_from(secs)
        .map(time::Duration::seconds)
        .map_err(|_| invalid(format!("{secs} seconds is out of range")))
}

fn invalid(msg: impl Into<String>) -> DaqError {
    DaqError::InvalidConfig(msg.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use confique::Config;
    use std::collections::HashMap;

    fn conf() -> Conf {
        Conf::builder().load().unwrap()
    }

    #[test]
    fn defaults_build_a_file_context() {
        let ctx = RunContext::from_conf(&conf()).unwrap();
        assert_eq!(ctx.output_mode(), OutputMode::File);
        assert_eq!(ctx.total_daq_time, None);
        assert_eq!(ctx.poll_delay, std::time::Duration::from_millis(10));
        assert_eq!(ctx.limits.max_duration, time::Duration::seconds(900));
        assert_eq!(ctx.limits.max_events, 100_000);
        assert!(ctx.board.offsets.iter().all(|&o| o == 0x5600));
        assert!(ctx.board.group_enabled(3));
        assert!(!ctx.board.group_enabled(4));
    }

    #[test]
    fn per_channel_offsets_override_global() {
        let mut conf = conf();
        conf.board.offset_global = 0x1000;
        conf.board.offset_ch = Some(HashMap::from([
            ("0".to_string(), 0x2000),
            ("31".to_string(), 0x3000),
        ]));
        let ctx = RunContext::from_conf(&conf).unwrap();
        assert_eq!(ctx.board.offsets[0], 0x2000);
        assert_eq!(ctx.board.offsets[1], 0x1000);
        assert_eq!(ctx.board.offsets[31], 0x3000);

        conf.board.offset_ch = Some(HashMap::from([("32".to_string(), 1)]));
        assert!(matches!(
            RunContext::from_conf(&conf),
            Err(DaqError::InvalidConfig(_))
        ));
    }

    #[test]
    fn zero_total_time_is_unbounded() {
        let mut conf = conf();
        conf.run.total_daq_time = 2;
        let ctx = RunContext::from_conf(&conf).unwrap();
        assert_eq!(ctx.total_daq_time, Some(time::Duration::seconds(2)));
    }

    #[test]
    fn rejects_unusable_settings() {
        let mut stream = conf();
        stream.output.output_mode = OutputMode::Stream;
        assert!(RunContext::from_conf(&stream).is_err());
        stream.output.output_stream = "/tmp/fifo".into();
        let ctx = RunContext::from_conf(&stream).unwrap();
        assert_eq!(ctx.output_mode(), OutputMode::Stream);

        let mut files = conf();
        files.output.max_output_files = MAX_OUTPUT_FILES;
        assert!(RunContext::from_conf(&files).is_ok());
        files.output.max_output_files = MAX_OUTPUT_FILES + 1;
        assert!(matches!(
            RunContext::from_conf(&files),
            Err(DaqError::InvalidConfig(_))
        ));
        files.output.max_output_files = 0;
        assert!(RunContext::from_conf(&files).is_err());

        let mut bad = conf();
        bad.board.drs4_sampfreq = 3;
        assert!(RunContext::from_conf(&bad).is_err());

        let mut bad = conf();
        bad.board.group_enable_mask = 0x10;
        assert!(RunContext::from_conf(&bad).is_err());

        let mut bad = conf();
        bad.board.trigger_mode = TriggerMode::Software;
        assert!(RunContext::from_conf(&bad).is_err());

        let mut bad = conf();
        bad.run.startdaq_mode = StartMode::FirstTrigger;
        assert!(RunContext::from_conf(&bad).is_err());

        let mut bad = conf();
        bad.board.record_length = 1000;
        assert!(RunContext::from_conf(&bad).is_err());
    }
}
