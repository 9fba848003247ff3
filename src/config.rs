use confique::Config;
use serde::Deserialize;
use std::collections::HashMap;

#[derive(Config, Debug, Clone)]
pub struct Conf {
    #[config(nested)]
    pub process: ProcessSettings,
    #[config(nested)]
    pub run: RunSettings,
    #[config(nested)]
    pub output: OutputSettings,
    #[config(nested)]
    pub board: BoardSettings,
}

#[derive(Config, Debug, Clone)]
pub struct ProcessSettings {
    #[config(default = "DAQ")]
    pub process_mode: ProcessMode,
    #[config(default = "run/quit")]
    pub quit_file: String,
    #[config(default = "run/start")]
    pub start_file: String,
    #[config(default = "run/initok.b00")]
    pub initok_file: String,
    #[config(default = "run/initfail.b00")]
    pub initfail_file: String,
    #[config(default = "run/lock.b00")]
    pub lock_file: String,
    pub log_file: Option<String>,
    /// Seconds between progress lines, 0 disables them.
    #[config(default = 10)]
    pub report_interval: u64,
}

#[derive(Config, Debug, Clone)]
pub struct RunSettings {
    /// 0 is a dummy run.
    #[config(default = 0)]
    pub run_number: i32,
    /// Seconds, 0 runs until stopped.
    #[config(default = 0)]
    pub total_daq_time: u64,
    /// Microseconds between polls of the board.
    #[config(default = 10000)]
    pub daq_loop_delay: u64,
    /// Log one event in `debug_scale`.
    #[config(default = 100)]
    pub debug_scale: u32,
    #[config(default = "SW")]
    pub startdaq_mode: StartMode,
}

#[derive(Config, Debug, Clone)]
pub struct OutputSettings {
    #[config(default = "FILE")]
    pub output_mode: OutputMode,
    #[config(default = "")]
    pub output_stream: String,
    #[config(default = "data/")]
    pub data_dir: String,
    #[config(default = "daq_b00")]
    pub data_file: String,
    /// Seconds.
    #[config(default = 900)]
    pub file_max_duration: u64,
    /// Bytes.
    #[config(default = 1073741824)]
    pub file_max_size: u64,
    #[config(default = 100000)]
    pub file_max_events: u32,
    #[config(default = 1024)]
    pub max_output_files: usize,
}

#[derive(Config, Debug, Clone)]
pub struct BoardSettings {
    #[config(default = 0)]
    pub board_id: u32,
    /// USB and OPTICAL need the vendor driver, only EMULATED runs without it.
    #[config(default = "EMULATED")]
    pub connect_mode: ConnectMode,
    #[config(default = 0)]
    pub conet2_link: u32,
    #[config(default = 0)]
    pub conet2_slot: u32,
    /// 0 = 5 GHz, 1 = 2.5 GHz, 2 = 1 GHz.
    #[config(default = 2)]
    pub drs4_sampfreq: u8,
    #[config(default = 1024)]
    pub record_length: u32,
    #[config(default = "FAST")]
    pub trigger_mode: TriggerMode,
    #[config(default = "NIM")]
    pub trigger_iolevel: IoLevel,
    #[config(default = 15)]
    pub group_enable_mask: u8,
    #[config(default = 22016)]
    pub offset_global: u32,
    /// Channel number to DC offset, overriding `offset_global`.
    pub offset_ch: Option<HashMap<String, u32>>,
    /// Percent of the record after the trigger.
    #[config(default = 65)]
    pub post_trigger_size: u32,
    #[config(default = 128)]
    pub max_num_events_blt: u32,
    #[config(default = true)]
    pub drs4corr_enable: bool,
    /// Mean trigger rate of the emulated board, in Hz.
    #[config(default = 100.0)]
    pub emulator_rate: f64,
}

#[derive(Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProcessMode {
    #[serde(rename = "DAQ")]
    Daq,
    #[serde(rename = "ZSUP")]
    Zsup,
    #[serde(rename = "FAKE")]
    Fake,
}

#[derive(Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputMode {
    #[serde(rename = "FILE")]
    File,
    #[serde(rename = "STREAM")]
    Stream,
}

#[derive(Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectMode {
    #[serde(rename = "USB")]
    Usb,
    #[serde(rename = "OPTICAL")]
    Optical,
    #[serde(rename = "EMULATED")]
    Emulated,
}

#[derive(Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum StartMode {
    /// Start and stop from software commands.
    #[serde(rename = "SW")]
    Software,
    /// Start and stop from the S_IN front panel signal.
    #[serde(rename = "S_IN")]
    SIn,
    /// Start on first trigger. Not implemented.
    #[serde(rename = "TRIGGER")]
    FirstTrigger,
}

#[derive(Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum TriggerMode {
    #[serde(rename = "EXTERNAL")]
    External,
    #[serde(rename = "FAST")]
    Fast,
    /// Not implemented.
    #[serde(rename = "SOFTWARE")]
    Software,
}

#[derive(Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum IoLevel {
    #[serde(rename = "NIM")]
    Nim,
    #[serde(rename = "TTL")]
    Ttl,
}
