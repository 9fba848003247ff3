use crate::{
    utils::per_second,
    writer::{format_time, OutputFileRecord},
    DaqError, OutputMode, RunCounters,
};
use log::info;
use std::fmt;
use time::OffsetDateTime;

/// Why the acquisition loop ended. Exactly one applies per run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopReason {
    /// Operator signal, with its number.
    OperatorSignal(i32),
    QuitFileDetected,
    TimeLimitReached,
    TooManyOutputFiles,
    HardwareError,
    OutputFailure,
    /// The run ended before acquisition could start.
    NormalTerminationNotApplicable,
}

impl StopReason {
    pub fn tag(&self) -> &'static str {
        match self {
            Self::OperatorSignal(_) => "OperatorSignal",
            Self::QuitFileDetected => "QuitFileDetected",
            Self::TimeLimitReached => "TimeLimitReached",
            Self::TooManyOutputFiles => "TooManyOutputFiles",
            Self::HardwareError => "HardwareError",
            Self::OutputFailure => "OutputFailure",
            Self::NormalTerminationNotApplicable => "NormalTerminationNotApplicable",
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::HardwareError | Self::OutputFailure)
    }
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OperatorSignal(sig) => write!(f, "interrupt {sig}"),
            Self::QuitFileDetected => write!(f, "quit file"),
            Self::TimeLimitReached => write!(f, "run time limit"),
            Self::TooManyOutputFiles => write!(f, "output file limit"),
            Self::HardwareError => write!(f, "ADC access or data handling error"),
            Self::OutputFailure => write!(f, "output write error"),
            Self::NormalTerminationNotApplicable => write!(f, "initialization failure"),
        }
    }
}

/// End-of-run summary.
#[derive(Debug)]
pub struct RunReport {
    pub stop_reason: StopReason,
    /// `None` when acquisition never started.
    pub started: Option<OffsetDateTime>,
    pub stopped: OffsetDateTime,
    pub read_events: u64,
    pub read_bytes: u64,
    pub written_events: u64,
    pub written_bytes: u64,
    pub output_mode: OutputMode,
    pub files: Vec<OutputFileRecord>,
    pub fatal: Option<DaqError>,
}

impl RunReport {
    pub fn new(stop_reason: StopReason, output_mode: OutputMode) -> Self {
        Self {
            stop_reason,
            started: None,
            stopped: OffsetDateTime::now_utc(),
            read_events: 0,
            read_bytes: 0,
            written_events: 0,
            written_bytes: 0,
            output_mode,
            files: Vec::new(),
            fatal: None,
        }
    }

    pub fn with_counters(mut self, counters: &RunCounters) -> Self {
        self.read_events = counters.read.events;
        self.read_bytes = counters.read.bytes;
        self.written_events = counters.written.events;
        self.written_bytes = counters.written.bytes;
        self
    }

    pub fn is_success(&self) -> bool {
        self.fatal.is_none()
    }

    /// Whole seconds between start and stop, 0 if the run never started.
    pub fn running_secs(&self) -> i64 {
        self.started
            .map(|t| (self.stopped - t).whole_seconds().max(0))
            .unwrap_or(0)
    }

    pub fn log(&self) {
        for line in self.to_string().lines() {
            info!("{line}");
        }
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== DAQ ending on {} ===", format_time(self.stopped))?;
        match self.started {
            None => writeln!(f, "Acquisition never started")?,
            Some(_) => {
                let secs = self.running_secs() as f64;
                writeln!(f, "Total running time: {} secs", self.running_secs())?;
                writeln!(
                    f,
                    "Total number of events acquired: {} - {:6.2} events/s",
                    self.read_events,
                    per_second(self.read_events as f64, secs)
                )?;
                writeln!(
                    f,
                    "Total size of data acquired: {} B - {:6.2} KB/s",
                    self.read_bytes,
                    per_second(self.read_bytes as f64 / 1024.0, secs)
                )?;
                writeln!(
                    f,
                    "Total number of events written: {} - {:6.2} events/s",
                    self.written_events,
                    per_second(self.written_events as f64, secs)
                )?;
                writeln!(
                    f,
                    "Total size of data written: {} B - {:6.2} KB/s",
                    self.written_bytes,
                    per_second(self.written_bytes as f64 / 1024.0, secs)
                )?;
            }
        }
        if self.output_mode == OutputMode::File && !self.files.is_empty() {
            writeln!(f, "=== Files created =======================================")?;
            for file in &self.files {
                writeln!(
                    f,
                    "'{}' {} {} {} {}{}",
                    file.file_name,
                    file.events,
                    file.size,
                    format_time(file.opened),
                    file.closed.map(format_time).unwrap_or_else(|| "-".into()),
                    if file.tail_written { "" } else { " (no tail)" }
                )?;
            }
        }
        writeln!(f, "=========================================================")?;
        match &self.fatal {
            None => writeln!(f, "Run result: OK")?,
            Some(e) => writeln!(f, "Run result: FATAL ({e})")?,
        }
        write!(f, "Stop cause: {}", self.stop_reason.tag())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use time::macros::datetime;

    #[test]
    fn tags_and_fatality() {
        assert_eq!(StopReason::OperatorSignal(15).tag(), "OperatorSignal");
        assert_eq!(StopReason::OperatorSignal(15).to_string(), "interrupt 15");
        assert!(StopReason::HardwareError.is_fatal());
        assert!(StopReason::OutputFailure.is_fatal());
        assert!(!StopReason::QuitFileDetected.is_fatal());
        assert!(!StopReason::TooManyOutputFiles.is_fatal());
    }

    #[test]
    fn report_ends_with_result_and_cause() {
        let t0 = datetime!(2026-10-16 08:00:00 UTC);
        let mut report = RunReport::new(StopReason::TimeLimitReached, OutputMode::File);
        report.started = Some(t0);
        report.stopped = t0 + time::Duration::seconds(4);
        report.read_events = 8;
        report.read_bytes = 8192;
        report.written_events = 6;
        report.written_bytes = 4096;
        report.files.push(OutputFileRecord {
            index: 0,
            file_name: "daq_b00_2026_10_16_08_00_00_000".into(),
            path: PathBuf::from("data/daq_b00_2026_10_16_08_00_00_000"),
            size: 4116,
            events: 6,
            opened: t0,
            closed: Some(report.stopped),
            tail_written: true,
        });

        let text = report.to_string();
        assert!(text.contains("Total running time: 4 secs"));
        assert!(text.contains("Total number of events acquired: 8 -   2.00 events/s"));
        assert!(text.contains("Total size of data written: 4096 B -   1.00 KB/s"));
        assert!(text.contains("'daq_b00_2026_10_16_08_00_00_000' 6 4116"));
        let last: Vec<&str> = text.lines().rev().take(2).collect();
        assert_eq!(last, ["Stop cause: TimeLimitReached", "Run result: OK"]);
    }

    #[test]
    fn unstarted_run_reports_no_rates() {
        let mut report =
            RunReport::new(StopReason::NormalTerminationNotApplicable, OutputMode::Stream);
        report.fatal = Some(DaqError::InvalidConfig("bad".into()));
        let text = report.to_string();
        assert!(text.contains("Acquisition never started"));
        assert!(!text.contains("Files created"));
        assert!(text.contains("Run result: FATAL (invalid configuration: bad)"));
        assert!(!report.is_success());
        assert_eq!(report.running_secs(), 0);
    }
}
