//! The acquisition state machine.
//!
//! ```text
//! Disconnected -> Connected -> Initialized -> AwaitingStart -> Acquiring -> Stopping -> Closed
//!       \______________\______________\______________\____________________________ Aborted
//! ```
//!
//! The controller owns the digitizer and the output for the whole run. All
//! waiting happens in two fixed sleeps: the start marker poll and the loop
//! delay between readouts. Operator signals are seen through a shared flag
//! checked once per iteration.

use crate::{
    encoder::EventEncoder,
    report::{RunReport, StopReason},
    setup,
    signals::Coordination,
    writer::{format_time, FileIdentity, OutputFileManager, Rotation},
    BoardInfo, DaqError, DecodedEvent, Digitizer, DgtzError, EventInfo, RunContext, RunCounters,
    StartMode, MAX_GROUPS,
};
use crossbeam_channel::{never, tick, Receiver};
use log::{debug, error, info, warn};
use std::{
    sync::atomic::{AtomicI32, Ordering},
    thread,
    time::{Duration, Instant},
};
use time::OffsetDateTime;

const START_POLL: Duration = Duration::from_millis(1);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    Disconnected,
    Connected,
    Initialized,
    AwaitingStart,
    Acquiring,
    Stopping,
    Closed,
    Aborted,
}

/// How a run ended. An `Aborted` report always carries the fatal error, a
/// `Closed` one may.
#[derive(Debug)]
pub enum RunOutcome {
    Closed(RunReport),
    Aborted(RunReport),
}

impl RunOutcome {
    pub fn report(&self) -> &RunReport {
        match self {
            Self::Closed(report) | Self::Aborted(report) => report,
        }
    }

    pub fn into_report(self) -> RunReport {
        match self {
            Self::Closed(report) | Self::Aborted(report) => report,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Closed(report) if report.is_success())
    }
}

/// What happens after initialization.
enum Prepared {
    Start,
    Stop(StopReason),
}

/// Why the acquisition loop was left.
enum Halt {
    Stop(StopReason),
    Hardware(DaqError),
    Output(DaqError),
}

impl Halt {
    fn hardware(op: &'static str) -> impl FnOnce(DgtzError) -> Halt {
        move |code| Halt::Hardware(DaqError::hardware(op, code))
    }
}

pub struct AcquisitionController<'a, D, E, S> {
    ctx: &'a RunContext,
    digitizer: D,
    encoder: E,
    signals: S,
    break_signal: &'a AtomicI32,
    state: State,
    board: Option<BoardInfo>,
    counters: RunCounters,
    init_ok: bool,
    files_exhausted: bool,
}

impl<'a, D, E, S> AcquisitionController<'a, D, E, S>
where
    D: Digitizer,
    E: EventEncoder,
    S: Coordination,
{
    pub fn new(
        ctx: &'a RunContext,
        digitizer: D,
        encoder: E,
        signals: S,
        break_signal: &'a AtomicI32,
    ) -> Self {
        Self {
            ctx,
            digitizer,
            encoder,
            signals,
            break_signal,
            state: State::Disconnected,
            board: None,
            counters: RunCounters::default(),
            init_ok: false,
            files_exhausted: false,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn digitizer(&self) -> &D {
        &self.digitizer
    }

    pub fn signals(&self) -> &S {
        &self.signals
    }

    pub fn board_info(&self) -> Option<&BoardInfo> {
        self.board.as_ref()
    }

    pub fn counters(&self) -> &RunCounters {
        &self.counters
    }

    /// Drive the board from connection to the end of the run.
    pub fn run(&mut self) -> RunOutcome {
        match self.prepare() {
            Ok(Prepared::Start) => self.acquire(),
            Ok(Prepared::Stop(reason)) => self.close_idle(reason),
            Err(e) => self.abort(e),
        }
    }

    fn transition(&mut self, to: State) {
        debug!("State {:?} -> {:?}", self.state, to);
        self.state = to;
    }

    fn prepare(&mut self) -> Result<Prepared, DaqError> {
        let ctx = self.ctx;
        let link = ctx.board.link;
        info!(
            "Connecting to digitizer on {:?} link {} slot {}",
            link.mode, link.link, link.slot
        );
        let board = self
            .digitizer
            .connect(&link)
            .map_err(DaqError::Connection)?;
        board.log();
        self.board = Some(board);
        self.transition(State::Connected);

        setup::configure(&mut self.digitizer, &setup::board_settings(&ctx.board))?;
        self.transition(State::Initialized);

        // a quit marker left over before initialization means a test invocation
        let files = &ctx.files;
        if self.signals.exists(&files.quit_file) {
            info!(
                "Quit file '{}' found at initialization: exiting without acquisition",
                files.quit_file.display()
            );
            return Ok(Prepared::Stop(StopReason::QuitFileDetected));
        }
        self.signals.create_marker(&files.initok_file)?;
        self.init_ok = true;

        match ctx.board.start_mode {
            StartMode::Software => {
                self.transition(State::AwaitingStart);
                Ok(self.await_start())
            }
            _ => {
                info!("Acquisition will start on the S_IN signal");
                Ok(Prepared::Start)
            }
        }
    }

    /// Wait for the start or quit marker. There is no timeout.
    fn await_start(&mut self) -> Prepared {
        let ctx = self.ctx;
        let files = &ctx.files;
        info!(
            "Waiting for start file '{}' or quit file '{}'",
            files.start_file.display(),
            files.quit_file.display()
        );
        loop {
            if self.signals.exists(&files.start_file) {
                info!("Start file '{}' found: starting DAQ", files.start_file.display());
                return Prepared::Start;
            }
            if self.signals.exists(&files.quit_file) {
                info!("Quit file '{}' found: exiting", files.quit_file.display());
                return Prepared::Stop(StopReason::QuitFileDetected);
            }
            let sig = self.break_signal.load(Ordering::SeqCst);
            if sig != 0 {
                info!("Interrupt {sig} received while waiting for start: exiting");
                return Prepared::Stop(StopReason::OperatorSignal(sig));
            }
            thread::sleep(START_POLL);
        }
    }

    fn abort(&mut self, error: DaqError) -> RunOutcome {
        error!("Aborting: {error}");
        self.transition(State::Aborted);
        if !self.init_ok {
            let ctx = self.ctx;
            if let Err(e) = self.signals.create_marker(&ctx.files.initfail_file) {
                error!("{e}");
            }
        }
        let mut report = RunReport::new(
            StopReason::NormalTerminationNotApplicable,
            self.ctx.output_mode(),
        )
        .with_counters(&self.counters);
        report.fatal = Some(error);
        report.log();
        RunOutcome::Aborted(report)
    }

    /// End a run that never acquired.
    fn close_idle(&mut self, reason: StopReason) -> RunOutcome {
        self.transition(State::Stopping);
        self.transition(State::Closed);
        self.close_link();
        let report = RunReport::new(reason, self.ctx.output_mode());
        report.log();
        RunOutcome::Closed(report)
    }

    fn close_link(&mut self) {
        match self.digitizer.close() {
            Ok(()) => info!("Digitizer link closed"),
            Err(code) => warn!("Unable to close digitizer link: {code}"),
        }
    }

    fn acquire(&mut self) -> RunOutcome {
        if self.ctx.board.start_mode == StartMode::Software {
            if let Err(code) = self.digitizer.start() {
                return self.abort(DaqError::hardware("start acquisition", code));
            }
        }
        self.transition(State::Acquiring);
        let started = OffsetDateTime::now_utc();
        let t_start = Instant::now();
        info!("{} - Acquisition started", format_time(started));
        self.counters.clear();

        let identity = FileIdentity {
            run_number: self.ctx.run_number,
            board_id: self.ctx.board.board_id,
            board_sn: self.board.as_ref().map_or(0, |b| b.serial_number),
        };
        let mut output = OutputFileManager::new(self.ctx, identity);
        if let Err(e) = output.open(started) {
            if let Err(code) = self.digitizer.stop() {
                warn!("Unable to stop acquisition: {code}");
            }
            return self.abort(e);
        }

        let ticker: Receiver<Instant> = if self.ctx.report_interval.is_zero() {
            never()
        } else {
            tick(self.ctx.report_interval)
        };
        let mut buffer = Vec::new();
        let mut event = DecodedEvent::default();
        let mut payload = Vec::new();

        let halt = loop {
            if let Err(halt) = self.drain(&mut output, &mut buffer, &mut event, &mut payload) {
                break halt;
            }
            if let Err(halt) = self.rotate_if_due(&mut output) {
                break halt;
            }
            if ticker.try_recv().is_ok() {
                self.progress(t_start);
            }
            if let Some(reason) = self.stop_condition(started) {
                break Halt::Stop(reason);
            }
            thread::sleep(self.ctx.poll_delay);
        };
        self.stop(output, started, halt)
    }

    /// Read everything the board has ready and write the accepted events.
    fn drain(
        &mut self,
        output: &mut OutputFileManager,
        buffer: &mut Vec<u8>,
        event: &mut DecodedEvent,
        payload: &mut Vec<u8>,
    ) -> Result<(), Halt> {
        let ctx = self.ctx;
        let status = self
            .digitizer
            .acquisition_status()
            .map_err(Halt::hardware("read acquisition status"))?;
        if !status.event_ready() {
            return Ok(());
        }

        for group in (0..MAX_GROUPS).filter(|g| ctx.board.group_enabled(*g)) {
            let status = self
                .digitizer
                .group_status(group)
                .map_err(Halt::hardware("read group status"))?;
            if status.buffer_full() {
                warn!("*** Group {group} data buffer is full ***");
            }
        }

        self.digitizer
            .read_data(buffer)
            .map_err(Halt::hardware("read data"))?;
        let n_events = self
            .digitizer
            .num_events(buffer)
            .map_err(Halt::hardware("count events"))?;
        self.counters
            .read
            .record(u64::from(n_events), buffer.len() as u64);

        for index in 0..n_events {
            let (info, raw) = self
                .digitizer
                .event_info(buffer, index)
                .map_err(Halt::hardware("get event info"))?;
            self.digitizer
                .decode_event(raw, event)
                .map_err(Halt::hardware("decode event"))?;

            let sampled = info.event_counter % ctx.debug_scale == 0;
            if sampled {
                log_event(&info, event);
            }

            let len = self
                .encoder
                .encode(&info, event, payload)
                .map_err(Halt::Hardware)?;
            if len == 0 {
                continue;
            }
            if sampled {
                log_payload_header(&payload[..len]);
            }
            output.write(&payload[..len]).map_err(Halt::Output)?;
            self.counters.written.record(1, len as u64);
            self.rotate_if_due(output)?;
        }
        Ok(())
    }

    fn rotate_if_due(&mut self, output: &mut OutputFileManager) -> Result<(), Halt> {
        let now = OffsetDateTime::now_utc();
        if self.files_exhausted || !output.should_rotate(now) {
            return Ok(());
        }
        if output.rotate(now).map_err(Halt::Output)? == Rotation::Refused {
            self.files_exhausted = true;
        }
        Ok(())
    }

    /// Stop conditions in priority order.
    fn stop_condition(&self, started: OffsetDateTime) -> Option<StopReason> {
        let sig = self.break_signal.load(Ordering::SeqCst);
        if sig != 0 {
            return Some(StopReason::OperatorSignal(sig));
        }
        if self.files_exhausted {
            return Some(StopReason::TooManyOutputFiles);
        }
        if self.signals.exists(&self.ctx.files.quit_file) {
            return Some(StopReason::QuitFileDetected);
        }
        match self.ctx.total_daq_time {
            Some(limit) if OffsetDateTime::now_utc() - started >= limit => {
                Some(StopReason::TimeLimitReached)
            }
            _ => None,
        }
    }

    fn progress(&self, t_start: Instant) {
        info!(
            "Time (s): {}\tEvents read: {}\tEvents written: {}\tReadout rate (MB/s): {:.2} (avg {:.2})",
            t_start.elapsed().as_secs(),
            self.counters.read.events,
            self.counters.written.events,
            self.counters.read.live_rate(),
            self.counters.read.mean_rate()
        );
    }

    fn stop(
        &mut self,
        mut output: OutputFileManager,
        started: OffsetDateTime,
        halt: Halt,
    ) -> RunOutcome {
        self.transition(State::Stopping);
        let (reason, mut fatal) = match halt {
            Halt::Stop(reason) => (reason, None),
            Halt::Hardware(e) => (StopReason::HardwareError, Some(e)),
            Halt::Output(e) => (StopReason::OutputFailure, Some(e)),
        };
        match reason {
            StopReason::TooManyOutputFiles => info!(
                "=== Stopping DAQ after writing {} data files ===",
                output.records().len()
            ),
            StopReason::TimeLimitReached => info!(
                "=== Stopping DAQ after {} secs of run ===",
                (OffsetDateTime::now_utc() - started).whole_seconds()
            ),
            StopReason::OperatorSignal(_) | StopReason::QuitFileDetected => {
                info!(
                    "=== Stopping DAQ, {} ===",
                    DaqError::Cancelled(reason.to_string())
                )
            }
            _ => info!("=== Stopping DAQ on {reason} ==="),
        }
        if let Some(e) = &fatal {
            error!("{e}");
        }

        let now = OffsetDateTime::now_utc();
        if reason == StopReason::OutputFailure {
            output.abandon(now);
        } else if let Err(e) = output.finalize(now) {
            error!("{e}");
            fatal.get_or_insert(e);
        }

        // after a hardware error the board is left as it is
        if reason != StopReason::HardwareError {
            match self.digitizer.stop() {
                Ok(()) => info!(
                    "{} - Acquisition stopped",
                    format_time(OffsetDateTime::now_utc())
                ),
                Err(code) => {
                    let e = DaqError::hardware("stop acquisition", code);
                    error!("{e}");
                    fatal.get_or_insert(e);
                }
            }
        }

        self.transition(State::Closed);
        if fatal.is_none() {
            self.close_link();
        }

        let mut report =
            RunReport::new(reason, self.ctx.output_mode()).with_counters(&self.counters);
        report.started = Some(started);
        report.files = output.into_records();
        report.fatal = fatal;
        report.log();
        RunOutcome::Closed(report)
    }
}

fn log_event(info: &EventInfo, event: &DecodedEvent) {
    debug!(
        "- Evt# {} time {} size {} board 0x{:02x} pattern 0x{:08x} chmsk 0x{:08x}",
        info.event_counter & 0x003F_FFFF,
        info.trigger_time_tag & 0x7FFF_FFFF,
        info.event_size & 0x0FFF_FFFF,
        info.board_id & 0x1F,
        info.pattern & 0x3FFF,
        info.channel_mask
    );
    let groups: String = event
        .groups
        .iter()
        .enumerate()
        .filter_map(|(g, data)| {
            data.as_ref().map(|d| {
                format!(" {g}({:04x},{:4})", d.trigger_time_tag, d.start_index_cell)
            })
        })
        .collect();
    debug!("  Group(TTT,SIC){groups}");
}

fn log_payload_header(payload: &[u8]) {
    let words: String = payload
        .chunks_exact(4)
        .take(4)
        .enumerate()
        .map(|(i, w)| format!(" {i}({:08x})", u32::from_le_bytes([w[0], w[1], w[2], w[3]])))
        .collect();
    debug!("  Header{words}");
}
