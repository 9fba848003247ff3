use anyhow::{Context, Result};
use clap::Parser;
use confique::Config;
use digi_daq::{
    emulator::Emulator,
    encoder::RawEncoder,
    signals::{install_break_handlers, Coordination, FsSignals, RunLock, BREAK_SIGNAL},
    AcquisitionController, Conf, ProcessMode, RunContext,
};
use log::{error, info, LevelFilter};
use simplelog::{
    ColorChoice, CombinedLogger, ConfigBuilder, SharedLogger, TermLogger, TerminalMode,
    WriteLogger,
};
use std::{fs::OpenOptions, path::PathBuf, process::ExitCode, time::SystemTime};

#[derive(Parser, Debug)]
#[command(name = "digi_daq")]
#[command(about = "Acquisition process for a DRS4 waveform digitizer", long_about = None)]
struct Cli {
    /// Configuration file (TOML). Built-in defaults are used when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(code) => code,
        Err(e) => {
            error!("{e:#}");
            eprintln!("digi_daq: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<Conf> {
    let builder = Conf::builder();
    let builder = match path {
        Some(path) => builder.file(path),
        None => builder,
    };
    builder.load().with_context(|| match path {
        Some(path) => format!("unable to load configuration '{}'", path.display()),
        None => "unable to load default configuration".to_string(),
    })
}

fn init_logging(conf: &Conf) -> Result<()> {
    let log_config = ConfigBuilder::new().set_time_format_rfc3339().build();
    let mut loggers: Vec<Box<dyn SharedLogger>> = vec![TermLogger::new(
        LevelFilter::Info,
        log_config.clone(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    )];
    if let Some(ref log_file) = conf.process.log_file {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_file)
            .with_context(|| format!("unable to open log file '{log_file}'"))?;
        loggers.push(WriteLogger::new(LevelFilter::Debug, log_config, file));
    }
    CombinedLogger::init(loggers).context("unable to initialize logging")
}

fn run(cli: Cli) -> Result<ExitCode> {
    let conf = load_config(cli.config.as_ref())?;
    init_logging(&conf)?;

    info!("=== Starting digitizer acquisition ===");
    if let Some(ref path) = cli.config {
        info!("Configuration file: '{}'", path.display());
    }
    info!("{conf:#?}");

    match conf.process.process_mode {
        ProcessMode::Daq => (),
        mode => {
            info!("Process mode {mode:?} is not supported by this program: exiting");
            return Ok(ExitCode::SUCCESS);
        }
    }

    let ctx = RunContext::from_conf(&conf)?;
    let mut signals = FsSignals;

    let _lock = match RunLock::acquire(&ctx.files.lock_file) {
        Ok(lock) => lock,
        Err(e) => {
            error!("{e}");
            if let Err(e) = signals.create_marker(&ctx.files.initfail_file) {
                error!("{e}");
            }
            return Ok(ExitCode::FAILURE);
        }
    };
    install_break_handlers()?;

    let seed = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or_default();
    let mut controller = AcquisitionController::new(
        &ctx,
        Emulator::new(&ctx.board, seed),
        RawEncoder::new(&ctx),
        signals,
        &BREAK_SIGNAL,
    );
    let outcome = controller.run();

    if outcome.is_success() {
        info!("=== Acquisition ended normally ===");
        Ok(ExitCode::SUCCESS)
    } else {
        error!("=== Acquisition ended with errors ===");
        Ok(ExitCode::FAILURE)
    }
}
