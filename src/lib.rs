pub mod config;
pub mod context;
pub mod controller;
pub mod emulator;
pub mod encoder;
pub mod error;
pub mod frame;
pub mod hardware;
pub mod report;
pub mod setup;
pub mod signals;
pub mod utils;
pub mod writer;

#[cfg(test)]
mod testing;

pub use config::*;
pub use context::*;
pub use controller::{AcquisitionController, RunOutcome, State};
pub use error::*;
pub use hardware::*;
pub use report::{RunReport, StopReason};
pub use utils::{Counter, RunCounters};
