use crate::DgtzError;
use std::{io, path::PathBuf};
use thiserror::Error;

/// Everything that can end a run early.
#[derive(Debug, Error)]
pub enum DaqError {
    #[error("unable to connect to digitizer: {0}")]
    Connection(DgtzError),
    #[error("digitizer rejected setting {setting}: {code}")]
    Configuration { setting: String, code: DgtzError },
    #[error("{op} failed: {code}")]
    HardwareIo { op: &'static str, code: DgtzError },
    #[error("unable to encode event {event_counter}: {reason}")]
    Encoding { event_counter: u32, reason: String },
    #[error("output {op} failed on '{}': {source}", path.display())]
    OutputIo {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("refusing to open more than {0} output files")]
    TooManyOutputFiles(usize),
    #[error("run cancelled: {0}")]
    Cancelled(String),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("unable to create marker '{}': {source}", path.display())]
    Marker {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("{0}")]
    Lock(String),
}

impl DaqError {
    pub fn hardware(op: &'static str, code: DgtzError) -> Self {
        Self::HardwareIo { op, code }
    }

    pub fn output(op: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::OutputIo {
            op,
            path: path.into(),
            source,
        }
    }

    /// A cancellation is a normal stop cause, everything else fails the process.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::Cancelled(_))
    }
}
