//! Coordination with the run control: marker files, the instance lock and
//! operator signals.

use crate::DaqError;
use log::{info, warn};
use std::{
    fs::{self, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
    sync::atomic::{AtomicI32, Ordering},
};

/// Number of the last operator signal received, 0 when none.
pub static BREAK_SIGNAL: AtomicI32 = AtomicI32::new(0);

extern "C" fn on_break(sig: libc::c_int) {
    BREAK_SIGNAL.store(sig, Ordering::SeqCst);
}

/// Route SIGINT, SIGTERM and SIGHUP to [`BREAK_SIGNAL`].
pub fn install_break_handlers() -> Result<(), DaqError> {
    for sig in [libc::SIGINT, libc::SIGTERM, libc::SIGHUP] {
        let handler = on_break as extern "C" fn(libc::c_int) as libc::sighandler_t;
        // SAFETY: the handler only performs an atomic store.
        let previous = unsafe { libc::signal(sig, handler) };
        if previous == libc::SIG_ERR {
            return Err(DaqError::Lock(format!(
                "unable to install handler for signal {sig}: {}",
                io::Error::last_os_error()
            )));
        }
    }
    Ok(())
}

/// Filesystem markers shared with the run control.
pub trait Coordination {
    fn exists(&self, path: &Path) -> bool;

    fn create_marker(&mut self, path: &Path) -> Result<(), DaqError>;
}

/// Markers are plain files on the local filesystem.
#[derive(Clone, Copy, Debug, Default)]
pub struct FsSignals;

impl Coordination for FsSignals {
    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn create_marker(&mut self, path: &Path) -> Result<(), DaqError> {
        OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(|source| DaqError::Marker {
                path: path.to_path_buf(),
                source,
            })?;
        info!("Created marker file '{}'", path.display());
        Ok(())
    }
}

/// Single-instance lock holding the owner PID. Released on drop.
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
}

impl RunLock {
    pub fn acquire(path: &Path) -> Result<Self, DaqError> {
        let lock_err = |what: &str, e: io::Error| {
            DaqError::Lock(format!("{what} lock file '{}': {e}", path.display()))
        };

        if let Ok(contents) = fs::read_to_string(path) {
            match contents.trim().parse::<i32>() {
                Ok(pid) if process_alive(pid) => {
                    return Err(DaqError::Lock(format!(
                        "lock file '{}' is held by running process {pid}",
                        path.display()
                    )));
                }
                _ => warn!(
                    "Removing stale lock file '{}' ({})",
                    path.display(),
                    contents.trim()
                ),
            }
            fs::remove_file(path).map_err(|e| lock_err("unable to remove stale", e))?;
        }

        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|e| lock_err("unable to create", e))?;
        write!(file, "{}", std::process::id()).map_err(|e| lock_err("unable to write", e))?;
        info!("Lock file '{}' created", path.display());
        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        match fs::remove_file(&self.path) {
            Ok(()) => info!("Lock file '{}' removed", self.path.display()),
            Err(e) => warn!("Unable to remove lock file '{}': {e}", self.path.display()),
        }
    }
}

fn process_alive(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    // SAFETY: signal 0 only checks that the process exists.
    let ret = unsafe { libc::kill(pid, 0) };
    ret == 0 || io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}
