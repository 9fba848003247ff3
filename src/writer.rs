use crate::{
    frame::{unix_seconds, FileHeader, FileTail, HEADER_LEN, TAIL_LEN},
    DaqError, OutputTarget, RotationLimits, RunContext,
};
use log::{info, warn};
use std::{
    fs::{File, OpenOptions},
    io::Write,
    os::unix::fs::OpenOptionsExt,
    path::PathBuf,
};
use time::{macros::format_description, OffsetDateTime};

/// Values written into every header frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FileIdentity {
    pub run_number: i32,
    pub board_id: u32,
    pub board_sn: u32,
}

/// Bookkeeping for one output file (or the single output stream).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutputFileRecord {
    pub index: usize,
    pub file_name: String,
    pub path: PathBuf,
    /// Bytes written so far, header included.
    pub size: u64,
    /// Events written so far.
    pub events: u32,
    pub opened: OffsetDateTime,
    pub closed: Option<OffsetDateTime>,
    /// Set once the tail frame is on disk.
    pub tail_written: bool,
}

/// Result of a rotation request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Rotation {
    Rotated { index: usize },
    /// The file cap is reached. The active file stays open and untouched.
    Refused,
}

/// Owns the active output sink and decides when to rotate it.
pub struct OutputFileManager {
    target: OutputTarget,
    limits: RotationLimits,
    identity: FileIdentity,
    records: Vec<OutputFileRecord>,
    active: Option<File>,
}

impl OutputFileManager {
    pub fn new(ctx: &RunContext, identity: FileIdentity) -> Self {
        Self {
            target: ctx.output.clone(),
            limits: ctx.limits,
            identity,
            records: Vec::new(),
            active: None,
        }
    }

    /// Only file output rotates.
    pub fn rotates(&self) -> bool {
        matches!(self.target, OutputTarget::Files { .. })
    }

    pub fn records(&self) -> &[OutputFileRecord] {
        &self.records
    }

    pub fn into_records(self) -> Vec<OutputFileRecord> {
        self.records
    }

    pub fn active(&self) -> Option<&OutputFileRecord> {
        self.active.as_ref().and_then(|_| self.records.last())
    }

    /// Open the next output unit and write its header.
    pub fn open(&mut self, now: OffsetDateTime) -> Result<&OutputFileRecord, DaqError> {
        if let Some(record) = self.active() {
            return Err(DaqError::output(
                "open",
                &record.path,
                std::io::Error::other("previous output still open"),
            ));
        }
        let index = self.records.len();
        let file_index = u16::try_from(index)
            .ok()
            .filter(|_| index < self.limits.max_files)
            .ok_or(DaqError::TooManyOutputFiles(self.limits.max_files))?;

        let (file_name, path, mut file) = match &self.target {
            OutputTarget::Files { data_dir, template } => {
                let file_name = file_name(template, now, index);
                let path = data_dir.join(&file_name);
                info!("Opening output file {} with path '{}'", index, path.display());
                // Names come from the clock: a clash means the clock or the
                // configuration is wrong, never overwrite.
                let file = OpenOptions::new()
                    .write(true)
                    .create_new(true)
                    .mode(0o600)
                    .open(&path)
                    .map_err(|e| DaqError::output("open", &path, e))?;
                (file_name, path, file)
            }
            OutputTarget::Stream { path } => {
                info!("Opening output stream '{}'", path.display());
                let file = OpenOptions::new()
                    .write(true)
                    .open(path)
                    .map_err(|e| DaqError::output("open", path, e))?;
                (path.display().to_string(), path.clone(), file)
            }
        };

        let header = FileHeader {
            file_index,
            run_number: self.identity.run_number,
            board_id: self.identity.board_id,
            board_sn: self.identity.board_sn,
            open_time: unix_seconds(now),
        };
        file.write_all(&header.encode())
            .map_err(|e| DaqError::output("header write", &path, e))?;

        self.records.push(OutputFileRecord {
            index,
            file_name,
            path,
            size: HEADER_LEN as u64,
            events: 0,
            opened: now,
            closed: None,
            tail_written: false,
        });
        self.active = Some(file);
        Ok(&self.records[index])
    }

    /// Append one encoded event. Any failure leaves the file untrusted.
    pub fn write(&mut self, payload: &[u8]) -> Result<usize, DaqError> {
        let (Some(file), Some(record)) = (self.active.as_mut(), self.records.last_mut()) else {
            return Err(not_open("write"));
        };
        file.write_all(payload)
            .map_err(|e| DaqError::output("write", &record.path, e))?;
        record.size += payload.len() as u64;
        record.events += 1;
        Ok(payload.len())
    }

    pub fn should_rotate(&self, now: OffsetDateTime) -> bool {
        if !self.rotates() {
            return false;
        }
        match self.active() {
            Some(record) => {
                now - record.opened >= self.limits.max_duration
                    || record.size >= self.limits.max_size
                    || record.events >= self.limits.max_events
            }
            None => false,
        }
    }

    /// Close the active file and open the next one, unless the file cap is hit.
    pub fn rotate(&mut self, now: OffsetDateTime) -> Result<Rotation, DaqError> {
        if self.records.len() >= self.limits.max_files {
            warn!(
                "Output file limit of {} reached, not opening another file",
                self.limits.max_files
            );
            return Ok(Rotation::Refused);
        }
        self.finalize(now)?;
        let index = self.open(now)?.index;
        Ok(Rotation::Rotated { index })
    }

    /// Write the tail frame and close the active sink. No-op when nothing is open.
    pub fn finalize(&mut self, now: OffsetDateTime) -> Result<(), DaqError> {
        let rotates = self.rotates();
        let Some(mut file) = self.active.take() else {
            return Ok(());
        };
        let Some(record) = self.records.last_mut() else {
            return Ok(());
        };
        record.closed = Some(now);

        let tail = FileTail {
            n_events: record.events,
            total_size: record.size,
            close_time: unix_seconds(now),
        };
        file.write_all(&tail.encode())
            .map_err(|e| DaqError::output("tail write", &record.path, e))?;
        // fsync is meaningless (and fails) on a FIFO
        if rotates {
            file.sync_all()
                .map_err(|e| DaqError::output("close", &record.path, e))?;
        }
        record.tail_written = true;

        info!(
            "{} - Closed output {} '{}' after {} secs with {} events and size {} bytes",
            format_time(now),
            if rotates { "file" } else { "stream" },
            record.path.display(),
            (now - record.opened).whole_seconds(),
            record.events,
            record.size + TAIL_LEN as u64
        );
        Ok(())
    }

    /// Close the active sink without a tail after a failed write. The missing
    /// tail marks the file as truncated for readers.
    pub fn abandon(&mut self, now: OffsetDateTime) {
        if self.active.take().is_some() {
            if let Some(record) = self.records.last_mut() {
                record.closed = Some(now);
                warn!(
                    "Closed output '{}' without tail after write failure ({} events, {} bytes)",
                    record.path.display(),
                    record.events,
                    record.size
                );
            }
        }
    }
}

fn not_open(op: &'static str) -> DaqError {
    DaqError::output(op, PathBuf::new(), std::io::Error::other("no output open"))
}

/// `<template>_<YYYY_MM_DD_HH_MM_SS>_<index>`.
pub fn file_name(template: &str, opened: OffsetDateTime, index: usize) -> String {
    let stamp = opened
        .format(format_description!(
            "[year]_[month]_[day]_[hour]_[minute]_[second]"
        ))
        .unwrap_or_else(|_| opened.unix_timestamp().to_string());
    format!("{template}_{stamp}_{index:03}")
}

pub fn format_time(t: OffsetDateTime) -> String {
    t.format(format_description!(
        "[year]/[month]/[day] [hour]:[minute]:[second]"
    ))
    .unwrap_or_else(|_| t.unix_timestamp().to_string())
}
