//! Crash report sink.

use std::{fmt, io, io::Write};

use crate::config::Config;

/// Receives one rendered report blob per persisted crash.
pub trait Reporter: Send + Sync + fmt::Debug {
    fn report(&self, cfg: &Config, blob: &[u8]) -> io::Result<()>;
}

/// Appends report blobs to the configured report file.
#[derive(Debug, Default, Clone)]
pub struct FileReporter;

impl Reporter for FileReporter {
    fn report(&self, cfg: &Config, blob: &[u8]) -> io::Result<()> {
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(cfg.report_path())?;
        file.write_all(blob)?;
        file.write_all(b"\n")
    }
}

/// Discards reports. Used by tests and by runs with reporting disabled.
#[derive(Debug, Default, Clone)]
pub struct NullReporter;

impl Reporter for NullReporter {
    fn report(&self, _cfg: &Config, _blob: &[u8]) -> io::Result<()> {
        Ok(())
    }
}
