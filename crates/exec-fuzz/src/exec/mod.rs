//! Target execution: the capability trait, the per-run observation model and
//! the stock process-spawning backend.
//!
//! The engine never branches on the platform; everything OS- or
//! architecture-specific lives behind [`Target`] inside this module tree.

use std::{fmt, io, path::Path};

use nix::sys::signal::Signal;
use thiserror::Error;

use crate::{config::Config, feedback::Counters};

pub mod command;
pub(crate) mod perf;
pub(crate) mod sancov;

/// How one run of the target ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    /// Normal termination with an exit code. A non-zero code also covers the
    /// child-side exec failure path.
    Exited(i32),
    /// Terminated by a signal.
    Signaled(Signal),
    /// Killed by the runner after exceeding the per-run timeout.
    Timeout,
}

/// One resolved backtrace frame. The program counter is always present;
/// symbol names only when the backend can resolve them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub pc: u64,
    pub symbol: Option<String>,
}

impl Frame {
    pub fn pc(pc: u64) -> Self {
        Self { pc, symbol: None }
    }
}

/// Everything the engine learns from a single run of the target.
#[derive(Debug, Clone)]
pub struct Observation {
    pub pid: i32,
    pub wall_ms: u64,
    pub status: RunStatus,
    /// Crash backtrace, innermost frame first. Empty when the backend has no
    /// unwinder or the run did not crash.
    pub frames: Vec<Frame>,
    pub fault_addr: u64,
    pub counters: Counters,
    /// Free-form diagnostics forwarded to the report sink.
    pub report: Vec<u8>,
}

impl Observation {
    pub fn crashing_pc(&self) -> u64 {
        self.frames.first().map(|f| f.pc).unwrap_or(0)
    }
}

/// Executes the configured target once per call.
///
/// The stock implementation is [`command::CommandTarget`]; tests and
/// special-purpose instrumentation provide their own.
pub trait Target: Send + Sync + fmt::Debug {
    /// Startup validation of capability-dependent configuration. Called once
    /// before any worker starts.
    fn preflight(&self, _cfg: &Config) -> Result<(), TargetError> {
        Ok(())
    }

    /// Run the target over the input file and report what happened.
    fn execute(&self, cfg: &Config, input: &Path) -> Result<Observation, TargetError>;
}

/// Signals that classify a run as a crash.
///
/// On Android the sanitizer re-raises crashes as SIGUSR2 and aborts are
/// routinely rethrown by the runtime, so the set shifts accordingly.
#[cfg(not(target_os = "android"))]
pub fn is_crash_signal(sig: Signal) -> bool {
    matches!(
        sig,
        Signal::SIGSEGV
            | Signal::SIGBUS
            | Signal::SIGILL
            | Signal::SIGFPE
            | Signal::SIGABRT
            | Signal::SIGSYS
    )
}

#[cfg(target_os = "android")]
pub fn is_crash_signal(sig: Signal) -> bool {
    matches!(
        sig,
        Signal::SIGSEGV
            | Signal::SIGBUS
            | Signal::SIGILL
            | Signal::SIGFPE
            | Signal::SIGSYS
            | Signal::SIGUSR2
    )
}

#[derive(Debug, Error)]
pub enum TargetError {
    #[error("spawning target: {0}")]
    Spawn(#[source] io::Error),
    #[error("waiting for target: {0}")]
    Wait(#[source] nix::errno::Errno),
    #[error("hardware counters: {0}")]
    Perf(String),
    #[error("sanitizer coverage: {0}")]
    Sancov(#[source] io::Error),
    #[error("{0}")]
    Unsupported(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}
