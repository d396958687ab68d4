//! Lifecycle supervision: signal disposition and the periodic wake-up that
//! drives the stats display.
//!
//! Handlers only store the signal number into a process-wide atomic; the
//! supervisor loop in [`crate::engine`] polls it between parks. Workers
//! unpark the supervisor when they finish, replacing the interval-timer
//! wake-up a signal-driven design would use.

use std::{
    sync::atomic::{AtomicI32, Ordering},
    time::{Duration, Instant},
};

use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use tracing::info;

use crate::tallies::{Tallies, TallySnapshot};

/// Interval between supervisor wake-ups.
pub(crate) const TICK: Duration = Duration::from_secs(1);

static SIG_RECEIVED: AtomicI32 = AtomicI32::new(0);

extern "C" fn record_signal(sig: libc::c_int) {
    SIG_RECEIVED.store(sig, Ordering::Relaxed);
}

/// Route SIGTERM, SIGINT and SIGQUIT into [`received_signal`].
pub fn install_signal_handlers() -> Result<(), nix::errno::Errno> {
    let action = SigAction::new(
        SigHandler::Handler(record_signal),
        SaFlags::empty(),
        SigSet::empty(),
    );
    for sig in [Signal::SIGTERM, Signal::SIGINT, Signal::SIGQUIT] {
        // SAFETY: the handler only performs an atomic store.
        unsafe { signal::sigaction(sig, &action) }?;
    }
    Ok(())
}

/// The termination signal received so far, if any.
pub fn received_signal() -> Option<Signal> {
    match SIG_RECEIVED.load(Ordering::Relaxed) {
        0 => None,
        raw => Signal::try_from(raw).ok(),
    }
}

pub fn clear_received_signal() {
    SIG_RECEIVED.store(0, Ordering::Relaxed);
}

/// Renders one stats line per tick.
#[derive(Debug)]
pub(crate) struct Display {
    last: TallySnapshot,
    last_at: Instant,
}

impl Display {
    pub(crate) fn new() -> Self {
        Self {
            last: TallySnapshot::default(),
            last_at: Instant::now(),
        }
    }

    pub(crate) fn tick(&mut self, tallies: &Tallies) {
        let snap = tallies.snapshot();
        let elapsed = self.last_at.elapsed().as_secs_f64();
        let speed = if elapsed > 0.0 {
            ((snap.mutations - self.last.mutations) as f64 / elapsed).round() as u64
        } else {
            0
        };
        info!(
            iterations = snap.mutations,
            crashes = snap.crashes,
            unique = snap.unique_crashes,
            blacklisted = snap.blacklisted_crashes,
            timeouts = snap.timeouts,
            per_sec = speed,
            "fuzzing"
        );
        self.last = snap;
        self.last_at = Instant::now();
    }
}
