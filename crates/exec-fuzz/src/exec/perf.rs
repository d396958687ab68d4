//! Hardware instruction/branch counting via `perf_event_open`.
//!
//! Counters are created against a child that stopped itself before `exec`,
//! with `enable_on_exec` set, so counting starts exactly at the target's
//! entry and includes nothing of the runner. Non-Linux builds keep the type
//! but reject attachment; preflight checks stop configurations from getting
//! that far.

use nix::unistd::Pid;

use super::TargetError;
use crate::{config::DynFileMethod, feedback::Counters};

/// The set of hardware counters attached to one stopped child.
#[derive(Debug, Default)]
pub(crate) struct PerfCounters {
    #[cfg(target_os = "linux")]
    instr: Option<linux::PerfCounter>,
    #[cfg(target_os = "linux")]
    branch: Option<linux::PerfCounter>,
}

#[cfg(target_os = "linux")]
impl PerfCounters {
    /// Attach the counters selected in `methods` to `pid`.
    pub(crate) fn attach(pid: Pid, methods: DynFileMethod) -> Result<Self, TargetError> {
        let mut counters = Self::default();
        if methods.contains(DynFileMethod::INSTR_COUNT) {
            counters.instr = Some(linux::PerfCounter::open(
                pid,
                linux::PERF_COUNT_HW_INSTRUCTIONS,
            )?);
        }
        if methods.contains(DynFileMethod::BRANCH_COUNT) {
            counters.branch = Some(linux::PerfCounter::open(
                pid,
                linux::PERF_COUNT_HW_BRANCH_INSTRUCTIONS,
            )?);
        }
        Ok(counters)
    }

    /// Read the final values after the child has been reaped.
    pub(crate) fn collect(&self) -> Result<Counters, TargetError> {
        let mut out = Counters::default();
        if let Some(instr) = &self.instr {
            out.instr = instr.read()?;
        }
        if let Some(branch) = &self.branch {
            out.branch = branch.read()?;
        }
        Ok(out)
    }
}

#[cfg(not(target_os = "linux"))]
impl PerfCounters {
    pub(crate) fn attach(_pid: Pid, _methods: DynFileMethod) -> Result<Self, TargetError> {
        Err(TargetError::Unsupported(
            "hardware counters are only available on Linux".to_owned(),
        ))
    }

    pub(crate) fn collect(&self) -> Result<Counters, TargetError> {
        Ok(Counters::default())
    }
}

#[cfg(target_os = "linux")]
mod linux {
    use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

    use nix::unistd::Pid;

    use super::TargetError;

    // Stable kernel ABI, perf_event_attr v0.
    const PERF_TYPE_HARDWARE: u32 = 0;
    pub(super) const PERF_COUNT_HW_INSTRUCTIONS: u64 = 1;
    pub(super) const PERF_COUNT_HW_BRANCH_INSTRUCTIONS: u64 = 4;
    const PERF_ATTR_SIZE_VER0: u32 = 64;
    const PERF_FLAG_FD_CLOEXEC: libc::c_ulong = 8;

    // Bit positions in the attr flags word.
    const ATTR_INHERIT: u64 = 1 << 1;
    const ATTR_EXCLUDE_KERNEL: u64 = 1 << 5;
    const ATTR_EXCLUDE_HV: u64 = 1 << 6;
    const ATTR_ENABLE_ON_EXEC: u64 = 1 << 12;

    #[repr(C)]
    struct PerfEventAttr {
        type_: u32,
        size: u32,
        config: u64,
        sample_period: u64,
        sample_type: u64,
        read_format: u64,
        flags: u64,
        wakeup_events: u32,
        bp_type: u32,
        config1: u64,
    }

    #[derive(Debug)]
    pub(super) struct PerfCounter {
        fd: OwnedFd,
    }

    impl PerfCounter {
        pub(super) fn open(pid: Pid, config: u64) -> Result<Self, TargetError> {
            let attr = PerfEventAttr {
                type_: PERF_TYPE_HARDWARE,
                size: PERF_ATTR_SIZE_VER0,
                config,
                sample_period: 0,
                sample_type: 0,
                read_format: 0,
                flags: ATTR_INHERIT | ATTR_EXCLUDE_KERNEL | ATTR_EXCLUDE_HV | ATTR_ENABLE_ON_EXEC,
                wakeup_events: 0,
                bp_type: 0,
                config1: 0,
            };
            // SAFETY: the attr struct matches the v0 kernel layout and the
            // kernel copies it before the call returns.
            let fd = unsafe {
                libc::syscall(
                    libc::SYS_perf_event_open,
                    &attr as *const PerfEventAttr,
                    pid.as_raw(),
                    -1_i32,
                    -1_i32,
                    PERF_FLAG_FD_CLOEXEC,
                )
            };
            if fd < 0 {
                let errno = std::io::Error::last_os_error();
                return Err(TargetError::Perf(format!(
                    "perf_event_open failed ({errno}); check /proc/sys/kernel/perf_event_paranoid"
                )));
            }
            // SAFETY: a fresh fd returned by the kernel, owned from here on.
            let fd = unsafe { OwnedFd::from_raw_fd(fd as RawFd) };
            Ok(Self { fd })
        }

        pub(super) fn read(&self) -> Result<u64, TargetError> {
            let mut value = 0u64;
            // SAFETY: reading exactly 8 bytes into an owned, aligned u64.
            let n = unsafe {
                libc::read(
                    self.fd.as_raw_fd(),
                    (&raw mut value).cast::<libc::c_void>(),
                    size_of::<u64>(),
                )
            };
            if n as usize != size_of::<u64>() {
                return Err(TargetError::Perf(format!(
                    "short perf counter read: {}",
                    std::io::Error::last_os_error()
                )));
            }
            Ok(value)
        }
    }
}
