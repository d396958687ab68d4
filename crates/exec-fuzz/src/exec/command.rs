//! The stock target backend: spawn the configured command once per run and
//! supervise it until exit, signal or timeout.

use std::{
    fs::File,
    io,
    os::unix::process::CommandExt,
    path::Path,
    process::{Command, Stdio},
    time::{Duration, Instant},
};

use nix::{
    errno::Errno,
    sys::{
        signal::{kill, Signal},
        wait::{waitpid, WaitPidFlag, WaitStatus},
    },
    unistd::Pid,
};
use tracing::{debug, warn};

use super::{sancov, Observation, RunStatus, Target, TargetError};
use crate::{
    config::{Config, DynFileMethod, FILE_PLACEHOLDER},
    feedback::Counters,
};

/// Interval between child liveness polls while a run is in flight.
const REAP_POLL_INTERVAL: Duration = Duration::from_micros(200);

#[derive(Debug, Default, Clone)]
pub struct CommandTarget;

impl Target for CommandTarget {
    fn preflight(&self, cfg: &Config) -> Result<(), TargetError> {
        if cfg.attach_pid.is_some() || cfg.attach_pid_file.is_some() {
            return Err(TargetError::Unsupported(
                "attaching to a live process requires a ptrace-capable target backend".to_owned(),
            ));
        }
        let unsupported = DynFileMethod::UNIQUE_BLOCK
            | DynFileMethod::UNIQUE_EDGE
            | DynFileMethod::CUSTOM;
        if cfg.dyn_file_method.intersects(unsupported) {
            return Err(TargetError::Unsupported(
                "the builtin runner only measures instruction and branch counts; \
                 unique-block/unique-edge/custom counters need a bespoke target backend"
                    .to_owned(),
            ));
        }
        if !cfg!(target_os = "linux") && !cfg.dyn_file_method.is_empty() {
            return Err(TargetError::Unsupported(
                "hardware counters are only available on Linux".to_owned(),
            ));
        }
        if cfg.proc_maps {
            warn!("/proc maps capture is not supported by the builtin runner; ignoring");
        }
        if !Path::new(&cfg.cmdline[0]).exists() {
            warn!(target = %cfg.cmdline[0], "target binary not found at the given path");
        }
        Ok(())
    }

    fn execute(&self, cfg: &Config, input: &Path) -> Result<Observation, TargetError> {
        let use_perf = !cfg.dyn_file_method.is_empty();
        let started = Instant::now();
        // A failed exec surfaces as a spawn error; the run is classified as
        // a normal-but-failed exit rather than tearing the engine down.
        let child = match self.launch(cfg, input, use_perf) {
            Ok(child) => child,
            Err(TargetError::Spawn(err)) => {
                warn!(%err, "target failed to launch");
                return Ok(Observation {
                    pid: 0,
                    wall_ms: started.elapsed().as_millis() as u64,
                    status: RunStatus::Exited(127),
                    frames: Vec::new(),
                    fault_addr: 0,
                    counters: Counters::default(),
                    report: Vec::new(),
                });
            }
            Err(other) => return Err(other),
        };
        let pid = Pid::from_raw(child.id() as i32);
        // The child keeps running detached from the `Child` handle; this
        // backend reaps it directly through waitpid.
        drop(child);

        let perf = if use_perf {
            match self.sync_with_stopped_child(pid)? {
                Some(early) => return Ok(self.observe(pid, early, started, None, cfg)),
                None => {
                    let counters = super::perf::PerfCounters::attach(pid, cfg.dyn_file_method)?;
                    kill(pid, Signal::SIGCONT).map_err(TargetError::Wait)?;
                    Some(counters)
                }
            }
        } else {
            None
        };

        let status = self.reap(pid, cfg.timeout, started)?;
        Ok(self.observe(pid, status, started, perf, cfg))
    }
}

impl CommandTarget {
    /// Spawn one run. The child puts itself into a fresh session with core
    /// dumps off and, when counters are requested, stops itself right before
    /// `exec` so the parent can attach them.
    fn launch(
        &self,
        cfg: &Config,
        input: &Path,
        stop_before_exec: bool,
    ) -> Result<std::process::Child, TargetError> {
        let argv = build_argv(cfg, input);
        let mut command = Command::new(&argv[0]);
        command.args(&argv[1..]);

        if cfg.fuzz_stdin {
            let input_file = File::open(input).map_err(TargetError::Spawn)?;
            command.stdin(Stdio::from(input_file));
        } else {
            command.stdin(Stdio::null());
        }
        if cfg.null_stdio {
            command.stdout(Stdio::null()).stderr(Stdio::null());
        }

        if cfg.sancov {
            let coverage_dir = sancov::scratch_dir(cfg);
            command.env(
                "ASAN_OPTIONS",
                format!("coverage=1:coverage_dir={}", coverage_dir.display()),
            );
        }
        command.envs(cfg.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())));

        let disable_randomization = cfg.disable_randomization;
        let child_setup = move || {
            use nix::sys::resource::{setrlimit, Resource};
            nix::unistd::setsid().map_err(io::Error::from)?;
            setrlimit(Resource::RLIMIT_CORE, 0, 0).map_err(io::Error::from)?;
            if disable_randomization {
                use nix::sys::personality::{self, Persona};
                let persona = personality::get().map_err(io::Error::from)?;
                personality::set(persona | Persona::ADDR_NO_RANDOMIZE)
                    .map_err(io::Error::from)?;
            }
            if stop_before_exec {
                // SAFETY: raise is async-signal-safe; the parent resumes us
                // with SIGCONT once the counters are in place.
                let rc = unsafe { libc::raise(libc::SIGSTOP) };
                if rc != 0 {
                    return Err(io::Error::last_os_error());
                }
            }
            Ok(())
        };
        // SAFETY: the setup closure only performs async-signal-safe syscalls.
        unsafe { command.pre_exec(child_setup) };

        command.spawn().map_err(TargetError::Spawn)
    }

    /// Wait for the self-stop that precedes `exec`. Returns an early run
    /// status if the child died before reaching it.
    fn sync_with_stopped_child(&self, pid: Pid) -> Result<Option<RunStatus>, TargetError> {
        match waitpid(pid, Some(WaitPidFlag::WUNTRACED)).map_err(TargetError::Wait)? {
            WaitStatus::Stopped(_, _) => Ok(None),
            WaitStatus::Exited(_, code) => Ok(Some(RunStatus::Exited(code))),
            WaitStatus::Signaled(_, sig, _) => Ok(Some(RunStatus::Signaled(sig))),
            other => Err(TargetError::Perf(format!(
                "unexpected wait status {other:?} before exec"
            ))),
        }
    }

    /// Block until the child terminates, enforcing the per-run timeout.
    fn reap(&self, pid: Pid, timeout: Duration, started: Instant) -> Result<RunStatus, TargetError> {
        loop {
            match waitpid(pid, Some(WaitPidFlag::WNOHANG)).map_err(TargetError::Wait)? {
                WaitStatus::Exited(_, code) => return Ok(RunStatus::Exited(code)),
                WaitStatus::Signaled(_, sig, _) => return Ok(RunStatus::Signaled(sig)),
                WaitStatus::StillAlive => {
                    if started.elapsed() >= timeout {
                        debug!(pid = pid.as_raw(), "per-run timeout hit, killing target");
                        match kill(pid, Signal::SIGKILL) {
                            Ok(()) | Err(Errno::ESRCH) => {}
                            Err(errno) => return Err(TargetError::Wait(errno)),
                        }
                        waitpid(pid, None).map_err(TargetError::Wait)?;
                        return Ok(RunStatus::Timeout);
                    }
                    std::thread::sleep(REAP_POLL_INTERVAL);
                }
                _ => std::thread::sleep(REAP_POLL_INTERVAL),
            }
        }
    }

    fn observe(
        &self,
        pid: Pid,
        status: RunStatus,
        started: Instant,
        perf: Option<super::perf::PerfCounters>,
        cfg: &Config,
    ) -> Observation {
        let mut counters = Counters::default();
        if let Some(perf) = perf {
            match perf.collect() {
                Ok(read) => counters = read,
                Err(err) => warn!(%err, "hardware counter read failed"),
            }
        }
        if cfg.sancov {
            match sancov::collect(&sancov::scratch_dir(cfg)) {
                Ok(unique_pcs) => counters.pc = unique_pcs,
                Err(err) => warn!(%err, "sanitizer coverage collection failed"),
            }
        }
        Observation {
            pid: pid.as_raw(),
            wall_ms: started.elapsed().as_millis() as u64,
            status,
            // No unwinder in the spawn-per-run backend; crash fingerprints
            // degrade to the shallow-stack form.
            frames: Vec::new(),
            fault_addr: 0,
            counters,
            report: Vec::new(),
        }
    }
}

/// Target argv with the input path substituted for the placeholder token.
/// In stdin mode the input travels over stdin and the argv is left alone;
/// validation rejects the placeholder there anyway.
fn build_argv(cfg: &Config, input: &Path) -> Vec<String> {
    cfg.cmdline
        .iter()
        .map(|tok| {
            if !cfg.fuzz_stdin && tok == FILE_PLACEHOLDER {
                input.display().to_string()
            } else {
                tok.clone()
            }
        })
        .collect()
}
