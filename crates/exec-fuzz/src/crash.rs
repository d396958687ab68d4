//! Crash classification: from an observation to a not-a-crash / blacklisted /
//! duplicate / saved decision, plus the optional verify and simplify stages.

use std::{
    io::{self, ErrorKind, Write},
    path::{Path, PathBuf},
    sync::atomic::Ordering,
};

use libafl_bolts::{current_time, rands::StdRand};
use nix::sys::signal::Signal;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
    config::Config,
    exec::{is_crash_signal, Frame, Observation, RunStatus, Target, TargetError},
    prepare::TempInput,
    report::Reporter,
    tallies::Tallies,
};

/// Re-runs required before a crash counts as verified.
pub const VERIFIER_ITER: usize = 5;

/// Failed shrink attempts the simplifier tolerates before giving up.
const SIMPLIFY_ATTEMPT_BUDGET: usize = 30;

/// Frames that contribute to the stack fingerprint.
const STACK_FRAMES_HASHED: usize = 7;

/// OR-ed into fingerprints built from at most one frame, so shallow crashes
/// never collide with deep ones.
const SHALLOW_STACK_MARK: u64 = 0xBADBAD0000000000;

/// 64-bit fingerprint of the innermost crash frames.
pub fn stack_fingerprint(frames: &[Frame]) -> u64 {
    const FNV_OFFSET: u64 = 0xcbf29ce484222325;
    const FNV_PRIME: u64 = 0x100000001b3;
    let mut hash = FNV_OFFSET;
    for frame in frames.iter().take(STACK_FRAMES_HASHED) {
        for byte in frame.pc.to_le_bytes() {
            hash ^= u64::from(byte);
            hash = hash.wrapping_mul(FNV_PRIME);
        }
    }
    if frames.len() <= 1 {
        hash |= SHALLOW_STACK_MARK;
    }
    hash
}

/// Outcome of classifying one observation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    NotACrash,
    Timeout,
    /// Dropped by the stack-hash or symbol lists.
    Blacklisted,
    /// Same fingerprint already on disk.
    Duplicate,
    /// Persisted under the returned path.
    Saved(PathBuf),
}

#[derive(Debug)]
pub(crate) struct Classifier<'a> {
    pub cfg: &'a Config,
    pub tallies: &'a Tallies,
    pub target: &'a dyn Target,
    pub reporter: &'a dyn Reporter,
}

impl Classifier<'_> {
    /// Decide what `obs` was and persist it if it is a fresh crash.
    pub fn classify(
        &self,
        rand: &mut StdRand,
        obs: &Observation,
        input_bytes: &[u8],
        seed_name: &str,
    ) -> Result<Verdict, CrashError> {
        if obs.status == RunStatus::Timeout {
            self.tallies.timeouts.fetch_add(1, Ordering::Relaxed);
            return Ok(Verdict::Timeout);
        }
        let sig = match obs.status {
            RunStatus::Signaled(sig) if is_crash_signal(sig) => sig,
            _ => return Ok(Verdict::NotACrash),
        };
        self.tallies.crashes.fetch_add(1, Ordering::Relaxed);

        let fingerprint = stack_fingerprint(&obs.frames);
        if self
            .cfg
            .stackhash_blacklist
            .binary_search(&fingerprint)
            .is_ok()
        {
            self.tallies
                .blacklisted_crashes
                .fetch_add(1, Ordering::Relaxed);
            debug!("blacklisted stack hash {fingerprint:x}");
            return Ok(Verdict::Blacklisted);
        }
        if self.dropped_by_symbol_lists(&obs.frames) {
            self.tallies
                .blacklisted_crashes
                .fetch_add(1, Ordering::Relaxed);
            return Ok(Verdict::Blacklisted);
        }

        let path = self
            .cfg
            .work_dir
            .join(self.crash_file_name(sig, obs, fingerprint));
        match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(mut file) => file.write_all(input_bytes).map_err(|source| {
                CrashError::Persist {
                    path: path.display().to_string(),
                    source,
                }
            })?,
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                return Ok(Verdict::Duplicate);
            }
            Err(source) => {
                return Err(CrashError::Persist {
                    path: path.display().to_string(),
                    source,
                });
            }
        }
        if self.cfg.save_unique {
            self.tallies.unique_crashes.fetch_add(1, Ordering::Relaxed);
        }
        info!(signal = %sig, path = %path.display(), "crash saved, stack hash {fingerprint:x}");

        let blob = self.render_report(seed_name, &path, obs, sig, fingerprint);
        self.reporter
            .report(self.cfg, &blob)
            .map_err(CrashError::Report)?;

        if self.cfg.verifier {
            if self.verify(&path, sig, fingerprint)? {
                self.tallies
                    .verified_crashes
                    .fetch_add(1, Ordering::Relaxed);
            } else {
                warn!(path = %path.display(), "crash did not reproduce consistently");
            }
        }
        if self.cfg.simplifier {
            self.simplify(rand, &path, input_bytes, sig, fingerprint)?;
        }
        Ok(Verdict::Saved(path))
    }

    fn dropped_by_symbol_lists(&self, frames: &[Frame]) -> bool {
        let symbols: Vec<&str> = frames.iter().filter_map(|f| f.symbol.as_deref()).collect();
        if symbols
            .iter()
            .any(|sym| self.cfg.symbol_blacklist.iter().any(|bad| bad == sym))
        {
            debug!("crash dropped by symbol blacklist");
            return true;
        }
        // The whitelist can only be judged when the backend resolved symbols
        // at all.
        if !self.cfg.symbol_whitelist.is_empty()
            && !symbols.is_empty()
            && !symbols
                .iter()
                .any(|sym| self.cfg.symbol_whitelist.iter().any(|good| good == sym))
        {
            debug!("crash outside the symbol whitelist");
            return true;
        }
        false
    }

    fn crash_file_name(&self, sig: Signal, obs: &Observation, fingerprint: u64) -> String {
        let base = format!(
            "SIG{}.PC.{:x}.STACK.{:x}.ADDR.{:x}",
            sig as i32,
            obs.crashing_pc(),
            fingerprint,
            obs.fault_addr
        );
        if self.cfg.save_unique {
            format!("{base}.{}", self.cfg.file_extn)
        } else {
            format!(
                "{base}.TIME.{}.{}",
                current_time().as_secs(),
                self.cfg.file_extn
            )
        }
    }

    fn render_report(
        &self,
        seed_name: &str,
        crash_path: &Path,
        obs: &Observation,
        sig: Signal,
        fingerprint: u64,
    ) -> Vec<u8> {
        let mut blob = format!(
            "=====================================================\n\
             TIME: {}\n\
             SEED: {seed_name}\n\
             CRASH: {}\n\
             PID: {}\n\
             SIGNAL: {sig}\n\
             PC: 0x{:x}\n\
             STACK HASH: 0x{fingerprint:016x}\n\
             FAULT ADDRESS: 0x{:x}\n",
            current_time().as_secs(),
            crash_path.display(),
            obs.pid,
            obs.crashing_pc(),
            obs.fault_addr,
        )
        .into_bytes();
        if !obs.report.is_empty() {
            blob.extend_from_slice(&obs.report);
        }
        blob
    }

    /// Re-run the persisted crash input and require the same signal and
    /// fingerprint on every iteration.
    fn verify(&self, crash_path: &Path, sig: Signal, fingerprint: u64) -> Result<bool, CrashError> {
        for round in 0..VERIFIER_ITER {
            let obs = self.target.execute(self.cfg, crash_path)?;
            let reproduced = matches!(obs.status, RunStatus::Signaled(s) if s == sig)
                && stack_fingerprint(&obs.frames) == fingerprint;
            if !reproduced {
                debug!(round, "verifier divergence");
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Shrink the crash input while the signal and fingerprint are preserved:
    /// tail truncation in halving steps, then chunk zeroing. The crash file
    /// is rewritten when anything was won.
    fn simplify(
        &self,
        rand: &mut StdRand,
        crash_path: &Path,
        original: &[u8],
        sig: Signal,
        fingerprint: u64,
    ) -> Result<(), CrashError> {
        let mut best = original.to_vec();
        let mut failures = 0usize;

        let mut step = best.len() / 2;
        while step > 0 && failures < SIMPLIFY_ATTEMPT_BUDGET {
            if best.len() > step {
                let candidate = best[..best.len() - step].to_vec();
                if self.reproduces(rand, &candidate, sig, fingerprint)? {
                    best = candidate;
                    continue;
                }
            }
            failures += 1;
            step /= 2;
        }

        let mut chunk = (best.len() / 2).max(1);
        'zeroing: loop {
            let mut offset = 0;
            while offset < best.len() {
                let end = (offset + chunk).min(best.len());
                if best[offset..end].iter().any(|&b| b != 0) {
                    let mut candidate = best.clone();
                    candidate[offset..end].fill(0);
                    if self.reproduces(rand, &candidate, sig, fingerprint)? {
                        best = candidate;
                    } else {
                        failures += 1;
                        if failures >= SIMPLIFY_ATTEMPT_BUDGET {
                            break 'zeroing;
                        }
                    }
                }
                offset = end;
            }
            if chunk == 1 {
                break;
            }
            chunk /= 2;
        }

        if best != original {
            std::fs::write(crash_path, &best).map_err(|source| CrashError::Persist {
                path: crash_path.display().to_string(),
                source,
            })?;
            info!(
                from = original.len(),
                to = best.len(),
                path = %crash_path.display(),
                "crash input simplified"
            );
        }
        Ok(())
    }

    fn reproduces(
        &self,
        rand: &mut StdRand,
        candidate: &[u8],
        sig: Signal,
        fingerprint: u64,
    ) -> Result<bool, CrashError> {
        let tmp = TempInput::write_new(self.cfg, rand, candidate).map_err(CrashError::SimplifyIo)?;
        let obs = self.target.execute(self.cfg, tmp.path())?;
        Ok(matches!(obs.status, RunStatus::Signaled(s) if s == sig)
            && stack_fingerprint(&obs.frames) == fingerprint)
    }
}

#[derive(Debug, Error)]
pub enum CrashError {
    #[error("persisting crash file {path}: {source}")]
    Persist {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("writing crash report: {0}")]
    Report(#[source] io::Error),
    #[error("re-running crash input: {0}")]
    Rerun(#[from] TargetError),
    #[error("simplifier temp input: {0}")]
    SimplifyIo(#[source] io::Error),
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use libafl_bolts::{current_nanos, rands::Rand};

    use super::*;
    use crate::{feedback::Counters, report::NullReporter};

    fn obs_with(status: RunStatus, frames: Vec<Frame>) -> Observation {
        Observation {
            pid: 4242,
            wall_ms: 1,
            status,
            frames,
            fault_addr: 0x1000,
            counters: Counters::default(),
            report: Vec::new(),
        }
    }

    fn segv_obs() -> Observation {
        obs_with(
            RunStatus::Signaled(Signal::SIGSEGV),
            vec![Frame::pc(0xdead), Frame::pc(0xbeef)],
        )
    }

    /// Replays a fixed script of observations, then repeats the last one.
    #[derive(Debug)]
    struct ScriptTarget {
        script: Mutex<Vec<Observation>>,
        last: Observation,
    }

    impl ScriptTarget {
        fn repeating(obs: Observation) -> Self {
            Self {
                script: Mutex::new(Vec::new()),
                last: obs,
            }
        }

        fn with_script(script: Vec<Observation>, last: Observation) -> Self {
            Self {
                script: Mutex::new(script),
                last,
            }
        }
    }

    impl Target for ScriptTarget {
        fn execute(&self, _cfg: &Config, _input: &Path) -> Result<Observation, TargetError> {
            let mut script = self.script.lock().unwrap();
            if script.is_empty() {
                Ok(self.last.clone())
            } else {
                Ok(script.remove(0))
            }
        }
    }

    /// Crashes iff the input file contains an `A` byte.
    #[derive(Debug)]
    struct NeedleTarget;

    impl Target for NeedleTarget {
        fn execute(&self, cfg: &Config, input: &Path) -> Result<Observation, TargetError> {
            let bytes = std::fs::read(input).map_err(TargetError::Io)?;
            if bytes.contains(&b'A') {
                Ok(segv_obs())
            } else {
                Ok(obs_with(RunStatus::Exited(0), Vec::new()))
            }
        }
    }

    struct Fixture {
        cfg: Config,
        tallies: Tallies,
        _dir: tempfile::TempDir,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let cfg = Config {
                cmdline: vec!["/bin/true".to_owned()],
                work_dir: dir.path().to_path_buf(),
                ..Config::default()
            };
            Self {
                cfg,
                tallies: Tallies::default(),
                _dir: dir,
            }
        }

        fn classify(
            &self,
            target: &dyn Target,
            obs: &Observation,
            input: &[u8],
        ) -> Result<Verdict, CrashError> {
            let classifier = Classifier {
                cfg: &self.cfg,
                tallies: &self.tallies,
                target,
                reporter: &NullReporter,
            };
            let mut rand = StdRand::with_seed(current_nanos());
            classifier.classify(&mut rand, obs, input, "seed")
        }

        fn crash_files(&self) -> Vec<String> {
            let mut names: Vec<String> = std::fs::read_dir(&self.cfg.work_dir)
                .unwrap()
                .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
                .filter(|n| n.starts_with("SIG"))
                .collect();
            names.sort();
            names
        }
    }

    #[test]
    fn shallow_fingerprints_are_marked() {
        let deep = stack_fingerprint(&[Frame::pc(1), Frame::pc(2)]);
        let shallow = stack_fingerprint(&[Frame::pc(1)]);
        let empty = stack_fingerprint(&[]);
        assert_eq!(shallow & SHALLOW_STACK_MARK, SHALLOW_STACK_MARK);
        assert_eq!(empty & SHALLOW_STACK_MARK, SHALLOW_STACK_MARK);
        assert_ne!(deep & SHALLOW_STACK_MARK, SHALLOW_STACK_MARK);
        assert_ne!(deep, stack_fingerprint(&[Frame::pc(2), Frame::pc(1)]));
    }

    #[test]
    fn clean_exit_is_not_a_crash() {
        let fx = Fixture::new();
        let target = ScriptTarget::repeating(obs_with(RunStatus::Exited(1), Vec::new()));
        let verdict = fx
            .classify(&target, &obs_with(RunStatus::Exited(1), Vec::new()), b"x")
            .unwrap();
        assert_eq!(verdict, Verdict::NotACrash);
        assert_eq!(fx.tallies.snapshot().crashes, 0);
    }

    #[test]
    fn timeout_bumps_only_the_timeout_tally() {
        let fx = Fixture::new();
        let target = ScriptTarget::repeating(segv_obs());
        let verdict = fx
            .classify(&target, &obs_with(RunStatus::Timeout, Vec::new()), b"x")
            .unwrap();
        assert_eq!(verdict, Verdict::Timeout);
        let snap = fx.tallies.snapshot();
        assert_eq!(snap.timeouts, 1);
        assert_eq!(snap.crashes, 0);
    }

    #[test]
    fn fresh_crash_is_persisted_with_input_bytes() {
        let fx = Fixture::new();
        let target = ScriptTarget::repeating(segv_obs());
        let verdict = fx.classify(&target, &segv_obs(), b"boom").unwrap();
        let Verdict::Saved(path) = verdict else {
            panic!("expected Saved, got {verdict:?}");
        };
        assert_eq!(std::fs::read(&path).unwrap(), b"boom");
        let name = path.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with(&format!("SIG{}.PC.", Signal::SIGSEGV as i32)));
        assert!(name.contains("STACK."));
        let snap = fx.tallies.snapshot();
        assert_eq!(snap.crashes, 1);
        assert_eq!(snap.unique_crashes, 1);
    }

    #[test]
    fn same_fingerprint_is_a_duplicate() {
        let fx = Fixture::new();
        let target = ScriptTarget::repeating(segv_obs());
        fx.classify(&target, &segv_obs(), b"one").unwrap();
        let verdict = fx.classify(&target, &segv_obs(), b"two").unwrap();
        assert_eq!(verdict, Verdict::Duplicate);
        let snap = fx.tallies.snapshot();
        assert_eq!(snap.crashes, 2);
        assert_eq!(snap.unique_crashes, 1);
        assert_eq!(fx.crash_files().len(), 1);
    }

    #[test]
    fn save_all_keeps_every_crash_site() {
        let mut fx = Fixture::new();
        fx.cfg.save_unique = false;
        let deep = segv_obs();
        let shallow = obs_with(
            RunStatus::Signaled(Signal::SIGSEGV),
            vec![Frame::pc(0x1234)],
        );
        let target = ScriptTarget::repeating(deep.clone());
        fx.classify(&target, &deep, b"one").unwrap();
        fx.classify(&target, &shallow, b"two").unwrap();
        let files = fx.crash_files();
        assert_eq!(files.len(), 2);
        assert!(files.iter().all(|name| name.contains(".TIME.")));
        assert_eq!(fx.tallies.snapshot().unique_crashes, 0);
    }

    #[test]
    fn blacklisted_fingerprint_is_dropped() {
        let mut fx = Fixture::new();
        let fp = stack_fingerprint(&segv_obs().frames);
        fx.cfg.stackhash_blacklist = vec![fp];
        let target = ScriptTarget::repeating(segv_obs());
        let verdict = fx.classify(&target, &segv_obs(), b"x").unwrap();
        assert_eq!(verdict, Verdict::Blacklisted);
        let snap = fx.tallies.snapshot();
        assert_eq!(snap.crashes, 1);
        assert_eq!(snap.blacklisted_crashes, 1);
        assert_eq!(snap.unique_crashes, 0);
        assert!(fx.crash_files().is_empty());
    }

    #[test]
    fn symbol_blacklist_drops_resolved_frames() {
        let mut fx = Fixture::new();
        fx.cfg.symbol_blacklist = vec!["known_noise".to_owned()];
        let mut obs = segv_obs();
        obs.frames[0].symbol = Some("known_noise".to_owned());
        let target = ScriptTarget::repeating(obs.clone());
        let verdict = fx.classify(&target, &obs, b"x").unwrap();
        assert_eq!(verdict, Verdict::Blacklisted);
        assert_eq!(fx.tallies.snapshot().blacklisted_crashes, 1);
    }

    #[test]
    fn verifier_counts_stable_reproductions() {
        let mut fx = Fixture::new();
        fx.cfg.verifier = true;
        let target = ScriptTarget::repeating(segv_obs());
        fx.classify(&target, &segv_obs(), b"x").unwrap();
        assert_eq!(fx.tallies.snapshot().verified_crashes, 1);
    }

    #[test]
    fn verifier_rejects_flaky_crashes() {
        let mut fx = Fixture::new();
        fx.cfg.verifier = true;
        let target = ScriptTarget::with_script(
            vec![segv_obs(), obs_with(RunStatus::Exited(0), Vec::new())],
            obs_with(RunStatus::Exited(0), Vec::new()),
        );
        fx.classify(&target, &segv_obs(), b"x").unwrap();
        assert_eq!(fx.tallies.snapshot().verified_crashes, 0);
    }

    #[test]
    fn simplifier_shrinks_while_preserving_the_crash() {
        let mut fx = Fixture::new();
        fx.cfg.simplifier = true;
        let input: Vec<u8> = {
            let mut v = vec![b'x'; 63];
            v.push(b'A');
            v
        };
        let verdict = fx.classify(&NeedleTarget, &segv_obs(), &input).unwrap();
        let Verdict::Saved(path) = verdict else {
            panic!("expected Saved");
        };
        let simplified = std::fs::read(&path).unwrap();
        assert!(simplified.len() <= input.len());
        assert!(simplified.contains(&b'A'));
        assert!(simplified.iter().filter(|&&b| b == b'x').count() < 63);
    }
}
