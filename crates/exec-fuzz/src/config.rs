//! Immutable run configuration.
//!
//! A [`Config`] is assembled once (by the CLI or by a test), validated with
//! [`Config::validate`], and then only ever shared by reference. All mutable
//! run state lives in [`crate::feedback::FeedbackStore`] and
//! [`crate::tallies::Tallies`].

use std::{path::PathBuf, time::Duration};

use bitflags::bitflags;
use tracing::warn;

/// Token in the target command line that is replaced with the path of the
/// current input file.
pub const FILE_PLACEHOLDER: &str = "___FILE___";

/// Name of the on-disk best dynamic seed inside the workspace.
pub const CURRENT_BEST: &str = "CURRENT_BEST";

/// Staging name the best seed is written to before the atomic rename.
pub const CURRENT_BEST_TMP: &str = ".tmp.CURRENT_BEST";

/// Default textual report file inside the workspace.
pub const REPORT_FILE: &str = "REPORT.TXT";

/// Scratch directory for sanitizer-coverage dumps inside the workspace.
pub const SANCOV_DIR: &str = "SANCOV";

bitflags! {
    /// Which runtime counters drive the dynamic-feedback loop.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct DynFileMethod: u32 {
        const INSTR_COUNT = 1 << 0;
        const BRANCH_COUNT = 1 << 1;
        const UNIQUE_BLOCK = 1 << 2;
        const UNIQUE_EDGE = 1 << 3;
        const CUSTOM = 1 << 4;
    }
}

/// How the input for one iteration is produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrepStrategy {
    /// Mutate a randomly picked seed file.
    Static,
    /// Mutate the shared best seed, guided by runtime counters.
    Dynamic,
    /// Delegate input generation to an external command.
    External,
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Target argv. May contain at most one [`FILE_PLACEHOLDER`] token.
    pub cmdline: Vec<String>,
    /// Seed file, or directory of seed files. May be absent in dynamic and
    /// external modes.
    pub input_path: Option<PathBuf>,
    /// Workspace directory for temp inputs, crashes, the best seed and the
    /// report.
    pub work_dir: PathBuf,
    /// Extension for generated input files.
    pub file_extn: String,
    /// Upper bound on input size, in bytes.
    pub max_file_sz: usize,
    /// Fraction of input bytes the mutator touches per iteration, in [0, 1].
    pub flip_rate: f64,
    /// Number of worker threads.
    pub threads_max: usize,
    /// Total mutation budget; 0 means unbounded.
    pub mutations_max: u64,
    /// Per-run wall-clock budget for the target.
    pub timeout: Duration,
    /// Feed the input to the target over stdin instead of a file argument.
    pub fuzz_stdin: bool,
    /// Attach the target's stdio to /dev/null.
    pub null_stdio: bool,
    /// Keep only one crash file per stack fingerprint.
    pub save_unique: bool,
    /// Re-run each fresh crash to check that it reproduces.
    pub verifier: bool,
    /// Try to shrink each fresh unique crash input.
    pub simplifier: bool,
    /// Ask the target runner to capture /proc/<pid>/maps into the report.
    pub proc_maps: bool,
    /// Run the target with ASLR disabled so fingerprints are stable.
    pub disable_randomization: bool,
    /// Counter selection for dynamic feedback; empty disables it.
    pub dyn_file_method: DynFileMethod,
    /// Sanitizer-coverage feedback. Mutually exclusive with
    /// `dyn_file_method`.
    pub sancov: bool,
    /// External mutator command, invoked as `<cmd> <input_path>`.
    pub external_command: Option<PathBuf>,
    /// Tokens the mutator may splice into inputs.
    pub dictionary: Vec<Vec<u8>>,
    /// Sorted stack fingerprints of crashes that must not be persisted.
    pub stackhash_blacklist: Vec<u64>,
    /// Crashes whose frames resolve to one of these symbols are dropped.
    pub symbol_blacklist: Vec<String>,
    /// When non-empty, only crashes touching one of these symbols are kept.
    pub symbol_whitelist: Vec<String>,
    /// Extra environment for the target process.
    pub envs: Vec<(String, String)>,
    /// Report destination; defaults to [`REPORT_FILE`] under `work_dir`.
    pub report_path: Option<PathBuf>,
    /// Fuzz a live process instead of launching one (capability-dependent).
    pub attach_pid: Option<i32>,
    /// Like `attach_pid`, with the pid read from a file.
    pub attach_pid_file: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cmdline: Vec::new(),
            input_path: None,
            work_dir: PathBuf::from("."),
            file_extn: "fuzz".to_owned(),
            max_file_sz: 1024 * 1024,
            flip_rate: 0.001,
            threads_max: 1,
            mutations_max: 0,
            timeout: Duration::from_secs(10),
            fuzz_stdin: false,
            null_stdio: false,
            save_unique: true,
            verifier: false,
            simplifier: false,
            proc_maps: false,
            disable_randomization: true,
            dyn_file_method: DynFileMethod::empty(),
            sancov: false,
            external_command: None,
            dictionary: Vec::new(),
            stackhash_blacklist: Vec::new(),
            symbol_blacklist: Vec::new(),
            symbol_whitelist: Vec::new(),
            envs: Vec::new(),
            report_path: None,
            attach_pid: None,
            attach_pid_file: None,
        }
    }
}

impl Config {
    /// Whether any runtime feedback source is active.
    pub fn feedback_enabled(&self) -> bool {
        !self.dyn_file_method.is_empty() || self.sancov
    }

    /// The single preparation strategy governing this run.
    pub fn strategy(&self) -> PrepStrategy {
        if self.external_command.is_some() {
            PrepStrategy::External
        } else if self.feedback_enabled() {
            PrepStrategy::Dynamic
        } else {
            PrepStrategy::Static
        }
    }

    /// Where crash reports are appended.
    pub fn report_path(&self) -> PathBuf {
        self.report_path
            .clone()
            .unwrap_or_else(|| self.work_dir.join(REPORT_FILE))
    }

    /// Number of [`FILE_PLACEHOLDER`] tokens in the target argv.
    pub fn placeholder_count(&self) -> usize {
        self.cmdline
            .iter()
            .filter(|tok| tok.as_str() == FILE_PLACEHOLDER)
            .count()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cmdline.is_empty() {
            return Err(ConfigError::EmptyCmdline);
        }
        if self.placeholder_count() > 1 {
            return Err(ConfigError::MultiplePlaceholders);
        }
        if self.fuzz_stdin && self.placeholder_count() > 0 {
            return Err(ConfigError::PlaceholderWithStdin);
        }
        if !self.fuzz_stdin && self.placeholder_count() == 0 {
            warn!(
                "target command line has no {FILE_PLACEHOLDER} token and stdin fuzzing is off; \
                 the target will not see the input"
            );
        }
        if !(0.0..=1.0).contains(&self.flip_rate) {
            return Err(ConfigError::FlipRateOutOfRange(self.flip_rate));
        }
        if self.threads_max == 0 {
            return Err(ConfigError::NoThreads);
        }
        if self.max_file_sz == 0 {
            return Err(ConfigError::ZeroMaxFileSize);
        }
        if self.timeout.is_zero() {
            return Err(ConfigError::ZeroTimeout);
        }
        if !self.dyn_file_method.is_empty() && self.sancov {
            return Err(ConfigError::FeedbackModeConflict);
        }
        if self.external_command.is_some() && self.feedback_enabled() {
            return Err(ConfigError::ExternalWithFeedback);
        }
        if self.input_path.is_none() && self.strategy() == PrepStrategy::Static {
            return Err(ConfigError::NoInput);
        }
        if (self.attach_pid.is_some() || self.attach_pid_file.is_some()) && self.threads_max != 1 {
            return Err(ConfigError::AttachNeedsOneThread);
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("no target command line given")]
    EmptyCmdline,
    #[error("more than one {FILE_PLACEHOLDER} token in the target command line")]
    MultiplePlaceholders,
    #[error("stdin fuzzing cannot be combined with a {FILE_PLACEHOLDER} token in the target command line")]
    PlaceholderWithStdin,
    #[error("flip rate {0} is outside [0.0, 1.0]")]
    FlipRateOutOfRange(f64),
    #[error("thread count must be at least 1")]
    NoThreads,
    #[error("maximum file size must be at least 1 byte")]
    ZeroMaxFileSize,
    #[error("per-run timeout must be non-zero")]
    ZeroTimeout,
    #[error("hardware-counter feedback and sanitizer coverage are mutually exclusive")]
    FeedbackModeConflict,
    #[error("an external mutator command cannot be combined with dynamic feedback")]
    ExternalWithFeedback,
    #[error("no input corpus given and no dynamic or external mode to replace it")]
    NoInput,
    #[error("attaching to a process requires a single worker thread")]
    AttachNeedsOneThread,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Config {
        Config {
            cmdline: vec!["/bin/true".to_owned(), FILE_PLACEHOLDER.to_owned()],
            input_path: Some(PathBuf::from("/dev/null")),
            ..Config::default()
        }
    }

    #[test]
    fn accepts_minimal_static_config() {
        base().validate().unwrap();
    }

    #[test]
    fn rejects_empty_cmdline() {
        let cfg = Config {
            cmdline: Vec::new(),
            ..base()
        };
        assert!(matches!(cfg.validate(), Err(ConfigError::EmptyCmdline)));
    }

    #[test]
    fn rejects_double_placeholder() {
        let mut cfg = base();
        cfg.cmdline.push(FILE_PLACEHOLDER.to_owned());
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::MultiplePlaceholders)
        ));
    }

    #[test]
    fn rejects_placeholder_with_stdin_fuzzing() {
        let cfg = Config {
            fuzz_stdin: true,
            ..base()
        };
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::PlaceholderWithStdin)
        ));
    }

    #[test]
    fn rejects_static_mode_without_input() {
        let cfg = Config {
            input_path: None,
            ..base()
        };
        assert!(matches!(cfg.validate(), Err(ConfigError::NoInput)));
    }

    #[test]
    fn dynamic_mode_needs_no_input() {
        let cfg = Config {
            input_path: None,
            dyn_file_method: DynFileMethod::INSTR_COUNT,
            ..base()
        };
        cfg.validate().unwrap();
        assert_eq!(cfg.strategy(), PrepStrategy::Dynamic);
    }

    #[test]
    fn sancov_conflicts_with_counters() {
        let cfg = Config {
            sancov: true,
            dyn_file_method: DynFileMethod::BRANCH_COUNT,
            ..base()
        };
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::FeedbackModeConflict)
        ));
    }

    #[test]
    fn external_command_wins_strategy_selection() {
        let cfg = Config {
            external_command: Some(PathBuf::from("/bin/false")),
            ..base()
        };
        assert_eq!(cfg.strategy(), PrepStrategy::External);
    }
}
