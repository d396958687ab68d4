use std::{cmp::max, fs::File, path::PathBuf, sync::Arc, time::Duration};

use anyhow::{bail, Context};
use exec_fuzz::{
    config::{Config, DynFileMethod},
    engine::{Engine, ExitReason},
    files,
};
use tracing::{info, level_filters::LevelFilter};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Coverage-guided fuzzer for standalone executables.
///
/// The target command line goes after `--` and may contain one `___FILE___`
/// token that is replaced with the path of the generated input.
#[derive(Debug, clap::Parser)]
#[command(about, max_term_width = 100)]
pub struct Cli {
    /// Seed file or directory of seed files.
    #[clap(short = 'f', long)]
    input: Option<PathBuf>,

    /// Attach the target's stdio to /dev/null.
    #[clap(short = 'q', long)]
    null_stdio: bool,

    /// Feed inputs to the target over stdin instead of a file argument.
    #[clap(short = 's', long)]
    stdin_input: bool,

    /// Save every crash instead of one per unique stack hash.
    #[clap(short = 'u', long)]
    save_all: bool,

    /// Write logs to this file instead of stderr.
    #[clap(short = 'l', long)]
    logfile: Option<PathBuf>,

    /// Debug-level logging.
    #[clap(short = 'v', long)]
    verbose: bool,

    /// Re-run each fresh crash and only count it verified when it
    /// reproduces consistently.
    #[clap(short = 'V', long)]
    verifier: bool,

    /// Capture /proc/<pid>/maps into crash reports (backend permitting).
    #[clap(short = 'M', long)]
    proc_maps: bool,

    /// Shrink fresh unique crash inputs after saving them.
    #[clap(short = 'S', long)]
    simplifier: bool,

    /// Log level 0-4 (error..trace); overrides -v.
    #[clap(short = 'd', long)]
    debug_level: Option<u8>,

    /// Extension for generated input files.
    #[clap(short = 'e', long, default_value = "fuzz")]
    extension: String,

    /// Workspace directory for temp inputs, crashes and reports.
    #[clap(short = 'W', long, default_value = ".")]
    workspace: PathBuf,

    /// Fraction of input bytes mutated per iteration.
    #[clap(short = 'r', long, default_value_t = 0.001)]
    flip_rate: f64,

    /// Dictionary of tokens spliced into inputs.
    #[clap(short = 'w', long)]
    wordlist: Option<PathBuf>,

    /// File of symbol names whose crashes are ignored.
    #[clap(short = 'b', long)]
    symbols_blacklist: Option<PathBuf>,

    /// File of symbol names; crashes touching none of them are ignored.
    #[clap(short = 'A', long)]
    symbols_whitelist: Option<PathBuf>,

    /// File of 64-bit stack hashes to ignore.
    #[clap(short = 'B', long)]
    stackhash_blacklist: Option<PathBuf>,

    /// External command producing each input, invoked as `<cmd> <path>`.
    #[clap(short = 'c', long)]
    mutate_cmd: Option<PathBuf>,

    /// Per-run timeout in seconds.
    #[clap(short = 't', long, default_value_t = 10)]
    timeout: u64,

    /// Worker threads; defaults to half the CPUs.
    #[clap(short = 'n', long)]
    threads: Option<usize>,

    /// Total iteration budget; 0 fuzzes until interrupted.
    #[clap(short = 'N', long, default_value_t = 0)]
    iterations: u64,

    /// Maximum input size in bytes.
    #[clap(short = 'F', long, default_value_t = 1024 * 1024)]
    max_file_size: usize,

    /// Crash report file; defaults to REPORT.TXT in the workspace.
    #[clap(short = 'R', long)]
    report: Option<PathBuf>,

    /// KEY=VALUE environment for the target; repeatable.
    #[clap(short = 'E', long = "env", value_parser = parse_env_pair)]
    env: Vec<(String, String)>,

    /// Sanitizer-coverage feedback.
    #[clap(short = 'C', long)]
    sancov: bool,

    /// Fuzz a live process by pid (backend permitting).
    #[clap(short = 'p', long)]
    linux_pid: Option<i32>,

    /// Like -p, reading the pid from a file.
    #[clap(short = 'P', long)]
    linux_file_pid: Option<PathBuf>,

    /// Feedback on retired instructions.
    #[clap(long)]
    linux_perf_instr: bool,

    /// Feedback on retired branches.
    #[clap(long)]
    linux_perf_branch: bool,

    /// Feedback on unique visited blocks.
    #[clap(long)]
    linux_perf_ip: bool,

    /// Feedback on unique taken edges.
    #[clap(long)]
    linux_perf_ip_addr: bool,

    /// Capability-defined custom counter.
    #[clap(long)]
    linux_perf_custom: bool,

    /// Target command line.
    #[clap(last = true, required = true)]
    cmdline: Vec<String>,
}

impl Cli {
    pub(super) fn run(self) -> anyhow::Result<()> {
        setup_logger(&self).context("Setting up logger")?;
        let cfg = self.into_config().context("Assembling configuration")?;
        let engine = Engine::with_defaults(cfg).context("Initializing engine")?;
        let summary = engine.run().context("Fuzzing run failed")?;
        let tallies = summary.tallies;
        info!(
            iterations = tallies.mutations,
            crashes = tallies.crashes,
            unique = tallies.unique_crashes,
            verified = tallies.verified_crashes,
            blacklisted = tallies.blacklisted_crashes,
            timeouts = tallies.timeouts,
            "fuzzing finished"
        );
        if let ExitReason::Signalled(sig) = summary.exit {
            info!(signal = %sig, "stopped by signal");
        }
        Ok(())
    }

    fn into_config(self) -> anyhow::Result<Config> {
        let mut dyn_file_method = DynFileMethod::empty();
        for (on, flag) in [
            (self.linux_perf_instr, DynFileMethod::INSTR_COUNT),
            (self.linux_perf_branch, DynFileMethod::BRANCH_COUNT),
            (self.linux_perf_ip, DynFileMethod::UNIQUE_BLOCK),
            (self.linux_perf_ip_addr, DynFileMethod::UNIQUE_EDGE),
            (self.linux_perf_custom, DynFileMethod::CUSTOM),
        ] {
            if on {
                dyn_file_method |= flag;
            }
        }

        let dictionary = self
            .wordlist
            .as_deref()
            .map(files::parse_dictionary)
            .transpose()
            .context("Loading dictionary")?
            .unwrap_or_default();
        let stackhash_blacklist = self
            .stackhash_blacklist
            .as_deref()
            .map(files::parse_stackhash_blacklist)
            .transpose()
            .context("Loading stack-hash blacklist")?
            .unwrap_or_default();
        let symbol_blacklist = self
            .symbols_blacklist
            .as_deref()
            .map(files::parse_symbol_list)
            .transpose()
            .context("Loading symbol blacklist")?
            .unwrap_or_default();
        let symbol_whitelist = self
            .symbols_whitelist
            .as_deref()
            .map(files::parse_symbol_list)
            .transpose()
            .context("Loading symbol whitelist")?
            .unwrap_or_default();

        let threads_max = self
            .threads
            .unwrap_or_else(|| max(1, num_cpus::get() / 2));

        Ok(Config {
            cmdline: self.cmdline,
            input_path: self.input,
            work_dir: self.workspace,
            file_extn: self.extension,
            max_file_sz: self.max_file_size,
            flip_rate: self.flip_rate,
            threads_max,
            mutations_max: self.iterations,
            timeout: Duration::from_secs(self.timeout),
            fuzz_stdin: self.stdin_input,
            null_stdio: self.null_stdio,
            save_unique: !self.save_all,
            verifier: self.verifier,
            simplifier: self.simplifier,
            proc_maps: self.proc_maps,
            dyn_file_method,
            sancov: self.sancov,
            external_command: self.mutate_cmd,
            dictionary,
            stackhash_blacklist,
            symbol_blacklist,
            symbol_whitelist,
            envs: self.env,
            report_path: self.report,
            attach_pid: self.linux_pid,
            attach_pid_file: self.linux_file_pid,
            ..Config::default()
        })
    }
}

fn setup_logger(cli: &Cli) -> anyhow::Result<()> {
    let level = match cli.debug_level {
        Some(0) => LevelFilter::ERROR,
        Some(1) => LevelFilter::WARN,
        Some(2) => LevelFilter::INFO,
        Some(3) => LevelFilter::DEBUG,
        Some(_) => LevelFilter::TRACE,
        None if cli.verbose => LevelFilter::DEBUG,
        None => LevelFilter::INFO,
    };
    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env()
        .context("Constructing log filter from env.")?;
    match &cli.logfile {
        Some(path) => {
            let file = File::create(path)
                .with_context(|| format!("Opening log file {}", path.display()))?;
            tracing_subscriber::registry()
                .with(fmt::layer().with_writer(Arc::new(file)).with_ansi(false))
                .with(filter)
                .init();
        }
        None => {
            tracing_subscriber::registry()
                .with(fmt::layer())
                .with(filter)
                .init();
        }
    }
    Ok(())
}

fn parse_env_pair(s: &str) -> Result<(String, String), anyhow::Error> {
    let Some((key, value)) = s.split_once('=') else {
        bail!("expected KEY=VALUE");
    };
    if key.is_empty() {
        bail!("empty variable name");
    }
    Ok((key.to_owned(), value.to_owned()))
}
