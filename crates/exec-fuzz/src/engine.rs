//! The fuzzing engine: a fixed pool of workers around the shared state, and
//! the supervisor loop that watches signals, the mutation budget and worker
//! health.

use std::{
    io,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, PoisonError,
    },
    thread,
};

use libafl_bolts::{
    current_nanos,
    rands::{Rand, StdRand},
};
use nix::sys::signal::Signal;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::{
    config::{Config, ConfigError},
    corpus::{Corpus, CorpusError},
    crash::{Classifier, CrashError},
    exec::{command::CommandTarget, sancov, Target, TargetError},
    feedback::{FeedbackError, FeedbackStore},
    mutator::{Mutator, StdMutator},
    prepare::{self, PrepareError},
    report::{FileReporter, Reporter},
    supervisor::{self, Display, TICK},
    tallies::{Tallies, TallySnapshot},
};

/// Why the run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// Every worker retired after the mutation budget was spent.
    Completed,
    /// A termination signal arrived; in-flight workers are abandoned to
    /// process teardown.
    Signalled(Signal),
}

#[derive(Debug, Clone, Copy)]
pub struct Summary {
    pub tallies: TallySnapshot,
    pub exit: ExitReason,
}

#[derive(Debug)]
struct Shared {
    cfg: Config,
    corpus: Corpus,
    feedback: FeedbackStore,
    tallies: Tallies,
    target: Box<dyn Target>,
    mutator: Box<dyn Mutator>,
    reporter: Box<dyn Reporter>,
    stop: AtomicBool,
    fatal: Mutex<Option<EngineError>>,
}

#[derive(Debug)]
pub struct Engine {
    shared: Arc<Shared>,
}

impl Engine {
    /// Validate the configuration, enumerate the corpus and wire the
    /// capabilities together.
    pub fn new(
        cfg: Config,
        target: Box<dyn Target>,
        mutator: Box<dyn Mutator>,
        reporter: Box<dyn Reporter>,
    ) -> Result<Self, EngineError> {
        cfg.validate()?;
        target.preflight(&cfg)?;
        std::fs::create_dir_all(&cfg.work_dir).map_err(EngineError::Workspace)?;
        if cfg.sancov {
            std::fs::create_dir_all(sancov::scratch_dir(&cfg)).map_err(EngineError::Workspace)?;
        }
        let corpus = Corpus::from_config(&cfg)?;
        let feedback = FeedbackStore::new(&cfg);
        Ok(Self {
            shared: Arc::new(Shared {
                cfg,
                corpus,
                feedback,
                tallies: Tallies::default(),
                target,
                mutator,
                reporter,
                stop: AtomicBool::new(false),
                fatal: Mutex::new(None),
            }),
        })
    }

    /// Engine with the stock capabilities: spawn-per-run target, stock
    /// mutator, file report sink.
    pub fn with_defaults(cfg: Config) -> Result<Self, EngineError> {
        Self::new(
            cfg,
            Box::new(CommandTarget),
            Box::new(StdMutator),
            Box::new(FileReporter),
        )
    }

    pub fn tallies(&self) -> TallySnapshot {
        self.shared.tallies.snapshot()
    }

    /// Run to completion, termination signal or fatal worker error.
    pub fn run(&self) -> Result<Summary, EngineError> {
        supervisor::install_signal_handlers().map_err(EngineError::Signals)?;
        supervisor::clear_received_signal();

        let threads = self.shared.cfg.threads_max;
        let waker = thread::current();
        let mut handles = Vec::with_capacity(threads);
        for worker_id in 0..threads {
            let shared = Arc::clone(&self.shared);
            let waker = waker.clone();
            let handle = thread::Builder::new()
                .name(format!("fuzz-worker-{worker_id}"))
                .spawn(move || worker_loop(&shared, &waker, worker_id))
                .map_err(EngineError::Spawn)?;
            handles.push(handle);
        }
        info!(
            workers = threads,
            strategy = ?self.shared.cfg.strategy(),
            "fuzzing started"
        );

        let mut display = Display::new();
        let signalled = loop {
            display.tick(&self.shared.tallies);
            if self.fatal_recorded() {
                break None;
            }
            if let Some(sig) = supervisor::received_signal() {
                break Some(sig);
            }
            if self.shared.tallies.threads_finished.load(Ordering::Relaxed) >= threads as u64 {
                break None;
            }
            thread::park_timeout(TICK);
        };
        self.shared.stop.store(true, Ordering::Relaxed);

        if let Some(sig) = signalled {
            // No graceful drain: workers are left to process teardown, the
            // way an interactive ^C is expected to behave.
            info!(signal = %sig, "termination signal received, shutting down");
            return Ok(Summary {
                tallies: self.shared.tallies.snapshot(),
                exit: ExitReason::Signalled(sig),
            });
        }

        for handle in handles {
            if handle.join().is_err() {
                self.record_fatal(EngineError::WorkerPanicked);
            }
        }
        let fatal = self
            .shared
            .fatal
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(err) = fatal {
            return Err(err);
        }
        Ok(Summary {
            tallies: self.shared.tallies.snapshot(),
            exit: ExitReason::Completed,
        })
    }

    fn fatal_recorded(&self) -> bool {
        self.shared
            .fatal
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    fn record_fatal(&self, err: EngineError) {
        self.shared
            .fatal
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_or_insert(err);
    }
}

/// Claim one slot of the mutation budget. With a budget of zero the counter
/// just grows; otherwise the counter never exceeds the budget and a `false`
/// return retires the worker.
fn claim_iteration(tallies: &Tallies, mutations_max: u64) -> bool {
    if mutations_max == 0 {
        tallies.mutations.fetch_add(1, Ordering::Relaxed);
        return true;
    }
    let mut current = tallies.mutations.load(Ordering::Relaxed);
    while current < mutations_max {
        match tallies.mutations.compare_exchange_weak(
            current,
            current + 1,
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => return true,
            Err(actual) => current = actual,
        }
    }
    false
}

fn worker_loop(shared: &Shared, waker: &thread::Thread, worker_id: usize) {
    let mut rand = StdRand::with_seed(
        current_nanos() ^ (worker_id as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15),
    );
    loop {
        if shared.stop.load(Ordering::Relaxed) {
            break;
        }
        if !claim_iteration(&shared.tallies, shared.cfg.mutations_max) {
            break;
        }
        if let Err(err) = iteration(shared, &mut rand) {
            error!(worker = worker_id, %err, "worker hit a fatal error");
            shared
                .fatal
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .get_or_insert(err);
            shared.stop.store(true, Ordering::Relaxed);
            break;
        }
    }
    shared.tallies.threads_finished.fetch_add(1, Ordering::Relaxed);
    waker.unpark();
}

/// One pass of the pipeline: pick a seed, materialize an input, run the
/// target, classify the observation, feed the counters back.
fn iteration(shared: &Shared, rand: &mut StdRand) -> Result<(), EngineError> {
    let seed = shared.corpus.pick(rand);
    let prepared = match prepare::prepare_input(
        &shared.cfg,
        &shared.feedback,
        shared.mutator.as_ref(),
        rand,
        seed,
    ) {
        Ok(prepared) => prepared,
        Err(err) if !err.is_fatal() => {
            warn!(%err, "iteration skipped");
            return Ok(());
        }
        Err(err) => return Err(err.into()),
    };

    let observation = shared
        .target
        .execute(&shared.cfg, prepared.temp.path())?;

    let classifier = Classifier {
        cfg: &shared.cfg,
        tallies: &shared.tallies,
        target: shared.target.as_ref(),
        reporter: shared.reporter.as_ref(),
    };
    classifier.classify(rand, &observation, &prepared.bytes, &seed.display_name())?;

    if shared.cfg.feedback_enabled() {
        shared
            .feedback
            .offer(&prepared.bytes, observation.counters)?;
    }
    Ok(())
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("corpus: {0}")]
    Corpus(#[from] CorpusError),
    #[error("workspace: {0}")]
    Workspace(#[source] io::Error),
    #[error("installing signal handlers: {0}")]
    Signals(#[source] nix::errno::Errno),
    #[error("spawning worker thread: {0}")]
    Spawn(#[source] io::Error),
    #[error("input preparation: {0}")]
    Prepare(#[from] PrepareError),
    #[error("target execution: {0}")]
    Target(#[from] TargetError),
    #[error("crash handling: {0}")]
    Crash(#[from] CrashError),
    #[error("feedback store: {0}")]
    Feedback(#[from] FeedbackError),
    #[error("a worker thread panicked")]
    WorkerPanicked,
}
