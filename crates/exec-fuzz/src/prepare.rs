//! Per-iteration input preparation: corpus selection has already happened;
//! this module materializes one on-disk input via the static, dynamic or
//! external strategy.

use std::{
    fs, io,
    os::unix::process::ExitStatusExt,
    path::{Path, PathBuf},
    process::Command,
};

use libafl_bolts::rands::StdRand;
use thiserror::Error;
use tracing::trace;

use crate::{
    config::{Config, PrepStrategy},
    corpus::{CorpusError, SeedSource},
    feedback::FeedbackStore,
    files,
    mutator::Mutator,
    util,
};

/// A temp input file that is unlinked on every exit path, success or not.
#[derive(Debug)]
pub struct TempInput {
    path: PathBuf,
}

impl TempInput {
    /// Create the file empty, with create-exclusive semantics.
    pub(crate) fn create_empty(cfg: &Config, rand: &mut StdRand) -> io::Result<Self> {
        let path = util::temp_input_path(cfg, rand);
        fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)?;
        Ok(Self { path })
    }

    /// Create the file with the given content, with create-exclusive
    /// semantics.
    pub(crate) fn write_new(cfg: &Config, rand: &mut StdRand, bytes: &[u8]) -> io::Result<Self> {
        use io::Write;
        let path = util::temp_input_path(cfg, rand);
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)?;
        file.write_all(bytes)?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TempInput {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_file(&self.path) {
            trace!(path = %self.path.display(), %err, "temp input already gone");
        }
    }
}

/// The materialized input of one iteration.
#[derive(Debug)]
pub struct PreparedInput {
    pub temp: TempInput,
    pub bytes: Vec<u8>,
}

/// Produce one on-disk input according to the configured strategy.
pub fn prepare_input(
    cfg: &Config,
    feedback: &FeedbackStore,
    mutator: &dyn Mutator,
    rand: &mut StdRand,
    seed: &SeedSource,
) -> Result<PreparedInput, PrepareError> {
    match cfg.strategy() {
        PrepStrategy::Static => prepare_static(cfg, mutator, rand, seed),
        PrepStrategy::Dynamic => prepare_dynamic(cfg, feedback, mutator, rand, seed),
        PrepStrategy::External => prepare_external(cfg, mutator, rand, seed),
    }
}

fn prepare_static(
    cfg: &Config,
    mutator: &dyn Mutator,
    rand: &mut StdRand,
    seed: &SeedSource,
) -> Result<PreparedInput, PrepareError> {
    let mut bytes = seed.read(cfg.max_file_sz)?;
    mutator.resize(rand, &mut bytes, cfg.max_file_sz);
    mutator.mangle(rand, &mut bytes, cfg.flip_rate, &cfg.dictionary);
    mutator.post_mangle(rand, &mut bytes);
    bytes.truncate(cfg.max_file_sz);
    let temp = TempInput::write_new(cfg, rand, &bytes)?;
    Ok(PreparedInput { temp, bytes })
}

fn prepare_dynamic(
    cfg: &Config,
    feedback: &FeedbackStore,
    mutator: &dyn Mutator,
    rand: &mut StdRand,
    seed: &SeedSource,
) -> Result<PreparedInput, PrepareError> {
    let loader = cfg
        .input_path
        .is_some()
        .then(|| || seed.read(cfg.max_file_sz).map_err(PrepareError::from));
    let (mut bytes, counters) = feedback.snapshot_with_warm_up(loader)?;
    if !counters.is_zero() {
        // Past the warm-up run; from here on every iteration mutates the
        // best input. The first pass goes through unchanged so the baseline
        // counters belong to the seed itself.
        mutator.resize(rand, &mut bytes, cfg.max_file_sz);
        mutator.mangle(rand, &mut bytes, cfg.flip_rate, &cfg.dictionary);
        bytes.truncate(cfg.max_file_sz);
    }
    let temp = TempInput::write_new(cfg, rand, &bytes)?;
    Ok(PreparedInput { temp, bytes })
}

fn prepare_external(
    cfg: &Config,
    mutator: &dyn Mutator,
    rand: &mut StdRand,
    seed: &SeedSource,
) -> Result<PreparedInput, PrepareError> {
    let command = cfg
        .external_command
        .as_deref()
        .ok_or_else(|| PrepareError::ExternalBroken("no external command configured".to_owned()))?;

    let temp = TempInput::create_empty(cfg, rand)?;
    if cfg.input_path.is_some() {
        let mut bytes = seed.read(cfg.max_file_sz)?;
        mutator.post_mangle(rand, &mut bytes);
        bytes.truncate(cfg.max_file_sz);
        fs::write(temp.path(), &bytes)?;
    }

    let status = Command::new(command).arg(temp.path()).status()?;
    if !status.success() {
        if let Some(code) = status.code() {
            return Err(PrepareError::ExternalExit(code));
        }
        if let Some(sig) = status.signal() {
            return Err(PrepareError::ExternalSignal(sig));
        }
        return Err(PrepareError::ExternalBroken(format!(
            "external mutator in unexpected state: {status:?}"
        )));
    }

    let bytes = files::read_file_capped(temp.path(), cfg.max_file_sz)?;
    Ok(PreparedInput { temp, bytes })
}

#[derive(Debug, Error)]
pub enum PrepareError {
    #[error(transparent)]
    Corpus(#[from] CorpusError),
    #[error("preparing input file: {0}")]
    Io(#[from] io::Error),
    #[error("external mutator exited with code {0}")]
    ExternalExit(i32),
    #[error("external mutator killed by signal {0}")]
    ExternalSignal(i32),
    #[error("external mutator contract broken: {0}")]
    ExternalBroken(String),
}

impl PrepareError {
    /// Whether the error means the environment is broken (stop the run)
    /// rather than one iteration being lost.
    pub fn is_fatal(&self) -> bool {
        match self {
            PrepareError::ExternalExit(_) | PrepareError::ExternalSignal(_) => false,
            PrepareError::Corpus(_) | PrepareError::Io(_) | PrepareError::ExternalBroken(_) => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{os::unix::fs::PermissionsExt, sync::atomic::{AtomicUsize, Ordering}};

    use libafl_bolts::{current_nanos, rands::Rand};

    use super::*;
    use crate::feedback::Counters;

    /// Counts calls and overwrites every byte so mutation is visible.
    #[derive(Debug, Default)]
    struct StampMutator {
        mangles: AtomicUsize,
    }

    impl Mutator for StampMutator {
        fn resize(&self, _rand: &mut StdRand, _buf: &mut Vec<u8>, _max_sz: usize) {}

        fn mangle(
            &self,
            _rand: &mut StdRand,
            buf: &mut [u8],
            _flip_rate: f64,
            _dict: &[Vec<u8>],
        ) {
            self.mangles.fetch_add(1, Ordering::Relaxed);
            buf.fill(0xAA);
        }
    }

    struct Fixture {
        cfg: Config,
        feedback: FeedbackStore,
        rand: StdRand,
        _dir: tempfile::TempDir,
    }

    impl Fixture {
        fn new(update: impl FnOnce(&mut Config, &Path)) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let mut cfg = Config {
                cmdline: vec!["/bin/true".to_owned()],
                work_dir: dir.path().to_path_buf(),
                max_file_sz: 64,
                ..Config::default()
            };
            update(&mut cfg, dir.path());
            let feedback = FeedbackStore::new(&cfg);
            Self {
                cfg,
                feedback,
                rand: StdRand::with_seed(current_nanos()),
                _dir: dir,
            }
        }
    }

    fn seed_file(dir: &Path, content: &[u8]) -> PathBuf {
        let path = dir.join("seed.bin");
        fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn temp_input_is_unlinked_on_drop() {
        let mut fx = Fixture::new(|_, _| {});
        let path = {
            let temp = TempInput::write_new(&fx.cfg, &mut fx.rand, b"x").unwrap();
            assert!(temp.path().exists());
            temp.path().to_path_buf()
        };
        assert!(!path.exists());
    }

    #[test]
    fn static_mode_mutates_and_materializes() {
        let mut fx = Fixture::new(|cfg, dir| {
            cfg.input_path = Some(seed_file(dir, b"seedseed"));
        });
        let seed = SeedSource::File(fx.cfg.input_path.clone().unwrap());
        let mutator = StampMutator::default();
        let prepared =
            prepare_input(&fx.cfg, &fx.feedback, &mutator, &mut fx.rand, &seed).unwrap();
        assert_eq!(prepared.bytes, vec![0xAA; 8]);
        assert_eq!(fs::read(prepared.temp.path()).unwrap(), vec![0xAA; 8]);
        assert_eq!(mutator.mangles.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn dynamic_warm_up_passes_seed_through_unchanged() {
        let mut fx = Fixture::new(|cfg, dir| {
            cfg.input_path = Some(seed_file(dir, b"warmup"));
        });
        let seed = SeedSource::File(fx.cfg.input_path.clone().unwrap());
        let mutator = StampMutator::default();
        let prepared =
            prepare_input(&fx.cfg, &fx.feedback, &mutator, &mut fx.rand, &seed).unwrap();
        assert_eq!(prepared.bytes, b"warmup");
        assert_eq!(mutator.mangles.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn dynamic_mutates_once_counters_are_live() {
        let mut fx = Fixture::new(|cfg, dir| {
            cfg.input_path = Some(seed_file(dir, b"warmup"));
        });
        let seed = SeedSource::File(fx.cfg.input_path.clone().unwrap());
        fx.feedback
            .offer(
                b"best",
                Counters {
                    instr: 10,
                    ..Counters::default()
                },
            )
            .unwrap();
        let mutator = StampMutator::default();
        let prepared =
            prepare_input(&fx.cfg, &fx.feedback, &mutator, &mut fx.rand, &seed).unwrap();
        assert_eq!(prepared.bytes, vec![0xAA; 4]);
        assert_eq!(mutator.mangles.load(Ordering::Relaxed), 1);
    }

    fn script(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[test]
    fn external_mutator_output_is_read_back() {
        let mut fx = Fixture::new(|_, _| {});
        let gen_script = script(
            fx._dir.path(),
            "gen.sh",
            "printf 'generated' > \"$1\"",
        );
        fx.cfg.external_command = Some(gen_script);
        let seed = SeedSource::Synthetic("[external]");
        let prepared =
            prepare_input(&fx.cfg, &fx.feedback, &StampMutator::default(), &mut fx.rand, &seed)
                .unwrap();
        assert_eq!(prepared.bytes, b"generated");
    }

    #[test]
    fn external_mutator_nonzero_exit_fails_the_iteration_only() {
        let mut fx = Fixture::new(|_, _| {});
        let bad = script(fx._dir.path(), "bad.sh", "exit 7");
        fx.cfg.external_command = Some(bad);
        let seed = SeedSource::Synthetic("[external]");
        let err = prepare_input(
            &fx.cfg,
            &fx.feedback,
            &StampMutator::default(),
            &mut fx.rand,
            &seed,
        )
        .unwrap_err();
        assert!(matches!(err, PrepareError::ExternalExit(7)));
        assert!(!err.is_fatal());
    }

    #[test]
    fn corpus_read_failures_are_fatal() {
        let mut fx = Fixture::new(|cfg, _| {
            cfg.input_path = Some(PathBuf::from("/nonexistent/seed"));
        });
        let seed = SeedSource::File(PathBuf::from("/nonexistent/seed"));
        let err = prepare_input(
            &fx.cfg,
            &fx.feedback,
            &StampMutator::default(),
            &mut fx.rand,
            &seed,
        )
        .unwrap_err();
        assert!(err.is_fatal());
    }
}
