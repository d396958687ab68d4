//! Seed corpus enumeration and selection.

use std::{
    io,
    path::{Path, PathBuf},
};

use itertools::Itertools;
use libafl_bolts::rands::{Rand, StdRand};
use thiserror::Error;
use tracing::info;

use crate::{
    config::{Config, PrepStrategy},
    files,
};

/// Display name of the synthetic entry used when dynamic mode runs without a
/// seed directory.
const DYNAMIC_ENTRY: &str = "[dynamic]";
/// Display name of the synthetic entry used in external-command mode.
const EXTERNAL_ENTRY: &str = "[external]";

/// One corpus entry. `Synthetic` entries exist only to keep the corpus
/// non-empty in modes that do not read seeds from disk; reading one is a
/// typed error rather than a stray open of a made-up path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SeedSource {
    File(PathBuf),
    Synthetic(&'static str),
}

impl SeedSource {
    /// Name used in logs, reports and crash bookkeeping.
    pub fn display_name(&self) -> String {
        match self {
            SeedSource::File(path) => path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.display().to_string()),
            SeedSource::Synthetic(name) => (*name).to_owned(),
        }
    }

    /// Read the seed bytes, capped to `max_sz`.
    pub fn read(&self, max_sz: usize) -> Result<Vec<u8>, CorpusError> {
        match self {
            SeedSource::File(path) => files::read_file_capped(path, max_sz)
                .map_err(|source| CorpusError::Read {
                    path: path.display().to_string(),
                    source,
                }),
            SeedSource::Synthetic(name) => Err(CorpusError::SyntheticRead(name)),
        }
    }
}

#[derive(Debug)]
pub struct Corpus {
    entries: Vec<SeedSource>,
}

impl Corpus {
    /// Enumerate the seed corpus described by `cfg`.
    ///
    /// Directories contribute every regular file whose size is in
    /// `(0, max_file_sz]`; a single file must satisfy the same bound. Without
    /// an input path, dynamic and external modes get a one-element synthetic
    /// corpus.
    pub fn from_config(cfg: &Config) -> Result<Self, CorpusError> {
        let Some(input) = &cfg.input_path else {
            let name = match cfg.strategy() {
                PrepStrategy::Dynamic => DYNAMIC_ENTRY,
                PrepStrategy::External => EXTERNAL_ENTRY,
                PrepStrategy::Static => return Err(CorpusError::NoInput),
            };
            return Ok(Self {
                entries: vec![SeedSource::Synthetic(name)],
            });
        };

        let meta = std::fs::metadata(input).map_err(|source| CorpusError::Read {
            path: input.display().to_string(),
            source,
        })?;

        let entries = if meta.is_dir() {
            Self::enumerate_dir(input, cfg.max_file_sz)?
        } else {
            let len = meta.len() as usize;
            if len == 0 || len > cfg.max_file_sz {
                return Err(CorpusError::AllFilesTooLarge {
                    max_sz: cfg.max_file_sz,
                });
            }
            vec![SeedSource::File(input.clone())]
        };

        info!(count = entries.len(), input = %input.display(), "seed corpus loaded");
        Ok(Self { entries })
    }

    fn enumerate_dir(dir: &Path, max_sz: usize) -> Result<Vec<SeedSource>, CorpusError> {
        let read_err = |source: io::Error| CorpusError::Read {
            path: dir.display().to_string(),
            source,
        };
        let mut files = Vec::new();
        let mut seen_any = false;
        for entry in std::fs::read_dir(dir).map_err(read_err)? {
            let entry = entry.map_err(read_err)?;
            let meta = match entry.metadata() {
                Ok(meta) => meta,
                Err(_) => continue,
            };
            if !meta.is_file() {
                continue;
            }
            seen_any = true;
            let len = meta.len() as usize;
            if len == 0 || len > max_sz {
                continue;
            }
            files.push(entry.path());
        }
        if files.is_empty() {
            return if seen_any {
                Err(CorpusError::AllFilesTooLarge { max_sz })
            } else {
                Err(CorpusError::NoInput)
            };
        }
        Ok(files.into_iter().sorted().map(SeedSource::File).collect())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Uniformly pick one entry.
    pub fn pick(&self, rand: &mut StdRand) -> &SeedSource {
        &self.entries[rand.between(0, self.entries.len() - 1)]
    }
}

#[derive(Debug, Error)]
pub enum CorpusError {
    #[error("no usable seed file in the input path")]
    NoInput,
    #[error("every seed file is empty or larger than {max_sz} bytes")]
    AllFilesTooLarge { max_sz: usize },
    #[error("reading {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("attempted to read the synthetic corpus entry `{0}`")]
    SyntheticRead(&'static str),
}

#[cfg(test)]
mod tests {
    use std::fs;

    use libafl_bolts::current_nanos;

    use crate::config::DynFileMethod;

    use super::*;

    fn cfg_with_input(input: PathBuf) -> Config {
        Config {
            cmdline: vec!["/bin/true".to_owned()],
            input_path: Some(input),
            max_file_sz: 8,
            ..Config::default()
        }
    }

    #[test]
    fn directory_enumeration_filters_by_size() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("ok"), b"seed").unwrap();
        fs::write(dir.path().join("empty"), b"").unwrap();
        fs::write(dir.path().join("huge"), vec![0u8; 64]).unwrap();
        let corpus = Corpus::from_config(&cfg_with_input(dir.path().to_path_buf())).unwrap();
        assert_eq!(corpus.len(), 1);
        let mut rand = StdRand::with_seed(current_nanos());
        let seed = corpus.pick(&mut rand);
        assert_eq!(seed.display_name(), "ok");
        assert_eq!(seed.read(8).unwrap(), b"seed");
    }

    #[test]
    fn directory_with_only_oversized_files_errors() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("huge"), vec![0u8; 64]).unwrap();
        assert!(matches!(
            Corpus::from_config(&cfg_with_input(dir.path().to_path_buf())),
            Err(CorpusError::AllFilesTooLarge { .. })
        ));
    }

    #[test]
    fn empty_directory_errors() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            Corpus::from_config(&cfg_with_input(dir.path().to_path_buf())),
            Err(CorpusError::NoInput)
        ));
    }

    #[test]
    fn single_file_corpus() {
        let dir = tempfile::tempdir().unwrap();
        let seed = dir.path().join("seed.bin");
        fs::write(&seed, b"ab").unwrap();
        let corpus = Corpus::from_config(&cfg_with_input(seed)).unwrap();
        assert_eq!(corpus.len(), 1);
    }

    #[test]
    fn dynamic_mode_gets_synthetic_entry() {
        let cfg = Config {
            cmdline: vec!["/bin/true".to_owned()],
            dyn_file_method: DynFileMethod::INSTR_COUNT,
            ..Config::default()
        };
        let corpus = Corpus::from_config(&cfg).unwrap();
        assert_eq!(corpus.len(), 1);
        let mut rand = StdRand::with_seed(1);
        let entry = corpus.pick(&mut rand);
        assert!(matches!(entry, SeedSource::Synthetic(_)));
        assert!(matches!(
            entry.read(8),
            Err(CorpusError::SyntheticRead(_))
        ));
    }
}
