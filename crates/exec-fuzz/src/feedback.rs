//! The shared best-seed record driving the dynamic-feedback loop.
//!
//! One mutex guards the best input bytes and the counter vector observed for
//! them; the two are only ever updated together, so a reader sees either the
//! old pair or the new pair. Each accepted update also replaces the on-disk
//! `CURRENT_BEST` file through a rename, which keeps outside readers from
//! observing a torn write.

use std::{
    io,
    path::PathBuf,
    sync::{Mutex, PoisonError},
};

use thiserror::Error;
use tracing::{debug, info};

use crate::config::{Config, CURRENT_BEST, CURRENT_BEST_TMP};

/// Runtime counter vector. Componentwise improvement defines "more
/// interesting": `instr`/`branch` come from hardware counters, `pc` counts
/// unique blocks, `path` unique edges, `custom` is capability-defined.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counters {
    pub instr: u64,
    pub branch: u64,
    pub pc: u64,
    pub path: u64,
    pub custom: u64,
}

impl Counters {
    pub fn is_zero(&self) -> bool {
        *self == Self::default()
    }

    /// Whether every component of `self` is at least the corresponding
    /// component of `other` (ties included).
    pub fn covers(&self, other: &Counters) -> bool {
        self.instr >= other.instr
            && self.branch >= other.branch
            && self.pc >= other.pc
            && self.path >= other.path
            && self.custom >= other.custom
    }
}

#[derive(Debug)]
struct BestSeed {
    bytes: Vec<u8>,
    counters: Counters,
}

#[derive(Debug)]
pub struct FeedbackStore {
    best: Mutex<BestSeed>,
    best_path: PathBuf,
    tmp_path: PathBuf,
    max_file_sz: usize,
}

impl FeedbackStore {
    pub fn new(cfg: &Config) -> Self {
        Self {
            best: Mutex::new(BestSeed {
                // A single zero byte: something to mutate before the first
                // interesting input arrives.
                bytes: vec![0],
                counters: Counters::default(),
            }),
            best_path: cfg.work_dir.join(CURRENT_BEST),
            tmp_path: cfg.work_dir.join(CURRENT_BEST_TMP),
            max_file_sz: cfg.max_file_sz,
        }
    }

    /// Copy of the current best bytes and their counters.
    pub fn snapshot(&self) -> (Vec<u8>, Counters) {
        let best = self.best.lock().unwrap_or_else(PoisonError::into_inner);
        (best.bytes.clone(), best.counters)
    }

    /// Snapshot for the preparation path.
    ///
    /// While the counters are still all-zero (nothing observed yet) and a
    /// seed loader is available, the best buffer is first seeded from it,
    /// all under the same lock, so exactly one worker performs the warm-up.
    pub fn snapshot_with_warm_up<E>(
        &self,
        seed: Option<impl FnOnce() -> Result<Vec<u8>, E>>,
    ) -> Result<(Vec<u8>, Counters), E> {
        let mut best = self.best.lock().unwrap_or_else(PoisonError::into_inner);
        if best.counters.is_zero()
            && let Some(loader) = seed
        {
            let mut bytes = loader()?;
            bytes.truncate(self.max_file_sz);
            if !bytes.is_empty() {
                best.bytes = bytes;
            }
        }
        Ok((best.bytes.clone(), best.counters))
    }

    /// Offer a candidate input with the counters observed for it.
    ///
    /// The candidate replaces the best record iff its counter vector covers
    /// the current one componentwise. On acceptance the workspace
    /// `CURRENT_BEST` file is atomically replaced and `true` is returned.
    pub fn offer(&self, candidate: &[u8], counters: Counters) -> Result<bool, FeedbackError> {
        let mut best = self.best.lock().unwrap_or_else(PoisonError::into_inner);
        if !counters.covers(&best.counters) {
            return Ok(false);
        }
        if candidate.len() > self.max_file_sz {
            return Err(FeedbackError::OversizedBest {
                len: candidate.len(),
                max_sz: self.max_file_sz,
            });
        }
        if counters != best.counters {
            info!(
                instr = counters.instr,
                branch = counters.branch,
                pc = counters.pc,
                path = counters.path,
                custom = counters.custom,
                size = candidate.len(),
                "new best input"
            );
        } else {
            debug!(size = candidate.len(), "best input refreshed on counter tie");
        }
        best.bytes = candidate.to_vec();
        best.counters = counters;
        std::fs::write(&self.tmp_path, candidate).map_err(FeedbackError::Persist)?;
        std::fs::rename(&self.tmp_path, &self.best_path).map_err(FeedbackError::Persist)?;
        Ok(true)
    }
}

#[derive(Debug, Error)]
pub enum FeedbackError {
    #[error("best input of {len} bytes exceeds the {max_sz}-byte limit")]
    OversizedBest { len: usize, max_sz: usize },
    #[error("persisting best input: {0}")]
    Persist(#[source] io::Error),
}
