//! Sanitizer-coverage collection.
//!
//! When `-C` is active the target runs with
//! `ASAN_OPTIONS=coverage=1:coverage_dir=<workspace>/SANCOV` and dumps one
//! `.sancov` file per module on exit. Each file is a magic header followed by
//! packed 32- or 64-bit program counters; the unique-PC count of a run feeds
//! the `pc` counter slot.

use std::{
    collections::HashSet,
    io,
    path::{Path, PathBuf},
};

use tracing::trace;

use crate::config::{Config, SANCOV_DIR};

const MAGIC64: u64 = 0xC0BF_FFFF_FFFF_FF64;
const MAGIC32: u64 = 0xC0BF_FFFF_FFFF_FF32;

pub(crate) fn scratch_dir(cfg: &Config) -> PathBuf {
    cfg.work_dir.join(SANCOV_DIR)
}

/// Parse and remove every `.sancov` dump under `dir`, returning the number
/// of distinct program counters seen.
pub(crate) fn collect(dir: &Path) -> io::Result<u64> {
    let mut pcs: HashSet<u64> = HashSet::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.extension().is_none_or(|e| e != "sancov") {
            continue;
        }
        let bytes = std::fs::read(&path)?;
        parse_dump(&bytes, &mut pcs);
        std::fs::remove_file(&path)?;
    }
    trace!(unique_pcs = pcs.len(), "sanitizer coverage collected");
    Ok(pcs.len() as u64)
}

fn parse_dump(bytes: &[u8], pcs: &mut HashSet<u64>) {
    if bytes.len() < 8 {
        return;
    }
    let magic = u64::from_le_bytes(bytes[..8].try_into().unwrap_or([0; 8]));
    let body = &bytes[8..];
    match magic {
        MAGIC64 => {
            for chunk in body.chunks_exact(8) {
                pcs.insert(u64::from_le_bytes(chunk.try_into().unwrap_or([0; 8])));
            }
        }
        MAGIC32 => {
            for chunk in body.chunks_exact(4) {
                pcs.insert(u64::from(u32::from_le_bytes(
                    chunk.try_into().unwrap_or([0; 4]),
                )));
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dump64(pcs: &[u64]) -> Vec<u8> {
        let mut out = MAGIC64.to_le_bytes().to_vec();
        for pc in pcs {
            out.extend_from_slice(&pc.to_le_bytes());
        }
        out
    }

    #[test]
    fn counts_unique_pcs_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.sancov"), dump64(&[1, 2, 2, 3])).unwrap();
        std::fs::write(dir.path().join("b.sancov"), dump64(&[3, 4])).unwrap();
        std::fs::write(dir.path().join("ignore.txt"), b"nope").unwrap();
        let unique = collect(dir.path()).unwrap();
        assert_eq!(unique, 4);
        assert!(!dir.path().join("a.sancov").exists());
        assert!(dir.path().join("ignore.txt").exists());
    }

    #[test]
    fn thirty_two_bit_dumps_parse() {
        let mut dump = MAGIC32.to_le_bytes().to_vec();
        dump.extend_from_slice(&0x1122_3344_u32.to_le_bytes());
        let mut pcs = HashSet::new();
        parse_dump(&dump, &mut pcs);
        assert_eq!(pcs.len(), 1);
        assert!(pcs.contains(&0x1122_3344));
    }

    #[test]
    fn unknown_magic_is_ignored() {
        let mut pcs = HashSet::new();
        parse_dump(&[0xFF; 24], &mut pcs);
        assert!(pcs.is_empty());
    }
}
