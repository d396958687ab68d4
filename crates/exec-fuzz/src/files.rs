//! Seed reading and list-file parsers (dictionary, stack-hash blacklist,
//! symbol lists).

use std::{
    fs::File,
    io,
    path::Path,
};

use memmap2::Mmap;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum FileListError {
    #[error("reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("{path}:{line}: {reason}")]
    Malformed {
        path: String,
        line: usize,
        reason: String,
    },
}

impl FileListError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.display().to_string(),
            source,
        }
    }

    fn malformed(path: &Path, line: usize, reason: impl Into<String>) -> Self {
        Self::Malformed {
            path: path.display().to_string(),
            line,
            reason: reason.into(),
        }
    }
}

/// Read a file into memory, truncated to `max_sz` bytes.
pub fn read_file_capped(path: &Path, max_sz: usize) -> io::Result<Vec<u8>> {
    let file = File::open(path)?;
    let len = file.metadata()?.len() as usize;
    if len == 0 {
        return Ok(Vec::new());
    }
    // SAFETY: the mapping is dropped before the function returns and the
    // bytes are copied out; concurrent truncation of a seed file is outside
    // the supported usage.
    let map = unsafe { Mmap::map(&file)? };
    Ok(map[..len.min(max_sz)].to_vec())
}

/// Parse a mutation dictionary: one token per line, `#` comments, blank lines
/// skipped. `\xNN`, `\\`, `\n`, `\t` escapes are decoded.
pub fn parse_dictionary(path: &Path) -> Result<Vec<Vec<u8>>, FileListError> {
    let text = std::fs::read_to_string(path).map_err(|e| FileListError::io(path, e))?;
    let mut tokens = Vec::new();
    for (idx, line) in text.lines().enumerate() {
        let line = line.trim_end_matches('\r');
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let token = unescape(line)
            .map_err(|reason| FileListError::malformed(path, idx + 1, reason))?;
        if !token.is_empty() {
            tokens.push(token);
        }
    }
    debug!(count = tokens.len(), path = %path.display(), "dictionary loaded");
    Ok(tokens)
}

/// Parse a stack-hash blacklist: one 64-bit hex value per line (with or
/// without a `0x` prefix). The result is sorted ascending and deduplicated so
/// membership tests can use binary search.
pub fn parse_stackhash_blacklist(path: &Path) -> Result<Vec<u64>, FileListError> {
    let text = std::fs::read_to_string(path).map_err(|e| FileListError::io(path, e))?;
    let mut hashes = Vec::new();
    for (idx, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let digits = line.strip_prefix("0x").unwrap_or(line);
        let hash = u64::from_str_radix(digits, 16)
            .map_err(|e| FileListError::malformed(path, idx + 1, e.to_string()))?;
        hashes.push(hash);
    }
    hashes.sort_unstable();
    hashes.dedup();
    debug!(count = hashes.len(), path = %path.display(), "stack-hash blacklist loaded");
    Ok(hashes)
}

/// Parse a symbol list: one symbol name per line, `#` comments allowed.
pub fn parse_symbol_list(path: &Path) -> Result<Vec<String>, FileListError> {
    let text = std::fs::read_to_string(path).map_err(|e| FileListError::io(path, e))?;
    Ok(text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(str::to_owned)
        .collect())
}

fn unescape(line: &str) -> Result<Vec<u8>, String> {
    let mut out = Vec::with_capacity(line.len());
    let mut chars = line.bytes();
    while let Some(b) = chars.next() {
        if b != b'\\' {
            out.push(b);
            continue;
        }
        match chars.next() {
            Some(b'\\') => out.push(b'\\'),
            Some(b'n') => out.push(b'\n'),
            Some(b't') => out.push(b'\t'),
            Some(b'x') => {
                let hi = chars.next().ok_or("truncated \\x escape")?;
                let lo = chars.next().ok_or("truncated \\x escape")?;
                let hex = [hi, lo];
                let hex = std::str::from_utf8(&hex).map_err(|_| "bad \\x escape")?;
                let value =
                    u8::from_str_radix(hex, 16).map_err(|_| format!("bad \\x escape `{hex}`"))?;
                out.push(value);
            }
            Some(other) => return Err(format!("unknown escape `\\{}`", other as char)),
            None => return Err("trailing backslash".to_owned()),
        }
    }
    Ok(out)
}
