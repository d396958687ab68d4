//! Small shared helpers: program name, temp-input naming.

use std::{env, path::PathBuf, sync::OnceLock};

use libafl_bolts::{
    current_time,
    rands::{Rand, StdRand},
};

use crate::config::Config;

/// Basename of the running executable, used in temp-file names.
pub(crate) fn progname() -> &'static str {
    static NAME: OnceLock<String> = OnceLock::new();
    NAME.get_or_init(|| {
        env::current_exe()
            .ok()
            .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
            .unwrap_or_else(|| "exec-fuzz".to_owned())
    })
}

/// A fresh high-entropy temp-input path inside the workspace:
/// `<workdir>/.<progname>.<pid>.<unix_seconds>.<62-bit-hex-random>.<extn>`.
pub(crate) fn temp_input_path(cfg: &Config, rand: &mut StdRand) -> PathBuf {
    let name = format!(
        ".{}.{}.{}.{:x}.{}",
        progname(),
        std::process::id(),
        current_time().as_secs(),
        rand.next() >> 2,
        cfg.file_extn
    );
    cfg.work_dir.join(name)
}
