//! Daemon file locations. Relative `source_dir` / `output_dir` values in the
//! config resolve against `<home>/.keel/`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use keel_core::config::{keel_dir_at, socket_path_at};
use keel_core::EngineConfig;

/// Quiet period after the last source change before a reload.
pub const DEBOUNCE_WINDOW: Duration = Duration::from_millis(500);

pub fn socket_path(home: &Path) -> PathBuf {
    socket_path_at(home)
}

pub fn resolve_at(home: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        keel_dir_at(home).join(path)
    }
}

/// Directory holding the source manifests.
pub fn source_dir_at(home: &Path, config: &EngineConfig) -> PathBuf {
    resolve_at(home, &config.source_dir)
}

/// Root of the file provisioner.
pub fn output_dir_at(home: &Path, config: &EngineConfig) -> PathBuf {
    resolve_at(home, &config.output_dir)
}
