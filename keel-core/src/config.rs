//! Engine configuration persisted at `<home>/.keel/config.yaml`.
//!
//! Every field has a default so a missing or partial file still yields a
//! working configuration. Follows the `fn_at(home, …)` + no-arg wrapper
//! convention; tests always use the `_at` form.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("YAML serialization error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("cannot determine home directory; set $HOME or equivalent")]
    HomeNotFound,
}

fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> ConfigError {
    ConfigError::Io {
        path: path.into(),
        source,
    }
}

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub base_ms: u64,
    pub max_ms: u64,
    /// Failed applies tolerated before the unit is marked `Degraded`.
    pub max_attempts: u32,
    /// Fraction of the computed delay randomised, `0.0..=1.0`.
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_ms: 500,
            max_ms: 60_000,
            max_attempts: 6,
            jitter: 0.2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Directory holding the version-controlled manifests.
    pub source_dir: PathBuf,
    /// Root used by the file provisioner.
    pub output_dir: PathBuf,
    pub resync_interval_ms: u64,
    pub drift_interval_ms: u64,
    pub apply_timeout_ms: u64,
    /// Extra time past the apply timeout before the watchdog requeues a unit.
    pub watchdog_grace_ms: u64,
    pub max_concurrency: usize,
    pub backoff: BackoffConfig,
    /// Failed external deletes before a unit is reported stuck.
    pub delete_max_attempts: u32,
    /// Upper bound on passes for a one-shot `run_until_settled`.
    pub max_passes: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            source_dir: PathBuf::from("manifests"),
            output_dir: PathBuf::from("live"),
            resync_interval_ms: 2_000,
            drift_interval_ms: 30_000,
            apply_timeout_ms: 30_000,
            watchdog_grace_ms: 5_000,
            max_concurrency: 8,
            backoff: BackoffConfig::default(),
            delete_max_attempts: 5,
            max_passes: 64,
        }
    }
}

impl EngineConfig {
    pub fn apply_timeout(&self) -> Duration {
        Duration::from_millis(self.apply_timeout_ms)
    }

    pub fn resync_interval(&self) -> Duration {
        Duration::from_millis(self.resync_interval_ms)
    }

    pub fn drift_interval(&self) -> Duration {
        Duration::from_millis(self.drift_interval_ms)
    }

    /// How long a unit may sit in `Applying` before the watchdog requeues it.
    pub fn watchdog_deadline(&self) -> Duration {
        Duration::from_millis(self.apply_timeout_ms + self.watchdog_grace_ms)
    }
}

// ---------------------------------------------------------------------------
// Paths
// ---------------------------------------------------------------------------

/// `<home>/.keel/`
pub fn keel_dir_at(home: &Path) -> PathBuf {
    home.join(".keel")
}

/// `<home>/.keel/config.yaml`
pub fn config_path_at(home: &Path) -> PathBuf {
    keel_dir_at(home).join("config.yaml")
}

/// `<home>/.keel/store/state.yaml`
pub fn store_path_at(home: &Path) -> PathBuf {
    keel_dir_at(home).join("store").join("state.yaml")
}

/// `<home>/.keel/store/revisions/`
pub fn revisions_dir_at(home: &Path) -> PathBuf {
    keel_dir_at(home).join("store").join("revisions")
}

/// `<home>/.keel/daemon.sock`
pub fn socket_path_at(home: &Path) -> PathBuf {
    keel_dir_at(home).join("daemon.sock")
}

pub fn home() -> Result<PathBuf, ConfigError> {
    dirs::home_dir().ok_or(ConfigError::HomeNotFound)
}

// ---------------------------------------------------------------------------
// Load / save
// ---------------------------------------------------------------------------

/// Load `<home>/.keel/config.yaml`, or defaults when the file is absent.
pub fn load_at(home: &Path) -> Result<EngineConfig, ConfigError> {
    let path = config_path_at(home);
    if !path.exists() {
        return Ok(EngineConfig::default());
    }
    let contents = std::fs::read_to_string(&path).map_err(|e| io_err(&path, e))?;
    serde_yaml::from_str(&contents).map_err(|source| ConfigError::Parse { path, source })
}

/// `load_at` convenience wrapper.
pub fn load() -> Result<EngineConfig, ConfigError> {
    load_at(&home()?)
}

/// Atomically write the config: `.tmp` sibling, `chmod 0600`, `rename`.
pub fn save_at(home: &Path, config: &EngineConfig) -> Result<PathBuf, ConfigError> {
    let dir = keel_dir_at(home);
    if !dir.exists() {
        std::fs::create_dir_all(&dir).map_err(|e| io_err(&dir, e))?;
        set_mode(&dir, 0o700)?;
    }
    let path = config_path_at(home);
    let tmp = path.with_file_name("config.yaml.tmp");
    let yaml = serde_yaml::to_string(config)?;
    std::fs::write(&tmp, yaml).map_err(|e| io_err(&tmp, e))?;
    set_mode(&tmp, 0o600)?;
    std::fs::rename(&tmp, &path).map_err(|e| io_err(&path, e))?;
    Ok(path)
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> Result<(), ConfigError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
        .map_err(|e| io_err(path, e))
}
#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> Result<(), ConfigError> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_file_yields_defaults() {
        let home = TempDir::new().expect("tempdir");
        let cfg = load_at(home.path()).expect("load");
        assert_eq!(cfg, EngineConfig::default());
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let home = TempDir::new().expect("tempdir");
        std::fs::create_dir_all(keel_dir_at(home.path())).unwrap();
        std::fs::write(
            config_path_at(home.path()),
            "apply_timeout_ms: 100\nbackoff:\n  max_attempts: 2\n",
        )
        .unwrap();
        let cfg = load_at(home.path()).expect("load");
        assert_eq!(cfg.apply_timeout_ms, 100);
        assert_eq!(cfg.backoff.max_attempts, 2);
        assert_eq!(cfg.backoff.base_ms, BackoffConfig::default().base_ms);
    }

    #[test]
    fn save_then_load_and_perms() {
        let home = TempDir::new().expect("tempdir");
        let cfg = EngineConfig {
            max_concurrency: 3,
            ..EngineConfig::default()
        };
        let path = save_at(home.path(), &cfg).expect("save");
        assert_eq!(load_at(home.path()).unwrap(), cfg);
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
            assert_eq!(mode, 0o600);
        }
    }

    #[test]
    fn watchdog_deadline_adds_grace() {
        let cfg = EngineConfig::default();
        assert_eq!(
            cfg.watchdog_deadline(),
            Duration::from_millis(cfg.apply_timeout_ms + cfg.watchdog_grace_ms)
        );
    }
}
