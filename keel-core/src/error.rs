//! Error types for keel-core and the engine-wide error taxonomy.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::UnitId;

/// Classification every engine error maps onto.
///
/// The class decides retry behaviour and the CLI exit code; it is also what
/// gets recorded on a unit's status when an error is surfaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorClass {
    /// Schema violation or ambiguous selection. Fatal until the source changes.
    Validation,
    /// Composition authoring defect. Fatal.
    Template,
    /// Dependency graph contains a cycle. Fatal, configuration-time.
    DependencyCycle,
    /// Provisioner apply/delete failed. Retried with bounded backoff.
    Apply,
    /// Provisioner call exceeded its deadline. Handled like `Apply`.
    Timeout,
    /// Stale optimistic-concurrency write. Retried immediately.
    Conflict,
    /// Live state diverged from desired state.
    Drift,
    /// I/O, serialization and other faults outside the taxonomy.
    Internal,
}

impl ErrorClass {
    /// Fatal classes are never retried until the desired input changes.
    pub fn is_fatal(self) -> bool {
        matches!(
            self,
            ErrorClass::Validation | ErrorClass::Template | ErrorClass::DependencyCycle
        )
    }

    /// Transient classes go through the backoff path.
    pub fn is_transient(self) -> bool {
        matches!(self, ErrorClass::Apply | ErrorClass::Timeout)
    }

    /// Process exit code used by the CLI for this class.
    pub fn exit_code(self) -> u8 {
        match self {
            ErrorClass::Internal => 1,
            ErrorClass::Validation => 2,
            ErrorClass::Template => 3,
            ErrorClass::DependencyCycle => 4,
            ErrorClass::Apply => 5,
            ErrorClass::Timeout => 6,
            ErrorClass::Conflict => 7,
            ErrorClass::Drift => 8,
        }
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ErrorClass::Validation => "ValidationError",
            ErrorClass::Template => "TemplateError",
            ErrorClass::DependencyCycle => "DependencyCycleError",
            ErrorClass::Apply => "ApplyError",
            ErrorClass::Timeout => "TimeoutError",
            ErrorClass::Conflict => "ConflictError",
            ErrorClass::Drift => "DriftError",
            ErrorClass::Internal => "InternalError",
        };
        f.write_str(label)
    }
}

/// All errors that can arise from resource store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying I/O failure, annotated with the path involved.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// YAML serialization error (save path).
    #[error("YAML serialization error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// YAML parse error on load, with the file that failed.
    #[error("failed to parse store at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    /// `dirs::home_dir()` returned `None`.
    #[error("cannot determine home directory; set $HOME or equivalent")]
    HomeNotFound,

    #[error("unit '{0}' not found in store")]
    UnitNotFound(UnitId),

    #[error("revision {0} not found")]
    RevisionNotFound(u64),

    /// The desired hash changed between read and write.
    #[error("stale write for '{id}': expected desired hash {expected}, store has {actual}")]
    Conflict {
        id: UnitId,
        expected: String,
        actual: String,
    },

    /// A ResourceDefinition update is not additive while claims of its kind exist.
    #[error("definition '{name}' is immutable while claims exist: {reasons}")]
    ImmutableDefinition { name: String, reasons: String },
}

impl StoreError {
    pub fn class(&self) -> ErrorClass {
        match self {
            StoreError::Conflict { .. } => ErrorClass::Conflict,
            StoreError::ImmutableDefinition { .. } => ErrorClass::Validation,
            _ => ErrorClass::Internal,
        }
    }
}

pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> StoreError {
    StoreError::Io {
        path: path.into(),
        source,
    }
}
