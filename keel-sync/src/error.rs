//! Error types for keel-sync.

use std::path::PathBuf;

use keel_compose::ComposeError;
use keel_core::{ErrorClass, ManifestError, StoreError, UnitId};
use keel_graph::GraphError;
use thiserror::Error;

/// Errors reported by a provisioner.
#[derive(Debug, Error)]
pub enum AdapterError {
    /// The external system rejected or failed the call. Retried.
    #[error("{0}")]
    Failed(String),

    /// The call did not finish before its deadline. Retried.
    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// The spec can never be applied as written. Not retried.
    #[error("invalid resource: {0}")]
    Invalid(String),

    #[error("no provisioner registered as '{0}'")]
    UnknownAdapter(String),

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl AdapterError {
    pub fn class(&self) -> ErrorClass {
        match self {
            AdapterError::Failed(_) | AdapterError::Io { .. } => ErrorClass::Apply,
            AdapterError::Timeout(_) => ErrorClass::Timeout,
            AdapterError::Invalid(_)
            | AdapterError::UnknownAdapter(_)
            | AdapterError::Yaml(_) => ErrorClass::Validation,
        }
    }
}

/// All errors that can arise from sync operations.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("composition error: {0}")]
    Compose(#[from] ComposeError),

    #[error("dependency error: {0}")]
    Graph(#[from] GraphError),

    #[error("provisioner error: {0}")]
    Adapter(#[from] AdapterError),

    #[error("manifest error: {0}")]
    Manifest(#[from] ManifestError),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("unit '{0}' not found")]
    UnitNotFound(UnitId),
}

impl SyncError {
    pub fn class(&self) -> ErrorClass {
        match self {
            SyncError::Store(e) => e.class(),
            SyncError::Compose(e) => e.class(),
            SyncError::Graph(e) => e.class(),
            SyncError::Adapter(e) => e.class(),
            SyncError::Manifest(e) => e.class(),
            SyncError::UnitNotFound(_) => ErrorClass::Validation,
            SyncError::Yaml(_) => ErrorClass::Internal,
        }
    }
}

pub(crate) fn adapter_io_err(path: impl Into<PathBuf>, source: std::io::Error) -> AdapterError {
    AdapterError::Io {
        path: path.into(),
        source,
    }
}
