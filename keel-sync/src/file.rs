//! File-backed provisioner.
//!
//! Each resource is realised as `<root>/<name>.yaml`. Writes are hash-gated
//! against the file already on disk and land atomically:
//!
//! 1. Render the body as YAML and normalise line endings to LF.
//! 2. SHA-256 the rendered content and the existing file, skip if identical.
//! 3. Write `<path>.keel.tmp`, then rename over the final path.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use keel_core::digest::hash_bytes;
use serde_json::Value;

use crate::error::{adapter_io_err, AdapterError};
use crate::provisioner::{ObservedState, Provisioner, ResourceRef, ResourceSpec};

/// Outcome of one file write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteResult {
    Written { path: PathBuf },
    Unchanged { path: PathBuf },
}

#[derive(Debug, Clone)]
pub struct FileProvisioner {
    root: PathBuf,
}

impl FileProvisioner {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `<root>/<name>.yaml`, with path separators in `name` flattened.
    pub fn path_for(&self, name: &str) -> PathBuf {
        let file: String = name
            .chars()
            .map(|c| if c == '/' || c == '\\' { '_' } else { c })
            .collect();
        self.root.join(format!("{file}.yaml"))
    }

    fn read(&self, name: &str) -> Result<Option<Value>, AdapterError> {
        let path = self.path_for(name);
        let contents = match std::fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(adapter_io_err(path, e)),
        };
        Ok(Some(serde_yaml::from_str(&contents)?))
    }
}

/// Hash-gated atomic write of `content` to `path`.
pub(crate) fn atomic_write(path: &Path, content: &str) -> Result<WriteResult, AdapterError> {
    let normalized = content.replace("\r\n", "\n");

    if let Ok(existing) = std::fs::read(path) {
        if hash_bytes(&existing) == hash_bytes(normalized.as_bytes()) {
            tracing::debug!(path = %path.display(), "unchanged");
            return Ok(WriteResult::Unchanged {
                path: path.to_path_buf(),
            });
        }
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| adapter_io_err(parent, e))?;
    }
    let tmp = PathBuf::from(format!("{}.keel.tmp", path.display()));
    std::fs::write(&tmp, &normalized).map_err(|e| adapter_io_err(&tmp, e))?;
    if let Err(e) = std::fs::rename(&tmp, path) {
        let _ = std::fs::remove_file(&tmp);
        return Err(adapter_io_err(path, e));
    }

    tracing::info!(path = %path.display(), "wrote");
    Ok(WriteResult::Written {
        path: path.to_path_buf(),
    })
}

#[async_trait]
impl Provisioner for FileProvisioner {
    async fn apply(&self, spec: &ResourceSpec) -> Result<ObservedState, AdapterError> {
        if !spec.body.is_object() {
            return Err(AdapterError::Invalid(format!(
                "{}: body must be a mapping",
                spec.name
            )));
        }
        let yaml = serde_yaml::to_string(&spec.body)?;
        atomic_write(&self.path_for(&spec.name), &yaml)?;
        Ok(ObservedState {
            name: spec.name.clone(),
            body: spec.body.clone(),
            ready: true,
        })
    }

    async fn delete(&self, target: &ResourceRef) -> Result<(), AdapterError> {
        let path = self.path_for(&target.name);
        match std::fs::remove_file(&path) {
            Ok(()) => {
                tracing::info!(path = %path.display(), "removed");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(adapter_io_err(path, e)),
        }
    }

    async fn observe(&self, target: &ResourceRef) -> Result<Option<ObservedState>, AdapterError> {
        Ok(self.read(&target.name)?.map(|body| ObservedState {
            name: target.name.clone(),
            body,
            ready: true,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::UnitId;
    use serde_json::json;
    use tempfile::TempDir;

    fn spec(body: Value) -> ResourceSpec {
        ResourceSpec {
            unit: UnitId::managed("shop-orders", "network"),
            name: "shop-orders-network".into(),
            body,
        }
    }

    #[test]
    fn second_identical_write_is_unchanged() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("a.yaml");
        assert!(matches!(atomic_write(&path, "x: 1\n").unwrap(), WriteResult::Written { .. }));
        assert!(matches!(atomic_write(&path, "x: 1\r\n").unwrap(), WriteResult::Unchanged { .. }));
        assert!(!tmp.path().join("a.yaml.keel.tmp").exists());
    }

    #[tokio::test]
    async fn apply_observe_delete() {
        let tmp = TempDir::new().unwrap();
        let p = FileProvisioner::new(tmp.path());
        let s = spec(json!({"kind": "Network", "spec": {"cidr": "10.0.0.0/16"}}));
        p.apply(&s).await.unwrap();
        assert!(tmp.path().join("shop-orders-network.yaml").exists());

        let target = ResourceRef {
            unit: s.unit.clone(),
            name: s.name.clone(),
        };
        let live = p.observe(&target).await.unwrap().expect("live");
        assert_eq!(live.body, s.body);

        p.delete(&target).await.unwrap();
        assert!(p.observe(&target).await.unwrap().is_none());
        p.delete(&target).await.expect("idempotent");
    }

    #[tokio::test]
    async fn scalar_body_is_invalid() {
        let tmp = TempDir::new().unwrap();
        let p = FileProvisioner::new(tmp.path());
        let err = p.apply(&spec(json!("nope"))).await.unwrap_err();
        assert!(matches!(err, AdapterError::Invalid(_)));
    }
}
