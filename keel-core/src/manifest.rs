//! Source-of-truth ingestion: multi-document YAML manifests.
//!
//! Every `*.yaml` / `*.yml` file under the source directory is read in sorted
//! path order and split into documents. Each document is classified by its
//! `kind` field.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::digest::canonical_hash;
use crate::error::ErrorClass;
use crate::types::{Application, Claim, Composition, ResourceDefinition, UnitId};

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{path} document {index}: {source}")]
    Parse {
        path: PathBuf,
        index: usize,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("{path} document {index}: missing `kind`")]
    MissingKind { path: PathBuf, index: usize },

    #[error("{path} document {index}: unknown kind '{kind}'")]
    UnknownKind {
        path: PathBuf,
        index: usize,
        kind: String,
    },

    #[error("duplicate {kind} '{name}' in source")]
    Duplicate { kind: &'static str, name: String },
}

impl ManifestError {
    pub fn class(&self) -> ErrorClass {
        match self {
            ManifestError::Io { .. } => ErrorClass::Internal,
            _ => ErrorClass::Validation,
        }
    }
}

fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> ManifestError {
    ManifestError::Io {
        path: path.into(),
        source,
    }
}

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Manifest {
    ResourceDefinition(ResourceDefinition),
    Composition(Composition),
    Claim(Claim),
    Application(Application),
}

impl Manifest {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Manifest::ResourceDefinition(_) => "ResourceDefinition",
            Manifest::Composition(_) => "Composition",
            Manifest::Claim(_) => "Claim",
            Manifest::Application(_) => "Application",
        }
    }
}

/// One complete view of the source at a point in time.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ManifestSet {
    #[serde(default)]
    pub definitions: BTreeMap<String, ResourceDefinition>,
    #[serde(default)]
    pub compositions: BTreeMap<String, Composition>,
    #[serde(default)]
    pub claims: BTreeMap<UnitId, Claim>,
    #[serde(default)]
    pub applications: BTreeMap<UnitId, Application>,
}

impl ManifestSet {
    pub fn insert(&mut self, manifest: Manifest) -> Result<(), ManifestError> {
        let kind = manifest.kind_name();
        let duplicate = match manifest {
            Manifest::ResourceDefinition(d) => {
                let name = d.metadata.name.clone();
                self.definitions.insert(name.clone(), d).map(|_| name)
            }
            Manifest::Composition(c) => {
                let name = c.metadata.name.clone();
                self.compositions.insert(name.clone(), c).map(|_| name)
            }
            Manifest::Claim(c) => {
                let id = c.id();
                self.claims.insert(id.clone(), c).map(|_| id.0)
            }
            Manifest::Application(a) => {
                let id = a.id();
                self.applications.insert(id.clone(), a).map(|_| id.0)
            }
        };
        match duplicate {
            Some(name) => Err(ManifestError::Duplicate { kind, name }),
            None => Ok(()),
        }
    }

    pub fn len(&self) -> usize {
        self.definitions.len() + self.compositions.len() + self.claims.len() + self.applications.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Content digest used to attribute a revision.
    pub fn digest(&self) -> String {
        canonical_hash(self)
    }
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse one multi-document YAML stream. `origin` is used in error messages.
pub fn parse_manifests(contents: &str, origin: &Path) -> Result<Vec<Manifest>, ManifestError> {
    let mut out = Vec::new();
    for (index, doc) in serde_yaml::Deserializer::from_str(contents).enumerate() {
        let parse_err = |source| ManifestError::Parse {
            path: origin.to_path_buf(),
            index,
            source,
        };
        let value = serde_yaml::Value::deserialize(doc).map_err(parse_err)?;
        if value.is_null() {
            continue;
        }
        let kind = match value.get("kind").and_then(serde_yaml::Value::as_str) {
            Some(k) => k.to_string(),
            None => {
                return Err(ManifestError::MissingKind {
                    path: origin.to_path_buf(),
                    index,
                })
            }
        };
        if !matches!(
            kind.as_str(),
            "ResourceDefinition" | "Composition" | "Claim" | "Application"
        ) {
            return Err(ManifestError::UnknownKind {
                path: origin.to_path_buf(),
                index,
                kind,
            });
        }
        let manifest: Manifest = serde_yaml::from_value(value).map_err(parse_err)?;
        out.push(manifest);
    }
    Ok(out)
}

/// Read every manifest under `dir`, recursively, in sorted path order.
pub fn load_manifests(dir: &Path) -> Result<ManifestSet, ManifestError> {
    let mut files = Vec::new();
    collect_yaml_files(dir, &mut files)?;
    files.sort();

    let mut set = ManifestSet::default();
    for path in files {
        let contents = std::fs::read_to_string(&path).map_err(|e| io_err(&path, e))?;
        for manifest in parse_manifests(&contents, &path)? {
            set.insert(manifest)?;
        }
    }
    Ok(set)
}

fn collect_yaml_files(dir: &Path, out: &mut Vec<PathBuf>) -> Result<(), ManifestError> {
    if !dir.exists() {
        return Ok(());
    }
    let entries = std::fs::read_dir(dir).map_err(|e| io_err(dir, e))?;
    for entry in entries.filter_map(|e| e.ok()) {
        let path = entry.path();
        let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
        if is_dir {
            collect_yaml_files(&path, out)?;
        } else if matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("yaml") | Some("yml")
        ) {
            out.push(path);
        }
    }
    Ok(())
}
