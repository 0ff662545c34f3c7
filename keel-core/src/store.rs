//! Resource Store: versioned desired state plus last-observed state.
//!
//! # Storage layout
//!
//! ```text
//! ~/.keel/
//!   store/
//!     state.yaml            (definitions, compositions, entries, audit log; mode 0600)
//!     revisions/
//!       <id>.yaml           (manifest snapshot per ingested revision; mode 0600)
//! ```
//!
//! # Write roles
//!
//! - the resolver and ingestion write desired state through [`ResourceStore::upsert`]
//! - the scheduler writes apply bookkeeping through [`ResourceStore::commit`],
//!   which fails with [`StoreError::Conflict`] if the desired hash moved since
//!   the scheduler read it
//! - the drift detector writes observed fields only, through
//!   [`ResourceStore::record_observation`]

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::{revisions_dir_at, store_path_at};
use crate::digest::canonical_hash;
use crate::error::{io_err, StoreError};
use crate::manifest::ManifestSet;
use crate::schema::non_additive_changes;
use crate::types::{
    ClaimPhase, Composition, DeletionRequest, DesiredState, ObservedStatus, ReconcilableUnit,
    ResourceDefinition, RevisionId, SyncStatus, UnitId, UnitKind, UnitPhase, UnitSpec,
};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreEntry {
    pub desired: DesiredState,
    pub desired_hash: String,
    /// Bumped on every desired-state change.
    pub generation: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<RevisionId>,
    pub unit: ReconcilableUnit,
}

/// Outcome of writing a desired state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    Created,
    Updated,
    Unchanged,
}

/// Fields the drift detector is allowed to write.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ObservedUpdate {
    pub observed_status: ObservedStatus,
    pub observed_hash: Option<String>,
    pub drifted: bool,
    pub ready: bool,
}

/// Audit-log entry for one ingestion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RevisionRecord {
    pub id: RevisionId,
    pub source: String,
    pub ingested_at: DateTime<Utc>,
    pub digest: String,
    pub documents: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollback_of: Option<RevisionId>,
}

/// Deleted units kept for status reporting; the oldest are dropped first.
pub const TOMBSTONE_LIMIT: usize = 256;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceStore {
    #[serde(default)]
    definitions: BTreeMap<String, ResourceDefinition>,
    #[serde(default)]
    compositions: BTreeMap<String, Composition>,
    #[serde(default)]
    entries: BTreeMap<UnitId, StoreEntry>,
    /// Units removed after deletion, kept for status reporting.
    #[serde(default)]
    tombstones: BTreeMap<UnitId, ReconcilableUnit>,
    #[serde(default)]
    revisions: Vec<RevisionRecord>,
}

impl ResourceStore {
    pub fn new() -> Self {
        Self::default()
    }

    // -----------------------------------------------------------------------
    // Definitions and compositions
    // -----------------------------------------------------------------------

    /// Insert or replace a definition.
    ///
    /// While claims of the definition's kind exist, only additive schema
    /// changes are accepted; otherwise the previous definition is kept.
    pub fn put_definition(&mut self, definition: ResourceDefinition) -> Result<bool, StoreError> {
        let name = definition.metadata.name.clone();
        if let Some(existing) = self.definitions.get(&name) {
            if existing == &definition {
                return Ok(false);
            }
            if self.has_claims_of_kind(&existing.spec.claim_kind) {
                let mut reasons = non_additive_changes(&existing.spec.schema, &definition.spec.schema);
                if existing.spec.claim_kind != definition.spec.claim_kind {
                    reasons.push("claimKind changed".to_string());
                }
                if existing.spec.composite_kind != definition.spec.composite_kind {
                    reasons.push("compositeKind changed".to_string());
                }
                if !reasons.is_empty() {
                    return Err(StoreError::ImmutableDefinition {
                        name,
                        reasons: reasons.join("; "),
                    });
                }
            }
        }
        self.definitions.insert(name, definition);
        Ok(true)
    }

    /// Remove a definition that no longer appears in the source.
    pub fn remove_definition(&mut self, name: &str) -> Result<(), StoreError> {
        if let Some(existing) = self.definitions.get(name) {
            if self.has_claims_of_kind(&existing.spec.claim_kind) {
                return Err(StoreError::ImmutableDefinition {
                    name: name.to_string(),
                    reasons: format!("claims of kind {} still exist", existing.spec.claim_kind),
                });
            }
        }
        self.definitions.remove(name);
        Ok(())
    }

    pub fn put_composition(&mut self, composition: Composition) -> bool {
        let name = composition.metadata.name.clone();
        if self.compositions.get(&name) == Some(&composition) {
            return false;
        }
        self.compositions.insert(name, composition);
        true
    }

    pub fn remove_composition(&mut self, name: &str) -> Option<Composition> {
        self.compositions.remove(name)
    }

    pub fn definitions(&self) -> impl Iterator<Item = &ResourceDefinition> {
        self.definitions.values()
    }

    pub fn definition(&self, name: &str) -> Option<&ResourceDefinition> {
        self.definitions.get(name)
    }

    /// Every definition whose claim kind is `claim_kind`.
    pub fn definitions_for_kind(&self, claim_kind: &str) -> Vec<&ResourceDefinition> {
        self.definitions
            .values()
            .filter(|d| d.spec.claim_kind == claim_kind)
            .collect()
    }

    pub fn compositions(&self) -> impl Iterator<Item = &Composition> {
        self.compositions.values()
    }

    pub fn composition(&self, name: &str) -> Option<&Composition> {
        self.compositions.get(name)
    }

    fn has_claims_of_kind(&self, claim_kind: &str) -> bool {
        self.entries.values().any(|e| match &e.desired {
            DesiredState::Claim(c) => c.spec.claim_kind == claim_kind && !e.unit.is_deleting(),
            _ => false,
        })
    }

    // -----------------------------------------------------------------------
    // Desired state
    // -----------------------------------------------------------------------

    /// Write the desired state of one unit.
    ///
    /// A changed hash bumps the generation, clears retry and fatal gating and
    /// sends the unit back to `Pending`. Scheduling metadata (wave, edges,
    /// sync policy) is refreshed either way.
    pub fn upsert(
        &mut self,
        id: &UnitId,
        desired: DesiredState,
        spec: &UnitSpec,
        revision: Option<RevisionId>,
    ) -> Upsert {
        let hash = canonical_hash(&desired);
        self.tombstones.remove(id);

        let Some(entry) = self.entries.get_mut(id) else {
            let unit = ReconcilableUnit::new(id.clone(), desired.kind(), spec);
            self.entries.insert(
                id.clone(),
                StoreEntry {
                    desired,
                    desired_hash: hash,
                    generation: 1,
                    revision,
                    unit,
                },
            );
            return Upsert::Created;
        };

        let unit = &mut entry.unit;
        let mut result = Upsert::Unchanged;
        if unit.wave.declared != spec.wave
            || unit.depends_on != spec.depends_on
            || unit.owner != spec.owner
            || unit.sync_policy != spec.sync_policy
        {
            unit.wave.declared = spec.wave;
            unit.wave.computed = None;
            unit.depends_on = spec.depends_on.clone();
            unit.owner = spec.owner.clone();
            unit.sync_policy = spec.sync_policy;
            result = Upsert::Updated;
        }
        if unit.prune_pending {
            unit.prune_pending = false;
            result = Upsert::Updated;
        }

        if entry.desired_hash != hash {
            entry.desired = desired;
            entry.desired_hash = hash;
            entry.generation += 1;
            entry.revision = revision;
            let unit = &mut entry.unit;
            unit.attempts = 0;
            unit.retry_after = None;
            unit.fatal = None;
            if !unit.is_deleting() {
                unit.sync_status = SyncStatus::OutOfSync;
                if unit.phase != UnitPhase::Applying {
                    unit.transition(UnitPhase::Pending, "desired state changed");
                }
            }
            result = Upsert::Updated;
        }
        result
    }

    pub fn get(&self, id: &UnitId) -> Option<&StoreEntry> {
        self.entries.get(id)
    }

    pub fn contains(&self, id: &UnitId) -> bool {
        self.entries.contains_key(id)
    }

    pub fn entries(&self) -> impl Iterator<Item = &StoreEntry> {
        self.entries.values()
    }

    pub fn ids(&self) -> impl Iterator<Item = &UnitId> {
        self.entries.keys()
    }

    pub fn units(&self) -> impl Iterator<Item = &ReconcilableUnit> {
        self.entries.values().map(|e| &e.unit)
    }

    pub fn tombstones(&self) -> impl Iterator<Item = &ReconcilableUnit> {
        self.tombstones.values()
    }

    pub fn tombstone(&self, id: &UnitId) -> Option<&ReconcilableUnit> {
        self.tombstones.get(id)
    }

    /// Units whose owner is `owner`.
    pub fn children_of(&self, owner: &UnitId) -> Vec<UnitId> {
        self.entries
            .values()
            .filter(|e| e.unit.owner.as_ref() == Some(owner))
            .map(|e| e.unit.id.clone())
            .collect()
    }

    pub fn ids_of_kind(&self, kind: UnitKind) -> BTreeSet<UnitId> {
        self.entries
            .values()
            .filter(|e| e.unit.kind == kind)
            .map(|e| e.unit.id.clone())
            .collect()
    }

    // -----------------------------------------------------------------------
    // Scheduler writes
    // -----------------------------------------------------------------------

    /// Optimistic write: applies `f` only if the desired hash still equals
    /// `expected_hash`.
    pub fn commit<F>(&mut self, id: &UnitId, expected_hash: &str, f: F) -> Result<(), StoreError>
    where
        F: FnOnce(&mut ReconcilableUnit),
    {
        let entry = self
            .entries
            .get_mut(id)
            .ok_or_else(|| StoreError::UnitNotFound(id.clone()))?;
        if entry.desired_hash != expected_hash {
            return Err(StoreError::Conflict {
                id: id.clone(),
                expected: expected_hash.to_string(),
                actual: entry.desired_hash.clone(),
            });
        }
        f(&mut entry.unit);
        Ok(())
    }

    /// Unconditional bookkeeping write for fields not derived from the desired spec.
    pub fn update_unit<F>(&mut self, id: &UnitId, f: F) -> Result<(), StoreError>
    where
        F: FnOnce(&mut ReconcilableUnit),
    {
        let entry = self
            .entries
            .get_mut(id)
            .ok_or_else(|| StoreError::UnitNotFound(id.clone()))?;
        f(&mut entry.unit);
        Ok(())
    }

    /// Record what the drift detector saw. Returns `true` if anything changed.
    pub fn record_observation(
        &mut self,
        id: &UnitId,
        update: ObservedUpdate,
    ) -> Result<bool, StoreError> {
        let entry = self
            .entries
            .get_mut(id)
            .ok_or_else(|| StoreError::UnitNotFound(id.clone()))?;
        let unit = &mut entry.unit;
        let changed = unit.observed_status != update.observed_status
            || unit.observed_hash != update.observed_hash
            || unit.drifted != update.drifted
            || unit.ready != update.ready;
        unit.observed_status = update.observed_status;
        unit.observed_hash = update.observed_hash;
        unit.drifted = update.drifted;
        unit.ready = update.ready;
        Ok(changed)
    }

    /// Put a unit on the deletion path. Idempotent; `force` is sticky.
    pub fn request_deletion(&mut self, id: &UnitId, force: bool) -> Result<(), StoreError> {
        let entry = self
            .entries
            .get_mut(id)
            .ok_or_else(|| StoreError::UnitNotFound(id.clone()))?;
        let unit = &mut entry.unit;
        match &mut unit.deletion {
            Some(req) => req.force |= force,
            None => {
                unit.deletion = Some(DeletionRequest {
                    requested_at: Utc::now(),
                    force,
                    attempts: 0,
                    stuck: false,
                });
            }
        }
        unit.retry_after = None;
        if unit.kind == UnitKind::Claim {
            unit.claim_phase = Some(ClaimPhase::Deleting);
        }
        if unit.phase != UnitPhase::Applying {
            unit.transition(UnitPhase::Deleting, "deletion requested");
        }
        Ok(())
    }

    /// Drop a unit from the live set, leaving a `Deleted` tombstone.
    pub fn remove(&mut self, id: &UnitId) -> Option<StoreEntry> {
        let entry = self.entries.remove(id)?;
        let mut unit = entry.unit.clone();
        unit.transition(UnitPhase::Deleted, "deleted");
        unit.sync_status = SyncStatus::Synced;
        unit.observed_status = ObservedStatus::Missing;
        unit.retry_after = None;
        unit.applying_since = None;
        if unit.kind == UnitKind::Claim {
            unit.claim_phase = Some(ClaimPhase::Deleted);
        }
        self.tombstones.insert(id.clone(), unit);
        self.evict_tombstones();
        Some(entry)
    }

    fn evict_tombstones(&mut self) {
        while self.tombstones.len() > TOMBSTONE_LIMIT {
            let oldest = self
                .tombstones
                .values()
                .min_by(|a, b| {
                    a.last_transition_time
                        .cmp(&b.last_transition_time)
                        .then_with(|| a.id.cmp(&b.id))
                })
                .map(|u| u.id.clone());
            match oldest {
                Some(id) => self.tombstones.remove(&id),
                None => break,
            };
        }
    }

    // -----------------------------------------------------------------------
    // Revisions
    // -----------------------------------------------------------------------

    /// Attribute the next monotonically increasing revision id to `set`.
    pub fn record_revision(
        &mut self,
        set: &ManifestSet,
        source: impl Into<String>,
        rollback_of: Option<RevisionId>,
    ) -> RevisionRecord {
        let next = self.revisions.last().map_or(1, |r| r.id.0 + 1);
        let record = RevisionRecord {
            id: RevisionId(next),
            source: source.into(),
            ingested_at: Utc::now(),
            digest: set.digest(),
            documents: set.len(),
            rollback_of,
        };
        self.revisions.push(record.clone());
        record
    }

    pub fn revisions(&self) -> &[RevisionRecord] {
        &self.revisions
    }

    pub fn latest_revision(&self) -> Option<&RevisionRecord> {
        self.revisions.last()
    }

    pub fn revision(&self, id: RevisionId) -> Option<&RevisionRecord> {
        self.revisions.iter().find(|r| r.id == id)
    }

    // -----------------------------------------------------------------------
    // Persistence
    // -----------------------------------------------------------------------

    /// Load `<home>/.keel/store/state.yaml`, or an empty store if absent.
    pub fn load_at(home: &Path) -> Result<Self, StoreError> {
        let path = store_path_at(home);
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(&path).map_err(|e| io_err(&path, e))?;
        let mut store: Self = serde_yaml::from_str(&contents)
            .map_err(|source| StoreError::Parse { path, source })?;
        store.evict_tombstones();
        Ok(store)
    }

    /// `load_at` convenience wrapper.
    pub fn load() -> Result<Self, StoreError> {
        Self::load_at(&home()?)
    }

    /// Atomically persist the store.
    pub fn save_at(&self, home: &Path) -> Result<PathBuf, StoreError> {
        let path = store_path_at(home);
        let yaml = serde_yaml::to_string(self)?;
        write_atomic(&path, &yaml)?;
        Ok(path)
    }

    /// `save_at` convenience wrapper.
    pub fn save(&self) -> Result<PathBuf, StoreError> {
        self.save_at(&home()?)
    }
}

/// `<home>/.keel/store/revisions/<id>.yaml`
pub fn revision_path_at(home: &Path, id: RevisionId) -> PathBuf {
    revisions_dir_at(home).join(format!("{}.yaml", id.0))
}

/// Persist the manifest set ingested as revision `id`.
pub fn save_revision_snapshot_at(
    home: &Path,
    id: RevisionId,
    set: &ManifestSet,
) -> Result<PathBuf, StoreError> {
    let path = revision_path_at(home, id);
    let yaml = serde_yaml::to_string(set)?;
    write_atomic(&path, &yaml)?;
    Ok(path)
}

pub fn load_revision_snapshot_at(home: &Path, id: RevisionId) -> Result<ManifestSet, StoreError> {
    let path = revision_path_at(home, id);
    if !path.exists() {
        return Err(StoreError::RevisionNotFound(id.0));
    }
    let contents = std::fs::read_to_string(&path).map_err(|e| io_err(&path, e))?;
    serde_yaml::from_str(&contents).map_err(|source| StoreError::Parse { path, source })
}

// ---------------------------------------------------------------------------
// Private helpers
// ---------------------------------------------------------------------------

fn home() -> Result<PathBuf, StoreError> {
    dirs::home_dir().ok_or(StoreError::HomeNotFound)
}

/// `.tmp` sibling, `chmod 0600`, `rename`. Parent directories are created `0700`.
fn write_atomic(path: &Path, contents: &str) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        if !parent.exists() {
            std::fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
            set_permissions(parent, 0o700)?;
        }
    }
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = path.with_file_name(format!("{file_name}.tmp"));
    std::fs::write(&tmp, contents).map_err(|e| io_err(&tmp, e))?;
    set_permissions(&tmp, 0o600)?;
    std::fs::rename(&tmp, path).map_err(|e| io_err(path, e))?;
    Ok(())
}

#[cfg(unix)]
fn set_permissions(path: &Path, mode: u32) -> Result<(), StoreError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
        .map_err(|e| io_err(path, e))
}
#[cfg(not(unix))]
fn set_permissions(_path: &Path, _mode: u32) -> Result<(), StoreError> {
    Ok(())
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
