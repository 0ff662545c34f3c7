//! Source ingestion: manifest set -> Resource Store.
//!
//! ## `ingest` order
//!
//! 1. Record a new revision (and its snapshot when a home is given).
//! 2. Put definitions. Breaking changes to a definition with live claims are
//!    rejected and the previous definition is kept.
//! 3. Put compositions, drop the ones no longer in the source.
//! 4. Upsert claims and resolve each one. Resolution errors are pinned to
//!    the claim as a fatal record.
//! 5. Upsert applications.
//! 6. Claims and applications gone from the source are deleted when
//!    `autoPrune` is set, otherwise marked `OutOfSync`.
//! 7. Drop definitions no longer in the source, unless claims still use them.

use std::collections::BTreeSet;
use std::path::Path;

use keel_compose::resolve_into;
use keel_core::store::{load_revision_snapshot_at, save_revision_snapshot_at};
use keel_core::types::FatalRecord;
use keel_core::{
    DesiredState, ErrorClass, ManifestSet, ResourceStore, RevisionId, SyncStatus, UnitId, UnitKind,
    UnitPhase, UnitSpec, Upsert,
};
use serde::Serialize;
use tracing::{info, warn};

use crate::deletion::cascade_delete;
use crate::error::SyncError;

/// Something ingestion refused, with its error class.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Rejection {
    pub subject: String,
    pub class: ErrorClass,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IngestReport {
    pub revision: RevisionId,
    pub created: Vec<UnitId>,
    pub updated: Vec<UnitId>,
    pub unchanged: usize,
    /// Generated resources no longer produced by their composition.
    pub prune_pending: Vec<UnitId>,
    /// Units put on the deletion path because they left the source.
    pub removed: Vec<UnitId>,
    /// Units that left the source but stay because `autoPrune` is off.
    pub out_of_sync: Vec<UnitId>,
    pub rejected: Vec<Rejection>,
}

impl IngestReport {
    fn new(revision: RevisionId) -> Self {
        Self {
            revision,
            created: Vec::new(),
            updated: Vec::new(),
            unchanged: 0,
            prune_pending: Vec::new(),
            removed: Vec::new(),
            out_of_sync: Vec::new(),
            rejected: Vec::new(),
        }
    }

    fn record(&mut self, id: UnitId, result: Upsert) {
        match result {
            Upsert::Created => self.created.push(id),
            Upsert::Updated => self.updated.push(id),
            Upsert::Unchanged => self.unchanged += 1,
        }
    }

    fn reject(&mut self, subject: impl Into<String>, class: ErrorClass, message: impl Into<String>) {
        let rejection = Rejection {
            subject: subject.into(),
            class,
            message: message.into(),
        };
        warn!(subject = %rejection.subject, class = %class, "{}", rejection.message);
        self.rejected.push(rejection);
    }

    /// Most severe class among the rejections, for exit codes.
    pub fn worst_class(&self) -> Option<ErrorClass> {
        self.rejected.iter().map(|r| r.class).max_by_key(|c| c.exit_code())
    }
}

/// Apply `set` as the new desired state.
pub fn ingest(
    store: &mut ResourceStore,
    set: &ManifestSet,
    source: &str,
    rollback_of: Option<RevisionId>,
    home: Option<&Path>,
) -> Result<IngestReport, SyncError> {
    let record = store.record_revision(set, source, rollback_of);
    if let Some(home) = home {
        save_revision_snapshot_at(home, record.id, set)?;
    }
    let revision = record.id;
    let mut report = IngestReport::new(revision);

    for definition in set.definitions.values() {
        let name = definition.metadata.name.clone();
        if let Err(e) = store.put_definition(definition.clone()) {
            report.reject(format!("definition/{name}"), e.class(), e.to_string());
        }
    }

    for composition in set.compositions.values() {
        store.put_composition(composition.clone());
    }
    let stale: Vec<String> = store
        .compositions()
        .map(|c| c.metadata.name.clone())
        .filter(|name| !set.compositions.contains_key(name))
        .collect();
    for name in stale {
        store.remove_composition(&name);
        info!(composition = %name, "composition removed");
    }

    for (id, claim) in &set.claims {
        let spec = UnitSpec {
            wave: claim.spec.wave,
            depends_on: claim.spec.depends_on.iter().cloned().collect(),
            owner: None,
            sync_policy: claim.spec.sync_policy,
        };
        let result = store.upsert(id, DesiredState::Claim(claim.clone()), &spec, Some(revision));
        report.record(id.clone(), result);
        if store.get(id).is_some_and(|e| e.unit.is_deleting()) {
            continue;
        }

        match resolve_into(store, claim, Some(revision)) {
            Ok(outcome) => {
                report.created.extend(outcome.created);
                report.updated.extend(outcome.updated);
                report.unchanged += outcome.unchanged.len();
                report.prune_pending.extend(outcome.pruned);
                store.update_unit(id, |unit| {
                    if unit.fatal.take().is_some() && unit.phase == UnitPhase::Error {
                        unit.sync_status = SyncStatus::OutOfSync;
                        unit.transition(UnitPhase::Pending, "resolved");
                    }
                })?;
            }
            Err(e) => {
                let class = e.class();
                let message = e.to_string();
                let hash = store.get(id).map(|e| e.desired_hash.clone()).unwrap_or_default();
                store.update_unit(id, |unit| {
                    unit.fatal = Some(FatalRecord {
                        class,
                        input_hash: hash,
                    });
                    unit.sync_status = SyncStatus::Error;
                    unit.transition(UnitPhase::Error, format!("{class}: {message}"));
                })?;
                report.reject(id.to_string(), class, e.to_string());
            }
        }
    }

    for (id, app) in &set.applications {
        let spec = UnitSpec {
            wave: app.spec.wave,
            depends_on: app.spec.depends_on.iter().cloned().collect(),
            owner: None,
            sync_policy: app.spec.sync_policy,
        };
        let result = store.upsert(id, DesiredState::Application(app.clone()), &spec, Some(revision));
        report.record(id.clone(), result);
    }

    remove_absent(store, set, &mut report)?;

    let stale: Vec<String> = store
        .definitions()
        .map(|d| d.metadata.name.clone())
        .filter(|name| !set.definitions.contains_key(name))
        .collect();
    for name in stale {
        if let Err(e) = store.remove_definition(&name) {
            report.reject(format!("definition/{name}"), e.class(), e.to_string());
        }
    }

    info!(
        revision = %revision,
        source,
        created = report.created.len(),
        updated = report.updated.len(),
        removed = report.removed.len(),
        rejected = report.rejected.len(),
        "ingested"
    );
    Ok(report)
}

/// Top-level units (claims and applications) that left the source.
fn remove_absent(
    store: &mut ResourceStore,
    set: &ManifestSet,
    report: &mut IngestReport,
) -> Result<(), SyncError> {
    let mut present: BTreeSet<&UnitId> = set.claims.keys().collect();
    present.extend(set.applications.keys());

    let mut absent: Vec<UnitId> = store.ids_of_kind(UnitKind::Claim).into_iter().collect();
    absent.extend(store.ids_of_kind(UnitKind::Application));
    absent.retain(|id| !present.contains(id));

    for id in absent {
        let Some(unit) = store.get(&id).map(|e| &e.unit) else {
            continue;
        };
        if unit.is_deleting() {
            continue;
        }
        if unit.sync_policy.auto_prune {
            let ids = cascade_delete(store, &id, false)?;
            info!(unit = %id, cascade = ids.len(), "removed from source; deleting");
            report.removed.extend(ids);
        } else {
            store.update_unit(&id, |unit| {
                unit.sync_status = SyncStatus::OutOfSync;
                unit.message = "removed from source; autoPrune disabled".to_string();
            })?;
            report.out_of_sync.push(id);
        }
    }
    Ok(())
}

/// Re-ingest the snapshot of `revision` as a new revision.
pub fn rollback(
    store: &mut ResourceStore,
    home: &Path,
    revision: RevisionId,
) -> Result<IngestReport, SyncError> {
    if store.revision(revision).is_none() {
        return Err(keel_core::StoreError::RevisionNotFound(revision.0).into());
    }
    let set = load_revision_snapshot_at(home, revision)?;
    info!(revision = %revision, "rolling back");
    ingest(store, &set, &format!("rollback to {revision}"), Some(revision), Some(home))
}

/// `true` when the latest revision already holds exactly `set`.
pub fn is_current(store: &ResourceStore, set: &ManifestSet) -> bool {
    store
        .latest_revision()
        .is_some_and(|latest| latest.digest == set.digest())
}
