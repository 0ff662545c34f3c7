//! Reconciliation Scheduler.
//!
//! One pass runs in this order:
//!
//! 1. watchdog: units stuck in `Applying` past the deadline become timeouts
//! 2. grouping: effective waves are recomputed, cycle members are reported
//!    and never scheduled
//! 3. waves, ascending: readiness polls, then admission behind the wave
//!    barrier, then a pool of workers applies the admitted units
//! 4. pruning of units no longer produced, once their wave is healthy
//! 5. deletions in reverse wave order, dependents first
//! 6. readiness aggregation for composites and claims
//!
//! The store sits behind a `tokio::sync::Mutex` that is never held across a
//! provisioner call. Results are written back with [`ResourceStore::commit`],
//! so a desired state that moved during an apply is a conflict, not a lost
//! update.

use std::cmp::Reverse;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use keel_compose::is_ready;
use keel_core::types::FatalRecord;
use keel_core::{
    canonical_hash, ClaimPhase, DeletionPolicy, DesiredState, EngineConfig, ManifestSet,
    ObservedStatus, ReconcilableUnit, ResourceStore, StoreEntry, StoreError, SyncStatus, UnitId,
    UnitKind, UnitPhase, UnitStatus, DEFAULT_ADAPTER,
};
use keel_graph::{group, plan, GraphError, GraphNode, WavePlan};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::backoff::Backoff;
use crate::clock::Clock;
use crate::deletion::{cascade_delete, live_dependents};
use crate::drift::live_matches;
use crate::error::{AdapterError, SyncError};
use crate::pipeline::{self, IngestReport};
use crate::provisioner::{resource_ref, resource_spec, ProvisionerRegistry};
use crate::queue::WorkQueue;

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

/// What one reconciliation pass did.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PassReport {
    pub applied: Vec<UnitId>,
    /// Units whose desired state was already realised.
    pub unchanged: usize,
    pub failed: Vec<UnitId>,
    pub pruned: Vec<UnitId>,
    pub deleted: Vec<UnitId>,
    /// Units held back by the wave barrier or an upstream configuration error.
    pub blocked: Vec<UnitId>,
    pub conflicts: Vec<UnitId>,
    pub cycle_errors: Vec<Vec<UnitId>>,
    /// Units that became ready or synced without an apply.
    pub settled: Vec<UnitId>,
    pub retry_pending: usize,
    pub awaiting_ready: usize,
}

impl PassReport {
    /// `true` when another pass could make further progress right away.
    pub fn progressed(&self) -> bool {
        !self.applied.is_empty()
            || !self.deleted.is_empty()
            || !self.pruned.is_empty()
            || !self.conflicts.is_empty()
            || !self.settled.is_empty()
    }

    /// Fold a later report into this one. Counters describing the current
    /// state (`unchanged`, `retry_pending`, `awaiting_ready`, `blocked`,
    /// `cycle_errors`) take the later value.
    pub fn merge(&mut self, later: PassReport) {
        self.applied.extend(later.applied);
        self.failed.extend(later.failed);
        self.pruned.extend(later.pruned);
        self.deleted.extend(later.deleted);
        self.conflicts.extend(later.conflicts);
        self.settled.extend(later.settled);
        self.unchanged = later.unchanged;
        self.blocked = later.blocked;
        self.cycle_errors = later.cycle_errors;
        self.retry_pending = later.retry_pending;
        self.awaiting_ready = later.awaiting_ready;
    }

    fn absorb(&mut self, worker: PassReport) {
        self.applied.extend(worker.applied);
        self.failed.extend(worker.failed);
        self.conflicts.extend(worker.conflicts);
        self.blocked.extend(worker.blocked);
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub(crate) struct ApplyJob {
    desired: DesiredState,
    desired_hash: String,
    reason: &'static str,
}

/// Outcome of realising one unit.
#[derive(Debug, Clone)]
enum Applied {
    /// Claims and composites are bound inside the engine.
    Internal,
    External {
        name: String,
        observed_hash: String,
        ready: bool,
    },
}

enum Step {
    Skip,
    RetryPending,
    Unchanged,
    Apply(&'static str),
}

pub struct Scheduler {
    store: Arc<Mutex<ResourceStore>>,
    provisioners: ProvisionerRegistry,
    config: EngineConfig,
    backoff: Backoff,
    clock: Clock,
    queue: Arc<WorkQueue<ApplyJob>>,
    pass_lock: Mutex<()>,
}

impl Scheduler {
    pub fn new(store: ResourceStore, provisioners: ProvisionerRegistry, config: EngineConfig) -> Self {
        Self::with_shared_store(Arc::new(Mutex::new(store)), provisioners, config)
    }

    pub fn with_shared_store(
        store: Arc<Mutex<ResourceStore>>,
        provisioners: ProvisionerRegistry,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            provisioners,
            backoff: Backoff::new(&config.backoff),
            config,
            clock: Clock::new(),
            queue: Arc::new(WorkQueue::new()),
            pass_lock: Mutex::new(()),
        }
    }

    pub fn store(&self) -> Arc<Mutex<ResourceStore>> {
        Arc::clone(&self.store)
    }

    pub fn provisioners(&self) -> &ProvisionerRegistry {
        &self.provisioners
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn clock(&self) -> Clock {
        self.clock
    }

    // -----------------------------------------------------------------------
    // Public operations
    // -----------------------------------------------------------------------

    /// Ingest a manifest set into the shared store.
    pub async fn ingest(
        &self,
        set: &ManifestSet,
        source: &str,
        home: Option<&std::path::Path>,
    ) -> Result<IngestReport, SyncError> {
        let mut store = self.store.lock().await;
        pipeline::ingest(&mut store, set, source, None, home)
    }

    /// Re-ingest a recorded revision's snapshot as a new revision.
    pub async fn rollback(
        &self,
        home: &std::path::Path,
        revision: keel_core::RevisionId,
    ) -> Result<IngestReport, SyncError> {
        let mut store = self.store.lock().await;
        pipeline::rollback(&mut store, home, revision)
    }

    /// Strict dependency check over every unit in the store.
    pub async fn validate_graph(&self) -> Result<Vec<Vec<UnitId>>, GraphError> {
        let store = self.store.lock().await;
        let nodes: Vec<GraphNode> = store.units().map(GraphNode::from).collect();
        group(&nodes)
    }

    /// Read-only status of every unit, including deleted tombstones.
    pub async fn statuses(&self) -> Vec<UnitStatus> {
        let store = self.store.lock().await;
        store
            .units()
            .chain(store.tombstones())
            .map(ReconcilableUnit::status)
            .collect()
    }

    /// Clear fatal, backoff and stuck-delete gating on `id` and forget its
    /// last applied hash so the next pass applies it again.
    pub async fn force_sync(&self, id: &UnitId) -> Result<(), SyncError> {
        let mut store = self.store.lock().await;
        if !store.contains(id) {
            return Err(SyncError::UnitNotFound(id.clone()));
        }
        store.update_unit(id, |unit| {
            unit.fatal = None;
            unit.retry_after = None;
            unit.attempts = 0;
            unit.last_applied_hash = None;
            unit.drifted = false;
            if let Some(req) = unit.deletion.as_mut() {
                req.attempts = 0;
                req.stuck = false;
                unit.message = "deletion retry forced".to_string();
            } else if unit.phase != UnitPhase::Applying {
                unit.sync_status = SyncStatus::OutOfSync;
                unit.transition(UnitPhase::Pending, "sync forced");
            }
        })?;
        info!(unit = %id, "sync forced");
        Ok(())
    }

    /// Request deletion of `id` and everything that depends on it.
    ///
    /// Queued applies for those units are cancelled and the units go straight
    /// to `Deleting`; applies already in flight complete first.
    pub async fn request_delete(&self, id: &UnitId, force: bool) -> Result<Vec<UnitId>, SyncError> {
        let mut store = self.store.lock().await;
        if !store.contains(id) {
            return Err(SyncError::UnitNotFound(id.clone()));
        }
        let ids = cascade_delete(&mut store, id, force)?;
        let targets: BTreeSet<UnitId> = ids.iter().cloned().collect();
        for cancelled in self.queue.cancel(&targets) {
            store.update_unit(&cancelled, |unit| {
                unit.transition(UnitPhase::Deleting, "queued apply cancelled; deleting");
            })?;
            debug!(unit = %cancelled, "apply cancelled");
        }
        info!(unit = %id, cascade = ids.len(), force, "delete requested");
        Ok(ids)
    }

    /// Finalizer bypass: remove `id` and its dependents without calling the
    /// provisioner's delete.
    pub async fn force_delete(&self, id: &UnitId) -> Result<Vec<UnitId>, SyncError> {
        warn!(unit = %id, "force delete: external objects are left in place");
        self.request_delete(id, true).await
    }

    /// Earliest pending retry deadline, if any.
    pub async fn next_retry(&self) -> Option<DateTime<Utc>> {
        let store = self.store.lock().await;
        store.units().filter_map(|u| u.retry_after).min()
    }

    /// Run passes until one makes no progress, sleeping through pending
    /// retries and readiness waits. Bounded by `max_passes`.
    pub async fn run_until_settled(&self, max_passes: usize) -> Result<PassReport, SyncError> {
        let mut total = PassReport::default();
        for pass in 1..=max_passes.max(1) {
            let report = self.reconcile_pass().await?;
            let progressed = report.progressed();
            let awaiting_ready = report.awaiting_ready;
            total.merge(report);
            if progressed || pass == max_passes {
                continue;
            }
            // Failures from this pass are not counted as pending yet.
            if let Some(at) = self.next_retry().await {
                tokio::time::sleep(self.clock.until(at)).await;
                continue;
            }
            if awaiting_ready > 0 {
                tokio::time::sleep(self.config.resync_interval()).await;
                continue;
            }
            break;
        }
        Ok(total)
    }

    /// One full reconciliation pass. Passes never overlap.
    pub async fn reconcile_pass(&self) -> Result<PassReport, SyncError> {
        let _pass = self.pass_lock.lock().await;
        let mut report = PassReport::default();

        self.watchdog(&mut report).await?;
        let plan = self.assign_waves(&mut report).await?;
        for (wave, ids) in plan.ordered_waves() {
            self.reconcile_wave(wave, &ids, &plan, &mut report).await?;
        }
        self.prune(&plan, &mut report).await?;
        self.process_deletions(&mut report).await?;
        {
            let mut store = self.store.lock().await;
            aggregate(&mut store, &plan)?;
        }

        debug!(
            applied = report.applied.len(),
            unchanged = report.unchanged,
            failed = report.failed.len(),
            deleted = report.deleted.len(),
            blocked = report.blocked.len(),
            "pass complete"
        );
        Ok(report)
    }

    // -----------------------------------------------------------------------
    // Pass stages
    // -----------------------------------------------------------------------

    async fn watchdog(&self, report: &mut PassReport) -> Result<(), SyncError> {
        let now = self.clock.now();
        let deadline = chrono::Duration::from_std(self.config.watchdog_deadline())
            .unwrap_or_else(|_| chrono::Duration::zero());
        let mut store = self.store.lock().await;
        let stale: Vec<(UnitId, String)> = store
            .entries()
            .filter(|e| e.unit.phase == UnitPhase::Applying && !self.queue.is_in_flight(&e.unit.id))
            .filter(|e| e.unit.applying_since.map_or(true, |since| now - since > deadline))
            .map(|e| (e.unit.id.clone(), e.desired_hash.clone()))
            .collect();
        let err = AdapterError::Timeout(self.config.watchdog_deadline());
        for (id, hash) in stale {
            store.update_unit(&id, |unit| record_failure(unit, &hash, &err, &self.backoff, now))?;
            warn!(unit = %id, "apply exceeded watchdog deadline; requeued");
            report.failed.push(id);
        }
        Ok(())
    }

    async fn assign_waves(&self, report: &mut PassReport) -> Result<Arc<WavePlan>, SyncError> {
        let mut store = self.store.lock().await;
        let nodes: Vec<GraphNode> = store.units().map(GraphNode::from).collect();
        let grouping = plan(&nodes);

        for (id, wave) in grouping.plan.iter() {
            store.update_unit(id, |unit| unit.wave.computed = Some(wave))?;
        }
        for cycle in &grouping.cycles {
            let members = cycle
                .iter()
                .map(UnitId::as_str)
                .collect::<Vec<_>>()
                .join(", ");
            warn!(units = %members, "dependency cycle");
            for id in cycle {
                store.update_unit(id, |unit| {
                    unit.wave.computed = None;
                    if !unit.is_deleting() {
                        unit.sync_status = SyncStatus::Error;
                        unit.transition(UnitPhase::Error, format!("dependency cycle: {members}"));
                    }
                })?;
            }
        }
        for (id, dependency) in &grouping.missing {
            store.update_unit(id, |unit| {
                unit.wave.computed = None;
                if !unit.is_deleting() {
                    unit.sync_status = SyncStatus::Error;
                    unit.transition(
                        UnitPhase::Error,
                        format!("depends on unknown unit {dependency}"),
                    );
                }
            })?;
        }
        for id in &grouping.blocked {
            store.update_unit(id, |unit| {
                unit.wave.computed = None;
                if !unit.is_deleting() && unit.phase != UnitPhase::Applying {
                    unit.transition(UnitPhase::Pending, "blocked by an upstream dependency error");
                }
            })?;
        }

        report.cycle_errors = grouping.cycles.clone();
        report.blocked.extend(grouping.blocked.iter().cloned());
        Ok(Arc::new(grouping.plan))
    }

    async fn reconcile_wave(
        &self,
        wave: i64,
        ids: &[UnitId],
        plan: &Arc<WavePlan>,
        report: &mut PassReport,
    ) -> Result<(), SyncError> {
        let now = self.clock.now();

        // Poll units that were applied but not yet confirmed ready.
        let polls: Vec<(UnitId, DesiredState, String)> = {
            let store = self.store.lock().await;
            ids.iter()
                .filter_map(|id| store.get(id))
                .filter(|e| self.needs_poll(e, now))
                .map(|e| (e.unit.id.clone(), e.desired.clone(), e.desired_hash.clone()))
                .collect()
        };
        for (id, desired, hash) in polls {
            self.poll(&id, &desired, &hash, report).await?;
        }

        // Admission.
        let mut jobs = Vec::new();
        {
            let mut store = self.store.lock().await;
            for id in ids {
                let Some(entry) = store.get(id) else { continue };
                match self.step(entry, now) {
                    Step::Skip => {}
                    Step::RetryPending => report.retry_pending += 1,
                    Step::Unchanged => self.settle(&mut store, id, plan, report)?,
                    Step::Apply(reason) => {
                        let waiting = waiting_on(&store, plan, &entry.unit);
                        if waiting.is_empty() {
                            jobs.push((
                                id.clone(),
                                ApplyJob {
                                    desired: entry.desired.clone(),
                                    desired_hash: entry.desired_hash.clone(),
                                    reason,
                                },
                            ));
                        } else {
                            block(&mut store, id, &waiting)?;
                            report.blocked.push(id.clone());
                        }
                    }
                }
            }
        }
        if jobs.is_empty() {
            return Ok(());
        }

        debug!(wave, jobs = jobs.len(), "dispatching wave");
        let workers = self.config.max_concurrency.max(1).min(jobs.len());
        for (id, job) in jobs {
            self.queue.push(id, job);
        }

        let mut set = JoinSet::new();
        for _ in 0..workers {
            let worker = Worker {
                store: Arc::clone(&self.store),
                provisioners: self.provisioners.clone(),
                queue: Arc::clone(&self.queue),
                clock: self.clock,
                backoff: self.backoff.clone(),
                apply_timeout: self.config.apply_timeout(),
                plan: Arc::clone(plan),
            };
            set.spawn(worker.run());
        }
        let mut first_err = None;
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(Ok(worker_report)) => report.absorb(worker_report),
                Ok(Err(e)) => {
                    error!(wave, error = %e, "worker failed");
                    first_err.get_or_insert(e);
                }
                Err(e) => error!(wave, error = %e, "worker task aborted"),
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn needs_poll(&self, entry: &StoreEntry, now: DateTime<Utc>) -> bool {
        let unit = &entry.unit;
        unit.kind.is_external()
            && unit.last_applied_hash.as_deref() == Some(entry.desired_hash.as_str())
            && !unit.is_deleting()
            && !unit.prune_pending
            && !matches!(unit.phase, UnitPhase::Healthy | UnitPhase::Applying)
            && unit.observed_status != ObservedStatus::Missing
            && !is_parked(entry, &self.backoff)
            && !unit.retry_after.is_some_and(|t| t > now)
    }

    /// Observe one applied unit and record its readiness.
    async fn poll(
        &self,
        id: &UnitId,
        desired: &DesiredState,
        hash: &str,
        report: &mut PassReport,
    ) -> Result<(), SyncError> {
        let (Some(target), Some(body)) = (resource_ref(id, desired), desired.body()) else {
            return Ok(());
        };
        let adapter = desired.adapter().unwrap_or(DEFAULT_ADAPTER);
        let observed = match self.provisioners.get(adapter) {
            Ok(p) => tokio::time::timeout(self.config.apply_timeout(), p.observe(&target)).await,
            Err(e) => {
                warn!(unit = %id, error = %e, "cannot poll");
                return Ok(());
            }
        };
        let live = match observed {
            Ok(Ok(live)) => live,
            Ok(Err(e)) => {
                warn!(unit = %id, error = %e, "observe failed");
                return Ok(());
            }
            Err(_) => {
                warn!(unit = %id, "observe timed out");
                return Ok(());
            }
        };

        let mut store = self.store.lock().await;
        let result = store.commit(id, hash, |unit| match &live {
            None => {
                unit.observed_status = ObservedStatus::Missing;
                unit.observed_hash = None;
                unit.ready = false;
            }
            Some(live) => {
                let ready = live.ready && is_ready(desired.readiness_checks(), &live.body);
                unit.observed_hash = Some(canonical_hash(&live.body));
                unit.drifted = !live_matches(body, &live.body);
                unit.ready = ready;
                if ready {
                    unit.observed_status = ObservedStatus::Healthy;
                    unit.transition(UnitPhase::Healthy, "ready");
                } else {
                    unit.observed_status = ObservedStatus::Progressing;
                    unit.sync_status = SyncStatus::Syncing;
                    unit.transition(UnitPhase::Pending, "applied; waiting for readiness");
                }
            }
        });
        match result {
            Ok(()) | Err(StoreError::Conflict { .. }) | Err(StoreError::UnitNotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }
        if let Some(unit) = store.get(id).map(|e| &e.unit) {
            if unit.phase == UnitPhase::Healthy {
                report.settled.push(id.clone());
            } else if unit.observed_status == ObservedStatus::Progressing {
                report.awaiting_ready += 1;
            }
        }
        Ok(())
    }

    fn step(&self, entry: &StoreEntry, now: DateTime<Utc>) -> Step {
        let unit = &entry.unit;
        if unit.is_deleting() || unit.prune_pending || unit.phase == UnitPhase::Applying {
            return Step::Skip;
        }
        if is_parked(entry, &self.backoff) {
            return Step::Skip;
        }
        if unit.retry_after.is_some_and(|t| t > now) {
            return Step::RetryPending;
        }
        if unit.last_applied_hash.as_deref() != Some(entry.desired_hash.as_str()) {
            return Step::Apply("desired state changed");
        }
        if unit.kind.is_external() {
            if unit.observed_status == ObservedStatus::Missing {
                return Step::Apply("live object missing; recreating");
            }
            if unit.drifted && unit.sync_policy.self_heal {
                return Step::Apply("drift detected; self-healing");
            }
        }
        Step::Unchanged
    }

    /// Bookkeeping for a unit whose desired state is already realised.
    fn settle(
        &self,
        store: &mut ResourceStore,
        id: &UnitId,
        plan: &WavePlan,
        report: &mut PassReport,
    ) -> Result<(), SyncError> {
        report.unchanged += 1;
        let Some(entry) = store.get(id) else {
            return Ok(());
        };
        let unit = &entry.unit;

        if unit.kind.is_external() && unit.drifted {
            // self-heal drift was dispatched by `step`; this is the manual case.
            store.update_unit(id, |unit| {
                unit.sync_status = SyncStatus::OutOfSync;
                unit.message = "live state drifted from desired; selfHeal disabled".to_string();
            })?;
            return Ok(());
        }

        if !unit.kind.is_external() {
            if unit.phase != UnitPhase::Healthy {
                store.update_unit(id, |unit| {
                    unit.observed_status = ObservedStatus::Healthy;
                    unit.transition(UnitPhase::Healthy, "bound");
                })?;
                report.settled.push(id.clone());
            }
            // Claims and composites report sync through aggregation.
            return Ok(());
        }

        if !unit.is_healthy() {
            if unit.observed_status == ObservedStatus::Progressing {
                report.awaiting_ready += 1;
            }
            return Ok(());
        }
        let synced = unit.sync_status == SyncStatus::Synced;
        let waiting = waiting_on(store, plan, unit);
        if !waiting.is_empty() {
            hold_sync(store, id, &waiting)?;
        } else if !synced {
            store.update_unit(id, |unit| {
                unit.sync_status = SyncStatus::Synced;
                unit.message = "synced".to_string();
            })?;
            report.settled.push(id.clone());
        }
        Ok(())
    }

    async fn prune(&self, plan: &WavePlan, report: &mut PassReport) -> Result<(), SyncError> {
        let mut store = self.store.lock().await;
        let candidates: Vec<UnitId> = store
            .units()
            .filter(|u| u.prune_pending && !u.is_deleting())
            .map(|u| u.id.clone())
            .collect();

        for id in candidates {
            let Some(unit) = store.get(&id).map(|e| e.unit.clone()) else {
                continue;
            };
            if !unit.sync_policy.auto_prune {
                store.update_unit(&id, |unit| {
                    unit.sync_status = SyncStatus::OutOfSync;
                    unit.message = "no longer in the desired set; prune disabled".to_string();
                })?;
                continue;
            }

            let wave = plan.wave_of(&id).unwrap_or_else(|| unit.wave.effective());
            let unsettled = store.units().any(|u| {
                u.id != id
                    && !u.prune_pending
                    && !u.is_deleting()
                    && plan.wave_of(&u.id).is_some_and(|w| w <= wave)
                    && !u.is_healthy()
            });
            let depended_on = live_dependents(&store, &id).into_iter().any(|dep| {
                store
                    .get(&dep)
                    .is_some_and(|e| !e.unit.is_deleting() && !e.unit.prune_pending)
            });
            if unsettled || depended_on {
                store.update_unit(&id, |unit| {
                    unit.message = format!("prune deferred until wave {wave} is healthy");
                })?;
                continue;
            }

            cascade_delete(&mut store, &id, false)?;
            info!(unit = %id, wave, "pruning");
            report.pruned.push(id);
        }
        Ok(())
    }

    async fn process_deletions(&self, report: &mut PassReport) -> Result<(), SyncError> {
        let now = self.clock.now();
        let order: Vec<UnitId> = {
            let store = self.store.lock().await;
            let mut deleting: Vec<(i64, UnitId)> = store
                .units()
                .filter(|u| u.is_deleting())
                .map(|u| (u.wave.effective(), u.id.clone()))
                .collect();
            deleting.sort_by_key(|(wave, id)| (Reverse(*wave), id.clone()));
            deleting.into_iter().map(|(_, id)| id).collect()
        };

        for id in order {
            let (target, adapter) = {
                let mut store = self.store.lock().await;
                let Some(entry) = store.get(&id) else { continue };
                let unit = &entry.unit;
                let Some(req) = unit.deletion.as_ref() else { continue };
                if unit.phase == UnitPhase::Applying || self.queue.is_in_flight(&id) {
                    continue;
                }
                if req.stuck && !req.force {
                    continue;
                }
                if !req.force && unit.retry_after.is_some_and(|t| t > now) {
                    report.retry_pending += 1;
                    continue;
                }
                let waiting = live_dependents(&store, &id);
                if !waiting.is_empty() {
                    let n = waiting.len();
                    store.update_unit(&id, |unit| {
                        unit.message = format!("waiting for {n} dependents to delete");
                    })?;
                    continue;
                }

                let skip_adapter = if req.force {
                    Some("force-deleted; finalizer bypassed")
                } else if !unit.kind.is_external() {
                    Some("deleted")
                } else if entry.desired.deletion_policy() == DeletionPolicy::Orphan {
                    Some("orphaned; external object left in place")
                } else if unit.last_applied_hash.is_none() && unit.external_name.is_none() {
                    Some("never applied")
                } else {
                    None
                };
                if let Some(reason) = skip_adapter {
                    store.remove(&id);
                    info!(unit = %id, reason, "deleted");
                    report.deleted.push(id);
                    continue;
                }
                (
                    resource_ref(&id, &entry.desired),
                    entry.desired.adapter().unwrap_or(DEFAULT_ADAPTER).to_string(),
                )
            };

            let result = match (target, self.provisioners.get(&adapter)) {
                (Some(target), Ok(p)) => {
                    match tokio::time::timeout(self.config.apply_timeout(), p.delete(&target)).await {
                        Ok(r) => r,
                        Err(_) => Err(AdapterError::Timeout(self.config.apply_timeout())),
                    }
                }
                (None, _) => Ok(()),
                (_, Err(e)) => Err(e),
            };

            let mut store = self.store.lock().await;
            match result {
                Ok(()) => {
                    store.remove(&id);
                    info!(unit = %id, "deleted");
                    report.deleted.push(id);
                }
                Err(e) => {
                    let max = self.config.delete_max_attempts.max(1);
                    let previous = store
                        .get(&id)
                        .and_then(|entry| entry.unit.deletion.as_ref())
                        .map_or(0, |req| req.attempts);
                    let retry_at = self.clock.after(self.backoff.delay(previous + 1));
                    store.update_unit(&id, |unit| {
                        let Some(req) = unit.deletion.as_mut() else { return };
                        req.attempts += 1;
                        let attempts = req.attempts;
                        unit.last_error = Some(e.class());
                        if attempts >= max {
                            req.stuck = true;
                            unit.retry_after = None;
                            unit.observed_status = ObservedStatus::Degraded;
                            unit.sync_status = SyncStatus::Error;
                            unit.message = format!(
                                "delete stuck after {attempts} attempts: {e}; force delete required"
                            );
                        } else {
                            unit.retry_after = Some(retry_at);
                            unit.sync_status = SyncStatus::Error;
                            unit.message = format!("delete failed (attempt {attempts}/{max}): {e}");
                        }
                    })?;
                    warn!(unit = %id, error = %e, "delete failed");
                    report.failed.push(id);
                }
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("provisioners", &self.provisioners)
            .field("config", &self.config)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Workers
// ---------------------------------------------------------------------------

struct Worker {
    store: Arc<Mutex<ResourceStore>>,
    provisioners: ProvisionerRegistry,
    queue: Arc<WorkQueue<ApplyJob>>,
    clock: Clock,
    backoff: Backoff,
    apply_timeout: Duration,
    plan: Arc<WavePlan>,
}

impl Worker {
    async fn run(self) -> Result<PassReport, SyncError> {
        let mut report = PassReport::default();
        while let Some((id, job)) = self.queue.pop() {
            let result = self.apply_one(&id, &job, &mut report).await;
            self.queue.finish(&id);
            result?;
        }
        Ok(report)
    }

    async fn apply_one(
        &self,
        id: &UnitId,
        job: &ApplyJob,
        report: &mut PassReport,
    ) -> Result<(), SyncError> {
        {
            let mut store = self.store.lock().await;
            let Some(entry) = store.get(id) else {
                return Ok(());
            };
            if entry.unit.is_deleting() {
                return Ok(());
            }
            if entry.desired_hash != job.desired_hash {
                report.conflicts.push(id.clone());
                return Ok(());
            }
            let waiting = waiting_on(&store, &self.plan, &entry.unit);
            if !waiting.is_empty() {
                block(&mut store, id, &waiting)?;
                report.blocked.push(id.clone());
                return Ok(());
            }
            let now = self.clock.now();
            store.update_unit(id, |unit| {
                unit.applying_since = Some(now);
                unit.sync_status = SyncStatus::Syncing;
                unit.transition(UnitPhase::Applying, job.reason);
            })?;
        }
        debug!(unit = %id, reason = job.reason, "applying");

        let result = self.realise(id, &job.desired).await;

        let mut store = self.store.lock().await;
        let now = self.clock.now();
        let committed = match &result {
            Ok(applied) => store.commit(id, &job.desired_hash, |unit| {
                record_success(unit, &job.desired_hash, applied, &job.desired)
            }),
            Err(e) => store.commit(id, &job.desired_hash, |unit| {
                record_failure(unit, &job.desired_hash, e, &self.backoff, now)
            }),
        };
        match committed {
            Ok(()) => match result {
                Ok(_) => {
                    let waiting = barrier(&store, &self.plan, id);
                    if !waiting.is_empty() {
                        hold_sync(&mut store, id, &waiting)?;
                    }
                    info!(unit = %id, "applied");
                    report.applied.push(id.clone());
                }
                Err(e) => {
                    warn!(unit = %id, class = %e.class(), error = %e, "apply failed");
                    report.failed.push(id.clone());
                }
            },
            Err(StoreError::Conflict { .. }) => {
                store.update_unit(id, |unit| {
                    unit.applying_since = None;
                    if unit.is_deleting() {
                        unit.transition(UnitPhase::Deleting, "apply superseded; deleting");
                    } else {
                        unit.transition(UnitPhase::Pending, "desired state changed during apply; retrying");
                    }
                })?;
                debug!(unit = %id, "stale desired hash on commit");
                report.conflicts.push(id.clone());
            }
            Err(StoreError::UnitNotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    async fn realise(&self, id: &UnitId, desired: &DesiredState) -> Result<Applied, AdapterError> {
        if !desired.kind().is_external() {
            return Ok(Applied::Internal);
        }
        let provisioner = self
            .provisioners
            .get(desired.adapter().unwrap_or(DEFAULT_ADAPTER))?;
        let spec = resource_spec(id, desired)
            .ok_or_else(|| AdapterError::Invalid(format!("{id} has no resource body")))?;
        let observed = match tokio::time::timeout(self.apply_timeout, provisioner.apply(&spec)).await {
            Ok(result) => result?,
            Err(_) => return Err(AdapterError::Timeout(self.apply_timeout)),
        };
        let ready = observed.ready && is_ready(desired.readiness_checks(), &observed.body);
        Ok(Applied::External {
            observed_hash: canonical_hash(&observed.body),
            name: observed.name,
            ready,
        })
    }
}

// ---------------------------------------------------------------------------
// Unit transitions
// ---------------------------------------------------------------------------

fn record_success(unit: &mut ReconcilableUnit, hash: &str, applied: &Applied, desired: &DesiredState) {
    unit.applying_since = None;
    unit.last_applied_hash = Some(hash.to_string());
    unit.attempts = 0;
    unit.retry_after = None;
    unit.fatal = None;
    unit.last_error = None;
    unit.drifted = false;

    let ready = match applied {
        Applied::Internal => {
            unit.observed_status = ObservedStatus::Healthy;
            true
        }
        Applied::External {
            name,
            observed_hash,
            ready,
        } => {
            unit.external_name = Some(name.clone());
            unit.observed_hash = Some(observed_hash.clone());
            unit.ready = *ready;
            unit.observed_status = if *ready {
                ObservedStatus::Healthy
            } else {
                ObservedStatus::Progressing
            };
            *ready
        }
    };

    if unit.is_deleting() {
        unit.transition(UnitPhase::Deleting, "apply completed; deletion pending");
        return;
    }
    match desired {
        DesiredState::Claim(claim) => {
            unit.claim_phase = Some(ClaimPhase::Bound);
            unit.sync_status = SyncStatus::Syncing;
            let xr = UnitId::composite(&claim.composite_name());
            unit.transition(UnitPhase::Healthy, format!("bound to {xr}"));
        }
        DesiredState::Composite(xr) => {
            unit.sync_status = SyncStatus::Syncing;
            unit.transition(UnitPhase::Healthy, format!("composed by {}", xr.composition));
        }
        _ if ready => {
            unit.sync_status = SyncStatus::Synced;
            unit.transition(UnitPhase::Healthy, "applied");
        }
        _ => {
            unit.sync_status = SyncStatus::Syncing;
            unit.transition(UnitPhase::Pending, "applied; waiting for readiness");
        }
    }
}

fn record_failure(
    unit: &mut ReconcilableUnit,
    hash: &str,
    err: &AdapterError,
    backoff: &Backoff,
    now: DateTime<Utc>,
) {
    unit.applying_since = None;
    let class = err.class();
    unit.last_error = Some(class);
    if unit.is_deleting() {
        unit.transition(UnitPhase::Deleting, format!("apply failed before deletion: {err}"));
        return;
    }
    unit.sync_status = SyncStatus::Error;
    if class.is_fatal() {
        // Gated until the desired state changes or a sync is forced.
        unit.retry_after = None;
        unit.fatal = Some(FatalRecord {
            class,
            input_hash: hash.to_string(),
        });
        unit.transition(UnitPhase::Error, format!("{class}: {err}"));
        return;
    }
    unit.attempts += 1;
    let attempts = unit.attempts;
    if backoff.exhausted(attempts) {
        unit.retry_after = None;
        unit.observed_status = ObservedStatus::Degraded;
        unit.transition(
            UnitPhase::Degraded,
            format!("{class} after {attempts} attempts: {err}"),
        );
    } else {
        let delay = backoff.delay(attempts);
        unit.retry_after =
            Some(now + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero()));
        unit.transition(
            UnitPhase::Error,
            format!(
                "{class} (attempt {attempts}/{}): {err}; retrying in {}ms",
                backoff.max_attempts(),
                delay.as_millis()
            ),
        );
    }
}

fn barrier_message(waiting: &[UnitId]) -> String {
    let shown = waiting
        .iter()
        .take(3)
        .map(UnitId::as_str)
        .collect::<Vec<_>>()
        .join(", ");
    match waiting.len().saturating_sub(3) {
        0 => format!("waiting for {shown}"),
        more => format!("waiting for {shown} and {more} more"),
    }
}

/// Hold a unit back behind the wave barrier.
fn block(store: &mut ResourceStore, id: &UnitId, waiting: &[UnitId]) -> Result<(), StoreError> {
    let message = barrier_message(waiting);
    store.update_unit(id, |unit| {
        if unit.phase != UnitPhase::Error {
            unit.transition(UnitPhase::Pending, message);
        }
        unit.sync_status = SyncStatus::OutOfSync;
    })
}

/// A unit parked in a terminal failure: its fatal error still matches the
/// desired state, or its retry budget is spent.
fn is_parked(entry: &StoreEntry, backoff: &Backoff) -> bool {
    let unit = &entry.unit;
    let fatal = unit
        .fatal
        .as_ref()
        .is_some_and(|f| f.input_hash == entry.desired_hash);
    let exhausted = unit.phase == UnitPhase::Degraded && backoff.exhausted(unit.attempts);
    fatal || exhausted
}

fn barrier(store: &ResourceStore, plan: &WavePlan, id: &UnitId) -> Vec<UnitId> {
    store
        .get(id)
        .map(|e| waiting_on(store, plan, &e.unit))
        .unwrap_or_default()
}

/// A realised unit whose barrier is not clear stays `Syncing`; `settle`
/// promotes it once every unit it waits for is healthy.
fn hold_sync(store: &mut ResourceStore, id: &UnitId, waiting: &[UnitId]) -> Result<(), StoreError> {
    let message = barrier_message(waiting);
    store.update_unit(id, |unit| {
        if unit.sync_status == SyncStatus::Synced {
            unit.sync_status = SyncStatus::Syncing;
            unit.message = message;
        }
    })
}

/// Units `unit` must wait for before it may enter `Applying` or `Synced`:
/// explicit dependencies and the owner, then every unit in a lower wave,
/// failed ones included.
fn waiting_on(store: &ResourceStore, plan: &WavePlan, unit: &ReconcilableUnit) -> Vec<UnitId> {
    let mut waiting = BTreeSet::new();
    for dep in unit.depends_on.iter().chain(unit.owner.iter()) {
        if store.get(dep).is_some_and(|e| !e.unit.is_healthy()) {
            waiting.insert(dep.clone());
        }
    }
    let wave = plan.wave_of(&unit.id).unwrap_or_else(|| unit.wave.effective());
    for entry in store.entries() {
        let other = &entry.unit;
        if other.id == unit.id || other.is_deleting() || other.prune_pending {
            continue;
        }
        let lower = plan.wave_of(&other.id).is_some_and(|w| w < wave);
        if lower && !other.is_healthy() {
            waiting.insert(other.id.clone());
        }
    }
    waiting.into_iter().collect()
}

// ---------------------------------------------------------------------------
// Aggregation
// ---------------------------------------------------------------------------

/// Composite readiness is the AND of its children; a claim follows its
/// composite. Neither reports `Synced` until its own wave barrier is clear.
fn aggregate(store: &mut ResourceStore, plan: &WavePlan) -> Result<(), StoreError> {
    for xr in store.ids_of_kind(UnitKind::Composite) {
        let children: Vec<&ReconcilableUnit> = store
            .children_of(&xr)
            .iter()
            .filter_map(|c| store.get(c))
            .map(|e| &e.unit)
            .filter(|u| !u.prune_pending && !u.is_deleting())
            .collect();
        let pending = children
            .iter()
            .filter(|u| !(u.ready && u.is_healthy()))
            .count();
        let total = children.len();
        let waiting = barrier(store, plan, &xr);
        store.update_unit(&xr, |unit| {
            unit.ready = pending == 0 && unit.is_healthy();
            if unit.is_deleting() || unit.phase != UnitPhase::Healthy {
                return;
            }
            if unit.ready && !waiting.is_empty() {
                unit.sync_status = SyncStatus::Syncing;
                unit.message = barrier_message(&waiting);
            } else if unit.ready {
                unit.sync_status = SyncStatus::Synced;
                unit.message = format!("{total} resources ready");
            } else {
                unit.sync_status = SyncStatus::Syncing;
                unit.message = format!("{pending} of {total} resources not ready");
            }
        })?;
    }

    for claim in store.ids_of_kind(UnitKind::Claim) {
        let Some(DesiredState::Claim(c)) = store.get(&claim).map(|e| &e.desired) else {
            continue;
        };
        let xr = UnitId::composite(&c.composite_name());
        let xr_ready = store.get(&xr).is_some_and(|e| e.unit.ready);
        let bound = store.contains(&xr);
        let waiting = barrier(store, plan, &claim);
        store.update_unit(&claim, |unit| {
            if unit.is_deleting() {
                unit.claim_phase = Some(ClaimPhase::Deleting);
                return;
            }
            if unit.phase != UnitPhase::Healthy {
                unit.ready = false;
                return;
            }
            unit.ready = xr_ready;
            if xr_ready {
                unit.claim_phase = Some(ClaimPhase::Ready);
                if waiting.is_empty() {
                    unit.sync_status = SyncStatus::Synced;
                    unit.message = "ready".to_string();
                } else {
                    unit.sync_status = SyncStatus::Syncing;
                    unit.message = barrier_message(&waiting);
                }
            } else {
                unit.claim_phase = Some(if bound { ClaimPhase::Bound } else { ClaimPhase::Pending });
                unit.sync_status = SyncStatus::Syncing;
                unit.message = format!("waiting for {xr}");
            }
        })?;
    }
    Ok(())
}
