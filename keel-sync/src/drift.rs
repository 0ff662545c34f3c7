//! Drift Detector / Self-Healer.
//!
//! Runs beside the scheduler on its own per-unit timers. Each check observes
//! the live object and writes observed fields only. Any divergence triggers a
//! scheduler pass, which re-applies when `selfHeal` is set and otherwise marks
//! the unit `OutOfSync`.
//!
//! Live objects may carry fields the engine never set (defaults filled in by
//! the external system). Comparison therefore projects the live body onto the
//! keys of the desired body before hashing.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use keel_compose::is_ready;
use keel_core::{canonical_hash, ObservedStatus, ObservedUpdate, UnitId, UnitPhase, DEFAULT_ADAPTER};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::error::SyncError;
use crate::provisioner::resource_ref;
use crate::scheduler::Scheduler;

// ---------------------------------------------------------------------------
// Comparison
// ---------------------------------------------------------------------------

/// `live` restricted to the keys present in `desired`, recursively.
pub fn project(live: &Value, desired: &Value) -> Value {
    match (live, desired) {
        (Value::Object(live), Value::Object(desired)) => Value::Object(
            desired
                .iter()
                .map(|(key, want)| {
                    let got = live.get(key).map_or(Value::Null, |have| project(have, want));
                    (key.clone(), got)
                })
                .collect(),
        ),
        _ => live.clone(),
    }
}

/// `true` when every field of `desired` has the same value in `live`.
pub fn live_matches(desired: &Value, live: &Value) -> bool {
    canonical_hash(&project(live, desired)) == canonical_hash(desired)
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DriftKind {
    /// Live object differs from the desired body.
    Drifted,
    /// Live object is gone.
    Missing,
    /// A previously drifted or missing object matches again.
    Recovered,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DriftEvent {
    pub unit: UnitId,
    pub kind: DriftKind,
    pub self_heal: bool,
}

// ---------------------------------------------------------------------------
// Detector
// ---------------------------------------------------------------------------

pub struct DriftDetector {
    scheduler: Arc<Scheduler>,
    interval: Duration,
    next_due: BTreeMap<UnitId, DateTime<Utc>>,
}

impl DriftDetector {
    pub fn new(scheduler: Arc<Scheduler>) -> Self {
        let interval = scheduler.config().drift_interval();
        Self::with_interval(scheduler, interval)
    }

    pub fn with_interval(scheduler: Arc<Scheduler>, interval: Duration) -> Self {
        Self {
            scheduler,
            interval,
            next_due: BTreeMap::new(),
        }
    }

    /// External change notification: check `id` on the next tick.
    pub fn notify(&mut self, id: &UnitId) {
        self.next_due.insert(id.clone(), self.scheduler.clock().now());
    }

    /// Earliest time any tracked unit is due.
    pub fn next_wakeup(&self) -> Option<DateTime<Utc>> {
        self.next_due.values().min().copied()
    }

    /// Check every unit whose timer has expired. Units seen for the first
    /// time are checked immediately. Any event triggers one scheduler pass.
    pub async fn tick(&mut self) -> Result<Vec<DriftEvent>, SyncError> {
        let clock = self.scheduler.clock();
        let now = clock.now();
        let candidates = self.candidates().await;
        self.next_due.retain(|id, _| candidates.contains(id));

        let mut events = Vec::new();
        for id in candidates {
            if self.next_due.get(&id).is_some_and(|due| *due > now) {
                continue;
            }
            if let Some(event) = self.check_unit(&id).await? {
                events.push(event);
            }
            self.next_due.insert(id, clock.after(self.interval));
        }

        if !events.is_empty() {
            info!(events = events.len(), "drift detected; reconciling");
            self.scheduler.reconcile_pass().await?;
        }
        Ok(events)
    }

    /// Units eligible for drift checks: realised externally, applied at the
    /// current desired hash, and not on their way out.
    async fn candidates(&self) -> Vec<UnitId> {
        let store = self.scheduler.store();
        let store = store.lock().await;
        store
            .entries()
            .filter(|e| {
                let u = &e.unit;
                u.kind.is_external()
                    && u.last_applied_hash.as_deref() == Some(e.desired_hash.as_str())
                    && !u.is_deleting()
                    && !u.prune_pending
                    && u.phase != UnitPhase::Applying
            })
            .map(|e| e.unit.id.clone())
            .collect()
    }

    /// Observe one unit and record what was seen.
    pub async fn check_unit(&self, id: &UnitId) -> Result<Option<DriftEvent>, SyncError> {
        let shared = self.scheduler.store();
        let (desired, hash, was_drifted, was_status, self_heal) = {
            let store = shared.lock().await;
            let Some(entry) = store.get(id) else {
                return Ok(None);
            };
            (
                entry.desired.clone(),
                entry.desired_hash.clone(),
                entry.unit.drifted,
                entry.unit.observed_status,
                entry.unit.sync_policy.self_heal,
            )
        };
        let (Some(target), Some(body)) = (resource_ref(id, &desired), desired.body()) else {
            return Ok(None);
        };
        let provisioner = match self
            .scheduler
            .provisioners()
            .get(desired.adapter().unwrap_or(DEFAULT_ADAPTER))
        {
            Ok(p) => p,
            Err(e) => {
                warn!(unit = %id, error = %e, "drift check skipped");
                return Ok(None);
            }
        };
        let timeout = self.scheduler.config().apply_timeout();
        let live = match tokio::time::timeout(timeout, provisioner.observe(&target)).await {
            Ok(Ok(live)) => live,
            Ok(Err(e)) => {
                warn!(unit = %id, error = %e, "drift check failed");
                return Ok(None);
            }
            Err(_) => {
                warn!(unit = %id, "drift check timed out");
                return Ok(None);
            }
        };

        let (update, kind) = match &live {
            None => (
                ObservedUpdate {
                    observed_status: ObservedStatus::Missing,
                    observed_hash: None,
                    drifted: false,
                    ready: false,
                },
                Some(DriftKind::Missing),
            ),
            Some(live) => {
                let drifted = !live_matches(body, &live.body);
                let ready = live.ready && is_ready(desired.readiness_checks(), &live.body);
                let kind = if drifted {
                    // Unhealed drift is reported once; the unit stays OutOfSync.
                    (!was_drifted || self_heal).then_some(DriftKind::Drifted)
                } else if was_drifted || was_status == ObservedStatus::Missing {
                    Some(DriftKind::Recovered)
                } else {
                    None
                };
                (
                    ObservedUpdate {
                        observed_status: if ready {
                            ObservedStatus::Healthy
                        } else {
                            ObservedStatus::Progressing
                        },
                        observed_hash: Some(canonical_hash(&live.body)),
                        drifted,
                        ready,
                    },
                    kind,
                )
            }
        };

        {
            let mut store = shared.lock().await;
            // The desired state moved while observing; the scheduler owns it now.
            if store.get(id).map(|e| e.desired_hash.as_str()) != Some(hash.as_str()) {
                return Ok(None);
            }
            store.record_observation(id, update)?;
        }

        let Some(kind) = kind else {
            debug!(unit = %id, "in sync");
            return Ok(None);
        };
        match kind {
            DriftKind::Recovered => info!(unit = %id, "live state matches desired again"),
            _ => warn!(unit = %id, kind = ?kind, self_heal, "drift"),
        }
        Ok(Some(DriftEvent {
            unit: id.clone(),
            kind,
            self_heal,
        }))
    }

    /// Tick until shutdown, sleeping until the next unit is due.
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        loop {
            if let Err(e) = self.tick().await {
                warn!(error = %e, "drift tick failed");
            }
            let clock = self.scheduler.clock();
            let wait = self
                .next_wakeup()
                .map_or(self.interval, |at| clock.until(at))
                .max(Duration::from_millis(50));
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = shutdown.recv() => {
                    debug!("drift detector stopping");
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn extra_live_fields_are_not_drift() {
        let desired = json!({"spec": {"replicas": 2}});
        let live = json!({"spec": {"replicas": 2, "paused": false}, "status": {"ok": true}});
        assert!(live_matches(&desired, &live));
    }

    #[test]
    fn changed_or_missing_fields_are_drift() {
        let desired = json!({"spec": {"replicas": 2, "image": "web:1"}});
        assert!(!live_matches(&desired, &json!({"spec": {"replicas": 3, "image": "web:1"}})));
        assert!(!live_matches(&desired, &json!({"spec": {"replicas": 2}})));
    }

    #[test]
    fn arrays_compare_whole() {
        let desired = json!({"ports": [80]});
        assert!(!live_matches(&desired, &json!({"ports": [80, 443]})));
    }
}
