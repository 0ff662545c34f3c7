//! In-memory provisioner.
//!
//! Used for dry runs and tests. Records every call, supports failure
//! injection, artificial latency and out-of-band mutation of live objects.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::AdapterError;
use crate::provisioner::{ObservedState, Provisioner, ResourceRef, ResourceSpec};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    Apply,
    Delete,
    Observe,
}

/// One recorded provisioner call, in call order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub kind: CallKind,
    pub name: String,
}

#[derive(Debug, Default)]
struct State {
    objects: BTreeMap<String, Value>,
    calls: Vec<Call>,
    /// Writes that actually changed the stored object.
    writes: BTreeMap<String, usize>,
    apply_failures: BTreeMap<String, u32>,
    delete_failures: BTreeMap<String, u32>,
    not_ready: BTreeSet<String>,
    invalid: BTreeSet<String>,
    latency: Option<Duration>,
}

#[derive(Debug, Default)]
pub struct MemoryProvisioner {
    state: Mutex<State>,
}

impl MemoryProvisioner {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // -----------------------------------------------------------------------
    // Inspection
    // -----------------------------------------------------------------------

    pub fn get(&self, name: &str) -> Option<Value> {
        self.lock().objects.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.lock().objects.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.lock().objects.keys().cloned().collect()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.lock().calls.clone()
    }

    fn count(&self, kind: CallKind, name: &str) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.kind == kind && c.name == name)
            .count()
    }

    pub fn apply_count(&self, name: &str) -> usize {
        self.count(CallKind::Apply, name)
    }

    pub fn delete_count(&self, name: &str) -> usize {
        self.count(CallKind::Delete, name)
    }

    /// Applies that changed the stored object.
    pub fn write_count(&self, name: &str) -> usize {
        self.lock().writes.get(name).copied().unwrap_or(0)
    }

    /// Index of the first `kind` call for `name` in the call log.
    pub fn first_call(&self, kind: CallKind, name: &str) -> Option<usize> {
        self.lock()
            .calls
            .iter()
            .position(|c| c.kind == kind && c.name == name)
    }

    // -----------------------------------------------------------------------
    // Fault injection
    // -----------------------------------------------------------------------

    /// Fail the next `times` applies of `name`. `u32::MAX` fails forever.
    pub fn fail_applies(&self, name: &str, times: u32) {
        self.lock().apply_failures.insert(name.to_string(), times);
    }

    pub fn fail_deletes(&self, name: &str, times: u32) {
        self.lock().delete_failures.insert(name.to_string(), times);
    }

    /// Reject every apply of `name` as invalid.
    pub fn reject(&self, name: &str) {
        self.lock().invalid.insert(name.to_string());
    }

    pub fn set_ready(&self, name: &str, ready: bool) {
        let mut state = self.lock();
        if ready {
            state.not_ready.remove(name);
        } else {
            state.not_ready.insert(name.to_string());
        }
    }

    pub fn set_latency(&self, latency: Option<Duration>) {
        self.lock().latency = latency;
    }

    /// Change a live object behind the engine's back.
    pub fn mutate<F: FnOnce(&mut Value)>(&self, name: &str, f: F) -> bool {
        match self.lock().objects.get_mut(name) {
            Some(v) => {
                f(v);
                true
            }
            None => false,
        }
    }

    /// Delete a live object behind the engine's back.
    pub fn remove_out_of_band(&self, name: &str) -> Option<Value> {
        self.lock().objects.remove(name)
    }

    fn take_failure(map: &mut BTreeMap<String, u32>, name: &str) -> bool {
        match map.get_mut(name) {
            Some(0) | None => false,
            Some(n) if *n == u32::MAX => true,
            Some(n) => {
                *n -= 1;
                true
            }
        }
    }

    async fn delay(&self) {
        let latency = self.lock().latency;
        if let Some(d) = latency {
            tokio::time::sleep(d).await;
        }
    }
}

#[async_trait]
impl Provisioner for MemoryProvisioner {
    async fn apply(&self, spec: &ResourceSpec) -> Result<ObservedState, AdapterError> {
        self.lock().calls.push(Call {
            kind: CallKind::Apply,
            name: spec.name.clone(),
        });
        self.delay().await;

        let mut state = self.lock();
        if state.invalid.contains(&spec.name) {
            return Err(AdapterError::Invalid(format!("{} rejected", spec.name)));
        }
        if Self::take_failure(&mut state.apply_failures, &spec.name) {
            return Err(AdapterError::Failed(format!("injected apply failure for {}", spec.name)));
        }
        if state.objects.get(&spec.name) != Some(&spec.body) {
            state.objects.insert(spec.name.clone(), spec.body.clone());
            *state.writes.entry(spec.name.clone()).or_insert(0) += 1;
        }
        Ok(ObservedState {
            name: spec.name.clone(),
            body: spec.body.clone(),
            ready: !state.not_ready.contains(&spec.name),
        })
    }

    async fn delete(&self, target: &ResourceRef) -> Result<(), AdapterError> {
        self.lock().calls.push(Call {
            kind: CallKind::Delete,
            name: target.name.clone(),
        });
        self.delay().await;

        let mut state = self.lock();
        if Self::take_failure(&mut state.delete_failures, &target.name) {
            return Err(AdapterError::Failed(format!(
                "injected delete failure for {}",
                target.name
            )));
        }
        state.objects.remove(&target.name);
        Ok(())
    }

    async fn observe(&self, target: &ResourceRef) -> Result<Option<ObservedState>, AdapterError> {
        let mut state = self.lock();
        state.calls.push(Call {
            kind: CallKind::Observe,
            name: target.name.clone(),
        });
        Ok(state.objects.get(&target.name).map(|body| ObservedState {
            name: target.name.clone(),
            body: body.clone(),
            ready: !state.not_ready.contains(&target.name),
        }))
    }
}
