//! External Provisioner Adapter contract.
//!
//! A provisioner realises managed resources and applications against an
//! external system. `apply` must be idempotent for identical specs and must
//! report a stable `name` so later `observe` / `delete` calls can target the
//! same object.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use keel_core::{DesiredState, UnitId, DEFAULT_ADAPTER};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::AdapterError;

/// What a provisioner is asked to realise.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceSpec {
    pub unit: UnitId,
    /// Deterministic external name.
    pub name: String,
    pub body: Value,
}

/// Handle for a previously applied object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRef {
    pub unit: UnitId,
    pub name: String,
}

/// Live state as reported by a provisioner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservedState {
    /// Stable identity of the external object.
    pub name: String,
    pub body: Value,
    pub ready: bool,
}

#[async_trait]
pub trait Provisioner: Send + Sync {
    async fn apply(&self, spec: &ResourceSpec) -> Result<ObservedState, AdapterError>;

    /// Deleting an object that is already gone succeeds.
    async fn delete(&self, target: &ResourceRef) -> Result<(), AdapterError>;

    /// `Ok(None)` when the object does not exist.
    async fn observe(&self, target: &ResourceRef) -> Result<Option<ObservedState>, AdapterError>;
}

// ---------------------------------------------------------------------------
// Spec helpers
// ---------------------------------------------------------------------------

/// External name for a desired state, or `None` for units realised internally.
pub fn external_name(desired: &DesiredState) -> Option<String> {
    match desired {
        DesiredState::Managed(mr) => Some(mr.name.clone()),
        DesiredState::Application(app) => Some(app.metadata.name.clone()),
        _ => None,
    }
}

pub fn resource_spec(unit: &UnitId, desired: &DesiredState) -> Option<ResourceSpec> {
    Some(ResourceSpec {
        unit: unit.clone(),
        name: external_name(desired)?,
        body: desired.body()?.clone(),
    })
}

pub fn resource_ref(unit: &UnitId, desired: &DesiredState) -> Option<ResourceRef> {
    Some(ResourceRef {
        unit: unit.clone(),
        name: external_name(desired)?,
    })
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Named provisioners, looked up by the `adapter` field of a spec.
#[derive(Clone, Default)]
pub struct ProvisionerRegistry {
    adapters: BTreeMap<String, Arc<dyn Provisioner>>,
}

impl ProvisionerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with `provisioner` under the default name.
    pub fn with_default(provisioner: Arc<dyn Provisioner>) -> Self {
        let mut registry = Self::new();
        registry.register(DEFAULT_ADAPTER, provisioner);
        registry
    }

    pub fn register(&mut self, name: impl Into<String>, provisioner: Arc<dyn Provisioner>) {
        self.adapters.insert(name.into(), provisioner);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Provisioner>, AdapterError> {
        self.adapters
            .get(name)
            .cloned()
            .ok_or_else(|| AdapterError::UnknownAdapter(name.to_string()))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.adapters.keys().map(String::as_str)
    }
}

impl std::fmt::Debug for ProvisionerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProvisionerRegistry")
            .field("adapters", &self.adapters.keys().collect::<Vec<_>>())
            .finish()
    }
}
