//! Desired-vs-live unified diff for `keel diff`.
//!
//! Live bodies are projected onto the desired keys first, so fields the
//! external system adds on its own do not show up as removals.

use keel_core::{ResourceStore, UnitId, DEFAULT_ADAPTER};
use serde_json::Value;
use similar::TextDiff;

use crate::drift::{live_matches, project};
use crate::error::SyncError;
use crate::provisioner::{resource_ref, ProvisionerRegistry};

/// A single unit's diff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitDiff {
    pub unit: UnitId,
    /// `true` when the external object does not exist yet.
    pub live_missing: bool,
    pub unified_diff: String,
}

/// Compare desired and live state of every externally realised unit, or only
/// `filter` when given. Nothing is applied.
pub async fn diff_units(
    store: &ResourceStore,
    provisioners: &ProvisionerRegistry,
    filter: Option<&UnitId>,
) -> Result<Vec<UnitDiff>, SyncError> {
    if let Some(id) = filter {
        if !store.contains(id) {
            return Err(SyncError::UnitNotFound(id.clone()));
        }
    }

    let mut diffs = Vec::new();
    for entry in store.entries() {
        let id = &entry.unit.id;
        if filter.is_some_and(|f| f != id) || entry.unit.is_deleting() {
            continue;
        }
        let (Some(target), Some(desired)) = (resource_ref(id, &entry.desired), entry.desired.body())
        else {
            continue;
        };
        let provisioner = provisioners.get(entry.desired.adapter().unwrap_or(DEFAULT_ADAPTER))?;
        let live = provisioner.observe(&target).await?;
        if live.as_ref().is_some_and(|l| live_matches(desired, &l.body)) {
            continue;
        }

        let existing = match &live {
            Some(l) => render(&project(&l.body, desired))?,
            None => String::new(),
        };
        let wanted = render(desired)?;
        let old_header = format!("a/{id}");
        let new_header = format!("b/{id}");
        let unified = TextDiff::from_lines(&existing, &wanted)
            .unified_diff()
            .header(&old_header, &new_header)
            .context_radius(3)
            .to_string();

        diffs.push(UnitDiff {
            unit: id.clone(),
            live_missing: live.is_none(),
            unified_diff: unified,
        });
    }
    Ok(diffs)
}

fn render(value: &Value) -> Result<String, SyncError> {
    Ok(serde_yaml::to_string(value)?.replace("\r\n", "\n"))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use keel_core::types::ApplicationSpec;
    use keel_core::{Application, DesiredState, ObjectMeta, UnitSpec};
    use serde_json::json;

    use super::*;
    use crate::memory::MemoryProvisioner;
    use crate::provisioner::{Provisioner, ResourceSpec};

    fn store_with_app() -> (ResourceStore, UnitId) {
        let app = Application {
            metadata: ObjectMeta {
                name: "web".into(),
                ..ObjectMeta::default()
            },
            spec: ApplicationSpec {
                adapter: DEFAULT_ADAPTER.into(),
                resource: json!({"spec": {"replicas": 2}}),
                wave: 0,
                depends_on: vec![],
                sync_policy: Default::default(),
                readiness_checks: vec![],
            },
        };
        let id = app.id();
        let mut store = ResourceStore::new();
        store.upsert(&id, DesiredState::Application(app), &UnitSpec::default(), None);
        (store, id)
    }

    #[tokio::test]
    async fn missing_object_diffs_against_empty() {
        let (store, id) = store_with_app();
        let memory = Arc::new(MemoryProvisioner::new());
        let registry = ProvisionerRegistry::with_default(memory);

        let diffs = diff_units(&store, &registry, None).await.unwrap();
        assert_eq!(diffs.len(), 1);
        assert!(diffs[0].live_missing);
        assert!(diffs[0].unified_diff.contains("--- a/app/web"));
        assert!(diffs[0].unified_diff.contains("+  replicas: 2"));
    }

    #[tokio::test]
    async fn matching_object_has_no_diff() {
        let (store, id) = store_with_app();
        let memory = Arc::new(MemoryProvisioner::new());
        memory
            .apply(&ResourceSpec {
                unit: id.clone(),
                name: "web".into(),
                body: json!({"spec": {"replicas": 2, "paused": false}}),
            })
            .await
            .unwrap();
        let registry = ProvisionerRegistry::with_default(memory);

        assert!(diff_units(&store, &registry, Some(&id)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_filter_is_an_error() {
        let (store, _) = store_with_app();
        let registry = ProvisionerRegistry::with_default(Arc::new(MemoryProvisioner::new()));
        let err = diff_units(&store, &registry, Some(&UnitId::from("app/nope")))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::UnitNotFound(_)));
    }
}
