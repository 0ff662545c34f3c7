//! Cascading deletion requests.

use keel_core::{ResourceStore, StoreError, UnitId};
use keel_graph::{dependents_closure, GraphNode};
use tracing::debug;

/// Put `root` and every unit that transitively depends on it (explicitly or
/// through ownership) on the deletion path. Returns the affected ids, root
/// first.
pub fn cascade_delete(
    store: &mut ResourceStore,
    root: &UnitId,
    force: bool,
) -> Result<Vec<UnitId>, StoreError> {
    let nodes: Vec<GraphNode> = store.units().map(GraphNode::from).collect();
    let mut ids = vec![root.clone()];
    ids.extend(dependents_closure(&nodes, root));
    for id in &ids {
        store.request_deletion(id, force)?;
    }
    debug!(unit = %root, cascade = ids.len(), force, "deletion requested");
    Ok(ids)
}

/// Units still in the store that depend on or are owned by `id`.
pub fn live_dependents(store: &ResourceStore, id: &UnitId) -> Vec<UnitId> {
    store
        .units()
        .filter(|u| u.depends_on.contains(id) || u.owner.as_ref() == Some(id))
        .map(|u| u.id.clone())
        .collect()
}
