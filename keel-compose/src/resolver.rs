//! Claim resolution.
//!
//! Templates are instantiated in declaration order. Each patch reads from the
//! claim (seen as `{metadata, spec: parameters}`) or from a sibling resolved
//! earlier in the same pass; a reference to a later sibling is a
//! [`ComposeError::PatchOrdering`].

use std::collections::{BTreeMap, BTreeSet};

use keel_core::schema::{apply_defaults, validate};
use keel_core::types::{FieldSource, Patch, ResourceTemplate};
use keel_core::{
    Claim, CompositeResource, Composition, DeletionPolicy, DesiredState, ManagedResource, ResourceStore,
    RevisionId, UnitId, UnitKind, UnitSpec, Upsert,
};
use serde_json::{json, Value};
use tracing::debug;

use crate::error::ComposeError;
use crate::fieldpath;
use crate::select::{select_composition, select_definition};
use crate::transform;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedResource {
    pub id: UnitId,
    pub managed: ManagedResource,
    pub wave: i64,
    pub depends_on: BTreeSet<UnitId>,
}

/// The composite and managed resources one claim resolves to.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub definition: String,
    pub composition: String,
    pub composite_id: UnitId,
    pub composite: CompositeResource,
    pub resources: Vec<ResolvedResource>,
}

/// What [`resolve_into`] changed in the store.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResolveOutcome {
    pub composite: Option<UnitId>,
    pub created: Vec<UnitId>,
    pub updated: Vec<UnitId>,
    pub unchanged: Vec<UnitId>,
    /// Previously generated resources this resolution no longer produces.
    pub pruned: Vec<UnitId>,
}

// ---------------------------------------------------------------------------
// Resolve
// ---------------------------------------------------------------------------

/// Resolve `claim` against the definitions and compositions in `store`.
pub fn resolve(store: &ResourceStore, claim: &Claim) -> Result<Resolution, ComposeError> {
    let definition = select_definition(store, claim)?;
    let composition = select_composition(store.compositions(), definition, claim)?;

    let mut parameters = claim.spec.parameters.clone();
    apply_defaults(&definition.spec.schema, &mut parameters);
    let violations = validate(&definition.spec.schema, &parameters);
    if !violations.is_empty() {
        return Err(ComposeError::SchemaValidation {
            claim: claim.id(),
            violations,
        });
    }

    let metadata = serde_json::to_value(&claim.metadata)
        .map_err(|e| ComposeError::render("<claim>", e.to_string()))?;
    let claim_view = json!({ "metadata": metadata, "spec": parameters });

    let xr_name = claim.composite_name();
    let xr_id = UnitId::composite(&xr_name);
    let bodies = render_templates(composition, &claim_view)?;

    let mut resources = Vec::with_capacity(bodies.len());
    for (template, body) in composition.spec.resources.iter().zip(bodies) {
        let depends_on = template
            .depends_on
            .iter()
            .map(|sibling| UnitId::managed(&xr_name, sibling))
            .collect();
        resources.push(ResolvedResource {
            id: UnitId::managed(&xr_name, &template.name),
            managed: ManagedResource {
                name: format!("{xr_name}-{}", template.name),
                owner: xr_id.clone(),
                template: template.name.clone(),
                adapter: template.adapter.clone(),
                deletion_policy: match claim.spec.deletion_policy {
                    DeletionPolicy::Orphan => DeletionPolicy::Orphan,
                    policy => template.deletion_policy.unwrap_or(policy),
                },
                body,
                readiness_checks: template.readiness_checks.clone(),
            },
            wave: template.wave.unwrap_or(claim.spec.wave),
            depends_on,
        });
    }

    let composite = CompositeResource {
        name: xr_name,
        composite_kind: definition.spec.composite_kind.clone(),
        claim: claim.id(),
        definition: definition.metadata.name.clone(),
        composition: composition.metadata.name.clone(),
        resource_refs: resources.iter().map(|r| r.id.clone()).collect(),
        parameters,
    };

    debug!(
        claim = %claim.id(),
        composition = %composition.metadata.name,
        resources = resources.len(),
        "claim resolved"
    );

    Ok(Resolution {
        definition: definition.metadata.name.clone(),
        composition: composition.metadata.name.clone(),
        composite_id: xr_id,
        composite,
        resources,
    })
}

fn render_templates(composition: &Composition, claim: &Value) -> Result<Vec<Value>, ComposeError> {
    let templates = &composition.spec.resources;
    let position: BTreeMap<&str, usize> = templates
        .iter()
        .enumerate()
        .map(|(i, t)| (t.name.as_str(), i))
        .collect();
    if position.len() != templates.len() {
        return Err(ComposeError::render(
            &composition.metadata.name,
            "duplicate template names in composition",
        ));
    }

    let mut resolved: BTreeMap<&str, Value> = BTreeMap::new();
    let mut out = Vec::with_capacity(templates.len());
    for (index, template) in templates.iter().enumerate() {
        for dep in &template.depends_on {
            if !position.contains_key(dep.as_str()) {
                return Err(ComposeError::render(
                    &template.name,
                    format!("dependsOn names unknown template '{dep}'"),
                ));
            }
        }
        let scope = PatchScope {
            claim,
            resolved: &resolved,
            position: &position,
            index,
            template,
        };
        let mut body = template.base.clone();
        for patch in &template.patches {
            scope.apply(patch, &mut body)?;
        }
        check_required(template, &body)?;

        resolved.insert(template.name.as_str(), body.clone());
        out.push(body);
    }
    Ok(out)
}

/// Everything one template's patches may read.
struct PatchScope<'a> {
    claim: &'a Value,
    resolved: &'a BTreeMap<&'a str, Value>,
    position: &'a BTreeMap<&'a str, usize>,
    index: usize,
    template: &'a ResourceTemplate,
}

impl<'a> PatchScope<'a> {
    fn fail(&self, reason: impl Into<String>) -> ComposeError {
        ComposeError::render(&self.template.name, reason)
    }

    fn sibling(&self, name: &str) -> Result<&'a Value, ComposeError> {
        match self.position.get(name) {
            Some(&i) if i < self.index => self
                .resolved
                .get(name)
                .ok_or_else(|| self.fail("sibling not resolved")),
            Some(_) => Err(ComposeError::PatchOrdering {
                template: self.template.name.clone(),
                referenced: name.to_string(),
            }),
            None => Err(self.fail(format!("patch references unknown template '{name}'"))),
        }
    }

    fn apply(&self, patch: &Patch, body: &mut Value) -> Result<(), ComposeError> {
        let value = match patch {
            Patch::FromClaimFieldPath {
                from,
                transforms,
                optional,
                ..
            } => match fieldpath::get(self.claim, from) {
                Some(v) if !v.is_null() => {
                    transform::apply_all(v.clone(), transforms).map_err(|e| self.fail(e))?
                }
                _ if *optional => return Ok(()),
                _ => return Err(self.fail(format!("claim field '{from}' not found"))),
            },
            Patch::FromCompositeFieldPath {
                resource,
                from,
                transforms,
                optional,
                ..
            } => match fieldpath::get(self.sibling(resource)?, from) {
                Some(v) if !v.is_null() => {
                    transform::apply_all(v.clone(), transforms).map_err(|e| self.fail(e))?
                }
                _ if *optional => return Ok(()),
                _ => return Err(self.fail(format!("field '{from}' not found on '{resource}'"))),
            },
            Patch::Combine {
                sources, template, ..
            } => {
                let values = sources
                    .iter()
                    .map(|src| self.read_source(src))
                    .collect::<Result<Vec<_>, _>>()?;
                transform::combine(template, &values).map_err(|e| self.fail(e))?
            }
        };
        fieldpath::set(body, patch.target(), value).map_err(|e| self.fail(e))
    }

    fn read_source(&self, source: &FieldSource) -> Result<Value, ComposeError> {
        let root = match &source.resource {
            Some(name) => self.sibling(name)?,
            None => self.claim,
        };
        fieldpath::get(root, &source.path)
            .filter(|v| !v.is_null())
            .cloned()
            .ok_or_else(|| self.fail(format!("combine source '{}' not found", source.path)))
    }
}

fn check_required(template: &ResourceTemplate, body: &Value) -> Result<(), ComposeError> {
    let missing: Vec<String> = template
        .required
        .iter()
        .filter(|path| fieldpath::get(body, path).map_or(true, Value::is_null))
        .cloned()
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(ComposeError::IncompleteResource {
            template: template.name.clone(),
            missing,
        })
    }
}

// ---------------------------------------------------------------------------
// Resolve into the store
// ---------------------------------------------------------------------------

/// Resolve `claim` and write the composite and managed resources to `store`.
///
/// Nothing is written if resolution fails. Managed resources the composite
/// previously owned but this resolution no longer produces are flagged
/// `prune_pending`; the scheduler decides when and whether to delete them.
pub fn resolve_into(
    store: &mut ResourceStore,
    claim: &Claim,
    revision: Option<RevisionId>,
) -> Result<ResolveOutcome, ComposeError> {
    let resolution = resolve(store, claim)?;
    let mut outcome = ResolveOutcome {
        composite: Some(resolution.composite_id.clone()),
        ..ResolveOutcome::default()
    };

    let xr_spec = UnitSpec {
        wave: claim.spec.wave,
        depends_on: BTreeSet::new(),
        owner: Some(claim.id()),
        sync_policy: claim.spec.sync_policy,
    };
    let xr_id = resolution.composite_id.clone();
    let result = store.upsert(
        &xr_id,
        DesiredState::Composite(resolution.composite),
        &xr_spec,
        revision,
    );
    outcome.record(xr_id.clone(), result);

    let mut produced = BTreeSet::new();
    for resource in resolution.resources {
        let spec = UnitSpec {
            wave: resource.wave,
            depends_on: resource.depends_on,
            owner: Some(xr_id.clone()),
            sync_policy: claim.spec.sync_policy,
        };
        let result = store.upsert(
            &resource.id,
            DesiredState::Managed(resource.managed),
            &spec,
            revision,
        );
        produced.insert(resource.id.clone());
        outcome.record(resource.id, result);
    }

    for child in store.children_of(&xr_id) {
        if produced.contains(&child) {
            continue;
        }
        let newly_orphaned = store.get(&child).is_some_and(|e| {
            e.unit.kind == UnitKind::Managed && !e.unit.prune_pending && !e.unit.is_deleting()
        });
        if !newly_orphaned {
            continue;
        }
        store.update_unit(&child, |unit| {
            unit.prune_pending = true;
            unit.message = "no longer produced by its composition".to_string();
        })?;
        outcome.pruned.push(child);
    }
    Ok(outcome)
}

impl ResolveOutcome {
    fn record(&mut self, id: UnitId, result: Upsert) {
        match result {
            Upsert::Created => self.created.push(id),
            Upsert::Updated => self.updated.push(id),
            Upsert::Unchanged => self.unchanged.push(id),
        }
    }

    pub fn changed(&self) -> bool {
        !self.created.is_empty() || !self.updated.is_empty() || !self.pruned.is_empty()
    }
}
