//! Definition and composition selection.
//!
//! A claim's kind must be declared by exactly one definition. Among that
//! definition's compositions an explicit `compositionRef` wins; otherwise
//! the highest-priority composition whose labels satisfy the claim's
//! `compositionSelector` is chosen. A tie at the top is ambiguous.

use keel_core::{Claim, Composition, ResourceDefinition, ResourceStore};

use crate::error::ComposeError;

pub fn select_definition<'a>(
    store: &'a ResourceStore,
    claim: &Claim,
) -> Result<&'a ResourceDefinition, ComposeError> {
    let kind = &claim.spec.claim_kind;
    let matches = store.definitions_for_kind(kind);
    match matches.as_slice() {
        [] => Err(ComposeError::NoDefinition { kind: kind.clone() }),
        [one] => Ok(*one),
        many => Err(ComposeError::AmbiguousDefinition {
            kind: kind.clone(),
            names: many.iter().map(|d| d.metadata.name.clone()).collect(),
        }),
    }
}

pub fn select_composition<'a>(
    compositions: impl IntoIterator<Item = &'a Composition>,
    definition: &ResourceDefinition,
    claim: &Claim,
) -> Result<&'a Composition, ComposeError> {
    let def_name = &definition.metadata.name;
    let eligible: Vec<&Composition> = compositions
        .into_iter()
        .filter(|c| &c.spec.definition == def_name)
        .collect();

    if let Some(name) = &claim.spec.composition_ref {
        return eligible
            .into_iter()
            .find(|c| &c.metadata.name == name)
            .ok_or_else(|| ComposeError::CompositionNotFound {
                claim: claim.id(),
                name: name.clone(),
                definition: def_name.clone(),
            });
    }

    let selector = &claim.spec.composition_selector;
    let mut matched: Vec<&Composition> = eligible
        .into_iter()
        .filter(|c| {
            selector
                .iter()
                .all(|(k, v)| c.metadata.labels.get(k) == Some(v))
        })
        .collect();
    matched.sort_by(|a, b| {
        b.spec
            .priority
            .cmp(&a.spec.priority)
            .then_with(|| a.metadata.name.cmp(&b.metadata.name))
    });

    match matched.as_slice() {
        [] => Err(ComposeError::NoComposition {
            claim: claim.id(),
            definition: def_name.clone(),
        }),
        [first, rest @ ..] => {
            let tied: Vec<String> = std::iter::once(*first)
                .chain(rest.iter().copied().filter(|c| c.spec.priority == first.spec.priority))
                .map(|c| c.metadata.name.clone())
                .collect();
            if tied.len() > 1 {
                Err(ComposeError::AmbiguousComposition {
                    claim: claim.id(),
                    candidates: tied,
                })
            } else {
                Ok(*first)
            }
        }
    }
}
