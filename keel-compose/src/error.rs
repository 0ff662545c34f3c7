//! Error types for keel-compose.

use keel_core::{ErrorClass, StoreError, UnitId};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ComposeError {
    #[error("no ResourceDefinition declares claim kind '{kind}'")]
    NoDefinition { kind: String },

    #[error("claim kind '{kind}' is declared by several definitions: {names:?}")]
    AmbiguousDefinition { kind: String, names: Vec<String> },

    #[error("claim '{claim}' references composition '{name}' which does not exist for definition '{definition}'")]
    CompositionNotFound {
        claim: UnitId,
        name: String,
        definition: String,
    },

    #[error("no composition for definition '{definition}' matches claim '{claim}'")]
    NoComposition { claim: UnitId, definition: String },

    #[error("claim '{claim}' matches several compositions at the same priority: {candidates:?}")]
    AmbiguousComposition {
        claim: UnitId,
        candidates: Vec<String>,
    },

    #[error("claim '{claim}' violates its schema: {}", violations.join("; "))]
    SchemaValidation {
        claim: UnitId,
        violations: Vec<String>,
    },

    #[error("template '{template}': {reason}")]
    TemplateRender { template: String, reason: String },

    #[error("template '{template}' patches from '{referenced}', which is declared later in the composition")]
    PatchOrdering { template: String, referenced: String },

    #[error("template '{template}': resource is incomplete, missing {missing:?}")]
    IncompleteResource {
        template: String,
        missing: Vec<String>,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ComposeError {
    pub fn class(&self) -> ErrorClass {
        match self {
            ComposeError::NoDefinition { .. }
            | ComposeError::AmbiguousDefinition { .. }
            | ComposeError::CompositionNotFound { .. }
            | ComposeError::NoComposition { .. }
            | ComposeError::AmbiguousComposition { .. }
            | ComposeError::SchemaValidation { .. } => ErrorClass::Validation,
            ComposeError::TemplateRender { .. }
            | ComposeError::PatchOrdering { .. }
            | ComposeError::IncompleteResource { .. } => ErrorClass::Template,
            ComposeError::Store(e) => e.class(),
        }
    }

    pub(crate) fn render(template: &str, reason: impl Into<String>) -> Self {
        ComposeError::TemplateRender {
            template: template.to_string(),
            reason: reason.into(),
        }
    }
}
