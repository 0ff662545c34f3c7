//! Error types for keel-graph.

use keel_core::{ErrorClass, UnitId};
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum GraphError {
    /// One entry per strongly connected component; each lists every member.
    #[error("dependency cycle among {}", format_cycles(.cycles))]
    Cycle { cycles: Vec<Vec<UnitId>> },

    #[error("unit '{unit}' depends on '{dependency}', which does not exist")]
    MissingDependency { unit: UnitId, dependency: UnitId },
}

impl GraphError {
    pub fn class(&self) -> ErrorClass {
        match self {
            GraphError::Cycle { .. } => ErrorClass::DependencyCycle,
            GraphError::MissingDependency { .. } => ErrorClass::Validation,
        }
    }
}

fn format_cycles(cycles: &[Vec<UnitId>]) -> String {
    cycles
        .iter()
        .map(|c| {
            let names: Vec<&str> = c.iter().map(UnitId::as_str).collect();
            format!("[{}]", names.join(", "))
        })
        .collect::<Vec<_>>()
        .join(", ")
}
