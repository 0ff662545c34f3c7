//! Dependency Grouper: assigns every reconcilable unit to a wave.
//!
//! Edges come from explicit `dependsOn` plus the implicit owner edges
//! (managed resource -> composite -> claim). A unit's effective wave is
//! `max(declared, 1 + max(effective wave of each dependency))`.

pub mod error;
pub mod grouper;

pub use error::GraphError;
pub use grouper::{dependents_closure, group, plan, GraphNode, Grouping, WavePlan};
