//! Composition Resolver: turns a claim into one composite resource and the
//! managed resources its composition templates describe.
//!
//! Resolution never touches a provisioner. [`resolve`] is pure over the
//! store; [`resolve_into`] writes the result back, and writes nothing when
//! resolution fails.

pub mod error;
pub mod fieldpath;
pub mod readiness;
pub mod resolver;
pub mod select;
pub mod transform;

pub use error::ComposeError;
pub use readiness::is_ready;
pub use resolver::{resolve, resolve_into, ResolveOutcome, Resolution, ResolvedResource};
pub use select::{select_composition, select_definition};
