//! # keel-sync
//!
//! Reconciliation scheduler, drift detection and provisioner adapters.
//!
//! Feed a [`ManifestSet`](keel_core::ManifestSet) to [`Scheduler::ingest`],
//! then drive [`Scheduler::reconcile_pass`] (or
//! [`Scheduler::run_until_settled`]) to converge the external system. A
//! [`DriftDetector`] running beside the scheduler notices out-of-band changes.

pub mod backoff;
pub mod clock;
pub mod deletion;
pub mod diff;
pub mod drift;
pub mod error;
pub mod file;
pub mod memory;
pub mod pipeline;
pub mod provisioner;
pub mod queue;
pub mod scheduler;

pub use backoff::Backoff;
pub use clock::Clock;
pub use diff::{diff_units, UnitDiff};
pub use drift::{DriftDetector, DriftEvent, DriftKind};
pub use error::{AdapterError, SyncError};
pub use file::FileProvisioner;
pub use memory::{CallKind, MemoryProvisioner};
pub use pipeline::{ingest, is_current, rollback, IngestReport, Rejection};
pub use provisioner::{
    ObservedState, Provisioner, ProvisionerRegistry, ResourceRef, ResourceSpec,
};
pub use scheduler::{PassReport, Scheduler};
