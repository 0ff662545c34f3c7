//! keel core library: resource model, resource store, manifest ingestion,
//! engine configuration and the error taxonomy shared by every crate.
//!
//! - [`types`]: newtypes, desired-state documents, the reconcilable unit
//! - [`schema`]: claim schema validation and additive-change checks
//! - [`store`]: versioned desired/observed state with optimistic writes
//! - [`manifest`]: multi-document YAML source ingestion
//! - [`config`]: `~/.keel/config.yaml`
//! - [`error`]: [`ErrorClass`] and [`StoreError`]

pub mod config;
pub mod digest;
pub mod error;
pub mod manifest;
pub mod schema;
pub mod store;
pub mod types;

pub use config::{BackoffConfig, ConfigError, EngineConfig};
pub use digest::canonical_hash;
pub use error::{ErrorClass, StoreError};
pub use manifest::{load_manifests, parse_manifests, Manifest, ManifestError, ManifestSet};
pub use store::{ObservedUpdate, ResourceStore, RevisionRecord, StoreEntry, Upsert};
pub use types::{
    Application, Claim, ClaimPhase, CompositeResource, Composition, DeletionPolicy,
    DesiredState, ManagedResource, ObjectMeta, ObservedStatus, Patch, ReadinessCheck,
    ReconcilableUnit, ResourceDefinition, ResourceTemplate, RevisionId, SyncPolicy, SyncStatus,
    Transform, UnitId, UnitKind, UnitPhase, UnitSpec, UnitStatus, WaveOrdinal, DEFAULT_ADAPTER,
};
