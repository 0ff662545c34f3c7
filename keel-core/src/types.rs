//! Domain types for the keel resource model.
//!
//! Manifest documents (definitions, compositions, claims, applications)
//! deserialize from camelCase YAML. Generated objects (composites and managed
//! resources) and the scheduling wrapper [`ReconcilableUnit`] live alongside
//! them so every crate shares one vocabulary.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ErrorClass;
use crate::schema::SchemaProps;

/// Provisioner used when a template or application does not name one.
pub const DEFAULT_ADAPTER: &str = "default";

// ---------------------------------------------------------------------------
// Newtypes
// ---------------------------------------------------------------------------

/// Stable identifier of a reconcilable unit, e.g. `mr/team-a-db/instance`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UnitId(pub String);

impl UnitId {
    pub fn claim(namespace: &str, name: &str) -> Self {
        Self(format!("claim/{namespace}/{name}"))
    }

    pub fn composite(name: &str) -> Self {
        Self(format!("xr/{name}"))
    }

    pub fn managed(composite: &str, template: &str) -> Self {
        Self(format!("mr/{composite}/{template}"))
    }

    pub fn application(name: &str) -> Self {
        Self(format!("app/{name}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for UnitId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for UnitId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// Monotonically increasing id attributed to each source ingestion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RevisionId(pub u64);

impl fmt::Display for RevisionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitKind {
    Claim,
    Composite,
    Managed,
    Application,
}

impl UnitKind {
    /// Claims and composites are realised inside the engine; the rest go
    /// through a provisioner.
    pub fn is_external(self) -> bool {
        matches!(self, UnitKind::Managed | UnitKind::Application)
    }
}

impl fmt::Display for UnitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnitKind::Claim => write!(f, "claim"),
            UnitKind::Composite => write!(f, "composite"),
            UnitKind::Managed => write!(f, "managed"),
            UnitKind::Application => write!(f, "application"),
        }
    }
}

/// Last observed health of the unit's realised object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ObservedStatus {
    #[default]
    Unknown,
    Progressing,
    Healthy,
    Degraded,
    Missing,
}

impl fmt::Display for ObservedStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum SyncStatus {
    #[default]
    OutOfSync,
    Synced,
    Syncing,
    Error,
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Scheduler state machine position.
///
/// `Pending -> Applying -> {Healthy, Degraded, Error}`, back to `Pending` on a
/// spec change, plus `Deleting -> Deleted`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum UnitPhase {
    #[default]
    Pending,
    Applying,
    Healthy,
    Degraded,
    Error,
    Deleting,
    Deleted,
}

impl fmt::Display for UnitPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// User-facing lifecycle of a claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ClaimPhase {
    #[default]
    Pending,
    Bound,
    Ready,
    Deleting,
    Deleted,
}

/// What happens to the external object when its owner is deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum DeletionPolicy {
    #[default]
    Delete,
    Orphan,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncPolicy {
    pub auto_prune: bool,
    pub self_heal: bool,
}

// ---------------------------------------------------------------------------
// Manifest documents
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ObjectMeta {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

/// Declares a claim kind's schema and the composite kind it maps to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceDefinition {
    pub metadata: ObjectMeta,
    pub spec: DefinitionSpec,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DefinitionSpec {
    pub claim_kind: String,
    pub composite_kind: String,
    pub schema: SchemaProps,
}

/// A named template bound to one [`ResourceDefinition`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Composition {
    pub metadata: ObjectMeta,
    pub spec: CompositionSpec,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompositionSpec {
    /// Name of the [`ResourceDefinition`] this composition implements.
    pub definition: String,
    /// Higher wins among label-matched candidates.
    #[serde(default)]
    pub priority: i32,
    pub resources: Vec<ResourceTemplate>,
}

/// One generated resource inside a composition, instantiated in declaration order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceTemplate {
    pub name: String,
    #[serde(default = "default_adapter")]
    pub adapter: String,
    pub base: Value,
    #[serde(default)]
    pub patches: Vec<Patch>,
    /// Field paths that must be non-null once patches are applied.
    #[serde(default)]
    pub required: Vec<String>,
    #[serde(default)]
    pub readiness_checks: Vec<ReadinessCheck>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wave: Option<i64>,
    /// Sibling template names this resource waits for.
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_policy: Option<DeletionPolicy>,
}

fn default_adapter() -> String {
    DEFAULT_ADAPTER.to_string()
}

/// Closed set of field-patch operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Patch {
    /// Copy a claim field into the generated resource.
    FromClaimFieldPath {
        from: String,
        to: String,
        #[serde(default)]
        transforms: Vec<Transform>,
        #[serde(default)]
        optional: bool,
    },
    /// Copy a field from an already-resolved sibling resource.
    FromCompositeFieldPath {
        resource: String,
        from: String,
        to: String,
        #[serde(default)]
        transforms: Vec<Transform>,
        #[serde(default)]
        optional: bool,
    },
    /// Render several sources through one format template.
    Combine {
        sources: Vec<FieldSource>,
        template: String,
        to: String,
    },
}

impl Patch {
    pub fn target(&self) -> &str {
        match self {
            Patch::FromClaimFieldPath { to, .. }
            | Patch::FromCompositeFieldPath { to, .. }
            | Patch::Combine { to, .. } => to,
        }
    }
}

/// A value source: the claim when `resource` is absent, otherwise a sibling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSource {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Transform {
    Map {
        pairs: BTreeMap<String, Value>,
        #[serde(default)]
        fallback: Option<Value>,
    },
    Format {
        template: String,
    },
    Math {
        #[serde(default)]
        multiply: Option<f64>,
        #[serde(default)]
        add: Option<f64>,
    },
    Convert {
        to: ConvertTarget,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConvertTarget {
    String,
    Int,
    Float,
    Bool,
}

/// Wait condition evaluated against observed state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ReadinessCheck {
    MatchString {
        #[serde(rename = "fieldPath")]
        field_path: String,
        value: String,
    },
    MatchTrue {
        #[serde(rename = "fieldPath")]
        field_path: String,
    },
    NonEmpty {
        #[serde(rename = "fieldPath")]
        field_path: String,
    },
}

/// User-authored desired-state request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claim {
    pub metadata: ObjectMeta,
    pub spec: ClaimSpec,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimSpec {
    /// Matched against [`DefinitionSpec::claim_kind`].
    pub claim_kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub composition_ref: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub composition_selector: BTreeMap<String, String>,
    #[serde(default)]
    pub deletion_policy: DeletionPolicy,
    #[serde(default)]
    pub sync_policy: SyncPolicy,
    #[serde(default)]
    pub wave: i64,
    #[serde(default)]
    pub depends_on: Vec<UnitId>,
    #[serde(default = "empty_object")]
    pub parameters: Value,
}

impl Claim {
    pub fn namespace(&self) -> &str {
        self.metadata.namespace.as_deref().unwrap_or("default")
    }

    pub fn id(&self) -> UnitId {
        UnitId::claim(self.namespace(), &self.metadata.name)
    }

    /// Deterministic name of the composite this claim owns.
    pub fn composite_name(&self) -> String {
        format!("{}-{}", self.namespace(), self.metadata.name)
    }
}

/// Externally defined unit applied as-is through a provisioner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Application {
    pub metadata: ObjectMeta,
    pub spec: ApplicationSpec,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationSpec {
    #[serde(default = "default_adapter")]
    pub adapter: String,
    pub resource: Value,
    #[serde(default)]
    pub wave: i64,
    #[serde(default)]
    pub depends_on: Vec<UnitId>,
    #[serde(default)]
    pub sync_policy: SyncPolicy,
    #[serde(default)]
    pub readiness_checks: Vec<ReadinessCheck>,
}

impl Application {
    pub fn id(&self) -> UnitId {
        UnitId::application(&self.metadata.name)
    }
}

fn empty_object() -> Value {
    Value::Object(serde_json::Map::new())
}

// ---------------------------------------------------------------------------
// Generated objects
// ---------------------------------------------------------------------------

/// Cluster-scoped materialisation of a claim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompositeResource {
    pub name: String,
    pub composite_kind: String,
    pub claim: UnitId,
    pub definition: String,
    pub composition: String,
    pub resource_refs: Vec<UnitId>,
    pub parameters: Value,
}

/// Leaf unit representing one external object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagedResource {
    pub name: String,
    pub owner: UnitId,
    pub template: String,
    pub adapter: String,
    pub deletion_policy: DeletionPolicy,
    pub body: Value,
    #[serde(default)]
    pub readiness_checks: Vec<ReadinessCheck>,
}

/// Desired-state layer of a store entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum DesiredState {
    Claim(Claim),
    Composite(CompositeResource),
    Managed(ManagedResource),
    Application(Application),
}

impl DesiredState {
    pub fn kind(&self) -> UnitKind {
        match self {
            DesiredState::Claim(_) => UnitKind::Claim,
            DesiredState::Composite(_) => UnitKind::Composite,
            DesiredState::Managed(_) => UnitKind::Managed,
            DesiredState::Application(_) => UnitKind::Application,
        }
    }

    /// Provisioner name for externally realised units.
    pub fn adapter(&self) -> Option<&str> {
        match self {
            DesiredState::Managed(mr) => Some(&mr.adapter),
            DesiredState::Application(app) => Some(&app.spec.adapter),
            _ => None,
        }
    }

    /// Body handed to the provisioner for externally realised units.
    pub fn body(&self) -> Option<&Value> {
        match self {
            DesiredState::Managed(mr) => Some(&mr.body),
            DesiredState::Application(app) => Some(&app.spec.resource),
            _ => None,
        }
    }

    pub fn readiness_checks(&self) -> &[ReadinessCheck] {
        match self {
            DesiredState::Managed(mr) => &mr.readiness_checks,
            DesiredState::Application(app) => &app.spec.readiness_checks,
            _ => &[],
        }
    }

    pub fn deletion_policy(&self) -> DeletionPolicy {
        match self {
            DesiredState::Managed(mr) => mr.deletion_policy,
            DesiredState::Claim(claim) => claim.spec.deletion_policy,
            _ => DeletionPolicy::Delete,
        }
    }
}

// ---------------------------------------------------------------------------
// Scheduling wrapper
// ---------------------------------------------------------------------------

/// Declared wave plus the wave computed by the dependency grouper.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct WaveOrdinal {
    pub declared: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub computed: Option<i64>,
}

impl WaveOrdinal {
    pub fn effective(&self) -> i64 {
        self.computed.unwrap_or(self.declared)
    }
}

/// Scheduling metadata supplied when a desired state is written.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct UnitSpec {
    pub wave: i64,
    pub depends_on: BTreeSet<UnitId>,
    pub owner: Option<UnitId>,
    pub sync_policy: SyncPolicy,
}

/// A fatal error pinned to the desired hash that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FatalRecord {
    pub class: ErrorClass,
    pub input_hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeletionRequest {
    pub requested_at: DateTime<Utc>,
    #[serde(default)]
    pub force: bool,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub stuck: bool,
}

/// Generic wave-scheduling wrapper around a claim, composite, managed
/// resource or application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcilableUnit {
    pub id: UnitId,
    pub kind: UnitKind,
    pub wave: WaveOrdinal,
    #[serde(default)]
    pub depends_on: BTreeSet<UnitId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<UnitId>,
    #[serde(default)]
    pub sync_policy: SyncPolicy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_applied_hash: Option<String>,
    #[serde(default)]
    pub observed_status: ObservedStatus,
    #[serde(default)]
    pub sync_status: SyncStatus,
    #[serde(default)]
    pub phase: UnitPhase,
    #[serde(default)]
    pub message: String,
    pub last_transition_time: DateTime<Utc>,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub applying_since: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fatal: Option<FatalRecord>,
    /// Class of the most recent apply or delete failure; cleared on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<ErrorClass>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion: Option<DeletionRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_name: Option<String>,
    /// Set by the drift detector when live state diverges from desired.
    #[serde(default)]
    pub drifted: bool,
    /// Dropped from the desired set; awaiting prune after its wave settles.
    #[serde(default)]
    pub prune_pending: bool,
    /// Aggregated readiness (children AND'ed for composites and claims).
    #[serde(default)]
    pub ready: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claim_phase: Option<ClaimPhase>,
}

impl ReconcilableUnit {
    pub fn new(id: UnitId, kind: UnitKind, spec: &UnitSpec) -> Self {
        Self {
            id,
            kind,
            wave: WaveOrdinal {
                declared: spec.wave,
                computed: None,
            },
            depends_on: spec.depends_on.clone(),
            owner: spec.owner.clone(),
            sync_policy: spec.sync_policy,
            last_applied_hash: None,
            observed_status: ObservedStatus::Unknown,
            sync_status: SyncStatus::OutOfSync,
            phase: UnitPhase::Pending,
            message: "awaiting first reconcile".to_string(),
            last_transition_time: Utc::now(),
            attempts: 0,
            retry_after: None,
            applying_since: None,
            fatal: None,
            last_error: None,
            deletion: None,
            observed_hash: None,
            external_name: None,
            drifted: false,
            prune_pending: false,
            ready: false,
            claim_phase: (kind == UnitKind::Claim).then_some(ClaimPhase::Pending),
        }
    }

    /// Move to `phase` with a human-readable message.
    ///
    /// `last_transition_time` only advances when the phase actually changes.
    pub fn transition(&mut self, phase: UnitPhase, message: impl Into<String>) {
        if self.phase != phase {
            self.phase = phase;
            self.last_transition_time = Utc::now();
        }
        self.message = message.into();
    }

    pub fn is_healthy(&self) -> bool {
        self.observed_status == ObservedStatus::Healthy && self.phase == UnitPhase::Healthy
    }

    pub fn is_deleting(&self) -> bool {
        self.deletion.is_some()
    }

    /// Read-only status export.
    pub fn status(&self) -> UnitStatus {
        UnitStatus {
            id: self.id.clone(),
            kind: self.kind,
            phase: self.phase,
            wave: self.wave.effective(),
            sync_status: self.sync_status,
            observed_status: self.observed_status,
            last_applied_hash: self.last_applied_hash.clone(),
            last_transition_time: self.last_transition_time,
            message: self.message.clone(),
        }
    }
}

/// Status exported for dashboards and alerting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnitStatus {
    pub id: UnitId,
    pub kind: UnitKind,
    pub phase: UnitPhase,
    pub wave: i64,
    pub sync_status: SyncStatus,
    pub observed_status: ObservedStatus,
    pub last_applied_hash: Option<String>,
    pub last_transition_time: DateTime<Utc>,
    pub message: String,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_id_constructors() {
        assert_eq!(UnitId::claim("team-a", "db").to_string(), "claim/team-a/db");
        assert_eq!(UnitId::composite("team-a-db").as_str(), "xr/team-a-db");
        assert_eq!(UnitId::managed("team-a-db", "instance").0, "mr/team-a-db/instance");
        assert_eq!(UnitId::application("ingress").0, "app/ingress");
    }

    #[test]
    fn transition_time_moves_only_on_phase_change() {
        let mut unit = ReconcilableUnit::new(
            UnitId::from("app/x"),
            UnitKind::Application,
            &UnitSpec::default(),
        );
        unit.transition(UnitPhase::Applying, "applying");
        let first = unit.last_transition_time;
        unit.transition(UnitPhase::Applying, "still applying");
        assert_eq!(unit.last_transition_time, first);
        assert_eq!(unit.message, "still applying");
    }

    #[test]
    fn claim_yaml_defaults() {
        let yaml = r#"
metadata:
  name: c1
  namespace: team-a
spec:
  claimKind: Database
  parameters:
    size: small
"#;
        let claim: Claim = serde_yaml::from_str(yaml).expect("claim");
        assert_eq!(claim.spec.deletion_policy, DeletionPolicy::Delete);
        assert_eq!(claim.spec.wave, 0);
        assert!(!claim.spec.sync_policy.auto_prune);
        assert_eq!(claim.composite_name(), "team-a-c1");
    }

    #[test]
    fn patch_tagged_serde() {
        let yaml = r#"
- type: fromClaimFieldPath
  from: spec.size
  to: spec.forProvider.size
- type: fromCompositeFieldPath
  resource: network
  from: status.id
  to: spec.networkId
- type: combine
  sources:
    - path: metadata.name
    - resource: network
      path: spec.region
  template: "{{ v0 }}-{{ v1 }}"
  to: metadata.labels.slug
"#;
        let patches: Vec<Patch> = serde_yaml::from_str(yaml).expect("patches");
        assert_eq!(patches.len(), 3);
        assert_eq!(patches[1].target(), "spec.networkId");
        assert!(matches!(patches[2], Patch::Combine { .. }));
    }

    #[test]
    fn only_managed_and_application_are_external() {
        assert!(UnitKind::Managed.is_external());
        assert!(UnitKind::Application.is_external());
        assert!(!UnitKind::Claim.is_external());
        assert!(!UnitKind::Composite.is_external());
    }
}
