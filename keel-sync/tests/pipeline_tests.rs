//! Source ingestion, revisions and the file provisioner.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use keel_core::manifest::parse_manifests;
use keel_core::{
    EngineConfig, ErrorClass, ManifestSet, ResourceStore, RevisionId, SyncStatus, UnitId, UnitPhase,
};
use keel_sync::{
    diff_units, ingest, is_current, rollback, FileProvisioner, ProvisionerRegistry, Scheduler,
};
use serde_json::json;
use tempfile::TempDir;

fn manifests(yaml: &str) -> ManifestSet {
    let mut set = ManifestSet::default();
    for manifest in parse_manifests(yaml, Path::new("test.yaml")).expect("parse") {
        set.insert(manifest).expect("insert");
    }
    set
}

fn web(replicas: u32, sync_policy: &str) -> ManifestSet {
    manifests(&format!(
        "kind: Application\nmetadata: {{name: web}}\nspec:\n  resource:\n    kind: Deployment\n    spec: {{replicas: {replicas}}}\n{sync_policy}"
    ))
}

fn desired_replicas(store: &ResourceStore) -> serde_json::Value {
    store
        .get(&UnitId::from("app/web"))
        .and_then(|e| e.desired.body().cloned())
        .map(|body| body["spec"]["replicas"].clone())
        .unwrap_or_default()
}

const DEFINITION_V1: &str = r#"
kind: ResourceDefinition
metadata:
  name: buckets
spec:
  claimKind: Bucket
  compositeKind: XBucket
  schema:
    type: object
    properties:
      region:
        type: string
---
kind: Composition
metadata:
  name: bucket-standard
spec:
  definition: buckets
  resources:
    - name: bucket
      base: {kind: Bucket}
---
kind: Claim
metadata: {name: assets, namespace: web}
spec:
  claimKind: Bucket
"#;

// ---------------------------------------------------------------------------
// Revisions
// ---------------------------------------------------------------------------

#[test]
fn each_ingest_records_a_revision_and_snapshot() {
    let home = TempDir::new().expect("home");
    let mut store = ResourceStore::new();

    let first = ingest(&mut store, &web(1, ""), "manifests", None, Some(home.path())).expect("v1");
    let second = ingest(&mut store, &web(2, ""), "manifests", None, Some(home.path())).expect("v2");

    assert_eq!(first.revision, RevisionId(1));
    assert_eq!(first.created, vec![UnitId::from("app/web")]);
    assert_eq!(second.revision, RevisionId(2));
    assert_eq!(second.updated, vec![UnitId::from("app/web")]);
    assert_eq!(store.revisions().len(), 2);
    assert!(home.path().join(".keel/store/revisions/1.yaml").exists());
    assert!(home.path().join(".keel/store/revisions/2.yaml").exists());
}

#[test]
fn rollback_reingests_an_old_snapshot() {
    let home = TempDir::new().expect("home");
    let mut store = ResourceStore::new();
    ingest(&mut store, &web(1, ""), "manifests", None, Some(home.path())).expect("v1");
    ingest(&mut store, &web(2, ""), "manifests", None, Some(home.path())).expect("v2");
    assert_eq!(desired_replicas(&store), json!(2));

    let report = rollback(&mut store, home.path(), RevisionId(1)).expect("rollback");

    assert_eq!(report.revision, RevisionId(3));
    assert_eq!(desired_replicas(&store), json!(1));
    let latest = store.latest_revision().expect("latest");
    assert_eq!(latest.rollback_of, Some(RevisionId(1)));
    assert!(is_current(&store, &web(1, "")));
    assert!(!is_current(&store, &web(2, "")));
}

#[test]
fn rollback_to_unknown_revision_fails() {
    let home = TempDir::new().expect("home");
    let mut store = ResourceStore::new();
    ingest(&mut store, &web(1, ""), "manifests", None, Some(home.path())).expect("v1");

    let err = rollback(&mut store, home.path(), RevisionId(9)).unwrap_err();
    assert!(err.to_string().contains("9"));
    assert_eq!(store.revisions().len(), 1);
}

// ---------------------------------------------------------------------------
// Removal
// ---------------------------------------------------------------------------

#[test]
fn removed_unit_is_deleted_with_auto_prune() {
    let mut store = ResourceStore::new();
    ingest(&mut store, &web(1, "  syncPolicy: {autoPrune: true}\n"), "m", None, None).expect("v1");

    let report = ingest(&mut store, &ManifestSet::default(), "m", None, None).expect("empty");

    assert_eq!(report.removed, vec![UnitId::from("app/web")]);
    let unit = &store.get(&UnitId::from("app/web")).expect("still tracked").unit;
    assert!(unit.is_deleting());
    assert_eq!(unit.phase, UnitPhase::Deleting);
}

#[test]
fn removed_unit_is_kept_without_auto_prune() {
    let mut store = ResourceStore::new();
    ingest(&mut store, &web(1, ""), "m", None, None).expect("v1");

    let report = ingest(&mut store, &ManifestSet::default(), "m", None, None).expect("empty");

    assert_eq!(report.out_of_sync, vec![UnitId::from("app/web")]);
    let unit = &store.get(&UnitId::from("app/web")).expect("kept").unit;
    assert!(!unit.is_deleting());
    assert_eq!(unit.sync_status, SyncStatus::OutOfSync);
}

// ---------------------------------------------------------------------------
// Definitions
// ---------------------------------------------------------------------------

#[test]
fn breaking_definition_change_is_rejected_while_claims_exist() {
    let mut store = ResourceStore::new();
    let v1 = manifests(DEFINITION_V1);
    let report = ingest(&mut store, &v1, "m", None, None).expect("v1");
    assert!(report.rejected.is_empty());
    assert!(store.contains(&UnitId::from("mr/web-assets/bucket")));

    let v2 = manifests(&DEFINITION_V1.replace("      region:\n        type: string\n", "      tier:\n        type: string\n"));
    let report = ingest(&mut store, &v2, "m", None, None).expect("v2");

    assert_eq!(report.worst_class(), Some(ErrorClass::Validation));
    assert!(report.rejected[0].message.contains("spec.region: field removed"));
    let kept = store.definition("buckets").expect("kept");
    assert!(kept.spec.schema.properties.contains_key("region"));
}

#[test]
fn additive_definition_change_is_accepted() {
    let mut store = ResourceStore::new();
    ingest(&mut store, &manifests(DEFINITION_V1), "m", None, None).expect("v1");

    let v2 = manifests(&DEFINITION_V1.replace(
        "      region:\n        type: string\n",
        "      region:\n        type: string\n      tier:\n        type: string\n",
    ));
    let report = ingest(&mut store, &v2, "m", None, None).expect("v2");

    assert!(report.rejected.is_empty());
    let def = store.definition("buckets").expect("definition");
    assert!(def.spec.schema.properties.contains_key("tier"));
}

// ---------------------------------------------------------------------------
// File provisioner
// ---------------------------------------------------------------------------

#[tokio::test]
async fn file_provisioner_end_to_end() {
    let out = TempDir::new().expect("out");
    let registry = ProvisionerRegistry::with_default(Arc::new(FileProvisioner::new(out.path())));
    let scheduler = Scheduler::new(ResourceStore::new(), registry, EngineConfig::default());

    scheduler.ingest(&web(1, ""), "m", None).await.expect("ingest");
    scheduler.run_until_settled(5).await.expect("settle");

    let written = fs::read_to_string(out.path().join("web.yaml")).expect("written");
    assert!(written.contains("replicas: 1"));

    // Edited behind the engine's back: diff shows it, nothing is applied.
    fs::write(
        out.path().join("web.yaml"),
        "kind: Deployment\nspec:\n  replicas: 5\n",
    )
    .expect("tamper");
    let store = scheduler.store();
    let store = store.lock().await;
    let diffs = diff_units(&store, scheduler.provisioners(), None).await.expect("diff");
    assert_eq!(diffs.len(), 1);
    assert!(diffs[0].unified_diff.contains("-  replicas: 5"));
    assert!(diffs[0].unified_diff.contains("+  replicas: 1"));
}
