//! Resource store persistence, revision snapshots and definition immutability.

use assert_fs::prelude::*;
use keel_core::{
    config,
    manifest::parse_manifests,
    store::{load_revision_snapshot_at, save_revision_snapshot_at},
    DesiredState, Manifest, ManifestSet, ResourceStore, RevisionId, StoreError, UnitSpec,
};
use predicates::prelude::predicate;
use std::path::Path;

const DEFINITION_V1: &str = r#"
kind: ResourceDefinition
metadata:
  name: databases
spec:
  claimKind: Database
  compositeKind: XDatabase
  schema:
    type: object
    properties:
      size:
        type: string
"#;

const CLAIM: &str = r#"
kind: Claim
metadata:
  name: orders
  namespace: shop
spec:
  claimKind: Database
  parameters:
    size: small
"#;

fn one(yaml: &str) -> Manifest {
    parse_manifests(yaml, Path::new("inline.yaml"))
        .expect("parse")
        .remove(0)
}

fn definition(yaml: &str) -> keel_core::ResourceDefinition {
    match one(yaml) {
        Manifest::ResourceDefinition(d) => d,
        other => panic!("expected definition, got {}", other.kind_name()),
    }
}

fn store_with_claim() -> ResourceStore {
    let mut store = ResourceStore::new();
    store.put_definition(definition(DEFINITION_V1)).expect("v1");
    let Manifest::Claim(claim) = one(CLAIM) else {
        panic!("claim")
    };
    store.upsert(&claim.id(), DesiredState::Claim(claim), &UnitSpec::default(), None);
    store
}

// ---------------------------------------------------------------------------
// 1. Persistence
// ---------------------------------------------------------------------------

#[test]
fn save_and_load_roundtrip() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    let store = store_with_claim();
    let path = store.save_at(home.path()).expect("save");

    home.child(".keel/store/state.yaml")
        .assert(predicate::path::exists());
    assert!(!path.with_file_name("state.yaml.tmp").exists());

    let loaded = ResourceStore::load_at(home.path()).expect("load");
    let ids: Vec<_> = loaded.ids().cloned().collect();
    assert_eq!(ids, store.ids().cloned().collect::<Vec<_>>());
    assert_eq!(loaded.definitions().count(), 1);
}

#[test]
fn corrupt_store_reports_path() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    home.child(".keel/store/state.yaml")
        .write_str(": : not yaml [")
        .expect("write");
    let err = ResourceStore::load_at(home.path()).unwrap_err();
    assert!(matches!(err, StoreError::Parse { .. }), "got: {err}");
    assert!(err.to_string().contains("state.yaml"));
}

#[test]
fn missing_store_is_empty() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    let store = ResourceStore::load_at(home.path()).expect("load");
    assert_eq!(store.entries().count(), 0);
}

// ---------------------------------------------------------------------------
// 2. Revision snapshots
// ---------------------------------------------------------------------------

#[test]
fn revision_snapshot_roundtrip() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    let mut set = ManifestSet::default();
    set.insert(one(DEFINITION_V1)).unwrap();
    set.insert(one(CLAIM)).unwrap();

    let mut store = ResourceStore::new();
    let record = store.record_revision(&set, "manifests/", None);
    save_revision_snapshot_at(home.path(), record.id, &set).expect("snapshot");

    let loaded = load_revision_snapshot_at(home.path(), record.id).expect("load");
    assert_eq!(loaded, set);
    assert_eq!(record.digest, loaded.digest());
    assert_eq!(record.documents, 2);
}

#[test]
fn unknown_revision_is_not_found() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    let err = load_revision_snapshot_at(home.path(), RevisionId(42)).unwrap_err();
    assert!(matches!(err, StoreError::RevisionNotFound(42)));
}

// ---------------------------------------------------------------------------
// 3. Definition immutability
// ---------------------------------------------------------------------------

#[test]
fn additive_definition_change_is_accepted_while_claims_exist() {
    let mut store = store_with_claim();
    let v2 = DEFINITION_V1.replace(
        "      size:\n        type: string\n",
        "      size:\n        type: string\n      zone:\n        type: string\n",
    );
    assert!(store.put_definition(definition(&v2)).expect("additive"));
}

#[test]
fn breaking_definition_change_is_rejected_while_claims_exist() {
    let mut store = store_with_claim();
    let v2 = DEFINITION_V1.replace("type: string", "type: integer");
    let err = store.put_definition(definition(&v2)).unwrap_err();
    assert!(matches!(err, StoreError::ImmutableDefinition { .. }), "got: {err}");
    assert_eq!(err.class(), keel_core::ErrorClass::Validation);
    let kept = store.definition("databases").expect("kept");
    assert_eq!(kept, &definition(DEFINITION_V1));
}

#[test]
fn breaking_change_allowed_without_claims() {
    let mut store = ResourceStore::new();
    store.put_definition(definition(DEFINITION_V1)).unwrap();
    let v2 = DEFINITION_V1.replace("type: string", "type: integer");
    assert!(store.put_definition(definition(&v2)).is_ok());
}

#[test]
fn config_paths_live_under_dot_keel() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    assert!(config::store_path_at(home.path()).ends_with(".keel/store/state.yaml"));
    assert!(config::socket_path_at(home.path()).ends_with(".keel/daemon.sock"));
}
