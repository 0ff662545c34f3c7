//! A real daemon over its Unix socket, with the file provisioner.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use keel_daemon::{paths, request_delete, request_status, request_stop, request_sync, run};
use serde_json::Value;
use tempfile::TempDir;

const WEB: &str = "kind: Application\nmetadata: {name: web}\nspec:\n  resource: {kind: ConfigMap, data: {tier: frontend}}\n";

async fn blocking<T, F>(home: &Path, f: F) -> T
where
    F: FnOnce(PathBuf) -> T + Send + 'static,
    T: Send + 'static,
{
    let home = home.to_path_buf();
    tokio::task::spawn_blocking(move || f(home))
        .await
        .expect("blocking client")
}

async fn wait_for_socket(home: &Path) {
    let socket = paths::socket_path(home);
    for _ in 0..100 {
        if socket.exists() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("daemon socket never appeared at {}", socket.display());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn status_sync_delete_and_stop_over_the_socket() {
    let home = TempDir::new().expect("home");
    let source = home.path().join(".keel/manifests");
    fs::create_dir_all(&source).expect("source dir");
    fs::write(source.join("web.yaml"), WEB).expect("manifest");

    let daemon = tokio::spawn(run(home.path().to_path_buf()));
    wait_for_socket(home.path()).await;

    let status: Value = blocking(home.path(), |h| request_status(&h))
        .await
        .expect("status");
    assert_eq!(status["running"], Value::Bool(true));

    blocking(home.path(), |h| request_sync(&h, None))
        .await
        .expect("sync");
    let live = home.path().join(".keel/live/web.yaml");
    assert!(live.exists(), "file provisioner wrote the application");

    let deleted = blocking(home.path(), |h| request_delete(&h, "app/web".to_string(), false))
        .await
        .expect("delete");
    assert_eq!(deleted["deleting"][0], Value::from("app/web"));
    assert!(!live.exists());

    let err = blocking(home.path(), |h| request_sync(&h, Some("app/nope".to_string())))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("not found"));

    blocking(home.path(), |h| request_stop(&h))
        .await
        .expect("stop");
    tokio::time::timeout(Duration::from_secs(10), daemon)
        .await
        .expect("daemon exits after stop")
        .expect("join")
        .expect("clean shutdown");

    assert!(!paths::socket_path(home.path()).exists());
    assert!(keel_core::config::store_path_at(home.path()).exists());
}
