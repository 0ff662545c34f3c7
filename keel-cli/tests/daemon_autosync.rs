//! `keel daemon start` as a real process: source edits are picked up by the
//! watcher, and `keel sync` / `keel delete` route through the socket.

use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread::sleep;
use std::time::{Duration, Instant};

use tempfile::TempDir;

fn keel_bin() -> PathBuf {
    assert_cmd::cargo::cargo_bin("keel")
}

struct DaemonProcess {
    child: Child,
    home: PathBuf,
}

impl DaemonProcess {
    fn start(home: &Path) -> Self {
        let child = Command::new(keel_bin())
            .env("HOME", home)
            .env("USERPROFILE", home)
            .args(["daemon", "start"])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .expect("spawn daemon");
        Self {
            child,
            home: home.to_path_buf(),
        }
    }

    fn stop(&mut self) {
        let _ = keel(&self.home, &["daemon", "stop"]);

        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if let Ok(Some(_)) = self.child.try_wait() {
                return;
            }
            sleep(Duration::from_millis(50));
        }

        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

impl Drop for DaemonProcess {
    fn drop(&mut self) {
        self.stop();
    }
}

fn keel(home: &Path, args: &[&str]) -> std::process::Output {
    Command::new(keel_bin())
        .env("HOME", home)
        .env("USERPROFILE", home)
        .env("RUST_LOG", "warn")
        .args(args)
        .output()
        .expect("run keel")
}

fn daemon_running(home: &Path) -> bool {
    let output = keel(home, &["daemon", "status"]);
    if !output.status.success() {
        return false;
    }
    serde_json::from_slice::<serde_json::Value>(&output.stdout)
        .ok()
        .and_then(|v| v.get("running").and_then(|r| r.as_bool()))
        .unwrap_or(false)
}

fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        sleep(Duration::from_millis(100));
    }
    false
}

#[test]
fn source_change_is_reconciled_by_the_daemon() {
    let home = TempDir::new().expect("home");
    let source = home.path().join(".keel/manifests");
    std::fs::create_dir_all(&source).expect("source dir");
    std::fs::write(
        source.join("web.yaml"),
        "kind: Application\nmetadata: {name: web}\nspec:\n  resource: {kind: ConfigMap, data: {tier: v1}}\n",
    )
    .expect("manifest");

    let mut daemon = DaemonProcess::start(home.path());
    assert!(
        wait_until(Duration::from_secs(10), || daemon_running(home.path())),
        "daemon did not report running state in time",
    );

    let live = home.path().join(".keel/live/web.yaml");
    assert!(
        wait_until(Duration::from_secs(10), || live.exists()),
        "startup reconcile should write the application",
    );

    std::fs::write(
        source.join("web.yaml"),
        "kind: Application\nmetadata: {name: web}\nspec:\n  resource: {kind: ConfigMap, data: {tier: v2}}\n",
    )
    .expect("edit manifest");
    let synced = wait_until(Duration::from_secs(10), || {
        std::fs::read_to_string(&live)
            .map(|content| content.contains("v2"))
            .unwrap_or(false)
    });
    assert!(synced, "daemon did not reconcile the edited manifest in time");

    let sync = keel(home.path(), &["sync"]);
    assert!(
        sync.status.success(),
        "sync through daemon failed: {}",
        String::from_utf8_lossy(&sync.stderr),
    );

    let delete = keel(home.path(), &["delete", "app/web"]);
    assert!(
        delete.status.success(),
        "delete through daemon failed: {}",
        String::from_utf8_lossy(&delete.stderr),
    );
    assert!(!live.exists(), "delete through the daemon removes the live file");

    daemon.stop();
    assert!(
        !daemon_running(home.path()),
        "daemon should be stopped after 'keel daemon stop'",
    );
}
