use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::io::ErrorKind;
use std::os::unix::net::UnixStream as StdUnixStream;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use notify::{recommended_watcher, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, mpsc, oneshot, RwLock};
use tokio::time::{Instant, MissedTickBehavior};

use keel_core::{config, load_manifests, ResourceStore, UnitId};
use keel_sync::{
    is_current, DriftDetector, FileProvisioner, IngestReport, PassReport, ProvisionerRegistry,
    Scheduler,
};

use crate::error::{io_err, DaemonError};
use crate::paths::{output_dir_at, socket_path, source_dir_at, DEBOUNCE_WINDOW};
use crate::protocol::{DaemonRequest, DaemonResponse};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Job {
    /// Re-read the source directory, ingest it if it changed, reconcile.
    Reload,
    Sync(UnitId),
    Delete { unit: UnitId, force: bool },
}

impl fmt::Display for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Job::Reload => write!(f, "reload"),
            Job::Sync(unit) => write!(f, "sync {unit}"),
            Job::Delete { unit, force } => write!(f, "delete {unit} (force: {force})"),
        }
    }
}

struct JobRequest {
    job: Job,
    source: &'static str,
    respond_to: oneshot::Sender<Result<Value, String>>,
}

/// Unix-second timestamps of recent daemon work; `0` means never.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Activity {
    pub last_ingest_at_unix: u64,
    pub last_pass_at_unix: u64,
    pub passes: u64,
}

/// Everything one daemon instance shares between its tasks.
pub struct DaemonContext {
    home: PathBuf,
    source_dir: PathBuf,
    scheduler: Arc<Scheduler>,
    activity: RwLock<Activity>,
    started_at_unix: u64,
}

impl DaemonContext {
    pub fn new(home: PathBuf, source_dir: PathBuf, scheduler: Arc<Scheduler>) -> Self {
        Self {
            home,
            source_dir,
            scheduler,
            activity: RwLock::new(Activity::default()),
            started_at_unix: unix_seconds_now(),
        }
    }

    /// Config and store from `<home>/.keel/`, with the file provisioner
    /// writing under the configured output directory.
    pub fn load(home: &Path) -> Result<Self, DaemonError> {
        let config = config::load_at(home)?;
        let source_dir = source_dir_at(home, &config);
        let output_dir = output_dir_at(home, &config);
        let store = ResourceStore::load_at(home)?;
        let registry = ProvisionerRegistry::with_default(Arc::new(FileProvisioner::new(output_dir)));
        let scheduler = Arc::new(Scheduler::new(store, registry, config));
        Ok(Self::new(home.to_path_buf(), source_dir, scheduler))
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub fn source_dir(&self) -> &Path {
        &self.source_dir
    }

    async fn handle(&self, job: &Job, source: &str) -> Result<Value, DaemonError> {
        match job {
            Job::Reload => {
                let ingest = self.reload(source).await?;
                let pass = self.settle().await?;
                Ok(json!({ "ingest": ingest, "pass": pass }))
            }
            Job::Sync(unit) => {
                self.scheduler.force_sync(unit).await?;
                let pass = self.settle().await?;
                Ok(json!({ "unit": unit, "pass": pass }))
            }
            Job::Delete { unit, force } => {
                let deleting = if *force {
                    self.scheduler.force_delete(unit).await?
                } else {
                    self.scheduler.request_delete(unit, false).await?
                };
                self.save().await?;
                let pass = self.settle().await?;
                Ok(json!({ "deleting": deleting, "pass": pass }))
            }
        }
    }

    /// Ingest the source directory unless it matches the latest revision.
    async fn reload(&self, source: &str) -> Result<Option<IngestReport>, DaemonError> {
        let dir = self.source_dir.clone();
        let set = tokio::task::spawn_blocking(move || load_manifests(&dir))
            .await
            .map_err(|err| DaemonError::Protocol(format!("manifest load join error: {err}")))??;

        {
            let store = self.scheduler.store();
            let store = store.lock().await;
            if is_current(&store, &set) {
                tracing::debug!("source unchanged since last revision");
                return Ok(None);
            }
        }

        let report = self
            .scheduler
            .ingest(&set, source, Some(&self.home))
            .await?;
        self.save().await?;
        self.activity.write().await.last_ingest_at_unix = unix_seconds_now();
        Ok(Some(report))
    }

    /// Passes until one makes no progress. Retries and readiness waits are
    /// left to the resync timer.
    async fn settle(&self) -> Result<PassReport, DaemonError> {
        let mut total = PassReport::default();
        for _ in 0..self.scheduler.config().max_passes.max(1) {
            let report = self.pass().await?;
            let progressed = report.progressed();
            total.merge(report);
            if !progressed {
                break;
            }
        }
        Ok(total)
    }

    async fn pass(&self) -> Result<PassReport, DaemonError> {
        let report = self.scheduler.reconcile_pass().await?;
        self.save().await?;
        let mut activity = self.activity.write().await;
        activity.last_pass_at_unix = unix_seconds_now();
        activity.passes += 1;
        Ok(report)
    }

    async fn save(&self) -> Result<(), DaemonError> {
        let snapshot = {
            let store = self.scheduler.store();
            let store = store.lock().await;
            store.clone()
        };
        let home = self.home.clone();
        tokio::task::spawn_blocking(move || snapshot.save_at(&home))
            .await
            .map_err(|err| DaemonError::Protocol(format!("store save join error: {err}")))??;
        Ok(())
    }

    pub async fn status_payload(&self) -> Value {
        let activity = self.activity.read().await.clone();
        let revision = {
            let store = self.scheduler.store();
            let store = store.lock().await;
            store.latest_revision().map(|r| r.id)
        };
        let units = self.scheduler.statuses().await;

        json!({
            "running": true,
            "started_at_unix": self.started_at_unix,
            "last_ingest_at_unix": activity.last_ingest_at_unix,
            "last_pass_at_unix": activity.last_pass_at_unix,
            "passes": activity.passes,
            "revision": revision,
            "units": units,
            "socket": socket_path(&self.home).display().to_string(),
            "source_dir": self.source_dir.display().to_string(),
        })
    }
}

/// Start the daemon runtime and block the current thread until it exits.
pub fn start_blocking(home: &Path) -> Result<(), DaemonError> {
    init_tracing();
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| io_err("tokio-runtime", e))?;
    runtime.block_on(run(home.to_path_buf()))
}

/// Run the daemon for `home` until `stop` or ctrl-c.
pub async fn run(home: PathBuf) -> Result<(), DaemonError> {
    let context = Arc::new(DaemonContext::load(&home)?);
    serve(context).await
}

/// Run every daemon task over an existing context.
pub async fn serve(context: Arc<DaemonContext>) -> Result<(), DaemonError> {
    ensure_runtime_dirs(&context)?;

    let (job_tx, job_rx) = mpsc::channel::<JobRequest>(64);
    let (shutdown_tx, _) = broadcast::channel::<()>(16);

    let watcher_handle = {
        let shutdown = shutdown_tx.clone();
        let shutdown_rx = shutdown.subscribe();
        let context = context.clone();
        let job_tx = job_tx.clone();
        tokio::spawn(async move {
            let result = watcher_task(context, job_tx, shutdown_rx).await;
            let _ = shutdown.send(());
            result
        })
    };

    let scheduler_handle = {
        let shutdown = shutdown_tx.clone();
        let shutdown_rx = shutdown.subscribe();
        let context = context.clone();
        tokio::spawn(async move {
            let result = scheduler_task(context, job_rx, shutdown_rx).await;
            let _ = shutdown.send(());
            result
        })
    };

    let drift_handle = {
        let shutdown = shutdown_tx.clone();
        let shutdown_rx = shutdown.subscribe();
        let detector = DriftDetector::new(context.scheduler.clone());
        tokio::spawn(async move {
            detector.run(shutdown_rx).await;
            let _ = shutdown.send(());
            Ok::<(), DaemonError>(())
        })
    };

    let socket_handle = {
        let shutdown = shutdown_tx.clone();
        let shutdown_rx = shutdown.subscribe();
        let context = context.clone();
        let job_tx = job_tx.clone();
        tokio::spawn(async move {
            let result =
                socket_server_task(context, job_tx, shutdown.clone(), shutdown_rx).await;
            let _ = shutdown.send(());
            result
        })
    };

    let signal_handle = {
        let shutdown = shutdown_tx.clone();
        let mut shutdown_rx = shutdown.subscribe();
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown_rx.recv() => Ok(()),
                signal = tokio::signal::ctrl_c() => {
                    match signal {
                        Ok(()) => {
                            tracing::info!("received ctrl-c, shutting down daemon");
                            let _ = shutdown.send(());
                            Ok(())
                        }
                        Err(err) => Err(DaemonError::Protocol(format!("ctrl-c handler failed: {err}"))),
                    }
                }
            }
        })
    };
    drop(job_tx);

    let (watcher_result, scheduler_result, drift_result, socket_result, signal_result) = tokio::join!(
        watcher_handle,
        scheduler_handle,
        drift_handle,
        socket_handle,
        signal_handle
    );

    handle_join("watcher", watcher_result)?;
    handle_join("scheduler", scheduler_result)?;
    handle_join("drift", drift_result)?;
    handle_join("socket_server", socket_result)?;
    handle_join("signal_handler", signal_result)?;
    Ok(())
}

async fn watcher_task(
    context: Arc<DaemonContext>,
    job_tx: mpsc::Sender<JobRequest>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    // FSEvents reports real paths (/private/var/... on macOS).
    let root = fs::canonicalize(context.source_dir())
        .unwrap_or_else(|_| context.source_dir().to_path_buf());

    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<notify::Result<Event>>();
    let mut watcher: RecommendedWatcher = recommended_watcher(move |event| {
        let _ = event_tx.send(event);
    })?;

    let mut watched_dirs = HashSet::new();
    register_source_tree(&mut watcher, &mut watched_dirs, &root)?;

    let mut debounce = Debouncer::new(DEBOUNCE_WINDOW);

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            _ = sleep_until_due(debounce.due()) => {
                if !debounce.take_due(Instant::now()) {
                    continue;
                }
                match enqueue(&job_tx, Job::Reload, "watcher").await {
                    Ok(data) => tracing::info!(
                        revision = %data["ingest"]["revision"],
                        applied = data["pass"]["applied"].as_array().map_or(0, Vec::len),
                        "source change reconciled",
                    ),
                    Err(err) => tracing::error!(error = %err, "source reload failed"),
                }
            }
            event = event_rx.recv() => {
                let Some(event) = event else { break };
                let event = match event {
                    Ok(event) => event,
                    Err(err) => {
                        tracing::warn!(error = %err, "watcher event error");
                        continue;
                    }
                };
                if !is_relevant_event_kind(&event.kind) {
                    continue;
                }

                for path in event.paths {
                    if path.is_dir() && path.starts_with(&root) {
                        register_source_tree(&mut watcher, &mut watched_dirs, &path)?;
                    }
                    if is_manifest_yaml(&path, &root) {
                        tracing::debug!(path = %path.display(), "source change");
                        debounce.touch(Instant::now());
                    }
                }
            }
        }
    }

    Ok(())
}

async fn scheduler_task(
    context: Arc<DaemonContext>,
    mut job_rx: mpsc::Receiver<JobRequest>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    match context.handle(&Job::Reload, "startup").await {
        Ok(_) => tracing::info!(source = %context.source_dir().display(), "initial reconcile completed"),
        Err(err) => tracing::error!(error = %err, "initial reconcile failed"),
    }

    let period = context
        .scheduler()
        .config()
        .resync_interval()
        .max(Duration::from_millis(10));
    let mut resync = tokio::time::interval(period);
    resync.set_missed_tick_behavior(MissedTickBehavior::Skip);
    resync.tick().await;

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            maybe_job = job_rx.recv() => {
                let Some(request) = maybe_job else { break };
                let started = Instant::now();
                let outcome = context.handle(&request.job, request.source).await;
                match &outcome {
                    Ok(_) => tracing::info!(
                        job = %request.job,
                        source = request.source,
                        duration_ms = started.elapsed().as_millis() as u64,
                        "job completed",
                    ),
                    Err(err) => tracing::warn!(job = %request.job, error = %err, "job failed"),
                }
                let _ = request.respond_to.send(outcome.map_err(|e| e.to_string()));
            }
            _ = resync.tick() => {
                if let Err(err) = context.pass().await {
                    tracing::warn!(error = %err, "resync pass failed");
                }
            }
        }
    }

    context.save().await
}

async fn socket_server_task(
    context: Arc<DaemonContext>,
    job_tx: mpsc::Sender<JobRequest>,
    shutdown_tx: broadcast::Sender<()>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let socket = socket_path(&context.home);
    prepare_socket_for_bind(&socket)?;

    let listener = UnixListener::bind(&socket).map_err(|e| io_err(&socket, e))?;
    set_socket_permissions(&socket)?;
    tracing::info!(socket = %socket.display(), "listening");

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            accepted = listener.accept() => {
                let (stream, _) = accepted.map_err(|e| io_err(&socket, e))?;
                let context = context.clone();
                let job_tx = job_tx.clone();
                let shutdown_tx = shutdown_tx.clone();
                tokio::spawn(async move {
                    if let Err(err) = handle_socket_client(stream, context, job_tx, shutdown_tx).await {
                        tracing::error!(error = %err, "socket client error");
                    }
                });
            }
        }
    }

    if socket.exists() {
        let _ = fs::remove_file(&socket);
    }
    Ok(())
}

async fn handle_socket_client(
    stream: UnixStream,
    context: Arc<DaemonContext>,
    job_tx: mpsc::Sender<JobRequest>,
    shutdown_tx: broadcast::Sender<()>,
) -> Result<(), DaemonError> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines
        .next_line()
        .await
        .map_err(|e| io_err("daemon socket read", e))?
    {
        if line.trim().is_empty() {
            continue;
        }

        let request: DaemonRequest = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(err) => {
                write_response(
                    &mut writer,
                    &DaemonResponse::error(format!("invalid request JSON: {err}")),
                )
                .await?;
                continue;
            }
        };

        let stopping = request.cmd == "stop";
        let response = dispatch(&context, request, &job_tx, &shutdown_tx).await;
        write_response(&mut writer, &response).await?;
        if stopping {
            break;
        }
    }

    Ok(())
}

async fn dispatch(
    context: &DaemonContext,
    request: DaemonRequest,
    job_tx: &mpsc::Sender<JobRequest>,
    shutdown_tx: &broadcast::Sender<()>,
) -> DaemonResponse {
    let job = match request.cmd.as_str() {
        "status" => return DaemonResponse::ok(context.status_payload().await),
        "stop" => {
            let _ = shutdown_tx.send(());
            return DaemonResponse::ok(json!({ "stopping": true }));
        }
        "sync" => match request.unit {
            Some(unit) => Job::Sync(UnitId::from(unit)),
            None => Job::Reload,
        },
        "delete" => match request.unit {
            Some(unit) => Job::Delete {
                unit: UnitId::from(unit),
                force: request.force,
            },
            None => return DaemonResponse::error("delete requires a 'unit'"),
        },
        other => return DaemonResponse::error(format!("unknown command '{other}'")),
    };

    match enqueue(job_tx, job, "socket").await {
        Ok(data) => DaemonResponse::ok(data),
        Err(err) => DaemonResponse::error(err.to_string()),
    }
}

async fn enqueue(
    job_tx: &mpsc::Sender<JobRequest>,
    job: Job,
    source: &'static str,
) -> Result<Value, DaemonError> {
    let (tx, rx) = oneshot::channel();
    job_tx
        .send(JobRequest {
            job,
            source,
            respond_to: tx,
        })
        .await
        .map_err(|_| DaemonError::ChannelClosed("job queue"))?;

    let outcome = rx
        .await
        .map_err(|_| DaemonError::ChannelClosed("job response"))?;
    outcome.map_err(DaemonError::Protocol)
}

/// Trailing-edge debounce: fires once the source has been quiet for
/// `window`, so a multi-file checkout triggers a single reload.
#[derive(Debug)]
struct Debouncer {
    window: Duration,
    last_event: Option<Instant>,
}

impl Debouncer {
    fn new(window: Duration) -> Self {
        Self {
            window,
            last_event: None,
        }
    }

    fn touch(&mut self, now: Instant) {
        self.last_event = Some(now);
    }

    fn due(&self) -> Option<Instant> {
        self.last_event.map(|at| at + self.window)
    }

    fn take_due(&mut self, now: Instant) -> bool {
        match self.due() {
            Some(due) if due <= now => {
                self.last_event = None;
                true
            }
            _ => false,
        }
    }
}

async fn sleep_until_due(due: Option<Instant>) {
    match due {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

fn register_source_tree(
    watcher: &mut RecommendedWatcher,
    watched_dirs: &mut HashSet<PathBuf>,
    root: &Path,
) -> Result<(), DaemonError> {
    for dir in collect_dirs(root)? {
        let canonical = match fs::canonicalize(&dir) {
            Ok(path) => path,
            Err(err) if err.kind() == ErrorKind::NotFound => continue,
            Err(err) => return Err(io_err(&dir, err)),
        };
        if watched_dirs.insert(canonical.clone()) {
            watcher.watch(&canonical, RecursiveMode::NonRecursive)?;
            tracing::debug!(path = %canonical.display(), "watching source directory");
        }
    }
    Ok(())
}

fn collect_dirs(root: &Path) -> Result<Vec<PathBuf>, DaemonError> {
    let mut dirs = vec![root.to_path_buf()];
    let mut cursor = 0;
    while cursor < dirs.len() {
        let current = dirs[cursor].clone();
        cursor += 1;
        let entries = match fs::read_dir(&current) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => continue,
            Err(err) => return Err(io_err(&current, err)),
        };
        for entry in entries {
            let entry = entry.map_err(|e| io_err(&current, e))?;
            let ty = entry.file_type().map_err(|e| io_err(entry.path(), e))?;
            if ty.is_dir() {
                dirs.push(entry.path());
            }
        }
    }
    dirs.sort();
    dirs.dedup();
    Ok(dirs)
}

fn is_relevant_event_kind(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
    )
}

fn is_manifest_yaml(path: &Path, root: &Path) -> bool {
    path.starts_with(root)
        && path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("yaml") || ext.eq_ignore_ascii_case("yml"))
}

fn prepare_socket_for_bind(socket: &Path) -> Result<(), DaemonError> {
    if !socket.exists() {
        return Ok(());
    }

    match StdUnixStream::connect(socket) {
        Ok(_) => {
            return Err(DaemonError::Protocol(format!(
                "daemon socket already in use: {}",
                socket.display()
            )));
        }
        Err(err) => {
            tracing::warn!(
                socket = %socket.display(),
                error = %err,
                "removing stale daemon socket before bind",
            );
        }
    }

    match fs::remove_file(socket) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(io_err(socket, err)),
    }
}

fn ensure_runtime_dirs(context: &DaemonContext) -> Result<(), DaemonError> {
    for dir in [config::keel_dir_at(&context.home), context.source_dir.clone()] {
        if !dir.exists() {
            fs::create_dir_all(&dir).map_err(|e| io_err(&dir, e))?;
        }
    }
    Ok(())
}

async fn write_response(
    writer: &mut OwnedWriteHalf,
    response: &DaemonResponse,
) -> Result<(), DaemonError> {
    let payload = serde_json::to_string(response)?;
    writer
        .write_all(payload.as_bytes())
        .await
        .map_err(|e| io_err("daemon socket write", e))?;
    writer
        .write_all(b"\n")
        .await
        .map_err(|e| io_err("daemon socket write", e))?;
    writer
        .flush()
        .await
        .map_err(|e| io_err("daemon socket flush", e))?;
    Ok(())
}

fn handle_join(
    task: &str,
    result: Result<Result<(), DaemonError>, tokio::task::JoinError>,
) -> Result<(), DaemonError> {
    match result {
        Ok(inner) => inner,
        Err(err) => Err(DaemonError::Protocol(format!(
            "{task} task join failure: {err}"
        ))),
    }
}

fn unix_seconds_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// `RUST_LOG`-driven subscriber, `info` by default. Set `KEEL_LOG_FORMAT=json`
/// for one JSON object per line.
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("KEEL_LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    let _ = if json {
        fmt()
            .json()
            .with_env_filter(filter)
            .with_target(false)
            .try_init()
    } else {
        fmt().with_env_filter(filter).with_target(false).try_init()
    };
}

#[cfg(unix)]
fn set_socket_permissions(path: &Path) -> Result<(), DaemonError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600)).map_err(|e| io_err(path, e))
}

#[cfg(not(unix))]
fn set_socket_permissions(_path: &Path) -> Result<(), DaemonError> {
    Ok(())
}
