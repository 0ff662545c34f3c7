//! Subcommands and the plumbing they share: home/config lookup, a
//! file-backed scheduler, outcome checks and exit-code classification.

pub mod daemon;
pub mod delete;
pub mod diff;
pub mod init;
pub mod revisions;
pub mod status;
pub mod sync;

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use keel_core::{config, EngineConfig, ErrorClass, ManifestError, ResourceStore, StoreError, UnitPhase};
use keel_daemon::paths::{output_dir_at, source_dir_at};
use keel_daemon::DaemonError;
use keel_sync::{AdapterError, FileProvisioner, PassReport, ProvisionerRegistry, Scheduler, SyncError};
use thiserror::Error;

/// A CLI-level failure carrying the class its exit code comes from.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct Failure {
    pub class: ErrorClass,
    pub message: String,
}

impl Failure {
    pub fn new(class: ErrorClass, message: impl Into<String>) -> Self {
        Self {
            class,
            message: message.into(),
        }
    }
}

/// Class of the first classified error in the chain.
pub fn error_class(err: &anyhow::Error) -> ErrorClass {
    for cause in err.chain() {
        if let Some(e) = cause.downcast_ref::<Failure>() {
            return e.class;
        }
        if let Some(e) = cause.downcast_ref::<SyncError>() {
            return e.class();
        }
        if let Some(e) = cause.downcast_ref::<StoreError>() {
            return e.class();
        }
        if let Some(e) = cause.downcast_ref::<ManifestError>() {
            return e.class();
        }
        if let Some(e) = cause.downcast_ref::<AdapterError>() {
            return e.class();
        }
        if let Some(e) = cause.downcast_ref::<DaemonError>() {
            return e.class();
        }
    }
    ErrorClass::Internal
}

/// Logs go to stderr so `--json` output stays parseable.
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

pub fn block_on<F: Future>(future: F) -> Result<F::Output> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start the async runtime")?;
    Ok(runtime.block_on(future))
}

// ---------------------------------------------------------------------------
// Workspace
// ---------------------------------------------------------------------------

/// `~/.keel` as seen by one CLI invocation.
pub struct Workspace {
    pub home: PathBuf,
    pub config: EngineConfig,
}

impl Workspace {
    pub fn load() -> Result<Self> {
        let home = dirs::home_dir().context("could not determine home directory")?;
        let config = config::load_at(&home).context("failed to load ~/.keel/config.yaml")?;
        Ok(Self { home, config })
    }

    pub fn source_dir(&self) -> PathBuf {
        source_dir_at(&self.home, &self.config)
    }

    pub fn output_dir(&self) -> PathBuf {
        output_dir_at(&self.home, &self.config)
    }

    pub fn store(&self) -> Result<ResourceStore> {
        ResourceStore::load_at(&self.home).context("failed to load the resource store")
    }

    pub fn provisioners(&self) -> ProvisionerRegistry {
        ProvisionerRegistry::with_default(Arc::new(FileProvisioner::new(self.output_dir())))
    }

    /// Scheduler over the persisted store, applying through the file provisioner.
    pub fn scheduler(&self) -> Result<Scheduler> {
        Ok(Scheduler::new(self.store()?, self.provisioners(), self.config.clone()))
    }

    pub async fn save(&self, scheduler: &Scheduler) -> Result<()> {
        let store = scheduler.store();
        let store = store.lock().await;
        store
            .save_at(&self.home)
            .context("failed to save the resource store")?;
        Ok(())
    }

    pub fn home(&self) -> &Path {
        &self.home
    }
}

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

/// Turn what a settle left behind into a classified failure, if anything
/// ended up broken.
pub async fn check_outcome(scheduler: &Scheduler, report: &PassReport) -> Result<()> {
    if let Some(cycle) = report.cycle_errors.first() {
        let members: Vec<String> = cycle.iter().map(ToString::to_string).collect();
        return Err(Failure::new(
            ErrorClass::DependencyCycle,
            format!("dependency cycle among {}", members.join(" -> ")),
        )
        .into());
    }

    let store = scheduler.store();
    let store = store.lock().await;
    let mut broken = Vec::new();
    let mut worst: Option<ErrorClass> = None;
    for unit in store.units() {
        let stuck = unit.deletion.as_ref().is_some_and(|d| d.stuck);
        if !stuck && !matches!(unit.phase, UnitPhase::Error | UnitPhase::Degraded) {
            continue;
        }
        let class = unit_failure_class(unit);
        if worst.map_or(true, |w| class.exit_code() > w.exit_code()) {
            worst = Some(class);
        }
        broken.push(format!("{} ({})", unit.id, unit.message));
    }

    match worst {
        Some(class) => Err(Failure::new(
            class,
            format!("{} unit(s) did not converge: {}", broken.len(), broken.join("; ")),
        )
        .into()),
        None => Ok(()),
    }
}

fn unit_failure_class(unit: &keel_core::ReconcilableUnit) -> ErrorClass {
    unit.fatal
        .as_ref()
        .map(|fatal| fatal.class)
        .or(unit.last_error)
        .unwrap_or(ErrorClass::Apply)
}
