//! `keel sync [<unit>] [--dry-run]`: ingest the source and reconcile.

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use serde_json::Value;

use keel_core::{load_manifests, ErrorClass, UnitId};
use keel_daemon::{request_sync, DaemonError};
use keel_sync::{diff_units, is_current, IngestReport, PassReport};

use super::{block_on, check_outcome, Failure, Workspace};

/// Arguments for `keel sync`.
#[derive(Args, Debug)]
pub struct SyncArgs {
    /// Force-sync this unit only (clears its error gating and reapplies it).
    pub unit: Option<String>,

    /// Show what would change without applying or saving anything.
    #[arg(long, conflicts_with = "unit")]
    pub dry_run: bool,
}

impl SyncArgs {
    pub fn run(self) -> Result<()> {
        let ws = Workspace::load()?;
        if self.dry_run {
            return block_on(dry_run(&ws))?;
        }

        match request_sync(ws.home(), self.unit.clone()) {
            Ok(data) => {
                print_daemon_result(&data);
                return Ok(());
            }
            Err(DaemonError::DaemonNotRunning { .. }) => {}
            Err(err) => return Err(err).context("sync through the daemon failed"),
        }

        block_on(sync_local(&ws, self.unit))?
    }
}

async fn sync_local(ws: &Workspace, unit: Option<String>) -> Result<()> {
    let scheduler = ws.scheduler()?;
    let mut rejected: Option<ErrorClass> = None;

    match unit {
        Some(unit) => {
            let id = UnitId::from(unit);
            scheduler
                .force_sync(&id)
                .await
                .with_context(|| format!("sync failed for '{id}'"))?;
            println!("Forcing sync of '{id}'");
        }
        None => {
            let source = ws.source_dir();
            let set = load_manifests(&source)
                .with_context(|| format!("failed to load manifests from '{}'", source.display()))?;
            let current = {
                let store = scheduler.store();
                let store = store.lock().await;
                is_current(&store, &set)
            };
            if current {
                println!("Source unchanged since the last revision");
            } else {
                let report = scheduler
                    .ingest(&set, &source.display().to_string(), Some(ws.home()))
                    .await
                    .context("ingest failed")?;
                print_ingest(&report);
                rejected = report.worst_class();
            }
        }
    }

    let report = scheduler
        .run_until_settled(ws.config.max_passes)
        .await
        .context("reconciliation failed")?;
    ws.save(&scheduler).await?;
    print_pass(&report);

    check_outcome(&scheduler, &report).await?;
    if let Some(class) = rejected {
        return Err(Failure::new(class, "some manifests were rejected").into());
    }
    Ok(())
}

/// Ingest into a throwaway copy of the store and diff it against live state.
async fn dry_run(ws: &Workspace) -> Result<()> {
    let source = ws.source_dir();
    let set = load_manifests(&source)
        .with_context(|| format!("failed to load manifests from '{}'", source.display()))?;
    let scheduler = ws.scheduler()?;
    let report = scheduler
        .ingest(&set, "dry-run", None)
        .await
        .context("ingest failed")?;

    let provisioners = ws.provisioners();
    let store = scheduler.store();
    let store = store.lock().await;
    let diffs = diff_units(&store, &provisioners, None)
        .await
        .context("failed to compare desired and live state")?;

    for rejection in &report.rejected {
        println!("[dry-run] ✗ {}: {}", rejection.subject, rejection.message);
    }
    if diffs.is_empty() {
        println!("[dry-run] ✓ nothing to apply");
    }
    for diff in &diffs {
        let verb = if diff.live_missing { "create" } else { "update" };
        println!("[dry-run] ~ {} ({verb})", diff.unit);
    }
    for id in &report.removed {
        println!("[dry-run] - {id} (delete)");
    }
    Ok(())
}

fn print_ingest(report: &IngestReport) {
    println!(
        "Ingested {} ({} created, {} updated, {} unchanged)",
        report.revision,
        report.created.len(),
        report.updated.len(),
        report.unchanged
    );
    for rejection in &report.rejected {
        println!(
            "  {} {} [{}]: {}",
            "✗".red().bold(),
            rejection.subject,
            rejection.class,
            rejection.message
        );
    }
    for id in &report.out_of_sync {
        println!("  {} {id} removed from source; autoPrune disabled", "!".yellow().bold());
    }
}

fn print_pass(report: &PassReport) {
    if !report.progressed() && report.failed.is_empty() {
        println!("✓ Everything in sync ({} unchanged)", report.unchanged);
        return;
    }
    println!(
        "✓ Reconciled: {} applied, {} deleted, {} pruned, {} unchanged",
        report.applied.len(),
        report.deleted.len(),
        report.pruned.len(),
        report.unchanged
    );
    for id in &report.applied {
        println!("  ✎  {id}");
    }
    for id in report.deleted.iter().chain(&report.pruned) {
        println!("  ✗  {id}");
    }
}

fn print_daemon_result(data: &Value) {
    let pass: PassReport = serde_json::from_value(data["pass"].clone()).unwrap_or_default();
    if let Some(revision) = data["ingest"]["revision"].as_u64() {
        println!("Ingested r{revision} (via daemon)");
    }
    print_pass(&pass);
}
