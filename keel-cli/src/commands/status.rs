//! `keel status`: unit phases, sync and health.

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use serde::Serialize;
use tabled::{settings::Style, Table, Tabled};

use keel_core::{ObservedStatus, RevisionId, SyncStatus, UnitPhase, UnitStatus};

use super::Workspace;

/// Arguments for `keel status`.
#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

impl StatusArgs {
    pub fn run(self) -> Result<()> {
        let ws = Workspace::load()?;
        let store = ws.store()?;
        let report = StatusReport {
            revision: store.latest_revision().map(|r| r.id),
            units: store
                .units()
                .chain(store.tombstones())
                .map(|u| u.status())
                .collect(),
        };

        if self.json {
            println!(
                "{}",
                serde_json::to_string_pretty(&report).context("failed to serialize status JSON")?
            );
            return Ok(());
        }
        print_table(report);
        Ok(())
    }
}

#[derive(Serialize)]
struct StatusReport {
    revision: Option<RevisionId>,
    units: Vec<UnitStatus>,
}

#[derive(Tabled)]
struct StatusTableRow {
    #[tabled(rename = "unit")]
    unit: String,
    #[tabled(rename = "wave")]
    wave: i64,
    #[tabled(rename = "phase")]
    phase: String,
    #[tabled(rename = "sync")]
    sync: String,
    #[tabled(rename = "health")]
    health: String,
    #[tabled(rename = "message")]
    message: String,
}

fn print_table(report: StatusReport) {
    let out_of_sync = report
        .units
        .iter()
        .filter(|u| u.sync_status != SyncStatus::Synced && u.phase != UnitPhase::Deleted)
        .count();
    println!(
        "keel v{} | revision {} | {} units | {} out of sync",
        env!("CARGO_PKG_VERSION"),
        report
            .revision
            .map_or_else(|| "none".to_string(), |r| r.to_string()),
        report.units.len(),
        out_of_sync,
    );

    if report.units.is_empty() {
        println!("No units. Add manifests and run 'keel sync'.");
        return;
    }

    let rows: Vec<StatusTableRow> = report
        .units
        .into_iter()
        .map(|u| StatusTableRow {
            unit: u.id.to_string(),
            wave: u.wave,
            phase: phase_label(u.phase),
            sync: sync_label(u.sync_status),
            health: health_label(u.observed_status),
            message: truncate(&u.message, 60),
        })
        .collect();
    let mut table = Table::new(rows);
    table.with(Style::rounded());
    println!("{table}");

    if out_of_sync > 0 {
        println!("Run 'keel sync' to reconcile.");
    }
}

fn phase_label(phase: UnitPhase) -> String {
    let label = phase.to_string();
    match phase {
        UnitPhase::Healthy => label.green().to_string(),
        UnitPhase::Pending | UnitPhase::Applying | UnitPhase::Deleting => label.yellow().to_string(),
        UnitPhase::Degraded | UnitPhase::Error => label.red().bold().to_string(),
        UnitPhase::Deleted => label.bright_black().to_string(),
    }
}

fn sync_label(status: SyncStatus) -> String {
    let label = status.to_string();
    match status {
        SyncStatus::Synced => label.green().to_string(),
        SyncStatus::Syncing | SyncStatus::OutOfSync => label.yellow().to_string(),
        SyncStatus::Error => label.red().to_string(),
    }
}

fn health_label(status: ObservedStatus) -> String {
    let label = status.to_string();
    match status {
        ObservedStatus::Healthy => label.green().to_string(),
        ObservedStatus::Progressing | ObservedStatus::Unknown => label.bright_black().to_string(),
        ObservedStatus::Degraded | ObservedStatus::Missing => label.red().to_string(),
    }
}

fn truncate(message: &str, max: usize) -> String {
    if message.chars().count() <= max {
        return message.to_string();
    }
    let mut short: String = message.chars().take(max.saturating_sub(1)).collect();
    short.push('…');
    short
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn long_messages_are_shortened() {
        assert_eq!(truncate("short", 10), "short");
        let long = "x".repeat(80);
        let shown = truncate(&long, 60);
        assert_eq!(shown.chars().count(), 60);
        assert!(shown.ends_with('…'));
    }
}
