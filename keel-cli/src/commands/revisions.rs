//! `keel revisions` and `keel rollback <revision>`.

use std::str::FromStr;

use anyhow::{Context, Result};
use chrono::Local;
use clap::Args;
use tabled::{settings::Style, Table, Tabled};

use keel_core::{ErrorClass, RevisionId};
use keel_daemon::{send_request, DaemonError, DaemonRequest};

use super::{block_on, check_outcome, Failure, Workspace};

/// Arguments for `keel revisions`.
#[derive(Args, Debug)]
pub struct RevisionsArgs {
    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

#[derive(Tabled)]
struct RevisionRow {
    #[tabled(rename = "revision")]
    id: String,
    #[tabled(rename = "ingested")]
    ingested_at: String,
    #[tabled(rename = "documents")]
    documents: usize,
    #[tabled(rename = "digest")]
    digest: String,
    #[tabled(rename = "source")]
    source: String,
}

impl RevisionsArgs {
    pub fn run(self) -> Result<()> {
        let ws = Workspace::load()?;
        let store = ws.store()?;
        let revisions = store.revisions();

        if self.json {
            println!(
                "{}",
                serde_json::to_string_pretty(revisions).context("failed to serialize revisions")?
            );
            return Ok(());
        }
        if revisions.is_empty() {
            println!("No revisions yet. Run 'keel sync' first.");
            return Ok(());
        }

        let rows: Vec<RevisionRow> = revisions
            .iter()
            .rev()
            .map(|r| RevisionRow {
                id: match r.rollback_of {
                    Some(of) => format!("{} (rollback of {of})", r.id),
                    None => r.id.to_string(),
                },
                ingested_at: r
                    .ingested_at
                    .with_timezone(&Local)
                    .format("%Y-%m-%d %H:%M:%S")
                    .to_string(),
                documents: r.documents,
                digest: r.digest.chars().take(12).collect(),
                source: r.source.clone(),
            })
            .collect();
        let mut table = Table::new(rows);
        table.with(Style::rounded());
        println!("{table}");
        Ok(())
    }
}

/// `r3` or `3`.
#[derive(Debug, Clone, Copy)]
pub struct RevisionArg(pub RevisionId);

impl FromStr for RevisionArg {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let digits = s.strip_prefix('r').unwrap_or(s);
        digits
            .parse::<u64>()
            .map(|n| Self(RevisionId(n)))
            .map_err(|_| format!("invalid revision '{s}'; expected e.g. r3 or 3"))
    }
}

/// Arguments for `keel rollback`.
#[derive(Args, Debug)]
pub struct RollbackArgs {
    /// Revision to restore, e.g. `r3`.
    pub revision: RevisionArg,
}

impl RollbackArgs {
    pub fn run(self) -> Result<()> {
        let ws = Workspace::load()?;
        match send_request(ws.home(), &DaemonRequest::new("status")) {
            Err(DaemonError::DaemonNotRunning { .. }) => {}
            Ok(_) => {
                return Err(Failure::new(
                    ErrorClass::Conflict,
                    "the daemon is running and would re-ingest the source; stop it before rolling back",
                )
                .into())
            }
            Err(err) => return Err(err).context("failed to query daemon status"),
        }
        block_on(self.rollback(&ws))?
    }

    async fn rollback(self, ws: &Workspace) -> Result<()> {
        let scheduler = ws.scheduler()?;
        let revision = self.revision.0;
        let report = scheduler
            .rollback(ws.home(), revision)
            .await
            .with_context(|| format!("rollback to {revision} failed"))?;
        println!("Rolled back to {revision} as {}", report.revision);

        let pass = scheduler
            .run_until_settled(ws.config.max_passes)
            .await
            .context("reconciliation failed")?;
        ws.save(&scheduler).await?;
        println!(
            "✓ Reconciled: {} applied, {} deleted",
            pass.applied.len(),
            pass.deleted.len()
        );
        check_outcome(&scheduler, &pass).await
    }
}
