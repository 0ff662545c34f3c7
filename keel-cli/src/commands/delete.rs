//! `keel delete <unit> [--force]`

use anyhow::{Context, Result};
use clap::Args;
use serde_json::Value;

use keel_core::UnitId;
use keel_daemon::{request_delete, DaemonError};

use super::{block_on, check_outcome, Workspace};

/// Arguments for `keel delete`.
#[derive(Args, Debug)]
pub struct DeleteArgs {
    /// Unit id, e.g. `claim/team-a/db` or `app/web`.
    pub unit: String,

    /// Bypass the finalizer: forget the units without deleting the external
    /// objects.
    #[arg(long)]
    pub force: bool,
}

impl DeleteArgs {
    pub fn run(self) -> Result<()> {
        let ws = Workspace::load()?;

        match request_delete(ws.home(), self.unit.clone(), self.force) {
            Ok(data) => {
                print_deleting(&data["deleting"]);
                return Ok(());
            }
            Err(DaemonError::DaemonNotRunning { .. }) => {}
            Err(err) => return Err(err).context("delete through the daemon failed"),
        }

        block_on(self.delete_local(&ws))?
    }

    async fn delete_local(self, ws: &Workspace) -> Result<()> {
        let scheduler = ws.scheduler()?;
        let id = UnitId::from(self.unit);
        let ids = if self.force {
            scheduler.force_delete(&id).await
        } else {
            scheduler.request_delete(&id, false).await
        }
        .with_context(|| format!("delete failed for '{id}'"))?;

        let report = scheduler
            .run_until_settled(ws.config.max_passes)
            .await
            .context("reconciliation failed")?;
        ws.save(&scheduler).await?;

        print_deleting(&serde_json::json!(ids));
        for gone in &report.deleted {
            println!("  ✗  {gone}");
        }
        check_outcome(&scheduler, &report).await
    }
}

fn print_deleting(ids: &Value) {
    let ids: Vec<&str> = ids
        .as_array()
        .map(|a| a.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default();
    println!("Deleting {} unit(s): {}", ids.len(), ids.join(", "));
}
