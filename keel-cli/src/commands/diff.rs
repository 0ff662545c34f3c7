//! `keel diff [<unit>]`: desired (as the source would make it) vs. live.

use anyhow::{Context, Result};
use clap::Args;

use keel_core::{load_manifests, ErrorClass, UnitId};
use keel_sync::diff_units;

use super::{block_on, Failure, Workspace};

/// Arguments for `keel diff`.
#[derive(Args, Debug)]
pub struct DiffArgs {
    /// Limit the diff to one unit.
    pub unit: Option<String>,

    /// Exit with the drift code (8) when anything differs.
    #[arg(long)]
    pub exit_code: bool,
}

impl DiffArgs {
    pub fn run(self) -> Result<()> {
        let ws = Workspace::load()?;
        block_on(self.diff(&ws))?
    }

    async fn diff(self, ws: &Workspace) -> Result<()> {
        let source = ws.source_dir();
        let set = load_manifests(&source)
            .with_context(|| format!("failed to load manifests from '{}'", source.display()))?;

        // Ingested into an unsaved copy: nothing is recorded or applied.
        let scheduler = ws.scheduler()?;
        scheduler
            .ingest(&set, "diff", None)
            .await
            .context("ingest failed")?;

        let filter = self.unit.map(UnitId::from);
        let provisioners = ws.provisioners();
        let store = scheduler.store();
        let store = store.lock().await;
        let diffs = diff_units(&store, &provisioners, filter.as_ref())
            .await
            .context("diff failed")?;

        if diffs.is_empty() {
            println!("No differences.");
            return Ok(());
        }

        for diff in &diffs {
            print!("{}", diff.unified_diff);
            if !diff.unified_diff.ends_with('\n') {
                println!();
            }
        }

        if self.exit_code {
            return Err(Failure::new(
                ErrorClass::Drift,
                format!("{} unit(s) differ from live state", diffs.len()),
            )
            .into());
        }
        Ok(())
    }
}
