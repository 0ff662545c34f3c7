//! `keel init [--source <dir>] [--output <dir>] [--force]`

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Args;

use keel_core::{config, EngineConfig};

/// Write the engine config and create its directories.
#[derive(Args, Debug)]
pub struct InitArgs {
    /// Directory holding the manifests (default: ~/.keel/manifests).
    #[arg(long, short = 's')]
    pub source: Option<PathBuf>,

    /// Directory the file provisioner writes live objects into
    /// (default: ~/.keel/live).
    #[arg(long, short = 'o')]
    pub output: Option<PathBuf>,

    /// Overwrite an existing config.
    #[arg(long)]
    pub force: bool,
}

impl InitArgs {
    pub fn run(self) -> Result<()> {
        let home = dirs::home_dir().context("could not determine home directory")?;
        let path = config::config_path_at(&home);
        if path.exists() && !self.force {
            println!("keel is already initialised: {}", path.display());
            println!("  Use --force to overwrite it.");
            return Ok(());
        }

        let mut cfg = EngineConfig::default();
        if let Some(source) = self.source.as_deref() {
            cfg.source_dir = absolute_dir(source)?;
        }
        if let Some(output) = self.output.as_deref() {
            cfg.output_dir = absolute_dir(output)?;
        }

        let source_dir = keel_daemon::paths::source_dir_at(&home, &cfg);
        fs::create_dir_all(&source_dir)
            .with_context(|| format!("cannot create source directory '{}'", source_dir.display()))?;
        let saved = config::save_at(&home, &cfg).context("failed to write config")?;

        println!("✓ Initialised keel");
        println!("  Config:  {}", saved.display());
        println!("  Source:  {}", source_dir.display());
        println!(
            "  Output:  {}",
            keel_daemon::paths::output_dir_at(&home, &cfg).display()
        );
        Ok(())
    }
}

/// Create `dir` if needed and return its canonical path.
fn absolute_dir(dir: &Path) -> Result<PathBuf> {
    fs::create_dir_all(dir).with_context(|| format!("cannot create '{}'", dir.display()))?;
    dir.canonicalize()
        .with_context(|| format!("cannot resolve path '{}'", dir.display()))
}
