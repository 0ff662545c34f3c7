//! keel: declarative reconciliation engine CLI.
//!
//! # Usage
//!
//! ```text
//! keel init [--source <dir>] [--output <dir>] [--force]
//! keel sync [<unit>] [--dry-run]
//! keel diff [<unit>] [--exit-code]
//! keel status [--json]
//! keel delete <unit> [--force]
//! keel revisions [--json]
//! keel rollback <revision>
//! keel daemon start|stop|status
//! ```
//!
//! Failures exit with the code of their error class: 2 validation,
//! 3 template, 4 dependency cycle, 5 apply, 6 timeout, 7 conflict, 8 drift,
//! 1 for anything else.

mod commands;

use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand};

use commands::{
    daemon::DaemonCommand, delete::DeleteArgs, diff::DiffArgs, init::InitArgs,
    revisions::{RevisionsArgs, RollbackArgs},
    status::StatusArgs,
    sync::SyncArgs,
};

// ---------------------------------------------------------------------------
// CLI entry point
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(
    name = "keel",
    version,
    about = "Reconcile declarative manifests against live infrastructure",
    long_about = None,
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Write ~/.keel/config.yaml and create the source directory.
    Init(InitArgs),

    /// Ingest the source and reconcile until settled, or force-sync one unit.
    Sync(SyncArgs),

    /// Show unified diffs between desired and live state.
    Diff(DiffArgs),

    /// Show every unit's phase, sync and health status.
    Status(StatusArgs),

    /// Delete a unit and everything that depends on it.
    Delete(DeleteArgs),

    /// List ingested revisions.
    Revisions(RevisionsArgs),

    /// Re-ingest an earlier revision as a new one.
    Rollback(RollbackArgs),

    /// Run or control the background reconciler.
    Daemon {
        #[command(subcommand)]
        command: DaemonCommand,
    },
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::from(commands::error_class(&err).exit_code())
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    if !matches!(
        cli.command,
        Commands::Daemon {
            command: DaemonCommand::Start
        }
    ) {
        commands::init_tracing();
    }
    match cli.command {
        Commands::Init(args) => args.run(),
        Commands::Sync(args) => args.run(),
        Commands::Diff(args) => args.run(),
        Commands::Status(args) => args.run(),
        Commands::Delete(args) => args.run(),
        Commands::Revisions(args) => args.run(),
        Commands::Rollback(args) => args.run(),
        Commands::Daemon { command } => commands::daemon::run(command),
    }
}
