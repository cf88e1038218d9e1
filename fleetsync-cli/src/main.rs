//! fleetsync — reconcile stored ML workload intent with a local substrate.
//!
//! # Usage
//!
//! ```text
//! fleetsync [--config <path>] daemon start
//! fleetsync put <kind> <file>
//! fleetsync delete <kind> <id>
//! fleetsync show <kind> <id> [--json]
//! fleetsync plan [--kind <kind>] [--json]
//! fleetsync report <kind> <id> --state <state> --spec-hash <hash> [...]
//! ```
//!
//! `report` exits with status 2 when the stored spec changed since the
//! reported run was launched.

mod commands;

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand};

use commands::{
    daemon::DaemonCommand, delete::DeleteArgs, plan::PlanArgs, put::PutArgs, report::ReportArgs,
    show::ShowArgs, Workspace,
};
use fleetsync_core::StoreError;

// ---------------------------------------------------------------------------
// CLI entry point
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(
    name = "fleetsync",
    version,
    about = "Keep stored ML workloads and their running resources in sync",
    long_about = None,
)]
struct Cli {
    /// Config file; defaults to ~/.fleetsync/config.yaml.
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the reconciliation daemon.
    Daemon {
        #[command(subcommand)]
        command: DaemonCommand,
    },

    /// Create or replace a stored workload from a YAML document.
    Put(PutArgs),

    /// Mark a stored workload for deletion.
    Delete(DeleteArgs),

    /// Print a stored workload and its running resource.
    Show(ShowArgs),

    /// Show what the next sweep would do, without acting.
    Plan(PlanArgs),

    /// Report a workload status through the optimistic updater.
    Report(ReportArgs),
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

/// Exit status for a status report discarded because the spec changed.
const EXIT_SPEC_WAS_TOUCHED: u8 = 2;

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {err:?}");
            if is_spec_was_touched(&err) {
                ExitCode::from(EXIT_SPEC_WAS_TOUCHED)
            } else {
                ExitCode::FAILURE
            }
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let workspace = Workspace::load(cli.config.as_deref())?;
    match cli.command {
        Commands::Daemon { command } => commands::daemon::run(command, workspace),
        Commands::Put(args) => args.run(&workspace),
        Commands::Delete(args) => args.run(&workspace),
        Commands::Show(args) => args.run(&workspace),
        Commands::Plan(args) => args.run(&workspace),
        Commands::Report(args) => args.run(&workspace),
    }
}

fn is_spec_was_touched(err: &anyhow::Error) -> bool {
    err.downcast_ref::<StoreError>()
        .is_some_and(StoreError::is_spec_was_touched)
}
