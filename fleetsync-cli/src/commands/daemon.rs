//! `fleetsync daemon` — run the reconcilers in the foreground.

use anyhow::{Context, Result};
use clap::Subcommand;

use fleetsync_daemon::start_blocking;

use super::Workspace;

#[derive(Subcommand, Debug)]
pub enum DaemonCommand {
    /// Run every enabled reconciler until ctrl-c.
    Start,
}

pub fn run(command: DaemonCommand, workspace: Workspace) -> Result<()> {
    match command {
        DaemonCommand::Start => {
            start_blocking(workspace.config, &workspace.state_dir)
                .context("daemon exited with error")?;
        }
    }
    Ok(())
}
