//! `fleetsync delete <kind> <id>`

use anyhow::{Context, Result};
use clap::Args;

use fleetsync_core::{Repository, Workload, WorkloadId, WorkloadKind};

use super::{block_on, parse_id, Workspace};

/// Mark a stored workload for deletion. The record stays; the next sweep
/// removes its running resource.
#[derive(Args, Debug)]
pub struct DeleteArgs {
    pub kind: WorkloadKind,
    pub id: String,
}

impl DeleteArgs {
    pub fn run(self, workspace: &Workspace) -> Result<()> {
        let id = parse_id(&self.id)?;
        for_kind!(self.kind, mark(workspace, &id))
    }
}

fn mark<W: Workload>(workspace: &Workspace, id: &WorkloadId) -> Result<()> {
    let repo = workspace.repository::<W::Spec>(W::KIND);
    block_on(repo.set_deletion_mark(id, true))?
        .with_context(|| format!("failed to mark {} '{}' for deletion", W::KIND, id))?;
    println!("✓ Marked {} '{}' for deletion", W::KIND, id);
    Ok(())
}
