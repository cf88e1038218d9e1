//! `fleetsync report <kind> <id> --state <state> --spec-hash <hash>`
//!
//! Status callback for a running workload. The status is stored only if the
//! spec still hashes to `--spec-hash`, the hash the run was launched with;
//! otherwise nothing is written and the process exits with status 2.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Args;

use fleetsync_core::{
    ContentHash, Repository, Workload, WorkloadId, WorkloadKind, WorkloadState, WorkloadStatus,
};
use fleetsync_sync::{OptimisticStatusUpdater, StatusUpdate};

use super::{block_on, parse_id, Workspace};

#[derive(Args, Debug)]
pub struct ReportArgs {
    pub kind: WorkloadKind,
    pub id: String,

    /// unknown | scheduling | running | succeeded | failed
    #[arg(long)]
    pub state: WorkloadState,

    /// Spec hash the reporting run was launched with.
    #[arg(long, value_name = "HASH")]
    pub spec_hash: String,

    #[arg(long)]
    pub pod_name: Option<String>,

    #[arg(long, allow_negative_numbers = true)]
    pub exit_code: Option<i32>,

    #[arg(long)]
    pub reason: Option<String>,

    #[arg(long)]
    pub message: Option<String>,
}

impl ReportArgs {
    pub fn run(self, workspace: &Workspace) -> Result<()> {
        let id = parse_id(&self.id)?;
        let snapshot: ContentHash = self
            .spec_hash
            .parse()
            .context("invalid --spec-hash")?;
        let kind = self.kind;
        let status = WorkloadStatus {
            state: self.state,
            pod_name: self.pod_name,
            exit_code: self.exit_code,
            reason: self.reason,
            message: self.message,
        };
        for_kind!(kind, report(workspace, &id, status, &snapshot))
    }
}

fn report<W: Workload>(
    workspace: &Workspace,
    id: &WorkloadId,
    status: WorkloadStatus,
    snapshot: &ContentHash,
) -> Result<()> {
    let repo: Arc<dyn Repository<W::Spec>> =
        Arc::new(workspace.repository::<W::Spec>(W::KIND));
    let updater = OptimisticStatusUpdater::new(repo);
    let state = status.state;

    let outcome = block_on(updater.update_status(id, status, snapshot))?
        .with_context(|| format!("status for {} '{}' was not stored", W::KIND, id))?;
    match outcome {
        StatusUpdate::Applied => println!("✓ {} '{}' is now {}", W::KIND, id, state),
        StatusUpdate::Unchanged => println!("{} '{}' already {}", W::KIND, id, state),
    }
    Ok(())
}
