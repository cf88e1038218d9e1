//! `fleetsync show <kind> <id> [--json]`

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use serde::Serialize;

use fleetsync_core::file_store::load_record_at;
use fleetsync_core::{
    content_hash, ContentHash, ExternalResource, SpecPayload, Workload, WorkloadId, WorkloadKind,
    WorkloadRecord, WorkloadState,
};
use fleetsync_daemon::substrate::load_resource_at;
use fleetsync_sync::ClientError;

use super::{parse_id, Workspace};

/// Print a stored workload next to its running resource.
#[derive(Args, Debug)]
pub struct ShowArgs {
    pub kind: WorkloadKind,
    pub id: String,

    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

impl ShowArgs {
    pub fn run(self, workspace: &Workspace) -> Result<()> {
        let id = parse_id(&self.id)?;
        for_kind!(self.kind, show(workspace, &id, self.json))
    }
}

#[derive(Serialize)]
#[serde(bound = "S: SpecPayload")]
struct ShowJson<'a, S> {
    kind: WorkloadKind,
    spec_hash: &'a ContentHash,
    record: &'a WorkloadRecord<S>,
    /// Spec hash of the running resource, when there is one.
    resource_spec_hash: Option<ContentHash>,
    resource: Option<&'a ExternalResource<S>>,
}

fn show<W: Workload>(workspace: &Workspace, id: &WorkloadId, json: bool) -> Result<()> {
    let record: WorkloadRecord<W::Spec> = load_record_at(&workspace.state_dir, W::KIND, id)
        .with_context(|| format!("failed to load {} '{}'", W::KIND, id))?;
    let resource = match load_resource_at::<W::Spec>(&workspace.state_dir, W::KIND, id) {
        Ok(resource) => Some(resource),
        Err(ClientError::NotFound { .. }) => None,
        Err(err) => {
            return Err(err).with_context(|| format!("failed to load resource for '{id}'"))
        }
    };

    let spec_hash = content_hash(&record.spec).context("cannot hash stored spec")?;
    let resource_spec_hash = resource
        .as_ref()
        .map(|r| content_hash(&r.spec))
        .transpose()
        .context("cannot hash resource spec")?;

    if json {
        let payload = ShowJson {
            kind: W::KIND,
            spec_hash: &spec_hash,
            record: &record,
            resource_spec_hash,
            resource: resource.as_ref(),
        };
        println!(
            "{}",
            serde_json::to_string_pretty(&payload).context("failed to render show JSON")?
        );
        return Ok(());
    }

    println!("{} {}/{}", "workload".bold(), W::KIND, record.id);
    println!("  status:     {}", colorize_state(record.status.state));
    println!("  spec hash:  {spec_hash}");
    println!("  created:    {}", record.created_at.to_rfc3339());
    println!("  updated:    {}", record.updated_at.to_rfc3339());
    if record.deletion_mark {
        println!("  {}", "marked for deletion".red());
    }

    match (&resource, &resource_spec_hash) {
        (Some(resource), Some(hash)) => {
            let drift = if *hash == spec_hash {
                "in sync".green()
            } else {
                "spec differs, next sweep updates it".yellow()
            };
            println!("{} {}", "resource".bold(), drift);
            println!("  state:      {}", colorize_state(resource.status.state));
            if let Some(pod) = &resource.status.pod_name {
                println!("  pod:        {pod}");
            }
            if let Some(code) = resource.status.exit_code {
                println!("  exit code:  {code}");
            }
            if let Some(reason) = &resource.status.reason {
                println!("  reason:     {reason}");
            }
        }
        _ => println!("{} {}", "resource".bold(), "not launched".dimmed()),
    }

    let spec = serde_yaml::to_string(&record.spec).context("failed to render spec")?;
    println!("{}", "spec".bold());
    for line in spec.lines() {
        println!("  {line}");
    }
    Ok(())
}

fn colorize_state(state: WorkloadState) -> colored::ColoredString {
    let label = state.to_string();
    let label = label.as_str();
    match state {
        WorkloadState::Succeeded => label.green(),
        WorkloadState::Failed => label.red(),
        WorkloadState::Running | WorkloadState::Scheduling => label.cyan(),
        WorkloadState::Unknown => label.dimmed(),
    }
}
