//! `fleetsync plan [--kind <kind>] [--json]` — dry-run of the next sweep.

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use serde::Serialize;
use tabled::{settings::Style, Table, Tabled};

use fleetsync_core::WorkloadKind;
use fleetsync_daemon::reconciler_for;
use fleetsync_sync::SyncPlan;

use super::{block_on, Workspace};

/// Arguments for `fleetsync plan`.
#[derive(Args, Debug)]
pub struct PlanArgs {
    /// Only plan this kind; every kind otherwise.
    #[arg(long)]
    pub kind: Option<WorkloadKind>,

    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Serialize)]
struct KindPlan {
    kind: WorkloadKind,
    #[serde(flatten)]
    plan: SyncPlan,
}

#[derive(Tabled)]
struct PlanTableRow {
    #[tabled(rename = "kind")]
    kind: String,
    #[tabled(rename = "create")]
    create: usize,
    #[tabled(rename = "update")]
    update: usize,
    #[tabled(rename = "delete")]
    delete: usize,
    #[tabled(rename = "unchanged")]
    unchanged: usize,
    #[tabled(rename = "skipped")]
    skipped: usize,
}

impl PlanArgs {
    pub fn run(self, workspace: &Workspace) -> Result<()> {
        let kinds: Vec<WorkloadKind> = match self.kind {
            Some(kind) => vec![kind],
            None => WorkloadKind::all().to_vec(),
        };

        let plans = block_on(collect(workspace, &kinds))??;
        if self.json {
            println!(
                "{}",
                serde_json::to_string_pretty(&plans).context("failed to render plan JSON")?
            );
            return Ok(());
        }
        print_plans(&plans);
        Ok(())
    }
}

async fn collect(workspace: &Workspace, kinds: &[WorkloadKind]) -> Result<Vec<KindPlan>> {
    let interval = workspace.config.sweep_interval();
    let mut plans = Vec::with_capacity(kinds.len());
    for &kind in kinds {
        let plan = reconciler_for(kind, &workspace.state_dir, interval)
            .plan()
            .await
            .with_context(|| format!("failed to plan {kind}"))?;
        plans.push(KindPlan { kind, plan });
    }
    Ok(plans)
}

fn print_plans(plans: &[KindPlan]) {
    let rows: Vec<PlanTableRow> = plans
        .iter()
        .map(|p| PlanTableRow {
            kind: p.kind.to_string(),
            create: p.plan.create.len(),
            update: p.plan.update.len(),
            delete: p.plan.delete.len(),
            unchanged: p.plan.unchanged.len(),
            skipped: p.plan.skipped.len(),
        })
        .collect();

    let mut table = Table::new(rows);
    table.with(Style::rounded());
    println!("{table}");

    for KindPlan { kind, plan } in plans {
        for id in &plan.create {
            println!("  {} {kind}/{id}", "+".green());
        }
        for id in &plan.update {
            println!("  {} {kind}/{id}", "~".yellow());
        }
        for id in &plan.delete {
            println!("  {} {kind}/{id}", "-".red());
        }
        for skipped in &plan.skipped {
            println!("  {} {kind}/{} ({})", "!".magenta(), skipped.id, skipped.reason);
        }
    }

    if plans.iter().all(|p| p.plan.is_noop()) {
        println!("{}", "Nothing to do.".green());
    }
}
