//! `fleetsync put <kind> <file>`
//!
//! The file is a YAML document naming the workload and its spec:
//!
//! ```yaml
//! id: wine-train
//! spec:
//!   model: { name: wine, version: "1.0" }
//!   toolchain: mlflow
//!   entrypoint: main
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Args;
use serde::Deserialize;

use fleetsync_core::{content_hash, put_spec, SpecPayload, Workload, WorkloadKind};

use super::{block_on, parse_id, Workspace};

/// Create or replace a stored workload.
#[derive(Args, Debug)]
pub struct PutArgs {
    /// training | packaging | deployment | batch_job
    pub kind: WorkloadKind,

    /// YAML document with `id` and `spec`.
    pub file: PathBuf,
}

#[derive(Debug, Deserialize)]
#[serde(bound = "S: SpecPayload")]
struct SpecDocument<S> {
    id: String,
    spec: S,
}

impl PutArgs {
    pub fn run(self, workspace: &Workspace) -> Result<()> {
        for_kind!(self.kind, put(workspace, &self.file))
    }
}

fn put<W: Workload>(workspace: &Workspace, file: &Path) -> Result<()> {
    let contents =
        fs::read_to_string(file).with_context(|| format!("cannot read {}", file.display()))?;
    let document: SpecDocument<W::Spec> = serde_yaml::from_str(&contents)
        .with_context(|| format!("{} is not a valid {} document", file.display(), W::KIND))?;
    let id = parse_id(&document.id)?;
    let hash = content_hash(&document.spec).context("cannot hash spec")?;

    let repo = workspace.repository::<W::Spec>(W::KIND);
    let record = block_on(put_spec(&repo, id, document.spec))?
        .with_context(|| format!("failed to store {} '{}'", W::KIND, document.id))?;

    println!("✓ Stored {} '{}'", W::KIND, record.id);
    println!("  spec hash: {hash}");
    Ok(())
}
