//! Subcommand implementations and the state they share.

use std::future::Future;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use fleetsync_core::config::{default_config_path_at, load_at};
use fleetsync_core::{EngineConfig, FileRepository, SpecPayload, WorkloadId, WorkloadKind};

/// Expand to a `match` on a [`WorkloadKind`] that calls `$func::<Marker>`
/// with the marker type bound to that kind.
macro_rules! for_kind {
    ($kind:expr, $func:ident($($arg:expr),* $(,)?)) => {
        match $kind {
            ::fleetsync_core::WorkloadKind::Training => {
                $func::<::fleetsync_core::Training>($($arg),*)
            }
            ::fleetsync_core::WorkloadKind::Packaging => {
                $func::<::fleetsync_core::Packaging>($($arg),*)
            }
            ::fleetsync_core::WorkloadKind::Deployment => {
                $func::<::fleetsync_core::Deployment>($($arg),*)
            }
            ::fleetsync_core::WorkloadKind::BatchJob => {
                $func::<::fleetsync_core::BatchJob>($($arg),*)
            }
        }
    };
}

pub mod daemon;
pub mod delete;
pub mod plan;
pub mod put;
pub mod report;
pub mod show;

/// Resolved config and state directory for one invocation.
#[derive(Debug)]
pub struct Workspace {
    pub config: EngineConfig,
    pub state_dir: PathBuf,
}

impl Workspace {
    /// Load the config from `explicit` or `~/.fleetsync/config.yaml`.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let home = dirs::home_dir().context("could not determine home directory")?;
        let path = explicit
            .map(Path::to_path_buf)
            .unwrap_or_else(|| default_config_path_at(&home));
        let config =
            load_at(&path).with_context(|| format!("failed to load config {}", path.display()))?;
        let state_dir = config.state_dir_at(&home);
        Ok(Self { config, state_dir })
    }

    pub fn repository<S: SpecPayload>(&self, kind: WorkloadKind) -> FileRepository<S> {
        FileRepository::new(&self.state_dir, kind)
    }
}

/// Validate a workload id given on the command line.
pub fn parse_id(raw: &str) -> Result<WorkloadId> {
    WorkloadId::parse(raw).with_context(|| {
        format!("ids are lowercase letters, digits and '-', at most {} characters", WorkloadId::MAX_LEN)
    })
}

/// Drive one async repository or substrate call to completion.
pub fn block_on<F: Future>(future: F) -> Result<F::Output> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")?;
    Ok(runtime.block_on(future))
}
