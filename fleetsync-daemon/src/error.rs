use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Error surface for the worker supervisor, leadership gating, and runtime.
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("config error: {0}")]
    Config(#[from] fleetsync_core::ConfigError),

    #[error("sync error: {0}")]
    Sync(#[from] fleetsync_sync::SyncError),

    #[error("worker {worker} panicked: {reason}")]
    WorkerPanicked { worker: String, reason: String },

    /// Aggregate returned by the supervisor after the first failing runner
    /// brought the rest down.
    #[error("one or more runners returned an error (first: {worker}): {source}")]
    RunnersFailed {
        worker: String,
        #[source]
        source: Box<DaemonError>,
    },

    #[error("shutdown timed out after {timeout:?} with {still_running} runner(s) still running")]
    ShutdownTimeout {
        timeout: Duration,
        still_running: usize,
    },

    #[error("leader election lost")]
    LeadershipLost,

    #[error("{task} task join failure: {reason}")]
    Join { task: String, reason: String },
}

pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> DaemonError {
    DaemonError::Io {
        path: path.into(),
        source,
    }
}
