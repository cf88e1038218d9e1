use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use fleetsync_core::{
    BatchJob, Deployment, EngineConfig, FileRepository, Packaging, Training, Workload,
    WorkloadKind,
};
use fleetsync_sync::{KindAdapter, Reconciler};

use crate::error::{io_err, DaemonError};
use crate::leadership::{run_with_leadership, standalone};
use crate::paths::{runtime_root, storage_root};
use crate::substrate::LocalSubstrate;
use crate::supervisor::{Runnable, Supervisor, WorkerSet};

/// Start the daemon runtime and block the current thread until it exits.
pub fn start_blocking(config: EngineConfig, state_dir: &Path) -> Result<(), DaemonError> {
    init_tracing();
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| io_err("tokio-runtime", e))?;
    runtime.block_on(run(config, state_dir.to_path_buf()))
}

/// Run reconcilers for every enabled kind until ctrl-c.
pub async fn run(config: EngineConfig, state_dir: PathBuf) -> Result<(), DaemonError> {
    config.validate()?;
    ensure_runtime_dirs(&state_dir)?;

    let stop = CancellationToken::new();
    let signal_handle = {
        let stop = stop.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = stop.cancelled() => Ok(()),
                signal = tokio::signal::ctrl_c() => match signal {
                    Ok(()) => {
                        tracing::info!("received ctrl-c, shutting down daemon");
                        stop.cancel();
                        Ok(())
                    }
                    Err(err) => Err(io_err("ctrl-c handler", err)),
                }
            }
        })
    };

    let workers = build_workers(&config, &state_dir);
    let result = if workers.is_empty() {
        tracing::info!(
            state_dir = %state_dir.display(),
            "workers disabled, waiting for shutdown"
        );
        stop.cancelled().await;
        Ok(())
    } else {
        tracing::info!(
            state_dir = %state_dir.display(),
            workers = ?workers.names(),
            sweep_interval_secs = config.sweep_interval_secs,
            "daemon starting"
        );
        let supervisor = Arc::new(
            Supervisor::new(workers).with_poll_interval(config.shutdown_poll_interval()),
        );
        // Single instance: leadership is held for the life of the process.
        let (_leader, leader_rx) = standalone();
        run_with_leadership(leader_rx, supervisor, config.shutdown_timeout(), stop.clone()).await
    };

    stop.cancel();
    handle_join("signal_handler", signal_handle.await)?;
    result
}

/// One reconciler per enabled kind, over the file repository and the local
/// substrate rooted at `state_dir`.
pub fn build_workers(config: &EngineConfig, state_dir: &Path) -> WorkerSet {
    let interval = config.sweep_interval();
    WorkerSet::from_config(config, |kind| -> Arc<dyn Runnable> {
        Arc::new(reconciler_for(kind, state_dir, interval))
    })
}

/// Reconciler for `kind` over the local backends under `state_dir`. The
/// substrate watch is only registered once the reconciler runs.
pub fn reconciler_for(kind: WorkloadKind, state_dir: &Path, interval: Duration) -> Reconciler {
    match kind {
        WorkloadKind::Training => reconciler::<Training>(state_dir, interval),
        WorkloadKind::Packaging => reconciler::<Packaging>(state_dir, interval),
        WorkloadKind::Deployment => reconciler::<Deployment>(state_dir, interval),
        WorkloadKind::BatchJob => reconciler::<BatchJob>(state_dir, interval),
    }
}

fn reconciler<W: Workload>(state_dir: &Path, interval: Duration) -> Reconciler {
    let repo = Arc::new(FileRepository::<W::Spec>::new(state_dir, W::KIND));
    let substrate = Arc::new(LocalSubstrate::<W::Spec>::new(state_dir, W::KIND));
    let adapter = Arc::new(KindAdapter::<W>::new(repo, substrate));
    Reconciler::new(adapter, interval)
}

fn ensure_runtime_dirs(state_dir: &Path) -> Result<(), DaemonError> {
    for dir in [storage_root(state_dir), runtime_root(state_dir)] {
        if !dir.exists() {
            fs::create_dir_all(&dir).map_err(|e| io_err(&dir, e))?;
        }
    }
    Ok(())
}

fn handle_join(
    task: &str,
    result: Result<Result<(), DaemonError>, tokio::task::JoinError>,
) -> Result<(), DaemonError> {
    match result {
        Ok(inner) => inner,
        Err(err) => Err(DaemonError::Join {
            task: task.to_string(),
            reason: err.to_string(),
        }),
    }
}

/// `RUST_LOG` filters (default `info`); `FLEETSYNC_LOG_FORMAT=json` switches
/// to JSON lines.
fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("FLEETSYNC_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    if json {
        let _ = fmt().json().with_env_filter(filter).try_init();
    } else {
        let _ = fmt().with_env_filter(filter).with_target(false).try_init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn build_workers_names_one_worker_per_enabled_kind() {
        let dir = TempDir::new().unwrap();
        let mut config = EngineConfig::default();
        config.workers.training = false;

        let workers = build_workers(&config, dir.path());
        assert_eq!(
            workers.names(),
            vec!["packaging-worker", "deployment-worker", "batch_job-worker"]
        );
    }

    #[test]
    fn runtime_dirs_are_created() {
        let dir = TempDir::new().unwrap();
        ensure_runtime_dirs(dir.path()).unwrap();
        assert!(storage_root(dir.path()).is_dir());
        assert!(runtime_root(dir.path()).is_dir());
    }

    #[tokio::test]
    async fn invalid_config_is_rejected_before_start() {
        let dir = TempDir::new().unwrap();
        let config = EngineConfig {
            sweep_interval_secs: 0,
            ..EngineConfig::default()
        };
        let err = run(config, dir.path().to_path_buf()).await.unwrap_err();
        assert!(matches!(err, DaemonError::Config(_)));
    }
}
