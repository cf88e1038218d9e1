//! Worker supervisor.
//!
//! Runs one [`Runnable`] per enabled workload kind under a shared
//! cancellation token. The first runner to fail cancels the others; the
//! supervisor waits for them to wind down and reports the failure.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use fleetsync_core::{EngineConfig, WorkloadKind};
use fleetsync_sync::{Reconciler, SyncError};

use crate::error::DaemonError;

/// Default interval at which [`Supervisor::shutdown`] polls the running count.
pub const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// A long-running worker the supervisor can start and cancel.
#[async_trait]
pub trait Runnable: Send + Sync {
    fn name(&self) -> &str;

    /// Run until `cancel` fires or a fatal error occurs.
    async fn run(&self, cancel: CancellationToken) -> Result<(), SyncError>;
}

#[async_trait]
impl Runnable for Reconciler {
    fn name(&self) -> &str {
        Reconciler::name(self)
    }

    async fn run(&self, cancel: CancellationToken) -> Result<(), SyncError> {
        Reconciler::run(self, cancel).await
    }
}

// ---------------------------------------------------------------------------
// WorkerSet
// ---------------------------------------------------------------------------

/// The runners a supervisor owns, fixed at construction.
#[derive(Default)]
pub struct WorkerSet {
    runners: Vec<Arc<dyn Runnable>>,
}

impl WorkerSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// One runner per kind enabled in `config`, built by `build`.
    pub fn from_config<F>(config: &EngineConfig, mut build: F) -> Self
    where
        F: FnMut(WorkloadKind) -> Arc<dyn Runnable>,
    {
        let runners = config.enabled_kinds().into_iter().map(&mut build).collect();
        Self { runners }
    }

    pub fn with(mut self, runner: Arc<dyn Runnable>) -> Self {
        self.runners.push(runner);
        self
    }

    pub fn len(&self) -> usize {
        self.runners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runners.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.runners.iter().map(|r| r.name()).collect()
    }
}

// ---------------------------------------------------------------------------
// Supervisor
// ---------------------------------------------------------------------------

pub struct Supervisor {
    workers: WorkerSet,
    running: Arc<AtomicUsize>,
    cancel: CancellationToken,
    poll_interval: Duration,
}

impl Supervisor {
    pub fn new(workers: WorkerSet) -> Self {
        Self {
            workers,
            running: Arc::new(AtomicUsize::new(0)),
            cancel: CancellationToken::new(),
            poll_interval: SHUTDOWN_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Number of runners that have not yet returned.
    pub fn running(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Start every runner and wait until all have returned.
    ///
    /// Returns [`DaemonError::RunnersFailed`] carrying the first failure; the
    /// remaining runners are cancelled as soon as it arrives.
    pub async fn run(&self) -> Result<(), DaemonError> {
        let (done_tx, mut done_rx) =
            mpsc::channel::<(String, Result<(), DaemonError>)>(self.workers.len().max(1));

        for runner in &self.workers.runners {
            let name = runner.name().to_string();
            let runner = Arc::clone(runner);
            let cancel = self.cancel.clone();
            let done = done_tx.clone();
            let guard = RunningGuard::enter(&self.running);

            tokio::spawn(async move {
                let _guard = guard;
                let worker = tokio::spawn(async move { runner.run(cancel).await });
                let result = handle_join(&name, worker.await);
                let _ = done.send((name, result)).await;
            });
        }
        drop(done_tx);

        tracing::info!(workers = ?self.workers.names(), "supervisor started");

        let mut first_failure: Option<(String, DaemonError)> = None;
        while let Some((worker, result)) = done_rx.recv().await {
            match result {
                Ok(()) => tracing::info!(worker = %worker, "worker exited"),
                Err(err) => {
                    tracing::error!(worker = %worker, error = %err, "worker failed");
                    if first_failure.is_none() {
                        self.cancel.cancel();
                        first_failure = Some((worker, err));
                    }
                }
            }
        }

        match first_failure {
            Some((worker, err)) => Err(DaemonError::RunnersFailed {
                worker,
                source: Box::new(err),
            }),
            None => Ok(()),
        }
    }

    /// Cancel every runner and wait up to `deadline` for all of them to
    /// return, polling the running count.
    pub async fn shutdown(&self, deadline: Duration) -> Result<(), DaemonError> {
        self.cancel.cancel();
        let started = Instant::now();
        loop {
            let still_running = self.running();
            if still_running == 0 {
                tracing::info!("supervisor stopped");
                return Ok(());
            }
            if started.elapsed() >= deadline {
                return Err(DaemonError::ShutdownTimeout {
                    timeout: deadline,
                    still_running,
                });
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

/// Holds one slot of the running count; released on drop so a panicking
/// runner still decrements it.
struct RunningGuard(Arc<AtomicUsize>);

impl RunningGuard {
    fn enter(running: &Arc<AtomicUsize>) -> Self {
        running.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(running))
    }
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

fn handle_join(
    worker: &str,
    result: Result<Result<(), SyncError>, tokio::task::JoinError>,
) -> Result<(), DaemonError> {
    match result {
        Ok(inner) => inner.map_err(DaemonError::from),
        Err(err) => Err(DaemonError::WorkerPanicked {
            worker: worker.to_string(),
            reason: err.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetsync_sync::ClientError;
    use tokio_test::{assert_err, assert_ok};

    enum Behaviour {
        UntilCancelled,
        FailAfter(Duration),
        IgnoreCancel,
        Panic,
    }

    struct FakeRunner {
        name: String,
        behaviour: Behaviour,
    }

    fn runner(name: &str, behaviour: Behaviour) -> Arc<dyn Runnable> {
        Arc::new(FakeRunner {
            name: name.to_string(),
            behaviour,
        })
    }

    #[async_trait]
    impl Runnable for FakeRunner {
        fn name(&self) -> &str {
            &self.name
        }

        async fn run(&self, cancel: CancellationToken) -> Result<(), SyncError> {
            match self.behaviour {
                Behaviour::UntilCancelled => {
                    cancel.cancelled().await;
                    Ok(())
                }
                Behaviour::FailAfter(delay) => {
                    tokio::time::sleep(delay).await;
                    Err(ClientError::Watch("watch closed".into()).into())
                }
                Behaviour::IgnoreCancel => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(())
                }
                Behaviour::Panic => panic!("runner exploded"),
            }
        }
    }

    #[tokio::test(start_paused = true, flavor = "current_thread")]
    async fn first_failure_cancels_the_rest() {
        let supervisor = Supervisor::new(
            WorkerSet::new()
                .with(runner("training-worker", Behaviour::UntilCancelled))
                .with(runner("packaging-worker", Behaviour::FailAfter(Duration::from_secs(1))))
                .with(runner("deployment-worker", Behaviour::UntilCancelled)),
        );

        let err = assert_err!(supervisor.run().await);
        match err {
            DaemonError::RunnersFailed { worker, .. } => assert_eq!(worker, "packaging-worker"),
            other => panic!("expected RunnersFailed, got {other:?}"),
        }
        assert!(supervisor.is_cancelled());
        assert_eq!(supervisor.running(), 0);
    }

    #[tokio::test(start_paused = true, flavor = "current_thread")]
    async fn panicking_runner_is_reported_and_released() {
        let supervisor = Supervisor::new(
            WorkerSet::new()
                .with(runner("a", Behaviour::Panic))
                .with(runner("b", Behaviour::UntilCancelled)),
        );

        let err = assert_err!(supervisor.run().await);
        assert!(err.to_string().contains("panicked"), "got: {err}");
        assert_eq!(supervisor.running(), 0);
    }

    #[tokio::test(start_paused = true, flavor = "current_thread")]
    async fn shutdown_waits_for_cooperative_runners() {
        let supervisor = Arc::new(Supervisor::new(
            WorkerSet::new()
                .with(runner("a", Behaviour::UntilCancelled))
                .with(runner("b", Behaviour::UntilCancelled)),
        ));
        let run = {
            let supervisor = supervisor.clone();
            tokio::spawn(async move { supervisor.run().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(supervisor.running(), 2);

        assert_ok!(supervisor.shutdown(Duration::from_secs(5)).await);
        assert_ok!(run.await.unwrap());
    }

    #[tokio::test(start_paused = true, flavor = "current_thread")]
    async fn shutdown_times_out_on_stuck_runner() {
        let supervisor = Arc::new(Supervisor::new(
            WorkerSet::new().with(runner("stuck", Behaviour::IgnoreCancel)),
        ));
        let _run = {
            let supervisor = supervisor.clone();
            tokio::spawn(async move { supervisor.run().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let started = Instant::now();
        let err = assert_err!(supervisor.shutdown(Duration::from_secs(1)).await);
        assert!(matches!(
            err,
            DaemonError::ShutdownTimeout { still_running: 1, .. }
        ));
        assert!(started.elapsed() >= Duration::from_secs(1));
        assert!(started.elapsed() < Duration::from_millis(1300));
    }

    #[test]
    fn worker_set_honours_toggles() {
        let mut config = EngineConfig::default();
        config.workers.deployment = false;
        let set = WorkerSet::from_config(&config, |kind| {
            runner(&format!("{kind}-worker"), Behaviour::UntilCancelled)
        });
        assert_eq!(
            set.names(),
            vec!["training-worker", "packaging-worker", "batch_job-worker"]
        );

        config.disable_workers = true;
        let set = WorkerSet::from_config(&config, |kind| {
            runner(&format!("{kind}-worker"), Behaviour::UntilCancelled)
        });
        assert!(set.is_empty());
    }
}
