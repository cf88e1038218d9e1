//! Leadership gating for the supervisor.
//!
//! Workers only run while this process holds leadership. The election itself
//! happens elsewhere; this module only consumes its outcome as a
//! `watch::Receiver<bool>`.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::error::DaemonError;
use crate::supervisor::Supervisor;

/// Leadership for a process that is the only instance. Keep the sender alive
/// for as long as leadership should hold.
pub fn standalone() -> (watch::Sender<bool>, watch::Receiver<bool>) {
    watch::channel(true)
}

/// Wait for leadership, run `supervisor`, and shut it down when leadership
/// is lost or `stop` fires.
///
/// Losing leadership returns [`DaemonError::LeadershipLost`] once the
/// workers are down, so the caller exits instead of running unled. A
/// leadership source that closes before ever granting leadership ends the
/// wait with `Ok`.
pub async fn run_with_leadership(
    mut leader: watch::Receiver<bool>,
    supervisor: Arc<Supervisor>,
    shutdown_timeout: Duration,
    stop: CancellationToken,
) -> Result<(), DaemonError> {
    tokio::select! {
        _ = stop.cancelled() => return Ok(()),
        acquired = leadership_granted(&mut leader) => {
            if !acquired {
                tracing::info!("leadership source closed before leadership was acquired");
                return Ok(());
            }
        }
    }
    tracing::info!("leadership acquired, starting workers");

    tokio::select! {
        result = supervisor.run() => result,
        _ = leadership_lost(&mut leader) => {
            tracing::warn!("leadership lost, stopping workers");
            supervisor.shutdown(shutdown_timeout).await?;
            Err(DaemonError::LeadershipLost)
        }
        _ = stop.cancelled() => {
            tracing::info!("stop requested, stopping workers");
            supervisor.shutdown(shutdown_timeout).await
        }
    }
}

async fn leadership_granted(leader: &mut watch::Receiver<bool>) -> bool {
    leader.wait_for(|is_leader| *is_leader).await.is_ok()
}

async fn leadership_lost(leader: &mut watch::Receiver<bool>) {
    if leader.wait_for(|is_leader| !*is_leader).await.is_err() {
        // Sender gone while leading: the last value stands.
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisor::{Runnable, WorkerSet};
    use async_trait::async_trait;
    use fleetsync_sync::SyncError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting {
        started: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Runnable for Counting {
        fn name(&self) -> &str {
            "counting-worker"
        }

        async fn run(&self, cancel: CancellationToken) -> Result<(), SyncError> {
            self.started.fetch_add(1, Ordering::SeqCst);
            cancel.cancelled().await;
            Ok(())
        }
    }

    fn supervisor(started: &Arc<AtomicUsize>) -> Arc<Supervisor> {
        Arc::new(Supervisor::new(WorkerSet::new().with(Arc::new(Counting {
            started: started.clone(),
        }))))
    }

    #[tokio::test(start_paused = true, flavor = "current_thread")]
    async fn workers_wait_for_leadership_and_stop_when_it_is_lost() {
        let started = Arc::new(AtomicUsize::new(0));
        let supervisor = supervisor(&started);
        let (tx, rx) = watch::channel(false);

        let gate = tokio::spawn(run_with_leadership(
            rx,
            supervisor.clone(),
            Duration::from_secs(5),
            CancellationToken::new(),
        ));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(started.load(Ordering::SeqCst), 0, "not leader yet");

        tx.send(true).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(supervisor.running(), 1);

        tx.send(false).unwrap();
        let result = gate.await.unwrap();
        assert!(matches!(result, Err(DaemonError::LeadershipLost)));
        assert_eq!(supervisor.running(), 0);
    }

    #[tokio::test(start_paused = true, flavor = "current_thread")]
    async fn stop_shuts_down_cleanly() {
        let started = Arc::new(AtomicUsize::new(0));
        let supervisor = supervisor(&started);
        let (_tx, rx) = standalone();
        let stop = CancellationToken::new();

        let gate = tokio::spawn(run_with_leadership(
            rx,
            supervisor.clone(),
            Duration::from_secs(5),
            stop.clone(),
        ));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(started.load(Ordering::SeqCst), 1);

        stop.cancel();
        assert!(gate.await.unwrap().is_ok());
        assert_eq!(supervisor.running(), 0);
    }

    #[tokio::test(start_paused = true, flavor = "current_thread")]
    async fn dropped_sender_keeps_the_last_grant() {
        let started = Arc::new(AtomicUsize::new(0));
        let supervisor = supervisor(&started);
        let (tx, rx) = standalone();
        let stop = CancellationToken::new();

        let gate = tokio::spawn(run_with_leadership(
            rx,
            supervisor.clone(),
            Duration::from_secs(5),
            stop.clone(),
        ));
        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(tx);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(supervisor.running(), 1);

        stop.cancel();
        assert!(gate.await.unwrap().is_ok());
    }
}
