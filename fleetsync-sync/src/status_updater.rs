//! Hash-gated conditional status writes.
//!
//! ## `update_status` protocol
//!
//! 1. Open a serializable transaction.
//! 2. Re-read the stored record.
//! 3. Hash the stored spec and compare with the caller's snapshot; on
//!    mismatch roll back with [`StoreError::SpecWasTouched`].
//! 4. Compare status hashes; if equal roll back and report
//!    [`StatusUpdate::Unchanged`].
//! 5. Stage the new status and commit.
//!
//! The snapshot is the spec hash the caller observed when the status was
//! produced, so a status for an old spec never lands on a newer one.

use std::sync::Arc;

use fleetsync_core::{
    content_hash, ContentHash, Isolation, Repository, SpecPayload, StoreError, Transaction,
    WorkloadId, WorkloadStatus,
};

/// Outcome of a successful [`OptimisticStatusUpdater::update_status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusUpdate {
    /// The status was written.
    Applied,
    /// The stored status already hashed equal; nothing was written.
    Unchanged,
}

pub struct OptimisticStatusUpdater<S> {
    repo: Arc<dyn Repository<S>>,
}

impl<S> Clone for OptimisticStatusUpdater<S> {
    fn clone(&self) -> Self {
        Self {
            repo: Arc::clone(&self.repo),
        }
    }
}

impl<S: SpecPayload> OptimisticStatusUpdater<S> {
    pub fn new(repo: Arc<dyn Repository<S>>) -> Self {
        Self { repo }
    }

    /// Write `status` for `id` only if the stored spec still hashes to
    /// `snapshot`.
    pub async fn update_status(
        &self,
        id: &WorkloadId,
        status: WorkloadStatus,
        snapshot: &ContentHash,
    ) -> Result<StatusUpdate, StoreError> {
        let mut tx = self.repo.begin(Isolation::Serializable).await?;

        let record = match tx.get(id).await {
            Ok(record) => record,
            Err(err) => return Err(abort(tx, err).await),
        };

        let current = match content_hash(&record.spec) {
            Ok(hash) => hash,
            Err(err) => return Err(abort(tx, err.into()).await),
        };
        if current != *snapshot {
            tracing::debug!(
                id = %id,
                stored = current.short(),
                snapshot = snapshot.short(),
                "spec was touched, discarding status"
            );
            return Err(abort(tx, StoreError::SpecWasTouched { id: id.clone() }).await);
        }

        let unchanged = match (content_hash(&record.status), content_hash(&status)) {
            (Ok(old), Ok(new)) => old == new,
            (Err(err), _) | (_, Err(err)) => return Err(abort(tx, err.into()).await),
        };
        if unchanged {
            if let Err(err) = tx.rollback().await {
                tracing::warn!(id = %id, error = %err, "rollback failed");
            }
            return Ok(StatusUpdate::Unchanged);
        }

        let state = status.state;
        if let Err(err) = tx.update_status(id, status).await {
            return Err(abort(tx, err).await);
        }
        tx.commit().await?;
        tracing::debug!(id = %id, state = %state, "status updated");
        Ok(StatusUpdate::Applied)
    }
}

/// Roll back `tx` and hand back the error that caused it.
async fn abort<S: SpecPayload>(tx: Box<dyn Transaction<S>>, err: StoreError) -> StoreError {
    if let Err(rollback_err) = tx.rollback().await {
        tracing::warn!(error = %rollback_err, "rollback failed");
    }
    err
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetsync_core::{
        DeploymentSpec, InMemoryRepository, WorkloadRecord, WorkloadState,
    };
    use fleetsync_core::types::Resources;

    fn spec(image: &str) -> DeploymentSpec {
        DeploymentSpec {
            image: image.to_string(),
            predictor: "mlflow".to_string(),
            min_replicas: 1,
            max_replicas: 2,
            resources: Resources::default(),
        }
    }

    fn setup() -> (Arc<InMemoryRepository<DeploymentSpec>>, OptimisticStatusUpdater<DeploymentSpec>) {
        let repo = Arc::new(InMemoryRepository::with_records([WorkloadRecord::new(
            "d1".into(),
            spec("model:1"),
        )]));
        let updater = OptimisticStatusUpdater::new(repo.clone() as Arc<dyn Repository<_>>);
        (repo, updater)
    }

    #[tokio::test]
    async fn matching_snapshot_applies_status() {
        let (repo, updater) = setup();
        let snapshot = content_hash(&spec("model:1")).unwrap();

        let outcome = updater
            .update_status(
                &"d1".into(),
                WorkloadStatus::with_state(WorkloadState::Running),
                &snapshot,
            )
            .await
            .unwrap();

        assert_eq!(outcome, StatusUpdate::Applied);
        let stored = repo.get(&"d1".into()).await.unwrap();
        assert_eq!(stored.status.state, WorkloadState::Running);
    }

    #[tokio::test]
    async fn stale_snapshot_is_spec_was_touched_and_leaves_status() {
        let (repo, updater) = setup();
        let stale = content_hash(&spec("model:0")).unwrap();

        let err = updater
            .update_status(
                &"d1".into(),
                WorkloadStatus::with_state(WorkloadState::Failed),
                &stale,
            )
            .await
            .unwrap_err();

        assert!(err.is_spec_was_touched(), "got: {err}");
        let stored = repo.get(&"d1".into()).await.unwrap();
        assert_eq!(stored.status.state, WorkloadState::Unknown);
    }

    #[tokio::test]
    async fn equal_status_is_not_rewritten() {
        let (repo, updater) = setup();
        let before = repo.get(&"d1".into()).await.unwrap().updated_at;
        let snapshot = content_hash(&spec("model:1")).unwrap();

        let outcome = updater
            .update_status(&"d1".into(), WorkloadStatus::default(), &snapshot)
            .await
            .unwrap();

        assert_eq!(outcome, StatusUpdate::Unchanged);
        assert_eq!(repo.get(&"d1".into()).await.unwrap().updated_at, before);
    }

    #[tokio::test]
    async fn missing_record_is_not_found() {
        let (_repo, updater) = setup();
        let snapshot = content_hash(&spec("model:1")).unwrap();
        let err = updater
            .update_status(&"ghost".into(), WorkloadStatus::default(), &snapshot)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn transaction_is_released_after_each_outcome() {
        let (repo, updater) = setup();
        let stale = content_hash(&spec("other")).unwrap();
        let _ = updater
            .update_status(&"d1".into(), WorkloadStatus::default(), &stale)
            .await;
        // A leaked transaction would hold the table lock and hang this call.
        repo.set_deletion_mark(&"d1".into(), true).await.unwrap();
    }
}
