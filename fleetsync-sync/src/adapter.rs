//! Generic workload adapter.
//!
//! [`KindAdapter`] binds one workload kind's repository and orchestrator
//! client and wraps their records as entity trait objects. The four kinds
//! differ only in their spec type, so one generic adapter serves all of them.

use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use fleetsync_core::{
    content_hash, BatchJob, ContentHash, Deployment, ExternalResource, HashError, Packaging,
    Repository, SpecPayload, Training, Workload, WorkloadId, WorkloadKind, WorkloadRecord,
};

use crate::client::OrchestratorClient;
use crate::contracts::{ChangeHook, ExternalResourceEntity, StorageEntity, WorkloadAdapter};
use crate::error::SyncError;
use crate::status_updater::{OptimisticStatusUpdater, StatusUpdate};

pub type TrainingAdapter = KindAdapter<Training>;
pub type PackagingAdapter = KindAdapter<Packaging>;
pub type DeploymentAdapter = KindAdapter<Deployment>;
pub type BatchJobAdapter = KindAdapter<BatchJob>;

pub struct KindAdapter<W: Workload> {
    repo: Arc<dyn Repository<W::Spec>>,
    client: Arc<dyn OrchestratorClient<W::Spec>>,
    updater: OptimisticStatusUpdater<W::Spec>,
    _kind: PhantomData<fn() -> W>,
}

impl<W: Workload> KindAdapter<W> {
    pub fn new(
        repo: Arc<dyn Repository<W::Spec>>,
        client: Arc<dyn OrchestratorClient<W::Spec>>,
    ) -> Self {
        let updater = OptimisticStatusUpdater::new(Arc::clone(&repo));
        Self {
            repo,
            client,
            updater,
            _kind: PhantomData,
        }
    }

    pub fn updater(&self) -> &OptimisticStatusUpdater<W::Spec> {
        &self.updater
    }

    fn wrap_external(&self, resource: ExternalResource<W::Spec>) -> Box<dyn ExternalResourceEntity> {
        Box::new(ExternalWorkload {
            resource,
            client: Arc::clone(&self.client),
            updater: self.updater.clone(),
        })
    }
}

#[async_trait]
impl<W: Workload> WorkloadAdapter for KindAdapter<W> {
    fn kind(&self) -> WorkloadKind {
        W::KIND
    }

    async fn list_storage(&self) -> Result<Vec<Box<dyn StorageEntity>>, SyncError> {
        let records = self.repo.list().await?;
        Ok(records
            .into_iter()
            .map(|record| {
                Box::new(StoredWorkload {
                    record,
                    client: Arc::clone(&self.client),
                }) as Box<dyn StorageEntity>
            })
            .collect())
    }

    async fn list_external(&self) -> Result<Vec<Box<dyn ExternalResourceEntity>>, SyncError> {
        let resources = self.client.list().await?;
        Ok(resources
            .into_iter()
            .map(|resource| self.wrap_external(resource))
            .collect())
    }

    async fn get_external(
        &self,
        id: &WorkloadId,
    ) -> Result<Box<dyn ExternalResourceEntity>, SyncError> {
        let resource = self.client.get(id).await?;
        Ok(self.wrap_external(resource))
    }

    async fn attach(
        &self,
        hook: Arc<dyn ChangeHook>,
        cancel: CancellationToken,
    ) -> Result<(), SyncError> {
        self.client
            .watch(hook, cancel)
            .await
            .map_err(|source| SyncError::Attach {
                kind: W::KIND,
                source,
            })
    }
}

// ---------------------------------------------------------------------------
// Entities
// ---------------------------------------------------------------------------

struct StoredWorkload<S: SpecPayload> {
    record: WorkloadRecord<S>,
    client: Arc<dyn OrchestratorClient<S>>,
}

#[async_trait]
impl<S: SpecPayload> StorageEntity for StoredWorkload<S> {
    fn id(&self) -> &WorkloadId {
        &self.record.id
    }

    fn spec_hash(&self) -> Result<ContentHash, HashError> {
        content_hash(&self.record.spec)
    }

    fn status_hash(&self) -> Result<ContentHash, HashError> {
        content_hash(&self.record.status)
    }

    fn has_deletion_mark(&self) -> bool {
        self.record.deletion_mark
    }

    /// A resource that already exists (an earlier create whose reply was
    /// lost, or another leader) counts as created. Any spec difference is
    /// picked up as drift on the next sweep.
    async fn create_in_service(&self) -> Result<(), SyncError> {
        match self.client.create(&self.record.id, &self.record.spec).await {
            Ok(()) => Ok(()),
            Err(err) if err.is_already_exists() => {
                tracing::debug!(id = %self.record.id, "resource already exists, create skipped");
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn update_in_service(&self) -> Result<(), SyncError> {
        self.client.update(&self.record.id, &self.record.spec).await?;
        Ok(())
    }
}

struct ExternalWorkload<S: SpecPayload> {
    resource: ExternalResource<S>,
    client: Arc<dyn OrchestratorClient<S>>,
    updater: OptimisticStatusUpdater<S>,
}

#[async_trait]
impl<S: SpecPayload> ExternalResourceEntity for ExternalWorkload<S> {
    fn id(&self) -> &WorkloadId {
        &self.resource.id
    }

    fn spec_hash(&self) -> Result<ContentHash, HashError> {
        content_hash(&self.resource.spec)
    }

    fn status_hash(&self) -> Result<ContentHash, HashError> {
        content_hash(&self.resource.status)
    }

    /// The resource's own spec hash is the snapshot: its status only lands
    /// if storage still holds the spec it was produced for.
    async fn save_result_in_storage(&self) -> Result<(), SyncError> {
        let snapshot = self.spec_hash()?;
        let id = &self.resource.id;
        match self
            .updater
            .update_status(id, self.resource.status.clone(), &snapshot)
            .await
        {
            Ok(StatusUpdate::Applied) => {
                tracing::info!(
                    id = %id,
                    state = %self.resource.status.state,
                    flow = "storage <- service",
                    "status saved"
                );
                Ok(())
            }
            Ok(StatusUpdate::Unchanged) => Ok(()),
            Err(err) if err.is_not_found() => {
                tracing::debug!(id = %id, "record is gone from storage, status dropped");
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn delete_in_service(&self) -> Result<(), SyncError> {
        match self.client.delete(&self.resource.id).await {
            Ok(()) => Ok(()),
            Err(err) if err.is_not_found() => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ClientError;
    use crate::memory::{InMemoryOrchestrator, Op};
    use fleetsync_core::{InMemoryRepository, TrainingSpec, WorkloadStatus};

    fn spec(version: &str) -> TrainingSpec {
        let mut spec = TrainingSpec {
            toolchain: "mlflow".to_string(),
            entrypoint: "main".to_string(),
            ..TrainingSpec::default()
        };
        spec.model.version = version.to_string();
        spec
    }

    fn training_adapter(
        records: Vec<WorkloadRecord<TrainingSpec>>,
    ) -> (TrainingAdapter, InMemoryOrchestrator<TrainingSpec>) {
        let repo = Arc::new(InMemoryRepository::with_records(records));
        let orchestrator = InMemoryOrchestrator::new();
        let adapter = TrainingAdapter::new(repo, Arc::new(orchestrator.clone()));
        (adapter, orchestrator)
    }

    #[tokio::test]
    async fn create_of_already_running_resource_succeeds() {
        let id = WorkloadId::from("t1");
        let (adapter, orchestrator) =
            training_adapter(vec![WorkloadRecord::new(id.clone(), spec("1.0"))]);
        orchestrator
            .seed(ExternalResource {
                id: id.clone(),
                spec: spec("1.0"),
                status: WorkloadStatus::default(),
            })
            .await;

        let stored = adapter.list_storage().await.unwrap();
        stored[0].create_in_service().await.unwrap();

        assert_eq!(orchestrator.calls(Op::Create).await, 1);
        assert_eq!(orchestrator.len().await, 1);
    }

    #[tokio::test]
    async fn create_still_reports_unavailable_substrate() {
        let (adapter, orchestrator) =
            training_adapter(vec![WorkloadRecord::new("t1".into(), spec("1.0"))]);
        orchestrator.fail_next(Op::Create, 1).await;

        let stored = adapter.list_storage().await.unwrap();
        let err = stored[0].create_in_service().await.unwrap_err();
        assert!(matches!(err, SyncError::Client(ClientError::Unavailable(_))), "got: {err}");
        assert!(orchestrator.is_empty().await);
    }
}
