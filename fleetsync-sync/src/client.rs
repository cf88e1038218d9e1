//! Orchestration substrate client contract.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use fleetsync_core::{ExternalResource, SpecPayload, WorkloadId};

use crate::contracts::ChangeHook;
use crate::error::ClientError;

/// Create/read/update/delete access to one kind of external resource, plus a
/// change watch.
///
/// `create` starts the resource with an `unknown` status; `update` replaces
/// the spec and resets the status, as re-submitting a workload would.
#[async_trait]
pub trait OrchestratorClient<S: SpecPayload>: Send + Sync {
    async fn get(&self, id: &WorkloadId) -> Result<ExternalResource<S>, ClientError>;

    async fn list(&self) -> Result<Vec<ExternalResource<S>>, ClientError>;

    async fn create(&self, id: &WorkloadId, spec: &S) -> Result<(), ClientError>;

    async fn update(&self, id: &WorkloadId, spec: &S) -> Result<(), ClientError>;

    async fn delete(&self, id: &WorkloadId) -> Result<(), ClientError>;

    /// Invoke `hook` with a resource id whenever that resource changes.
    ///
    /// Returns once the watch is registered. Delete events are not
    /// delivered.
    async fn watch(
        &self,
        hook: Arc<dyn ChangeHook>,
        cancel: CancellationToken,
    ) -> Result<(), ClientError>;
}
