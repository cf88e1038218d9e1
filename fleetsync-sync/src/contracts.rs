//! Entity contracts the reconciler operates on.
//!
//! A reconciler never sees concrete workload types. Each workload kind
//! provides a [`WorkloadAdapter`] that lists both sides of the sync wrapped as
//! [`StorageEntity`] / [`ExternalResourceEntity`] trait objects.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use fleetsync_core::{ContentHash, HashError, WorkloadId, WorkloadKind};

use crate::error::SyncError;

/// Stored intent for one workload.
#[async_trait]
pub trait StorageEntity: Send + Sync {
    fn id(&self) -> &WorkloadId;

    fn spec_hash(&self) -> Result<ContentHash, HashError>;

    fn status_hash(&self) -> Result<ContentHash, HashError>;

    /// Marked records are dropped from intent; their external resource
    /// becomes a zombie.
    fn has_deletion_mark(&self) -> bool;

    /// Create the matching external resource from this record's spec.
    async fn create_in_service(&self) -> Result<(), SyncError>;

    /// Replace the external resource's spec with this record's spec.
    async fn update_in_service(&self) -> Result<(), SyncError>;
}

/// Live resource for one workload in the orchestration substrate.
#[async_trait]
pub trait ExternalResourceEntity: Send + Sync {
    fn id(&self) -> &WorkloadId;

    fn spec_hash(&self) -> Result<ContentHash, HashError>;

    fn status_hash(&self) -> Result<ContentHash, HashError>;

    /// Fold this resource's observed status into storage.
    async fn save_result_in_storage(&self) -> Result<(), SyncError>;

    async fn delete_in_service(&self) -> Result<(), SyncError>;
}

/// Callback invoked by a substrate watch with the id of a changed resource.
#[async_trait]
pub trait ChangeHook: Send + Sync {
    async fn on_change(&self, id: WorkloadId) -> Result<(), SyncError>;
}

/// Per-kind glue between a repository and an orchestrator client.
#[async_trait]
pub trait WorkloadAdapter: Send + Sync {
    fn kind(&self) -> WorkloadKind;

    async fn list_storage(&self) -> Result<Vec<Box<dyn StorageEntity>>, SyncError>;

    async fn list_external(&self) -> Result<Vec<Box<dyn ExternalResourceEntity>>, SyncError>;

    async fn get_external(
        &self,
        id: &WorkloadId,
    ) -> Result<Box<dyn ExternalResourceEntity>, SyncError>;

    /// Register `hook` with the substrate's change watch. Returns once the
    /// watch is established; delivery continues until `cancel` fires.
    async fn attach(
        &self,
        hook: Arc<dyn ChangeHook>,
        cancel: CancellationToken,
    ) -> Result<(), SyncError>;
}
