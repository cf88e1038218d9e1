//! Persistent repository contract for workload records.
//!
//! One repository per workload kind. Reads and writes outside a transaction
//! are individually atomic; [`Repository::begin`] opens a transaction for
//! read-compare-write sequences such as the optimistic status update.

use async_trait::async_trait;
use chrono::Utc;

use crate::error::StoreError;
use crate::types::{SpecPayload, WorkloadId, WorkloadRecord, WorkloadStatus};

/// Requested isolation for a repository transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Isolation {
    RepeatableRead,
    Serializable,
}

#[async_trait]
pub trait Repository<S: SpecPayload>: Send + Sync {
    async fn get(&self, id: &WorkloadId) -> Result<WorkloadRecord<S>, StoreError>;

    async fn list(&self) -> Result<Vec<WorkloadRecord<S>>, StoreError>;

    /// Insert a new record. Fails with [`StoreError::AlreadyExists`] if the id
    /// is taken.
    async fn create(&self, record: WorkloadRecord<S>) -> Result<WorkloadRecord<S>, StoreError>;

    /// Replace an existing record. Fails with [`StoreError::NotFound`] if the
    /// id is unknown.
    async fn update(&self, record: WorkloadRecord<S>) -> Result<WorkloadRecord<S>, StoreError>;

    async fn set_deletion_mark(&self, id: &WorkloadId, value: bool) -> Result<(), StoreError>;

    async fn begin(&self, isolation: Isolation) -> Result<Box<dyn Transaction<S>>, StoreError>;

    /// Create-or-replace behind [`put_spec`]. Stores that can hold a lock
    /// across the read and the write override this.
    async fn replace_spec(&self, id: WorkloadId, spec: S) -> Result<WorkloadRecord<S>, StoreError> {
        match self.get(&id).await {
            Ok(existing) => self.update(respec(Some(&existing), id, spec)).await,
            Err(StoreError::NotFound { .. }) => self.create(respec(None, id, spec)).await,
            Err(err) => Err(err),
        }
    }
}

/// An open repository transaction. Dropping it without [`Transaction::commit`]
/// discards every staged write.
#[async_trait]
pub trait Transaction<S: SpecPayload>: Send {
    /// Read a record as seen by this transaction, including staged writes.
    async fn get(&mut self, id: &WorkloadId) -> Result<WorkloadRecord<S>, StoreError>;

    async fn update_status(
        &mut self,
        id: &WorkloadId,
        status: WorkloadStatus,
    ) -> Result<(), StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;

    async fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}

/// API-side write: create the record, or replace the spec of an existing one.
///
/// Either way the status resets to `unknown` and the deletion mark clears, so
/// the next sweep treats the record as fresh intent. `created_at` survives an
/// update.
pub async fn put_spec<S: SpecPayload>(
    repo: &dyn Repository<S>,
    id: WorkloadId,
    spec: S,
) -> Result<WorkloadRecord<S>, StoreError> {
    repo.replace_spec(id, spec).await
}

/// The record `put_spec` writes, given what is stored under its id now.
pub fn respec<S: SpecPayload>(
    existing: Option<&WorkloadRecord<S>>,
    id: WorkloadId,
    spec: S,
) -> WorkloadRecord<S> {
    match existing {
        Some(existing) => WorkloadRecord {
            id,
            spec,
            status: WorkloadStatus::default(),
            created_at: existing.created_at,
            updated_at: Utc::now(),
            deletion_mark: false,
        },
        None => WorkloadRecord::new(id, spec),
    }
}
