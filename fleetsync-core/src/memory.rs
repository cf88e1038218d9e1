//! In-memory repository.
//!
//! Transactions hold the table lock for their whole lifetime, which gives
//! serializable isolation at the cost of concurrency. Staged status writes are
//! applied on commit only.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::error::StoreError;
use crate::repository::{Isolation, Repository, Transaction};
use crate::types::{SpecPayload, WorkloadId, WorkloadRecord, WorkloadStatus};

type Table<S> = HashMap<WorkloadId, WorkloadRecord<S>>;

pub struct InMemoryRepository<S> {
    table: Arc<Mutex<Table<S>>>,
}

impl<S: SpecPayload> InMemoryRepository<S> {
    pub fn new() -> Self {
        Self {
            table: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Repository pre-populated with `records`.
    pub fn with_records(records: impl IntoIterator<Item = WorkloadRecord<S>>) -> Self {
        let table = records
            .into_iter()
            .map(|record| (record.id.clone(), record))
            .collect();
        Self {
            table: Arc::new(Mutex::new(table)),
        }
    }

    /// Physically remove a record, as the retention job would.
    pub async fn purge(&self, id: &WorkloadId) -> Option<WorkloadRecord<S>> {
        self.table.lock().await.remove(id)
    }
}

impl<S: SpecPayload> Default for InMemoryRepository<S> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<S: SpecPayload> Repository<S> for InMemoryRepository<S> {
    async fn get(&self, id: &WorkloadId) -> Result<WorkloadRecord<S>, StoreError> {
        self.table
            .lock()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound { id: id.clone() })
    }

    async fn list(&self) -> Result<Vec<WorkloadRecord<S>>, StoreError> {
        let table = self.table.lock().await;
        let mut records: Vec<_> = table.values().cloned().collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(records)
    }

    async fn create(&self, record: WorkloadRecord<S>) -> Result<WorkloadRecord<S>, StoreError> {
        let mut table = self.table.lock().await;
        if table.contains_key(&record.id) {
            return Err(StoreError::AlreadyExists { id: record.id });
        }
        table.insert(record.id.clone(), record.clone());
        Ok(record)
    }

    async fn update(&self, record: WorkloadRecord<S>) -> Result<WorkloadRecord<S>, StoreError> {
        let mut table = self.table.lock().await;
        let Some(slot) = table.get_mut(&record.id) else {
            return Err(StoreError::NotFound { id: record.id });
        };
        *slot = record.clone();
        Ok(record)
    }

    async fn set_deletion_mark(&self, id: &WorkloadId, value: bool) -> Result<(), StoreError> {
        let mut table = self.table.lock().await;
        let record = table
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound { id: id.clone() })?;
        record.deletion_mark = value;
        record.updated_at = Utc::now();
        Ok(())
    }

    async fn begin(&self, _isolation: Isolation) -> Result<Box<dyn Transaction<S>>, StoreError> {
        let guard = self.table.clone().lock_owned().await;
        Ok(Box::new(InMemoryTransaction {
            guard,
            staged: HashMap::new(),
        }))
    }
}

struct InMemoryTransaction<S> {
    guard: OwnedMutexGuard<Table<S>>,
    staged: HashMap<WorkloadId, WorkloadStatus>,
}

#[async_trait]
impl<S: SpecPayload> Transaction<S> for InMemoryTransaction<S> {
    async fn get(&mut self, id: &WorkloadId) -> Result<WorkloadRecord<S>, StoreError> {
        let mut record = self
            .guard
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound { id: id.clone() })?;
        if let Some(status) = self.staged.get(id) {
            record.status = status.clone();
        }
        Ok(record)
    }

    async fn update_status(
        &mut self,
        id: &WorkloadId,
        status: WorkloadStatus,
    ) -> Result<(), StoreError> {
        if !self.guard.contains_key(id) {
            return Err(StoreError::NotFound { id: id.clone() });
        }
        self.staged.insert(id.clone(), status);
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let InMemoryTransaction { mut guard, staged } = *self;
        let now = Utc::now();
        for (id, status) in staged {
            if let Some(record) = guard.get_mut(&id) {
                record.status = status;
                record.updated_at = now;
            }
        }
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BatchJobSpec, WorkloadState};

    fn spec(input: &str) -> BatchJobSpec {
        BatchJobSpec {
            service: "scoring".to_string(),
            input_path: input.to_string(),
            output_path: "out/".to_string(),
            ..BatchJobSpec::default()
        }
    }

    #[tokio::test]
    async fn create_rejects_duplicates() {
        let repo = InMemoryRepository::new();
        repo.create(WorkloadRecord::new("b1".into(), spec("in/")))
            .await
            .unwrap();
        let err = repo
            .create(WorkloadRecord::new("b1".into(), spec("in/")))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists { .. }));
    }

    #[tokio::test]
    async fn update_of_unknown_record_is_not_found() {
        let repo = InMemoryRepository::new();
        let err = repo
            .update(WorkloadRecord::new("ghost".into(), spec("in/")))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn committed_status_is_visible() {
        let repo = InMemoryRepository::with_records([WorkloadRecord::new("b1".into(), spec("in/"))]);
        let id = WorkloadId::from("b1");

        let mut tx = repo.begin(Isolation::Serializable).await.unwrap();
        tx.update_status(&id, WorkloadStatus::with_state(WorkloadState::Running))
            .await
            .unwrap();
        assert_eq!(tx.get(&id).await.unwrap().status.state, WorkloadState::Running);
        tx.commit().await.unwrap();

        assert_eq!(repo.get(&id).await.unwrap().status.state, WorkloadState::Running);
    }

    #[tokio::test]
    async fn rolled_back_status_is_discarded() {
        let repo = InMemoryRepository::with_records([WorkloadRecord::new("b1".into(), spec("in/"))]);
        let id = WorkloadId::from("b1");

        let mut tx = repo.begin(Isolation::Serializable).await.unwrap();
        tx.update_status(&id, WorkloadStatus::with_state(WorkloadState::Failed))
            .await
            .unwrap();
        tx.rollback().await.unwrap();

        assert_eq!(repo.get(&id).await.unwrap().status.state, WorkloadState::Unknown);
    }

    #[tokio::test]
    async fn dropped_transaction_releases_the_table() {
        let repo = InMemoryRepository::with_records([WorkloadRecord::new("b1".into(), spec("in/"))]);
        {
            let _tx = repo.begin(Isolation::RepeatableRead).await.unwrap();
        }
        assert_eq!(repo.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn deletion_mark_keeps_record() {
        let repo = InMemoryRepository::with_records([WorkloadRecord::new("b1".into(), spec("in/"))]);
        let id = WorkloadId::from("b1");
        repo.set_deletion_mark(&id, true).await.unwrap();
        assert!(repo.get(&id).await.unwrap().deletion_mark);
        assert!(repo.purge(&id).await.is_some());
        assert!(repo.get(&id).await.unwrap_err().is_not_found());
    }
}
