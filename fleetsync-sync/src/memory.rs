//! In-process orchestration substrate.
//!
//! Keeps resources in a map and delivers change notifications to registered
//! hooks synchronously. [`InMemoryOrchestrator::report_status`] plays the part
//! of a running workload reporting progress. Failures can be injected per
//! operation to exercise retry paths.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use fleetsync_core::{ExternalResource, SpecPayload, WorkloadId, WorkloadStatus};

use crate::client::OrchestratorClient;
use crate::contracts::ChangeHook;
use crate::error::{ClientError, SyncError};

/// Client operations, for call counting and failure injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Get,
    List,
    Create,
    Update,
    Delete,
    Watch,
}

struct State<S> {
    resources: BTreeMap<WorkloadId, ExternalResource<S>>,
    hooks: Vec<(Arc<dyn ChangeHook>, CancellationToken)>,
    calls: HashMap<Op, usize>,
    failures: HashMap<Op, usize>,
}

pub struct InMemoryOrchestrator<S> {
    state: Arc<Mutex<State<S>>>,
}

impl<S> Clone for InMemoryOrchestrator<S> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl<S: SpecPayload> Default for InMemoryOrchestrator<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: SpecPayload> InMemoryOrchestrator<S> {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                resources: BTreeMap::new(),
                hooks: Vec::new(),
                calls: HashMap::new(),
                failures: HashMap::new(),
            })),
        }
    }

    /// Place a resource directly, bypassing call counting and hooks.
    pub async fn seed(&self, resource: ExternalResource<S>) {
        let mut state = self.state.lock().await;
        state.resources.insert(resource.id.clone(), resource);
    }

    /// Current copy of a resource.
    pub async fn resource(&self, id: &WorkloadId) -> Option<ExternalResource<S>> {
        self.state.lock().await.resources.get(id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.resources.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Number of client calls of `op` so far.
    pub async fn calls(&self, op: Op) -> usize {
        self.state.lock().await.calls.get(&op).copied().unwrap_or(0)
    }

    /// Make the next `times` calls of `op` fail with `Unavailable`.
    pub async fn fail_next(&self, op: Op, times: usize) {
        self.state.lock().await.failures.insert(op, times);
    }

    /// Remove a resource out-of-band, as an operator or the substrate would.
    /// No hook fires.
    pub async fn remove(&self, id: &WorkloadId) -> Option<ExternalResource<S>> {
        self.state.lock().await.resources.remove(id)
    }

    /// Record a status reported by the running workload and notify every
    /// live hook. Hook failures are logged, not retried.
    pub async fn report_status(
        &self,
        id: &WorkloadId,
        status: WorkloadStatus,
    ) -> Result<(), ClientError> {
        {
            let mut state = self.state.lock().await;
            let resource = state
                .resources
                .get_mut(id)
                .ok_or_else(|| ClientError::NotFound { id: id.clone() })?;
            resource.status = status;
        }
        self.notify(id).await;
        Ok(())
    }

    /// Deliver a change notification for `id` to every live hook and return
    /// the hook results in registration order.
    pub async fn notify(&self, id: &WorkloadId) -> Vec<Result<(), SyncError>> {
        let hooks: Vec<Arc<dyn ChangeHook>> = {
            let mut state = self.state.lock().await;
            state.hooks.retain(|(_, cancel)| !cancel.is_cancelled());
            state.hooks.iter().map(|(hook, _)| Arc::clone(hook)).collect()
        };
        let mut results = Vec::with_capacity(hooks.len());
        for hook in hooks {
            let result = hook.on_change(id.clone()).await;
            if let Err(err) = &result {
                tracing::warn!(id = %id, error = %err, "change hook failed");
            }
            results.push(result);
        }
        results
    }

    async fn enter(&self, op: Op) -> Result<tokio::sync::MutexGuard<'_, State<S>>, ClientError> {
        let mut state = self.state.lock().await;
        *state.calls.entry(op).or_insert(0) += 1;
        if let Some(remaining) = state.failures.get_mut(&op) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(ClientError::Unavailable(format!("injected {op:?} failure")));
            }
        }
        Ok(state)
    }
}

#[async_trait]
impl<S: SpecPayload> OrchestratorClient<S> for InMemoryOrchestrator<S> {
    async fn get(&self, id: &WorkloadId) -> Result<ExternalResource<S>, ClientError> {
        let state = self.enter(Op::Get).await?;
        state
            .resources
            .get(id)
            .cloned()
            .ok_or_else(|| ClientError::NotFound { id: id.clone() })
    }

    async fn list(&self) -> Result<Vec<ExternalResource<S>>, ClientError> {
        let state = self.enter(Op::List).await?;
        Ok(state.resources.values().cloned().collect())
    }

    async fn create(&self, id: &WorkloadId, spec: &S) -> Result<(), ClientError> {
        let mut state = self.enter(Op::Create).await?;
        if state.resources.contains_key(id) {
            return Err(ClientError::AlreadyExists { id: id.clone() });
        }
        state.resources.insert(
            id.clone(),
            ExternalResource {
                id: id.clone(),
                spec: spec.clone(),
                status: WorkloadStatus::default(),
            },
        );
        Ok(())
    }

    async fn update(&self, id: &WorkloadId, spec: &S) -> Result<(), ClientError> {
        let mut state = self.enter(Op::Update).await?;
        let resource = state
            .resources
            .get_mut(id)
            .ok_or_else(|| ClientError::NotFound { id: id.clone() })?;
        resource.spec = spec.clone();
        resource.status = WorkloadStatus::default();
        Ok(())
    }

    async fn delete(&self, id: &WorkloadId) -> Result<(), ClientError> {
        let mut state = self.enter(Op::Delete).await?;
        state
            .resources
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| ClientError::NotFound { id: id.clone() })
    }

    async fn watch(
        &self,
        hook: Arc<dyn ChangeHook>,
        cancel: CancellationToken,
    ) -> Result<(), ClientError> {
        let mut state = self
            .enter(Op::Watch)
            .await
            .map_err(|err| ClientError::Watch(err.to_string()))?;
        state.hooks.push((hook, cancel));
        Ok(())
    }
}
