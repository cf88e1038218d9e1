//! Local directory substrate.
//!
//! Stands in for a container orchestrator on a single host. Each external
//! resource is a JSON document at `<state_dir>/runtime/<kind>/<id>.json`;
//! whatever executes the workload reports progress by rewriting the
//! document's `status` (see [`report_status_at`]).
//!
//! The change watch uses `notify` on the kind directory. Create and modify
//! events for `*.json` files are coalesced per resource over
//! [`DEBOUNCE_WINDOW`] and then handed to the hook; a failing hook is retried
//! with linear backoff up to [`REDELIVERY_ATTEMPTS`] times. Deletions are not
//! delivered.

use std::collections::HashMap;
use std::fs;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use notify::{recommended_watcher, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use fleetsync_core::{ExternalResource, SpecPayload, WorkloadId, WorkloadKind, WorkloadStatus};
use fleetsync_sync::{ChangeHook, ClientError, OrchestratorClient};

use crate::paths::{
    resource_path, runtime_kind_dir, DEBOUNCE_WINDOW, REDELIVERY_ATTEMPTS, REDELIVERY_BACKOFF,
};

// ---------------------------------------------------------------------------
// Blocking resource I/O
// ---------------------------------------------------------------------------

fn client_io(path: &Path, source: std::io::Error) -> ClientError {
    ClientError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Read one resource document.
pub fn load_resource_at<S: SpecPayload>(
    state_dir: &Path,
    kind: WorkloadKind,
    id: &WorkloadId,
) -> Result<ExternalResource<S>, ClientError> {
    let path = resource_path(state_dir, kind, id);
    let contents = match fs::read_to_string(&path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Err(ClientError::NotFound { id: id.clone() });
        }
        Err(err) => return Err(client_io(&path, err)),
    };
    serde_json::from_str(&contents).map_err(|err| ClientError::Decode {
        path,
        source: Box::new(err),
    })
}

/// Every resource of `kind`, sorted by id.
pub fn list_resources_at<S: SpecPayload>(
    state_dir: &Path,
    kind: WorkloadKind,
) -> Result<Vec<ExternalResource<S>>, ClientError> {
    let dir = runtime_kind_dir(state_dir, kind);
    if !dir.exists() {
        return Ok(vec![]);
    }
    let mut ids: Vec<WorkloadId> = fs::read_dir(&dir)
        .map_err(|e| client_io(&dir, e))?
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| resource_id(&entry.path()))
        .collect();
    ids.sort();

    let mut resources = Vec::with_capacity(ids.len());
    for id in ids {
        match load_resource_at(state_dir, kind, &id) {
            Ok(resource) => resources.push(resource),
            Err(ClientError::NotFound { .. }) => continue,
            Err(err) => return Err(err),
        }
    }
    Ok(resources)
}

/// Atomically write a resource document (`.json.tmp` then rename).
pub fn save_resource_at<S: SpecPayload>(
    state_dir: &Path,
    kind: WorkloadKind,
    resource: &ExternalResource<S>,
) -> Result<(), ClientError> {
    let dir = runtime_kind_dir(state_dir, kind);
    fs::create_dir_all(&dir).map_err(|e| client_io(&dir, e))?;
    let path = resource_path(state_dir, kind, &resource.id);
    let tmp = path.with_file_name(format!("{}.json.tmp", resource.id.as_str()));

    let json = serde_json::to_string_pretty(resource).map_err(|err| ClientError::Decode {
        path: path.clone(),
        source: Box::new(err),
    })?;
    fs::write(&tmp, json).map_err(|e| client_io(&tmp, e))?;
    if let Err(err) = fs::rename(&tmp, &path) {
        let _ = fs::remove_file(&tmp);
        return Err(client_io(&path, err));
    }
    Ok(())
}

/// Rewrite the status of a running resource, as the workload itself would.
pub fn report_status_at<S: SpecPayload>(
    state_dir: &Path,
    kind: WorkloadKind,
    id: &WorkloadId,
    status: WorkloadStatus,
) -> Result<(), ClientError> {
    let mut resource: ExternalResource<S> = load_resource_at(state_dir, kind, id)?;
    resource.status = status;
    save_resource_at(state_dir, kind, &resource)
}

/// Resource id for a `<id>.json` path; `None` for anything else.
fn resource_id(path: &Path) -> Option<WorkloadId> {
    if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
        return None;
    }
    let stem = path.file_stem()?.to_str()?;
    WorkloadId::parse(stem).ok()
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

pub struct LocalSubstrate<S> {
    state_dir: PathBuf,
    kind: WorkloadKind,
    debounce: Duration,
    _spec: PhantomData<fn() -> S>,
}

impl<S: SpecPayload> LocalSubstrate<S> {
    pub fn new(state_dir: impl Into<PathBuf>, kind: WorkloadKind) -> Self {
        Self {
            state_dir: state_dir.into(),
            kind,
            debounce: DEBOUNCE_WINDOW,
            _spec: PhantomData,
        }
    }

    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, ClientError>
    where
        T: Send + 'static,
        F: FnOnce(&Path, WorkloadKind) -> Result<T, ClientError> + Send + 'static,
    {
        let state_dir = self.state_dir.clone();
        let kind = self.kind;
        tokio::task::spawn_blocking(move || f(&state_dir, kind))
            .await
            .map_err(|err| ClientError::Unavailable(format!("background task failed: {err}")))?
    }
}

#[async_trait]
impl<S: SpecPayload> OrchestratorClient<S> for LocalSubstrate<S> {
    async fn get(&self, id: &WorkloadId) -> Result<ExternalResource<S>, ClientError> {
        let id = id.clone();
        self.blocking(move |dir, kind| load_resource_at(dir, kind, &id))
            .await
    }

    async fn list(&self) -> Result<Vec<ExternalResource<S>>, ClientError> {
        self.blocking(|dir, kind| list_resources_at(dir, kind)).await
    }

    async fn create(&self, id: &WorkloadId, spec: &S) -> Result<(), ClientError> {
        let resource = ExternalResource {
            id: id.clone(),
            spec: spec.clone(),
            status: WorkloadStatus::default(),
        };
        self.blocking(move |dir, kind| {
            if resource_path(dir, kind, &resource.id).exists() {
                return Err(ClientError::AlreadyExists { id: resource.id });
            }
            save_resource_at(dir, kind, &resource)
        })
        .await
    }

    async fn update(&self, id: &WorkloadId, spec: &S) -> Result<(), ClientError> {
        let id = id.clone();
        let spec = spec.clone();
        self.blocking(move |dir, kind| {
            let mut resource: ExternalResource<S> = load_resource_at(dir, kind, &id)?;
            resource.spec = spec;
            resource.status = WorkloadStatus::default();
            save_resource_at(dir, kind, &resource)
        })
        .await
    }

    async fn delete(&self, id: &WorkloadId) -> Result<(), ClientError> {
        let id = id.clone();
        self.blocking(move |dir, kind| {
            let path = resource_path(dir, kind, &id);
            match fs::remove_file(&path) {
                Ok(()) => Ok(()),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                    Err(ClientError::NotFound { id })
                }
                Err(err) => Err(client_io(&path, err)),
            }
        })
        .await
    }

    async fn watch(
        &self,
        hook: Arc<dyn ChangeHook>,
        cancel: CancellationToken,
    ) -> Result<(), ClientError> {
        let dir = runtime_kind_dir(&self.state_dir, self.kind);
        fs::create_dir_all(&dir).map_err(|e| client_io(&dir, e))?;
        // FSEvents reports real paths (e.g. /private/var/... on macOS).
        let dir = fs::canonicalize(&dir).unwrap_or(dir);

        let (event_tx, event_rx) = mpsc::unbounded_channel::<notify::Result<Event>>();
        let mut watcher: RecommendedWatcher = recommended_watcher(move |event| {
            let _ = event_tx.send(event);
        })
        .map_err(|err| ClientError::Watch(err.to_string()))?;
        watcher
            .watch(&dir, RecursiveMode::NonRecursive)
            .map_err(|err| ClientError::Watch(err.to_string()))?;

        tracing::info!(kind = %self.kind, dir = %dir.display(), "watching resources");
        tokio::spawn(watch_task(
            watcher,
            event_rx,
            hook,
            Debouncer::new(self.debounce),
            self.kind,
            cancel,
        ));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Watch loop
// ---------------------------------------------------------------------------

async fn watch_task(
    _watcher: RecommendedWatcher,
    mut event_rx: mpsc::UnboundedReceiver<notify::Result<Event>>,
    hook: Arc<dyn ChangeHook>,
    mut debouncer: Debouncer,
    kind: WorkloadKind,
    cancel: CancellationToken,
) {
    loop {
        let next_due = debouncer.next_due();
        tokio::select! {
            _ = cancel.cancelled() => break,
            event = event_rx.recv() => {
                let Some(event) = event else { break };
                let event = match event {
                    Ok(event) => event,
                    Err(err) => {
                        tracing::warn!(kind = %kind, error = %err, "watcher event error");
                        continue;
                    }
                };
                if !is_relevant_event_kind(&event.kind) {
                    continue;
                }
                for path in &event.paths {
                    if let Some(id) = resource_id(path) {
                        debouncer.observe(id, Instant::now());
                    }
                }
            }
            _ = sleep_until_due(next_due) => {
                for id in debouncer.take_due(Instant::now()) {
                    if cancel.is_cancelled() {
                        break;
                    }
                    deliver(hook.as_ref(), kind, id, &cancel).await;
                }
            }
        }
    }
    tracing::debug!(kind = %kind, "resource watch stopped");
}

async fn sleep_until_due(due: Option<Instant>) {
    match due {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}

/// Hand `id` to the hook, retrying with linear backoff.
async fn deliver(
    hook: &dyn ChangeHook,
    kind: WorkloadKind,
    id: WorkloadId,
    cancel: &CancellationToken,
) {
    for attempt in 1..=REDELIVERY_ATTEMPTS {
        match hook.on_change(id.clone()).await {
            Ok(()) => return,
            Err(err) if attempt < REDELIVERY_ATTEMPTS => {
                tracing::warn!(kind = %kind, id = %id, attempt, error = %err, "change hook failed, retrying");
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(REDELIVERY_BACKOFF * attempt) => {}
                }
            }
            Err(err) => {
                tracing::error!(kind = %kind, id = %id, error = %err, "change hook failed, dropping event");
            }
        }
    }
}

fn is_relevant_event_kind(kind: &EventKind) -> bool {
    matches!(kind, EventKind::Create(_) | EventKind::Modify(_))
}

/// Per-resource trailing-edge coalescing: the first event for an id opens a
/// window, later events inside it are absorbed, and the id is released once
/// the window closes. Delivery reads the current document, so nothing is
/// lost by absorbing.
#[derive(Debug)]
struct Debouncer {
    window: Duration,
    pending: HashMap<WorkloadId, Instant>,
}

impl Debouncer {
    fn new(window: Duration) -> Self {
        Self {
            window,
            pending: HashMap::new(),
        }
    }

    fn observe(&mut self, id: WorkloadId, now: Instant) {
        self.pending.entry(id).or_insert(now + self.window);
    }

    fn next_due(&self) -> Option<Instant> {
        self.pending.values().min().copied()
    }

    fn take_due(&mut self, now: Instant) -> Vec<WorkloadId> {
        let mut due: Vec<WorkloadId> = self
            .pending
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();
        due.sort();
        for id in &due {
            self.pending.remove(id);
        }
        due
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetsync_core::{BatchJobSpec, WorkloadState};
    use fleetsync_sync::SyncError;
    use std::sync::Mutex;
    use tempfile::TempDir;
    use tokio::time::advance;

    fn spec(input: &str) -> BatchJobSpec {
        BatchJobSpec {
            service: "scoring".to_string(),
            input_path: input.to_string(),
            output_path: "out/".to_string(),
            ..BatchJobSpec::default()
        }
    }

    #[tokio::test(start_paused = true, flavor = "current_thread")]
    async fn debounce_coalesces_rapid_events() {
        let mut debouncer = Debouncer::new(Duration::from_millis(100));
        let id = WorkloadId::from("b1");
        let mut delivered = 0usize;

        for _ in 0..5 {
            debouncer.observe(id.clone(), Instant::now());
            delivered += debouncer.take_due(Instant::now()).len();
            advance(Duration::from_millis(10)).await;
        }
        assert_eq!(delivered, 0, "nothing is released inside the window");

        advance(Duration::from_millis(150)).await;
        assert_eq!(debouncer.take_due(Instant::now()), vec![id]);
        assert!(debouncer.next_due().is_none());
    }

    #[tokio::test]
    async fn crud_round_trip_on_disk() {
        let dir = TempDir::new().unwrap();
        let substrate = LocalSubstrate::new(dir.path(), WorkloadKind::BatchJob);
        let id = WorkloadId::from("b1");

        substrate.create(&id, &spec("in/")).await.unwrap();
        let err = substrate.create(&id, &spec("in/")).await.unwrap_err();
        assert!(matches!(err, ClientError::AlreadyExists { .. }));

        report_status_at::<BatchJobSpec>(
            dir.path(),
            WorkloadKind::BatchJob,
            &id,
            WorkloadStatus::with_state(WorkloadState::Running),
        )
        .unwrap();
        substrate.update(&id, &spec("in2/")).await.unwrap();
        let resource = substrate.get(&id).await.unwrap();
        assert_eq!(resource.spec.input_path, "in2/");
        assert_eq!(resource.status.state, WorkloadState::Unknown, "update resets status");

        assert_eq!(substrate.list().await.unwrap().len(), 1);
        substrate.delete(&id).await.unwrap();
        assert!(substrate.delete(&id).await.unwrap_err().is_not_found());
        assert!(substrate.list().await.unwrap().is_empty());
    }

    #[test]
    fn list_ignores_tmp_and_foreign_files() {
        let dir = TempDir::new().unwrap();
        let kind_dir = runtime_kind_dir(dir.path(), WorkloadKind::BatchJob);
        fs::create_dir_all(&kind_dir).unwrap();
        fs::write(kind_dir.join("b1.json.tmp"), "{").unwrap();
        fs::write(kind_dir.join("notes.txt"), "hi").unwrap();
        fs::write(kind_dir.join("Bad_Name.json"), "{}").unwrap();

        let resources: Vec<ExternalResource<BatchJobSpec>> =
            list_resources_at(dir.path(), WorkloadKind::BatchJob).unwrap();
        assert!(resources.is_empty());
    }

    #[test]
    fn malformed_document_is_decode_error() {
        let dir = TempDir::new().unwrap();
        let kind_dir = runtime_kind_dir(dir.path(), WorkloadKind::BatchJob);
        fs::create_dir_all(&kind_dir).unwrap();
        fs::write(kind_dir.join("b1.json"), "{ not json").unwrap();

        let err = load_resource_at::<BatchJobSpec>(dir.path(), WorkloadKind::BatchJob, &"b1".into())
            .unwrap_err();
        assert!(matches!(err, ClientError::Decode { .. }));
    }

    struct Recorder {
        seen: Mutex<Vec<WorkloadId>>,
        failures_left: Mutex<u32>,
    }

    #[async_trait]
    impl ChangeHook for Recorder {
        async fn on_change(&self, id: WorkloadId) -> Result<(), SyncError> {
            self.seen.lock().unwrap().push(id.clone());
            let mut left = self.failures_left.lock().unwrap();
            if *left > 0 {
                *left -= 1;
                return Err(ClientError::Unavailable("busy".into()).into());
            }
            Ok(())
        }
    }

    #[tokio::test(start_paused = true, flavor = "current_thread")]
    async fn failing_hook_is_retried_then_dropped() {
        let hook = Recorder {
            seen: Mutex::new(vec![]),
            failures_left: Mutex::new(10),
        };
        let cancel = CancellationToken::new();

        deliver(&hook, WorkloadKind::BatchJob, "b1".into(), &cancel).await;
        assert_eq!(hook.seen.lock().unwrap().len(), REDELIVERY_ATTEMPTS as usize);

        *hook.failures_left.lock().unwrap() = 1;
        hook.seen.lock().unwrap().clear();
        deliver(&hook, WorkloadKind::BatchJob, "b1".into(), &cancel).await;
        assert_eq!(hook.seen.lock().unwrap().len(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn watch_delivers_status_changes() {
        let dir = TempDir::new().unwrap();
        let substrate = LocalSubstrate::<BatchJobSpec>::new(dir.path(), WorkloadKind::BatchJob)
            .with_debounce(Duration::from_millis(20));
        let id = WorkloadId::from("b1");
        substrate.create(&id, &spec("in/")).await.unwrap();

        let hook = Arc::new(Recorder {
            seen: Mutex::new(vec![]),
            failures_left: Mutex::new(0),
        });
        let cancel = CancellationToken::new();
        substrate.watch(hook.clone(), cancel.clone()).await.unwrap();

        report_status_at::<BatchJobSpec>(
            dir.path(),
            WorkloadKind::BatchJob,
            &id,
            WorkloadStatus::with_state(WorkloadState::Succeeded),
        )
        .unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while hook.seen.lock().unwrap().is_empty() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        cancel.cancel();
        assert!(hook.seen.lock().unwrap().contains(&id));
    }
}
