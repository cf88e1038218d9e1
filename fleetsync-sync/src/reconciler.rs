//! Per-kind reconciliation worker.
//!
//! Two paths converge storage and the substrate:
//!
//! - **event path** (`storage <- service`): the substrate watch reports a
//!   changed resource id; the resource is fetched and its status folded into
//!   storage. Never creates or deletes anything.
//! - **sweep path** (`storage -> service`): on a fixed interval both sides are
//!   listed, [`classify`]-ed, and the resulting creates, updates and zombie
//!   deletes are pushed to the substrate.
//!
//! Per-entity failures are logged and counted; the next sweep re-classifies
//! from scratch, so nothing is retried in place.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use fleetsync_core::{ContentHash, WorkloadId, WorkloadKind};

use crate::contracts::{ChangeHook, ExternalResourceEntity, StorageEntity, WorkloadAdapter};
use crate::error::SyncError;

// ---------------------------------------------------------------------------
// Classification
// ---------------------------------------------------------------------------

/// Which side of the sync an entity came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Storage,
    External,
}

/// An entity left out of this round because its hash could not be computed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedEntity {
    pub id: WorkloadId,
    pub side: Side,
    pub reason: String,
}

/// Actions one sweep would take. Every id list is sorted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncPlan {
    /// Stored, unmarked, no external resource.
    pub create: Vec<WorkloadId>,
    /// Spec hashes differ.
    pub update: Vec<WorkloadId>,
    /// Zombies: external resources without unmarked stored intent.
    pub delete: Vec<WorkloadId>,
    pub unchanged: Vec<WorkloadId>,
    pub skipped: Vec<SkippedEntity>,
}

impl SyncPlan {
    /// True when the sweep would push nothing.
    pub fn is_noop(&self) -> bool {
        self.create.is_empty() && self.update.is_empty() && self.delete.is_empty()
    }
}

/// Classify both sides of one kind into a [`SyncPlan`].
///
/// Deletion-marked records carry no intent. An external resource whose hash
/// fails is skipped, and so is the record paired with it; a record whose
/// hash fails still claims its id, so its resource is never taken for a
/// zombie.
pub fn classify(
    storage: &[Box<dyn StorageEntity>],
    external: &[Box<dyn ExternalResourceEntity>],
) -> SyncPlan {
    let mut plan = SyncPlan::default();

    let intent: HashSet<&WorkloadId> = storage
        .iter()
        .filter(|entity| !entity.has_deletion_mark())
        .map(|entity| entity.id())
        .collect();

    let mut external_hashes: HashMap<&WorkloadId, Option<ContentHash>> = HashMap::new();
    for entity in external {
        let id = entity.id();
        if !intent.contains(id) {
            plan.delete.push(id.clone());
            continue;
        }
        match entity.spec_hash() {
            Ok(hash) => {
                external_hashes.insert(id, Some(hash));
            }
            Err(err) => {
                plan.skipped.push(SkippedEntity {
                    id: id.clone(),
                    side: Side::External,
                    reason: err.to_string(),
                });
                external_hashes.insert(id, None);
            }
        }
    }

    for entity in storage.iter().filter(|e| !e.has_deletion_mark()) {
        let id = entity.id();
        match external_hashes.get(id) {
            None => plan.create.push(id.clone()),
            // Already recorded as skipped on the external side.
            Some(None) => {}
            Some(Some(external_hash)) => match entity.spec_hash() {
                Ok(hash) if &hash == external_hash => plan.unchanged.push(id.clone()),
                Ok(_) => plan.update.push(id.clone()),
                Err(err) => plan.skipped.push(SkippedEntity {
                    id: id.clone(),
                    side: Side::Storage,
                    reason: err.to_string(),
                }),
            },
        }
    }

    plan.create.sort();
    plan.update.sort();
    plan.delete.sort();
    plan.unchanged.sort();
    plan.skipped.sort_by(|a, b| a.id.cmp(&b.id));
    plan
}

// ---------------------------------------------------------------------------
// Sweep report
// ---------------------------------------------------------------------------

/// Counts from one executed sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
    pub unchanged: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl SweepReport {
    /// True when the sweep did or attempted nothing worth reporting.
    pub fn is_quiet(&self) -> bool {
        self.created + self.updated + self.deleted + self.skipped + self.failed == 0
    }
}

impl fmt::Display for SweepReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "created={} updated={} deleted={} unchanged={} skipped={} failed={}",
            self.created, self.updated, self.deleted, self.unchanged, self.skipped, self.failed
        )
    }
}

// ---------------------------------------------------------------------------
// Reconciler
// ---------------------------------------------------------------------------

pub struct Reconciler {
    adapter: Arc<dyn WorkloadAdapter>,
    interval: Duration,
    name: String,
}

impl Reconciler {
    pub fn new(adapter: Arc<dyn WorkloadAdapter>, interval: Duration) -> Self {
        let name = format!("{}-worker", adapter.kind());
        Self {
            adapter,
            interval,
            name,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> WorkloadKind {
        self.adapter.kind()
    }

    /// Compute the plan for the current state without acting on it.
    pub async fn plan(&self) -> Result<SyncPlan, SyncError> {
        let storage = self.adapter.list_storage().await?;
        let external = self.adapter.list_external().await?;
        Ok(classify(&storage, &external))
    }

    /// One full sweep. Listing failures abort the round; per-entity failures
    /// are counted in the report.
    pub async fn sweep(&self) -> Result<SweepReport, SyncError> {
        let storage = self.adapter.list_storage().await?;
        let external = self.adapter.list_external().await?;
        let plan = classify(&storage, &external);

        let mut report = SweepReport {
            unchanged: plan.unchanged.len(),
            skipped: plan.skipped.len(),
            ..SweepReport::default()
        };

        for skipped in &plan.skipped {
            tracing::warn!(
                worker = %self.name,
                id = %skipped.id,
                side = ?skipped.side,
                reason = %skipped.reason,
                "cannot hash entity, skipping this round"
            );
        }

        let by_id: HashMap<&WorkloadId, &dyn StorageEntity> =
            storage.iter().map(|e| (e.id(), e.as_ref())).collect();
        let zombies: HashMap<&WorkloadId, &dyn ExternalResourceEntity> =
            external.iter().map(|e| (e.id(), e.as_ref())).collect();

        for id in &plan.create {
            let Some(entity) = by_id.get(id) else { continue };
            match entity.create_in_service().await {
                Ok(()) => {
                    report.created += 1;
                    tracing::info!(worker = %self.name, id = %id, flow = "storage -> service", "created");
                }
                Err(err) => {
                    report.failed += 1;
                    tracing::warn!(worker = %self.name, id = %id, error = %err, "create failed");
                }
            }
        }

        for id in &plan.update {
            let Some(entity) = by_id.get(id) else { continue };
            match entity.update_in_service().await {
                Ok(()) => {
                    report.updated += 1;
                    tracing::info!(worker = %self.name, id = %id, flow = "storage -> service", "updated");
                }
                Err(err) => {
                    report.failed += 1;
                    tracing::warn!(worker = %self.name, id = %id, error = %err, "update failed");
                }
            }
        }

        for id in &plan.delete {
            let Some(entity) = zombies.get(id) else { continue };
            match entity.delete_in_service().await {
                Ok(()) => {
                    report.deleted += 1;
                    tracing::info!(worker = %self.name, id = %id, flow = "storage -> service", "zombie deleted");
                }
                Err(err) => {
                    report.failed += 1;
                    tracing::warn!(worker = %self.name, id = %id, error = %err, "zombie delete failed");
                }
            }
        }

        Ok(report)
    }

    /// Event path for a single resource id.
    pub async fn handle_event(&self, id: &WorkloadId) -> Result<(), SyncError> {
        fold_status(self.adapter.as_ref(), &self.name, id).await
    }

    /// Register the event path, then sweep on every tick until `cancel`
    /// fires. The first sweep runs immediately. An in-flight sweep is
    /// abandoned on cancellation.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), SyncError> {
        let hook = Arc::new(EventHook {
            adapter: Arc::clone(&self.adapter),
            worker: self.name.clone(),
            cancel: cancel.clone(),
        });
        self.adapter.attach(hook, cancel.clone()).await?;

        tracing::info!(
            worker = %self.name,
            interval_ms = self.interval.as_millis() as u64,
            "worker started"
        );

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                result = self.sweep() => match result {
                    Ok(report) if report.is_quiet() => {
                        tracing::debug!(worker = %self.name, %report, "sweep finished");
                    }
                    Ok(report) => {
                        tracing::info!(worker = %self.name, %report, "sweep finished");
                    }
                    Err(err) => {
                        tracing::warn!(worker = %self.name, error = %err, "sweep failed, retrying next tick");
                    }
                },
            }
        }

        tracing::info!(worker = %self.name, "worker stopped");
        Ok(())
    }
}

struct EventHook {
    adapter: Arc<dyn WorkloadAdapter>,
    worker: String,
    cancel: CancellationToken,
}

#[async_trait]
impl ChangeHook for EventHook {
    async fn on_change(&self, id: WorkloadId) -> Result<(), SyncError> {
        if self.cancel.is_cancelled() {
            return Ok(());
        }
        fold_status(self.adapter.as_ref(), &self.worker, &id).await
    }
}

async fn fold_status(
    adapter: &dyn WorkloadAdapter,
    worker: &str,
    id: &WorkloadId,
) -> Result<(), SyncError> {
    let entity = adapter.get_external(id).await?;
    match entity.save_result_in_storage().await {
        Ok(()) => Ok(()),
        Err(err) if err.is_spec_was_touched() => {
            tracing::debug!(worker, id = %id, "status is for an outdated spec, discarded");
            Ok(())
        }
        Err(err) => {
            tracing::warn!(worker, id = %id, error = %err, "cannot save status");
            Err(err)
        }
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
