//! # fleetsync-sync
//!
//! Bidirectional reconciliation between stored workload intent and an
//! orchestration substrate.
//!
//! A [`Reconciler`] drives one workload kind through its [`WorkloadAdapter`]:
//! a periodic sweep pushes creates, updates and zombie deletes outward, and a
//! watch-driven event path folds observed status back through the
//! [`OptimisticStatusUpdater`].

pub mod adapter;
pub mod client;
pub mod contracts;
pub mod error;
pub mod memory;
pub mod reconciler;
pub mod status_updater;

pub use adapter::{BatchJobAdapter, DeploymentAdapter, KindAdapter, PackagingAdapter, TrainingAdapter};
pub use client::OrchestratorClient;
pub use contracts::{ChangeHook, ExternalResourceEntity, StorageEntity, WorkloadAdapter};
pub use error::{ClientError, SyncError};
pub use memory::InMemoryOrchestrator;
pub use reconciler::{classify, Reconciler, SweepReport, SyncPlan};
pub use status_updater::{OptimisticStatusUpdater, StatusUpdate};
