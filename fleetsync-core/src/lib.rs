//! fleetsync core library: domain types, content hashing, repositories, config.
//!
//! - [`types`]: workload ids, kinds, specs, records
//! - [`hash`]: canonical content hashing
//! - [`repository`]: the transactional [`Repository`] contract
//! - [`file_store`] / [`memory`]: on-disk and in-process repositories
//! - [`config`]: [`EngineConfig`] loading
//! - [`error`]: [`StoreError`], [`HashError`], [`ConfigError`]

pub mod config;
pub mod error;
pub mod file_store;
pub mod hash;
pub mod memory;
pub mod repository;
pub mod types;

pub use config::{EngineConfig, WorkerToggles};
pub use error::{ConfigError, HashError, StoreError};
pub use file_store::FileRepository;
pub use hash::{content_hash, ContentHash};
pub use memory::InMemoryRepository;
pub use repository::{put_spec, respec, Isolation, Repository, Transaction};
pub use types::{
    BatchJob, BatchJobSpec, Deployment, DeploymentSpec, ExternalResource, Packaging,
    PackagingSpec, SpecPayload, Training, TrainingSpec, Workload, WorkloadId, WorkloadKind,
    WorkloadRecord, WorkloadState, WorkloadStatus,
};
