//! Error types for fleetsync-sync.

use std::path::PathBuf;

use thiserror::Error;

use fleetsync_core::{HashError, StoreError, WorkloadId, WorkloadKind};

/// Errors reported by an orchestration substrate client.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("resource '{id}' is not found")]
    NotFound { id: WorkloadId },

    #[error("resource '{id}' already exists")]
    AlreadyExists { id: WorkloadId },

    /// The substrate could not be reached or refused the call. Retryable.
    #[error("orchestrator unavailable: {0}")]
    Unavailable(String),

    /// The change watch could not be established.
    #[error("cannot watch resources: {0}")]
    Watch(String),

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed resource at {path}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl ClientError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ClientError::NotFound { .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, ClientError::AlreadyExists { .. })
    }
}

/// All errors that can arise from reconciliation.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    #[error("hash error: {0}")]
    Hash(#[from] HashError),

    #[error("orchestrator error: {0}")]
    Client(#[from] ClientError),

    /// The event path could not be registered. Fatal for the worker.
    #[error("cannot register {kind} change hook: {source}")]
    Attach {
        kind: WorkloadKind,
        #[source]
        source: ClientError,
    },
}

impl SyncError {
    /// True when a status write was discarded because the stored spec moved
    /// on. Expected under concurrent edits.
    pub fn is_spec_was_touched(&self) -> bool {
        matches!(self, SyncError::Store(err) if err.is_spec_was_touched())
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            SyncError::Store(err) => err.is_not_found(),
            SyncError::Client(err) => err.is_not_found(),
            _ => false,
        }
    }
}
