//! Error types for fleetsync-core.

use std::path::PathBuf;

use thiserror::Error;

use crate::types::WorkloadId;

/// Failure to compute a content hash.
#[derive(Debug, Error)]
pub enum HashError {
    /// The value could not be brought into canonical form.
    #[error("cannot encode value for hashing: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("'{0}' is not a 64-character hex content hash")]
    Malformed(String),
}

/// All errors that can arise from repository operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("entity '{id}' is not found")]
    NotFound { id: WorkloadId },

    #[error("entity '{id}' already exists")]
    AlreadyExists { id: WorkloadId },

    #[error("invalid workload id {id:?}")]
    InvalidId { id: String },

    /// The stored spec no longer matches the caller's snapshot. An expected
    /// optimistic-concurrency outcome, not a fault.
    #[error("entity '{id}' spec was changed")]
    SpecWasTouched { id: WorkloadId },

    #[error("transaction is no longer usable: {0}")]
    Transaction(&'static str),

    #[error("hash error: {0}")]
    Hash(#[from] HashError),

    /// I/O error, with annotated path for context.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse record at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("YAML serialization error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("background task failed: {0}")]
    Join(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }

    pub fn is_spec_was_touched(&self) -> bool {
        matches!(self, StoreError::SpecWasTouched { .. })
    }
}

/// Errors raised while loading or validating [`crate::config::EngineConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("invalid config: {0}")]
    Invalid(String),

    /// `dirs::home_dir()` returned `None`, so `~/.fleetsync/` cannot be located.
    #[error("cannot determine home directory; set $HOME or equivalent")]
    HomeNotFound,
}

/// Convenience constructor for [`StoreError::Io`].
pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> StoreError {
    StoreError::Io {
        path: path.into(),
        source,
    }
}
