//! Engine configuration.
//!
//! Loaded from YAML at `<home>/.fleetsync/config.yaml` unless an explicit
//! path is given. A missing file yields [`EngineConfig::default`]; every field
//! is optional in the file.
//!
//! ```yaml
//! state_dir: /var/lib/fleetsync
//! sweep_interval_secs: 10
//! shutdown_timeout_secs: 30
//! workers:
//!   batch_job: false
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::types::WorkloadKind;

/// Per-kind worker toggles.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerToggles {
    pub training: bool,
    pub packaging: bool,
    pub deployment: bool,
    pub batch_job: bool,
}

impl Default for WorkerToggles {
    fn default() -> Self {
        Self {
            training: true,
            packaging: true,
            deployment: true,
            batch_job: true,
        }
    }
}

impl WorkerToggles {
    pub fn is_enabled(&self, kind: WorkloadKind) -> bool {
        match kind {
            WorkloadKind::Training => self.training,
            WorkloadKind::Packaging => self.packaging,
            WorkloadKind::Deployment => self.deployment,
            WorkloadKind::BatchJob => self.batch_job,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Root of the local storage and runtime directories. Defaults to
    /// `<home>/.fleetsync` when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_dir: Option<PathBuf>,
    pub sweep_interval_secs: u64,
    pub shutdown_timeout_secs: u64,
    pub shutdown_poll_interval_ms: u64,
    /// Skip starting reconcilers in this process entirely.
    pub disable_workers: bool,
    pub workers: WorkerToggles,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            state_dir: None,
            sweep_interval_secs: 10,
            shutdown_timeout_secs: 30,
            shutdown_poll_interval_ms: 200,
            disable_workers: false,
            workers: WorkerToggles::default(),
        }
    }
}

impl EngineConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub fn shutdown_poll_interval(&self) -> Duration {
        Duration::from_millis(self.shutdown_poll_interval_ms)
    }

    /// Kinds that get a reconciler, honouring `disable_workers`.
    pub fn enabled_kinds(&self) -> Vec<WorkloadKind> {
        if self.disable_workers {
            return vec![];
        }
        WorkloadKind::all()
            .iter()
            .copied()
            .filter(|kind| self.workers.is_enabled(*kind))
            .collect()
    }

    /// Resolved state directory, falling back to `<home>/.fleetsync`.
    pub fn state_dir_at(&self, home: &Path) -> PathBuf {
        self.state_dir
            .clone()
            .unwrap_or_else(|| default_root_at(home))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sweep_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "sweep_interval_secs must be greater than zero".to_string(),
            ));
        }
        if self.shutdown_poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "shutdown_poll_interval_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// `<home>/.fleetsync`
pub fn default_root_at(home: &Path) -> PathBuf {
    home.join(".fleetsync")
}

/// `<home>/.fleetsync/config.yaml`
pub fn default_config_path_at(home: &Path) -> PathBuf {
    default_root_at(home).join("config.yaml")
}

/// Load and validate the config at `path`.
///
/// Returns defaults if the file does not exist.
pub fn load_at(path: &Path) -> Result<EngineConfig, ConfigError> {
    if !path.exists() {
        let config = EngineConfig::default();
        config.validate()?;
        return Ok(config);
    }
    let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
        path: path.to_path_buf(),
        source: e,
    })?;
    let config: EngineConfig =
        serde_yaml::from_str(&contents).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })?;
    config.validate()?;
    Ok(config)
}

/// Load the config from an explicit path, or from the default location under
/// `dirs::home_dir()`.
pub fn load(explicit: Option<&Path>) -> Result<EngineConfig, ConfigError> {
    match explicit {
        Some(path) => load_at(path),
        None => {
            let home = dirs::home_dir().ok_or(ConfigError::HomeNotFound)?;
            load_at(&default_config_path_at(&home))
        }
    }
}
