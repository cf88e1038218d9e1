//! Domain types for workload records and their external mirrors.
//!
//! Storage records and external resources share the same spec types per
//! workload kind, so a spec hash computed on either side is directly
//! comparable.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

// ---------------------------------------------------------------------------
// Newtypes
// ---------------------------------------------------------------------------

/// Unique, immutable identifier of a workload within its kind.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct WorkloadId(pub String);

impl WorkloadId {
    /// Maximum accepted identifier length (DNS label limit).
    pub const MAX_LEN: usize = 63;

    /// Parse and validate an identifier.
    ///
    /// Accepts 1–63 characters of lowercase ASCII alphanumerics and `-`,
    /// starting and ending with an alphanumeric. Identifiers become file names
    /// and orchestration resource names, so anything else is rejected.
    pub fn parse(raw: &str) -> Result<Self, StoreError> {
        let invalid = || StoreError::InvalidId { id: raw.to_owned() };
        if raw.is_empty() || raw.len() > Self::MAX_LEN {
            return Err(invalid());
        }
        let allowed = |c: char| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-';
        if !raw.chars().all(allowed) || raw.starts_with('-') || raw.ends_with('-') {
            return Err(invalid());
        }
        Ok(Self(raw.to_owned()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkloadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for WorkloadId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for WorkloadId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// The workload kinds reconciled by the engine. Each kind is reconciled
/// independently by its own worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkloadKind {
    Training,
    Packaging,
    Deployment,
    BatchJob,
}

impl WorkloadKind {
    /// Every kind, in a stable order.
    pub fn all() -> &'static [WorkloadKind] {
        &[
            WorkloadKind::Training,
            WorkloadKind::Packaging,
            WorkloadKind::Deployment,
            WorkloadKind::BatchJob,
        ]
    }

    /// Directory / label form of the kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkloadKind::Training => "training",
            WorkloadKind::Packaging => "packaging",
            WorkloadKind::Deployment => "deployment",
            WorkloadKind::BatchJob => "batch_job",
        }
    }
}

impl fmt::Display for WorkloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkloadKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "training" => Ok(WorkloadKind::Training),
            "packaging" => Ok(WorkloadKind::Packaging),
            "deployment" => Ok(WorkloadKind::Deployment),
            "batch_job" | "batch" => Ok(WorkloadKind::BatchJob),
            other => Err(format!(
                "unknown workload kind '{other}'; expected: training, packaging, deployment, batch_job"
            )),
        }
    }
}

/// Observed execution state of a workload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum WorkloadState {
    #[default]
    Unknown,
    Scheduling,
    Running,
    Succeeded,
    Failed,
}

impl fmt::Display for WorkloadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkloadState::Unknown => write!(f, "unknown"),
            WorkloadState::Scheduling => write!(f, "scheduling"),
            WorkloadState::Running => write!(f, "running"),
            WorkloadState::Succeeded => write!(f, "succeeded"),
            WorkloadState::Failed => write!(f, "failed"),
        }
    }
}

impl FromStr for WorkloadState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "unknown" => Ok(WorkloadState::Unknown),
            "scheduling" => Ok(WorkloadState::Scheduling),
            "running" => Ok(WorkloadState::Running),
            "succeeded" => Ok(WorkloadState::Succeeded),
            "failed" => Ok(WorkloadState::Failed),
            other => Err(format!(
                "unknown workload state '{other}'; expected: unknown, scheduling, running, succeeded, failed"
            )),
        }
    }
}

// ---------------------------------------------------------------------------
// Specs
// ---------------------------------------------------------------------------

/// Bounds every spec payload must satisfy to flow through the engine.
pub trait SpecPayload:
    Serialize + DeserializeOwned + Clone + fmt::Debug + PartialEq + Send + Sync + 'static
{
}

impl<T> SpecPayload for T where
    T: Serialize + DeserializeOwned + Clone + fmt::Debug + PartialEq + Send + Sync + 'static
{
}

/// Binds a workload kind to its spec type.
pub trait Workload: Send + Sync + 'static {
    const KIND: WorkloadKind;
    type Spec: SpecPayload;
}

/// Name/version pair identifying a trained model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ModelIdentity {
    pub name: String,
    pub version: String,
}

/// Resource requests for a workload container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Resources {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gpu: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct TrainingSpec {
    pub model: ModelIdentity,
    pub toolchain: String,
    pub entrypoint: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub hyper_parameters: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default)]
    pub resources: Resources,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct PackagingSpec {
    pub artifact_name: String,
    pub integration: String,
    #[serde(default)]
    pub targets: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default)]
    pub resources: Resources,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentSpec {
    pub image: String,
    pub predictor: String,
    #[serde(default = "default_min_replicas")]
    pub min_replicas: u32,
    #[serde(default = "default_max_replicas")]
    pub max_replicas: u32,
    #[serde(default)]
    pub resources: Resources,
}

fn default_min_replicas() -> u32 {
    1
}

fn default_max_replicas() -> u32 {
    1
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct BatchJobSpec {
    pub service: String,
    pub input_path: String,
    pub output_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_path: Option<String>,
    #[serde(default)]
    pub resources: Resources,
}

/// Marker types binding each kind to its spec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Training;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Packaging;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deployment;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchJob;

impl Workload for Training {
    const KIND: WorkloadKind = WorkloadKind::Training;
    type Spec = TrainingSpec;
}

impl Workload for Packaging {
    const KIND: WorkloadKind = WorkloadKind::Packaging;
    type Spec = PackagingSpec;
}

impl Workload for Deployment {
    const KIND: WorkloadKind = WorkloadKind::Deployment;
    type Spec = DeploymentSpec;
}

impl Workload for BatchJob {
    const KIND: WorkloadKind = WorkloadKind::BatchJob;
    type Spec = BatchJobSpec;
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// Last known observed outcome of a workload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct WorkloadStatus {
    #[serde(default)]
    pub state: WorkloadState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pod_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl WorkloadStatus {
    pub fn with_state(state: WorkloadState) -> Self {
        Self {
            state,
            ..Self::default()
        }
    }
}

/// Stored, user-intent representation of a workload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound = "S: SpecPayload")]
pub struct WorkloadRecord<S> {
    pub id: WorkloadId,
    pub spec: S,
    #[serde(default)]
    pub status: WorkloadStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub deletion_mark: bool,
}

impl<S: SpecPayload> WorkloadRecord<S> {
    /// New record with fresh timestamps and an `unknown` status.
    pub fn new(id: WorkloadId, spec: S) -> Self {
        let now = Utc::now();
        Self {
            id,
            spec,
            status: WorkloadStatus::default(),
            created_at: now,
            updated_at: now,
            deletion_mark: false,
        }
    }
}

/// Live representation of a workload in the orchestration substrate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound = "S: SpecPayload")]
pub struct ExternalResource<S> {
    pub id: WorkloadId,
    pub spec: S,
    #[serde(default)]
    pub status: WorkloadStatus,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("t1")]
    #[case("wine-12-train")]
    #[case(&"x".repeat(63))]
    fn workload_id_accepts_dns_labels(#[case] raw: &str) {
        assert!(WorkloadId::parse(raw).is_ok(), "{raw:?} should be accepted");
    }

    #[rstest]
    #[case("")]
    #[case("-a")]
    #[case("a-")]
    #[case("A1")]
    #[case("../etc")]
    #[case("a/b")]
    #[case("a.b")]
    #[case(".lock")]
    #[case(&"x".repeat(64))]
    fn workload_id_rejects_paths_and_uppercase(#[case] raw: &str) {
        assert!(
            matches!(WorkloadId::parse(raw), Err(StoreError::InvalidId { .. })),
            "{raw:?} should be rejected"
        );
    }

    #[test]
    fn kind_parses_aliases() {
        assert_eq!("batch-job".parse::<WorkloadKind>(), Ok(WorkloadKind::BatchJob));
        assert_eq!("Training".parse::<WorkloadKind>(), Ok(WorkloadKind::Training));
        assert!("route".parse::<WorkloadKind>().is_err());
    }

    #[test]
    fn kind_display_matches_directory_name() {
        assert_eq!(WorkloadKind::BatchJob.to_string(), "batch_job");
        assert_eq!(WorkloadKind::all().len(), 4);
    }

    #[test]
    fn record_defaults_fill_missing_status_and_mark() {
        let yaml = r#"
id: t1
spec:
  image: registry/model:1
  predictor: mlflow
created_at: 2024-01-01T00:00:00Z
updated_at: 2024-01-01T00:00:00Z
"#;
        let record: WorkloadRecord<DeploymentSpec> = serde_yaml::from_str(yaml).expect("parse");
        assert_eq!(record.status.state, WorkloadState::Unknown);
        assert!(!record.deletion_mark);
        assert_eq!(record.spec.min_replicas, 1);
    }
}
