use std::path::{Path, PathBuf};
use std::time::Duration;

use fleetsync_core::{WorkloadId, WorkloadKind};

/// Quiet period before a burst of file events for one resource is delivered.
pub const DEBOUNCE_WINDOW: Duration = Duration::from_millis(500);

/// Hook delivery attempts per change before the event is dropped.
pub const REDELIVERY_ATTEMPTS: u32 = 3;
/// Base backoff between delivery attempts; grows linearly per attempt.
pub const REDELIVERY_BACKOFF: Duration = Duration::from_millis(200);

pub fn storage_root(state_dir: &Path) -> PathBuf {
    state_dir.join("storage")
}

pub fn runtime_root(state_dir: &Path) -> PathBuf {
    state_dir.join("runtime")
}

pub fn runtime_kind_dir(state_dir: &Path, kind: WorkloadKind) -> PathBuf {
    runtime_root(state_dir).join(kind.as_str())
}

pub fn resource_path(state_dir: &Path, kind: WorkloadKind, id: &WorkloadId) -> PathBuf {
    runtime_kind_dir(state_dir, kind).join(format!("{}.json", id.as_str()))
}
