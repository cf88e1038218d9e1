//! File-backed repository.
//!
//! # Storage layout
//!
//! ```text
//! <state_dir>/
//!   storage/
//!     <kind>/
//!       .lock       (advisory writer lock)
//!       <id>.yaml   (one file per record, mode 0600)
//! ```
//!
//! # API pattern
//!
//! The blocking `*_at(root, kind, …)` functions do the file work and are
//! usable directly from tests with a `TempDir`. [`FileRepository`] wraps them
//! behind the async [`Repository`] contract, moving the I/O onto the blocking
//! pool.
//!
//! Writes go to a `.yaml.tmp` sibling first and are renamed into place, so a
//! reader never sees a half-written record. Writers and open transactions
//! serialize on an advisory lock file, `storage/<kind>/.lock`, which holds
//! across processes sharing the state directory. Readers take no lock.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use fs2::FileExt;

use crate::error::{io_err, StoreError};
use crate::hash::{content_hash, ContentHash};
use crate::repository::{respec, Isolation, Repository, Transaction};
use crate::types::{SpecPayload, WorkloadId, WorkloadKind, WorkloadRecord, WorkloadStatus};

// ---------------------------------------------------------------------------
// 1. Path helpers
// ---------------------------------------------------------------------------

const LOCK_FILE: &str = ".lock";

/// `<root>/storage/<kind>/`, no I/O.
pub fn kind_dir_at(root: &Path, kind: WorkloadKind) -> PathBuf {
    root.join("storage").join(kind.as_str())
}

/// `<root>/storage/<kind>/<id>.yaml`, no I/O.
pub fn record_path_at(root: &Path, kind: WorkloadKind, id: &WorkloadId) -> PathBuf {
    kind_dir_at(root, kind).join(format!("{}.yaml", id.0))
}

// ---------------------------------------------------------------------------
// 2. Load
// ---------------------------------------------------------------------------

/// Load a single record.
///
/// Returns `StoreError::NotFound` if absent, `StoreError::Parse` (with path
/// and line context) if the YAML is malformed.
pub fn load_record_at<S: SpecPayload>(
    root: &Path,
    kind: WorkloadKind,
    id: &WorkloadId,
) -> Result<WorkloadRecord<S>, StoreError> {
    let path = record_path_at(root, kind, id);
    let contents = match std::fs::read_to_string(&path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Err(StoreError::NotFound { id: id.clone() });
        }
        Err(err) => return Err(io_err(&path, err)),
    };
    serde_yaml::from_str(&contents).map_err(|e| StoreError::Parse { path, source: e })
}

/// Every record of `kind`, sorted by id. Temporary files are skipped.
pub fn list_records_at<S: SpecPayload>(
    root: &Path,
    kind: WorkloadKind,
) -> Result<Vec<WorkloadRecord<S>>, StoreError> {
    let dir = kind_dir_at(root, kind);
    if !dir.exists() {
        return Ok(vec![]);
    }

    let mut entries: Vec<_> = std::fs::read_dir(&dir)
        .map_err(|e| io_err(&dir, e))?
        .filter_map(|e| e.ok())
        .collect();
    entries.sort_by_key(|e| e.file_name());

    let mut records = Vec::new();
    for entry in entries {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        let Some(stem) = name.strip_suffix(".yaml") else {
            continue;
        };
        let id = WorkloadId::from(stem);
        match load_record_at(root, kind, &id) {
            Ok(record) => records.push(record),
            // Removed between read_dir and read.
            Err(StoreError::NotFound { .. }) => continue,
            Err(err) => return Err(err),
        }
    }
    Ok(records)
}

// ---------------------------------------------------------------------------
// 3. Save (atomic)
// ---------------------------------------------------------------------------

/// Atomically write a record.
///
/// Write flow: serialize → `.yaml.tmp` sibling → `chmod 0600` → `rename`.
pub fn save_record_at<S: SpecPayload>(
    root: &Path,
    kind: WorkloadKind,
    record: &WorkloadRecord<S>,
) -> Result<(), StoreError> {
    ensure_kind_dir(root, kind)?;
    let path = record_path_at(root, kind, &record.id);
    let tmp_path = path.with_file_name(format!("{}.yaml.tmp", record.id.0));

    let yaml = serde_yaml::to_string(record)?;
    std::fs::write(&tmp_path, yaml).map_err(|e| io_err(&tmp_path, e))?;
    set_file_permissions(&tmp_path)?;
    if let Err(e) = std::fs::rename(&tmp_path, &path) {
        if let Err(cleanup) = std::fs::remove_file(&tmp_path) {
            tracing::warn!(path = %tmp_path.display(), error = %cleanup, "failed to remove temporary record");
        }
        return Err(io_err(&path, e));
    }
    Ok(())
}

fn ensure_kind_dir(root: &Path, kind: WorkloadKind) -> Result<(), StoreError> {
    let dir = kind_dir_at(root, kind);
    if !dir.exists() {
        std::fs::create_dir_all(&dir).map_err(|e| io_err(&dir, e))?;
        set_dir_permissions(&dir)?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// 4. Kind lock
// ---------------------------------------------------------------------------

/// `<root>/storage/<kind>/.lock`, no I/O.
pub fn lock_path_at(root: &Path, kind: WorkloadKind) -> PathBuf {
    kind_dir_at(root, kind).join(LOCK_FILE)
}

/// Take the exclusive lock for `kind`, blocking until it is free.
///
/// The lock is advisory and shared by every process using the same root. It
/// is released when the returned handle is dropped.
pub fn lock_kind_at(root: &Path, kind: WorkloadKind) -> Result<KindLock, StoreError> {
    ensure_kind_dir(root, kind)?;
    let path = lock_path_at(root, kind);
    let file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(&path)
        .map_err(|e| io_err(&path, e))?;
    file.lock_exclusive().map_err(|e| io_err(&path, e))?;
    Ok(KindLock { file, path })
}

/// Held exclusive lock on one kind directory.
#[derive(Debug)]
pub struct KindLock {
    file: File,
    path: PathBuf,
}

impl Drop for KindLock {
    fn drop(&mut self) {
        if let Err(err) = FileExt::unlock(&self.file) {
            tracing::warn!(path = %self.path.display(), error = %err, "failed to release store lock");
        }
    }
}

// ---------------------------------------------------------------------------
// 5. Repository
// ---------------------------------------------------------------------------

/// Repository over the `storage/<kind>/` directory.
///
/// Every writer and every open transaction holds the kind lock, so separate
/// processes (daemon, CLI) sharing one root serialize against each other.
pub struct FileRepository<S> {
    root: PathBuf,
    kind: WorkloadKind,
    _spec: PhantomData<fn() -> S>,
}

impl<S: SpecPayload> FileRepository<S> {
    pub fn new(root: impl Into<PathBuf>, kind: WorkloadKind) -> Self {
        Self {
            root: root.into(),
            kind,
            _spec: PhantomData,
        }
    }

    pub fn kind(&self) -> WorkloadKind {
        self.kind
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Path, WorkloadKind) -> Result<T, StoreError> + Send + 'static,
    {
        let root = self.root.clone();
        let kind = self.kind;
        tokio::task::spawn_blocking(move || f(&root, kind))
            .await
            .map_err(|err| StoreError::Join(err.to_string()))?
    }

    /// Run `f` on the blocking pool while holding the kind lock.
    async fn locked<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Path, WorkloadKind) -> Result<T, StoreError> + Send + 'static,
    {
        self.blocking(move |root, kind| {
            let _lock = lock_kind_at(root, kind)?;
            f(root, kind)
        })
        .await
    }
}

#[async_trait]
impl<S: SpecPayload> Repository<S> for FileRepository<S> {
    async fn get(&self, id: &WorkloadId) -> Result<WorkloadRecord<S>, StoreError> {
        let id = WorkloadId::parse(id.as_str())?;
        self.blocking(move |root, kind| load_record_at(root, kind, &id))
            .await
    }

    async fn list(&self) -> Result<Vec<WorkloadRecord<S>>, StoreError> {
        self.blocking(|root, kind| list_records_at(root, kind)).await
    }

    async fn create(&self, record: WorkloadRecord<S>) -> Result<WorkloadRecord<S>, StoreError> {
        WorkloadId::parse(record.id.as_str())?;
        self.locked(move |root, kind| {
            if record_path_at(root, kind, &record.id).exists() {
                return Err(StoreError::AlreadyExists { id: record.id });
            }
            save_record_at(root, kind, &record)?;
            Ok(record)
        })
        .await
    }

    async fn update(&self, record: WorkloadRecord<S>) -> Result<WorkloadRecord<S>, StoreError> {
        WorkloadId::parse(record.id.as_str())?;
        self.locked(move |root, kind| {
            if !record_path_at(root, kind, &record.id).exists() {
                return Err(StoreError::NotFound { id: record.id });
            }
            save_record_at(root, kind, &record)?;
            Ok(record)
        })
        .await
    }

    async fn set_deletion_mark(&self, id: &WorkloadId, value: bool) -> Result<(), StoreError> {
        let id = WorkloadId::parse(id.as_str())?;
        self.locked(move |root, kind| {
            let mut record: WorkloadRecord<S> = load_record_at(root, kind, &id)?;
            record.deletion_mark = value;
            record.updated_at = Utc::now();
            save_record_at(root, kind, &record)
        })
        .await
    }

    async fn begin(&self, _isolation: Isolation) -> Result<Box<dyn Transaction<S>>, StoreError> {
        // Both isolation levels get the same thing: the kind lock, held
        // until commit or rollback.
        let lock = self.blocking(|root, kind| lock_kind_at(root, kind)).await?;
        Ok(Box::new(FileTransaction {
            root: self.root.clone(),
            kind: self.kind,
            read: HashMap::new(),
            staged: Vec::new(),
            _lock: lock,
            _spec: PhantomData,
        }))
    }

    async fn replace_spec(&self, id: WorkloadId, spec: S) -> Result<WorkloadRecord<S>, StoreError> {
        let id = WorkloadId::parse(id.as_str())?;
        self.locked(move |root, kind| {
            let existing = match load_record_at::<S>(root, kind, &id) {
                Ok(record) => Some(record),
                Err(StoreError::NotFound { .. }) => None,
                Err(err) => return Err(err),
            };
            let record = respec(existing.as_ref(), id, spec);
            save_record_at(root, kind, &record)?;
            Ok(record)
        })
        .await
    }
}

struct FileTransaction<S> {
    root: PathBuf,
    kind: WorkloadKind,
    /// Spec hash of every record this transaction has read.
    read: HashMap<WorkloadId, ContentHash>,
    staged: Vec<(WorkloadId, WorkloadStatus)>,
    _lock: KindLock,
    _spec: PhantomData<fn() -> S>,
}

#[async_trait]
impl<S: SpecPayload> Transaction<S> for FileTransaction<S> {
    async fn get(&mut self, id: &WorkloadId) -> Result<WorkloadRecord<S>, StoreError> {
        let id = WorkloadId::parse(id.as_str())?;
        let root = self.root.clone();
        let kind = self.kind;
        let mut record: WorkloadRecord<S> =
            tokio::task::spawn_blocking(move || load_record_at(&root, kind, &id))
                .await
                .map_err(|err| StoreError::Join(err.to_string()))??;
        let hash = content_hash(&record.spec)?;
        self.read.entry(record.id.clone()).or_insert(hash);
        if let Some((_, status)) = self.staged.iter().rev().find(|(sid, _)| *sid == record.id) {
            record.status = status.clone();
        }
        Ok(record)
    }

    async fn update_status(
        &mut self,
        id: &WorkloadId,
        status: WorkloadStatus,
    ) -> Result<(), StoreError> {
        let id = WorkloadId::parse(id.as_str())?;
        if !record_path_at(&self.root, self.kind, &id).exists() {
            return Err(StoreError::NotFound { id });
        }
        self.staged.push((id, status));
        Ok(())
    }

    /// Apply staged statuses. Nothing is written if any record read by this
    /// transaction no longer holds the spec it was read with.
    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let FileTransaction {
            root,
            kind,
            read,
            staged,
            _lock: lock,
            ..
        } = *self;
        if staged.is_empty() {
            return Ok(());
        }
        tokio::task::spawn_blocking(move || {
            let _held = lock;
            let mut updated: Vec<WorkloadRecord<S>> = Vec::with_capacity(staged.len());
            for (id, status) in staged {
                let mut record = match updated.iter().position(|r| r.id == id) {
                    Some(index) => updated.swap_remove(index),
                    None => load_record_at::<S>(&root, kind, &id)?,
                };
                if let Some(seen) = read.get(&id) {
                    if content_hash(&record.spec)? != *seen {
                        return Err(StoreError::SpecWasTouched { id });
                    }
                }
                record.status = status;
                updated.push(record);
            }
            let now = Utc::now();
            for mut record in updated {
                record.updated_at = now;
                save_record_at(&root, kind, &record)?;
            }
            Ok(())
        })
        .await
        .map_err(|err| StoreError::Join(err.to_string()))?
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Private helpers
// ---------------------------------------------------------------------------

#[cfg(unix)]
fn set_dir_permissions(path: &Path) -> Result<(), StoreError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))
        .map_err(|e| io_err(path, e))
}
#[cfg(not(unix))]
fn set_dir_permissions(_path: &Path) -> Result<(), StoreError> {
    Ok(())
}

#[cfg(unix)]
fn set_file_permissions(path: &Path) -> Result<(), StoreError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
        .map_err(|e| io_err(path, e))
}
#[cfg(not(unix))]
fn set_file_permissions(_path: &Path) -> Result<(), StoreError> {
    Ok(())
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{PackagingSpec, WorkloadState};
    use tempfile::TempDir;

    fn spec(artifact: &str) -> PackagingSpec {
        PackagingSpec {
            artifact_name: artifact.to_string(),
            integration: "docker-rest".to_string(),
            ..PackagingSpec::default()
        }
    }

    #[test]
    fn record_path_is_correct() {
        let root = TempDir::new().unwrap();
        let path = record_path_at(root.path(), WorkloadKind::Packaging, &"p1".into());
        assert!(path.ends_with("storage/packaging/p1.yaml"));
    }

    #[test]
    fn save_cleans_up_tmp_and_restricts_mode() {
        let root = TempDir::new().unwrap();
        let record = WorkloadRecord::new("p1".into(), spec("wine.zip"));
        save_record_at(root.path(), WorkloadKind::Packaging, &record).unwrap();

        let path = record_path_at(root.path(), WorkloadKind::Packaging, &record.id);
        assert!(path.exists());
        assert!(!path.with_file_name("p1.yaml.tmp").exists());
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
            assert_eq!(mode, 0o600);
        }
    }

    #[test]
    fn list_skips_tmp_files_and_sorts() {
        let root = TempDir::new().unwrap();
        for id in ["p2", "p1"] {
            save_record_at(
                root.path(),
                WorkloadKind::Packaging,
                &WorkloadRecord::new(id.into(), spec("a.zip")),
            )
            .unwrap();
        }
        let dir = kind_dir_at(root.path(), WorkloadKind::Packaging);
        std::fs::write(dir.join("p3.yaml.tmp"), "partial").unwrap();

        let records: Vec<WorkloadRecord<PackagingSpec>> =
            list_records_at(root.path(), WorkloadKind::Packaging).unwrap();
        let ids: Vec<_> = records.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["p1", "p2"]);
    }

    #[test]
    fn malformed_record_reports_path() {
        let root = TempDir::new().unwrap();
        let dir = kind_dir_at(root.path(), WorkloadKind::Packaging);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("bad.yaml"), "id: [").unwrap();

        let err = load_record_at::<PackagingSpec>(root.path(), WorkloadKind::Packaging, &"bad".into())
            .unwrap_err();
        assert!(matches!(err, StoreError::Parse { .. }));
    }

    #[tokio::test]
    async fn repository_rejects_ids_that_escape_the_directory() {
        let root = TempDir::new().unwrap();
        let repo = FileRepository::<PackagingSpec>::new(root.path(), WorkloadKind::Packaging);
        let err = repo.get(&"../secrets".into()).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidId { .. }));
    }

    #[tokio::test]
    async fn transaction_commits_status_to_disk() {
        let root = TempDir::new().unwrap();
        let repo = FileRepository::new(root.path(), WorkloadKind::Packaging);
        repo.create(WorkloadRecord::new("p1".into(), spec("a.zip")))
            .await
            .unwrap();

        let id = WorkloadId::from("p1");
        let mut tx = repo.begin(Isolation::Serializable).await.unwrap();
        tx.update_status(&id, WorkloadStatus::with_state(WorkloadState::Succeeded))
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let on_disk: WorkloadRecord<PackagingSpec> =
            load_record_at(root.path(), WorkloadKind::Packaging, &id).unwrap();
        assert_eq!(on_disk.status.state, WorkloadState::Succeeded);
    }

    #[tokio::test]
    async fn create_twice_fails_and_mark_persists() {
        let root = TempDir::new().unwrap();
        let repo = FileRepository::new(root.path(), WorkloadKind::Packaging);
        repo.create(WorkloadRecord::new("p1".into(), spec("a.zip")))
            .await
            .unwrap();
        let err = repo
            .create(WorkloadRecord::new("p1".into(), spec("a.zip")))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists { .. }));

        repo.set_deletion_mark(&"p1".into(), true).await.unwrap();
        assert!(repo.get(&"p1".into()).await.unwrap().deletion_mark);
    }
}
