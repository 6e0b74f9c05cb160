//! State store: per-job state records plus a job-scoped file area.
//!
//! Runner, sweeper and HTTP layer depend only on [`StateStore`]; the concrete
//! backend is picked from configuration by [`open_store`].

pub mod local;
pub mod volume;

pub use local::LocalStore;
pub use volume::VolumeStore;

use crate::config::{StorageBackendKind, StorageConfig};
use crate::jobs::StateRecord;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

/// Error type for state store operations
#[derive(Debug, Error)]
pub enum StoreError {
    /// Job id cannot be used as a storage key
    #[error("Invalid job id: {0:?}")]
    InvalidJobId(String),

    /// Failed to encode or decode a record
    #[error("Malformed state record: {0}")]
    Serde(#[from] serde_json::Error),

    /// IO error in the backing storage
    #[error("Storage IO error: {0}")]
    Io(#[from] io::Error),
}

/// Shared handle to a store backend.
pub type SharedStore = Arc<dyn StateStore>;

/// Capability set every backend provides.
///
/// `set` is a full overwrite of a single key; there is no multi-key or
/// read-modify-write transaction. Use [`update_record`] for partial updates.
pub trait StateStore: Send + Sync {
    /// Record for `job_id`, or `None` when the job is unknown.
    fn get(&self, job_id: &str) -> Result<Option<StateRecord>, StoreError>;

    /// Replace the record for `job_id`.
    fn set(&self, job_id: &str, record: &StateRecord) -> Result<(), StoreError>;

    /// Known job ids, unordered. May or may not include concurrent inserts.
    fn list_job_ids(&self) -> Result<Vec<String>, StoreError>;

    /// Path for an artifact of `job_id`, creating its container if needed.
    fn file_path_for(&self, job_id: &str, file_name: &str) -> Result<PathBuf, StoreError>;

    fn file_exists(&self, path: &Path) -> bool {
        path.is_file()
    }

    /// Delete a file and its job container once empty.
    ///
    /// Returns whether a file was removed; a missing path is `Ok(false)`.
    fn delete_file(&self, path: &Path) -> Result<bool, StoreError>;

    /// Flush buffered writes. No-op for write-through backends.
    fn commit(&self) -> Result<(), StoreError>;
}

/// Read-modify-write a record.
///
/// Returns the updated record, or `None` if the job is unknown (nothing is written).
pub fn update_record<F>(
    store: &dyn StateStore,
    job_id: &str,
    mutate: F,
) -> Result<Option<StateRecord>, StoreError>
where
    F: FnOnce(&mut StateRecord),
{
    let Some(mut record) = store.get(job_id)? else {
        return Ok(None);
    };
    mutate(&mut record);
    store.set(job_id, &record)?;
    Ok(Some(record))
}

/// Open the backend selected by configuration.
pub fn open_store(cfg: &StorageConfig) -> Result<SharedStore, StoreError> {
    let store: SharedStore = match cfg.backend {
        StorageBackendKind::Local => Arc::new(LocalStore::open(&cfg.base_dir)?),
        StorageBackendKind::Volume => Arc::new(VolumeStore::open(&cfg.volume_path)?),
    };
    Ok(store)
}

/// Job ids double as file and directory names.
pub(crate) fn is_valid_job_id(job_id: &str) -> bool {
    !job_id.is_empty()
        && !job_id.starts_with('.')
        && job_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

pub(crate) fn ensure_valid_job_id(job_id: &str) -> Result<(), StoreError> {
    if is_valid_job_id(job_id) {
        Ok(())
    } else {
        Err(StoreError::InvalidJobId(job_id.to_string()))
    }
}

/// Read one `<id>.json` record file; a missing file is `None`.
pub(crate) fn read_record_file(path: &Path) -> Result<Option<StateRecord>, StoreError> {
    match fs::read_to_string(path) {
        Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Write a record file atomically (temp file in the same directory, then rename).
pub(crate) fn write_record_file(dir: &Path, path: &Path, record: &StateRecord) -> Result<(), StoreError> {
    let json = serde_json::to_vec(record)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(&json)?;
    tmp.persist(path).map_err(|e| StoreError::Io(e.error))?;
    Ok(())
}

/// Job ids of all `*.json` files in `dir`.
pub(crate) fn list_record_files(dir: &Path) -> Result<Vec<String>, StoreError> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut ids = Vec::new();
    for entry in entries {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
            if is_valid_job_id(stem) {
                ids.push(stem.to_string());
            }
        }
    }
    Ok(ids)
}

/// Create `<root>/<job_id>/` and return `<root>/<job_id>/<file_name>`.
pub(crate) fn job_file_path(root: &Path, job_id: &str, file_name: &str) -> Result<PathBuf, StoreError> {
    ensure_valid_job_id(job_id)?;
    let name_ok = !file_name.is_empty()
        && Path::new(file_name).file_name().and_then(|n| n.to_str()) == Some(file_name);
    if !name_ok {
        return Err(StoreError::Io(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("invalid artifact name {:?}", file_name),
        )));
    }
    let job_dir = root.join(job_id);
    fs::create_dir_all(&job_dir)?;
    Ok(job_dir.join(file_name))
}

/// Remove `path` if present, then its parent directory if that is now empty.
///
/// `root` itself is never removed. A file that vanished concurrently counts as
/// already deleted.
pub(crate) fn remove_file_and_empty_parent(root: &Path, path: &Path) -> Result<bool, StoreError> {
    if !path.is_file() {
        return Ok(false);
    }
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e.into()),
    }

    if let Some(parent) = path.parent() {
        if parent != root && parent.starts_with(root) {
            let is_empty = fs::read_dir(parent)
                .map(|mut entries| entries.next().is_none())
                .unwrap_or(false);
            if is_empty {
                // Another writer may have raced us; a non-empty or missing dir is fine.
                let _ = fs::remove_dir(parent);
            }
        }
    }
    Ok(true)
}
