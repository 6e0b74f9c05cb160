//! Single-machine filesystem backend.
//!
//! Layout under the base directory:
//! - `state/<job_id>.json` one record per job, written atomically
//! - `files/<job_id>/<file>` output artifacts

use super::{
    ensure_valid_job_id, is_valid_job_id, job_file_path, list_record_files, read_record_file,
    remove_file_and_empty_parent, write_record_file, StateStore, StoreError,
};
use crate::jobs::StateRecord;
use std::fs;
use std::path::{Path, PathBuf};

/// Write-through store on the local filesystem.
#[derive(Debug, Clone)]
pub struct LocalStore {
    state_dir: PathBuf,
    files_dir: PathBuf,
}

impl LocalStore {
    /// Open (and create if needed) a store rooted at `base_dir`.
    pub fn open<P: AsRef<Path>>(base_dir: P) -> Result<Self, StoreError> {
        let base = base_dir.as_ref();
        let state_dir = base.join("state");
        let files_dir = base.join("files");
        fs::create_dir_all(&state_dir)?;
        fs::create_dir_all(&files_dir)?;
        Ok(Self {
            state_dir,
            files_dir,
        })
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    pub fn files_dir(&self) -> &Path {
        &self.files_dir
    }

    fn record_path(&self, job_id: &str) -> PathBuf {
        self.state_dir.join(format!("{}.json", job_id))
    }
}

impl StateStore for LocalStore {
    fn get(&self, job_id: &str) -> Result<Option<StateRecord>, StoreError> {
        if !is_valid_job_id(job_id) {
            return Ok(None);
        }
        read_record_file(&self.record_path(job_id))
    }

    fn set(&self, job_id: &str, record: &StateRecord) -> Result<(), StoreError> {
        ensure_valid_job_id(job_id)?;
        write_record_file(&self.state_dir, &self.record_path(job_id), record)
    }

    fn list_job_ids(&self) -> Result<Vec<String>, StoreError> {
        list_record_files(&self.state_dir)
    }

    fn file_path_for(&self, job_id: &str, file_name: &str) -> Result<PathBuf, StoreError> {
        job_file_path(&self.files_dir, job_id, file_name)
    }

    fn delete_file(&self, path: &Path) -> Result<bool, StoreError> {
        remove_file_and_empty_parent(&self.files_dir, path)
    }

    fn commit(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
