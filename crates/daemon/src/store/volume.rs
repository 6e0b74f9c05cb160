//! Shared-volume backend for jobs spread across machines.
//!
//! Records are buffered in memory on `set` (immediately visible to this
//! process) and published to `<volume>/.state/<job_id>.json` on `commit`, one
//! atomic rename per key. Reads prefer this process's pending writes and fall
//! back to the published file, so progress written by a remote runner becomes
//! visible once that runner commits. Artifacts live at `<volume>/<job_id>/<file>`.

use super::{
    ensure_valid_job_id, is_valid_job_id, job_file_path, list_record_files, read_record_file,
    remove_file_and_empty_parent, write_record_file, StateStore, StoreError,
};
use crate::jobs::StateRecord;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

const STATE_DIR_NAME: &str = ".state";

/// Store with deferred persistence on a mounted volume.
#[derive(Debug)]
pub struct VolumeStore {
    root: PathBuf,
    state_dir: PathBuf,
    pending: Mutex<HashMap<String, StateRecord>>,
    /// Serializes publishing so an older snapshot never lands after a newer one.
    commit_lock: Mutex<()>,
}

impl VolumeStore {
    pub fn open<P: AsRef<Path>>(volume_path: P) -> Result<Self, StoreError> {
        let root = volume_path.as_ref().to_path_buf();
        let state_dir = root.join(STATE_DIR_NAME);
        fs::create_dir_all(&state_dir)?;
        Ok(Self {
            root,
            state_dir,
            pending: Mutex::new(HashMap::new()),
            commit_lock: Mutex::new(()),
        })
    }

    /// Number of writes not yet published.
    #[cfg(test)]
    pub fn pending_len(&self) -> usize {
        self.lock_pending().len()
    }

    fn record_path(&self, job_id: &str) -> PathBuf {
        self.state_dir.join(format!("{}.json", job_id))
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, HashMap<String, StateRecord>> {
        // A panic while holding the lock cannot leave a map entry half-written.
        self.pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl StateStore for VolumeStore {
    fn get(&self, job_id: &str) -> Result<Option<StateRecord>, StoreError> {
        if !is_valid_job_id(job_id) {
            return Ok(None);
        }
        if let Some(record) = self.lock_pending().get(job_id) {
            return Ok(Some(record.clone()));
        }
        read_record_file(&self.record_path(job_id))
    }

    fn set(&self, job_id: &str, record: &StateRecord) -> Result<(), StoreError> {
        ensure_valid_job_id(job_id)?;
        self.lock_pending().insert(job_id.to_string(), record.clone());
        Ok(())
    }

    fn list_job_ids(&self) -> Result<Vec<String>, StoreError> {
        let mut ids: HashSet<String> = list_record_files(&self.state_dir)?.into_iter().collect();
        ids.extend(self.lock_pending().keys().cloned());
        Ok(ids.into_iter().collect())
    }

    fn file_path_for(&self, job_id: &str, file_name: &str) -> Result<PathBuf, StoreError> {
        job_file_path(&self.root, job_id, file_name)
    }

    fn delete_file(&self, path: &Path) -> Result<bool, StoreError> {
        remove_file_and_empty_parent(&self.root, path)
    }

    fn commit(&self) -> Result<(), StoreError> {
        let _publishing = self.commit_lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        // Entries stay pending until their file is written so reads never fall
        // back to an older published record.
        let batch: Vec<(String, StateRecord)> = self
            .lock_pending()
            .iter()
            .map(|(id, record)| (id.clone(), record.clone()))
            .collect();
        let mut first_error = None;

        for (job_id, record) in batch {
            match write_record_file(&self.state_dir, &self.record_path(&job_id), &record) {
                Ok(()) => {
                    let mut pending = self.lock_pending();
                    // A newer write for this key stays queued for the next commit.
                    if pending.get(&job_id) == Some(&record) {
                        pending.remove(&job_id);
                    }
                }
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::JobStatus;
    use tempfile::TempDir;

    #[test]
    fn test_writes_visible_locally_before_commit() {
        let dir = TempDir::new().unwrap();
        let store = VolumeStore::open(dir.path()).unwrap();

        store.set("job", &StateRecord::queued(1)).unwrap();
        assert_eq!(store.get("job").unwrap(), Some(StateRecord::queued(1)));
        assert_eq!(store.pending_len(), 1);
        assert!(!dir.path().join(".state/job.json").exists());
        assert_eq!(store.list_job_ids().unwrap(), vec!["job".to_string()]);
    }

    #[test]
    fn test_commit_publishes_to_other_instances() {
        let dir = TempDir::new().unwrap();
        let writer = VolumeStore::open(dir.path()).unwrap();
        let reader = VolumeStore::open(dir.path()).unwrap();

        let mut record = StateRecord::queued(1);
        writer.set("job", &record).unwrap();
        assert_eq!(reader.get("job").unwrap(), None);

        writer.commit().unwrap();
        assert_eq!(writer.pending_len(), 0);
        assert_eq!(reader.get("job").unwrap(), Some(record.clone()));

        record.status = JobStatus::Downloading;
        writer.set("job", &record).unwrap();
        writer.commit().unwrap();
        assert_eq!(reader.get("job").unwrap().unwrap().status, JobStatus::Downloading);
        assert_eq!(reader.list_job_ids().unwrap(), vec!["job".to_string()]);
    }

    #[test]
    fn test_pending_write_wins_over_published() {
        let dir = TempDir::new().unwrap();
        let store = VolumeStore::open(dir.path()).unwrap();
        store.set("job", &StateRecord::queued(1)).unwrap();
        store.commit().unwrap();

        let mut newer = StateRecord::queued(1);
        newer.message = "newer".to_string();
        store.set("job", &newer).unwrap();
        assert_eq!(store.get("job").unwrap().unwrap().message, "newer");
    }

    #[test]
    fn test_artifacts_live_beside_state() {
        let dir = TempDir::new().unwrap();
        let store = VolumeStore::open(dir.path()).unwrap();

        let path = store.file_path_for("job", "output.webm").unwrap();
        assert_eq!(path, dir.path().join("job").join("output.webm"));
        fs::write(&path, b"x").unwrap();

        assert!(store.delete_file(&path).unwrap());
        assert!(!dir.path().join("job").exists());
        assert!(!store.delete_file(&path).unwrap());
        assert!(dir.path().join(STATE_DIR_NAME).is_dir());
    }

    #[test]
    fn test_concurrent_commits_never_publish_stale_records() {
        use std::sync::atomic::{AtomicBool, Ordering};
        use std::sync::Arc;

        let dir = TempDir::new().unwrap();
        let store = Arc::new(VolumeStore::open(dir.path()).unwrap());
        let stop = Arc::new(AtomicBool::new(false));

        let other = {
            let store = store.clone();
            let stop = stop.clone();
            std::thread::spawn(move || {
                let mut n = 0u64;
                while !stop.load(Ordering::Relaxed) {
                    n += 1;
                    store.set("other", &StateRecord::queued(n as i64)).unwrap();
                    store.commit().unwrap();
                }
            })
        };

        for round in 0..100 {
            let job_id = format!("job-{}", round);
            let mut record = StateRecord::queued(1);
            store.set(&job_id, &record).unwrap();
            store.commit().unwrap();
            assert!(store.get(&job_id).unwrap().is_some());

            assert!(record.begin_download());
            assert!(record.begin_encoding());
            for percent in 0..50u8 {
                record.record_progress(percent);
                store.set(&job_id, &record).unwrap();
                store.commit().unwrap();
                assert!(store.get(&job_id).unwrap().is_some());
            }
            assert!(record.complete(dir.path().join("out.mp4"), "output.mp4".to_string()));
            store.set(&job_id, &record).unwrap();
            store.commit().unwrap();
        }

        stop.store(true, Ordering::Relaxed);
        other.join().unwrap();

        let reader = VolumeStore::open(dir.path()).unwrap();
        for round in 0..100 {
            let published = reader.get(&format!("job-{}", round)).unwrap().unwrap();
            assert_eq!(published.status, JobStatus::Completed, "round {}", round);
            assert_eq!(published.progress, 100);
        }
    }

    #[test]
    fn test_newer_write_survives_commit_of_older_value() {
        let dir = TempDir::new().unwrap();
        let store = VolumeStore::open(dir.path()).unwrap();
        store.set("job", &StateRecord::queued(1)).unwrap();
        store.commit().unwrap();
        assert_eq!(store.pending_len(), 0);

        let mut newer = StateRecord::queued(1);
        newer.message = "newer".to_string();
        store.set("job", &newer).unwrap();
        assert_eq!(store.pending_len(), 1);
        store.commit().unwrap();
        assert_eq!(VolumeStore::open(dir.path()).unwrap().get("job").unwrap().unwrap().message, "newer");
    }
}
