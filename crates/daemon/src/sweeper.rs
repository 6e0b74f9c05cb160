//! Retention sweeper
//!
//! Deletes artifacts of completed jobs nobody downloaded within the retention
//! window. Records are kept and marked `deleted`.

use crate::config::RetentionConfig;
use crate::jobs::current_timestamp_ms;
use crate::store::{update_record, SharedStore, StoreError};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

const SECS_PER_HOUR: u64 = 3600;

/// Outcome of one pass over the store
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Jobs examined
    pub scanned: usize,
    /// Records newly marked deleted
    pub marked: usize,
    /// Files actually removed (a file already gone is marked, not counted)
    pub deleted: usize,
    /// Jobs skipped because of a storage error
    pub errors: usize,
}

pub struct RetentionSweeper {
    store: SharedStore,
    retention: Duration,
    period: Duration,
}

impl RetentionSweeper {
    pub fn new(store: SharedStore, retention: Duration, period: Duration) -> Self {
        Self {
            store,
            retention,
            period,
        }
    }

    pub fn from_config(store: SharedStore, cfg: &RetentionConfig) -> Self {
        Self::new(
            store,
            Duration::from_secs(cfg.retention_hours.saturating_mul(SECS_PER_HOUR)),
            Duration::from_secs(cfg.sweep_interval_hours.max(1).saturating_mul(SECS_PER_HOUR)),
        )
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Sweep against the current time
    pub fn sweep_once(&self) -> Result<SweepReport, StoreError> {
        self.sweep_once_at(current_timestamp_ms())
    }

    /// Sweep as if the time were `now_ms`.
    ///
    /// A job created exactly `retention` before `now_ms` is expired. Errors
    /// on individual jobs are logged and counted; only failing to list the
    /// store aborts the pass.
    pub fn sweep_once_at(&self, now_ms: i64) -> Result<SweepReport, StoreError> {
        let retention_ms = i64::try_from(self.retention.as_millis()).unwrap_or(i64::MAX);
        let cutoff = now_ms.saturating_sub(retention_ms);
        let mut report = SweepReport::default();

        for job_id in self.store.list_job_ids()? {
            report.scanned += 1;
            match self.sweep_job(&job_id, cutoff, now_ms) {
                Ok(None) => {}
                Ok(Some(removed)) => {
                    report.marked += 1;
                    if removed {
                        report.deleted += 1;
                    }
                }
                Err(e) => {
                    report.errors += 1;
                    tracing::warn!(job_id = %job_id, error = %e, "retention sweep failed for job");
                }
            }
        }

        self.store.commit()?;
        if report.marked > 0 || report.errors > 0 {
            tracing::info!(
                scanned = report.scanned,
                marked = report.marked,
                deleted = report.deleted,
                errors = report.errors,
                "retention sweep finished"
            );
        }
        Ok(report)
    }

    /// `None` when the job is not expired, else whether a file was removed.
    fn sweep_job(&self, job_id: &str, cutoff: i64, now_ms: i64) -> Result<Option<bool>, StoreError> {
        let Some(record) = self.store.get(job_id)? else {
            return Ok(None);
        };
        if !record.is_expired(cutoff) {
            return Ok(None);
        }

        let removed = match &record.file_path {
            Some(path) if self.store.file_exists(path) => self.store.delete_file(path)?,
            _ => false,
        };

        // Re-read so a concurrent download flag is not overwritten.
        update_record(self.store.as_ref(), job_id, |r| r.mark_deleted(now_ms))?;
        tracing::debug!(job_id = %job_id, removed, "expired artifact reclaimed");
        Ok(Some(removed))
    }

    /// Run a pass every `period` (the first immediately) until the task is aborted.
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            tracing::info!(period_secs = self.period().as_secs(), "retention sweeper started");
            let mut interval = tokio::time::interval(self.period());
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let sweeper = self.clone();
                match tokio::task::spawn_blocking(move || sweeper.sweep_once()).await {
                    Ok(Ok(_)) => {}
                    Ok(Err(e)) => tracing::error!(error = %e, "retention sweep aborted"),
                    Err(e) => tracing::error!(error = %e, "retention sweep task panicked"),
                }
            }
        })
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{JobStatus, StateRecord};
    use crate::store::{LocalStore, StateStore};
    use tempfile::TempDir;

    const HOUR_MS: i64 = 3_600_000;
    const NOW: i64 = 1_700_000_000_000;

    fn setup() -> (TempDir, SharedStore, RetentionSweeper) {
        let dir = TempDir::new().unwrap();
        let store: SharedStore = Arc::new(LocalStore::open(dir.path()).unwrap());
        let sweeper = RetentionSweeper::new(
            store.clone(),
            Duration::from_secs(24 * 3600),
            Duration::from_secs(6 * 3600),
        );
        (dir, store, sweeper)
    }

    /// Completed job with a real artifact, created at `created_at`.
    fn completed_job(store: &SharedStore, job_id: &str, created_at: i64) -> std::path::PathBuf {
        let path = store.file_path_for(job_id, "output.mp4").unwrap();
        std::fs::write(&path, b"artifact").unwrap();
        let mut record = StateRecord::queued(created_at);
        assert!(record.begin_download());
        assert!(record.begin_encoding());
        assert!(record.complete(path.clone(), "output.mp4".to_string()));
        store.set(job_id, &record).unwrap();
        path
    }

    #[test]
    fn test_expired_job_deleted_and_marked() {
        let (_dir, store, sweeper) = setup();
        let path = completed_job(&store, "old", NOW - 25 * HOUR_MS);

        let report = sweeper.sweep_once_at(NOW).unwrap();
        assert_eq!(report.scanned, 1);
        assert_eq!(report.marked, 1);
        assert_eq!(report.deleted, 1);
        assert!(!path.exists());
        assert!(!path.parent().unwrap().exists());

        let record = store.get("old").unwrap().unwrap();
        assert!(record.deleted);
        assert_eq!(record.deleted_at, Some(NOW));
        assert_eq!(record.status, JobStatus::Completed);
        assert_eq!(record.file_name.as_deref(), Some("output.mp4"));
    }

    #[test]
    fn test_sweep_is_idempotent() {
        let (_dir, store, sweeper) = setup();
        completed_job(&store, "old", NOW - 48 * HOUR_MS);

        sweeper.sweep_once_at(NOW).unwrap();
        let second = sweeper.sweep_once_at(NOW + HOUR_MS).unwrap();
        assert_eq!(second.marked, 0);
        assert_eq!(second.deleted, 0);
        assert_eq!(second.errors, 0);

        let record = store.get("old").unwrap().unwrap();
        assert!(record.deleted);
        assert_eq!(record.deleted_at, Some(NOW));
    }

    #[test]
    fn test_retention_boundary() {
        let (_dir, store, sweeper) = setup();
        let at_cutoff = completed_job(&store, "at-cutoff", NOW - 24 * HOUR_MS);
        let just_inside = completed_job(&store, "inside", NOW - 24 * HOUR_MS + 1000);

        let report = sweeper.sweep_once_at(NOW).unwrap();
        assert_eq!(report.deleted, 1);
        assert!(!at_cutoff.exists());
        assert!(just_inside.exists());
        assert!(!store.get("inside").unwrap().unwrap().deleted);
    }

    #[test]
    fn test_downloaded_and_unfinished_jobs_skipped() {
        let (_dir, store, sweeper) = setup();
        let downloaded = completed_job(&store, "downloaded", NOW - 48 * HOUR_MS);
        let mut record = store.get("downloaded").unwrap().unwrap();
        record.mark_downloaded();
        store.set("downloaded", &record).unwrap();

        let mut failed = StateRecord::queued(NOW - 48 * HOUR_MS);
        failed.fail("boom");
        store.set("failed", &failed).unwrap();
        store.set("queued", &StateRecord::queued(NOW - 48 * HOUR_MS)).unwrap();

        let report = sweeper.sweep_once_at(NOW).unwrap();
        assert_eq!(report.scanned, 3);
        assert_eq!(report.marked, 0);
        assert!(downloaded.exists());
        assert!(!store.get("failed").unwrap().unwrap().deleted);
    }

    #[test]
    fn test_missing_artifact_still_marked() {
        let (_dir, store, sweeper) = setup();
        let path = completed_job(&store, "gone", NOW - 48 * HOUR_MS);
        std::fs::remove_file(&path).unwrap();

        let report = sweeper.sweep_once_at(NOW).unwrap();
        assert_eq!(report.marked, 1);
        assert_eq!(report.deleted, 0);
        assert_eq!(report.errors, 0);
        assert!(store.get("gone").unwrap().unwrap().deleted);
    }

    #[test]
    fn test_corrupt_record_does_not_stop_sweep() {
        let (dir, store, sweeper) = setup();
        completed_job(&store, "old", NOW - 48 * HOUR_MS);
        std::fs::write(dir.path().join("state").join("broken.json"), b"{not json").unwrap();

        let report = sweeper.sweep_once_at(NOW).unwrap();
        assert_eq!(report.scanned, 2);
        assert_eq!(report.errors, 1);
        assert_eq!(report.deleted, 1);
    }

    #[test]
    fn test_from_config_uses_hours() {
        let dir = TempDir::new().unwrap();
        let store: SharedStore = Arc::new(LocalStore::open(dir.path()).unwrap());
        let sweeper = RetentionSweeper::from_config(store, &RetentionConfig::default());
        assert_eq!(sweeper.period(), Duration::from_secs(6 * 3600));
        assert_eq!(sweeper.retention, Duration::from_secs(24 * 3600));
    }
}
