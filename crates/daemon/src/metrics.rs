//! Metrics module
//!
//! Job counters served on `GET /metrics`, computed on demand from the state
//! store. Nothing is cached; every snapshot is a fresh scan.

use crate::jobs::{current_timestamp_ms, JobStatus, StateRecord};
use crate::store::{StateStore, StoreError};
use serde::{Deserialize, Serialize};

/// Per-status job counts plus artifact bookkeeping
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobCounts {
    pub timestamp_unix_ms: i64,
    pub total: usize,
    pub queued: usize,
    pub downloading: usize,
    pub encoding: usize,
    pub completed: usize,
    pub failed: usize,
    /// Completed jobs whose artifact was fetched at least once
    pub downloaded: usize,
    /// Jobs whose artifact has been removed
    pub deleted: usize,
    /// Records that could not be read
    pub unreadable: usize,
}

impl JobCounts {
    /// Add one record to the tally
    pub fn record(&mut self, record: &StateRecord) {
        self.total += 1;
        match record.status {
            JobStatus::Queued => self.queued += 1,
            JobStatus::Downloading => self.downloading += 1,
            JobStatus::Encoding => self.encoding += 1,
            JobStatus::Completed => self.completed += 1,
            JobStatus::Failed => self.failed += 1,
        }
        if record.downloaded {
            self.downloaded += 1;
        }
        if record.deleted {
            self.deleted += 1;
        }
    }
}

/// Scan the store and count jobs by status
pub fn collect_job_counts(store: &dyn StateStore) -> Result<JobCounts, StoreError> {
    let mut counts = JobCounts {
        timestamp_unix_ms: current_timestamp_ms(),
        ..JobCounts::default()
    };
    for job_id in store.list_job_ids()? {
        match store.get(&job_id) {
            Ok(Some(record)) => counts.record(&record),
            // Listed but gone or corrupt; not fatal for a counter
            Ok(None) => {}
            Err(e) => {
                tracing::debug!(job_id = %job_id, error = %e, "skipping unreadable record");
                counts.unreadable += 1;
            }
        }
    }
    Ok(counts)
}
