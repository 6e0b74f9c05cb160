//! Dispatcher module
//!
//! Accepts conversion requests, writes the initial `queued` record and hands
//! the job to a [`JobLauncher`] without waiting for it to finish.

use crate::job_executor::{fail_job, JobExecutor};
use crate::jobs::{current_timestamp_ms, ConvertRequest, Job, StateRecord};
use crate::store::{SharedStore, StoreError};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;

/// Route a remote worker exposes for job handoff
pub const REMOTE_RUN_PATH: &str = "/internal/run";

/// Error type for dispatch operations
#[derive(Debug, Error)]
pub enum DispatchError {
    /// Missing or unusable source reference; no job is created
    #[error("Invalid source: {0}")]
    InvalidSource(String),

    /// A runner for this job id is already active
    #[error("Job {0} is already running")]
    AlreadyRunning(String),

    /// Remote worker could not be set up
    #[error("Remote worker error: {0}")]
    Remote(String),

    /// State store error
    #[error("State store error: {0}")]
    Store(#[from] StoreError),
}

/// Execution substrate for accepted jobs.
///
/// `launch` must return without waiting for the job to run.
pub trait JobLauncher: Send + Sync {
    fn launch(&self, job: Job) -> Result<(), DispatchError>;
}

/// Runs jobs as tokio tasks in this process.
///
/// At most one task per job id is active. Once a task holds a runner
/// permit its run is bounded by a wall-clock limit, after which the job is
/// marked failed.
pub struct LocalLauncher {
    executor: Arc<JobExecutor>,
    active: Arc<Mutex<HashSet<String>>>,
    job_timeout: Duration,
}

impl LocalLauncher {
    pub fn new(executor: Arc<JobExecutor>, job_timeout: Duration) -> Self {
        Self {
            executor,
            active: Arc::new(Mutex::new(HashSet::new())),
            job_timeout,
        }
    }
}

fn lock_active(active: &Mutex<HashSet<String>>) -> std::sync::MutexGuard<'_, HashSet<String>> {
    active.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Removes the job id from the active set when the task ends, even on panic.
struct ActiveGuard {
    active: Arc<Mutex<HashSet<String>>>,
    job_id: String,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        lock_active(&self.active).remove(&self.job_id);
    }
}

impl JobLauncher for LocalLauncher {
    fn launch(&self, job: Job) -> Result<(), DispatchError> {
        if !lock_active(&self.active).insert(job.id.clone()) {
            return Err(DispatchError::AlreadyRunning(job.id));
        }
        let guard = ActiveGuard {
            active: self.active.clone(),
            job_id: job.id.clone(),
        };

        let executor = self.executor.clone();
        let limit = self.job_timeout;
        tokio::spawn(async move {
            let _guard = guard;
            executor.execute(&job, Some(limit)).await;
        });
        Ok(())
    }
}

/// Hands jobs to a remote worker's `/internal/run` endpoint.
///
/// The worker shares the state store (volume backend), so only the job
/// itself travels. A failed handoff marks the job failed.
pub struct RemoteLauncher {
    http: reqwest::Client,
    endpoint: reqwest::Url,
    store: SharedStore,
}

impl RemoteLauncher {
    pub fn new(base_url: &str, store: SharedStore, timeout: Duration) -> Result<Self, DispatchError> {
        let base = reqwest::Url::parse(base_url)
            .map_err(|e| DispatchError::Remote(format!("invalid worker url {:?}: {}", base_url, e)))?;
        let endpoint = base
            .join(REMOTE_RUN_PATH)
            .map_err(|e| DispatchError::Remote(e.to_string()))?;
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DispatchError::Remote(e.to_string()))?;
        Ok(Self { http, endpoint, store })
    }
}

impl JobLauncher for RemoteLauncher {
    fn launch(&self, job: Job) -> Result<(), DispatchError> {
        let http = self.http.clone();
        let endpoint = self.endpoint.clone();
        let store = self.store.clone();
        tokio::spawn(async move {
            let handoff = async {
                http.post(endpoint.clone())
                    .json(&job)
                    .send()
                    .await?
                    .error_for_status()
            }
            .await;

            match handoff {
                Ok(_) => tracing::info!(job_id = %job.id, %endpoint, "job handed to remote worker"),
                Err(e) => {
                    tracing::warn!(job_id = %job.id, error = %e, "remote handoff failed");
                    let reason = format!("Remote worker handoff failed: {}", e);
                    if let Err(store_err) = fail_job(store.as_ref(), &job.id, &reason) {
                        tracing::error!(job_id = %job.id, error = %store_err, "could not record handoff failure");
                    }
                }
            }
        });
        Ok(())
    }
}

/// Accepts submissions and launches runners.
pub struct Dispatcher {
    store: SharedStore,
    launcher: Arc<dyn JobLauncher>,
}

impl Dispatcher {
    pub fn new(store: SharedStore, launcher: Arc<dyn JobLauncher>) -> Self {
        Self { store, launcher }
    }

    /// Submit a conversion request, returning the new job id.
    ///
    /// The `queued` record is written and committed before the job is
    /// launched, so a status query never misses an accepted job. If the
    /// launch itself fails the job is recorded as failed and the id is
    /// still returned.
    ///
    /// # Errors
    /// Returns `InvalidSource` when the source URL is missing or not
    /// http(s); nothing is stored in that case.
    pub fn submit(&self, request: ConvertRequest) -> Result<String, DispatchError> {
        validate_source(&request)?;

        let job = Job::new(request);
        let job_id = job.id.clone();
        self.store
            .set(&job_id, &StateRecord::queued(current_timestamp_ms()))?;
        self.store.commit()?;
        tracing::info!(job_id = %job_id, "job queued");

        if let Err(e) = self.launcher.launch(job) {
            tracing::warn!(job_id = %job_id, error = %e, "job launch failed");
            fail_job(self.store.as_ref(), &job_id, &e.to_string())?;
        }
        Ok(job_id)
    }
}

fn validate_source(request: &ConvertRequest) -> Result<(), DispatchError> {
    let url = request
        .source_url()
        .ok_or_else(|| DispatchError::InvalidSource("source url is required".to_string()))?;
    let parsed = reqwest::Url::parse(url)
        .map_err(|e| DispatchError::InvalidSource(format!("{:?}: {}", url, e)))?;
    match parsed.scheme() {
        "http" | "https" => Ok(()),
        other => Err(DispatchError::InvalidSource(format!(
            "unsupported scheme {:?}",
            other
        ))),
    }
}
