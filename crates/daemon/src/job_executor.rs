//! Job executor module
//!
//! Runs one job end to end (fetch source, probe duration, transcode, record
//! the artifact) while owning the job's state record. Concurrency across jobs
//! is limited by a semaphore.

use crate::config::Config;
use crate::encode::{run_ffmpeg, EncodeError, EncodeParams};
use crate::fetch::{build_client, download_source, FetchError};
use crate::jobs::{Job, JobStatus, StateRecord};
use crate::probe::probe_duration;
use crate::store::{SharedStore, StateStore, StoreError};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::Instrument;

/// Error type for job execution operations
#[derive(Debug, Error)]
pub enum JobError {
    /// No record exists for the job
    #[error("Unknown job: {0}")]
    UnknownJob(String),

    /// The record is not in a state this step may leave
    #[error("Job is {0}, cannot continue")]
    InvalidTransition(JobStatus),

    /// The request carries no source URL
    #[error("Missing source url")]
    MissingSource,

    /// Downloading the source failed
    #[error("{0}")]
    Fetch(#[from] FetchError),

    /// Failed to create scratch space
    #[error("Failed to create scratch directory: {0}")]
    Scratch(std::io::Error),

    /// ffmpeg failed
    #[error("Encoding failed: {0}")]
    Encode(#[from] EncodeError),

    /// ffmpeg succeeded without producing the artifact
    #[error("Output file missing after encode: {0}")]
    MissingOutput(PathBuf),

    /// State store error
    #[error("State store error: {0}")]
    Store(#[from] StoreError),

    /// The run exceeded its wall-clock limit
    #[error("Job timed out after {}s", .0.as_secs())]
    TimedOut(Duration),
}

/// Wall-clock bound on a run, fixed once the job holds a permit.
#[derive(Debug, Clone, Copy)]
struct Deadline {
    at: Instant,
    limit: Duration,
}

/// Await `work`, failing with `TimedOut` once the deadline passes.
async fn before_deadline<T, F>(deadline: Option<Deadline>, work: F) -> Result<T, JobError>
where
    F: Future<Output = Result<T, JobError>>,
{
    match deadline {
        Some(Deadline { at, limit }) => tokio::time::timeout_at(at, work)
            .await
            .unwrap_or_else(|_| Err(JobError::TimedOut(limit))),
        None => work.await,
    }
}

/// Settings for the runner pipeline
#[derive(Debug, Clone)]
pub struct RunnerSettings {
    pub ffmpeg_path: PathBuf,
    pub ffprobe_path: PathBuf,
    pub hardware_acceleration: bool,
    pub fetch_timeout: Duration,
    /// Parent of per-job scratch directories (system temp dir when unset)
    pub scratch_dir: Option<PathBuf>,
}

impl RunnerSettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            ffmpeg_path: cfg.encoder.ffmpeg_path.clone(),
            ffprobe_path: cfg.encoder.ffprobe_path.clone(),
            hardware_acceleration: cfg.encoder.hardware_acceleration,
            fetch_timeout: Duration::from_secs(cfg.fetch.timeout_secs),
            scratch_dir: None,
        }
    }
}

/// Job executor that runs conversion jobs with concurrency limiting
///
/// Uses a tokio Semaphore to limit the number of jobs past `queued` at once.
pub struct JobExecutor {
    semaphore: Arc<Semaphore>,
    store: SharedStore,
    http: reqwest::Client,
    settings: RunnerSettings,
}

impl JobExecutor {
    /// Create a new JobExecutor
    ///
    /// # Arguments
    /// * `store` - State store holding the job records
    /// * `settings` - Tool paths, hardware toggle and fetch timeout
    /// * `max_concurrent_jobs` - Number of jobs allowed to run at once
    pub fn new(
        store: SharedStore,
        settings: RunnerSettings,
        max_concurrent_jobs: u32,
    ) -> Result<Self, JobError> {
        let http = build_client(settings.fetch_timeout)?;
        Ok(Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent_jobs.max(1) as usize)),
            store,
            http,
            settings,
        })
    }

    /// Get the number of available permits (slots for concurrent jobs)
    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Acquire a permit for job execution
    ///
    /// This will wait until a permit is available if all slots are in use.
    pub async fn acquire_permit(&self) -> OwnedSemaphorePermit {
        loop {
            // The semaphore is owned here and never closed.
            if let Ok(permit) = self.semaphore.clone().acquire_owned().await {
                return permit;
            }
        }
    }

    /// Try to acquire a permit without waiting
    ///
    /// Returns None if no permits are available.
    pub fn try_acquire_permit(&self) -> Option<OwnedSemaphorePermit> {
        self.semaphore.clone().try_acquire_owned().ok()
    }

    /// Execute a job through the conversion pipeline
    ///
    /// Waits for a permit, then drives the record
    /// `queued -> downloading -> encoding -> completed`. Any error ends the
    /// job as `failed` with the error text as message; it never propagates
    /// to the caller. Returns the final status.
    ///
    /// With a `limit`, the job fails once it has held its permit that long;
    /// time spent waiting for the permit does not count.
    pub async fn execute(&self, job: &Job, limit: Option<Duration>) -> JobStatus {
        let span = tracing::info_span!("job", job_id = %job.id);
        async {
            let _permit = self.acquire_permit().await;
            tracing::info!(source = job.request.source_url().unwrap_or(""), "job started");
            let deadline = limit.map(|limit| Deadline {
                at: Instant::now() + limit,
                limit,
            });

            match self.run_pipeline(job, deadline).await {
                Ok(()) => {
                    tracing::info!("job completed");
                    JobStatus::Completed
                }
                Err(e) => {
                    tracing::warn!(error = %e, "job failed");
                    let store = self.store.clone();
                    let job_id = job.id.clone();
                    let reason = e.to_string();
                    match tokio::task::spawn_blocking(move || fail_job(store.as_ref(), &job_id, &reason)).await {
                        Ok(Ok(_)) => {}
                        Ok(Err(store_err)) => tracing::error!(error = %store_err, "could not record job failure"),
                        Err(join_err) => tracing::error!(error = %join_err, "job failure task panicked"),
                    }
                    JobStatus::Failed
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn run_pipeline(&self, job: &Job, deadline: Option<Deadline>) -> Result<(), JobError> {
        let url = job
            .request
            .source_url()
            .ok_or(JobError::MissingSource)?
            .to_string();

        self.transition(&job.id, StateRecord::begin_download)?;

        // Released on every exit path when dropped
        let scratch = match &self.settings.scratch_dir {
            Some(dir) => tempfile::Builder::new().prefix("av1-job-").tempdir_in(dir),
            None => tempfile::Builder::new().prefix("av1-job-").tempdir(),
        }
        .map_err(JobError::Scratch)?;
        let source_path = scratch.path().join("input");

        let bytes = before_deadline(deadline, async {
            download_source(&self.http, &url, &source_path)
                .await
                .map_err(JobError::from)
        })
        .await?;
        tracing::info!(bytes, "source downloaded");

        let probed = before_deadline(deadline, async {
            Ok::<_, JobError>(probe_duration(&self.settings.ffprobe_path, &source_path).await)
        })
        .await?;
        let duration = match probed {
            Ok(secs) => Some(secs),
            Err(e) => {
                tracing::warn!(error = %e, "duration probe failed; progress percentage unavailable");
                None
            }
        };

        let params = &job.request.request;
        let format = params.format_or_default();
        let file_name = format.output_file_name();
        let output_path = self.store.file_path_for(&job.id, &file_name)?;

        let encode = EncodeParams {
            ffmpeg_path: self.settings.ffmpeg_path.clone(),
            input_path: source_path.clone(),
            output_path: output_path.clone(),
            format,
            codec: params.codec_or_default(),
            quality: params.crf,
            hardware_acceleration: self.settings.hardware_acceleration,
        };
        tracing::info!(
            profile = ?encode.profile(),
            quality = encode.effective_quality(),
            duration_secs = duration,
            "encoding"
        );

        self.transition(&job.id, StateRecord::begin_encoding)?;

        // Progress samples are written in order off the runtime; every write
        // lands before the encode result is acted on.
        let (progress_tx, progress_rx) = mpsc::unbounded_channel();
        let encoding = before_deadline(deadline, async {
            run_ffmpeg(&encode, duration, move |percent| {
                if progress_tx.send(percent).is_err() {
                    tracing::debug!(percent, "progress recorder gone");
                }
            })
            .await
            .map_err(JobError::from)
        });
        let (encoded, ()) = tokio::join!(encoding, self.record_progress_updates(&job.id, progress_rx));

        if let Err(e) = encoded {
            if let Err(cleanup) = self.store.delete_file(&output_path) {
                tracing::warn!(error = %cleanup, path = %output_path.display(), "could not remove partial output");
            }
            return Err(e);
        }
        if !self.store.file_exists(&output_path) {
            return Err(JobError::MissingOutput(output_path));
        }

        self.transition(&job.id, |record| record.complete(output_path, file_name))?;
        Ok(())
    }

    async fn record_progress_updates(&self, job_id: &str, mut updates: mpsc::UnboundedReceiver<u8>) {
        while let Some(percent) = updates.recv().await {
            let store = self.store.clone();
            let job_id = job_id.to_string();
            match tokio::task::spawn_blocking(move || record_progress(store.as_ref(), &job_id, percent)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!(error = %e, percent, "progress update failed"),
                Err(e) => tracing::warn!(error = %e, percent, "progress update task panicked"),
            }
        }
    }

    /// Read, apply a lifecycle step, write back and publish.
    fn transition<F>(&self, job_id: &str, step: F) -> Result<StateRecord, JobError>
    where
        F: FnOnce(&mut StateRecord) -> bool,
    {
        let mut record = self
            .store
            .get(job_id)?
            .ok_or_else(|| JobError::UnknownJob(job_id.to_string()))?;
        if !step(&mut record) {
            return Err(JobError::InvalidTransition(record.status));
        }
        self.store.set(job_id, &record)?;
        self.store.commit()?;
        Ok(record)
    }
}

/// Record an encoding percentage if it advances the stored one.
fn record_progress(store: &dyn StateStore, job_id: &str, percent: u8) -> Result<(), StoreError> {
    if let Some(mut record) = store.get(job_id)? {
        if record.record_progress(percent) {
            store.set(job_id, &record)?;
            store.commit()?;
        }
    }
    Ok(())
}

/// Move a non-terminal job to `failed` with `reason`.
///
/// Returns whether the record changed; terminal and unknown jobs are left alone.
pub fn fail_job(store: &dyn StateStore, job_id: &str, reason: &str) -> Result<bool, StoreError> {
    let Some(mut record) = store.get(job_id)? else {
        return Ok(false);
    };
    if !record.fail(reason) {
        return Ok(false);
    }
    store.set(job_id, &record)?;
    store.commit()?;
    Ok(true)
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{current_timestamp_ms, ConvertRequest};
    use crate::store::LocalStore;
    use tempfile::TempDir;

    fn settings(dir: &TempDir) -> RunnerSettings {
        RunnerSettings {
            ffmpeg_path: PathBuf::from("/nonexistent/ffmpeg"),
            ffprobe_path: PathBuf::from("/nonexistent/ffprobe"),
            hardware_acceleration: false,
            fetch_timeout: Duration::from_secs(5),
            scratch_dir: Some(dir.path().join("scratch")),
        }
    }

    fn setup(max_jobs: u32) -> (TempDir, SharedStore, JobExecutor) {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("scratch")).unwrap();
        let store: SharedStore = Arc::new(LocalStore::open(dir.path().join("data")).unwrap());
        let executor = JobExecutor::new(store.clone(), settings(&dir), max_jobs).unwrap();
        (dir, store, executor)
    }

    fn queue(store: &SharedStore, request: ConvertRequest) -> Job {
        let job = Job::new(request);
        store.set(&job.id, &StateRecord::queued(current_timestamp_ms())).unwrap();
        job
    }

    fn scratch_is_empty(dir: &TempDir) -> bool {
        std::fs::read_dir(dir.path().join("scratch")).unwrap().next().is_none()
    }

    #[tokio::test]
    async fn test_executor_initial_permits() {
        let (_dir, _store, executor) = setup(3);
        assert_eq!(executor.available_permits(), 3);
    }

    #[tokio::test]
    async fn test_semaphore_permit_limiting() {
        let (_dir, _store, executor) = setup(2);

        let permit1 = executor.try_acquire_permit();
        assert!(permit1.is_some());
        let permit2 = executor.try_acquire_permit();
        assert!(permit2.is_some());
        assert_eq!(executor.available_permits(), 0);
        assert!(executor.try_acquire_permit().is_none());

        drop(permit1);
        assert_eq!(executor.available_permits(), 1);
    }

    #[tokio::test]
    async fn test_unreachable_source_fails_job() {
        let (dir, store, executor) = setup(1);
        let job = queue(&store, ConvertRequest::from_url("http://127.0.0.1:1/missing.mp4"));

        assert_eq!(executor.execute(&job, None).await, JobStatus::Failed);

        let record = store.get(&job.id).unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Failed);
        assert!(!record.message.is_empty());
        assert_eq!(record.progress, 0);
        assert!(scratch_is_empty(&dir));
    }

    #[tokio::test]
    async fn test_missing_source_fails_job() {
        let (_dir, store, executor) = setup(1);
        let job = queue(&store, ConvertRequest::default());

        assert_eq!(executor.execute(&job, None).await, JobStatus::Failed);
        let record = store.get(&job.id).unwrap().unwrap();
        assert_eq!(record.message, "Missing source url");
    }

    #[tokio::test]
    async fn test_terminal_job_is_not_rerun() {
        let (_dir, store, executor) = setup(1);
        let job = Job::new(ConvertRequest::from_url("http://127.0.0.1:1/x.mp4"));
        let mut record = StateRecord::queued(1);
        record.fail("earlier failure");
        store.set(&job.id, &record).unwrap();

        assert_eq!(executor.execute(&job, None).await, JobStatus::Failed);
        assert_eq!(store.get(&job.id).unwrap().unwrap().message, "earlier failure");
    }

    #[test]
    fn test_fail_job_ignores_unknown_and_terminal() {
        let dir = TempDir::new().unwrap();
        let store = LocalStore::open(dir.path()).unwrap();
        assert!(!fail_job(&store, "nope", "x").unwrap());

        store.set("job", &StateRecord::queued(1)).unwrap();
        assert!(fail_job(&store, "job", "timed out").unwrap());
        assert!(!fail_job(&store, "job", "again").unwrap());
        assert_eq!(store.get("job").unwrap().unwrap().message, "timed out");
    }

    #[cfg(unix)]
    mod pipeline {
        use super::*;
        use crate::test_support::{
            broken_ffprobe, failing_ffmpeg, fake_ffmpeg, fake_ffprobe, serve_source, ENCODED_BYTES,
        };

        fn executor_with_tools(
            dir: &TempDir,
            store: &SharedStore,
            ffmpeg: PathBuf,
            ffprobe: PathBuf,
        ) -> JobExecutor {
            let mut settings = settings(dir);
            settings.ffmpeg_path = ffmpeg;
            settings.ffprobe_path = ffprobe;
            JobExecutor::new(store.clone(), settings, 1).unwrap()
        }

        #[tokio::test]
        async fn test_successful_job_completes() {
            let (dir, store, _) = setup(1);
            let tools = TempDir::new().unwrap();
            let executor = executor_with_tools(
                &dir,
                &store,
                fake_ffmpeg(tools.path()),
                fake_ffprobe(tools.path()),
            );
            let job = queue(&store, ConvertRequest::from_url(serve_source().await));

            assert_eq!(executor.execute(&job, None).await, JobStatus::Completed);

            let record = store.get(&job.id).unwrap().unwrap();
            assert_eq!(record.status, JobStatus::Completed);
            assert_eq!(record.progress, 100);
            assert_eq!(record.file_name.as_deref(), Some("output.mp4"));
            let path = record.file_path.unwrap();
            assert_eq!(std::fs::read(&path).unwrap(), ENCODED_BYTES);
            assert!(scratch_is_empty(&dir));
        }

        #[tokio::test]
        async fn test_successful_job_publishes_on_volume_store() {
            use crate::store::VolumeStore;

            let (dir, _, _) = setup(1);
            let volume = dir.path().join("vol");
            let store: SharedStore = Arc::new(VolumeStore::open(&volume).unwrap());
            let tools = TempDir::new().unwrap();
            let executor = executor_with_tools(
                &dir,
                &store,
                fake_ffmpeg(tools.path()),
                fake_ffprobe(tools.path()),
            );
            let job = queue(&store, ConvertRequest::from_url(serve_source().await));
            store.commit().unwrap();

            assert_eq!(executor.execute(&job, None).await, JobStatus::Completed);

            // Another process on the same volume sees the final record.
            let published = VolumeStore::open(&volume).unwrap().get(&job.id).unwrap().unwrap();
            assert_eq!(published.status, JobStatus::Completed);
            assert_eq!(published.progress, 100);
            let path = published.file_path.unwrap();
            assert!(path.starts_with(&volume));
            assert_eq!(std::fs::read(&path).unwrap(), ENCODED_BYTES);
        }

        #[tokio::test]
        async fn test_encoder_failure_on_volume_store_keeps_last_progress() {
            use crate::store::VolumeStore;

            let (dir, _, _) = setup(1);
            let volume = dir.path().join("vol");
            let store: SharedStore = Arc::new(VolumeStore::open(&volume).unwrap());
            let tools = TempDir::new().unwrap();
            let executor = executor_with_tools(
                &dir,
                &store,
                failing_ffmpeg(tools.path()),
                fake_ffprobe(tools.path()),
            );
            let job = queue(&store, ConvertRequest::from_url(serve_source().await));

            assert_eq!(executor.execute(&job, None).await, JobStatus::Failed);

            let published = VolumeStore::open(&volume).unwrap().get(&job.id).unwrap().unwrap();
            assert_eq!(published.status, JobStatus::Failed);
            assert_eq!(published.progress, 41);
        }

        #[tokio::test]
        async fn test_probe_failure_does_not_block_encoding() {
            let (dir, store, _) = setup(1);
            let tools = TempDir::new().unwrap();
            let executor = executor_with_tools(
                &dir,
                &store,
                fake_ffmpeg(tools.path()),
                broken_ffprobe(tools.path()),
            );
            let job = queue(&store, ConvertRequest::from_url(serve_source().await));

            assert_eq!(executor.execute(&job, None).await, JobStatus::Completed);
            assert_eq!(store.get(&job.id).unwrap().unwrap().progress, 100);
        }

        #[tokio::test]
        async fn test_encoder_failure_keeps_last_progress() {
            let (dir, store, _) = setup(1);
            let tools = TempDir::new().unwrap();
            let executor = executor_with_tools(
                &dir,
                &store,
                failing_ffmpeg(tools.path()),
                fake_ffprobe(tools.path()),
            );
            let job = queue(&store, ConvertRequest::from_url(serve_source().await));

            assert_eq!(executor.execute(&job, None).await, JobStatus::Failed);

            let record = store.get(&job.id).unwrap().unwrap();
            assert_eq!(record.status, JobStatus::Failed);
            assert_eq!(record.progress, 41);
            assert!(record.message.contains("Conversion failed!"));
            assert!(record.file_path.is_none());
            assert!(scratch_is_empty(&dir));
        }
    }
}
