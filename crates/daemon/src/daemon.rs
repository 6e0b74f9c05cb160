//! Daemon startup and wiring
//!
//! Builds the store, runner, launchers, dispatcher and sweeper from
//! configuration and runs the API server alongside the periodic sweep.

use crate::api_server::{create_router, run_server, AppState, ServerError};
use crate::concurrency::{derive_plan, ConcurrencyPlan};
use crate::config::{Config, ConfigError};
use crate::dispatch::{DispatchError, Dispatcher, JobLauncher, LocalLauncher, RemoteLauncher};
use crate::job_executor::{JobError, JobExecutor, RunnerSettings};
use crate::startup::{run_startup_checks, StartupError};
use crate::store::{open_store, SharedStore, StoreError};
use crate::sweeper::{RetentionSweeper, SweepReport};
use axum::Router;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Error type for daemon operations
#[derive(Debug, Error)]
pub enum DaemonError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Startup check failed
    #[error("Startup check failed: {0}")]
    Startup(#[from] StartupError),

    /// State store could not be opened or used
    #[error("State store error: {0}")]
    Store(#[from] StoreError),

    /// Runner could not be built
    #[error("Job runner error: {0}")]
    Job(#[from] JobError),

    /// Launcher could not be built
    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    /// Server error
    #[error("Server error: {0}")]
    Server(#[from] ServerError),
}

/// Daemon state containing all runtime components
pub struct Daemon {
    /// Configuration loaded from file and environment
    pub config: Config,
    /// Derived concurrency plan
    pub concurrency_plan: ConcurrencyPlan,
    pub store: SharedStore,
    /// Job runner shared by the in-process launcher
    pub executor: Arc<JobExecutor>,
    /// Runs jobs in this process; also serves the handoff route
    pub local_launcher: Arc<LocalLauncher>,
    pub dispatcher: Arc<Dispatcher>,
    pub sweeper: Arc<RetentionSweeper>,
}

impl Daemon {
    /// Initialize the daemon with configuration from file
    ///
    /// This performs the full startup sequence:
    /// 1. Load config from file (defaults when missing)
    /// 2. Apply environment overrides
    /// 3. Run startup checks (ffmpeg, ffprobe, hardware encoders)
    /// 4. Build the components
    pub fn new<P: AsRef<Path>>(config_path: P) -> Result<Self, DaemonError> {
        let config = Config::load_or_default(config_path)?;
        Self::with_config(config)
    }

    /// Initialize the daemon with an existing configuration, running startup checks
    pub fn with_config(config: Config) -> Result<Self, DaemonError> {
        run_startup_checks(&config)?;
        Self::new_without_checks(config)
    }

    /// Initialize the daemon without running startup checks
    ///
    /// Useful for testing when ffmpeg is not installed.
    pub fn new_without_checks(config: Config) -> Result<Self, DaemonError> {
        let concurrency_plan = derive_plan(&config);
        let store = open_store(&config.storage)?;

        let executor = Arc::new(JobExecutor::new(
            store.clone(),
            RunnerSettings::from_config(&config),
            concurrency_plan.max_concurrent_jobs,
        )?);
        let local_launcher = Arc::new(LocalLauncher::new(
            executor.clone(),
            Duration::from_secs(config.dispatch.job_timeout_secs),
        ));

        let launcher: Arc<dyn JobLauncher> = match &config.dispatch.remote_worker_url {
            Some(url) => Arc::new(RemoteLauncher::new(
                url,
                store.clone(),
                Duration::from_secs(config.fetch.timeout_secs),
            )?),
            None => local_launcher.clone(),
        };
        let dispatcher = Arc::new(Dispatcher::new(store.clone(), launcher));
        let sweeper = Arc::new(RetentionSweeper::from_config(store.clone(), &config.retention));

        tracing::info!(
            backend = ?config.storage.backend,
            max_concurrent_jobs = concurrency_plan.max_concurrent_jobs,
            total_cores = concurrency_plan.total_cores,
            hardware_acceleration = config.encoder.hardware_acceleration,
            remote_worker = config.dispatch.remote_worker_url.as_deref().unwrap_or("none"),
            "daemon initialized"
        );

        Ok(Self {
            config,
            concurrency_plan,
            store,
            executor,
            local_launcher,
            dispatcher,
            sweeper,
        })
    }

    /// Handler state for the API router
    pub fn app_state(&self) -> AppState {
        AppState {
            store: self.store.clone(),
            dispatcher: self.dispatcher.clone(),
            runner: self.local_launcher.clone(),
            delete_after_download: self.config.retention.delete_after_download,
            poll_interval: Duration::from_millis(self.config.server.progress_poll_interval_ms.max(1)),
        }
    }

    pub fn router(&self) -> Router {
        create_router(self.app_state())
    }

    /// Start the periodic retention sweep
    pub fn start_sweeper(&self) -> tokio::task::JoinHandle<()> {
        self.sweeper.clone().spawn()
    }

    /// Run one retention pass now
    pub fn sweep_once(&self) -> Result<SweepReport, DaemonError> {
        Ok(self.sweeper.sweep_once()?)
    }

    /// Run the API server and sweeper until `shutdown` resolves
    pub async fn run_until<F>(&self, shutdown: F) -> Result<(), DaemonError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let sweeper = self.start_sweeper();
        let result = run_server(self.app_state(), &self.config.server.bind_addr, shutdown).await;
        sweeper.abort();
        result?;
        tracing::info!("daemon stopped");
        Ok(())
    }

    /// Run until Ctrl-C
    pub async fn run(&self) -> Result<(), DaemonError> {
        self.run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to listen for shutdown signal");
                std::future::pending::<()>().await;
            }
            tracing::info!("shutdown requested");
        })
        .await
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageBackendKind;
    use tempfile::TempDir;

    fn create_test_config(dir: &TempDir) -> Config {
        let mut config = Config::default();
        config.storage.base_dir = dir.path().join("data");
        config.storage.volume_path = dir.path().join("vol");
        config.encoder.ffmpeg_path = "/nonexistent/ffmpeg".into();
        config.encoder.ffprobe_path = "/nonexistent/ffprobe".into();
        config
    }

    #[tokio::test]
    async fn test_daemon_initialization_without_checks() {
        let dir = TempDir::new().unwrap();
        let daemon = Daemon::new_without_checks(create_test_config(&dir)).unwrap();
        assert!(daemon.concurrency_plan.max_concurrent_jobs >= 1);
        assert_eq!(
            daemon.executor.available_permits(),
            daemon.concurrency_plan.max_concurrent_jobs as usize
        );
        assert!(dir.path().join("data").join("state").is_dir());
    }

    #[tokio::test]
    async fn test_daemon_uses_explicit_concurrency() {
        let dir = TempDir::new().unwrap();
        let mut config = create_test_config(&dir);
        config.dispatch.max_concurrent_jobs = 3;
        let daemon = Daemon::new_without_checks(config).unwrap();
        assert_eq!(daemon.concurrency_plan.max_concurrent_jobs, 3);
        assert_eq!(daemon.executor.available_permits(), 3);
    }

    #[test]
    fn test_startup_checks_block_initialization() {
        let dir = TempDir::new().unwrap();
        let result = Daemon::with_config(create_test_config(&dir));
        assert!(matches!(result, Err(DaemonError::Startup(_))));
    }

    #[test]
    fn test_invalid_remote_worker_url_rejected() {
        let dir = TempDir::new().unwrap();
        let mut config = create_test_config(&dir);
        config.dispatch.remote_worker_url = Some("not a url".to_string());
        assert!(matches!(
            Daemon::new_without_checks(config),
            Err(DaemonError::Dispatch(_))
        ));
    }

    #[tokio::test]
    async fn test_volume_backend_selected() {
        let dir = TempDir::new().unwrap();
        let mut config = create_test_config(&dir);
        config.storage.backend = StorageBackendKind::Volume;
        let daemon = Daemon::new_without_checks(config).unwrap();
        assert!(dir.path().join("vol").join(".state").is_dir());
        assert_eq!(daemon.sweep_once().unwrap(), SweepReport::default());
    }

    #[tokio::test]
    async fn test_daemon_submission_is_visible() {
        let dir = TempDir::new().unwrap();
        let daemon = Daemon::new_without_checks(create_test_config(&dir)).unwrap();
        let id = daemon
            .dispatcher
            .submit(crate::jobs::ConvertRequest::from_url("http://127.0.0.1:1/in.mov"))
            .unwrap();
        assert!(daemon.store.get(&id).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_run_until_stops_on_shutdown() {
        let dir = TempDir::new().unwrap();
        let mut config = create_test_config(&dir);
        config.server.bind_addr = "127.0.0.1:0".to_string();
        let daemon = Daemon::new_without_checks(config).unwrap();
        daemon.run_until(async {}).await.unwrap();
    }
}
