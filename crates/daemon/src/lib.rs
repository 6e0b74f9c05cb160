//! AV1 conversion service
//!
//! Accepts remote video conversion jobs, runs them through ffmpeg, tracks
//! their state in a pluggable store and reclaims unclaimed artifacts.

pub mod api_server;
pub mod concurrency;
pub mod daemon;
pub mod dispatch;
pub mod encode;
pub mod fetch;
pub mod job_executor;
pub mod jobs;
pub mod metrics;
pub mod probe;
pub mod startup;
pub mod store;
pub mod sweeper;

#[cfg(all(test, unix))]
mod test_support;

pub use av1_convert_config as config;
pub use av1_convert_config::Config;
pub use api_server::{create_router, progress_feed, run_server, ApiError, AppState, ServerError};
pub use concurrency::{derive_plan, ConcurrencyPlan};
pub use daemon::{Daemon, DaemonError};
pub use dispatch::{DispatchError, Dispatcher, JobLauncher, LocalLauncher, RemoteLauncher};
pub use encode::{build_ffmpeg_command, run_ffmpeg, EncodeError, EncodeParams, EncodeProfile};
pub use job_executor::{fail_job, JobError, JobExecutor, RunnerSettings};
pub use jobs::{ConvertParams, ConvertRequest, Job, JobStatus, OutputFormat, Source, StateRecord, VideoCodec};
pub use metrics::{collect_job_counts, JobCounts};
pub use startup::{run_startup_checks, StartupError};
pub use store::{open_store, update_record, LocalStore, SharedStore, StateStore, StoreError, VolumeStore};
pub use sweeper::{RetentionSweeper, SweepReport};
