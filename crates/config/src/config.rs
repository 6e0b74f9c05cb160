//! Core configuration structures and loading logic

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Error type for configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to read config file: {}", e),
            ConfigError::Parse(e) => write!(f, "Failed to parse config: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

/// Which state store implementation backs the service
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackendKind {
    /// One JSON file per job plus a per-job files directory
    #[default]
    Local,
    /// Per-job records on a mounted volume, published on commit
    Volume,
}

impl FromStr for StorageBackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "local" => Ok(StorageBackendKind::Local),
            "volume" => Ok(StorageBackendKind::Volume),
            other => Err(format!("unknown storage backend '{}'", other)),
        }
    }
}

/// Storage-related configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackendKind,
    /// Base directory for the local backend (`state/` and `files/` live below it)
    #[serde(default = "default_base_dir")]
    pub base_dir: PathBuf,
    /// Mount point of the shared volume for the volume backend
    #[serde(default = "default_volume_path")]
    pub volume_path: PathBuf,
}

fn default_base_dir() -> PathBuf {
    PathBuf::from("./local_data")
}

fn default_volume_path() -> PathBuf {
    PathBuf::from("/vol")
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackendKind::default(),
            base_dir: default_base_dir(),
            volume_path: default_volume_path(),
        }
    }
}

/// Transcoder-related configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EncoderConfig {
    /// Use the NVENC hardware path (default false)
    #[serde(default)]
    pub hardware_acceleration: bool,
    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: PathBuf,
    #[serde(default = "default_ffprobe_path")]
    pub ffprobe_path: PathBuf,
}

fn default_ffmpeg_path() -> PathBuf {
    PathBuf::from("ffmpeg")
}

fn default_ffprobe_path() -> PathBuf {
    PathBuf::from("ffprobe")
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            hardware_acceleration: false,
            ffmpeg_path: default_ffmpeg_path(),
            ffprobe_path: default_ffprobe_path(),
        }
    }
}

/// Source download configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FetchConfig {
    /// Network timeout for fetching the source, in seconds (default 60)
    #[serde(default = "default_fetch_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_fetch_timeout_secs() -> u64 {
    60
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_fetch_timeout_secs(),
        }
    }
}

/// Retention policy for produced artifacts
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetentionConfig {
    /// Undownloaded artifacts older than this are deleted (default 24)
    #[serde(default = "default_retention_hours")]
    pub retention_hours: u64,
    /// Period between sweeps (default 6)
    #[serde(default = "default_sweep_interval_hours")]
    pub sweep_interval_hours: u64,
    /// Delete the artifact as soon as it has been downloaded once
    #[serde(default)]
    pub delete_after_download: bool,
}

fn default_retention_hours() -> u64 {
    24
}

fn default_sweep_interval_hours() -> u64 {
    6
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            retention_hours: default_retention_hours(),
            sweep_interval_hours: default_sweep_interval_hours(),
            delete_after_download: false,
        }
    }
}

/// Job dispatch configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DispatchConfig {
    /// Maximum concurrent in-process jobs (0 = auto-derive)
    #[serde(default)]
    pub max_concurrent_jobs: u32,
    /// Wall-clock limit for a single job, in seconds (default 7200)
    #[serde(default = "default_job_timeout_secs")]
    pub job_timeout_secs: u64,
    /// Base URL of a remote worker; jobs run in-process when unset
    #[serde(default)]
    pub remote_worker_url: Option<String>,
}

fn default_job_timeout_secs() -> u64 {
    60 * 60 * 2
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 0,
            job_timeout_secs: default_job_timeout_secs(),
            remote_worker_url: None,
        }
    }
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    /// Tick of the progress event feed, in milliseconds (default 1000)
    #[serde(default = "default_progress_poll_interval_ms")]
    pub progress_poll_interval_ms: u64,
}

fn default_bind_addr() -> String {
    "0.0.0.0:8000".to_string()
}

fn default_progress_poll_interval_ms() -> u64 {
    1000
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            progress_poll_interval_ms: default_progress_poll_interval_ms(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub encoder: EncoderConfig,
    #[serde(default)]
    pub fetch: FetchConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

/// Read and parse an environment variable, ignoring unset or invalid values
fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|val| val.trim().parse().ok())
}

/// Accept "true", "1", "yes" as true; "false", "0", "no" as false
fn env_bool(name: &str) -> Option<bool> {
    let val = env::var(name).ok()?;
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" => Some(true),
        "false" | "0" | "no" => Some(false),
        _ => None,
    }
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Parses the config.toml file and handles missing optional fields with defaults.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Overrides the following values if environment variables are set:
    /// - CONVERTER_STORAGE_BACKEND -> storage.backend
    /// - CONVERTER_BASE_DIR -> storage.base_dir
    /// - CONVERTER_VOLUME_PATH -> storage.volume_path
    /// - CONVERTER_HARDWARE_ACCELERATION -> encoder.hardware_acceleration
    /// - CONVERTER_FFMPEG_PATH -> encoder.ffmpeg_path
    /// - CONVERTER_FFPROBE_PATH -> encoder.ffprobe_path
    /// - CONVERTER_RETENTION_HOURS -> retention.retention_hours
    /// - CONVERTER_SWEEP_INTERVAL_HOURS -> retention.sweep_interval_hours
    /// - CONVERTER_MAX_CONCURRENT_JOBS -> dispatch.max_concurrent_jobs
    /// - CONVERTER_REMOTE_WORKER_URL -> dispatch.remote_worker_url
    /// - CONVERTER_BIND_ADDR -> server.bind_addr
    pub fn apply_env_overrides(&mut self) {
        if let Some(backend) = env_parse::<StorageBackendKind>("CONVERTER_STORAGE_BACKEND") {
            self.storage.backend = backend;
        }
        if let Some(dir) = env_parse::<PathBuf>("CONVERTER_BASE_DIR") {
            self.storage.base_dir = dir;
        }
        if let Some(dir) = env_parse::<PathBuf>("CONVERTER_VOLUME_PATH") {
            self.storage.volume_path = dir;
        }

        if let Some(hw) = env_bool("CONVERTER_HARDWARE_ACCELERATION") {
            self.encoder.hardware_acceleration = hw;
        }
        if let Some(path) = env_parse::<PathBuf>("CONVERTER_FFMPEG_PATH") {
            self.encoder.ffmpeg_path = path;
        }
        if let Some(path) = env_parse::<PathBuf>("CONVERTER_FFPROBE_PATH") {
            self.encoder.ffprobe_path = path;
        }

        if let Some(hours) = env_parse::<u64>("CONVERTER_RETENTION_HOURS") {
            self.retention.retention_hours = hours;
        }
        if let Some(hours) = env_parse::<u64>("CONVERTER_SWEEP_INTERVAL_HOURS") {
            self.retention.sweep_interval_hours = hours;
        }

        if let Some(jobs) = env_parse::<u32>("CONVERTER_MAX_CONCURRENT_JOBS") {
            self.dispatch.max_concurrent_jobs = jobs;
        }
        if let Ok(url) = env::var("CONVERTER_REMOTE_WORKER_URL") {
            // An empty value switches back to in-process execution
            self.dispatch.remote_worker_url = Some(url).filter(|u| !u.trim().is_empty());
        }

        if let Ok(addr) = env::var("CONVERTER_BIND_ADDR") {
            if !addr.trim().is_empty() {
                self.server.bind_addr = addr;
            }
        }
    }

    /// Load configuration from file and apply environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Like [`Config::load`], but a missing file yields the defaults
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        if !path.as_ref().exists() {
            let mut config = Self::default();
            config.apply_env_overrides();
            return Ok(config);
        }
        Self::load(path)
    }
}
