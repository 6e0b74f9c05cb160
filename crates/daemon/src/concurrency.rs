//! Concurrency planning module
//!
//! Derives how many jobs may run in-process at once from the CPU core count
//! and configuration.

use crate::config::Config;

/// Jobs sharing one GPU on the hardware path
const HARDWARE_CONCURRENT_JOBS: u32 = 2;

/// Logical cores budgeted per software encode
const CORES_PER_SOFTWARE_JOB: u32 = 8;

/// Concurrency plan derived from configuration and system resources
#[derive(Debug, Clone, PartialEq)]
pub struct ConcurrencyPlan {
    /// Total logical CPU cores available
    pub total_cores: u32,
    /// Maximum number of concurrent in-process jobs
    pub max_concurrent_jobs: u32,
}

impl ConcurrencyPlan {
    /// Derive a concurrency plan from configuration, detecting cores via num_cpus
    pub fn derive(cfg: &Config) -> Self {
        Self::derive_with_cores(cfg, num_cpus::get() as u32)
    }

    /// Derive a concurrency plan for a known core count
    ///
    /// Uses the following rules:
    /// - An explicit non-zero `dispatch.max_concurrent_jobs` is used unchanged
    /// - Hardware path: 2 jobs
    /// - Software path: one job per 8 cores, at least 1
    pub fn derive_with_cores(cfg: &Config, total_cores: u32) -> Self {
        let total_cores = total_cores.max(1);
        let max_concurrent_jobs = if cfg.dispatch.max_concurrent_jobs > 0 {
            cfg.dispatch.max_concurrent_jobs
        } else {
            derive_max_jobs(total_cores, cfg.encoder.hardware_acceleration)
        };

        Self {
            total_cores,
            max_concurrent_jobs,
        }
    }
}

fn derive_max_jobs(cores: u32, hardware_acceleration: bool) -> u32 {
    if hardware_acceleration {
        HARDWARE_CONCURRENT_JOBS
    } else {
        (cores / CORES_PER_SOFTWARE_JOB).max(1)
    }
}

/// Public function to derive a concurrency plan from configuration
pub fn derive_plan(cfg: &Config) -> ConcurrencyPlan {
    ConcurrencyPlan::derive(cfg)
}
