//! Startup checks module
//!
//! Preflight checks run before the service accepts jobs:
//! - ffmpeg and ffprobe can be executed
//! - with hardware acceleration enabled, ffmpeg lists the NVENC encoders

use crate::config::Config;
use std::path::Path;
use std::process::Command;
use thiserror::Error;

/// Encoders the hardware profiles invoke
pub const HARDWARE_ENCODERS: &[&str] = &["av1_nvenc", "hevc_nvenc"];

/// Error types for startup checks
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("{tool} not available: {detail}")]
    ToolUnavailable { tool: String, detail: String },

    #[error("Hardware acceleration enabled but ffmpeg lacks encoder {0}")]
    MissingEncoder(String),
}

/// Extract the version token following `<tool> version` in `-version` output
///
/// Handles git-describe style versions prefixed with `n` (e.g. `n7.1-...`).
pub fn parse_tool_version(version_output: &str, tool: &str) -> Option<String> {
    let marker = format!("{} version", tool.to_lowercase());
    let line = version_output
        .lines()
        .map(str::to_lowercase)
        .find(|line| line.contains(&marker))?;

    let token = line.split(&marker).nth(1)?.split_whitespace().next()?;
    Some(token.trim_start_matches('n').to_string())
}

/// Encoder names from `ffmpeg -encoders` output
///
/// Entries follow a `------` separator line, as `<flags> <name> <description>`.
pub fn parse_encoder_list(output: &str) -> Vec<String> {
    output
        .lines()
        .skip_while(|line| !line.trim_start().starts_with("---"))
        .skip(1)
        .filter_map(|line| line.split_whitespace().nth(1))
        .map(str::to_string)
        .collect()
}

fn run_tool(path: &Path, tool: &str, arg: &str) -> Result<String, StartupError> {
    let output = Command::new(path).arg(arg).output().map_err(|e| {
        StartupError::ToolUnavailable {
            tool: tool.to_string(),
            detail: format!("failed to run {} {}: {}", path.display(), arg, e),
        }
    })?;

    if !output.status.success() {
        return Err(StartupError::ToolUnavailable {
            tool: tool.to_string(),
            detail: format!("{} {} exited with {}", path.display(), arg, output.status),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Check that `<path> -version` runs, returning the reported version if parseable
pub fn check_tool_available(path: &Path, tool: &str) -> Result<Option<String>, StartupError> {
    let output = run_tool(path, tool, "-version")?;
    let version = parse_tool_version(&output, tool);
    match &version {
        Some(v) => tracing::info!(tool, version = %v, "found {}", tool),
        None => tracing::warn!(tool, "could not parse {} version", tool),
    }
    Ok(version)
}

/// Check that ffmpeg was built with every encoder the hardware profiles use
pub fn check_hardware_encoders(ffmpeg: &Path) -> Result<(), StartupError> {
    let encoders = parse_encoder_list(&run_tool(ffmpeg, "ffmpeg", "-encoders")?);
    for required in HARDWARE_ENCODERS {
        if !encoders.iter().any(|e| e == required) {
            return Err(StartupError::MissingEncoder(required.to_string()));
        }
    }
    Ok(())
}

/// Run all startup checks in order
///
/// Checks are run in the following order:
/// 1. ffmpeg availability
/// 2. ffprobe availability
/// 3. Hardware encoders (only with hardware acceleration enabled)
pub fn run_startup_checks(cfg: &Config) -> Result<(), StartupError> {
    check_tool_available(&cfg.encoder.ffmpeg_path, "ffmpeg")?;
    check_tool_available(&cfg.encoder.ffprobe_path, "ffprobe")?;
    if cfg.encoder.hardware_acceleration {
        check_hardware_encoders(&cfg.encoder.ffmpeg_path)?;
    }
    Ok(())
}
