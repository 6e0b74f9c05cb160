//! Duration probing with ffprobe.
//!
//! The duration only feeds the progress percentage, so callers treat any
//! probe failure as "duration unknown" rather than failing the job.

use std::path::Path;
use std::process::Stdio;
use thiserror::Error;

/// Error type for probe operations.
#[derive(Debug, Error)]
pub enum ProbeError {
    /// ffprobe exited unsuccessfully.
    #[error("ffprobe failed: {0}")]
    FfprobeFailed(String),

    /// ffprobe printed no usable duration.
    #[error("ffprobe reported no duration")]
    NoDuration,

    /// IO error running ffprobe.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Parses the output of `-show_entries format=duration -of default=noprint_wrappers=1:nokey=1`.
///
/// Returns `None` for empty output, `N/A`, or non-positive values.
pub fn parse_duration_output(output: &str) -> Option<f64> {
    let value: f64 = output.lines().next()?.trim().parse().ok()?;
    (value.is_finite() && value > 0.0).then_some(value)
}

/// Probes the container duration of `input` in seconds.
pub async fn probe_duration(ffprobe: &Path, input: &Path) -> Result<f64, ProbeError> {
    let output = tokio::process::Command::new(ffprobe)
        .args([
            "-v",
            "error",
            "-show_entries",
            "format=duration",
            "-of",
            "default=noprint_wrappers=1:nokey=1",
        ])
        .arg(input)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(ProbeError::FfprobeFailed(format!(
            "ffprobe exited with status {}: {}",
            output.status,
            stderr.trim()
        )));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    parse_duration_output(&stdout).ok_or(ProbeError::NoDuration)
}
