//! ffmpeg encoder module
//!
//! Builds the ffmpeg invocation for a job and runs it, streaming
//! machine-readable progress from its stdout.

use super::progress::{ProgressParser, Throttle, PROGRESS_EMIT_INTERVAL};
use crate::jobs::{OutputFormat, VideoCodec};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::time::Instant;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};

/// Lines of ffmpeg stderr kept for failure diagnostics
const STDERR_TAIL_LINES: usize = 8;

/// Audio is always re-encoded at a fixed bitrate and sample rate
const AUDIO_BITRATE: &str = "192k";
const AUDIO_SAMPLE_RATE: &str = "48000";

/// Error type for encoding operations
#[derive(Debug, Error)]
pub enum EncodeError {
    /// ffmpeg exited with non-zero status
    #[error("ffmpeg failed with exit code {code}: {detail}")]
    FfmpegFailed { code: i32, detail: String },

    /// ffmpeg was terminated by a signal
    #[error("ffmpeg was terminated by signal: {detail}")]
    Terminated { detail: String },

    /// stdout was not captured
    #[error("ffmpeg progress pipe unavailable")]
    MissingStdout,

    /// IO error spawning ffmpeg or reading its output
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Invocation profile, chosen from hardware availability and codec
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodeProfile {
    /// NVENC AV1
    HardwareAv1,
    /// NVENC HEVC
    HardwareHevc,
    /// SVT-AV1 on the CPU, used whenever hardware is unavailable
    Software,
}

impl EncodeProfile {
    pub fn select(hardware_acceleration: bool, codec: VideoCodec) -> Self {
        match (hardware_acceleration, codec) {
            (true, VideoCodec::Av1) => EncodeProfile::HardwareAv1,
            (true, VideoCodec::H265) => EncodeProfile::HardwareHevc,
            (false, _) => EncodeProfile::Software,
        }
    }

    /// Quality used when the request leaves it unset
    pub fn default_quality(self) -> u32 {
        match self {
            EncodeProfile::HardwareAv1 => 32,
            EncodeProfile::HardwareHevc => 28,
            EncodeProfile::Software => 32,
        }
    }

    pub fn video_encoder(self) -> &'static str {
        match self {
            EncodeProfile::HardwareAv1 => "av1_nvenc",
            EncodeProfile::HardwareHevc => "hevc_nvenc",
            EncodeProfile::Software => "libsvtav1",
        }
    }
}

/// Parameters for one ffmpeg run
#[derive(Debug, Clone)]
pub struct EncodeParams {
    pub ffmpeg_path: PathBuf,
    pub input_path: PathBuf,
    pub output_path: PathBuf,
    pub format: OutputFormat,
    pub codec: VideoCodec,
    /// Explicit quality; overrides the profile default
    pub quality: Option<u32>,
    pub hardware_acceleration: bool,
}

impl EncodeParams {
    pub fn profile(&self) -> EncodeProfile {
        EncodeProfile::select(self.hardware_acceleration, self.codec)
    }

    pub fn effective_quality(&self) -> u32 {
        self.quality
            .unwrap_or_else(|| self.profile().default_quality())
    }
}

/// Build the ffmpeg command for a job
///
/// Every profile re-encodes audio, overwrites the output and streams
/// `key=value` progress to stdout (`-progress pipe:1`).
pub fn build_ffmpeg_command(params: &EncodeParams) -> Command {
    let profile = params.profile();
    let quality = params.effective_quality().to_string();

    let mut cmd = Command::new(&params.ffmpeg_path);
    cmd.args(["-hide_banner", "-nostats", "-y"]);

    match profile {
        EncodeProfile::HardwareAv1 | EncodeProfile::HardwareHevc => {
            cmd.args(["-hwaccel", "cuda", "-hwaccel_output_format", "cuda"]);
            cmd.arg("-i").arg(&params.input_path);
            cmd.args(["-c:v", profile.video_encoder(), "-preset", "p4"]);
            cmd.arg("-cq").arg(&quality);
            cmd.args(["-b:v", "0"]);
        }
        EncodeProfile::Software => {
            cmd.arg("-i").arg(&params.input_path);
            cmd.args(["-c:v", profile.video_encoder()]);
            cmd.arg("-crf").arg(&quality);
            cmd.args(["-preset", "6", "-pix_fmt", "yuv420p"]);
        }
    }

    // WebM only carries Vorbis/Opus audio
    let audio_codec = match params.format {
        OutputFormat::Webm => "libopus",
        _ => "aac",
    };
    cmd.args(["-c:a", audio_codec, "-b:a", AUDIO_BITRATE, "-ar", AUDIO_SAMPLE_RATE]);

    if matches!(params.format, OutputFormat::Mp4 | OutputFormat::Mov) {
        cmd.args(["-movflags", "+faststart"]);
    }

    cmd.args(["-progress", "pipe:1"]);
    cmd.arg(&params.output_path);
    cmd
}

/// Keep the last `max_lines` lines of a stream
async fn collect_tail<R: AsyncRead + Unpin>(reader: R, max_lines: usize) -> String {
    let mut lines = BufReader::new(reader).lines();
    let mut tail = VecDeque::with_capacity(max_lines);
    while let Ok(Some(line)) = lines.next_line().await {
        if line.trim().is_empty() {
            continue;
        }
        if tail.len() == max_lines {
            tail.pop_front();
        }
        tail.push_back(line);
    }
    Vec::from(tail).join("\n")
}

/// Run ffmpeg, reporting throttled progress percentages to `on_progress`
///
/// Reported values never exceed 99; the caller reports 100 after `Ok(())`.
/// Without a known duration the reported percentage stays at 0.
///
/// # Errors
/// Returns an error if:
/// - ffmpeg fails to start or its stdout cannot be read
/// - ffmpeg exits with non-zero status or is terminated by a signal
pub async fn run_ffmpeg<F>(
    params: &EncodeParams,
    duration_secs: Option<f64>,
    mut on_progress: F,
) -> Result<(), EncodeError>
where
    F: FnMut(u8),
{
    let mut cmd = tokio::process::Command::from(build_ffmpeg_command(params));
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    tracing::debug!(command = ?cmd.as_std(), "spawning ffmpeg");
    let mut child = cmd.spawn()?;

    let stdout = child.stdout.take().ok_or(EncodeError::MissingStdout)?;
    let stderr_task = child
        .stderr
        .take()
        .map(|stderr| tokio::spawn(collect_tail(stderr, STDERR_TAIL_LINES)));

    let mut parser = ProgressParser::new(duration_secs);
    let mut throttle = Throttle::new(PROGRESS_EMIT_INTERVAL, Instant::now());
    let mut lines = BufReader::new(stdout).lines();

    let read_result: std::io::Result<()> = async {
        while let Some(line) = lines.next_line().await? {
            parser.feed_line(&line);
            if throttle.ready(Instant::now()) {
                on_progress(parser.percent());
            }
        }
        Ok(())
    }
    .await;

    if let Err(e) = read_result {
        if let Err(kill_err) = child.kill().await {
            tracing::debug!(error = %kill_err, "could not kill ffmpeg after read failure");
        }
        return Err(EncodeError::Io(e));
    }

    let status = child.wait().await?;
    let detail = match stderr_task {
        Some(handle) => handle.await.unwrap_or_default(),
        None => String::new(),
    };
    let detail = if detail.is_empty() {
        "no diagnostic output".to_string()
    } else {
        detail
    };

    if status.success() {
        Ok(())
    } else {
        match status.code() {
            Some(code) => Err(EncodeError::FfmpegFailed { code, detail }),
            None => Err(EncodeError::Terminated { detail }),
        }
    }
}
