//! Job model: conversion requests, lifecycle status and the persisted state record.
//!
//! A [`StateRecord`] is the flat document stored per job id. All lifecycle
//! mutations go through the methods here so the status state machine is
//! enforced in one place.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Accepted, waiting for a runner.
    #[default]
    Queued,
    /// Runner is fetching the source.
    Downloading,
    /// Transcoder is running.
    Encoding,
    /// Output artifact is ready.
    Completed,
    /// Job ended with an error.
    Failed,
}

impl JobStatus {
    /// Completed and failed are terminal.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Whether the lifecycle allows moving from `self` to `next`.
    ///
    /// `encoding -> encoding` is the only self-loop (progress updates).
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Queued, Downloading)
                | (Queued, Failed)
                | (Downloading, Encoding)
                | (Downloading, Failed)
                | (Encoding, Encoding)
                | (Encoding, Completed)
                | (Encoding, Failed)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Downloading => "downloading",
            JobStatus::Encoding => "encoding",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Target container format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Mp4,
    Mkv,
    Webm,
    Mov,
}

impl OutputFormat {
    /// File extension including the leading dot.
    pub fn extension(self) -> &'static str {
        match self {
            OutputFormat::Mp4 => ".mp4",
            OutputFormat::Mkv => ".mkv",
            OutputFormat::Webm => ".webm",
            OutputFormat::Mov => ".mov",
        }
    }

    pub fn mime(self) -> &'static str {
        match self {
            OutputFormat::Mp4 => "video/mp4",
            OutputFormat::Mkv => "video/x-matroska",
            OutputFormat::Webm => "video/webm",
            OutputFormat::Mov => "video/quicktime",
        }
    }

    /// Recover the format from a file name's extension (case-insensitive).
    pub fn from_file_name(name: &str) -> Option<Self> {
        let ext = Path::new(name).extension()?.to_str()?.to_lowercase();
        match ext.as_str() {
            "mp4" => Some(OutputFormat::Mp4),
            "mkv" => Some(OutputFormat::Mkv),
            "webm" => Some(OutputFormat::Webm),
            "mov" => Some(OutputFormat::Mov),
            _ => None,
        }
    }

    /// Output artifact name for this format, e.g. `output.mp4`.
    pub fn output_file_name(self) -> String {
        format!("output{}", self.extension())
    }
}

/// MIME type for a stored file name, falling back to a generic binary type.
pub fn mime_for_file_name(name: &str) -> &'static str {
    OutputFormat::from_file_name(name)
        .map(OutputFormat::mime)
        .unwrap_or("application/octet-stream")
}

/// Requested video codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum VideoCodec {
    #[default]
    Av1,
    #[serde(alias = "hevc")]
    H265,
}

/// Where to fetch the input media from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Source {
    #[serde(default)]
    pub url: String,
}

/// Optional encoding parameters; unset values fall back to defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ConvertParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<OutputFormat>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub codec: Option<VideoCodec>,
    /// Constant-quality value (CRF / CQ); codec default when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crf: Option<u32>,
}

impl ConvertParams {
    pub fn format_or_default(&self) -> OutputFormat {
        self.format.unwrap_or_default()
    }

    pub fn codec_or_default(&self) -> VideoCodec {
        self.codec.unwrap_or_default()
    }
}

/// Body of a submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ConvertRequest {
    #[serde(default)]
    pub source: Option<Source>,
    #[serde(default)]
    pub request: ConvertParams,
}

impl ConvertRequest {
    /// Convenience constructor with default parameters.
    pub fn from_url(url: impl Into<String>) -> Self {
        Self {
            source: Some(Source { url: url.into() }),
            request: ConvertParams::default(),
        }
    }

    /// The source URL, if one was supplied and is non-blank.
    pub fn source_url(&self) -> Option<&str> {
        self.source
            .as_ref()
            .map(|s| s.url.trim())
            .filter(|url| !url.is_empty())
    }
}

/// An accepted job handed to a runner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    /// Unique job identifier (UUID).
    pub id: String,
    pub request: ConvertRequest,
}

impl Job {
    /// Allocate a fresh id for a request.
    pub fn new(request: ConvertRequest) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            request,
        }
    }
}

/// Mutable projection of a job's progress, stored per job id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct StateRecord {
    pub status: JobStatus,
    /// Percent, 0-100.
    #[serde(default)]
    pub progress: u8,
    #[serde(default)]
    pub message: String,
    /// Unix timestamp (milliseconds) of submission.
    #[serde(default)]
    pub created_at: i64,
    /// Unix timestamp (milliseconds) of the last write.
    #[serde(default)]
    pub updated_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(default)]
    pub downloaded: bool,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<i64>,
}

impl StateRecord {
    /// Initial record written at submission.
    pub fn queued(created_at: i64) -> Self {
        Self {
            status: JobStatus::Queued,
            progress: 0,
            message: "Queued".to_string(),
            created_at,
            updated_at: created_at,
            ..Self::default()
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Update the record's updated_at timestamp to now.
    pub fn touch(&mut self) {
        self.updated_at = current_timestamp_ms();
    }

    fn advance(&mut self, next: JobStatus, message: impl Into<String>) -> bool {
        if !self.status.can_transition_to(next) {
            return false;
        }
        self.status = next;
        self.message = message.into();
        self.touch();
        true
    }

    /// queued -> downloading
    pub fn begin_download(&mut self) -> bool {
        self.advance(JobStatus::Downloading, "Downloading source")
    }

    /// downloading -> encoding, progress reset to 0.
    pub fn begin_encoding(&mut self) -> bool {
        let moved = self.status == JobStatus::Downloading
            && self.advance(JobStatus::Encoding, "Encoding started");
        if moved {
            self.progress = 0;
        }
        moved
    }

    /// Record an encoding progress sample.
    ///
    /// Ignored unless encoding; never decreases and never exceeds 99 (100 is
    /// reserved for completion). Returns whether the record changed.
    pub fn record_progress(&mut self, percent: u8) -> bool {
        if self.status != JobStatus::Encoding {
            return false;
        }
        let percent = percent.min(99);
        if percent <= self.progress && self.message == "Encoding in progress" {
            return false;
        }
        self.progress = self.progress.max(percent);
        self.message = "Encoding in progress".to_string();
        self.touch();
        true
    }

    /// encoding -> completed
    pub fn complete(&mut self, file_path: PathBuf, file_name: String) -> bool {
        if !self.advance(JobStatus::Completed, "Done") {
            return false;
        }
        self.progress = 100;
        self.file_path = Some(file_path);
        self.file_name = Some(file_name);
        true
    }

    /// Any non-terminal state -> failed. Progress keeps its last value.
    pub fn fail(&mut self, reason: impl Into<String>) -> bool {
        self.advance(JobStatus::Failed, reason)
    }

    pub fn mark_downloaded(&mut self) {
        self.downloaded = true;
        self.touch();
    }

    /// Record that the artifact is gone. Repeating it keeps the first timestamp.
    pub fn mark_deleted(&mut self, now_ms: i64) {
        if self.deleted {
            return;
        }
        self.deleted = true;
        self.deleted_at = Some(now_ms);
        self.updated_at = now_ms;
    }

    /// Completed, never downloaded, not yet deleted, and created at or before `cutoff_ms`.
    pub fn is_expired(&self, cutoff_ms: i64) -> bool {
        self.status == JobStatus::Completed
            && !self.downloaded
            && !self.deleted
            && self.created_at <= cutoff_ms
    }
}

/// Get current timestamp in milliseconds since Unix epoch.
pub fn current_timestamp_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
