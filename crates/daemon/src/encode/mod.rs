//! Transcode engine adapter: ffmpeg invocation and progress interpretation

pub mod ffmpeg;
pub mod progress;

pub use ffmpeg::{build_ffmpeg_command, run_ffmpeg, EncodeError, EncodeParams, EncodeProfile};
pub use progress::{ProgressParser, Throttle, PROGRESS_EMIT_INTERVAL};
