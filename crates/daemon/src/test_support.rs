//! Stand-in tools and a source server for runner tests.

use axum::{routing::get, Router};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

pub(crate) const SOURCE_BYTES: &[u8] = b"pretend this is a video";
pub(crate) const ENCODED_BYTES: &[u8] = b"pretend this is av1";

pub(crate) fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// ffprobe that always reports a 10 second duration.
pub(crate) fn fake_ffprobe(dir: &Path) -> PathBuf {
    write_script(dir, "ffprobe", "echo 10.000000")
}

/// ffprobe that cannot read its input.
pub(crate) fn broken_ffprobe(dir: &Path) -> PathBuf {
    write_script(dir, "ffprobe", "echo 'moov atom not found' >&2; exit 1")
}

/// ffmpeg that reports progress and writes its last argument.
pub(crate) fn fake_ffmpeg(dir: &Path) -> PathBuf {
    write_script(
        dir,
        "ffmpeg",
        &format!(
            "for last; do :; done\n\
             echo out_time_us=2500000\n\
             sleep 1\n\
             echo out_time_us=6000000\n\
             printf '{}' > \"$last\"\n\
             echo progress=end",
            std::str::from_utf8(ENCODED_BYTES).unwrap()
        ),
    )
}

/// ffmpeg that makes some progress and then fails.
pub(crate) fn failing_ffmpeg(dir: &Path) -> PathBuf {
    write_script(
        dir,
        "ffmpeg",
        "echo out_time_us=4000000\nsleep 1\necho out_time_us=4100000\necho 'Conversion failed!' >&2\nexit 1",
    )
}

/// ffmpeg that never finishes or reports progress.
pub(crate) fn stalled_ffmpeg(dir: &Path) -> PathBuf {
    write_script(dir, "ffmpeg", "exec sleep 30")
}

/// Serve [`SOURCE_BYTES`] at `/source.mov`; returns the full URL.
pub(crate) async fn serve_source() -> String {
    let router = Router::new().route("/source.mov", get(|| async { SOURCE_BYTES }));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });
    format!("http://{}/source.mov", addr)
}
