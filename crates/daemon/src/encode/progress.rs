//! Parsing of ffmpeg's `-progress pipe:1` output.
//!
//! ffmpeg writes blocks of `key=value` lines; `out_time_us` (and the
//! historically misnamed `out_time_ms`, also microseconds) carry the elapsed
//! output time.

use std::time::{Duration, Instant};

/// Minimum spacing between progress writes to the state store.
pub const PROGRESS_EMIT_INTERVAL: Duration = Duration::from_millis(500);

/// Keys whose value is the elapsed output time in microseconds.
const OUT_TIME_KEYS: &[&str] = &["out_time_us", "out_time_ms"];

/// Percent ceiling while the process is still running.
const MAX_RUNNING_PERCENT: u8 = 99;

/// Split a progress line into `(key, value)`.
pub fn parse_progress_line(line: &str) -> Option<(&str, &str)> {
    let (key, value) = line.trim().split_once('=')?;
    let key = key.trim();
    if key.is_empty() {
        return None;
    }
    Some((key, value.trim()))
}

/// Percent of `duration_secs` covered by `out_time_us`, clamped to 0..=99.
pub fn percent_of(out_time_us: f64, duration_secs: f64) -> u8 {
    if duration_secs.is_nan() || duration_secs <= 0.0 || !out_time_us.is_finite() || out_time_us <= 0.0 {
        return 0;
    }
    let pct = (out_time_us / (duration_secs * 1_000_000.0) * 100.0).floor();
    pct.min(MAX_RUNNING_PERCENT as f64) as u8
}

/// Tracks percent complete across a progress stream.
#[derive(Debug, Clone)]
pub struct ProgressParser {
    duration_secs: Option<f64>,
    percent: u8,
}

impl ProgressParser {
    /// Without a known duration the percentage stays at zero.
    pub fn new(duration_secs: Option<f64>) -> Self {
        Self {
            duration_secs: duration_secs.filter(|d| d.is_finite() && *d > 0.0),
            percent: 0,
        }
    }

    pub fn percent(&self) -> u8 {
        self.percent
    }

    /// Consume one output line; returns the new percent when it advanced.
    pub fn feed_line(&mut self, line: &str) -> Option<u8> {
        let (key, value) = parse_progress_line(line)?;
        if !OUT_TIME_KEYS.contains(&key) {
            return None;
        }
        let duration = self.duration_secs?;
        let out_time_us: f64 = value.parse().ok()?;
        let pct = percent_of(out_time_us, duration);
        if pct > self.percent {
            self.percent = pct;
            Some(pct)
        } else {
            None
        }
    }
}

/// Rate limiter: `ready` is true at most once per interval.
#[derive(Debug, Clone)]
pub struct Throttle {
    interval: Duration,
    last: Instant,
}

impl Throttle {
    /// The first emission is allowed one interval after `start`.
    pub fn new(interval: Duration, start: Instant) -> Self {
        Self {
            interval,
            last: start,
        }
    }

    pub fn ready(&mut self, now: Instant) -> bool {
        if now.saturating_duration_since(self.last) >= self.interval {
            self.last = now;
            true
        } else {
            false
        }
    }
}
