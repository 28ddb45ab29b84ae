//! Batch window computation.

use bridge_common::TimeRange;
use serde::{Deserialize, Serialize};

/// Minimum interval between batch windows, in seconds.
pub const MIN_INTERVAL_SECS: i64 = 30;

/// A half-open `[start, end)` window within an export's overall time range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchWindow {
    pub start: chrono::DateTime<chrono::Utc>,
    pub end: chrono::DateTime<chrono::Utc>,
}

impl BatchWindow {
    pub fn duration_secs(&self) -> i64 {
        (self.end - self.start).num_seconds()
    }
}

/// Default batch interval for a given total duration:
/// <1h -> 30s, <24h -> 60s, else 300s.
pub fn default_interval_secs(duration: chrono::Duration) -> i64 {
    if duration < chrono::Duration::hours(1) {
        30
    } else if duration < chrono::Duration::hours(24) {
        60
    } else {
        300
    }
}

/// Same thresholds but for the client-side fallback step selection:
/// <1h -> 15s, <24h -> 60s, else 300s. The 30s floor applies only to a
/// caller-supplied override, never to the base step (spec.md §4.1: "never
/// below 30s" governs overrides, and the base <1h step is 15s).
pub fn fallback_step_secs(duration: chrono::Duration, override_secs: Option<i64>) -> i64 {
    let base = if duration < chrono::Duration::hours(1) {
        15
    } else if duration < chrono::Duration::hours(24) {
        60
    } else {
        300
    };
    match override_secs {
        Some(s) => s.max(MIN_INTERVAL_SECS),
        None => base,
    }
}

/// Partition `range` into contiguous, non-overlapping windows of
/// `interval_secs` seconds, clamped to a minimum of 30s, with a final
/// possibly-short window. Returns `(windows, batch_window_seconds)`.
///
/// Invariants enforced: windows are contiguous and non-overlapping, the
/// last window's end equals `range.end` exactly, and every window's length
/// is >= 30s (the final window may be shorter than `interval_secs` but the
/// caller is responsible for choosing an `interval_secs` that keeps it
/// above the floor when the total duration is itself >= 30s).
pub fn compute_batch_windows(range: TimeRange, interval_secs: i64) -> (Vec<BatchWindow>, i64) {
    let interval_secs = interval_secs.max(MIN_INTERVAL_SECS);
    let interval = chrono::Duration::seconds(interval_secs);

    let mut windows = Vec::new();
    let mut cursor = range.start;
    while cursor < range.end {
        let next = std::cmp::min(cursor + interval, range.end);
        windows.push(BatchWindow { start: cursor, end: next });
        cursor = next;
    }
    if windows.is_empty() {
        windows.push(BatchWindow { start: range.start, end: range.end });
    }
    (windows, interval_secs)
}

/// Resolve the interval to use for a given range, honoring an optional
/// user override (clamped to >= 30s).
pub fn resolve_interval_secs(range: TimeRange, custom_interval_secs: Option<i64>) -> i64 {
    custom_interval_secs
        .map(|s| s.max(MIN_INTERVAL_SECS))
        .unwrap_or_else(|| default_interval_secs(range.duration()))
}
