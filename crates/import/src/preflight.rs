//! Preflight analysis (spec.md §4.6 `analyzeBundle`): a cheap scan over the
//! bundle that reports line/byte counts, time span, label cardinality,
//! timestamp scale, and a retention cutoff, before any network call is made.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;

use bridge_common::Result;
use bridge_core::jsonl::JsonlDecoder;
use serde::{Deserialize, Serialize};
use tokio::fs::File;

/// Default sample size for a preflight scan (spec.md §4.6).
pub const DEFAULT_SAMPLE_LINES: u64 = 2000;

/// A recommended ceiling used to flag unusually wide label sets; the
/// importer doesn't reject such series, only warns.
const RECOMMENDED_MAX_LABELS: usize = 20;

/// Timestamp magnitude, detected from the sampled records and normalized
/// to milliseconds (spec.md §4.6 "timestamp scale auto-detection").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimestampScale {
    Seconds,
    Milliseconds,
    Microseconds,
    Nanoseconds,
}

impl TimestampScale {
    /// Classify a single raw timestamp value by its magnitude. Current
    /// Unix time in seconds is ~10 digits, milliseconds ~13, microseconds
    /// ~16, nanoseconds ~19.
    fn detect(raw: i64) -> Self {
        match raw.unsigned_abs() {
            0..=99_999_999_999 => TimestampScale::Seconds,
            100_000_000_000..=99_999_999_999_999 => TimestampScale::Milliseconds,
            100_000_000_000_000..=99_999_999_999_999_999 => TimestampScale::Microseconds,
            _ => TimestampScale::Nanoseconds,
        }
    }

    /// Factor to multiply a raw timestamp by to normalize it to milliseconds.
    pub fn to_millis_factor(self) -> f64 {
        match self {
            TimestampScale::Seconds => 1_000.0,
            TimestampScale::Milliseconds => 1.0,
            TimestampScale::Microseconds => 1.0 / 1_000.0,
            TimestampScale::Nanoseconds => 1.0 / 1_000_000.0,
        }
    }
}

/// Result of a bundle preflight scan (spec.md §4.6, §6 `/api/analyze`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreflightReport {
    pub line_count: u64,
    pub byte_size: u64,
    pub sampled: bool,
    pub earliest_ms: Option<i64>,
    pub latest_ms: Option<i64>,
    pub skipped_lines: u64,
    pub label_cardinality: BTreeMap<String, u64>,
    pub max_labels_per_series: usize,
    pub timestamp_scale: TimestampScale,
    pub retention_cutoff_ms: Option<i64>,
    pub warnings: Vec<String>,
}

/// Scans `metrics_path`, reading up to `sample_lines` records (or the whole
/// file when `full_scan` is set), and reports the statistics above.
/// `target_retention_secs` is the TSDB's reported retention window, used to
/// compute the drop-old cutoff and the "span exceeds retention" warning.
pub async fn analyze_bundle(
    metrics_path: &Path,
    sample_lines: u64,
    full_scan: bool,
    target_retention_secs: u64,
) -> Result<PreflightReport> {
    let byte_size = tokio::fs::metadata(metrics_path).await.map_err(bridge_common::Error::Io)?.len();

    let file = File::open(metrics_path).await.map_err(bridge_common::Error::Io)?;
    let mut decoder = JsonlDecoder::new(file);

    let limit = if full_scan { u64::MAX } else { sample_lines.max(1) };
    let mut line_count = 0u64;
    let mut skipped_lines = 0u64;
    let mut earliest_ms: Option<i64> = None;
    let mut latest_ms: Option<i64> = None;
    let mut max_labels_per_series = 0usize;
    let mut cardinality: HashMap<String, HashSet<String>> = HashMap::new();
    let mut scales_seen: HashMap<TimestampScale, u64> = HashMap::new();

    while line_count < limit {
        let Some((_, raw)) = decoder.next_line().await? else { break };
        line_count += 1;

        let value: serde_json::Value = match serde_json::from_slice(&raw) {
            Ok(v) => v,
            Err(_) => {
                skipped_lines += 1;
                continue;
            }
        };

        let Some(record) = parse_record(&value) else {
            skipped_lines += 1;
            continue;
        };

        max_labels_per_series = max_labels_per_series.max(record.labels.len());
        for (key, val) in &record.labels {
            cardinality.entry(key.clone()).or_default().insert(val.clone());
        }

        for &ts in &record.timestamps {
            let scale = TimestampScale::detect(ts);
            *scales_seen.entry(scale).or_insert(0) += 1;
            let normalized = (ts as f64 * scale.to_millis_factor()).round() as i64;
            earliest_ms = Some(earliest_ms.map_or(normalized, |e: i64| e.min(normalized)));
            latest_ms = Some(latest_ms.map_or(normalized, |l: i64| l.max(normalized)));
        }
    }

    // Drain any remaining lines so byte_size/line_count reflect the whole
    // file even under a sampled scan, without paying the parse cost.
    if !full_scan {
        while decoder.next_line().await?.is_some() {
            line_count += 1;
        }
    }

    let timestamp_scale =
        scales_seen.into_iter().max_by_key(|(_, count)| *count).map(|(scale, _)| scale).unwrap_or(TimestampScale::Milliseconds);

    let retention_cutoff_ms =
        Some(chrono::Utc::now().timestamp_millis() - (target_retention_secs as i64 * 1000));

    let mut warnings = Vec::new();
    if let (Some(earliest), Some(latest)) = (earliest_ms, latest_ms) {
        let span_ms = latest - earliest;
        if span_ms > target_retention_secs as i64 * 1000 {
            warnings.push("span exceeds retention window".to_string());
        }
    }
    if max_labels_per_series > RECOMMENDED_MAX_LABELS {
        warnings.push("max labels exceeds target".to_string());
    }
    if timestamp_scale != TimestampScale::Milliseconds {
        warnings.push(format!("normalized timestamp scale: {timestamp_scale:?} -> milliseconds"));
    }

    let label_cardinality = cardinality.into_iter().map(|(k, v)| (k, v.len() as u64)).collect();

    Ok(PreflightReport {
        line_count,
        byte_size,
        sampled: !full_scan,
        earliest_ms,
        latest_ms,
        skipped_lines,
        label_cardinality,
        max_labels_per_series,
        timestamp_scale,
        retention_cutoff_ms,
        warnings,
    })
}

struct ParsedRecord {
    labels: BTreeMap<String, String>,
    timestamps: Vec<i64>,
}

/// Best-effort extraction that doesn't fail the whole scan on one record's
/// quirks: a `values` array with non-numeric entries is tolerated here
/// (tracked as a skip), since `analyzeBundle` only needs the shape, not the
/// full round-trip `MetricRecord` validation the streaming stage performs.
fn parse_record(value: &serde_json::Value) -> Option<ParsedRecord> {
    let labels: BTreeMap<String, String> = value
        .get("labels")?
        .as_object()?
        .iter()
        .map(|(k, v)| (k.clone(), v.as_str().map(|s| s.to_string()).unwrap_or_else(|| v.to_string())))
        .collect();

    let timestamps: Vec<i64> = value.get("timestamps")?.as_array()?.iter().filter_map(|t| t.as_i64()).collect();
    if timestamps.is_empty() {
        return None;
    }

    Some(ParsedRecord { labels, timestamps })
}
