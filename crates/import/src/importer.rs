//! Chunked streaming import with resume, and post-import verification
//! (spec.md §4.6 "Streaming import", "Verification").

use std::collections::BTreeMap;
use std::io::SeekFrom;
use std::path::Path;
use std::sync::Arc;

use bridge_client::TsdbClient;
use bridge_common::{Error, MetricRecord, Result};
use bridge_core::config::ImportConfig;
use bridge_core::job::{ImportSummaryEntry, VerificationResult};
use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// One observation of import progress, mirroring the counters `bridge-core`
/// tracks on `ImportJob` (spec.md §3 ImportJob, §4.6 "Progress updates").
#[derive(Debug, Clone, Copy, Default)]
pub struct ImportProgress {
    /// Cumulative totals for this `stream_import` invocation (resets to
    /// zero on every call, including a resumed one); callers that need an
    /// absolute job-wide count add these to the counts the job already had
    /// before this run started.
    pub bytes_sent: u64,
    pub points: u64,
    pub dropped_old: u64,
    pub skipped_lines: u64,
    pub chunks_completed: u64,
}

/// Accumulated result of a fully successful streaming import run.
#[derive(Debug, Clone, Default)]
pub struct ImportRunResult {
    pub points: u64,
    pub dropped_old: u64,
    pub skipped_lines: u64,
    pub bytes_sent: u64,
    pub lines_read: u64,
    pub summary: Vec<ImportSummaryEntry>,
}

/// Error raised mid-stream, carrying the byte offset the job should resume
/// from (spec.md §4.6 "On a failed chunk POST").
#[derive(Debug)]
pub struct ImportRunError {
    pub error: Error,
    pub resume_offset: u64,
}

/// Streams `metrics_path` into the target TSDB chunk by chunk, starting
/// from `resume_offset`. Drops per-point samples older than
/// `retention_cutoff_ms` when `config.drop_old` is set; records with
/// non-numeric values are skipped (counted, not fatal).
pub async fn stream_import(
    client: &dyn TsdbClient,
    config: &ImportConfig,
    metrics_path: &Path,
    resume_offset: u64,
    retention_cutoff_ms: i64,
    cancel: &CancellationToken,
    mut on_progress: impl FnMut(ImportProgress) + Send,
) -> std::result::Result<ImportRunResult, ImportRunError> {
    let mut file = tokio::fs::File::open(metrics_path)
        .await
        .map_err(|e| ImportRunError { error: Error::Io(e), resume_offset })?;
    file.seek(SeekFrom::Start(resume_offset))
        .await
        .map_err(|e| ImportRunError { error: Error::Io(e), resume_offset })?;
    let mut reader = BufReader::new(file);

    let mut offset = resume_offset;
    // File-byte offset marking the start of the lines accumulated into the
    // in-flight chunk; this (not the re-encoded chunk length) is what a
    // failed POST must resume from, since JSONL re-encoding doesn't
    // preserve the source file's byte layout.
    let mut chunk_start_offset = resume_offset;
    let mut chunk = BytesMut::new();
    let mut result = ImportRunResult::default();
    let mut first_seen: BTreeMap<String, ImportSummaryEntry> = BTreeMap::new();
    let mut chunks_completed = 0u64;

    loop {
        if cancel.is_cancelled() {
            return Err(ImportRunError { error: Error::Cancellation, resume_offset: chunk_start_offset });
        }

        let mut raw = Vec::new();
        let read = reader
            .read_until(b'\n', &mut raw)
            .await
            .map_err(|e| ImportRunError { error: Error::Io(e), resume_offset: chunk_start_offset })?;
        let at_eof = read == 0;
        if !at_eof {
            offset += read as u64;
            result.lines_read += 1;
        }

        if !at_eof {
            let mut line = raw.as_slice();
            while line.last() == Some(&b'\n') || line.last() == Some(&b'\r') {
                line = &line[..line.len() - 1];
            }
            if !line.is_empty() {
                match normalize_record(line, retention_cutoff_ms, config.drop_old) {
                    NormalizeOutcome::Accepted(record) => {
                        note_summary(&mut first_seen, &record);
                        result.points += 1;
                        let mut encoded = serde_json::to_vec(&record)
                            .map_err(Error::Serialization)
                            .map_err(|error| ImportRunError { error, resume_offset: chunk_start_offset })?;
                        encoded.push(b'\n');
                        chunk.put_slice(&encoded);
                    }
                    NormalizeOutcome::DroppedOld => result.dropped_old += 1,
                    NormalizeOutcome::Invalid => result.skipped_lines += 1,
                }
            }
        }

        let flush_due = chunk.len() >= config.chunk_size_bytes || (at_eof && !chunk.is_empty());
        if flush_due {
            let body: Bytes = chunk.split().freeze();
            let chunk_bytes = body.len() as u64;
            client
                .import_chunk(body)
                .await
                .map_err(|error| ImportRunError { error, resume_offset: chunk_start_offset })?;
            result.bytes_sent += chunk_bytes;
            chunk_start_offset = offset;
            chunks_completed += 1;
            on_progress(ImportProgress {
                bytes_sent: result.bytes_sent,
                points: result.points,
                dropped_old: result.dropped_old,
                skipped_lines: result.skipped_lines,
                chunks_completed,
            });
            debug!(bytes = chunk_bytes, offset, "posted import chunk");
        }

        if at_eof {
            break;
        }
    }

    result.summary = first_seen.into_values().collect();
    Ok(result)
}

/// Line-level classification of one JSONL record (spec.md §8: `points`,
/// `dropped_old` and `skipped` are all counted per *line*, since a line is
/// the unit `lines_read` counts — `dropped_old + skipped + points =
/// lines_read` must hold even though a single line's parallel
/// `values`/`timestamps` arrays may carry more than one sample).
enum NormalizeOutcome {
    /// The line produced a record with at least one surviving sample.
    Accepted(MetricRecord),
    /// Every sample in the line predates the retention cutoff.
    DroppedOld,
    /// The line could not be parsed into a usable record at all (bad
    /// JSON, missing `__name__`, non-numeric values, mismatched arrays).
    Invalid,
}

/// Parses one JSONL line into a `MetricRecord`, normalizes numeric values
/// that arrived as JSON strings, and drops per-point samples whose
/// timestamp predates `retention_cutoff_ms` when `drop_old` is set.
fn normalize_record(line: &[u8], retention_cutoff_ms: i64, drop_old: bool) -> NormalizeOutcome {
    let Ok(value) = serde_json::from_slice::<serde_json::Value>(line) else { return NormalizeOutcome::Invalid };
    let Some(labels_obj) = value.get("labels").and_then(|v| v.as_object()) else { return NormalizeOutcome::Invalid };
    let labels: BTreeMap<String, String> =
        labels_obj.iter().map(|(k, v)| (k.clone(), v.as_str().unwrap_or_default().to_string())).collect();
    if !labels.contains_key("__name__") {
        return NormalizeOutcome::Invalid;
    }

    let Some(raw_timestamps) = value.get("timestamps").and_then(|v| v.as_array()) else { return NormalizeOutcome::Invalid };
    let raw_timestamps: Vec<i64> = raw_timestamps.iter().filter_map(|t| t.as_i64()).collect();
    let Some(raw_values) = value.get("values").and_then(|v| v.as_array()) else { return NormalizeOutcome::Invalid };
    let Some(raw_values) = raw_values
        .iter()
        .map(|v| v.as_f64().or_else(|| v.as_str().and_then(|s| s.parse::<f64>().ok())))
        .collect::<Option<Vec<f64>>>()
    else {
        return NormalizeOutcome::Invalid;
    };
    if raw_timestamps.len() != raw_values.len() || raw_timestamps.is_empty() {
        return NormalizeOutcome::Invalid;
    }

    let mut timestamps = Vec::with_capacity(raw_timestamps.len());
    let mut values = Vec::with_capacity(raw_values.len());
    for (ts, val) in raw_timestamps.into_iter().zip(raw_values) {
        if drop_old && ts < retention_cutoff_ms {
            continue;
        }
        timestamps.push(ts);
        values.push(val);
    }

    if timestamps.is_empty() {
        return NormalizeOutcome::DroppedOld;
    }

    NormalizeOutcome::Accepted(MetricRecord { labels, values, timestamps })
}

fn note_summary(seen: &mut BTreeMap<String, ImportSummaryEntry>, record: &MetricRecord) {
    let name = record.metric_name().to_string();
    let start = record.timestamps.first().copied().unwrap_or_default();
    let end = record.timestamps.last().copied().unwrap_or_default();
    seen.entry(name.clone())
        .and_modify(|entry| {
            entry.observed_start_ms = entry.observed_start_ms.min(start);
            entry.observed_end_ms = entry.observed_end_ms.max(end);
        })
        .or_insert(ImportSummaryEntry { metric_name: name, example_labels: record.labels.clone(), observed_start_ms: start, observed_end_ms: end });
}

/// Builds an exact-match label matcher from the first imported metric's
/// stable labels (`__name__` plus every other label) and queries the
/// target's `series` endpoint over the bundle's time window, padded by one
/// minute on each side (spec.md §4.6 Verification).
pub async fn verify_import(
    client: Arc<dyn TsdbClient>,
    summary: &[ImportSummaryEntry],
    window_start_ms: i64,
    window_end_ms: i64,
) -> Result<Option<VerificationResult>> {
    let Some(first) = summary.first() else { return Ok(None) };

    let mut parts = Vec::with_capacity(first.example_labels.len());
    for (key, value) in &first.example_labels {
        parts.push(format!("{key}=\"{}\"", escape_exact(value)));
    }
    let matcher = format!("{{{}}}", parts.join(","));

    let pad = chrono::Duration::minutes(1);
    let start = chrono::DateTime::from_timestamp_millis(window_start_ms).unwrap_or_else(chrono::Utc::now) - pad;
    let end = chrono::DateTime::from_timestamp_millis(window_end_ms).unwrap_or_else(chrono::Utc::now) + pad;

    match client.series(&matcher, start, end).await {
        Ok(series) => Ok(Some(VerificationResult { matched_series: series.len() as u64 })),
        Err(e) => {
            warn!(error = %e, "post-import verification query failed");
            Err(e)
        }
    }
}

fn escape_exact(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

#[cfg(test)]
mod tests {
    use super::*;
    use bridge_client::RecordingImportTarget;
    use std::collections::BTreeMap as Map;
    use std::sync::Mutex;

    fn target(fail_after: Option<usize>) -> RecordingImportTarget {
        RecordingImportTarget {
            retention_secs: 3600,
            series_response: vec![{
                let mut m = Map::new();
                m.insert("__name__".to_string(), "up".to_string());
                m
            }],
            posted_chunks: Mutex::new(Vec::new()),
            fail_after,
        }
    }

    async fn write_file(dir: &Path, content: &str) -> std::path::PathBuf {
        let path = dir.join("metrics.jsonl");
        tokio::fs::write(&path, content).await.unwrap();
        path
    }

    fn config(dir: &Path) -> ImportConfig {
        ImportConfig {
            connection: bridge_core::config::Connection {
                base_url: "http://localhost:8428".into(),
                api_base_path: None,
                tenant_id: None,
                auth: bridge_common::Auth::None,
                tls_verify: true,
            },
            bundle_path: dir.join("metrics.jsonl"),
            drop_old: true,
            chunk_size_bytes: 1024 * 1024,
            preflight_sample_lines: 2000,
            preflight_full_scan: false,
            staging_dir: dir.to_path_buf(),
        }
    }

    #[tokio::test]
    async fn streams_new_points_and_drops_old_ones() {
        // spec.md §8 scenario 5, modeled as two single-sample lines so the
        // `dropped_old + skipped + points = lines_read` identity (§8) is
        // unambiguous at the line level: one line is entirely too old and
        // is dropped outright, the other is accepted whole.
        let dir = tempfile::tempdir().unwrap();
        let now_ms = chrono::Utc::now().timestamp_millis();
        let old_ms = now_ms - 2 * 3600 * 1000;
        let new_ms = now_ms - 10 * 60 * 1000;
        let path = write_file(
            dir.path(),
            &format!(
                "{{\"labels\":{{\"__name__\":\"up\"}},\"values\":[1.0],\"timestamps\":[{old_ms}]}}\n\
                 {{\"labels\":{{\"__name__\":\"up\"}},\"values\":[2.0],\"timestamps\":[{new_ms}]}}\n"
            ),
        )
        .await;

        let target = target(None);
        let cfg = config(dir.path());
        let cutoff = now_ms - 3600 * 1000;
        let result = stream_import(&target, &cfg, &path, 0, cutoff, &CancellationToken::new(), |_| {}).await.unwrap();

        assert_eq!(result.lines_read, 2);
        assert_eq!(result.points, 1);
        assert_eq!(result.dropped_old, 1);
        assert_eq!(result.skipped_lines, 0);
        assert_eq!(result.dropped_old + result.skipped_lines + result.points, result.lines_read);
        assert_eq!(target.posted_chunks.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn counts_non_numeric_values_as_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(
            dir.path(),
            "{\"labels\":{\"__name__\":\"up\"},\"values\":[\"not-a-number\"],\"timestamps\":[1700000000000]}\n",
        )
        .await;

        let target = target(None);
        let cfg = config(dir.path());
        let result = stream_import(&target, &cfg, &path, 0, 0, &CancellationToken::new(), |_| {}).await.unwrap();
        assert_eq!(result.skipped_lines, 1);
        assert_eq!(result.points, 0);
    }

    #[tokio::test]
    async fn failed_chunk_reports_a_resumable_offset() {
        let dir = tempfile::tempdir().unwrap();
        let now_ms = chrono::Utc::now().timestamp_millis();
        let line = format!("{{\"labels\":{{\"__name__\":\"up\"}},\"values\":[1.0],\"timestamps\":[{now_ms}]}}\n");
        let path = write_file(dir.path(), &line.repeat(3)).await;

        let target = target(Some(0));
        let mut cfg = config(dir.path());
        cfg.chunk_size_bytes = 1;

        let err = stream_import(&target, &cfg, &path, 0, 0, &CancellationToken::new(), |_| {}).await.unwrap_err();
        assert_eq!(err.resume_offset, 0);
    }

    #[tokio::test]
    async fn resume_starts_from_the_given_byte_offset() {
        let dir = tempfile::tempdir().unwrap();
        let now_ms = chrono::Utc::now().timestamp_millis();
        let line = format!("{{\"labels\":{{\"__name__\":\"up\"}},\"values\":[1.0],\"timestamps\":[{now_ms}]}}\n");
        let path = write_file(dir.path(), &(line.clone() + &line)).await;

        let target = target(None);
        let cfg = config(dir.path());
        let result =
            stream_import(&target, &cfg, &path, line.len() as u64, 0, &CancellationToken::new(), |_| {}).await.unwrap();
        assert_eq!(result.lines_read, 1);
        assert_eq!(result.points, 1);
    }

    #[tokio::test]
    async fn verification_queries_series_over_padded_window() {
        let target = Arc::new(target(None));
        let summary = vec![ImportSummaryEntry {
            metric_name: "up".into(),
            example_labels: {
                let mut m = Map::new();
                m.insert("__name__".to_string(), "up".to_string());
                m
            },
            observed_start_ms: 1_700_000_000_000,
            observed_end_ms: 1_700_000_060_000,
        }];

        let result = verify_import(target, &summary, 1_700_000_000_000, 1_700_000_060_000).await.unwrap();
        assert_eq!(result.unwrap().matched_series, 1);
    }
}
