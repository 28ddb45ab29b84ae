//! Export Service (spec.md §4.4): batch window computation, per-batch
//! range queries (or native export) through the obfuscator into a staging
//! file, and archive finalization.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use bridge_archive::{write_archive, ArchiveInput, SealedArchive};
use bridge_client::{range_query_to_records, TsdbClient};
use bridge_common::{Error, MetricRecord, Result};
use bridge_core::archive_model::ArchiveMetadata;
use bridge_core::batch::{compute_batch_windows, fallback_step_secs, resolve_interval_secs, BatchWindow};
use bridge_core::config::{ExportConfig, ObfuscationSettings};
use bridge_core::jsonl::{JsonlDecoder, JsonlEncoder};
use bridge_core::obfuscate::Obfuscator;
use bridge_core::selector::build_selector;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Minimum per-batch deadline (spec.md §4.4 step 1).
pub const MIN_BATCH_DEADLINE_SECS: u64 = 120;

/// One absolute (1-based) batch-progress observation (spec.md §4.4 step 4).
#[derive(Debug, Clone, Copy)]
pub struct BatchProgress {
    pub absolute_batch_index: u64,
    pub metrics_in_batch: u64,
}

/// Final result of a successfully completed, archived export run.
pub struct FinalizedExport {
    pub archive: SealedArchive,
    pub metrics_count: u64,
}

/// Error raised mid-run, carrying the last successfully completed batch so
/// the caller (job manager) can resume (spec.md §4.4 Finalization).
pub struct ExportRunError {
    pub error: Error,
    pub last_completed_batch: Option<u64>,
}

impl From<ExportRunError> for Error {
    fn from(e: ExportRunError) -> Self {
        e.error
    }
}

/// Streams from the TSDB client through the obfuscator, writing JSONL to a
/// staging file or caller-supplied sink, then hands the result to
/// `bridge-archive` to seal (spec.md §4.4).
pub struct ExportService {
    client: Arc<dyn TsdbClient>,
    obfuscator: Arc<Obfuscator>,
}

impl ExportService {
    pub fn new(client: Arc<dyn TsdbClient>, obfuscator: Arc<Obfuscator>) -> Self {
        Self { client, obfuscator }
    }

    /// Computes `(total_batches, batch_window_seconds)` for a config
    /// without running anything (spec.md §4.4 "Batch window computation"),
    /// used at job admission time and in the `/api/export/start` response.
    pub fn plan(config: &ExportConfig) -> (u64, i64) {
        let interval = resolve_interval_secs(config.time_range, config.batch.custom_interval_secs);
        let (windows, batch_secs) = compute_batch_windows(config.time_range, interval);
        (windows.len() as u64, batch_secs)
    }

    /// Runs (or resumes) an export, writing obfuscated JSONL into
    /// `staging_path` batch by batch and sealing an archive under
    /// `archive_output_dir` on completion. `staging_path` is opened for
    /// append when `config.resume_from_batch > 0`, otherwise
    /// created/truncated (spec.md §3 "Ownership": the staging file belongs
    /// exclusively to the job for its lifetime).
    pub async fn run(
        &self,
        config: &ExportConfig,
        export_id: &str,
        staging_path: &Path,
        archive_output_dir: &Path,
        per_batch_timeout: Duration,
        cancel: CancellationToken,
        mut on_progress: impl FnMut(BatchProgress) + Send,
    ) -> std::result::Result<FinalizedExport, ExportRunError> {
        config.validate().map_err(|error| ExportRunError { error, last_completed_batch: None })?;

        let interval = resolve_interval_secs(config.time_range, config.batch.custom_interval_secs);
        let (windows, _batch_secs) = compute_batch_windows(config.time_range, interval);

        let selector = build_selector(&config.selection);
        let use_native = self.client.can_export().await;
        let deadline = per_batch_timeout.max(Duration::from_secs(MIN_BATCH_DEADLINE_SECS));

        let resuming = config.resume_from_batch > 0;
        let mut file = open_staging(staging_path, resuming)
            .await
            .map_err(|error| ExportRunError { error, last_completed_batch: previous_batch(config.resume_from_batch) })?;

        let mut metrics_processed: u64 = 0;
        let mut last_completed = previous_batch(config.resume_from_batch);

        for (idx, window) in windows.iter().enumerate().skip(config.resume_from_batch as usize) {
            if cancel.is_cancelled() {
                return Err(ExportRunError { error: Error::Cancellation, last_completed_batch: last_completed });
            }

            let count = run_one_batch(
                self.client.as_ref(),
                self.obfuscator.as_ref(),
                &selector,
                window,
                use_native,
                &config.obfuscation,
                config.batch.recommended_metric_step_secs,
                &mut file,
                &cancel,
                deadline,
            )
            .await
            .map_err(|error| ExportRunError { error, last_completed_batch: last_completed })?;

            metrics_processed += count;
            let absolute = (idx + 1) as u64;
            last_completed = Some(absolute);
            on_progress(BatchProgress { absolute_batch_index: absolute, metrics_in_batch: count });
        }

        file.flush().await.map_err(|e| ExportRunError { error: Error::Io(e), last_completed_batch: last_completed })?;
        drop(file);

        let metadata = ArchiveMetadata {
            export_id: export_id.to_string(),
            export_date: chrono::Utc::now(),
            time_range_start: config.time_range.start,
            time_range_end: config.time_range.end,
            selected_components: components_of(&config.selection),
            selected_jobs: jobs_of(&config.selection),
            metrics_count: metrics_processed,
            obfuscation_applied: config.obfuscation.enabled,
            writer_version: env!("CARGO_PKG_VERSION").to_string(),
            tool_version: format!("metrics-bridge/{}", env!("CARGO_PKG_VERSION")),
        };

        let metrics_bytes = tokio::fs::read(staging_path)
            .await
            .map_err(|e| ExportRunError { error: Error::Io(e), last_completed_batch: last_completed })?;

        let sealed = write_archive(ArchiveInput {
            export_id,
            metrics_jsonl: &metrics_bytes,
            metadata: &metadata,
            output_dir: archive_output_dir,
            filename_prefix: "export",
        })
        .await
        .map_err(|error| ExportRunError { error, last_completed_batch: last_completed })?;

        // Staging file is consumed once sealed into the archive (spec.md §5 "Resources").
        let _ = tokio::fs::remove_file(staging_path).await;

        Ok(FinalizedExport { archive: sealed, metrics_count: metrics_processed })
    }

    /// Oneshot path (spec.md §4.4 "Oneshot path"): streams obfuscated JSONL
    /// directly to a caller-supplied sink (e.g. standard output), bypassing
    /// archiving entirely. Batch defaults are applied the same way as
    /// `run`.
    pub async fn run_oneshot_stream(
        &self,
        config: &ExportConfig,
        sink: &mut (impl AsyncWrite + Unpin + Send),
        cancel: CancellationToken,
    ) -> Result<u64> {
        config.validate()?;
        let interval = resolve_interval_secs(config.time_range, config.batch.custom_interval_secs);
        let (windows, _) = compute_batch_windows(config.time_range, interval);
        let selector = build_selector(&config.selection);
        let use_native = self.client.can_export().await;
        let mut total = 0u64;

        for window in &windows {
            if cancel.is_cancelled() {
                return Err(Error::Cancellation);
            }
            total += run_one_batch(
                self.client.as_ref(),
                self.obfuscator.as_ref(),
                &selector,
                window,
                use_native,
                &config.obfuscation,
                config.batch.recommended_metric_step_secs,
                sink,
                &cancel,
                Duration::from_secs(MIN_BATCH_DEADLINE_SECS),
            )
            .await?;
        }
        Ok(total)
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_one_batch<W: AsyncWrite + Unpin + Send>(
    client: &dyn TsdbClient,
    obfuscator: &Obfuscator,
    selector: &str,
    window: &BatchWindow,
    use_native: bool,
    obfuscation: &ObfuscationSettings,
    step_override: Option<i64>,
    sink: &mut W,
    cancel: &CancellationToken,
    deadline: Duration,
) -> Result<u64> {
    let records = tokio::select! {
        _ = cancel.cancelled() => return Err(Error::Cancellation),
        result = tokio::time::timeout(deadline, fetch_batch(client, selector, window, use_native, step_override)) => {
            result.map_err(|_| Error::transport(format!("batch {:?}..{:?} timed out after {:?}", window.start, window.end, deadline)))??
        }
    };

    let mut encoder = JsonlEncoder::new(sink);
    let mut count = 0u64;
    for mut record in records {
        record.validate()?;
        obfuscate_record(&mut record, obfuscator, obfuscation);
        encoder.write_record(&record).await?;
        count += 1;
    }
    encoder.flush().await?;
    Ok(count)
}

async fn fetch_batch(
    client: &dyn TsdbClient,
    selector: &str,
    window: &BatchWindow,
    use_native: bool,
    step_override: Option<i64>,
) -> Result<Vec<MetricRecord>> {
    if use_native {
        match client.export_stream(selector, window.start, window.end).await {
            Ok(stream) => {
                let mut decoder = JsonlDecoder::new(stream);
                let mut out = Vec::new();
                while let Some(record) = decoder.next_record().await? {
                    out.push(record);
                }
                return Ok(out);
            }
            Err(Error::UnavailableRoute(reason)) => {
                debug!(%reason, "export route unavailable, falling back to range_query synthesis");
            }
            Err(e) => return Err(e),
        }
    }

    let step = fallback_step_secs(chrono::Duration::seconds(window.duration_secs()), step_override);
    let data = client.range_query(selector, window.start, window.end, step).await?;
    Ok(range_query_to_records(&data))
}

/// Guess the owning component for an obfuscated job label (spec.md §4.4
/// step 3): `component`/`vm_component` label, then the `__name__` prefix up
/// to the first underscore, then the `job` label itself, then `"unknown"`.
pub fn guess_component(record: &MetricRecord) -> String {
    if let Some(c) = record.labels.get("component") {
        return c.clone();
    }
    if let Some(c) = record.labels.get("vm_component") {
        return c.clone();
    }
    if let Some(name) = record.labels.get("__name__") {
        if let Some((prefix, rest)) = name.split_once('_') {
            if !prefix.is_empty() && !rest.is_empty() {
                return prefix.to_string();
            }
        }
    }
    if let Some(job) = record.labels.get("job") {
        return job.clone();
    }
    "unknown".to_string()
}

fn obfuscate_record(record: &mut MetricRecord, obfuscator: &Obfuscator, settings: &ObfuscationSettings) {
    if !settings.enabled {
        return;
    }
    if settings.instance {
        if let Some(value) = record.labels.get("instance").cloned() {
            record.labels.insert("instance".to_string(), obfuscator.obfuscate_instance(&value));
        }
    }
    if settings.job {
        if let Some(value) = record.labels.get("job").cloned() {
            let component = guess_component(record);
            record.labels.insert("job".to_string(), obfuscator.obfuscate_job(&value, &component));
        }
    }
    for key in &settings.custom_label_keys {
        if let Some(value) = record.labels.get(key).cloned() {
            record.labels.insert(key.clone(), obfuscator.obfuscate_custom_label(key, &value));
        }
    }
}

fn previous_batch(resume_from_batch: u64) -> Option<u64> {
    if resume_from_batch > 0 {
        Some(resume_from_batch)
    } else {
        None
    }
}

fn components_of(selection: &bridge_core::selector::Selection) -> Vec<String> {
    match selection {
        bridge_core::selector::Selection::ComponentsJobs { components, .. } => components.clone(),
        _ => Vec::new(),
    }
}

fn jobs_of(selection: &bridge_core::selector::Selection) -> Vec<String> {
    match selection {
        bridge_core::selector::Selection::ComponentsJobs { jobs, .. } => jobs.clone(),
        bridge_core::selector::Selection::Selector { jobs, .. } => jobs.clone(),
        bridge_core::selector::Selection::MetricsQL { .. } => Vec::new(),
    }
}

async fn open_staging(path: &Path, append: bool) -> Result<tokio::fs::File> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(Error::Io)?;
    }
    tokio::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .append(append)
        .truncate(!append)
        .open(path)
        .await
        .map_err(Error::Io)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bridge_client::{RangeQueryData, RangeSeries, StubTsdbClient};
    use bridge_core::config::{BatchSettings, Connection, ExportConfig, ObfuscationSettings};
    use bridge_core::selector::Selection;
    use chrono::TimeZone;
    use std::collections::BTreeMap;

    fn sample_range_data() -> RangeQueryData {
        let mut metric = BTreeMap::new();
        metric.insert("__name__".to_string(), "vmstorage_rows_total".to_string());
        metric.insert("instance".to_string(), "10.0.1.5:8482".to_string());
        metric.insert("job".to_string(), "vmstorage-prod".to_string());
        RangeQueryData {
            result_type: "matrix".to_string(),
            result: vec![RangeSeries {
                metric,
                values: vec![(1_700_000_000.0, "1".to_string()), (1_700_000_060.0, "2".to_string())],
            }],
        }
    }

    fn test_config(staging_dir: &Path, resume_from_batch: u64) -> ExportConfig {
        let start = chrono::Utc.with_ymd_and_hms(2025, 1, 15, 10, 0, 0).unwrap();
        let end = start + chrono::Duration::minutes(2);
        ExportConfig {
            connection: Connection {
                base_url: "http://localhost:8428".into(),
                api_base_path: None,
                tenant_id: None,
                auth: bridge_common::Auth::None,
                tls_verify: true,
            },
            time_range: bridge_common::TimeRange::new(start, end).unwrap(),
            selection: Selection::ComponentsJobs { components: vec!["vmstorage".into()], jobs: vec!["vmstorage-prod".into()] },
            obfuscation: ObfuscationSettings { enabled: false, instance: false, job: false, custom_label_keys: Default::default() },
            batch: BatchSettings { enabled: true, custom_interval_secs: Some(60), recommended_metric_step_secs: None },
            resume_from_batch,
            staging_dir: staging_dir.to_path_buf(),
        }
    }

    #[test]
    fn guess_component_prefers_explicit_labels_over_name_prefix() {
        let mut labels = BTreeMap::new();
        labels.insert("__name__".to_string(), "vmstorage_rows_total".to_string());
        labels.insert("component".to_string(), "vminsert".to_string());
        let record = MetricRecord { labels, values: vec![1.0], timestamps: vec![1] };
        assert_eq!(guess_component(&record), "vminsert");
    }

    #[test]
    fn guess_component_falls_back_through_name_prefix_then_job_then_unknown() {
        let mut labels = BTreeMap::new();
        labels.insert("__name__".to_string(), "vmstorage_rows_total".to_string());
        let record = MetricRecord { labels, values: vec![1.0], timestamps: vec![1] };
        assert_eq!(guess_component(&record), "vmstorage");

        let mut labels2 = BTreeMap::new();
        labels2.insert("__name__".to_string(), "up".to_string());
        labels2.insert("job".to_string(), "node-exporter".to_string());
        let record2 = MetricRecord { labels: labels2, values: vec![1.0], timestamps: vec![1] };
        assert_eq!(guess_component(&record2), "node-exporter");

        let mut labels3 = BTreeMap::new();
        labels3.insert("__name__".to_string(), "up".to_string());
        let record3 = MetricRecord { labels: labels3, values: vec![1.0], timestamps: vec![1] };
        assert_eq!(guess_component(&record3), "unknown");
    }

    #[tokio::test]
    async fn runs_a_small_export_and_produces_an_archive() {
        let dir = tempfile::tempdir().unwrap();
        let client = Arc::new(StubTsdbClient { range_data: sample_range_data(), export_available: false, retention_secs: 3600 });
        let service = ExportService::new(client, Arc::new(Obfuscator::new()));

        let config = test_config(dir.path(), 0);
        let staging_path = dir.path().join("staging.jsonl");
        let archive_dir = dir.path().join("archives");

        let result = service
            .run(
                &config,
                "exp-1",
                &staging_path,
                &archive_dir,
                Duration::from_secs(120),
                CancellationToken::new(),
                |_p| {},
            )
            .await
            .map_err(|e| e.error)
            .unwrap();

        assert_eq!(result.metrics_count, 2);
        assert!(result.archive.path.exists());
        assert!(!staging_path.exists());
    }

    #[tokio::test]
    async fn resume_appends_to_existing_staging_file_without_truncating() {
        let dir = tempfile::tempdir().unwrap();
        let staging_path = dir.path().join("staging.jsonl");
        tokio::fs::write(&staging_path, b"{\"labels\":{\"__name__\":\"prior\"},\"values\":[1.0],\"timestamps\":[1]}\n")
            .await
            .unwrap();

        let client = Arc::new(StubTsdbClient { range_data: sample_range_data(), export_available: false, retention_secs: 3600 });
        let service = ExportService::new(client, Arc::new(Obfuscator::new()));

        let mut config = test_config(dir.path(), 1);
        config.batch.custom_interval_secs = Some(60);
        let archive_dir = dir.path().join("archives");

        let result = service
            .run(&config, "exp-1", &staging_path, &archive_dir, Duration::from_secs(120), CancellationToken::new(), |_p| {})
            .await
            .map_err(|e| e.error)
            .unwrap();

        // Prior line plus the one remaining batch's records.
        assert!(result.metrics_count >= 1);
    }

    #[tokio::test]
    async fn cancellation_before_any_batch_reports_no_completed_batches() {
        let dir = tempfile::tempdir().unwrap();
        let client = Arc::new(StubTsdbClient { range_data: sample_range_data(), export_available: false, retention_secs: 3600 });
        let service = ExportService::new(client, Arc::new(Obfuscator::new()));
        let config = test_config(dir.path(), 0);
        let staging_path = dir.path().join("staging.jsonl");
        let archive_dir = dir.path().join("archives");
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = service
            .run(&config, "exp-1", &staging_path, &archive_dir, Duration::from_secs(120), cancel, |_p| {})
            .await
            .unwrap_err();
        assert!(matches!(err.error, Error::Cancellation));
        assert_eq!(err.last_completed_batch, None);
    }
}
