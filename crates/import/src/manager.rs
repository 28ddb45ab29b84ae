//! Import Job Manager: bounded concurrency, preflight-at-submission,
//! progress, resume-after-chunk-failure, and retention cleanup for
//! `ImportJob` (spec.md §4.6, mirroring `bridge-export`'s job manager).

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bridge_client::{ClientFactory, TsdbClient};
use bridge_common::{Error, Result};
use bridge_core::config::ImportConfig;
use bridge_core::job::{ImportJob, ImportState};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::bundle::prepare_bundle;
use crate::importer::{stream_import, verify_import, ImportProgress};
use crate::preflight::analyze_bundle;

#[derive(Debug, Clone)]
pub struct ImportJobManagerConfig {
    pub max_concurrent_imports: usize,
    pub job_retention: Duration,
}

impl Default for ImportJobManagerConfig {
    fn default() -> Self {
        Self { max_concurrent_imports: 3, job_retention: Duration::from_secs(24 * 3600) }
    }
}

struct JobEntry {
    job: ImportJob,
    import_config: ImportConfig,
    client: Arc<dyn TsdbClient>,
    metrics_path: PathBuf,
    retention_cutoff_ms: i64,
    cancel: CancellationToken,
    base_bytes: u64,
    base_points: u64,
    base_dropped: u64,
    base_skipped: u64,
    base_chunks: u64,
    base_lines_read: u64,
}

/// Bounded-concurrency manager for import jobs. Preflight runs
/// synchronously at submission time so `/api/upload` can return the
/// analysis alongside the queued job id (spec.md §6).
pub struct ImportJobManager {
    client_factory: ClientFactory,
    jobs: Arc<Mutex<HashMap<String, JobEntry>>>,
    config: ImportJobManagerConfig,
}

impl ImportJobManager {
    /// `client_factory` builds a fresh `TsdbClient` from a job's own
    /// `Connection` (spec.md §3 ImportConfig.Connection is per-job, not a
    /// process-wide fixed target).
    pub fn new(client_factory: ClientFactory, config: ImportJobManagerConfig) -> Self {
        Self { client_factory, jobs: Arc::new(Mutex::new(HashMap::new())), config }
    }

    fn running_count(jobs: &HashMap<String, JobEntry>) -> usize {
        jobs.values().filter(|e| matches!(e.job.state, ImportState::Queued | ImportState::Running)).count()
    }

    /// Extracts the bundle, runs preflight analysis against the target's
    /// reported retention window, admits a new job, and spawns its worker.
    pub async fn submit(&self, import_config: ImportConfig) -> Result<ImportJob> {
        import_config.validate()?;

        let client = (self.client_factory)(&import_config.connection)?;
        let prepared = prepare_bundle(&import_config.bundle_path, &import_config.staging_dir).await?;
        let retention_secs = client.retention_secs().await.unwrap_or(0);
        let report = analyze_bundle(
            &prepared.metrics_path,
            import_config.preflight_sample_lines,
            import_config.preflight_full_scan,
            retention_secs,
        )
        .await?;

        let id = Uuid::new_v4().to_string();
        let mut job = ImportJob::new(id.clone(), prepared.metrics_path.display().to_string());
        job.bytes_total = report.byte_size;
        job.chunks_total = (report.byte_size / import_config.chunk_size_bytes.max(1) as u64).max(1);
        job.retention_cutoff = report.retention_cutoff_ms.and_then(chrono::DateTime::from_timestamp_millis);

        let cancel = CancellationToken::new();
        {
            let mut jobs = self.jobs.lock().unwrap();
            if Self::running_count(&jobs) >= self.config.max_concurrent_imports {
                return Err(Error::quota("too many concurrent imports"));
            }
            jobs.insert(
                id.clone(),
                JobEntry {
                    job: job.clone(),
                    import_config: import_config.clone(),
                    client: client.clone(),
                    metrics_path: prepared.metrics_path.clone(),
                    retention_cutoff_ms: report.retention_cutoff_ms.unwrap_or(0),
                    cancel: cancel.clone(),
                    base_bytes: 0,
                    base_points: 0,
                    base_dropped: 0,
                    base_skipped: 0,
                    base_chunks: 0,
                    base_lines_read: 0,
                },
            );
        }

        self.spawn_worker(id, client, 0, cancel);
        Ok(job)
    }

    pub fn status(&self, id: &str) -> Option<ImportJob> {
        self.jobs.lock().unwrap().get(id).map(|e| e.job.clone())
    }

    pub fn list(&self) -> Vec<ImportJob> {
        self.jobs.lock().unwrap().values().map(|e| e.job.clone()).collect()
    }

    pub fn cancel(&self, id: &str) -> Result<()> {
        let jobs = self.jobs.lock().unwrap();
        let entry = jobs.get(id).ok_or_else(|| Error::not_found(format!("unknown import job {id}")))?;
        entry.cancel.cancel();
        Ok(())
    }

    /// Resumes a `Failed` job whose last error left `resume_ready=true`,
    /// continuing the stream from `resume_offset` (spec.md §4.6 "On a
    /// failed chunk POST ... `resumeImport(id)` reopens the file, seeks to
    /// the offset, and continues").
    pub fn resume(&self, id: &str) -> Result<ImportJob> {
        let (client, resume_offset, cancel) = {
            let mut jobs = self.jobs.lock().unwrap();
            if Self::running_count(&jobs) >= self.config.max_concurrent_imports {
                return Err(Error::quota("too many concurrent imports"));
            }
            let entry = jobs.get_mut(id).ok_or_else(|| Error::not_found(format!("unknown import job {id}")))?;
            if entry.job.state != ImportState::Failed || !entry.job.resume_ready {
                return Err(Error::configuration(format!("job {id} is not resume-ready")));
            }
            entry.base_bytes = entry.job.bytes_completed;
            entry.base_points = entry.job.points;
            entry.base_dropped = entry.job.dropped_old;
            entry.base_skipped = entry.job.skipped_lines;
            entry.base_chunks = entry.job.chunks_completed;
            entry.base_lines_read = entry.job.dropped_old + entry.job.skipped_lines + entry.job.points;
            entry.job.state = ImportState::Queued;
            entry.job.error = None;
            entry.job.finished_at = None;
            entry.cancel = CancellationToken::new();
            (entry.client.clone(), entry.job.resume_offset, entry.cancel.clone())
        };

        self.spawn_worker(id.to_string(), client, resume_offset, cancel);
        Ok(self.status(id).expect("just updated"))
    }

    /// Removes jobs in a terminal state older than the configured
    /// retention window (spec.md §4.5 "Cleanup", applied symmetrically to imports).
    pub fn cleanup_expired(&self) -> usize {
        let now = chrono::Utc::now();
        let retention = chrono::Duration::from_std(self.config.job_retention).unwrap_or(chrono::Duration::zero());
        let mut jobs = self.jobs.lock().unwrap();
        let expired: Vec<String> = jobs
            .iter()
            .filter(|(_, e)| match e.job.finished_at {
                Some(finished) => now - finished > retention,
                None => false,
            })
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            jobs.remove(id);
        }
        expired.len()
    }

    fn spawn_worker(&self, id: String, client: Arc<dyn TsdbClient>, resume_offset: u64, cancel: CancellationToken) {
        let jobs = self.jobs.clone();

        tokio::spawn(async move {
            let (import_config, metrics_path, retention_cutoff_ms, base_bytes, base_points, base_dropped, base_skipped, base_chunks, base_lines_read) = {
                let mut jobs = jobs.lock().unwrap();
                let Some(entry) = jobs.get_mut(&id) else { return };
                entry.job.start();
                (
                    entry.import_config.clone(),
                    entry.metrics_path.clone(),
                    entry.retention_cutoff_ms,
                    entry.base_bytes,
                    entry.base_points,
                    entry.base_dropped,
                    entry.base_skipped,
                    entry.base_chunks,
                    entry.base_lines_read,
                )
            };

            let progress_jobs = jobs.clone();
            let progress_id = id.clone();
            let on_progress = move |progress: ImportProgress| {
                let mut jobs = progress_jobs.lock().unwrap();
                if let Some(entry) = jobs.get_mut(&progress_id) {
                    entry.job.bytes_completed = base_bytes + progress.bytes_sent;
                    entry.job.resume_offset = entry.job.bytes_completed;
                    entry.job.chunks_completed = base_chunks + progress.chunks_completed;
                    entry.job.points = base_points + progress.points;
                    entry.job.dropped_old = base_dropped + progress.dropped_old;
                    entry.job.skipped_lines = base_skipped + progress.skipped_lines;
                }
            };

            let outcome =
                stream_import(client.as_ref(), &import_config, &metrics_path, resume_offset, retention_cutoff_ms, &cancel, on_progress)
                    .await;

            match outcome {
                Ok(result) => {
                    let verification = match verify_import(
                        client.clone(),
                        &result.summary,
                        result.summary.iter().map(|s| s.observed_start_ms).min().unwrap_or(0),
                        result.summary.iter().map(|s| s.observed_end_ms).max().unwrap_or(0),
                    )
                    .await
                    {
                        Ok(v) => v,
                        Err(e) => {
                            warn!(job_id = %id, error = %e, "verification query failed, import still reported complete");
                            None
                        }
                    };

                    let mut jobs = jobs.lock().unwrap();
                    let Some(entry) = jobs.get_mut(&id) else { return };
                    entry.job.bytes_completed = base_bytes + result.bytes_sent;
                    entry.job.points = base_points + result.points;
                    entry.job.dropped_old = base_dropped + result.dropped_old;
                    entry.job.skipped_lines = base_skipped + result.skipped_lines;
                    if !result.summary.is_empty() {
                        entry.job.summary = result.summary;
                    }
                    if let Err(reason) = entry.job.check_accounting(base_lines_read + result.lines_read) {
                        warn!(job_id = %id, %reason, "import accounting invariant did not hold");
                    }
                    info!(job_id = %id, points = entry.job.points, "import job finalized");
                    entry.job.complete(verification);
                }
                Err(run_error) => {
                    let mut jobs = jobs.lock().unwrap();
                    let Some(entry) = jobs.get_mut(&id) else { return };
                    entry.job.resume_offset = run_error.resume_offset;
                    if matches!(run_error.error, Error::Cancellation) {
                        warn!(job_id = %id, "import job canceled mid-stream");
                        entry.job.fail(&Error::Cancellation, true);
                    } else {
                        error!(job_id = %id, error = %run_error.error, "import job failed");
                        entry.job.fail(&run_error.error, true);
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bridge_client::RecordingImportTarget;
    use std::collections::BTreeMap;
    use std::sync::Mutex as StdMutex;

    fn client(fail_after: Option<usize>) -> Arc<RecordingImportTarget> {
        Arc::new(RecordingImportTarget {
            retention_secs: 3600,
            series_response: vec![{
                let mut m = BTreeMap::new();
                m.insert("__name__".to_string(), "up".to_string());
                m
            }],
            posted_chunks: StdMutex::new(Vec::new()),
            fail_after,
        })
    }

    fn factory(target: Arc<RecordingImportTarget>) -> ClientFactory {
        Arc::new(move |_conn| Ok(target.clone() as Arc<dyn TsdbClient>))
    }

    async fn write_bundle(dir: &std::path::Path, lines: u32) -> std::path::PathBuf {
        let now_ms = chrono::Utc::now().timestamp_millis();
        let mut content = String::new();
        for _ in 0..lines {
            content.push_str(&format!(
                "{{\"labels\":{{\"__name__\":\"up\"}},\"values\":[1.0],\"timestamps\":[{now_ms}]}}\n"
            ));
        }
        let path = dir.join("metrics.jsonl");
        tokio::fs::write(&path, content).await.unwrap();
        path
    }

    fn config(bundle_path: std::path::PathBuf, staging_dir: &std::path::Path) -> ImportConfig {
        ImportConfig {
            connection: bridge_core::config::Connection {
                base_url: "http://localhost:8428".into(),
                api_base_path: None,
                tenant_id: None,
                auth: bridge_common::Auth::None,
                tls_verify: true,
            },
            bundle_path,
            drop_old: false,
            chunk_size_bytes: 1024 * 1024,
            preflight_sample_lines: 2000,
            preflight_full_scan: true,
            staging_dir: staging_dir.to_path_buf(),
        }
    }

    #[tokio::test]
    async fn submits_and_completes_an_import_job() {
        let dir = tempfile::tempdir().unwrap();
        let bundle = write_bundle(dir.path(), 3).await;
        let manager = ImportJobManager::new(factory(client(None)), ImportJobManagerConfig::default());

        let job = manager.submit(config(bundle, dir.path())).await.unwrap();
        assert_eq!(job.state, ImportState::Queued);

        for _ in 0..50 {
            if manager.status(&job.id).unwrap().state == ImportState::Completed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let final_job = manager.status(&job.id).unwrap();
        assert_eq!(final_job.state, ImportState::Completed);
        assert_eq!(final_job.points, 3);
    }

    #[tokio::test]
    async fn rejects_submission_beyond_concurrency_limit() {
        let dir = tempfile::tempdir().unwrap();
        let bundle = write_bundle(dir.path(), 1).await;
        let manager = ImportJobManager::new(
            factory(client(None)),
            ImportJobManagerConfig { max_concurrent_imports: 0, job_retention: Duration::from_secs(3600) },
        );

        let err = manager.submit(config(bundle, dir.path())).await.unwrap_err();
        assert!(matches!(err, Error::Quota(_)));
    }

    #[tokio::test]
    async fn failed_job_can_be_resumed_after_posting_more_chunks_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let bundle = write_bundle(dir.path(), 2).await;
        let target = client(Some(0));
        let manager = ImportJobManager::new(factory(target.clone()), ImportJobManagerConfig::default());

        let mut cfg = config(bundle, dir.path());
        cfg.chunk_size_bytes = 1;
        let job = manager.submit(cfg).await.unwrap();

        for _ in 0..50 {
            if manager.status(&job.id).unwrap().state == ImportState::Failed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let failed = manager.status(&job.id).unwrap();
        assert_eq!(failed.state, ImportState::Failed);
        assert!(failed.resume_ready);
    }
}
