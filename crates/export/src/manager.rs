//! Export Job Manager (spec.md §4.5): bounded concurrency, lifecycle,
//! progress/ETA, cancellation, resume-from-batch, retention cleanup.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bridge_client::ClientFactory;
use bridge_common::{Error, Result};
use bridge_core::config::ExportConfig;
use bridge_core::job::{ArchiveResult, ExportJob, ExportState};
use bridge_core::obfuscate::Obfuscator;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::service::{BatchProgress, ExportService};

/// Job manager configuration (SPEC_FULL.md §2, bound to `BridgeConfig`).
#[derive(Debug, Clone)]
pub struct JobManagerConfig {
    pub max_concurrent_exports: usize,
    pub job_retention: Duration,
    pub per_batch_timeout: Duration,
    /// When `false` (spec.md §9 open question resolution), no wall-clock
    /// ceiling is imposed on a job regardless of its computed bound.
    pub wall_clock_cap_enabled: bool,
    pub archive_output_dir: PathBuf,
}

impl Default for JobManagerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_exports: 3,
            job_retention: Duration::from_secs(24 * 3600),
            per_batch_timeout: Duration::from_secs(120),
            wall_clock_cap_enabled: false,
            archive_output_dir: PathBuf::from("./archives"),
        }
    }
}

struct JobEntry {
    job: ExportJob,
    export_config: ExportConfig,
    service: Arc<ExportService>,
    cancel: CancellationToken,
}

/// Computes the job wall-clock deadline (spec.md §4.5): `max(15 min,
/// total_batches * per_batch_timeout * 1.2)`.
pub fn computed_wall_clock_deadline(total_batches: u64, per_batch_timeout: Duration) -> Duration {
    let scaled = per_batch_timeout.mul_f64(total_batches as f64 * 1.2);
    scaled.max(Duration::from_secs(15 * 60))
}

/// Bounded-concurrency manager for export jobs (spec.md §4.5). All
/// mutations to the jobs map happen under a single exclusive lock; reads
/// take a defensive clone so observers never see a torn job struct
/// (spec.md §5 "Ordering guarantees").
pub struct JobManager {
    client_factory: ClientFactory,
    obfuscator: Arc<Obfuscator>,
    jobs: Arc<Mutex<HashMap<String, JobEntry>>>,
    config: JobManagerConfig,
}

impl JobManager {
    /// `client_factory` builds a fresh `TsdbClient` from a job's own
    /// `Connection` (spec.md §3 ExportConfig.Connection is per-job, not a
    /// process-wide fixed target). `obfuscator` is shared across every job
    /// the manager ever runs, matching this process's session scope
    /// (spec.md §4.2 "session-scoped").
    pub fn new(client_factory: ClientFactory, obfuscator: Arc<Obfuscator>, config: JobManagerConfig) -> Self {
        Self { client_factory, obfuscator, jobs: Arc::new(Mutex::new(HashMap::new())), config }
    }

    fn running_count(jobs: &HashMap<String, JobEntry>) -> usize {
        jobs.values().filter(|e| matches!(e.job.state, ExportState::Pending | ExportState::Running)).count()
    }

    /// Admits a new export job (spec.md §4.5): rejects with `Quota` when
    /// `max_concurrent_exports` running jobs are already in flight.
    pub fn submit(&self, export_config: ExportConfig) -> Result<ExportJob> {
        export_config.validate()?;

        let client = (self.client_factory)(&export_config.connection)?;
        let service = Arc::new(ExportService::new(client, self.obfuscator.clone()));

        let id = Uuid::new_v4().to_string();
        let (total_batches, _batch_secs) = ExportService::plan(&export_config);
        let job = ExportJob::new(id.clone(), total_batches);
        let cancel = CancellationToken::new();

        {
            let mut jobs = self.jobs.lock().unwrap();
            if Self::running_count(&jobs) >= self.config.max_concurrent_exports {
                return Err(Error::quota("too many concurrent exports"));
            }
            jobs.insert(
                id.clone(),
                JobEntry { job: job.clone(), export_config: export_config.clone(), service: service.clone(), cancel: cancel.clone() },
            );
        }

        self.spawn_worker(id, export_config, service, cancel, total_batches);
        Ok(job)
    }

    /// Snapshot of a job's current status (spec.md §3 ExportJob). Returns
    /// `None` for an unknown id.
    pub fn status(&self, id: &str) -> Option<ExportJob> {
        self.jobs.lock().unwrap().get(id).map(|e| e.job.clone())
    }

    pub fn list(&self) -> Vec<ExportJob> {
        self.jobs.lock().unwrap().values().map(|e| e.job.clone()).collect()
    }

    /// Cancels a job's context. Idempotent: canceling an already-terminal
    /// or already-canceled job is a no-op (spec.md §5 "Cancellation").
    pub fn cancel(&self, id: &str) -> Result<()> {
        let jobs = self.jobs.lock().unwrap();
        let entry = jobs.get(id).ok_or_else(|| Error::not_found(format!("unknown export job {id}")))?;
        entry.cancel.cancel();
        Ok(())
    }

    /// Resumes a `Failed`/`Canceled` job from its last completed batch,
    /// inheriting the job id (spec.md §4.5 "Resume").
    pub fn resume(&self, id: &str) -> Result<ExportJob> {
        let (mut export_config, total_batches) = {
            let jobs = self.jobs.lock().unwrap();
            let entry = jobs.get(id).ok_or_else(|| Error::not_found(format!("unknown export job {id}")))?;
            if !matches!(entry.job.state, ExportState::Failed | ExportState::Canceled) {
                return Err(Error::configuration(format!(
                    "job {id} cannot be resumed from state {:?}",
                    entry.job.state
                )));
            }
            let last_batch = entry
                .job
                .last_completed_batch
                .ok_or_else(|| Error::configuration(format!("job {id} has no completed batch to resume from")))?;
            let mut export_config = entry.export_config.clone();
            export_config.resume_from_batch = last_batch;
            (export_config, entry.job.batches_total)
        };

        // Rebuild the client from the job's own connection rather than reuse
        // a stored service, since a resumed job may be handled by a new
        // process lifetime in the future (spec.md §4.5 "Resume").
        let client = (self.client_factory)(&export_config.connection)?;
        let service = Arc::new(ExportService::new(client, self.obfuscator.clone()));

        let cancel = CancellationToken::new();
        {
            let mut jobs = self.jobs.lock().unwrap();
            if Self::running_count(&jobs) >= self.config.max_concurrent_exports {
                return Err(Error::quota("too many concurrent exports"));
            }
            let entry = jobs.get_mut(id).unwrap();
            entry.job.state = ExportState::Pending;
            entry.job.stage = "queued".to_string();
            entry.job.error = None;
            entry.job.finished_at = None;
            entry.export_config = export_config.clone();
            entry.service = service.clone();
            entry.cancel = cancel.clone();
        }

        self.spawn_worker(id.to_string(), export_config, service, cancel, total_batches);
        Ok(self.status(id).expect("just inserted"))
    }

    /// Removes jobs in any terminal state older than the configured
    /// retention window (spec.md §4.5 "Cleanup", §9 "Canceled-job
    /// retention covers all three terminal states").
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

    fn spawn_worker(&self, id: String, export_config: ExportConfig, service: Arc<ExportService>, cancel: CancellationToken, total_batches: u64) {
        let jobs = self.jobs.clone();
        let per_batch_timeout = self.config.per_batch_timeout;
        let archive_output_dir = self.config.archive_output_dir.clone();
        let wall_clock_cap_enabled = self.config.wall_clock_cap_enabled;

        tokio::spawn(async move {
            {
                let mut jobs = jobs.lock().unwrap();
                if let Some(entry) = jobs.get_mut(&id) {
                    entry.job.start();
                }
            }

            let staging_path = export_config.staging_dir.join(format!("{id}.jsonl"));
            let progress_jobs = jobs.clone();
            let progress_id = id.clone();
            let on_progress = move |progress: BatchProgress| {
                let mut jobs = progress_jobs.lock().unwrap();
                if let Some(entry) = jobs.get_mut(&progress_id) {
                    entry.job.apply_progress(progress.absolute_batch_index, progress.metrics_in_batch);
                }
            };

            let run_fut = service.run(
                &export_config,
                &id,
                &staging_path,
                &archive_output_dir,
                per_batch_timeout,
                cancel.clone(),
                on_progress,
            );

            let outcome = if wall_clock_cap_enabled {
                let deadline = computed_wall_clock_deadline(total_batches, per_batch_timeout);
                match tokio::time::timeout(deadline, run_fut).await {
                    Ok(result) => result,
                    Err(_) => {
                        cancel.cancel();
                        Err(crate::service::ExportRunError {
                            error: Error::transport(format!("job exceeded wall-clock deadline of {deadline:?}")),
                            last_completed_batch: None,
                        })
                    }
                }
            } else {
                run_fut.await
            };

            let mut jobs = jobs.lock().unwrap();
            let Some(entry) = jobs.get_mut(&id) else { return };
            match outcome {
                Ok(finalized) => {
                    info!(job_id = %id, metrics = finalized.metrics_count, "export job finalized");
                    entry.job.complete(ArchiveResult {
                        path: finalized.archive.path.display().to_string(),
                        size_bytes: finalized.archive.size_bytes,
                        sha256: finalized.archive.sha256,
                        metrics_count: finalized.metrics_count,
                    });
                }
                Err(run_error) => {
                    if entry.job.last_completed_batch.is_none() {
                        entry.job.last_completed_batch = run_error.last_completed_batch;
                    }
                    if matches!(run_error.error, Error::Cancellation) {
                        warn!(job_id = %id, "export job canceled");
                        entry.job.cancel();
                    } else {
                        error!(job_id = %id, error = %run_error.error, "export job failed");
                        entry.job.fail(&run_error.error);
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bridge_client::{RangeQueryData, RangeSeries, StubTsdbClient, TsdbClient};
    use bridge_core::config::{BatchSettings, Connection, ObfuscationSettings};
    use bridge_core::obfuscate::Obfuscator;
    use bridge_core::selector::Selection;
    use std::collections::BTreeMap;
    use std::sync::Arc as StdArc;
    use std::time::Duration as StdDuration;

    fn range_data() -> RangeQueryData {
        let mut metric = BTreeMap::new();
        metric.insert("__name__".to_string(), "up".to_string());
        RangeQueryData { result_type: "matrix".to_string(), result: vec![RangeSeries { metric, values: vec![(1.0, "1".to_string())] }] }
    }

    fn make_manager(dir: &std::path::Path, client: StdArc<dyn TsdbClient>) -> JobManager {
        let factory: ClientFactory = StdArc::new(move |_conn| Ok(client.clone()));
        JobManager::new(
            factory,
            StdArc::new(Obfuscator::new()),
            JobManagerConfig {
                max_concurrent_exports: 2,
                job_retention: StdDuration::from_secs(3600),
                per_batch_timeout: StdDuration::from_secs(120),
                wall_clock_cap_enabled: false,
                archive_output_dir: dir.join("archives"),
            },
        )
    }

    fn config(dir: &std::path::Path) -> ExportConfig {
        let start = chrono::Utc::now();
        ExportConfig {
            connection: Connection {
                base_url: "http://localhost:8428".into(),
                api_base_path: None,
                tenant_id: None,
                auth: bridge_common::Auth::None,
                tls_verify: true,
            },
            time_range: bridge_common::TimeRange::new(start, start + chrono::Duration::minutes(1)).unwrap(),
            selection: Selection::ComponentsJobs { components: vec![], jobs: vec![] },
            obfuscation: ObfuscationSettings::default(),
            batch: BatchSettings { enabled: true, custom_interval_secs: Some(60), recommended_metric_step_secs: None },
            resume_from_batch: 0,
            staging_dir: dir.to_path_buf(),
        }
    }

    #[tokio::test]
    async fn submits_and_completes_a_job() {
        let dir = tempfile::tempdir().unwrap();
        let client = StdArc::new(StubTsdbClient { range_data: range_data(), export_available: false, retention_secs: 3600 });
        let manager = make_manager(dir.path(), client);

        let job = manager.submit(config(dir.path())).unwrap();
        assert_eq!(job.state, ExportState::Pending);

        for _ in 0..50 {
            if manager.status(&job.id).unwrap().state == ExportState::Completed {
                break;
            }
            tokio::time::sleep(StdDuration::from_millis(20)).await;
        }
        let final_job = manager.status(&job.id).unwrap();
        assert_eq!(final_job.state, ExportState::Completed);
        assert!(final_job.final_archive.is_some());
    }

    #[tokio::test]
    async fn rejects_submission_beyond_concurrency_limit() {
        let dir = tempfile::tempdir().unwrap();
        let client: StdArc<dyn TsdbClient> = StdArc::new(StubTsdbClient { range_data: range_data(), export_available: false, retention_secs: 3600 });
        let factory: ClientFactory = StdArc::new(move |_conn| Ok(client.clone()));
        let manager = JobManager::new(
            factory,
            StdArc::new(Obfuscator::new()),
            JobManagerConfig {
                max_concurrent_exports: 0,
                job_retention: StdDuration::from_secs(3600),
                per_batch_timeout: StdDuration::from_secs(120),
                wall_clock_cap_enabled: false,
                archive_output_dir: dir.path().join("archives"),
            },
        );

        let err = manager.submit(config(dir.path())).unwrap_err();
        assert!(matches!(err, Error::Quota(_)));
    }

    #[tokio::test]
    async fn cleanup_removes_only_old_terminal_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let client = StdArc::new(StubTsdbClient { range_data: range_data(), export_available: false, retention_secs: 3600 });
        let manager = make_manager(dir.path(), client);

        let job = manager.submit(config(dir.path())).unwrap();
        for _ in 0..50 {
            if manager.status(&job.id).unwrap().state == ExportState::Completed {
                break;
            }
            tokio::time::sleep(StdDuration::from_millis(20)).await;
        }

        // Retention window of 3600s means nothing is expired yet.
        assert_eq!(manager.cleanup_expired(), 0);
        assert!(manager.status(&job.id).is_some());
    }

    #[tokio::test]
    async fn cancel_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let client = StdArc::new(StubTsdbClient { range_data: range_data(), export_available: false, retention_secs: 3600 });
        let manager = make_manager(dir.path(), client);
        let job = manager.submit(config(dir.path())).unwrap();

        manager.cancel(&job.id).unwrap();
        manager.cancel(&job.id).unwrap();
    }

    #[test]
    fn computed_deadline_respects_fifteen_minute_floor() {
        let deadline = computed_wall_clock_deadline(1, StdDuration::from_secs(10));
        assert_eq!(deadline, StdDuration::from_secs(15 * 60));
    }

    #[test]
    fn computed_deadline_scales_with_batch_count() {
        let deadline = computed_wall_clock_deadline(1000, StdDuration::from_secs(120));
        assert!(deadline > StdDuration::from_secs(15 * 60));
    }
}
