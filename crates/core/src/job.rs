//! Export/import job data model and state machines (spec.md §3).

use bridge_common::Error;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Export job lifecycle state (spec.md §3: `Pending -> Running -> {Completed, Failed, Canceled}`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportState {
    Pending,
    Running,
    Completed,
    Failed,
    Canceled,
}

impl ExportState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ExportState::Completed | ExportState::Failed | ExportState::Canceled)
    }
}

/// Result of a finalized archive (spec.md §4.4 Finalization).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveResult {
    pub path: String,
    pub size_bytes: u64,
    pub sha256: String,
    pub metrics_count: u64,
}

/// Immutable identity plus monotonically-updated status for an export job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportJob {
    pub id: String,
    pub created_at: chrono::DateTime<chrono::Utc>,

    pub state: ExportState,
    pub stage: String,
    pub batches_total: u64,
    pub batches_completed: u64,
    pub metrics_processed: u64,
    pub eta_seconds: Option<u64>,
    pub error: Option<String>,
    pub final_archive: Option<ArchiveResult>,

    /// Batch index (0-based) after which the job should resume if it
    /// fails or is canceled (spec.md §4.5 `resume`).
    pub last_completed_batch: Option<u64>,

    /// When the job reached a terminal state; drives retention cleanup
    /// (spec.md §4.5 "Cleanup").
    pub finished_at: Option<chrono::DateTime<chrono::Utc>>,

    #[serde(skip)]
    pub started_at: Option<std::time::Instant>,
}

impl ExportJob {
    pub fn new(id: String, batches_total: u64) -> Self {
        Self {
            id,
            created_at: chrono::Utc::now(),
            state: ExportState::Pending,
            stage: "queued".to_string(),
            batches_total,
            batches_completed: 0,
            metrics_processed: 0,
            eta_seconds: None,
            error: None,
            final_archive: None,
            last_completed_batch: None,
            finished_at: None,
            started_at: None,
        }
    }

    pub fn start(&mut self) {
        self.state = ExportState::Running;
        self.stage = "running".to_string();
        self.started_at = Some(std::time::Instant::now());
        info!(job_id = %self.id, batches_total = self.batches_total, "export job started");
    }

    /// Apply a progress update. Only `Running -> Running` transitions
    /// mutate counters; terminal jobs are left untouched. `batches_completed`
    /// and `metrics_processed` are coalesced with `max` so a late or
    /// duplicate update can never move them backwards (spec.md §4.5,
    /// §9 "absolute vs relative" resolution).
    pub fn apply_progress(&mut self, absolute_batch_index: u64, metrics_in_batch: u64) {
        if self.state.is_terminal() {
            return;
        }
        self.state = ExportState::Running;
        self.batches_completed = self.batches_completed.max(absolute_batch_index);
        self.metrics_processed += metrics_in_batch;
        self.last_completed_batch = Some(self.batches_completed);
        self.eta_seconds = self.estimate_eta_seconds();
    }

    fn estimate_eta_seconds(&self) -> Option<u64> {
        if self.batches_completed == 0 {
            return None;
        }
        let elapsed = self.started_at?.elapsed().as_secs_f64();
        let per_batch = elapsed / self.batches_completed as f64;
        let remaining = self.batches_total.saturating_sub(self.batches_completed);
        Some((per_batch * remaining as f64).round() as u64)
    }

    pub fn complete(&mut self, archive: ArchiveResult) {
        if self.state.is_terminal() {
            return;
        }
        self.state = ExportState::Completed;
        self.stage = "completed".to_string();
        self.final_archive = Some(archive);
        self.eta_seconds = Some(0);
        self.finished_at = Some(chrono::Utc::now());
        info!(job_id = %self.id, "export job completed");
    }

    pub fn fail(&mut self, error: &Error) {
        if self.state.is_terminal() {
            return;
        }
        self.state = ExportState::Failed;
        self.stage = "failed".to_string();
        self.error = Some(error.to_string());
        self.finished_at = Some(chrono::Utc::now());
        warn!(job_id = %self.id, last_completed_batch = ?self.last_completed_batch, %error, "export job failed");
    }

    pub fn cancel(&mut self) {
        if self.state.is_terminal() {
            return;
        }
        self.state = ExportState::Canceled;
        self.stage = "canceled".to_string();
        self.finished_at = Some(chrono::Utc::now());
        debug!(job_id = %self.id, "export job canceled");
    }

    /// Structural invariants from spec.md §3/§8.
    pub fn check_invariants(&self) -> Result<(), String> {
        if self.batches_completed > self.batches_total {
            return Err(format!(
                "batches_completed ({}) exceeds batches_total ({})",
                self.batches_completed, self.batches_total
            ));
        }
        if self.state == ExportState::Completed
            && (self.final_archive.is_none() || self.final_archive.as_ref().unwrap().sha256.is_empty())
        {
            return Err("completed job is missing a non-empty archive hash".to_string());
        }
        Ok(())
    }
}

/// Import job lifecycle state (spec.md §3: `Queued -> Running -> {Completed, Failed}`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImportState {
    Queued,
    Running,
    Completed,
    Failed,
}

impl ImportState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ImportState::Completed | ImportState::Failed)
    }
}

/// Per-metric rollup produced at the end of a successful import.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImportSummaryEntry {
    pub metric_name: String,
    pub example_labels: std::collections::BTreeMap<String, String>,
    pub observed_start_ms: i64,
    pub observed_end_ms: i64,
}

/// Outcome of the post-import series-visibility check (spec.md §4.6 Verification).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationResult {
    pub matched_series: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportJob {
    pub id: String,
    pub created_at: chrono::DateTime<chrono::Utc>,

    pub state: ImportState,
    pub bundle_metrics_path: String,

    pub bytes_total: u64,
    pub bytes_completed: u64,
    pub chunks_total: u64,
    pub chunks_completed: u64,

    pub points: u64,
    pub dropped_old: u64,
    pub skipped_lines: u64,

    pub retention_cutoff: Option<chrono::DateTime<chrono::Utc>>,
    /// Byte offset to resume from after a failed chunk POST.
    pub resume_offset: u64,
    pub resume_ready: bool,

    pub summary: Vec<ImportSummaryEntry>,
    pub verification: Option<VerificationResult>,
    pub error: Option<String>,

    /// When the job reached a terminal state; drives retention cleanup.
    pub finished_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl ImportJob {
    pub fn new(id: String, bundle_metrics_path: String) -> Self {
        Self {
            id,
            created_at: chrono::Utc::now(),
            state: ImportState::Queued,
            bundle_metrics_path,
            bytes_total: 0,
            bytes_completed: 0,
            chunks_total: 0,
            chunks_completed: 0,
            points: 0,
            dropped_old: 0,
            skipped_lines: 0,
            retention_cutoff: None,
            resume_offset: 0,
            resume_ready: false,
            summary: Vec::new(),
            verification: None,
            error: None,
            finished_at: None,
        }
    }

    pub fn start(&mut self) {
        if !self.state.is_terminal() {
            self.state = ImportState::Running;
        }
    }

    pub fn record_chunk(&mut self, bytes_sent: u64, points: u64, dropped_old: u64, skipped: u64) {
        if self.state.is_terminal() {
            return;
        }
        self.bytes_completed += bytes_sent;
        self.chunks_completed += 1;
        self.points += points;
        self.dropped_old += dropped_old;
        self.skipped_lines += skipped;
        self.resume_offset = self.bytes_completed;
    }

    pub fn complete(&mut self, verification: Option<VerificationResult>) {
        if self.state.is_terminal() {
            return;
        }
        self.state = ImportState::Completed;
        self.verification = verification;
        self.finished_at = Some(chrono::Utc::now());
    }

    pub fn fail(&mut self, error: &Error, resume_ready: bool) {
        if self.state.is_terminal() {
            return;
        }
        self.state = ImportState::Failed;
        self.error = Some(error.to_string());
        self.resume_ready = resume_ready;
        self.finished_at = Some(chrono::Utc::now());
    }

    /// spec.md §8 invariant: `dropped_old + skipped + points = lines_read`.
    pub fn check_accounting(&self, lines_read: u64) -> Result<(), String> {
        let total = self.dropped_old + self.skipped_lines + self.points;
        if total != lines_read {
            return Err(format!(
                "accounting mismatch: dropped_old({}) + skipped({}) + points({}) = {} != lines_read({})",
                self.dropped_old, self.skipped_lines, self.points, total, lines_read
            ));
        }
        Ok(())
    }
}
