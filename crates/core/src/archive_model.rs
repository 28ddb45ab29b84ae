//! Archive metadata model.

use serde::{Deserialize, Serialize};

/// User-visible metadata embedded in a sealed archive as `metadata.json`.
/// Deliberately excludes instance/job obfuscation maps even when
/// obfuscation was applied (verified in `bridge-archive`'s tests).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveMetadata {
    pub export_id: String,
    pub export_date: chrono::DateTime<chrono::Utc>,
    pub time_range_start: chrono::DateTime<chrono::Utc>,
    pub time_range_end: chrono::DateTime<chrono::Utc>,
    pub selected_components: Vec<String>,
    pub selected_jobs: Vec<String>,
    pub metrics_count: u64,
    pub obfuscation_applied: bool,
    pub writer_version: String,
    pub tool_version: String,
}
