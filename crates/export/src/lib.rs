//! Export Service and Export Job Manager (spec.md §4.4, §4.5).

pub mod manager;
pub mod service;

pub use manager::{computed_wall_clock_deadline, JobManager, JobManagerConfig};
pub use service::{BatchProgress, ExportRunError, ExportService, FinalizedExport};
