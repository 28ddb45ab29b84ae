//! Bundle extraction, preflight analysis, and the chunked streaming
//! importer with resume and verification (spec.md §4.6).

pub mod bundle;
pub mod importer;
pub mod manager;
pub mod preflight;

pub use bundle::{prepare_bundle, PreparedBundle};
pub use importer::{stream_import, verify_import, ImportProgress, ImportRunError, ImportRunResult};
pub use manager::{ImportJobManager, ImportJobManagerConfig};
pub use preflight::{analyze_bundle, PreflightReport, TimestampScale, DEFAULT_SAMPLE_LINES};
