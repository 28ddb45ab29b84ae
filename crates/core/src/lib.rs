//! Domain model and pipeline algorithms for the metrics bridge.
//!
//! This crate holds the business logic that spec.md assigns to the Export
//! Service, Export Job Manager, Obfuscator and JSONL codec components, plus
//! the shared configuration document. It has no network or filesystem I/O
//! of its own beyond the JSONL streaming codec; the TSDB client lives in
//! `bridge-client`, archive sealing in `bridge-archive`.

pub use bridge_common::{Auth, Error, MetricRecord, Result, TimeRange};

pub mod archive_model;
pub mod batch;
pub mod config;
pub mod job;
pub mod jsonl;
pub mod obfuscate;
pub mod selector;
