//! Export request configuration and the bridge's own application config
//! document.

use std::collections::HashSet;
use std::path::PathBuf;

use bridge_common::{Auth, Error, Result, TimeRange};
use serde::{Deserialize, Serialize};

use crate::selector::Selection;

/// Connection details for a TSDB endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Connection {
    pub base_url: String,
    pub api_base_path: Option<String>,
    pub tenant_id: Option<String>,
    #[serde(default)]
    pub auth: Auth,
    #[serde(default = "default_true")]
    pub tls_verify: bool,
}

fn default_true() -> bool {
    true
}

/// Per-label-kind obfuscation toggles.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ObfuscationSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub instance: bool,
    #[serde(default)]
    pub job: bool,
    #[serde(default)]
    pub custom_label_keys: HashSet<String>,
}

/// Batch interval configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub custom_interval_secs: Option<i64>,
    pub recommended_metric_step_secs: Option<i64>,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self { enabled: true, custom_interval_secs: None, recommended_metric_step_secs: None }
    }
}

/// Immutable per-job export request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportConfig {
    pub connection: Connection,
    pub time_range: TimeRange,
    pub selection: Selection,
    #[serde(default)]
    pub obfuscation: ObfuscationSettings,
    #[serde(default)]
    pub batch: BatchSettings,
    #[serde(default)]
    pub resume_from_batch: u64,
    pub staging_dir: PathBuf,
}

impl ExportConfig {
    pub fn validate(&self) -> Result<()> {
        if self.connection.base_url.trim().is_empty() {
            return Err(Error::configuration("connection.base_url must not be empty"));
        }
        if !self.connection.base_url.starts_with("http://") && !self.connection.base_url.starts_with("https://") {
            return Err(Error::configuration(format!(
                "base_url must start with http:// or https://: {}",
                self.connection.base_url
            )));
        }
        Ok(())
    }
}

/// Immutable per-job import request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportConfig {
    pub connection: Connection,
    /// Path to the uploaded bundle, either a sealed archive (`.zip`) or a
    /// raw `metrics.jsonl` file.
    pub bundle_path: PathBuf,
    #[serde(default = "default_true")]
    pub drop_old: bool,
    #[serde(default = "default_chunk_size_bytes")]
    pub chunk_size_bytes: usize,
    #[serde(default = "default_preflight_sample_lines")]
    pub preflight_sample_lines: u64,
    #[serde(default)]
    pub preflight_full_scan: bool,
    pub staging_dir: PathBuf,
}

fn default_chunk_size_bytes() -> usize {
    512 * 1024
}
fn default_preflight_sample_lines() -> u64 {
    2000
}

impl ImportConfig {
    pub fn validate(&self) -> Result<()> {
        if self.connection.base_url.trim().is_empty() {
            return Err(Error::configuration("connection.base_url must not be empty"));
        }
        if !self.connection.base_url.starts_with("http://") && !self.connection.base_url.starts_with("https://") {
            return Err(Error::configuration(format!(
                "base_url must start with http:// or https://: {}",
                self.connection.base_url
            )));
        }
        if self.chunk_size_bytes == 0 {
            return Err(Error::configuration("chunk_size_bytes must be greater than zero"));
        }
        Ok(())
    }
}

/// Application-wide configuration document for the bridge process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    #[serde(default = "default_bind_addr")]
    pub http_bind_addr: String,
    #[serde(default = "default_staging_dir")]
    pub staging_dir: PathBuf,
    #[serde(default = "default_output_dir")]
    pub archive_output_dir: PathBuf,
    #[serde(default = "default_max_concurrent_exports")]
    pub max_concurrent_exports: usize,
    #[serde(default = "default_job_retention_secs")]
    pub job_retention_secs: u64,
    #[serde(default = "default_per_batch_timeout_secs")]
    pub per_batch_timeout_secs: u64,
    #[serde(default)]
    pub job_wall_clock_cap_enabled: bool,
    #[serde(default = "default_max_concurrent_imports")]
    pub max_concurrent_imports: usize,
    #[serde(default = "default_chunk_size_bytes")]
    pub import_chunk_size_bytes: usize,
}

fn default_max_concurrent_imports() -> usize {
    3
}

fn default_bind_addr() -> String {
    "127.0.0.1:8428".to_string()
}
fn default_staging_dir() -> PathBuf {
    PathBuf::from("./staging")
}
fn default_output_dir() -> PathBuf {
    PathBuf::from("./archives")
}
fn default_max_concurrent_exports() -> usize {
    3
}
fn default_job_retention_secs() -> u64 {
    24 * 3600
}
fn default_per_batch_timeout_secs() -> u64 {
    120
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            http_bind_addr: default_bind_addr(),
            staging_dir: default_staging_dir(),
            archive_output_dir: default_output_dir(),
            max_concurrent_exports: default_max_concurrent_exports(),
            job_retention_secs: default_job_retention_secs(),
            per_batch_timeout_secs: default_per_batch_timeout_secs(),
            job_wall_clock_cap_enabled: false,
            max_concurrent_imports: default_max_concurrent_imports(),
            import_chunk_size_bytes: default_chunk_size_bytes(),
        }
    }
}

impl BridgeConfig {
    /// Parse a TOML document, then apply `BRIDGE_`-prefixed environment
    /// variable overrides for the handful of operationally-tweaked fields.
    pub fn from_toml_str(input: &str) -> Result<Self> {
        let mut config: BridgeConfig = toml::from_str(input)
            .map_err(|e| Error::configuration(format!("invalid config document: {e}")))?;
        config.apply_env_overrides();
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("BRIDGE_HTTP_BIND_ADDR") {
            self.http_bind_addr = v;
        }
        if let Ok(v) = std::env::var("BRIDGE_MAX_CONCURRENT_EXPORTS") {
            if let Ok(n) = v.parse() {
                self.max_concurrent_exports = n;
            }
        }
        if let Ok(v) = std::env::var("BRIDGE_JOB_RETENTION_SECS") {
            if let Ok(n) = v.parse() {
                self.job_retention_secs = n;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = BridgeConfig::default();
        assert_eq!(config.max_concurrent_exports, 3);
        assert!(!config.job_wall_clock_cap_enabled);
    }

    #[test]
    fn parses_a_minimal_toml_document() {
        let toml = r#"
            http_bind_addr = "0.0.0.0:9000"
        "#;
        let config = BridgeConfig::from_toml_str(toml).unwrap();
        assert_eq!(config.http_bind_addr, "0.0.0.0:9000");
        assert_eq!(config.max_concurrent_exports, 3);
    }

    #[test]
    fn export_config_rejects_non_http_base_url() {
        let connection = Connection {
            base_url: "ftp://example.com".into(),
            api_base_path: None,
            tenant_id: None,
            auth: Auth::None,
            tls_verify: true,
        };
        let time_range =
            TimeRange::new(chrono::Utc::now(), chrono::Utc::now() + chrono::Duration::hours(1)).unwrap();
        let config = ExportConfig {
            connection,
            time_range,
            selection: Selection::MetricsQL { expr: "up".into() },
            obfuscation: ObfuscationSettings::default(),
            batch: BatchSettings::default(),
            resume_from_batch: 0,
            staging_dir: PathBuf::from("/tmp"),
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn import_config_rejects_zero_chunk_size() {
        let config = ImportConfig {
            connection: Connection {
                base_url: "http://localhost:8428".into(),
                api_base_path: None,
                tenant_id: None,
                auth: Auth::None,
                tls_verify: true,
            },
            bundle_path: PathBuf::from("/tmp/bundle.zip"),
            drop_old: true,
            chunk_size_bytes: 0,
            preflight_sample_lines: 2000,
            preflight_full_scan: false,
            staging_dir: PathBuf::from("/tmp"),
        };
        assert!(config.validate().is_err());
    }
}
