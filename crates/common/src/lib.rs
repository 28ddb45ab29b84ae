/// Common error taxonomy and wire types shared across the metrics bridge crates
use std::io;
use thiserror::Error;

/// Result type for bridge operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error taxonomy for the export/import pipeline
#[derive(Error, Debug)]
pub enum Error {
    /// Bad URL, missing field, invalid time range
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Rejected by the TSDB
    #[error("authentication error: {0}")]
    Authentication(String),

    /// Native export route missing; caller should fall back to range-query synthesis
    #[error("export route unavailable: {0}")]
    UnavailableRoute(String),

    /// Network failure, TLS error
    #[error("transport error: {0}")]
    Transport(String),

    /// Non-2xx status with body, invalid JSON
    #[error("protocol error: {0}")]
    Protocol(String),

    /// User-initiated cancellation
    #[error("canceled")]
    Cancellation,

    /// Disk full, permission denied
    #[error("resource error: {0}")]
    Resource(String),

    /// Too many concurrent jobs
    #[error("quota exceeded: {0}")]
    Quota(String),

    /// Not found (unknown job id, unknown path)
    #[error("not found: {0}")]
    NotFound(String),

    /// Generic error with a message
    #[error("{0}")]
    Generic(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// JSON (de)serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    pub fn generic<S: Into<String>>(msg: S) -> Self {
        Error::Generic(msg.into())
    }

    pub fn configuration<S: Into<String>>(msg: S) -> Self {
        Error::Configuration(msg.into())
    }

    pub fn authentication<S: Into<String>>(msg: S) -> Self {
        Error::Authentication(msg.into())
    }

    pub fn unavailable_route<S: Into<String>>(msg: S) -> Self {
        Error::UnavailableRoute(msg.into())
    }

    pub fn transport<S: Into<String>>(msg: S) -> Self {
        Error::Transport(msg.into())
    }

    pub fn protocol<S: Into<String>>(msg: S) -> Self {
        Error::Protocol(msg.into())
    }

    pub fn resource<S: Into<String>>(msg: S) -> Self {
        Error::Resource(msg.into())
    }

    pub fn quota<S: Into<String>>(msg: S) -> Self {
        Error::Quota(msg.into())
    }

    pub fn not_found<S: Into<String>>(msg: S) -> Self {
        Error::NotFound(msg.into())
    }

    /// True when the underlying condition is retryable (transport hiccups,
    /// as opposed to configuration mistakes).
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Transport(_))
    }

    /// HTTP status this error maps to on the API surface. Kept as a plain
    /// status code rather than an `axum` type so this crate has no
    /// web-framework dependency.
    pub fn status_code(&self) -> u16 {
        match self {
            Error::Configuration(_) => 400,
            Error::Authentication(_) => 401,
            Error::UnavailableRoute(_) => 502,
            Error::Transport(_) => 502,
            Error::Protocol(_) => 502,
            Error::Cancellation => 499,
            Error::Resource(_) => 500,
            Error::Quota(_) => 409,
            Error::NotFound(_) => 404,
            Error::Generic(_) => 500,
            Error::Io(_) => 500,
            Error::Serialization(_) => 400,
        }
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Generic(s)
    }
}

impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Generic(s.to_string())
    }
}

/// Authentication variant for a TSDB connection
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Auth {
    None,
    Basic { user: String, pass: String },
    Bearer { token: String },
    Header { name: String, value: String },
}

impl Default for Auth {
    fn default() -> Self {
        Auth::None
    }
}

impl Auth {
    /// A redacted one-line description safe to put in error messages/logs.
    pub fn redacted(&self) -> String {
        match self {
            Auth::None => "none".to_string(),
            Auth::Basic { user, .. } => format!("basic(user={user}, pass=***)"),
            Auth::Bearer { .. } => "bearer(***)".to_string(),
            Auth::Header { name, .. } => format!("header({name}=***)"),
        }
    }
}

/// Half-open UTC time range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct TimeRange {
    pub start: chrono::DateTime<chrono::Utc>,
    pub end: chrono::DateTime<chrono::Utc>,
}

impl TimeRange {
    pub fn new(start: chrono::DateTime<chrono::Utc>, end: chrono::DateTime<chrono::Utc>) -> Result<Self> {
        if start >= end {
            return Err(Error::configuration(format!(
                "time range start ({start}) must be before end ({end})"
            )));
        }
        Ok(Self { start, end })
    }

    pub fn duration(&self) -> chrono::Duration {
        self.end - self.start
    }
}

/// A single metric sample series as produced by the TSDB client and consumed
/// by the JSONL encoder.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct MetricRecord {
    /// Must contain `__name__`.
    pub labels: std::collections::BTreeMap<String, String>,
    /// Parallel to `timestamps`; same length, non-empty.
    pub values: Vec<f64>,
    /// Milliseconds since epoch, monotonically non-decreasing.
    pub timestamps: Vec<i64>,
}

impl MetricRecord {
    /// Structural validation: `__name__` present, parallel arrays non-empty
    /// and equal length, timestamps non-decreasing.
    pub fn validate(&self) -> Result<()> {
        if !self.labels.contains_key("__name__") {
            return Err(Error::Protocol("metric record missing __name__ label".into()));
        }
        if self.values.is_empty() || self.timestamps.is_empty() {
            return Err(Error::Protocol("metric record has empty values/timestamps".into()));
        }
        if self.values.len() != self.timestamps.len() {
            return Err(Error::Protocol(format!(
                "metric record values/timestamps length mismatch: {} vs {}",
                self.values.len(),
                self.timestamps.len()
            )));
        }
        if !self.timestamps.windows(2).all(|w| w[0] <= w[1]) {
            return Err(Error::Protocol("metric record timestamps are not monotonically non-decreasing".into()));
        }
        Ok(())
    }

    pub fn metric_name(&self) -> &str {
        self.labels.get("__name__").map(|s| s.as_str()).unwrap_or("")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn time_range_rejects_inverted_bounds() {
        let start = chrono::Utc.with_ymd_and_hms(2025, 1, 15, 11, 0, 0).unwrap();
        let end = chrono::Utc.with_ymd_and_hms(2025, 1, 15, 10, 0, 0).unwrap();
        assert!(TimeRange::new(start, end).is_err());
    }

    #[test]
    fn time_range_accepts_ordered_bounds() {
        let start = chrono::Utc.with_ymd_and_hms(2025, 1, 15, 10, 0, 0).unwrap();
        let end = chrono::Utc.with_ymd_and_hms(2025, 1, 15, 11, 0, 0).unwrap();
        let range = TimeRange::new(start, end).unwrap();
        assert_eq!(range.duration(), chrono::Duration::hours(1));
    }

    #[test]
    fn metric_record_requires_name_label() {
        let record = MetricRecord {
            labels: std::collections::BTreeMap::new(),
            values: vec![1.0],
            timestamps: vec![1000],
        };
        assert!(record.validate().is_err());
    }

    #[test]
    fn metric_record_requires_equal_length_arrays() {
        let mut labels = std::collections::BTreeMap::new();
        labels.insert("__name__".to_string(), "up".to_string());
        let record = MetricRecord {
            labels,
            values: vec![1.0, 2.0],
            timestamps: vec![1000],
        };
        assert!(record.validate().is_err());
    }

    #[test]
    fn metric_record_requires_monotonic_timestamps() {
        let mut labels = std::collections::BTreeMap::new();
        labels.insert("__name__".to_string(), "up".to_string());
        let record = MetricRecord {
            labels,
            values: vec![1.0, 2.0],
            timestamps: vec![2000, 1000],
        };
        assert!(record.validate().is_err());
    }

    #[test]
    fn auth_redacts_secrets() {
        let auth = Auth::Bearer { token: "secret-token".into() };
        assert!(!auth.redacted().contains("secret-token"));
    }
}
