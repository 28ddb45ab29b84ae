//! Wire response shapes for the Prometheus-compatible query API that the
//! TSDB client parses.

use serde::{Deserialize, Serialize};

/// Top-level `{"status": "success"|"error", "data": ...}` envelope shared
/// by `/api/v1/query`, `/api/v1/query_range` and `/api/v1/series`.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiEnvelope<T> {
    pub status: String,
    #[serde(default)]
    pub data: Option<T>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(rename = "errorType", default)]
    pub error_type: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueryData {
    #[serde(rename = "resultType")]
    pub result_type: String,
    pub result: Vec<InstantSeries>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InstantSeries {
    pub metric: std::collections::BTreeMap<String, String>,
    /// `[unix_seconds_float, "string_value"]`
    #[serde(default)]
    pub value: Option<(f64, String)>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RangeQueryData {
    #[serde(rename = "resultType")]
    pub result_type: String,
    pub result: Vec<RangeSeries>,
}

/// One series returned by `query_range`: a label set plus a list of
/// `(unix_seconds_float, "string_value")` points.
#[derive(Debug, Clone, Deserialize)]
pub struct RangeSeries {
    pub metric: std::collections::BTreeMap<String, String>,
    pub values: Vec<(f64, String)>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SeriesData(pub Vec<std::collections::BTreeMap<String, String>>);

/// Response shape of a native target status/retention endpoint, used to
/// fetch the target's retention window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionStatus {
    pub retention_secs: u64,
}
