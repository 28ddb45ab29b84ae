//! TSDB client: `query`, `query_range`, `series`, `export` against a
//! Prometheus-compatible TSDB endpoint, with auth, tenant routing, and a
//! range-query fallback when the native export route is unavailable.

pub mod types;
pub mod url;

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use bridge_common::{Auth, Error, Result};
use bytes::Bytes;
use futures::TryStreamExt;
use tokio::io::AsyncRead;
use tokio_util::io::StreamReader;
use tracing::{debug, warn};

pub use types::{ApiEnvelope, InstantSeries, QueryData, RangeQueryData, RangeSeries, RetentionStatus, SeriesData};

/// An owned, fully-async byte stream; the caller must fully consume or
/// drop it (dropping closes the underlying connection).
pub type ExportStream = Pin<Box<dyn AsyncRead + Send + Unpin>>;

/// Connection details for a single TSDB endpoint (mirrors
/// `bridge_core::config::Connection`, kept dependency-free here so the
/// client crate does not need the whole config document).
#[derive(Debug, Clone)]
pub struct Connection {
    pub base_url: String,
    pub api_base_path: Option<String>,
    pub tenant_id: Option<String>,
    pub auth: Auth,
    pub tls_verify: bool,
}

/// Behavior every TSDB client implementation (real HTTP, or a test fake)
/// must provide. Kept as a trait so `bridge-export`/`bridge-import` can be
/// unit tested without a live TSDB.
#[async_trait]
pub trait TsdbClient: Send + Sync {
    async fn instant_query(&self, expr: &str) -> Result<QueryData>;

    async fn range_query(
        &self,
        expr: &str,
        start: chrono::DateTime<chrono::Utc>,
        end: chrono::DateTime<chrono::Utc>,
        step_secs: i64,
    ) -> Result<RangeQueryData>;

    async fn series(
        &self,
        matcher: &str,
        start: chrono::DateTime<chrono::Utc>,
        end: chrono::DateTime<chrono::Utc>,
    ) -> Result<Vec<std::collections::BTreeMap<String, String>>>;

    /// Opens a native export stream. Returns `Err(Error::UnavailableRoute)`
    /// when the target doesn't serve the route; callers should fall back
    /// to range-query synthesis in that case.
    async fn export_stream(
        &self,
        selector: &str,
        start: chrono::DateTime<chrono::Utc>,
        end: chrono::DateTime<chrono::Utc>,
    ) -> Result<ExportStream>;

    /// Lightweight capability probe: opens then immediately closes an
    /// export stream, draining the body so the connection is released.
    async fn can_export(&self) -> bool;

    /// Retention window of the target, used by the importer's preflight.
    async fn retention_secs(&self) -> Result<u64>;

    /// POSTs a chunk of JSONL metric records to the target's import
    /// endpoint. Tenant headers and auth are applied the same way as the
    /// other operations.
    async fn import_chunk(&self, body: Bytes) -> Result<()>;
}

impl From<&bridge_core::config::Connection> for Connection {
    fn from(c: &bridge_core::config::Connection) -> Self {
        Connection {
            base_url: c.base_url.clone(),
            api_base_path: c.api_base_path.clone(),
            tenant_id: c.tenant_id.clone(),
            auth: c.auth.clone(),
            tls_verify: c.tls_verify,
        }
    }
}

/// Builds a live `reqwest`-backed client from a request's `Connection`.
/// `ExportConfig.Connection`/`ImportConfig.Connection` are immutable
/// per-job, so every submission gets its own client rather than sharing
/// one fixed target for the process lifetime.
pub type ClientFactory = std::sync::Arc<dyn Fn(&bridge_core::config::Connection) -> Result<std::sync::Arc<dyn TsdbClient>> + Send + Sync>;

pub fn build_http_client(connection: &bridge_core::config::Connection) -> Result<std::sync::Arc<dyn TsdbClient>> {
    Ok(std::sync::Arc::new(HttpTsdbClient::new(connection.into())?))
}

/// `reqwest`-backed implementation of [`TsdbClient`].
pub struct HttpTsdbClient {
    http: reqwest::Client,
    resolved: url::ResolvedBase,
    connection: Connection,
}

impl HttpTsdbClient {
    /// Builds a client with no client-wide request timeout: per-request
    /// deadlines are supplied by callers, so the client never imposes a
    /// shorter connection-lifetime cap than the caller's own deadline.
    pub fn new(connection: Connection) -> Result<Self> {
        let resolved = url::resolve_base(
            &connection.base_url,
            connection.api_base_path.as_deref(),
            connection.tenant_id.as_deref(),
        )?;

        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(!connection.tls_verify)
            .build()
            .map_err(|e| Error::configuration(format!("failed to build HTTP client: {e}")))?;

        Ok(Self { http, resolved, connection })
    }

    fn apply_auth(&self, mut builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        builder = match &self.connection.auth {
            Auth::None => builder,
            Auth::Basic { user, pass } => builder.basic_auth(user, Some(pass)),
            Auth::Bearer { token } => builder.bearer_auth(token),
            Auth::Header { name, value } => builder.header(name, value),
        };
        if let Some(tenant) = &self.resolved.tenant_id {
            builder = builder.header("X-Vm-AccountID", tenant).header("X-Vm-TenantID", tenant);
        }
        builder
    }

    /// Builds a request URL by appending `path` to the resolved base's
    /// *full* path, not by `Url::join` (which replaces the base's last
    /// path segment rather than extending it — fatal for a cluster/tenant
    /// base like `/select/12/prometheus`, where the `prometheus` segment
    /// must be kept). Mirrors how `export_stream`/`can_export` already
    /// build their URLs with `set_path`.
    fn path_url(&self, path: &str) -> Result<reqwest::Url> {
        let mut url = self.resolved.url.clone();
        let base = url.path().trim_end_matches('/');
        url.set_path(&format!("{base}/{}", path.trim_start_matches('/')));
        Ok(url)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str, query: &[(&str, String)]) -> Result<T> {
        let url = self.path_url(path)?;
        let request = self.apply_auth(self.http.get(url)).query(query);
        let response = request.send().await.map_err(map_transport_error)?;
        parse_envelope_response(response).await
    }

    fn describe(&self) -> String {
        format!(
            "host={} auth={}",
            self.resolved.url.host_str().unwrap_or("?"),
            self.connection.auth.redacted()
        )
    }
}

#[async_trait]
impl TsdbClient for HttpTsdbClient {
    async fn instant_query(&self, expr: &str) -> Result<QueryData> {
        self.get_json("api/v1/query", &[("query", expr.to_string())]).await
    }

    async fn range_query(
        &self,
        expr: &str,
        start: chrono::DateTime<chrono::Utc>,
        end: chrono::DateTime<chrono::Utc>,
        step_secs: i64,
    ) -> Result<RangeQueryData> {
        self.get_json(
            "api/v1/query_range",
            &[
                ("query", expr.to_string()),
                ("start", start.timestamp().to_string()),
                ("end", end.timestamp().to_string()),
                ("step", format!("{step_secs}s")),
            ],
        )
        .await
    }

    async fn series(
        &self,
        matcher: &str,
        start: chrono::DateTime<chrono::Utc>,
        end: chrono::DateTime<chrono::Utc>,
    ) -> Result<Vec<std::collections::BTreeMap<String, String>>> {
        let data: SeriesData = self
            .get_json(
                "api/v1/series",
                &[
                    ("match[]", matcher.to_string()),
                    ("start", start.timestamp().to_string()),
                    ("end", end.timestamp().to_string()),
                ],
            )
            .await?;
        Ok(data.0)
    }

    async fn export_stream(
        &self,
        selector: &str,
        start: chrono::DateTime<chrono::Utc>,
        end: chrono::DateTime<chrono::Utc>,
    ) -> Result<ExportStream> {
        let normalized = url::normalize_export_path(self.resolved.url.path());
        let mut export_url = self.resolved.url.clone();
        export_url.set_path(&format!("{}/api/v1/export", normalized.trim_end_matches('/')));

        let request = self.apply_auth(self.http.get(export_url)).query(&[
            ("match[]", selector.to_string()),
            ("start", start.timestamp().to_string()),
            ("end", end.timestamp().to_string()),
        ]);

        let response = request.send().await.map_err(map_transport_error)?;
        let status = response.status();

        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(Error::UnavailableRoute(format!("export route missing on {}", self.describe())));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            if looks_like_unavailable_route(status, &body) {
                return Err(Error::UnavailableRoute(format!(
                    "export route unsupported on {}: {}",
                    self.describe(),
                    body
                )));
            }
            return Err(Error::Protocol(format!(
                "export request failed: status={status} host={} body={body}",
                self.resolved.url.host_str().unwrap_or("?")
            )));
        }

        let byte_stream = response.bytes_stream().map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e));
        let reader = StreamReader::new(byte_stream);
        Ok(Box::pin(reader))
    }

    async fn can_export(&self) -> bool {
        let normalized = url::normalize_export_path(self.resolved.url.path());
        let mut export_url = self.resolved.url.clone();
        export_url.set_path(&format!("{}/api/v1/export", normalized.trim_end_matches('/')));

        let now = chrono::Utc::now();
        let probe = self.apply_auth(self.http.get(export_url)).query(&[
            ("match[]", "{__name__=\"up\"}".to_string()),
            ("start", (now - chrono::Duration::seconds(1)).timestamp().to_string()),
            ("end", now.timestamp().to_string()),
        ]);

        match probe.send().await {
            Ok(response) => {
                let ok = response.status().is_success();
                // Drain/close the body regardless of outcome.
                let _ = response.bytes().await;
                ok
            }
            Err(e) => {
                debug!(error = %e, "export capability probe failed");
                false
            }
        }
    }

    async fn retention_secs(&self) -> Result<u64> {
        let status: RetentionStatus = self
            .get_json("internal/resetRollupResultCache", &[])
            .await
            .or_else(|_| {
                // Not every target exposes a retention introspection endpoint;
                // importer preflight treats "unknown" as "no cutoff enforced".
                Ok::<RetentionStatus, Error>(RetentionStatus { retention_secs: 0 })
            })?;
        Ok(status.retention_secs)
    }

    async fn import_chunk(&self, body: Bytes) -> Result<()> {
        let url = self.path_url("api/v1/import")?;
        let request = self
            .apply_auth(self.http.post(url))
            .header("Content-Type", "application/jsonl")
            .body(body);
        let response = request.send().await.map_err(map_transport_error)?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Protocol(format!("import chunk rejected: status={status} body={body}")));
        }
        Ok(())
    }
}

async fn parse_envelope_response<T: serde::de::DeserializeOwned>(response: reqwest::Response) -> Result<T> {
    let status = response.status();
    let body = response.text().await.map_err(map_transport_error)?;

    if !status.is_success() {
        return Err(Error::Protocol(format!("non-2xx response: status={status} body={body}")));
    }

    let envelope: ApiEnvelope<T> = serde_json::from_str(&body)
        .map_err(|e| Error::Protocol(format!("invalid JSON response: {e}; body={body}")))?;

    if envelope.status != "success" {
        return Err(Error::Protocol(format!(
            "query failed: {}",
            envelope.error.unwrap_or_else(|| "unknown error".to_string())
        )));
    }

    envelope.data.ok_or_else(|| Error::Protocol("response missing data field".to_string()))
}

fn map_transport_error(e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::Transport(format!("request timed out: {e}"))
    } else {
        Error::Transport(format!("transport error: {e}"))
    }
}

fn looks_like_unavailable_route(status: reqwest::StatusCode, body: &str) -> bool {
    let lower = body.to_lowercase();
    status == reqwest::StatusCode::NOT_FOUND
        || lower.contains("missing route")
        || lower.contains("unsupported path")
        || lower.contains("not found")
}

/// Synthesizes JSONL-shaped `(labels, values, timestamps)` records from a
/// `query_range` result when the native export route is unavailable. One
/// record per returned series; values are already string-formatted by the
/// TSDB's wire format.
pub fn range_query_to_records(data: &RangeQueryData) -> Vec<bridge_common::MetricRecord> {
    data.result
        .iter()
        .map(|series| {
            let mut timestamps = Vec::with_capacity(series.values.len());
            let mut values = Vec::with_capacity(series.values.len());
            for (ts, value) in &series.values {
                timestamps.push((*ts * 1000.0).round() as i64);
                values.push(value.parse::<f64>().unwrap_or(f64::NAN));
            }
            bridge_common::MetricRecord {
                labels: series.metric.clone(),
                values,
                timestamps,
            }
        })
        .collect()
}

/// Selects the fallback query-range step for a given duration:
/// <1h -> 15s, <24h -> 60s, else 300s; overrides never go below 30s.
pub fn fallback_step_secs(duration: chrono::Duration, override_secs: Option<i64>) -> i64 {
    bridge_core::batch::fallback_step_secs(duration, override_secs)
}

/// A stub implementation useful for tests of downstream components
/// (`bridge-export`, `bridge-import`) that need a `TsdbClient` without a
/// live TSDB.
pub struct StubTsdbClient {
    pub range_data: RangeQueryData,
    pub export_available: bool,
    pub retention_secs: u64,
}

/// Test fake for the importer's target-side operations
/// (`import_chunk`/`series`/`retention_secs`), recording every posted chunk
/// for assertions.
pub struct RecordingImportTarget {
    pub retention_secs: u64,
    pub series_response: Vec<std::collections::BTreeMap<String, String>>,
    pub posted_chunks: std::sync::Mutex<Vec<Bytes>>,
    pub fail_after: Option<usize>,
}

#[async_trait]
impl TsdbClient for RecordingImportTarget {
    async fn instant_query(&self, _expr: &str) -> Result<QueryData> {
        Ok(QueryData { result_type: "vector".to_string(), result: Vec::new() })
    }

    async fn range_query(
        &self,
        _expr: &str,
        _start: chrono::DateTime<chrono::Utc>,
        _end: chrono::DateTime<chrono::Utc>,
        _step_secs: i64,
    ) -> Result<RangeQueryData> {
        Ok(RangeQueryData { result_type: "matrix".to_string(), result: Vec::new() })
    }

    async fn series(
        &self,
        _matcher: &str,
        _start: chrono::DateTime<chrono::Utc>,
        _end: chrono::DateTime<chrono::Utc>,
    ) -> Result<Vec<std::collections::BTreeMap<String, String>>> {
        Ok(self.series_response.clone())
    }

    async fn export_stream(
        &self,
        _selector: &str,
        _start: chrono::DateTime<chrono::Utc>,
        _end: chrono::DateTime<chrono::Utc>,
    ) -> Result<ExportStream> {
        Err(Error::UnavailableRoute("recording target does not export".to_string()))
    }

    async fn can_export(&self) -> bool {
        false
    }

    async fn retention_secs(&self) -> Result<u64> {
        Ok(self.retention_secs)
    }

    async fn import_chunk(&self, body: Bytes) -> Result<()> {
        let mut chunks = self.posted_chunks.lock().unwrap();
        if let Some(limit) = self.fail_after {
            if chunks.len() >= limit {
                return Err(Error::transport("simulated chunk POST failure"));
            }
        }
        chunks.push(body);
        Ok(())
    }
}

#[async_trait]
impl TsdbClient for StubTsdbClient {
    async fn instant_query(&self, _expr: &str) -> Result<QueryData> {
        Ok(QueryData { result_type: "vector".to_string(), result: Vec::new() })
    }

    async fn range_query(
        &self,
        _expr: &str,
        _start: chrono::DateTime<chrono::Utc>,
        _end: chrono::DateTime<chrono::Utc>,
        _step_secs: i64,
    ) -> Result<RangeQueryData> {
        Ok(self.range_data.clone())
    }

    async fn series(
        &self,
        _matcher: &str,
        _start: chrono::DateTime<chrono::Utc>,
        _end: chrono::DateTime<chrono::Utc>,
    ) -> Result<Vec<std::collections::BTreeMap<String, String>>> {
        Ok(self.range_data.result.iter().map(|s| s.metric.clone()).collect())
    }

    async fn export_stream(
        &self,
        _selector: &str,
        _start: chrono::DateTime<chrono::Utc>,
        _end: chrono::DateTime<chrono::Utc>,
    ) -> Result<ExportStream> {
        if !self.export_available {
            return Err(Error::UnavailableRoute("stub: export disabled".to_string()));
        }
        let mut bytes = Vec::new();
        for record in range_query_to_records(&self.range_data) {
            let mut line = serde_json::to_vec(&record).unwrap();
            line.push(b'\n');
            bytes.extend_from_slice(&line);
        }
        Ok(Box::pin(std::io::Cursor::new(bytes)))
    }

    async fn can_export(&self) -> bool {
        self.export_available
    }

    async fn retention_secs(&self) -> Result<u64> {
        Ok(self.retention_secs)
    }
}

/// Per-request deadline helper: wraps a future with a timeout when `d` is
/// `Some`, otherwise runs it unbounded.
pub async fn with_deadline<T>(
    deadline: Option<Duration>,
    fut: impl std::future::Future<Output = Result<T>>,
) -> Result<T> {
    match deadline {
        Some(d) => tokio::time::timeout(d, fut)
            .await
            .map_err(|_| Error::Transport(format!("operation exceeded deadline of {d:?}")))?,
        None => fut.await,
    }
}

/// Consumes (drains) the remainder of an export stream without caring
/// about its contents. Used by callers that need to guarantee body
/// closure.
pub async fn drain(mut stream: ExportStream) {
    let mut sink = Vec::new();
    let _ = tokio::io::AsyncReadExt::read_to_end(&mut stream, &mut sink).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_range_data() -> RangeQueryData {
        let mut metric = std::collections::BTreeMap::new();
        metric.insert("__name__".to_string(), "up".to_string());
        metric.insert("instance".to_string(), "10.0.1.5:8482".to_string());
        RangeQueryData {
            result_type: "matrix".to_string(),
            result: vec![RangeSeries { metric, values: vec![(1700000000.0, "1".to_string()), (1700000060.0, "0".to_string())] }],
        }
    }

    #[test]
    fn range_query_synthesis_converts_seconds_to_milliseconds() {
        let records = range_query_to_records(&sample_range_data());
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].timestamps, vec![1700000000000, 1700000060000]);
        assert_eq!(records[0].values, vec![1.0, 0.0]);
    }

    #[tokio::test]
    async fn stub_export_stream_respects_availability_flag() {
        let stub = StubTsdbClient { range_data: sample_range_data(), export_available: false, retention_secs: 3600 };
        let start = chrono::Utc::now();
        let end = start + chrono::Duration::hours(1);
        let err = stub.export_stream("{__name__!=\"\"}", start, end).await.unwrap_err();
        assert!(matches!(err, Error::UnavailableRoute(_)));
    }

    #[tokio::test]
    async fn with_deadline_times_out_a_slow_future() {
        let slow = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok::<_, Error>(())
        };
        let result = with_deadline(Some(Duration::from_millis(5)), slow).await;
        assert!(result.is_err());
    }

    #[test]
    fn path_url_extends_a_pathful_tenant_base_instead_of_replacing_its_last_segment() {
        let connection = Connection {
            base_url: "http://localhost:8428/select/12/prometheus".to_string(),
            api_base_path: None,
            tenant_id: None,
            auth: Auth::None,
            tls_verify: true,
        };
        let client = HttpTsdbClient::new(connection).unwrap();
        let url = client.path_url("api/v1/query").unwrap();
        assert_eq!(url.as_str(), "http://localhost:8428/select/12/prometheus/api/v1/query");
    }
}
