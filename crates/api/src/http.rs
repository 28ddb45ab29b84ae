//! HTTP JSON API surface. Every endpoint returns `application/json`,
//! including on error: `{"error": "<reason>"}` with the status code
//! `bridge_common::Error::status_code` maps to. The archive download and
//! bundle upload endpoints are the streaming/multipart exceptions.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Multipart, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use bridge_client::{build_http_client, TsdbClient};
use bridge_common::{Error, MetricRecord, Result, TimeRange};
use bridge_core::config::{Connection, ExportConfig, ImportConfig};
use bridge_core::job::{ExportJob, ImportJob};
use bridge_core::obfuscate::Obfuscator;
use bridge_export::service::{guess_component, ExportService};
use bridge_export::JobManager;
use bridge_import::{analyze_bundle, prepare_bundle, ImportJobManager};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

/// Shared state behind every handler, pulled in via axum's `State`
/// extractor.
#[derive(Clone)]
pub struct ApiState {
    pub export_manager: Arc<JobManager>,
    pub import_manager: Arc<ImportJobManager>,
    pub staging_dir: PathBuf,
    pub import_chunk_size_bytes: usize,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/api/validate", post(validate))
        .route("/api/discover", post(discover))
        .route("/api/sample", post(sample))
        .route("/api/export", post(export_oneshot))
        .route("/api/export/start", post(export_start))
        .route("/api/export/status", get(export_status))
        .route("/api/export/cancel", post(export_cancel))
        .route("/api/download", get(download))
        .route("/api/upload", post(upload))
        .route("/api/import/status", get(import_status))
        .route("/api/import/resume", post(import_resume))
        .route("/api/analyze", post(analyze))
        .route("/api/check-endpoint", post(check_endpoint))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Wraps a `bridge_common::Error` so it can be returned directly from a
/// handler; maps to `{"error": "<reason>"}` with the taxonomy's status code.
struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(ErrorBody { error: self.0.to_string() })).into_response()
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

type ApiResult<T> = std::result::Result<T, ApiError>;

async fn healthz() -> impl IntoResponse {
    Json(serde_json::json!({"status": "ok"}))
}

#[derive(Deserialize)]
struct ValidateRequest {
    connection: Connection,
}

#[derive(Serialize)]
struct ValidateResponse {
    success: bool,
    valid: bool,
    version: String,
    is_victoria_metrics: bool,
    vm_components: Vec<String>,
}

async fn validate(Json(req): Json<ValidateRequest>) -> ApiResult<Json<ValidateResponse>> {
    let client = build_http_client(&req.connection)?;
    match client.instant_query("up").await {
        Ok(_) => {
            let components = discover_components(client.as_ref(), default_discovery_range())
                .await
                .map(|c| c.into_iter().map(|c| c.component).collect())
                .unwrap_or_default();
            Ok(Json(ValidateResponse {
                success: true,
                valid: true,
                version: "unknown".to_string(),
                is_victoria_metrics: true,
                vm_components: components,
            }))
        }
        Err(e) => {
            error!(error = %e, "validate probe failed");
            Ok(Json(ValidateResponse {
                success: false,
                valid: false,
                version: "unknown".to_string(),
                is_victoria_metrics: false,
                vm_components: Vec::new(),
            }))
        }
    }
}

fn default_discovery_range() -> TimeRange {
    let end = chrono::Utc::now();
    TimeRange { start: end - chrono::Duration::hours(1), end }
}

#[derive(Deserialize)]
struct DiscoverRequest {
    connection: Connection,
    #[serde(default)]
    time_range: Option<TimeRange>,
}

#[derive(Serialize)]
struct ComponentSummary {
    component: String,
    jobs: Vec<String>,
    instance_count: u64,
    metrics_count_estimate: u64,
}

#[derive(Serialize)]
struct DiscoverResponse {
    components: Vec<ComponentSummary>,
}

async fn discover(Json(req): Json<DiscoverRequest>) -> ApiResult<Json<DiscoverResponse>> {
    let client = build_http_client(&req.connection)?;
    let range = req.time_range.unwrap_or_else(default_discovery_range);
    let components = discover_components(client.as_ref(), range).await?;
    Ok(Json(DiscoverResponse { components }))
}

/// Groups the target's series by guessed component, reusing
/// `bridge_export::service::guess_component`; feeds both `/api/discover`
/// and `/api/validate`'s `vm_components`.
async fn discover_components(client: &dyn TsdbClient, range: TimeRange) -> Result<Vec<ComponentSummary>> {
    let series = client.series("{__name__=~\".+\"}", range.start, range.end).await?;

    let mut grouped: BTreeMap<String, (std::collections::HashSet<String>, std::collections::HashSet<String>, std::collections::HashSet<String>)> =
        BTreeMap::new();

    for labels in series {
        let probe = MetricRecord { labels: labels.clone(), values: vec![0.0], timestamps: vec![0] };
        let component = guess_component(&probe);
        let entry = grouped.entry(component).or_default();
        if let Some(job) = labels.get("job") {
            entry.0.insert(job.clone());
        }
        if let Some(instance) = labels.get("instance") {
            entry.1.insert(instance.clone());
        }
        if let Some(name) = labels.get("__name__") {
            entry.2.insert(name.clone());
        }
    }

    Ok(grouped
        .into_iter()
        .map(|(component, (jobs, instances, names))| ComponentSummary {
            component,
            jobs: jobs.into_iter().collect(),
            instance_count: instances.len() as u64,
            metrics_count_estimate: names.len() as u64,
        })
        .collect())
}

#[derive(Deserialize)]
struct SampleRequest {
    connection: Connection,
    #[serde(default)]
    selector: Option<String>,
    #[serde(default)]
    limit: Option<usize>,
}

#[derive(Serialize)]
struct SampleEntry {
    name: String,
    labels: BTreeMap<String, String>,
    value: Option<f64>,
}

#[derive(Serialize)]
struct SampleResponse {
    samples: Vec<SampleEntry>,
    count: usize,
}

async fn sample(Json(req): Json<SampleRequest>) -> ApiResult<Json<SampleResponse>> {
    let client = build_http_client(&req.connection)?;
    let selector = req.selector.unwrap_or_else(|| "{__name__=~\".+\"}".to_string());
    let data = client.instant_query(&selector).await?;

    let limit = req.limit.unwrap_or(100);
    let samples: Vec<SampleEntry> = data
        .result
        .into_iter()
        .take(limit)
        .map(|series| SampleEntry {
            name: series.metric.get("__name__").cloned().unwrap_or_default(),
            labels: series.metric,
            value: series.value.and_then(|(_, v)| v.parse::<f64>().ok()),
        })
        .collect();

    let count = samples.len();
    Ok(Json(SampleResponse { samples, count }))
}

#[derive(Serialize)]
struct ArchiveSummary {
    path: String,
    size_bytes: u64,
    sha256: String,
    metrics_count: u64,
}

/// `POST /api/export`: synchronous legacy export, bypassing the job
/// manager entirely.
async fn export_oneshot(Json(config): Json<ExportConfig>) -> ApiResult<Json<ArchiveSummary>> {
    config.validate()?;
    let client = build_http_client(&config.connection)?;
    let service = ExportService::new(client, Arc::new(Obfuscator::new()));

    let export_id = uuid::Uuid::new_v4().to_string();
    let staging_path = config.staging_dir.join(format!("{export_id}.jsonl"));
    let archive_output_dir = config.staging_dir.join("archives");

    let result = service
        .run(
            &config,
            &export_id,
            &staging_path,
            &archive_output_dir,
            std::time::Duration::from_secs(120),
            tokio_util::sync::CancellationToken::new(),
            |_p| {},
        )
        .await
        .map_err(|e| e.error)?;

    Ok(Json(ArchiveSummary {
        path: result.archive.path.display().to_string(),
        size_bytes: result.archive.size_bytes,
        sha256: result.archive.sha256,
        metrics_count: result.metrics_count,
    }))
}

#[derive(Serialize)]
struct ExportStartResponse {
    job_id: String,
    state: String,
    total_batches: u64,
    batch_window_seconds: i64,
    staging_path: String,
    obfuscation_enabled: bool,
}

async fn export_start(State(state): State<ApiState>, Json(config): Json<ExportConfig>) -> ApiResult<Json<ExportStartResponse>> {
    let (_, batch_window_seconds) = ExportService::plan(&config);
    let obfuscation_enabled = config.obfuscation.enabled;
    let job = state.export_manager.submit(config)?;
    let staging_path = state.staging_dir.join(format!("{}.jsonl", job.id));

    info!(job_id = %job.id, "export job admitted");
    Ok(Json(ExportStartResponse {
        job_id: job.id,
        state: format!("{:?}", job.state).to_lowercase(),
        total_batches: job.batches_total,
        batch_window_seconds,
        staging_path: staging_path.display().to_string(),
        obfuscation_enabled,
    }))
}

#[derive(Deserialize)]
struct JobIdQuery {
    id: String,
}

async fn export_status(State(state): State<ApiState>, Query(q): Query<JobIdQuery>) -> ApiResult<Json<ExportJob>> {
    state.export_manager.status(&q.id).map(Json).ok_or_else(|| Error::not_found(format!("unknown export job {}", q.id)).into())
}

#[derive(Deserialize)]
struct CancelRequest {
    id: String,
}

async fn export_cancel(State(state): State<ApiState>, Json(req): Json<CancelRequest>) -> ApiResult<Json<serde_json::Value>> {
    state.export_manager.cancel(&req.id)?;
    Ok(Json(serde_json::json!({"success": true})))
}

#[derive(Deserialize)]
struct DownloadQuery {
    path: String,
}

/// `GET /api/download?path=…`: streams the archive bytes. 400 if missing,
/// 404 if unknown, 403 on path traversal.
async fn download(Query(q): Query<DownloadQuery>) -> Response {
    if q.path.trim().is_empty() {
        return ApiError(Error::configuration("path query parameter is required")).into_response();
    }

    let requested = PathBuf::from(&q.path);
    if requested.components().any(|c| matches!(c, std::path::Component::ParentDir)) {
        return (StatusCode::FORBIDDEN, Json(ErrorBody { error: "path must not contain parent-directory segments".to_string() })).into_response();
    }

    match tokio::fs::read(&requested).await {
        Ok(bytes) => {
            let filename = requested.file_name().and_then(|f| f.to_str()).unwrap_or("archive.zip").to_string();
            Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, "application/zip")
                .header(header::CONTENT_DISPOSITION, format!("attachment; filename=\"{filename}\""))
                .body(Body::from(bytes))
                .unwrap_or_else(|_| ApiError(Error::generic("failed to build response")).into_response())
        }
        Err(_) => ApiError(Error::not_found(format!("archive not found: {}", requested.display()))).into_response(),
    }
}

#[derive(Serialize)]
struct UploadResponse {
    job_id: String,
    job: ImportJob,
}

/// `POST /api/upload`: multipart `bundle` file + `config` JSON field. The
/// uploaded bundle is written under the staging directory; `config`'s
/// `bundle_path`/`staging_dir` are overwritten with server-controlled
/// paths so a caller cannot point the importer at an arbitrary filesystem
/// location.
async fn upload(State(state): State<ApiState>, mut multipart: Multipart) -> ApiResult<Json<UploadResponse>> {
    let mut bundle_bytes: Option<Vec<u8>> = None;
    let mut bundle_filename = "bundle.jsonl".to_string();
    let mut config_json: Option<String> = None;

    while let Some(field) = multipart.next_field().await.map_err(|e| Error::protocol(format!("invalid multipart body: {e}")))? {
        match field.name() {
            Some("bundle") => {
                bundle_filename = field.file_name().unwrap_or("bundle.jsonl").to_string();
                let data = field.bytes().await.map_err(|e| Error::protocol(format!("failed to read bundle field: {e}")))?;
                bundle_bytes = Some(data.to_vec());
            }
            Some("config") => {
                config_json = Some(field.text().await.map_err(|e| Error::protocol(format!("failed to read config field: {e}")))?);
            }
            _ => {}
        }
    }

    let bundle_bytes = bundle_bytes.ok_or_else(|| Error::configuration("multipart body missing 'bundle' field"))?;
    let config_json = config_json.ok_or_else(|| Error::configuration("multipart body missing 'config' field"))?;
    let mut import_config: ImportConfig = serde_json::from_str(&config_json).map_err(Error::from)?;

    tokio::fs::create_dir_all(&state.staging_dir).await.map_err(Error::Io)?;
    let upload_id = uuid::Uuid::new_v4().to_string();
    let ext = if bundle_filename.ends_with(".zip") { "zip" } else { "jsonl" };
    let bundle_path = state.staging_dir.join(format!("upload-{upload_id}.{ext}"));
    tokio::fs::write(&bundle_path, &bundle_bytes).await.map_err(Error::Io)?;

    import_config.bundle_path = bundle_path;
    import_config.staging_dir = state.staging_dir.clone();
    if import_config.chunk_size_bytes == 0 {
        import_config.chunk_size_bytes = state.import_chunk_size_bytes;
    }

    let job = state.import_manager.submit(import_config).await?;
    Ok(Json(UploadResponse { job_id: job.id.clone(), job }))
}

async fn import_status(State(state): State<ApiState>, Query(q): Query<JobIdQuery>) -> ApiResult<Json<ImportJob>> {
    state.import_manager.status(&q.id).map(Json).ok_or_else(|| Error::not_found(format!("unknown import job {}", q.id)).into())
}

async fn import_resume(State(state): State<ApiState>, Query(q): Query<JobIdQuery>) -> ApiResult<Json<ImportJob>> {
    Ok(Json(state.import_manager.resume(&q.id)?))
}

#[derive(Serialize)]
struct AnalyzeResponse {
    summary: bridge_import::PreflightReport,
    retention_cutoff: Option<i64>,
    warnings: Vec<String>,
}

/// `POST /api/analyze`: bundle preflight without admitting an import job.
/// Multipart `bundle` file + optional `connection` to look up the target's
/// retention window.
async fn analyze(State(state): State<ApiState>, mut multipart: Multipart) -> ApiResult<Json<AnalyzeResponse>> {
    let mut bundle_bytes: Option<Vec<u8>> = None;
    let mut bundle_filename = "bundle.jsonl".to_string();
    let mut connection: Option<Connection> = None;

    while let Some(field) = multipart.next_field().await.map_err(|e| Error::protocol(format!("invalid multipart body: {e}")))? {
        match field.name() {
            Some("bundle") => {
                bundle_filename = field.file_name().unwrap_or("bundle.jsonl").to_string();
                let data = field.bytes().await.map_err(|e| Error::protocol(format!("failed to read bundle field: {e}")))?;
                bundle_bytes = Some(data.to_vec());
            }
            Some("connection") => {
                let text = field.text().await.map_err(|e| Error::protocol(format!("failed to read connection field: {e}")))?;
                connection = serde_json::from_str(&text).ok();
            }
            _ => {}
        }
    }

    let bundle_bytes = bundle_bytes.ok_or_else(|| Error::configuration("multipart body missing 'bundle' field"))?;

    let retention_secs = match &connection {
        Some(conn) => build_http_client(conn)?.retention_secs().await.unwrap_or(0),
        None => 0,
    };

    tokio::fs::create_dir_all(&state.staging_dir).await.map_err(Error::Io)?;
    let upload_id = uuid::Uuid::new_v4().to_string();
    let ext = if bundle_filename.ends_with(".zip") { "zip" } else { "jsonl" };
    let bundle_path = state.staging_dir.join(format!("analyze-{upload_id}.{ext}"));
    tokio::fs::write(&bundle_path, &bundle_bytes).await.map_err(Error::Io)?;

    let prepared = prepare_bundle(&bundle_path, &state.staging_dir).await?;
    let report = analyze_bundle(&prepared.metrics_path, bridge_import::DEFAULT_SAMPLE_LINES, false, retention_secs).await?;

    let _ = tokio::fs::remove_file(&bundle_path).await;
    if prepared.metrics_path != bundle_path {
        let _ = tokio::fs::remove_file(&prepared.metrics_path).await;
    }

    Ok(Json(AnalyzeResponse {
        retention_cutoff: report.retention_cutoff_ms,
        warnings: report.warnings.clone(),
        summary: report,
    }))
}

#[derive(Deserialize)]
struct CheckEndpointRequest {
    connection: Connection,
}

#[derive(Serialize)]
struct CheckEndpointResponse {
    reachable: bool,
    retention_secs: u64,
}

/// `POST /api/check-endpoint`: lightweight import endpoint probe,
/// implemented as a retention-window lookup since that is the cheapest
/// round trip the `TsdbClient` exposes against the import target.
async fn check_endpoint(Json(req): Json<CheckEndpointRequest>) -> ApiResult<Json<CheckEndpointResponse>> {
    let client = build_http_client(&req.connection)?;
    match client.retention_secs().await {
        Ok(secs) => Ok(Json(CheckEndpointResponse { reachable: true, retention_secs: secs })),
        Err(_) => Ok(Json(CheckEndpointResponse { reachable: false, retention_secs: 0 })),
    }
}
