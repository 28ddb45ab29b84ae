//! Base URL construction and tenant inference.

use bridge_common::{Error, Result};
use url::Url;

/// Resolved connection target for a single TSDB client.
#[derive(Debug, Clone)]
pub struct ResolvedBase {
    pub url: Url,
    pub tenant_id: Option<String>,
}

/// Join `base_url` and an optional `api_base_path`, inferring a tenant id
/// from the path when `tenant_id` is not explicitly configured. Any
/// failure to parse the URL is a `Configuration` error raised before any
/// network I/O.
pub fn resolve_base(base_url: &str, api_base_path: Option<&str>, tenant_id: Option<&str>) -> Result<ResolvedBase> {
    let mut url = Url::parse(base_url)
        .map_err(|e| Error::configuration(format!("invalid base_url '{base_url}': {e}")))?;

    if let Some(path) = api_base_path {
        let joined = join_path(url.path(), path);
        url.set_path(&joined);
    }

    let inferred = tenant_id.map(|s| s.to_string()).or_else(|| infer_tenant_from_path(url.path()));

    Ok(ResolvedBase { url, tenant_id: inferred })
}

/// Normalize the `read-write` path alias (e.g. `/rw/prometheus`) to its
/// read counterpart (`/prometheus`) for the `exportStream` operation only;
/// query operations must preserve the original path.
pub fn normalize_export_path(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("/rw/") {
        format!("/{rest}")
    } else if path == "/rw" {
        "/".to_string()
    } else {
        path.to_string()
    }
}

fn join_path(base: &str, extra: &str) -> String {
    let base = base.trim_end_matches('/');
    let extra = extra.trim_start_matches('/');
    if extra.is_empty() {
        base.to_string()
    } else {
        format!("{base}/{extra}")
    }
}

/// Pattern-match a tenant id out of a path: a numeric segment immediately
/// after `/select/`, or a purely numeric first segment.
fn infer_tenant_from_path(path: &str) -> Option<String> {
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    for window in segments.windows(2) {
        if window[0] == "select" && window[1].chars().all(|c| c.is_ascii_digit()) && !window[1].is_empty() {
            return Some(window[1].to_string());
        }
    }
    if let Some(first) = segments.first() {
        if !first.is_empty() && first.chars().all(|c| c.is_ascii_digit()) {
            return Some(first.to_string());
        }
    }
    None
}
