//! Bundle extraction (spec.md §4.6 "Preflight analysis"): a bundle is
//! either a sealed archive (`.zip`, produced by `bridge-archive`) or a raw
//! `metrics.jsonl` file, used directly.

use std::path::{Path, PathBuf};

use bridge_archive::read_archive;
use bridge_common::{Error, Result};
use bridge_core::archive_model::ArchiveMetadata;

/// Where the importer should read metrics from, plus the archive metadata
/// if the bundle was a sealed archive.
pub struct PreparedBundle {
    pub metrics_path: PathBuf,
    pub metadata: Option<ArchiveMetadata>,
}

/// Extracts `bundle_path` into something the preflight/streaming stages can
/// read line by line. A `.zip` bundle is unpacked into `staging_dir` (the
/// member's exact bytes, unmodified); anything else is assumed to already
/// be a raw JSONL file and is used in place.
pub async fn prepare_bundle(bundle_path: &Path, staging_dir: &Path) -> Result<PreparedBundle> {
    let is_archive = bundle_path.extension().and_then(|e| e.to_str()) == Some("zip");
    if !is_archive {
        if !tokio::fs::try_exists(bundle_path).await.unwrap_or(false) {
            return Err(Error::not_found(format!("bundle file not found: {}", bundle_path.display())));
        }
        return Ok(PreparedBundle { metrics_path: bundle_path.to_path_buf(), metadata: None });
    }

    let bytes = tokio::fs::read(bundle_path)
        .await
        .map_err(|e| Error::resource(format!("failed to read bundle {}: {e}", bundle_path.display())))?;
    let (metrics, metadata_bytes, _readme) = read_archive(&bytes)?;
    let metadata: ArchiveMetadata = serde_json::from_slice(&metadata_bytes)?;

    tokio::fs::create_dir_all(staging_dir).await.map_err(Error::Io)?;
    let metrics_path = staging_dir.join(format!("{}.metrics.jsonl", uuid::Uuid::new_v4()));
    tokio::fs::write(&metrics_path, &metrics).await.map_err(Error::Io)?;

    Ok(PreparedBundle { metrics_path, metadata: Some(metadata) })
}
