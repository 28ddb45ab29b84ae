//! Sealed archive writer.
//!
//! Produces a single zip container holding exactly three members —
//! `metrics.jsonl`, `metadata.json`, `README.txt` — and returns the
//! finished archive's path alongside a SHA-256 content hash.

use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};

use bridge_common::{Error, Result};
use bridge_core::archive_model::ArchiveMetadata;
use sha2::{Digest, Sha256};
use tracing::info;
use zip::write::FileOptions;

/// Filenames inside the sealed archive.
pub const METRICS_ENTRY: &str = "metrics.jsonl";
pub const METADATA_ENTRY: &str = "metadata.json";
pub const README_ENTRY: &str = "README.txt";

/// Everything the writer needs to seal one archive.
pub struct ArchiveInput<'a> {
    pub export_id: &'a str,
    pub metrics_jsonl: &'a [u8],
    pub metadata: &'a ArchiveMetadata,
    pub output_dir: &'a Path,
    pub filename_prefix: &'a str,
}

/// Result of sealing an archive: its path, byte size and content hash.
#[derive(Debug, Clone)]
pub struct SealedArchive {
    pub path: PathBuf,
    pub size_bytes: u64,
    pub sha256: String,
}

/// Seal `input` into a zip archive under `input.output_dir`, creating the
/// directory if missing. The filename is
/// `<prefix>_<exportID>_<UTC-seconds-timestamp>.zip`; the seconds-granular
/// timestamp avoids collisions across retries of the same export id.
pub async fn write_archive(input: ArchiveInput<'_>) -> Result<SealedArchive> {
    tokio::fs::create_dir_all(input.output_dir).await.map_err(|e| {
        Error::resource(format!(
            "failed to create archive output directory {}: {e}",
            input.output_dir.display()
        ))
    })?;

    let metadata_json = serde_json::to_vec_pretty(input.metadata)?;
    let readme = render_readme(input.metadata);

    let filename = format!(
        "{}_{}_{}.zip",
        input.filename_prefix,
        input.export_id,
        chrono::Utc::now().format("%Y%m%dT%H%M%SZ")
    );
    let path = input.output_dir.join(&filename);

    let export_id = input.export_id.to_string();
    let metrics = input.metrics_jsonl.to_vec();
    let zip_bytes = tokio::task::spawn_blocking(move || -> Result<Vec<u8>> {
        build_zip(&metrics, &metadata_json, readme.as_bytes())
            .map_err(|e| Error::resource(format!("failed to build archive for {export_id}: {e}")))
    })
    .await
    .map_err(|e| Error::generic(format!("archive writer task panicked: {e}")))??;

    tokio::fs::write(&path, &zip_bytes)
        .await
        .map_err(|e| Error::resource(format!("failed to write archive {}: {e}", path.display())))?;

    let sha256 = hex::encode(Sha256::digest(&zip_bytes));
    info!(export_id = input.export_id, path = %path.display(), size = zip_bytes.len(), "sealed export archive");

    Ok(SealedArchive { path, size_bytes: zip_bytes.len() as u64, sha256 })
}

fn build_zip(metrics: &[u8], metadata_json: &[u8], readme: &[u8]) -> std::result::Result<Vec<u8>, zip::result::ZipError> {
    let cursor = Cursor::new(Vec::new());
    let mut zip = zip::ZipWriter::new(cursor);
    let opts = FileOptions::default().compression_method(zip::CompressionMethod::Deflated);

    zip.start_file(METRICS_ENTRY, opts)?;
    zip.write_all(metrics)?;

    zip.start_file(METADATA_ENTRY, opts)?;
    zip.write_all(metadata_json)?;

    zip.start_file(README_ENTRY, opts)?;
    zip.write_all(readme)?;

    Ok(zip.finish()?.into_inner())
}

/// Human-readable summary embedded as `README.txt`: export id, UTC date,
/// component list, total metrics count, and a prominent notice when
/// obfuscation was applied.
fn render_readme(metadata: &ArchiveMetadata) -> String {
    let mut out = String::new();
    out.push_str("METRICS DIAGNOSTIC ARCHIVE\n");
    out.push_str("==========================\n\n");
    out.push_str(&format!("Export ID:        {}\n", metadata.export_id));
    out.push_str(&format!("Export date (UTC): {}\n", metadata.export_date.format("%Y-%m-%d %H:%M:%S")));
    out.push_str(&format!(
        "Time range:        {} to {}\n",
        metadata.time_range_start.format("%Y-%m-%d %H:%M:%S"),
        metadata.time_range_end.format("%Y-%m-%d %H:%M:%S")
    ));
    out.push_str(&format!(
        "Components:        {}\n",
        if metadata.selected_components.is_empty() { "(all)".to_string() } else { metadata.selected_components.join(", ") }
    ));
    out.push_str(&format!(
        "Jobs:              {}\n",
        if metadata.selected_jobs.is_empty() { "(all)".to_string() } else { metadata.selected_jobs.join(", ") }
    ));
    out.push_str(&format!("Metrics count:     {}\n", metadata.metrics_count));
    out.push_str(&format!("Writer version:    {}\n", metadata.writer_version));
    out.push_str(&format!("Tool version:      {}\n", metadata.tool_version));
    out.push('\n');
    if metadata.obfuscation_applied {
        out.push_str("*** OBFUSCATION APPLIED ***\n");
        out.push_str("Instance addresses and job names in this archive have been anonymized.\n");
    }
    out.push_str("No obfuscation mapping file is included in this archive.\n");
    out
}

/// Reads back a sealed archive, returning the three members' bytes. Used
/// by the importer's bundle extraction and by tests that verify the
/// three-entry invariant.
pub fn read_archive(bytes: &[u8]) -> Result<(Vec<u8>, Vec<u8>, Vec<u8>)> {
    let cursor = Cursor::new(bytes.to_vec());
    let mut zip = zip::ZipArchive::new(cursor)
        .map_err(|e| Error::protocol(format!("not a valid archive: {e}")))?;

    if zip.len() != 3 {
        return Err(Error::protocol(format!("expected exactly 3 archive entries, found {}", zip.len())));
    }

    let mut read_entry = |name: &str| -> Result<Vec<u8>> {
        let mut file = zip
            .by_name(name)
            .map_err(|e| Error::protocol(format!("archive missing entry '{name}': {e}")))?;
        let mut buf = Vec::new();
        std::io::Read::read_to_end(&mut file, &mut buf)
            .map_err(|e| Error::protocol(format!("failed to read archive entry '{name}': {e}")))?;
        Ok(buf)
    };

    let metrics = read_entry(METRICS_ENTRY)?;
    let metadata = read_entry(METADATA_ENTRY)?;
    let readme = read_entry(README_ENTRY)?;
    Ok((metrics, metadata, readme))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn sample_metadata(obfuscated: bool) -> ArchiveMetadata {
        ArchiveMetadata {
            export_id: "exp-1".into(),
            export_date: chrono::Utc::now(),
            time_range_start: chrono::Utc::now() - chrono::Duration::hours(1),
            time_range_end: chrono::Utc::now(),
            selected_components: vec!["vmstorage".into()],
            selected_jobs: vec!["vmstorage-prod".into()],
            metrics_count: 2,
            obfuscation_applied: obfuscated,
            writer_version: "1.0.0".into(),
            tool_version: "metrics-bridge/0.1.0".into(),
        }
    }

    #[tokio::test]
    async fn seals_exactly_three_members_with_no_obfuscation_maps() {
        let dir = tempfile::tempdir().unwrap();
        let metadata = sample_metadata(true);
        let result = write_archive(ArchiveInput {
            export_id: "exp-1",
            metrics_jsonl: b"{\"labels\":{}}\n",
            metadata: &metadata,
            output_dir: dir.path(),
            filename_prefix: "export",
        })
        .await
        .unwrap();

        assert!(!result.sha256.is_empty());
        assert!(result.path.exists());

        let bytes = tokio::fs::read(&result.path).await.unwrap();
        let (metrics, metadata_bytes, readme) = read_archive(&bytes).unwrap();
        assert_eq!(metrics, b"{\"labels\":{}}\n");

        let metadata_value: serde_json::Value = serde_json::from_slice(&metadata_bytes).unwrap();
        let metadata_map: BTreeMap<String, serde_json::Value> =
            serde_json::from_value(metadata_value).unwrap();
        assert!(!metadata_map.contains_key("instance_map"));
        assert!(!metadata_map.contains_key("job_map"));

        let readme_text = String::from_utf8(readme).unwrap();
        assert!(readme_text.contains("OBFUSCATION APPLIED"));
    }

    #[tokio::test]
    async fn filename_follows_prefix_exportid_timestamp_pattern() {
        let dir = tempfile::tempdir().unwrap();
        let metadata = sample_metadata(false);
        let result = write_archive(ArchiveInput {
            export_id: "exp-42",
            metrics_jsonl: b"",
            metadata: &metadata,
            output_dir: dir.path(),
            filename_prefix: "export",
        })
        .await
        .unwrap();

        let name = result.path.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("export_exp-42_"));
        assert!(name.ends_with(".zip"));
    }

    #[tokio::test]
    async fn invalid_output_dir_fails_with_no_partial_artifact() {
        // A path that collides with an existing file (not a directory)
        // cannot be created as a directory.
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        tokio::fs::write(&blocker, b"x").await.unwrap();
        let metadata = sample_metadata(false);

        let result = write_archive(ArchiveInput {
            export_id: "exp-1",
            metrics_jsonl: b"",
            metadata: &metadata,
            output_dir: &blocker.join("sub"),
            filename_prefix: "export",
        })
        .await;
        assert!(result.is_err());
    }
}
