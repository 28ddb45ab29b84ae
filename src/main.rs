/// Metrics bridge main entry point
use std::io::Read as _;

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;

use bridge_api::cli::Cli;
use bridge_api::ApiServer;
use bridge_client::{build_http_client, ClientFactory};
use bridge_core::config::{BridgeConfig, ExportConfig};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();

    let config = load_bridge_config(&cli.config).await?;
    let client_factory: ClientFactory = Arc::new(build_http_client);

    if cli.oneshot {
        run_oneshot(&cli, &config, client_factory).await
    } else {
        let server = ApiServer::new(config, client_factory);
        server.serve(cli.addr.as_deref()).await.map_err(anyhow::Error::from)
    }
}

async fn load_bridge_config(path: &std::path::Path) -> Result<BridgeConfig> {
    match tokio::fs::read_to_string(path).await {
        Ok(contents) => BridgeConfig::from_toml_str(&contents).map_err(anyhow::Error::from),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::warn!(path = %path.display(), "config file not found, using defaults with env overrides");
            let mut config = BridgeConfig::default();
            config.apply_env_overrides();
            Ok(config)
        }
        Err(e) => Err(e).with_context(|| format!("failed to read config file {}", path.display())),
    }
}

/// `-oneshot`: read an `ExportConfig` document and run a single export,
/// either sealing an archive under the config's staging directory or, with
/// `-export-stdout`, streaming obfuscated JSONL straight to standard
/// output (spec.md §6).
async fn run_oneshot(cli: &Cli, bridge_config: &BridgeConfig, client_factory: ClientFactory) -> Result<()> {
    let document = match cli.oneshot_config.as_deref() {
        Some("-") | None => {
            let mut buf = String::new();
            std::io::stdin().read_to_string(&mut buf).context("failed to read oneshot config from stdin")?;
            buf
        }
        Some(path) => tokio::fs::read_to_string(path).await.with_context(|| format!("failed to read oneshot config file {path}"))?,
    };

    let export_config: ExportConfig = serde_json::from_str(&document).context("oneshot config is not a valid ExportConfig document")?;
    let client = client_factory(&export_config.connection).map_err(anyhow::Error::from)?;
    let obfuscator = Arc::new(bridge_core::obfuscate::Obfuscator::new());
    let service = bridge_export::ExportService::new(client, obfuscator);

    if cli.export_stdout {
        let mut stdout = tokio::io::stdout();
        let count = service
            .run_oneshot_stream(&export_config, &mut stdout, tokio_util::sync::CancellationToken::new())
            .await
            .map_err(anyhow::Error::from)?;
        tracing::info!(metrics = count, "oneshot export streamed to stdout");
        return Ok(());
    }

    let export_id = uuid::Uuid::new_v4().to_string();
    let staging_path = export_config.staging_dir.join(format!("{export_id}.jsonl"));
    let archive_output_dir = bridge_config.archive_output_dir.clone();

    let finalized = service
        .run(
            &export_config,
            &export_id,
            &staging_path,
            &archive_output_dir,
            std::time::Duration::from_secs(bridge_config.per_batch_timeout_secs),
            tokio_util::sync::CancellationToken::new(),
            |progress| {
                tracing::debug!(batch = progress.absolute_batch_index, metrics = progress.metrics_in_batch, "oneshot export progress");
            },
        )
        .await
        .map_err(|e| anyhow::Error::from(e.error))?;

    println!(
        "{}",
        serde_json::json!({
            "path": finalized.archive.path.display().to_string(),
            "size_bytes": finalized.archive.size_bytes,
            "sha256": finalized.archive.sha256,
            "metrics_count": finalized.metrics_count,
        })
    );

    Ok(())
}
