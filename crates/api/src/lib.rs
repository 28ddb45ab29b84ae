//! HTTP JSON API surface and oneshot CLI entry points for the metrics
//! bridge.

pub mod cli;
pub mod http;

use std::net::SocketAddr;
use std::sync::Arc;

use bridge_client::ClientFactory;
use bridge_common::{Error, Result};
use bridge_core::config::BridgeConfig;
use bridge_core::obfuscate::Obfuscator;
use bridge_export::{JobManager, JobManagerConfig};
use bridge_import::{ImportJobManager, ImportJobManagerConfig};
use tokio::net::TcpListener;
use tracing::info;

/// Wires the job managers and binds the HTTP router.
pub struct ApiServer {
    config: BridgeConfig,
    export_manager: Arc<JobManager>,
    import_manager: Arc<ImportJobManager>,
}

impl ApiServer {
    pub fn new(config: BridgeConfig, client_factory: ClientFactory) -> Self {
        let obfuscator = Arc::new(Obfuscator::new());

        let export_manager = Arc::new(JobManager::new(
            client_factory.clone(),
            obfuscator,
            JobManagerConfig {
                max_concurrent_exports: config.max_concurrent_exports,
                job_retention: std::time::Duration::from_secs(config.job_retention_secs),
                per_batch_timeout: std::time::Duration::from_secs(config.per_batch_timeout_secs),
                wall_clock_cap_enabled: config.job_wall_clock_cap_enabled,
                archive_output_dir: config.archive_output_dir.clone(),
            },
        ));

        let import_manager = Arc::new(ImportJobManager::new(
            client_factory,
            ImportJobManagerConfig {
                max_concurrent_imports: config.max_concurrent_imports,
                job_retention: std::time::Duration::from_secs(config.job_retention_secs),
            },
        ));

        Self { config, export_manager, import_manager }
    }

    /// Binds and serves the HTTP API, blocking until the server stops.
    pub async fn serve(&self, addr_override: Option<&str>) -> Result<()> {
        let bind_addr = addr_override.unwrap_or(&self.config.http_bind_addr);
        let addr: SocketAddr = bind_addr
            .parse()
            .map_err(|e| Error::configuration(format!("invalid HTTP bind address '{bind_addr}': {e}")))?;

        let app = http::router(http::ApiState {
            export_manager: self.export_manager.clone(),
            import_manager: self.import_manager.clone(),
            staging_dir: self.config.staging_dir.clone(),
            import_chunk_size_bytes: self.config.import_chunk_size_bytes,
        });

        info!("Starting HTTP API server on {}", addr);
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| Error::resource(format!("failed to bind to address {addr}: {e}")))?;

        axum::serve(listener, app).await.map_err(|e| Error::resource(format!("server error: {e}")))?;
        Ok(())
    }
}
