//! Command-line entry point for the metrics bridge binary.
//!
//! The primary surface is the HTTP API server, started by default. A
//! `-oneshot` flag switches to a single export run that exits when the
//! archive (or, with `-export-stdout`, the raw JSONL stream) is produced,
//! matching operators who want a cron-friendly one-off pull instead of a
//! long-running service.

use std::path::PathBuf;

use clap::Parser;

#[derive(Parser)]
#[command(name = "metrics-bridge")]
#[command(about = "Export/import bridge for moving TSDB metrics into portable, optionally anonymized archives")]
#[command(version)]
pub struct Cli {
    /// Application config document (TOML), merged with `BRIDGE_`-prefixed
    /// environment overrides.
    #[arg(short, long, default_value = "config.toml")]
    pub config: PathBuf,

    /// HTTP bind address override, e.g. "0.0.0.0:8080". Defaults to the
    /// config document's `http_bind_addr`.
    #[arg(long)]
    pub addr: Option<String>,

    /// Run a single export and exit instead of starting the HTTP server.
    #[arg(long)]
    pub oneshot: bool,

    /// ExportConfig document for `-oneshot`, as a JSON file path or `-` to
    /// read from standard input.
    #[arg(long = "oneshot-config")]
    pub oneshot_config: Option<String>,

    /// With `-oneshot`, stream obfuscated JSONL straight to standard
    /// output instead of sealing an archive on disk.
    #[arg(long)]
    pub export_stdout: bool,

    /// Reserved for an interactive launch mode; currently a no-op since
    /// this bridge has no bundled web UI to open.
    #[arg(long)]
    pub no_browser: bool,
}
