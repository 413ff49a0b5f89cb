use std::fs::File;
use std::path::Path;

use anyhow::{Context, Result};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Transport mode for MCP server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportMode {
    /// stdio transport (default) - for local MCP clients
    Stdio,
    /// Streamable HTTP transport - for remote/web access
    Stream,
}

/// Where log lines go for a given mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sinks {
    pub stderr: bool,
    pub file: bool,
}

impl TransportMode {
    /// stdio never writes to stderr: any stray output during the MCP
    /// handshake makes clients drop the connection.
    pub fn sinks(self, has_log_file: bool) -> Sinks {
        match self {
            TransportMode::Stdio => Sinks { stderr: false, file: has_log_file },
            TransportMode::Stream => Sinks { stderr: true, file: has_log_file },
        }
    }
}

fn filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into())
}

fn open_log(path: &Path) -> Result<File> {
    std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open log file '{}'", path.display()))
}

/// Initialize logging based on transport mode and optional log file
pub fn init_logging(mode: TransportMode, log_file: Option<&Path>) -> Result<()> {
    let sinks = mode.sinks(log_file.is_some());
    if !sinks.stderr && !sinks.file {
        return Ok(());
    }

    let file_layer = match log_file.filter(|_| sinks.file) {
        Some(path) => Some(fmt::layer().with_writer(open_log(path)?).with_ansi(false)),
        None => None,
    };
    let stderr_layer = sinks.stderr.then(|| fmt::layer().with_writer(std::io::stderr));

    tracing_subscriber::registry()
        .with(filter())
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
        .context("Failed to install tracing subscriber")?;
    Ok(())
}
