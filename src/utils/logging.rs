//! Logging initialization for termpal.
//!
//! Supports two formats:
//! - `pretty`: compact human-readable lines (`LEVEL target: message {fields}`)
//! - `json`: structured JSON lines for log aggregators
//!
//! Output goes to stderr (or a file) so it never interleaves with the
//! assistant's streamed answer on stdout.

use crate::config::{LogFormat, LoggingConfig};
use crate::error::{Result, TermpalError};

/// Initialize the global tracing subscriber from config.
///
/// Call this once at startup before any tracing events are emitted.
/// `RUST_LOG` wins when set; otherwise `cfg.level` is used.
pub fn init_logging(cfg: &LoggingConfig) -> Result<()> {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cfg.level));

    let file = match &cfg.file {
        Some(path) => Some(
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| TermpalError::Config(format!("cannot open log file {}: {}", path, e)))?,
        ),
        None => None,
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(false);

    let installed = match (cfg.format, file) {
        (LogFormat::Json, Some(file)) => builder
            .json()
            .with_writer(std::sync::Mutex::new(file))
            .try_init(),
        (LogFormat::Json, None) => builder.json().with_writer(std::io::stderr).try_init(),
        (LogFormat::Pretty, Some(file)) => builder
            .compact()
            .with_target(true)
            .with_writer(std::sync::Mutex::new(file))
            .try_init(),
        (LogFormat::Pretty, None) => builder
            .compact()
            .with_target(true)
            .with_writer(std::io::stderr)
            .try_init(),
    };

    installed.map_err(|e| TermpalError::Config(format!("logging already initialized: {}", e)))
}
