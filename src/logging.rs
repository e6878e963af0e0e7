//! Logging and tracing initialization.
//!
//! Structured logging via the `tracing` ecosystem. Output goes to the
//! configured log file through a non-blocking appender; the configured
//! level is the default and `RUST_LOG` can override it at runtime.

use std::path::Path;

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize the tracing subscriber.
///
/// `log_path` of `/dev/null` (the config default) means no file output;
/// logs go to stderr instead. Returns the appender guard which must be
/// kept alive for the lifetime of the process, or buffered lines are
/// dropped on exit.
pub fn init(log_path: &Path, log_level: &str) -> Result<Option<WorkerGuard>> {
    let level = parse_level(log_level);
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("epgd={level}")));

    if log_path == Path::new("/dev/null") {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
            .init();
        return Ok(None);
    }

    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)
        .with_context(|| format!("Failed to open log file {}", log_path.display()))?;
    let (writer, guard) = tracing_appender::non_blocking(file);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_writer(writer).with_ansi(false).with_target(false))
        .init();

    Ok(Some(guard))
}

fn parse_level(level: &str) -> &'static str {
    match level.to_ascii_uppercase().as_str() {
        "CRIT" | "ERROR" | "ERR" => "error",
        "WARNING" | "WARN" => "warn",
        "DEBUG" => "debug",
        "TRACE" => "trace",
        _ => "info",
    }
}
