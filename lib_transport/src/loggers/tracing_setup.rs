//! # Tracing Setup
//!
//! Two layers share one `EnvFilter`: human readable console output with
//! targets and colours, and structured JSON written to a daily rolling file
//! through a non-blocking appender.

use std::io;
use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::{non_blocking, rolling};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// # Setup Logging
///
/// Installs the global subscriber. `RUST_LOG` wins over `default_level`.
///
/// The returned [`WorkerGuard`] flushes the file appender when dropped, so the
/// caller must hold it for the lifetime of the process.
///
/// # Errors
/// Fails when the log directory can not be created or a global subscriber is
/// already installed.
pub fn setup_logging(log_dir: &Path, file_prefix: &str, default_level: &str) -> io::Result<WorkerGuard> {
    std::fs::create_dir_all(log_dir)?;

    let file_appender = rolling::daily(log_dir, format!("{file_prefix}.log"));
    let (non_blocking_appender, guard) = non_blocking(file_appender);

    let console_layer = fmt::layer().with_target(true).with_ansi(true);

    let file_layer = fmt::layer()
        .with_ansi(false)
        .with_writer(non_blocking_appender)
        .json();

    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| io::Error::new(io::ErrorKind::AlreadyExists, e))?;

    Ok(guard)
}
