//! Tracing setup.
//!
//! The operator console owns stdout, so log events go to a daily rolling
//! file. `--verbose` mirrors them to stderr at debug level.

use std::fs;

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{Builder, Rotation};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::LoggingConfig;

/// Prefix of the rolling log files.
const LOG_FILE_PREFIX: &str = "vmctl";

/// Returns the filter directive used when `RUST_LOG` is not set.
pub fn default_directive(config: &LoggingConfig, verbose: bool) -> String {
    if verbose {
        "debug".to_string()
    } else {
        config.level.to_lowercase()
    }
}

/// Installs the global subscriber. Keep the returned guard alive for the
/// life of the process; dropping it flushes and stops the file writer.
pub fn init(config: &LoggingConfig, verbose: bool) -> Result<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(config, verbose)));

    fs::create_dir_all(&config.dir)
        .with_context(|| format!("Failed to create log directory: {}", config.dir.display()))?;

    let appender = Builder::new()
        .rotation(Rotation::DAILY)
        .filename_prefix(LOG_FILE_PREFIX)
        .filename_suffix("log")
        .build(&config.dir)
        .with_context(|| format!("Failed to open log file in {}", config.dir.display()))?;
    let (writer, guard) = tracing_appender::non_blocking(appender);

    let file_layer = fmt::layer().with_writer(writer).with_ansi(false);
    let stderr_layer = verbose.then(|| fmt::layer().with_writer(std::io::stderr));

    tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .with(stderr_layer)
        .try_init()
        .context("Failed to install tracing subscriber")?;

    Ok(guard)
}
