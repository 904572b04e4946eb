//! Tracing setup for applications embedding the cache.

use color_eyre::{eyre::eyre, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer, Registry};

use crate::config::LoggingConfig;

/// Environment variable that overrides the configured filter.
pub const LOG_ENV: &str = "TRACKER_CACHE_LOG";

const LOG_FILE_PREFIX: &str = "tracker-cache.log";

/// Keeps the file writer flushing; hold it for the lifetime of the process.
pub struct LoggingGuard {
  _file: Option<WorkerGuard>,
}

/// Install the global subscriber: stderr output plus an optional daily log file.
pub fn init(config: &LoggingConfig) -> Result<LoggingGuard> {
  let filter = build_filter(config)?;

  let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();
  layers.push(Box::new(
    fmt::layer().with_writer(std::io::stderr).with_target(true),
  ));

  let mut file_guard = None;
  if let Some(dir) = &config.file {
    std::fs::create_dir_all(dir)
      .map_err(|e| eyre!("Failed to create log directory {}: {}", dir.display(), e))?;
    let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
    let (writer, guard) = tracing_appender::non_blocking(appender);
    layers.push(Box::new(
      fmt::layer().with_writer(writer).with_ansi(false),
    ));
    file_guard = Some(guard);
  }

  Registry::default()
    .with(layers)
    .with(filter)
    .try_init()
    .map_err(|e| eyre!("Failed to install tracing subscriber: {}", e))?;

  Ok(LoggingGuard { _file: file_guard })
}

/// Filter from TRACKER_CACHE_LOG, or from the configured level when unset.
fn build_filter(config: &LoggingConfig) -> Result<EnvFilter> {
  match std::env::var(LOG_ENV) {
    Ok(directives) => EnvFilter::try_new(&directives)
      .map_err(|e| eyre!("Invalid {} value {:?}: {}", LOG_ENV, directives, e)),
    Err(_) => EnvFilter::try_new(&config.level)
      .map_err(|e| eyre!("Invalid log level {:?}: {}", config.level, e)),
  }
}
