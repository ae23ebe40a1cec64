//! Tracing subscriber setup.

use color_eyre::{eyre::eyre, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::config::LoggingConfig;

/// Install the global subscriber.
///
/// `RUST_LOG` wins over `logging.level`. When `logging.directory` is set,
/// a daily-rotated file gets the same events without ANSI colours. Keep the
/// returned guard alive for as long as file logs should be flushed.
pub fn init(config: &LoggingConfig) -> Result<Option<WorkerGuard>> {
  let filter = || {
    EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(&config.level))
  };

  let console = fmt::layer()
    .with_writer(std::io::stderr)
    .with_filter(filter().map_err(|e| eyre!("Invalid log level '{}': {}", config.level, e))?);

  let (file, guard) = match &config.directory {
    Some(directory) => {
      let (writer, guard) = tracing_appender::non_blocking(rolling::daily(directory, "agrisync.log"));
      let layer = fmt::layer()
        .with_writer(writer)
        .with_ansi(false)
        .with_filter(filter().map_err(|e| eyre!("Invalid log level '{}': {}", config.level, e))?);
      (Some(layer), Some(guard))
    }
    None => (None, None),
  };

  tracing_subscriber::registry()
    .with(console)
    .with(file)
    .try_init()
    .map_err(|e| eyre!("Failed to install tracing subscriber: {}", e))?;

  Ok(guard)
}
