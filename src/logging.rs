//! Tracing setup for the binary.

use color_eyre::{eyre::eyre, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use crate::config::LogConfig;

/// Pick the filter: each `-v` raises the crate's level, otherwise the
/// configured directive applies.
pub fn filter(config: &LogConfig, verbose: u8) -> EnvFilter {
  match verbose {
    0 => EnvFilter::try_new(&config.level).unwrap_or_else(|_| EnvFilter::new("info")),
    1 => EnvFilter::new("setlist=debug"),
    _ => EnvFilter::new("setlist=trace"),
  }
}

/// Install the global subscriber. Logs go to stderr, or to a daily file in
/// `config.directory` when set; keep the returned guard alive until exit so
/// buffered lines are flushed.
pub fn init(config: &LogConfig, verbose: u8) -> Result<Option<WorkerGuard>> {
  let filter = filter(config, verbose);

  match &config.directory {
    Some(dir) => {
      std::fs::create_dir_all(dir)
        .map_err(|e| eyre!("Failed to create log directory {}: {}", dir.display(), e))?;
      let appender = tracing_appender::rolling::daily(dir, "setlist.log");
      let (writer, guard) = tracing_appender::non_blocking(appender);
      tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .try_init()
        .map_err(|e| eyre!("Failed to install logger: {}", e))?;
      Ok(Some(guard))
    }
    None => {
      tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init()
        .map_err(|e| eyre!("Failed to install logger: {}", e))?;
      Ok(None)
    }
  }
}
