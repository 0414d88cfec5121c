use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cache::FetchOptions;
use crate::record::RetryPolicy;

const MINUTE: u64 = 60;

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
  pub cache: CacheConfig,
  /// Backoff for reads
  pub retry: RetryPolicy,
  /// Backoff for writes; fields left out fall back to the read defaults
  pub mutation_retry: RetryPolicy,
  pub log: LogConfig,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      cache: CacheConfig::default(),
      retry: RetryPolicy::default(),
      mutation_retry: RetryPolicy::mutations(),
      log: LogConfig::default(),
    }
  }
}

/// Freshness settings per kind of query
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CacheConfig {
  /// Used by `set` for entries no fetch has configured
  pub default: FetchOptions,
  pub lists: FetchOptions,
  pub details: FetchOptions,
  /// Song lists change more often than other lists
  pub song_lists: FetchOptions,
  pub recent: FetchOptions,
  pub search: FetchOptions,
}

impl Default for CacheConfig {
  fn default() -> Self {
    let retention = Duration::from_secs(10 * MINUTE);
    let stale = |minutes: u64| FetchOptions::new(Duration::from_secs(minutes * MINUTE), retention);
    Self {
      default: stale(5),
      lists: stale(5),
      details: stale(10),
      song_lists: stale(3),
      recent: stale(2),
      search: stale(1),
    }
  }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LogConfig {
  /// Filter directive, e.g. "info" or "setlist=debug"
  pub level: String,
  /// Directory for daily log files; stderr when unset
  pub directory: Option<PathBuf>,
}

impl Default for LogConfig {
  fn default() -> Self {
    Self {
      level: "info".to_string(),
      directory: None,
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./setlist.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/setlist/config.yaml
  ///
  /// Falls back to defaults when no file is found. `SETLIST_LOG` overrides
  /// the log filter.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    let mut config = match path {
      Some(p) => Self::load_from_path(&p)?,
      None => Config::default(),
    };

    if let Ok(level) = std::env::var("SETLIST_LOG") {
      if !level.trim().is_empty() {
        config.log.level = level;
      }
    }

    Ok(config)
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("setlist.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("setlist").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents).map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  fn parse(contents: &str) -> std::result::Result<Self, serde_yaml::Error> {
    // An empty file is a valid, all-default config
    if contents.trim().is_empty() {
      return Ok(Config::default());
    }
    serde_yaml::from_str(contents)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::io::Write;

  #[test]
  fn test_defaults_match_documented_windows() {
    let cache = CacheConfig::default();
    assert_eq!(cache.lists.stale_after, Duration::from_secs(300));
    assert_eq!(cache.details.stale_after, Duration::from_secs(600));
    assert_eq!(cache.song_lists.stale_after, Duration::from_secs(180));
    assert_eq!(cache.recent.stale_after, Duration::from_secs(120));
    assert_eq!(cache.search.stale_after, Duration::from_secs(60));
    assert_eq!(cache.default.retention_window, Duration::from_secs(600));
    assert_eq!(Config::default().retry.attempts, 3);
  }

  #[test]
  fn test_writes_retry_once_by_default() {
    let config = Config::default();
    assert_eq!(config.mutation_retry, RetryPolicy::mutations());
    assert_eq!(config.mutation_retry.attempts, 1);
    assert_eq!(config.mutation_retry.delay_for(0), Duration::from_secs(1));
    assert_eq!(config.mutation_retry.delay_for(3), Duration::from_secs(1));

    let config = Config::parse("mutation_retry:
  attempts: 0
").unwrap();
    assert_eq!(config.mutation_retry.attempts, 0);
    assert_eq!(config.retry, RetryPolicy::default());
  }

  #[test]
  fn test_partial_file_keeps_other_defaults() {
    let yaml = r#"
cache:
  details:
    stale_after_secs: 30
    retention_secs: 90
retry:
  attempts: 1
  base_delay: 250
log:
  level: debug
"#;
    let config = Config::parse(yaml).unwrap();
    assert_eq!(
      config.cache.details,
      FetchOptions::new(Duration::from_secs(30), Duration::from_secs(90))
    );
    assert_eq!(config.cache.lists, CacheConfig::default().lists);
    assert_eq!(config.retry.attempts, 1);
    assert_eq!(config.retry.base_delay, Duration::from_millis(250));
    assert_eq!(config.retry.max_delay, Duration::from_secs(30));
    assert_eq!(config.log.level, "debug");
  }

  #[test]
  fn test_load_explicit_path() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "log:\n  directory: /tmp/setlist-logs").unwrap();

    let config = Config::load(Some(file.path())).unwrap();
    assert_eq!(config.log.directory, Some(PathBuf::from("/tmp/setlist-logs")));
  }

  #[test]
  fn test_missing_explicit_path_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = Config::load(Some(&dir.path().join("nope.yaml"))).unwrap_err();
    assert!(err.to_string().contains("Config file not found"));
  }

  #[test]
  fn test_empty_file_is_default() {
    assert_eq!(Config::parse("\n").unwrap(), Config::default());
  }

  #[test]
  fn test_invalid_yaml_is_reported() {
    assert!(Config::parse("cache: [1, 2").is_err());
  }
}
