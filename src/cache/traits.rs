//! Core traits and types for the caching system.

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};

use super::key::QueryKey;
use crate::error::CacheError;

/// Trait for records that can be cached.
///
/// Implementors provide the id used to locate the record inside cached list
/// pages, and the key a confirmed write of the record is stored under.
pub trait Cacheable: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {
  /// Unique identifier for this record (the backend's `id` column)
  fn cache_id(&self) -> &str;

  fn detail_key(&self) -> QueryKey;
}

/// Result from a cache read, including data and metadata about the source.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
  /// When the data was written to the cache
  pub cached_at: Option<DateTime<Utc>>,
  /// Load failure hidden behind a fallback value
  pub error: Option<CacheError>,
}

impl<T> CacheResult<T> {
  /// Create a new cache result from a completed load.
  pub fn from_network(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      cached_at: Some(cached_at),
      error: None,
    }
  }

  /// Create a new cache result from fresh cached data.
  pub fn from_cache(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::CacheFresh,
      cached_at: Some(cached_at),
      error: None,
    }
  }

  /// Create a new cache result that serves stale data after a failed load.
  pub fn fallback(data: T, cached_at: DateTime<Utc>, error: CacheError) -> Self {
    Self {
      data,
      source: CacheSource::Fallback,
      cached_at: Some(cached_at),
      error: Some(error),
    }
  }

  pub fn is_fallback(&self) -> bool {
    self.source == CacheSource::Fallback
  }
}

/// Indicates where cached data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Loaded by this call or by a load it attached to
  Network,
  /// Data from cache, still considered fresh
  CacheFresh,
  /// Load failed, serving the previous value
  Fallback,
}
