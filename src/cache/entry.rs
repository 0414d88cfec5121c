//! Cache entries and the read-only views handed to consumers.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::key::QueryKey;
use crate::error::{CacheError, RecordResult};

/// Freshness and retention settings for one `fetch`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct FetchOptions {
  /// Age after which the entry is stale and the next fetch reloads it
  #[serde(rename = "stale_after_secs", with = "secs")]
  pub stale_after: Duration,
  /// How long an entry with no subscribers is kept before eviction
  #[serde(rename = "retention_secs", with = "secs")]
  pub retention_window: Duration,
}

impl FetchOptions {
  pub const fn new(stale_after: Duration, retention_window: Duration) -> Self {
    Self {
      stale_after,
      retention_window,
    }
  }
}

mod secs {
  use serde::{Deserialize, Deserializer};
  use std::time::Duration;

  pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
  where
    D: Deserializer<'de>,
  {
    u64::deserialize(deserializer).map(Duration::from_secs)
  }
}

/// Boxed loader future.
pub type LoadFuture = Pin<Box<dyn Future<Output = RecordResult<Value>> + Send>>;

/// Re-runnable loader, kept so subscribed entries can refetch after
/// invalidation.
pub type Loader = Arc<dyn Fn() -> LoadFuture + Send + Sync>;

/// Pending retention timer for an unobserved entry.
pub(crate) struct GcTimer {
  pub token: u64,
  pub handle: JoinHandle<()>,
}

pub(crate) struct Entry {
  pub value: Arc<Value>,
  /// Logical time of the write that produced `value`
  pub stamp: u64,
  /// Logical time of the last invalidation, 0 if never
  pub invalidated_at: u64,
  pub updated_at: Instant,
  pub cached_at: DateTime<Utc>,
  pub options: FetchOptions,
  pub loader: Option<Loader>,
  /// Failure of the most recent load, cleared by the next write
  pub error: Option<CacheError>,
  pub gc: Option<GcTimer>,
}

impl Entry {
  pub fn new(value: Arc<Value>, stamp: u64, options: FetchOptions) -> Self {
    Self {
      value,
      stamp,
      invalidated_at: 0,
      updated_at: Instant::now(),
      cached_at: Utc::now(),
      options,
      loader: None,
      error: None,
      gc: None,
    }
  }

  pub fn is_stale(&self, now: Instant) -> bool {
    self.invalidated_at > self.stamp || now.duration_since(self.updated_at) >= self.options.stale_after
  }

  pub fn cancel_gc(&mut self) {
    if let Some(timer) = self.gc.take() {
      timer.handle.abort();
    }
  }

  pub fn snapshot(&self, key: &QueryKey, now: Instant, fetching: bool) -> EntrySnapshot {
    EntrySnapshot {
      key: key.clone(),
      value: Arc::clone(&self.value),
      cached_at: self.cached_at,
      version: self.stamp,
      is_stale: self.is_stale(now),
      is_fetching: fetching,
      error: self.error.clone(),
    }
  }
}

impl Drop for Entry {
  fn drop(&mut self) {
    self.cancel_gc();
  }
}

/// Read-only view of a cache entry.
#[derive(Debug, Clone)]
pub struct EntrySnapshot {
  pub key: QueryKey,
  pub value: Arc<Value>,
  pub cached_at: DateTime<Utc>,
  /// Monotonic write stamp; larger means newer
  pub version: u64,
  pub is_stale: bool,
  pub is_fetching: bool,
  /// Set when the last load failed and `value` is the previous result
  pub error: Option<CacheError>,
}

impl EntrySnapshot {
  pub fn decode<T: serde::de::DeserializeOwned>(&self) -> Result<T, CacheError> {
    T::deserialize(self.value.as_ref()).map_err(|e| CacheError::Decode {
      key: self.key.to_string(),
      message: e.to_string(),
    })
  }
}
