//! Poll-driven query observer bound to one cache key.
//!
//! A `Query<T>` holds a subscription on its key, so the entry is never
//! evicted while the query is alive and invalidations trigger a background
//! reload. Event-loop consumers call [`Query::poll`] on each tick.
//!
//! # Example
//!
//! ```ignore
//! let music = client.clone();
//! let mut query = Query::new(&store, keys::songs::detail("S1"), options, move || {
//!     let music = music.clone();
//!     async move { music.get_song("S1").await }
//! });
//!
//! // Start fetching
//! query.fetch();
//!
//! // In event loop tick
//! if query.poll() {
//!     // State changed, trigger re-render
//! }
//!
//! // In render
//! match query.state() {
//!     QueryState::Loading => render_spinner(),
//!     QueryState::Success(song) => render_song(song),
//!     QueryState::Error { error, stale } => render_error(error, stale.as_ref()),
//!     QueryState::Idle => {}
//! }
//! ```

use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

use crate::cache::{decode, typed_loader, CacheStore, FetchOptions, Loader, QueryKey, Subscription};
use crate::error::{CacheError, RecordError, RecordResult};

/// The state of a query
#[derive(Debug, Clone)]
pub enum QueryState<T> {
  /// Query has not been started
  Idle,
  /// Query is currently fetching data
  Loading,
  /// Query completed successfully
  Success(T),
  /// Query failed; `stale` holds the last value the cache still has
  Error { error: CacheError, stale: Option<T> },
}

impl<T> QueryState<T> {
  pub fn is_loading(&self) -> bool {
    matches!(self, QueryState::Loading)
  }

  pub fn is_success(&self) -> bool {
    matches!(self, QueryState::Success(_))
  }

  pub fn is_error(&self) -> bool {
    matches!(self, QueryState::Error { .. })
  }

  /// Fresh data, or the stale fallback after an error.
  pub fn data(&self) -> Option<&T> {
    match self {
      QueryState::Success(data) => Some(data),
      QueryState::Error { stale, .. } => stale.as_ref(),
      _ => None,
    }
  }

  pub fn error(&self) -> Option<&CacheError> {
    match self {
      QueryState::Error { error, .. } => Some(error),
      _ => None,
    }
  }
}

type FetchResult = Result<Arc<Value>, CacheError>;

/// Observer over one cache key.
pub struct Query<T> {
  store: CacheStore,
  subscription: Subscription,
  options: FetchOptions,
  loader: Loader,
  state: QueryState<T>,
  receiver: Option<mpsc::UnboundedReceiver<FetchResult>>,
}

impl<T: Serialize + DeserializeOwned + Send + 'static> Query<T> {
  /// Create a query for `key`. Nothing is loaded until `fetch`.
  pub fn new<F, Fut>(store: &CacheStore, key: QueryKey, options: FetchOptions, fetcher: F) -> Self
  where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = RecordResult<T>> + Send + 'static,
  {
    let mut subscription = store.subscribe(&key);
    subscription.seen();
    Self {
      store: store.clone(),
      subscription,
      options,
      loader: typed_loader(fetcher),
      state: QueryState::Idle,
      receiver: None,
    }
  }
}

impl<T: DeserializeOwned> Query<T> {
  pub fn key(&self) -> &QueryKey {
    self.subscription.key()
  }

  /// Get the current state of the query.
  pub fn state(&self) -> &QueryState<T> {
    &self.state
  }

  pub fn data(&self) -> Option<&T> {
    self.state.data()
  }

  pub fn is_loading(&self) -> bool {
    self.state.is_loading()
  }

  pub fn is_success(&self) -> bool {
    self.state.is_success()
  }

  pub fn is_error(&self) -> bool {
    self.state.is_error()
  }

  pub fn error(&self) -> Option<&CacheError> {
    self.state.error()
  }

  /// Whether the cached value behind a successful query is stale.
  pub fn is_stale(&self) -> bool {
    match &self.state {
      QueryState::Success(_) => self
        .store
        .get(self.key())
        .map(|s| s.is_stale)
        .unwrap_or(true),
      _ => false,
    }
  }

  /// Start fetching if not already loading. A fresh cached value resolves
  /// without calling the loader.
  pub fn fetch(&mut self) {
    if self.state.is_loading() {
      return;
    }
    self.start_fetch();
  }

  /// Mark the key stale and load it again, dropping any pending result.
  pub fn refetch(&mut self) {
    self.receiver = None;
    self.store.invalidate(self.subscription.key());
    self.start_fetch();
  }

  /// Poll for results from a pending fetch, or for a newer value written to
  /// the cache by someone else.
  ///
  /// Returns `true` if the state changed. Call this in your event loop tick
  /// handler.
  pub fn poll(&mut self) -> bool {
    if let Some(receiver) = &mut self.receiver {
      let result = match receiver.try_recv() {
        Ok(result) => result,
        Err(mpsc::error::TryRecvError::Empty) => return false,
        Err(mpsc::error::TryRecvError::Disconnected) => Err(CacheError::Record(
          RecordError::Unknown("Query was cancelled".to_string()),
        )),
      };
      self.receiver = None;
      // The fetch result supersedes notifications that led up to it
      self.subscription.seen();
      self.state = match result.and_then(|value| decode(self.subscription.key(), &value)) {
        Ok(data) => QueryState::Success(data),
        Err(error) => {
          let stale = self
            .subscription
            .current()
            .and_then(|snapshot| snapshot.decode().ok());
          QueryState::Error { error, stale }
        }
      };
      return true;
    }

    if !self.subscription.has_changed() {
      return false;
    }
    let snapshot = self.subscription.seen();
    if matches!(self.state, QueryState::Idle) {
      return false;
    }
    match snapshot {
      Some(snapshot) if !snapshot.is_fetching => match snapshot.decode() {
        Ok(data) => {
          debug!(key = %snapshot.key, version = snapshot.version, "Query picked up cache write");
          self.state = match snapshot.error {
            Some(error) if snapshot.is_stale => QueryState::Error {
              error,
              stale: Some(data),
            },
            _ => QueryState::Success(data),
          };
          true
        }
        Err(error) => {
          self.state = QueryState::Error { error, stale: None };
          true
        }
      },
      Some(_) => false,
      // Entry was removed; the data shown is gone
      None => {
        self.state = QueryState::Idle;
        true
      }
    }
  }

  fn start_fetch(&mut self) {
    let (tx, rx) = mpsc::unbounded_channel();
    self.receiver = Some(rx);
    self.state = QueryState::Loading;

    let store = self.store.clone();
    let key = self.subscription.key().clone();
    let options = self.options;
    let loader = Arc::clone(&self.loader);
    tokio::spawn(async move {
      let result = store.fetch_with(&key, options, loader).await.map(|(v, _)| v);
      // Ignore send errors - receiver may have been dropped
      let _ = tx.send(result);
    });
  }
}

impl<T: std::fmt::Debug> std::fmt::Debug for Query<T> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Query")
      .field("key", self.subscription.key())
      .field("state", &self.state)
      .field("options", &self.options)
      .finish_non_exhaustive()
  }
}
