//! Cache store that orchestrates cached reads with loader calls.

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::entry::{Entry, EntrySnapshot, FetchOptions, GcTimer, LoadFuture, Loader};
use super::key::QueryKey;
use super::traits::CacheResult;
use crate::error::{CacheError, RecordError, RecordResult};

type SharedLoad = Shared<BoxFuture<'static, Result<Arc<Value>, CacheError>>>;

struct InFlight {
  /// Logical time the load was issued; its result is stamped with it
  issued: u64,
  future: SharedLoad,
}

struct Observers {
  count: usize,
  tx: watch::Sender<Option<EntrySnapshot>>,
}

/// Counters for cache activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
  pub hits: u64,
  pub misses: u64,
  /// Fetches that attached to a load already in flight
  pub coalesced: u64,
  pub loads_failed: u64,
  /// Load results dropped because a newer write had landed
  pub discarded_writes: u64,
  pub evictions: u64,
  pub invalidations: u64,
}

#[derive(Default)]
struct State {
  entries: HashMap<QueryKey, Entry>,
  in_flight: HashMap<QueryKey, InFlight>,
  observers: HashMap<QueryKey, Observers>,
  /// Loads issued before these stamps were detached by `remove`
  removed: HashMap<QueryKey, u64>,
  /// Invalidations that hit a key with a load in flight but no entry
  pending_invalidation: HashMap<QueryKey, u64>,
  /// Loads issued before this stamp were detached by `clear`
  floor: u64,
  clock: u64,
  gc_tokens: u64,
  stats: CacheStats,
}

impl State {
  fn tick(&mut self) -> u64 {
    self.clock += 1;
    self.clock
  }

  fn observer_count(&self, key: &QueryKey) -> usize {
    self.observers.get(key).map(|o| o.count).unwrap_or(0)
  }

  fn notify(&self, key: &QueryKey) {
    if let Some(observers) = self.observers.get(key) {
      let snapshot = self
        .entries
        .get(key)
        .map(|e| e.snapshot(key, Instant::now(), self.in_flight.contains_key(key)));
      observers.tx.send_replace(snapshot);
    }
  }
}

struct Inner {
  state: Mutex<State>,
  defaults: FetchOptions,
}

/// Process-wide query cache.
///
/// Cheap to clone; every clone shares the same entries. All state changes
/// happen inside one short critical section per operation, never across an
/// `.await`, so operations on a key are serialized.
#[derive(Clone)]
pub struct CacheStore {
  inner: Arc<Inner>,
}

impl CacheStore {
  /// Create a store. `defaults` apply to entries first created by `set`.
  pub fn new(defaults: FetchOptions) -> Self {
    Self {
      inner: Arc::new(Inner {
        state: Mutex::new(State::default()),
        defaults,
      }),
    }
  }

  fn lock(&self) -> MutexGuard<'_, State> {
    self
      .inner
      .state
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
  }

  /// Whatever is resident for `key`, fresh or stale.
  pub fn get(&self, key: &QueryKey) -> Option<EntrySnapshot> {
    let state = self.lock();
    state
      .entries
      .get(key)
      .map(|e| e.snapshot(key, Instant::now(), state.in_flight.contains_key(key)))
  }

  /// Decode the resident value for `key`.
  pub fn get_data<T: DeserializeOwned>(&self, key: &QueryKey) -> Result<Option<T>, CacheError> {
    self.get(key).map(|s| s.decode()).transpose()
  }

  /// Resident keys, sorted.
  pub fn keys(&self) -> Vec<QueryKey> {
    let mut keys: Vec<QueryKey> = self.lock().entries.keys().cloned().collect();
    keys.sort();
    keys
  }

  pub fn len(&self) -> usize {
    self.lock().entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  pub fn stats(&self) -> CacheStats {
    self.lock().stats
  }

  /// Return the cached value for `key` if fresh, otherwise load it.
  ///
  /// Concurrent calls for the same key share one loader call. A failed load
  /// leaves the previous entry in place and reaches every waiter.
  pub async fn fetch<F, Fut>(
    &self,
    key: &QueryKey,
    options: FetchOptions,
    loader: F,
  ) -> Result<Arc<Value>, CacheError>
  where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = RecordResult<Value>> + Send + 'static,
  {
    let loader: Loader = Arc::new(move || -> LoadFuture { Box::pin(loader()) });
    self.fetch_with(key, options, loader).await.map(|(v, _)| v)
  }

  /// Typed [`fetch`](Self::fetch). When the load fails and a previous value
  /// is resident, serve it with the error attached.
  pub async fn fetch_or_stale<T, F, Fut>(
    &self,
    key: &QueryKey,
    options: FetchOptions,
    loader: F,
  ) -> Result<CacheResult<T>, CacheError>
  where
    T: Serialize + DeserializeOwned,
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = RecordResult<T>> + Send + 'static,
  {
    let loader = typed_loader(loader);
    match self.fetch_with(key, options, loader).await {
      Ok((value, fresh_hit)) => {
        let cached_at = self
          .get(key)
          .map(|s| s.cached_at)
          .unwrap_or_else(Utc::now);
        let data = decode(key, &value)?;
        Ok(if fresh_hit {
          CacheResult::from_cache(data, cached_at)
        } else {
          CacheResult::from_network(data, cached_at)
        })
      }
      Err(err) => match self.get(key) {
        Some(stale) => {
          warn!(%key, error = %err, "Load failed, serving stale value");
          Ok(CacheResult::fallback(stale.decode()?, stale.cached_at, err))
        }
        None => Err(err),
      },
    }
  }

  /// Warm `key` ahead of a read. A fresh entry is left alone and a load in
  /// flight is joined. Failures are logged and dropped.
  pub async fn prefetch<T, F, Fut>(&self, key: &QueryKey, options: FetchOptions, loader: F)
  where
    T: Serialize,
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = RecordResult<T>> + Send + 'static,
  {
    if let Err(e) = self.fetch_with(key, options, typed_loader(loader)).await {
      debug!(%key, error = %e, "Prefetch failed");
    }
  }

  /// Fetch with an already boxed loader. Returns the value and whether it
  /// was a fresh cache hit.
  pub(crate) async fn fetch_with(
    &self,
    key: &QueryKey,
    options: FetchOptions,
    loader: Loader,
  ) -> Result<(Arc<Value>, bool), CacheError> {
    let load = {
      let mut guard = self.lock();
      let state = &mut *guard;
      let now = Instant::now();

      if let Some(entry) = state.entries.get_mut(key) {
        entry.loader = Some(Arc::clone(&loader));
        entry.options = options;
        if !entry.is_stale(now) {
          let value = Arc::clone(&entry.value);
          state.stats.hits += 1;
          return Ok((value, true));
        }
      }

      match state.in_flight.get(key) {
        Some(in_flight) => {
          let future = in_flight.future.clone();
          state.stats.coalesced += 1;
          debug!(%key, "Attaching to load in flight");
          future
        }
        None => {
          state.stats.misses += 1;
          self.start_load(state, key, options, loader)
        }
      }
    };

    load.await.map(|v| (v, false))
  }

  /// Issue a load for `key` and register it as in flight. The load runs on
  /// its own task, so it completes even if every waiter goes away.
  fn start_load(
    &self,
    state: &mut State,
    key: &QueryKey,
    options: FetchOptions,
    loader: Loader,
  ) -> SharedLoad {
    let issued = state.tick();
    debug!(%key, issued, "Loading");

    let store = self.clone();
    let task_key = key.clone();
    let future = loader();
    let handle = tokio::spawn(async move {
      let result = future.await;
      store.complete_load(&task_key, issued, options, loader, result)
    });

    let load_key = key.clone();
    let shared = async move {
      match handle.await {
        Ok(result) => result,
        Err(e) => {
          warn!(key = %load_key, error = %e, "Load task failed");
          Err(CacheError::Record(RecordError::Unknown(format!(
            "load task failed: {}",
            e
          ))))
        }
      }
    }
    .boxed()
    .shared();

    state.in_flight.insert(
      key.clone(),
      InFlight {
        issued,
        future: shared.clone(),
      },
    );
    state.notify(key);
    shared
  }

  fn complete_load(
    &self,
    key: &QueryKey,
    issued: u64,
    options: FetchOptions,
    loader: Loader,
    result: RecordResult<Value>,
  ) -> Result<Arc<Value>, CacheError> {
    let mut state = self.lock();
    if state.in_flight.get(key).map(|f| f.issued) == Some(issued) {
      state.in_flight.remove(key);
    }

    let value = match result {
      Ok(value) => Arc::new(value),
      Err(err) => {
        state.stats.loads_failed += 1;
        warn!(%key, error = %err, "Load failed");
        let err = CacheError::Record(err);
        if let Some(entry) = state.entries.get_mut(key) {
          entry.error = Some(err.clone());
        }
        // The retention timer may have fired while the load was in flight
        self.schedule_gc(&mut state, key);
        state.notify(key);
        return Err(err);
      }
    };

    let detached = issued < state.floor
      || state.removed.get(key).map_or(false, |&at| issued < at);
    let superseded = state.entries.get(key).map_or(false, |e| e.stamp > issued);

    if detached || superseded {
      state.stats.discarded_writes += 1;
      debug!(%key, issued, detached, "Discarding load older than resident value");
      self.schedule_gc(&mut state, key);
      state.notify(key);
      // Waiters see the newest value when one is resident
      let current = state.entries.get(key).map(|e| Arc::clone(&e.value));
      return Ok(current.unwrap_or(value));
    }

    let pending = state.pending_invalidation.remove(key).unwrap_or(0);
    let mut entry = Entry::new(Arc::clone(&value), issued, options);
    entry.loader = Some(loader);
    if let Some(old) = state.entries.get(key) {
      entry.invalidated_at = old.invalidated_at;
    }
    entry.invalidated_at = entry.invalidated_at.max(pending);
    state.entries.insert(key.clone(), entry);
    state.removed.remove(key);
    debug!(%key, issued, "Stored load result");

    self.schedule_gc(&mut state, key);
    state.notify(key);
    Ok(value)
  }

  /// Overwrite the value for `key` and mark it fresh.
  pub fn set(&self, key: &QueryKey, value: Value) {
    let mut state = self.lock();
    self.write(&mut state, key, Arc::new(value));
  }

  /// Typed variant of [`set`](Self::set).
  pub fn set_data<T: Serialize>(&self, key: &QueryKey, data: &T) -> Result<(), CacheError> {
    let value = serde_json::to_value(data).map_err(|e| CacheError::Decode {
      key: key.to_string(),
      message: e.to_string(),
    })?;
    self.set(key, value);
    Ok(())
  }

  /// Replace the resident value for `key` with `f(value)`. Returns false
  /// when nothing is resident or `f` declines by returning `None`.
  pub fn update(&self, key: &QueryKey, f: impl FnOnce(&Value) -> Option<Value>) -> bool {
    let mut state = self.lock();
    let next = match state.entries.get(key).and_then(|e| f(&e.value)) {
      Some(v) => v,
      None => return false,
    };
    self.write(&mut state, key, Arc::new(next));
    true
  }

  fn write(&self, state: &mut State, key: &QueryKey, value: Arc<Value>) -> u64 {
    let stamp = state.tick();
    let options = state
      .entries
      .get(key)
      .map(|e| e.options)
      .unwrap_or(self.inner.defaults);

    let mut entry = Entry::new(value, stamp, options);
    if let Some(old) = state.entries.get_mut(key) {
      entry.loader = old.loader.take();
      entry.invalidated_at = old.invalidated_at;
    }
    state.entries.insert(key.clone(), entry);
    state.removed.remove(key);
    state.pending_invalidation.remove(key);

    self.schedule_gc(state, key);
    state.notify(key);
    stamp
  }

  /// Evict `key` and cancel its retention timer. A load in flight for the
  /// key is detached and will not bring the entry back.
  pub fn remove(&self, key: &QueryKey) -> bool {
    let mut state = self.lock();
    self.remove_locked(&mut state, key)
  }

  fn remove_locked(&self, state: &mut State, key: &QueryKey) -> bool {
    let removed = state.entries.remove(key).is_some();
    if state.in_flight.remove(key).is_some() {
      let at = state.tick();
      state.removed.insert(key.clone(), at);
    }
    state.pending_invalidation.remove(key);
    if removed {
      debug!(%key, "Removed");
    }
    state.notify(key);
    removed
  }

  /// Evict every key equal to or under `prefix`. Returns how many entries
  /// were removed.
  pub fn remove_prefix(&self, prefix: &QueryKey) -> usize {
    let mut state = self.lock();
    let mut keys: Vec<QueryKey> = state
      .entries
      .keys()
      .chain(state.in_flight.keys())
      .filter(|k| k.starts_with(prefix))
      .cloned()
      .collect();
    keys.sort();
    keys.dedup();
    keys
      .iter()
      .filter(|k| self.remove_locked(&mut state, k))
      .count()
  }

  /// Mark every entry equal to or under `prefix` stale.
  ///
  /// Nothing is evicted. Entries with subscribers reload right away with
  /// their last loader; the rest reload on their next `fetch`. Loads in
  /// flight for matching keys are detached so the next `fetch` issues a new
  /// one. Returns the number of entries marked.
  pub fn invalidate(&self, prefix: &QueryKey) -> usize {
    let mut refetch = Vec::new();
    let marked = {
      let mut state = self.lock();
      let at = state.tick();
      state.stats.invalidations += 1;

      let keys: Vec<QueryKey> = state
        .entries
        .keys()
        .filter(|k| k.starts_with(prefix))
        .cloned()
        .collect();

      for key in &keys {
        let observed = state.observer_count(key) > 0;
        if let Some(entry) = state.entries.get_mut(key) {
          entry.invalidated_at = at;
          if observed {
            if let Some(loader) = &entry.loader {
              refetch.push((key.clone(), entry.options, Arc::clone(loader)));
            }
          }
        }
      }

      let detached: Vec<QueryKey> = state
        .in_flight
        .keys()
        .filter(|k| k.starts_with(prefix))
        .cloned()
        .collect();
      for key in detached {
        state.in_flight.remove(&key);
        if !state.entries.contains_key(&key) {
          state.pending_invalidation.insert(key, at);
        }
      }

      for key in &keys {
        state.notify(key);
      }
      keys.len()
    };

    if marked > 0 {
      debug!(%prefix, marked, refetching = refetch.len(), "Invalidated");
    }

    if refetch.is_empty() {
      return marked;
    }
    let runtime = match tokio::runtime::Handle::try_current() {
      Ok(h) => h,
      Err(_) => {
        debug!(%prefix, "No runtime, observed entries reload on next fetch");
        return marked;
      }
    };
    for (key, options, loader) in refetch {
      let store = self.clone();
      runtime.spawn(async move {
        if let Err(e) = store.fetch_with(&key, options, loader).await {
          debug!(%key, error = %e, "Background refetch failed");
        }
      });
    }
    marked
  }

  /// Drop every entry. Loads in flight are detached.
  pub fn clear(&self) {
    let mut state = self.lock();
    let count = state.entries.len();
    state.floor = state.tick();
    let keys: Vec<QueryKey> = state.entries.keys().cloned().collect();
    state.entries.clear();
    state.in_flight.clear();
    state.removed.clear();
    state.pending_invalidation.clear();
    for key in &keys {
      state.notify(key);
    }
    info!(count, "Cache cleared");
  }

  /// Register interest in `key`. While any subscription is alive the entry
  /// is never evicted and invalidation triggers an immediate reload.
  pub fn subscribe(&self, key: &QueryKey) -> Subscription {
    let mut state = self.lock();
    let current = state
      .entries
      .get(key)
      .map(|e| e.snapshot(key, Instant::now(), state.in_flight.contains_key(key)));

    let rx = match state.observers.get_mut(key) {
      Some(observers) => {
        observers.count += 1;
        observers.tx.subscribe()
      }
      None => {
        let (tx, rx) = watch::channel(current);
        state.observers.insert(key.clone(), Observers { count: 1, tx });
        rx
      }
    };
    if let Some(entry) = state.entries.get_mut(key) {
      entry.cancel_gc();
    }

    Subscription {
      store: self.clone(),
      key: key.clone(),
      rx,
    }
  }

  fn unsubscribe(&self, key: &QueryKey) {
    let mut state = self.lock();
    let remaining = match state.observers.get_mut(key) {
      Some(observers) => {
        observers.count = observers.count.saturating_sub(1);
        observers.count
      }
      None => return,
    };
    if remaining == 0 {
      state.observers.remove(key);
      self.schedule_gc(&mut state, key);
    }
  }

  /// Arm the retention timer for `key` if nobody observes it.
  fn schedule_gc(&self, state: &mut State, key: &QueryKey) {
    if state.observer_count(key) > 0 {
      return;
    }
    state.gc_tokens += 1;
    let token = state.gc_tokens;
    let entry = match state.entries.get_mut(key) {
      Some(e) => e,
      None => return,
    };
    entry.cancel_gc();

    // Without a runtime there is nothing to drive the timer; the entry is
    // kept until removed explicitly.
    let runtime = match tokio::runtime::Handle::try_current() {
      Ok(h) => h,
      Err(_) => return,
    };
    let retention = entry.options.retention_window;
    let weak: Weak<Inner> = Arc::downgrade(&self.inner);
    let gc_key = key.clone();
    let handle = runtime.spawn(async move {
      tokio::time::sleep(retention).await;
      if let Some(inner) = weak.upgrade() {
        CacheStore { inner }.collect(&gc_key, token);
      }
    });
    entry.gc = Some(GcTimer { token, handle });
  }

  /// Retention timer fired.
  fn collect(&self, key: &QueryKey, token: u64) {
    let mut state = self.lock();
    if state.observer_count(key) > 0 || state.in_flight.contains_key(key) {
      return;
    }
    let armed = state
      .entries
      .get(key)
      .and_then(|e| e.gc.as_ref())
      .map_or(false, |t| t.token == token);
    if !armed {
      return;
    }
    if let Some(mut entry) = state.entries.remove(key) {
      // This task is the timer; drop its handle instead of aborting it
      entry.gc.take();
      state.stats.evictions += 1;
      debug!(%key, "Evicted after retention window");
    }
  }

  /// Read the resident value and replace it with `f(previous)` in one step.
  /// Returns what was resident and the stamp of the new write, if any.
  pub(crate) fn swap(
    &self,
    key: &QueryKey,
    f: impl FnOnce(Option<&Value>) -> Option<Value>,
  ) -> (Option<Resident>, Option<u64>) {
    let mut state = self.lock();
    let now = Instant::now();
    let previous = state.entries.get(key).map(|e| Resident::of(e, now));
    match f(previous.as_ref().map(|r| r.value.as_ref())) {
      Some(next) => {
        let stamp = self.write(&mut state, key, Arc::new(next));
        (previous, Some(stamp))
      }
      None => (previous, None),
    }
  }

  /// Remove `key` and hand back what was resident.
  pub(crate) fn take(&self, key: &QueryKey) -> Option<Resident> {
    let mut state = self.lock();
    let previous = state.entries.get(key).map(|e| Resident::of(e, Instant::now()));
    self.remove_locked(&mut state, key);
    previous
  }

  /// Put back a value captured by `swap` or `take`, with the age and
  /// staleness it had then. The write still gets a new stamp, so loads
  /// issued before the restore cannot overwrite it.
  pub(crate) fn restore(&self, key: &QueryKey, resident: Resident) {
    let mut state = self.lock();
    self.write(&mut state, key, resident.value);
    let invalidated = if resident.stale { Some(state.tick()) } else { None };
    if let Some(entry) = state.entries.get_mut(key) {
      entry.updated_at = resident.updated_at;
      entry.cached_at = resident.cached_at;
      if let Some(at) = invalidated {
        entry.invalidated_at = at;
      }
    }
    state.notify(key);
  }

  /// Stamp of the resident value, used by the optimistic coordinator.
  pub(crate) fn version(&self, key: &QueryKey) -> Option<u64> {
    self.lock().entries.get(key).map(|e| e.stamp)
  }

  /// Raw resident values for every key equal to or under `prefix`.
  pub(crate) fn values_under(&self, prefix: &QueryKey) -> Vec<(QueryKey, Arc<Value>)> {
    let state = self.lock();
    let mut values: Vec<(QueryKey, Arc<Value>)> = state
      .entries
      .iter()
      .filter(|(k, _)| k.starts_with(prefix))
      .map(|(k, e)| (k.clone(), Arc::clone(&e.value)))
      .collect();
    values.sort_by(|a, b| a.0.cmp(&b.0));
    values
  }
}

/// A resident value captured for a later [`CacheStore::restore`].
pub(crate) struct Resident {
  pub value: Arc<Value>,
  updated_at: Instant,
  cached_at: DateTime<Utc>,
  stale: bool,
}

impl Resident {
  fn of(entry: &Entry, now: Instant) -> Self {
    Self {
      value: Arc::clone(&entry.value),
      updated_at: entry.updated_at,
      cached_at: entry.cached_at,
      stale: entry.is_stale(now),
    }
  }
}

/// Live interest in one key. Dropping it releases the interest.
pub struct Subscription {
  store: CacheStore,
  key: QueryKey,
  rx: watch::Receiver<Option<EntrySnapshot>>,
}

impl Subscription {
  pub fn key(&self) -> &QueryKey {
    &self.key
  }

  /// Latest snapshot published for the key.
  pub fn current(&self) -> Option<EntrySnapshot> {
    self.rx.borrow().clone()
  }

  /// Whether a snapshot was published since the last `changed` or `seen`.
  pub fn has_changed(&self) -> bool {
    self.rx.has_changed().unwrap_or(false)
  }

  /// Mark the current snapshot as seen and return it.
  pub fn seen(&mut self) -> Option<EntrySnapshot> {
    self.rx.borrow_and_update().clone()
  }

  /// Wait for the next published snapshot.
  pub async fn changed(&mut self) -> Option<EntrySnapshot> {
    match self.rx.changed().await {
      Ok(()) => self.rx.borrow_and_update().clone(),
      Err(_) => None,
    }
  }
}

impl Drop for Subscription {
  fn drop(&mut self) {
    self.store.unsubscribe(&self.key);
  }
}

/// Box a typed loader into one that produces JSON values.
pub(crate) fn typed_loader<T, F, Fut>(loader: F) -> Loader
where
  T: Serialize,
  F: Fn() -> Fut + Send + Sync + 'static,
  Fut: Future<Output = RecordResult<T>> + Send + 'static,
{
  Arc::new(move || -> LoadFuture {
    let fut = loader();
    Box::pin(async move {
      let data = fut.await?;
      serde_json::to_value(data).map_err(|e| RecordError::Unknown(e.to_string()))
    })
  })
}

pub(crate) fn decode<T: DeserializeOwned>(key: &QueryKey, value: &Value) -> Result<T, CacheError> {
  T::deserialize(value).map_err(|e| CacheError::Decode {
    key: key.to_string(),
    message: e.to_string(),
  })
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::time::Duration;

  fn options() -> FetchOptions {
    FetchOptions::new(Duration::from_secs(300), Duration::from_secs(600))
  }

  fn key(id: &str) -> QueryKey {
    QueryKey::root("artists").child("detail").child(id)
  }

  /// Loader that counts calls and returns `{"n": call_number}` after `delay`.
  fn counting_loader(
    calls: Arc<AtomicUsize>,
    delay: Duration,
  ) -> impl Fn() -> BoxFuture<'static, RecordResult<Value>> + Send + Sync + 'static {
    move || {
      let calls = Arc::clone(&calls);
      async move {
        tokio::time::sleep(delay).await;
        let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(json!({ "n": n }))
      }
      .boxed()
    }
  }

  #[tokio::test(start_paused = true)]
  async fn test_concurrent_fetches_share_one_load() {
    let store = CacheStore::new(options());
    let calls = Arc::new(AtomicUsize::new(0));
    let k = key("X");

    let (a, b) = tokio::join!(
      store.fetch(&k, options(), counting_loader(calls.clone(), Duration::from_millis(100))),
      store.fetch(&k, options(), counting_loader(calls.clone(), Duration::from_millis(100))),
    );

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(a.unwrap(), b.unwrap());
    assert_eq!(store.stats().coalesced, 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_fresh_entry_is_served_without_loading() {
    let store = CacheStore::new(options());
    let calls = Arc::new(AtomicUsize::new(0));
    let k = key("X");

    let first = store
      .fetch(&k, options(), counting_loader(calls.clone(), Duration::ZERO))
      .await
      .unwrap();
    tokio::time::sleep(Duration::from_secs(60)).await;
    let second = store
      .fetch(&k, options(), counting_loader(calls.clone(), Duration::ZERO))
      .await
      .unwrap();

    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(store.stats().hits, 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_entry_goes_stale_after_window() {
    let store = CacheStore::new(options());
    let calls = Arc::new(AtomicUsize::new(0));
    let k = key("X");
    let short = FetchOptions::new(Duration::from_secs(10), Duration::from_secs(600));

    store
      .fetch(&k, short, counting_loader(calls.clone(), Duration::ZERO))
      .await
      .unwrap();
    assert!(!store.get(&k).unwrap().is_stale);

    tokio::time::sleep(Duration::from_secs(11)).await;
    assert!(store.get(&k).unwrap().is_stale);

    let value = store
      .fetch(&k, short, counting_loader(calls.clone(), Duration::ZERO))
      .await
      .unwrap();
    assert_eq!(*value, json!({"n": 2}));
  }

  #[tokio::test(start_paused = true)]
  async fn test_invalidate_prefix_forces_reload() {
    let store = CacheStore::new(options());
    let calls = Arc::new(AtomicUsize::new(0));
    let k = key("X");

    store
      .fetch(&k, options(), counting_loader(calls.clone(), Duration::ZERO))
      .await
      .unwrap();
    let marked = store.invalidate(&QueryKey::root("artists"));
    assert_eq!(marked, 1);
    assert!(store.get(&k).unwrap().is_stale);

    let value = store
      .fetch(&k, options(), counting_loader(calls.clone(), Duration::ZERO))
      .await
      .unwrap();
    assert_eq!(*value, json!({"n": 2}));
    assert!(!store.get(&k).unwrap().is_stale);
  }

  #[tokio::test(start_paused = true)]
  async fn test_invalidate_without_matches_is_noop() {
    let store = CacheStore::new(options());
    store.set(&key("X"), json!(1));
    assert_eq!(store.invalidate(&QueryKey::root("songs")), 0);
    assert!(!store.get(&key("X")).unwrap().is_stale);
  }

  #[tokio::test(start_paused = true)]
  async fn test_invalidate_detaches_load_in_flight() {
    let store = CacheStore::new(options());
    let calls = Arc::new(AtomicUsize::new(0));
    let k = key("X");

    let early = {
      let store = store.clone();
      let k = k.clone();
      let loader = counting_loader(calls.clone(), Duration::from_millis(100));
      tokio::spawn(async move { store.fetch(&k, options(), loader).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    store.invalidate(&QueryKey::root("artists"));

    let value = store
      .fetch(&k, options(), counting_loader(calls.clone(), Duration::from_millis(100)))
      .await
      .unwrap();
    early.await.unwrap().unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(*value, json!({"n": 2}));
    assert_eq!(*store.get(&k).unwrap().value, json!({"n": 2}));
  }

  #[tokio::test(start_paused = true)]
  async fn test_slow_load_does_not_overwrite_newer_set() {
    let store = CacheStore::new(options());
    let k = key("X");
    store.set(&k, json!({"name": "old"}));
    store.invalidate(&k);

    let slow = {
      let store = store.clone();
      let k = k.clone();
      tokio::spawn(async move {
        store
          .fetch(&k, options(), || async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok(json!({"name": "from load"}))
          })
          .await
      })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    store.set(&k, json!({"name": "from mutation"}));

    let resolved = slow.await.unwrap().unwrap();
    assert_eq!(*resolved, json!({"name": "from mutation"}));
    assert_eq!(*store.get(&k).unwrap().value, json!({"name": "from mutation"}));
    assert_eq!(store.stats().discarded_writes, 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_failed_load_keeps_previous_value() {
    let store = CacheStore::new(options());
    let k = key("X");
    store.set(&k, json!({"name": "Nova"}));
    store.invalidate(&k);

    let err = store
      .fetch(&k, options(), || async {
        Err(RecordError::Transient("timeout".into()))
      })
      .await
      .unwrap_err();
    assert_eq!(err.kind(), crate::error::ErrorKind::Transient);

    let snapshot = store.get(&k).unwrap();
    assert_eq!(*snapshot.value, json!({"name": "Nova"}));
    assert!(snapshot.is_stale);
    assert!(snapshot.error.is_some());
  }

  #[tokio::test(start_paused = true)]
  async fn test_failure_reaches_every_waiter() {
    let store = CacheStore::new(options());
    let calls = Arc::new(AtomicUsize::new(0));
    let k = key("X");
    let failing = {
      let calls = calls.clone();
      move || {
        let calls = calls.clone();
        async move {
          tokio::time::sleep(Duration::from_millis(50)).await;
          calls.fetch_add(1, Ordering::SeqCst);
          Err::<Value, _>(RecordError::NotFound("artists/X".into()))
        }
      }
    };

    let (a, b) = tokio::join!(
      store.fetch(&k, options(), failing.clone()),
      store.fetch(&k, options(), failing),
    );
    assert!(a.is_err());
    assert!(b.is_err());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(store.get(&k).is_none());
  }

  #[tokio::test(start_paused = true)]
  async fn test_fetch_or_stale_serves_fallback() {
    let store = CacheStore::new(options());
    let k = key("X");
    store.set(&k, json!("cached"));
    store.invalidate(&k);

    let result = store
      .fetch_or_stale::<String, _, _>(&k, options(), || async {
        Err(RecordError::Transient("offline".into()))
      })
      .await
      .unwrap();
    assert!(result.is_fallback());
    assert_eq!(result.data, "cached");
    assert!(result.error.is_some());
  }

  #[tokio::test(start_paused = true)]
  async fn test_unobserved_entry_is_evicted_after_retention() {
    let store = CacheStore::new(options());
    let k = key("X");
    let opts = FetchOptions::new(Duration::from_secs(10), Duration::from_secs(60));

    store
      .fetch(&k, opts, || async { Ok(json!(1)) })
      .await
      .unwrap();
    tokio::time::sleep(Duration::from_secs(59)).await;
    assert!(store.get(&k).is_some());

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(store.get(&k).is_none());
    assert_eq!(store.stats().evictions, 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_entry_is_evicted_after_slow_failed_reload() {
    let store = CacheStore::new(options());
    let k = key("X");
    let opts = FetchOptions::new(Duration::from_secs(1), Duration::from_secs(60));

    store
      .fetch(&k, opts, || async { Ok(json!(1)) })
      .await
      .unwrap();
    tokio::time::sleep(Duration::from_secs(2)).await;

    // Retention fires while the reload is in flight and is skipped
    let err = store
      .fetch(&k, opts, || async {
        tokio::time::sleep(Duration::from_secs(60)).await;
        Err(RecordError::Transient("timeout".into()))
      })
      .await;
    assert!(err.is_err());
    assert!(store.get(&k).is_some());

    tokio::time::sleep(Duration::from_secs(3600)).await;
    assert!(store.get(&k).is_none());
    assert_eq!(store.stats().evictions, 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_entry_is_evicted_after_discarded_reload() {
    let store = CacheStore::new(options());
    let k = key("X");
    let opts = FetchOptions::new(Duration::from_secs(1), Duration::from_secs(60));

    store
      .fetch(&k, opts, || async { Ok(json!(1)) })
      .await
      .unwrap();
    tokio::time::sleep(Duration::from_secs(2)).await;

    let slow = {
      let store = store.clone();
      let k = k.clone();
      tokio::spawn(async move {
        store
          .fetch(&k, opts, || async {
            tokio::time::sleep(Duration::from_secs(90)).await;
            Ok(json!("late"))
          })
          .await
      })
    };
    tokio::time::sleep(Duration::from_secs(10)).await;
    store.update(&k, |_| Some(json!(2)));

    slow.await.unwrap().unwrap();
    assert_eq!(store.stats().discarded_writes, 1);

    tokio::time::sleep(Duration::from_secs(3600)).await;
    assert!(store.get(&k).is_none());
    assert_eq!(store.stats().evictions, 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_prefetch_warms_entry() {
    let store = CacheStore::new(options());
    let calls = Arc::new(AtomicUsize::new(0));
    let k = key("X");

    store
      .prefetch(&k, options(), counting_loader(calls.clone(), Duration::ZERO))
      .await;
    store
      .prefetch(&k, options(), counting_loader(calls.clone(), Duration::ZERO))
      .await;

    let result: CacheResult<Value> = store
      .fetch_or_stale(&k, options(), counting_loader(calls.clone(), Duration::ZERO))
      .await
      .unwrap();
    assert_eq!(result.source, crate::cache::CacheSource::CacheFresh);
    assert_eq!(result.data, json!({"n": 1}));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_prefetch_swallows_failure() {
    let store = CacheStore::new(options());
    let k = key("X");

    store
      .prefetch(&k, options(), || async {
        Err::<Value, _>(RecordError::Transient("timeout".into()))
      })
      .await;

    assert!(store.get(&k).is_none());
    assert_eq!(store.stats().loads_failed, 1);
  }

  #[test]
  fn test_invalidate_outside_runtime_marks_without_refetch() {
    let store = CacheStore::new(options());
    let k = key("X");
    let _sub = store.subscribe(&k);
    store.set(&k, json!(1));
    {
      let mut state = store.lock();
      let loader: Loader = Arc::new(|| -> LoadFuture { Box::pin(async { Ok(json!(2)) }) });
      if let Some(entry) = state.entries.get_mut(&k) {
        entry.loader = Some(loader);
      }
    }

    assert_eq!(store.invalidate(&QueryKey::root("artists")), 1);
    let snapshot = store.get(&k).unwrap();
    assert!(snapshot.is_stale);
    assert_eq!(*snapshot.value, json!(1));
  }

  #[tokio::test(start_paused = true)]
  async fn test_subscribed_entry_is_kept_and_refetched() {
    let store = CacheStore::new(options());
    let calls = Arc::new(AtomicUsize::new(0));
    let k = key("X");
    let opts = FetchOptions::new(Duration::from_secs(10), Duration::from_secs(60));

    let mut sub = store.subscribe(&k);
    store
      .fetch(&k, opts, counting_loader(calls.clone(), Duration::ZERO))
      .await
      .unwrap();

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert!(store.get(&k).is_some());

    store.invalidate(&k);
    loop {
      if let Some(snapshot) = sub.changed().await {
        if *snapshot.value == json!({"n": 2}) && !snapshot.is_stale {
          break;
        }
      }
    }
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    drop(sub);
    tokio::time::sleep(Duration::from_secs(61)).await;
    assert!(store.get(&k).is_none());
  }

  #[tokio::test(start_paused = true)]
  async fn test_remove_detaches_load_in_flight() {
    let store = CacheStore::new(options());
    let k = key("X");

    let pending = {
      let store = store.clone();
      let k = k.clone();
      tokio::spawn(async move {
        store
          .fetch(&k, options(), || async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok(json!("late"))
          })
          .await
      })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    store.remove(&k);

    assert_eq!(*pending.await.unwrap().unwrap(), json!("late"));
    assert!(store.get(&k).is_none());
  }

  #[tokio::test(start_paused = true)]
  async fn test_remove_prefix_and_clear() {
    let store = CacheStore::new(options());
    store.set(&key("A"), json!(1));
    store.set(&key("B"), json!(2));
    store.set(&QueryKey::root("songs").child("list"), json!([]));

    assert_eq!(store.remove_prefix(&QueryKey::root("artists")), 2);
    assert_eq!(store.len(), 1);

    store.clear();
    assert!(store.is_empty());
  }

  #[tokio::test(start_paused = true)]
  async fn test_update_rewrites_resident_value() {
    let store = CacheStore::new(options());
    let k = key("X");
    assert!(!store.update(&k, |_| Some(json!(0))));

    store.set(&k, json!({"count": 1}));
    let before = store.get(&k).unwrap().version;
    assert!(store.update(&k, |v| Some(json!({"count": v["count"].as_i64().unwrap() + 1}))));

    let after = store.get(&k).unwrap();
    assert_eq!(*after.value, json!({"count": 2}));
    assert!(after.version > before);
  }
}
