//! Optimistic mutations with rollback.
//!
//! A mutation applies its speculative values to the cache before the remote
//! write is sent, then either reconciles with the server's answer or puts
//! back exactly what it replaced.
//!
//! Snapshots are taken when the mutation starts. Two overlapping mutations
//! each restore their own snapshot on failure, which may already contain the
//! other's speculative value; a late rollback can therefore undo an earlier
//! commit on the same key.

use serde_json::Value;
use std::collections::HashSet;
use std::future::Future;
use tracing::{debug, warn};

use super::key::QueryKey;
use super::store::{CacheStore, Resident};
use crate::error::{CacheError, RecordResult};

/// Computes a speculative value from the resident one. `None` leaves the
/// entry alone.
pub type Updater = Box<dyn Fn(&Value) -> Option<Value> + Send + Sync>;

type Reconciler<T> = Box<dyn FnOnce(&CacheStore, &T) + Send>;

/// Lifecycle of one mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationState {
  Pending,
  Committed,
  RolledBack,
}

enum Target {
  Key(QueryKey),
  Prefix(QueryKey),
}

enum Change {
  Patch(Updater),
  Put(Value),
  Evict,
}

struct Touch {
  target: Target,
  change: Change,
}

struct Snapshot {
  key: QueryKey,
  /// Value and freshness before the mutation, `None` if absent
  previous: Option<Resident>,
  /// Stamp of our last speculative write, `None` after an evict
  speculative: Option<u64>,
}

/// One optimistic write against the cache. Consumed by [`run`](Self::run).
pub struct OptimisticMutation<T> {
  store: CacheStore,
  label: String,
  touches: Vec<Touch>,
  invalidate: Vec<QueryKey>,
  on_commit: Option<Reconciler<T>>,
}

impl<T> OptimisticMutation<T> {
  pub fn new(store: &CacheStore, label: impl Into<String>) -> Self {
    Self {
      store: store.clone(),
      label: label.into(),
      touches: Vec::new(),
      invalidate: Vec::new(),
      on_commit: None,
    }
  }

  /// Rewrite the entry for `key` if one is resident.
  pub fn patch(
    mut self,
    key: QueryKey,
    f: impl Fn(&Value) -> Option<Value> + Send + Sync + 'static,
  ) -> Self {
    self.touches.push(Touch {
      target: Target::Key(key),
      change: Change::Patch(Box::new(f)),
    });
    self
  }

  /// Rewrite every resident entry under `prefix`.
  pub fn patch_matching(
    mut self,
    prefix: QueryKey,
    f: impl Fn(&Value) -> Option<Value> + Send + Sync + 'static,
  ) -> Self {
    self.touches.push(Touch {
      target: Target::Prefix(prefix),
      change: Change::Patch(Box::new(f)),
    });
    self
  }

  /// Write `value` under `key`, resident or not.
  pub fn put(mut self, key: QueryKey, value: Value) -> Self {
    self.touches.push(Touch {
      target: Target::Key(key),
      change: Change::Put(value),
    });
    self
  }

  /// Remove `key` until the mutation settles.
  pub fn evict(mut self, key: QueryKey) -> Self {
    self.touches.push(Touch {
      target: Target::Key(key),
      change: Change::Evict,
    });
    self
  }

  /// Mark `prefix` stale once the write is confirmed.
  pub fn invalidate_on_commit(mut self, prefix: QueryKey) -> Self {
    self.invalidate.push(prefix);
    self
  }

  pub fn invalidate_all_on_commit(mut self, prefixes: impl IntoIterator<Item = QueryKey>) -> Self {
    self.invalidate.extend(prefixes);
    self
  }

  /// Write the server's answer into the cache on success.
  pub fn on_commit(mut self, f: impl FnOnce(&CacheStore, &T) + Send + 'static) -> Self {
    self.on_commit = Some(Box::new(f));
    self
  }

  /// Apply the speculative values, await `remote`, then commit or roll back.
  pub async fn run<Fut>(self, remote: Fut) -> Result<T, CacheError>
  where
    Fut: Future<Output = RecordResult<T>>,
  {
    let OptimisticMutation {
      store,
      label,
      touches,
      invalidate,
      on_commit,
    } = self;

    let snapshots = apply(&store, touches);
    debug!(
      mutation = %label,
      state = ?MutationState::Pending,
      touched = snapshots.len(),
      "Applied speculative values"
    );

    match remote.await {
      Ok(data) => {
        if let Some(reconcile) = on_commit {
          reconcile(&store, &data);
        }
        // Keys the reconciler did not overwrite still hold the guess
        for snapshot in &snapshots {
          if snapshot.speculative.is_some() && store.version(&snapshot.key) == snapshot.speculative
          {
            store.invalidate(&snapshot.key);
          }
        }
        for prefix in &invalidate {
          store.invalidate(prefix);
        }
        debug!(mutation = %label, state = ?MutationState::Committed, "Mutation settled");
        Ok(data)
      }
      Err(err) => {
        for snapshot in snapshots.into_iter().rev() {
          match snapshot.previous {
            Some(previous) => store.restore(&snapshot.key, previous),
            None => {
              store.remove(&snapshot.key);
            }
          }
        }
        warn!(
          mutation = %label,
          state = ?MutationState::RolledBack,
          error = %err,
          "Mutation rejected, restored snapshots"
        );
        Err(err.into())
      }
    }
  }
}

/// Pending transition: snapshot and write every touched key.
fn apply(store: &CacheStore, touches: Vec<Touch>) -> Vec<Snapshot> {
  let mut snapshots: Vec<Snapshot> = Vec::new();
  let mut seen: HashSet<QueryKey> = HashSet::new();

  for touch in touches {
    let keys = match &touch.target {
      Target::Key(key) => vec![key.clone()],
      Target::Prefix(prefix) => store
        .values_under(prefix)
        .into_iter()
        .map(|(k, _)| k)
        .collect(),
    };

    for key in keys {
      let (previous, speculative) = match &touch.change {
        Change::Patch(f) => store.swap(&key, |current| current.and_then(|v| f(v))),
        Change::Put(value) => store.swap(&key, |_| Some(value.clone())),
        Change::Evict => (store.take(&key), None),
      };

      let changed = speculative.is_some() || matches!(touch.change, Change::Evict);
      if !changed {
        continue;
      }
      if seen.insert(key.clone()) {
        snapshots.push(Snapshot {
          key,
          previous,
          speculative,
        });
      } else if let Some(s) = snapshots.iter_mut().find(|s| s.key == key) {
        s.speculative = speculative;
      }
    }
  }
  snapshots
}
