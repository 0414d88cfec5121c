//! Retrying wrapper for record backends.

use async_trait::async_trait;
use serde::Deserialize;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

use super::{ListQuery, Page, Record, RecordAccess, StoredFile};
use crate::error::RecordResult;

/// Capped exponential backoff for transient failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
  /// Retries after the first attempt
  pub attempts: u32,
  #[serde(with = "millis")]
  pub base_delay: Duration,
  #[serde(with = "millis")]
  pub max_delay: Duration,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self {
      attempts: 3,
      base_delay: Duration::from_millis(1000),
      max_delay: Duration::from_millis(30_000),
    }
  }
}

impl RetryPolicy {
  /// Writes are not idempotent on every backend, so they get one retry
  /// after a fixed delay.
  pub fn mutations() -> Self {
    Self {
      attempts: 1,
      base_delay: Duration::from_millis(1000),
      max_delay: Duration::from_millis(1000),
    }
  }

  pub fn none() -> Self {
    Self {
      attempts: 0,
      ..Self::default()
    }
  }

  /// Delay before retry number `attempt` (0-based).
  pub fn delay_for(&self, attempt: u32) -> Duration {
    let factor = 2u32.saturating_pow(attempt);
    self.base_delay.saturating_mul(factor).min(self.max_delay)
  }

  /// Run `op` until it succeeds, fails with a non-retryable error, or the
  /// attempts run out.
  pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> RecordResult<T>
  where
    F: FnMut() -> Fut,
    Fut: Future<Output = RecordResult<T>>,
  {
    let mut attempt = 0;
    loop {
      match op().await {
        Err(e) if e.is_retryable() && attempt < self.attempts => {
          let delay = self.delay_for(attempt);
          warn!(what, attempt = attempt + 1, ?delay, error = %e, "Retrying backend call");
          tokio::time::sleep(delay).await;
          attempt += 1;
        }
        other => return other,
      }
    }
  }
}

mod millis {
  use serde::{Deserialize, Deserializer};
  use std::time::Duration;

  pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
  where
    D: Deserializer<'de>,
  {
    u64::deserialize(deserializer).map(Duration::from_millis)
  }
}

/// Record backend that retries transient failures of the wrapped backend.
/// Reads and writes back off under separate policies.
#[derive(Clone)]
pub struct Retrying<A> {
  inner: A,
  policy: RetryPolicy,
  mutation_policy: RetryPolicy,
}

impl<A: RecordAccess> Retrying<A> {
  pub fn new(inner: A, policy: RetryPolicy) -> Self {
    Self {
      inner,
      policy,
      mutation_policy: RetryPolicy::mutations(),
    }
  }

  pub fn with_mutation_policy(mut self, policy: RetryPolicy) -> Self {
    self.mutation_policy = policy;
    self
  }

  pub fn inner(&self) -> &A {
    &self.inner
  }
}

#[async_trait]
impl<A: RecordAccess> RecordAccess for Retrying<A> {
  async fn list(&self, collection: &str, query: &ListQuery) -> RecordResult<Page<Record>> {
    self
      .policy
      .run("list", || self.inner.list(collection, query))
      .await
  }

  async fn get_by_id(&self, collection: &str, id: &str) -> RecordResult<Record> {
    self
      .policy
      .run("get", || self.inner.get_by_id(collection, id))
      .await
  }

  async fn create(&self, collection: &str, data: Record) -> RecordResult<Record> {
    self
      .mutation_policy
      .run("create", || self.inner.create(collection, data.clone()))
      .await
  }

  async fn update(&self, collection: &str, id: &str, patch: Record) -> RecordResult<Record> {
    self
      .mutation_policy
      .run("update", || self.inner.update(collection, id, patch.clone()))
      .await
  }

  async fn delete(&self, collection: &str, id: &str) -> RecordResult<()> {
    self
      .mutation_policy
      .run("delete", || self.inner.delete(collection, id))
      .await
  }

  async fn upload_file(
    &self,
    bucket: &str,
    name: Option<&str>,
    bytes: Vec<u8>,
  ) -> RecordResult<StoredFile> {
    self
      .mutation_policy
      .run("upload", || self.inner.upload_file(bucket, name, bytes.clone()))
      .await
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::error::{ErrorKind, RecordError};
  use crate::record::memory::{MemoryBackend, Op};
  use serde_json::json;

  #[test]
  fn test_delay_is_capped() {
    let policy = RetryPolicy::default();
    assert_eq!(policy.delay_for(0), Duration::from_secs(1));
    assert_eq!(policy.delay_for(2), Duration::from_secs(4));
    assert_eq!(policy.delay_for(10), Duration::from_secs(30));
  }

  #[tokio::test(start_paused = true)]
  async fn test_transient_errors_are_retried() {
    let backend = MemoryBackend::new();
    backend.seed("songs", vec![json!({"id": "s1"}).as_object().unwrap().clone()]);
    backend.fail_next(Op::Get, RecordError::Transient("timeout".into()));
    backend.fail_next(Op::Get, RecordError::Transient("timeout".into()));

    let retrying = Retrying::new(backend.clone(), RetryPolicy::default());
    let record = retrying.get_by_id("songs", "s1").await.unwrap();
    assert_eq!(record["id"], "s1");
    assert_eq!(backend.calls(Op::Get), 3);
  }

  #[tokio::test(start_paused = true)]
  async fn test_non_transient_errors_surface_immediately() {
    let backend = MemoryBackend::new();
    backend.fail_next(Op::Update, RecordError::Validation("name required".into()));

    let retrying = Retrying::new(backend.clone(), RetryPolicy::default())
      .with_mutation_policy(RetryPolicy::default());
    let err = retrying
      .update("playlists", "p1", Default::default())
      .await
      .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert_eq!(backend.calls(Op::Update), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_gives_up_after_attempts() {
    let backend = MemoryBackend::new();
    for _ in 0..5 {
      backend.fail_next(Op::List, RecordError::Transient("down".into()));
    }
    let policy = RetryPolicy {
      attempts: 2,
      ..RetryPolicy::default()
    };
    let retrying = Retrying::new(backend.clone(), policy);
    let err = retrying.list("songs", &ListQuery::default()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Transient);
    assert_eq!(backend.calls(Op::List), 3);
  }

  #[tokio::test(start_paused = true)]
  async fn test_writes_use_their_own_policy() {
    let backend = MemoryBackend::new();
    for _ in 0..3 {
      backend.fail_next(Op::Create, RecordError::Transient("timeout".into()));
      backend.fail_next(Op::List, RecordError::Transient("timeout".into()));
    }

    let retrying = Retrying::new(backend.clone(), RetryPolicy::default());
    let started = tokio::time::Instant::now();
    let err = retrying
      .create("songs", Default::default())
      .await
      .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Transient);
    assert_eq!(backend.calls(Op::Create), 2);
    assert_eq!(started.elapsed(), Duration::from_secs(1));

    retrying.list("songs", &ListQuery::default()).await.unwrap();
    assert_eq!(backend.calls(Op::List), 4);
  }
}
