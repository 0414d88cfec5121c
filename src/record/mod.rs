//! Record access layer consumed by the cache.
//!
//! The backend-as-a-service exposes named collections of JSON records. This
//! module defines the contract the cache loaders talk to, plus an in-process
//! implementation and a retrying wrapper.

pub mod memory;
pub mod retry;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

pub use memory::MemoryBackend;
pub use retry::{RetryPolicy, Retrying};

use crate::error::RecordResult;

/// A single backend row.
pub type Record = Map<String, Value>;

/// Sort direction for list queries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Order {
  #[default]
  Asc,
  Desc,
}

/// Value a list filter matches against.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FilterValue {
  Bool(bool),
  Int(i64),
  /// Exact match, or a case-insensitive glob when it contains `*`
  Text(String),
  /// Matches when the field equals any of the values
  AnyOf(Vec<FilterValue>),
}

impl From<&str> for FilterValue {
  fn from(s: &str) -> Self {
    FilterValue::Text(s.to_string())
  }
}

impl From<String> for FilterValue {
  fn from(s: String) -> Self {
    FilterValue::Text(s)
  }
}

impl From<bool> for FilterValue {
  fn from(b: bool) -> Self {
    FilterValue::Bool(b)
  }
}

impl From<i64> for FilterValue {
  fn from(n: i64) -> Self {
    FilterValue::Int(n)
  }
}

/// Options for a `list` call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListQuery {
  pub filters: BTreeMap<String, FilterValue>,
  pub search: Option<String>,
  /// Columns the search term is matched against
  pub search_columns: Vec<String>,
  pub sort: Option<String>,
  pub order: Order,
  pub page: Option<u32>,
  pub page_size: Option<u32>,
}

/// One page of list results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
  pub items: Vec<T>,
  pub total: usize,
  pub page: u32,
  pub page_size: u32,
  pub has_next: bool,
  pub has_previous: bool,
}

impl<T> Page<T> {
  /// Convert every item, keeping the paging metadata.
  pub fn try_map<U, E>(self, f: impl FnMut(T) -> Result<U, E>) -> Result<Page<U>, E> {
    let items = self.items.into_iter().map(f).collect::<Result<Vec<_>, _>>()?;
    Ok(Page {
      items,
      total: self.total,
      page: self.page,
      page_size: self.page_size,
      has_next: self.has_next,
      has_previous: self.has_previous,
    })
  }
}

/// Result of a file upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredFile {
  pub url: String,
  pub path: String,
}

/// CRUD and list access to the backend's named collections.
///
/// All calls may fail with one of the [`RecordError`](crate::error::RecordError)
/// classifications. Retrying transient failures is the implementor's job
/// (see [`Retrying`]); the cache never retries.
#[async_trait]
pub trait RecordAccess: Send + Sync {
  async fn list(&self, collection: &str, query: &ListQuery) -> RecordResult<Page<Record>>;

  async fn get_by_id(&self, collection: &str, id: &str) -> RecordResult<Record>;

  async fn create(&self, collection: &str, data: Record) -> RecordResult<Record>;

  async fn update(&self, collection: &str, id: &str, patch: Record) -> RecordResult<Record>;

  async fn delete(&self, collection: &str, id: &str) -> RecordResult<()>;

  async fn upload_file(
    &self,
    bucket: &str,
    name: Option<&str>,
    bytes: Vec<u8>,
  ) -> RecordResult<StoredFile>;
}
