//! Structured query keys.
//!
//! A key is an ordered list of segments: a domain namespace, a qualifier and
//! optional parameters, e.g. `["songs","list",{}]` or
//! `["artists","detail","A1","songs"]`. Keys nest: a key is under every one
//! of its prefixes, which is what prefix invalidation relies on.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;

use crate::record::{FilterValue, ListQuery, Order};

/// One element of a [`QueryKey`].
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KeySegment {
  Text(String),
  Number(u64),
  Params(ListParams),
}

impl From<&str> for KeySegment {
  fn from(s: &str) -> Self {
    KeySegment::Text(s.to_string())
  }
}

impl From<String> for KeySegment {
  fn from(s: String) -> Self {
    KeySegment::Text(s)
  }
}

impl From<&String> for KeySegment {
  fn from(s: &String) -> Self {
    KeySegment::Text(s.clone())
  }
}

impl From<u64> for KeySegment {
  fn from(n: u64) -> Self {
    KeySegment::Number(n)
  }
}

impl From<ListParams> for KeySegment {
  fn from(p: ListParams) -> Self {
    KeySegment::Params(p.normalized())
  }
}

/// Sort column and direction.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SortSpec {
  pub field: String,
  #[serde(default)]
  pub order: Order,
}

/// Closed set of list options that can appear in a key.
///
/// Filters live in a `BTreeMap`, so the order they were added in never
/// changes equality or the fingerprint.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ListParams {
  #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
  pub filters: BTreeMap<String, FilterValue>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub search: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub sort: Option<SortSpec>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub page: Option<u32>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub page_size: Option<u32>,
}

impl ListParams {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn filter(mut self, field: impl Into<String>, value: impl Into<FilterValue>) -> Self {
    self.filters.insert(field.into(), value.into());
    self
  }

  pub fn search(mut self, term: impl Into<String>) -> Self {
    self.search = Some(term.into());
    self
  }

  pub fn sort(mut self, field: impl Into<String>, order: Order) -> Self {
    self.sort = Some(SortSpec {
      field: field.into(),
      order,
    });
    self
  }

  pub fn page(mut self, page: u32, page_size: u32) -> Self {
    self.page = Some(page);
    self.page_size = Some(page_size);
    self
  }

  /// Drop options that do not change the result: blank search terms and
  /// empty text filters.
  pub fn normalized(mut self) -> Self {
    self.search = self
      .search
      .map(|s| s.trim().to_string())
      .filter(|s| !s.is_empty());
    self
      .filters
      .retain(|_, v| !matches!(v, FilterValue::Text(t) if t.is_empty()));
    self
  }

  /// Build the backend query, applying `defaults` for sort and search
  /// columns the caller did not set.
  pub fn to_list_query(&self, search_columns: &[&str], default_sort: Option<(&str, Order)>) -> ListQuery {
    let (sort, order) = match (&self.sort, default_sort) {
      (Some(s), _) => (Some(s.field.clone()), s.order),
      (None, Some((field, order))) => (Some(field.to_string()), order),
      (None, None) => (None, Order::Asc),
    };
    ListQuery {
      filters: self.filters.clone(),
      search: self.search.clone(),
      search_columns: search_columns.iter().map(|c| c.to_string()).collect(),
      sort,
      order,
      page: self.page,
      page_size: self.page_size,
    }
  }
}

/// Structured cache identifier.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueryKey(Vec<KeySegment>);

impl QueryKey {
  /// Namespace key, e.g. `["artists"]`.
  pub fn root(namespace: &str) -> Self {
    QueryKey(vec![KeySegment::from(namespace)])
  }

  /// A new key one level below this one.
  pub fn child(&self, segment: impl Into<KeySegment>) -> Self {
    let mut segments = self.0.clone();
    segments.push(segment.into());
    QueryKey(segments)
  }

  pub fn segments(&self) -> &[KeySegment] {
    &self.0
  }

  pub fn len(&self) -> usize {
    self.0.len()
  }

  pub fn is_empty(&self) -> bool {
    self.0.is_empty()
  }

  /// First segment, when it is text.
  pub fn namespace(&self) -> Option<&str> {
    match self.0.first() {
      Some(KeySegment::Text(s)) => Some(s),
      _ => None,
    }
  }

  /// True when `prefix` equals this key or is one of its ancestors.
  pub fn starts_with(&self, prefix: &QueryKey) -> bool {
    self.0.starts_with(&prefix.0)
  }

  /// Stable SHA-256 digest of the key's canonical JSON form.
  pub fn fingerprint(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(self.to_string().as_bytes());
    hex::encode(hasher.finalize())
  }
}

impl fmt::Display for QueryKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    // BTreeMap-backed params serialize deterministically
    match serde_json::to_string(&self.0) {
      Ok(s) => f.write_str(&s),
      Err(_) => write!(f, "{:?}", self.0),
    }
  }
}

/// Build `[domain, qualifier, params?]`.
pub fn key_for(domain: &str, qualifier: &str, params: Option<KeySegment>) -> QueryKey {
  let key = QueryKey::root(domain).child(qualifier);
  match params {
    Some(KeySegment::Params(p)) => key.child(p),
    Some(segment) => key.child(segment),
    None => key,
  }
}
