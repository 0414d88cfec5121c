//! In-process record backend.
//!
//! Keeps every collection in memory and answers list queries the way the
//! hosted backend does: filters, search, sort, then pagination. Failures can
//! be queued per operation so callers can exercise error paths.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::debug;

use super::{FilterValue, ListQuery, Order, Page, Record, RecordAccess, StoredFile};
use crate::error::{RecordError, RecordResult};

pub const DEFAULT_PAGE_SIZE: u32 = 50;
pub const MAX_PAGE_SIZE: u32 = 100;

/// Operation names used for failure injection and call counting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
  List,
  Get,
  Create,
  Update,
  Delete,
  Upload,
}

#[derive(Default)]
struct State {
  /// collection -> id -> record
  collections: HashMap<String, BTreeMap<String, Record>>,
  failures: HashMap<Op, VecDeque<RecordError>>,
  calls: HashMap<Op, usize>,
}

/// Backend that keeps all records in memory.
#[derive(Clone, Default)]
pub struct MemoryBackend {
  state: Arc<Mutex<State>>,
  next_id: Arc<AtomicU64>,
  latency: Option<Duration>,
}

impl MemoryBackend {
  pub fn new() -> Self {
    Self::default()
  }

  /// Delay every call by `latency` to simulate a network round trip.
  pub fn with_latency(mut self, latency: Duration) -> Self {
    self.latency = Some(latency);
    self
  }

  /// Insert records directly, bypassing failure injection. Records without an
  /// `id` get one assigned.
  pub fn seed(&self, collection: &str, records: impl IntoIterator<Item = Record>) {
    let mut state = self.lock();
    let table = state.collections.entry(collection.to_string()).or_default();
    for mut record in records {
      let id = match record.get("id").and_then(id_string) {
        Some(id) => id,
        None => {
          let id = self.generate_id(collection);
          record.insert("id".into(), Value::String(id.clone()));
          id
        }
      };
      table.insert(id, record);
    }
  }

  /// Make the next call of `op` fail with `error`.
  pub fn fail_next(&self, op: Op, error: RecordError) {
    self.lock().failures.entry(op).or_default().push_back(error);
  }

  /// Number of calls made for `op` so far, including failed ones.
  pub fn calls(&self, op: Op) -> usize {
    self.lock().calls.get(&op).copied().unwrap_or(0)
  }

  /// Number of records currently stored in `collection`.
  pub fn len(&self, collection: &str) -> usize {
    self
      .lock()
      .collections
      .get(collection)
      .map(BTreeMap::len)
      .unwrap_or(0)
  }

  pub fn collection_names(&self) -> Vec<String> {
    let mut names: Vec<String> = self.lock().collections.keys().cloned().collect();
    names.sort();
    names
  }

  fn lock(&self) -> std::sync::MutexGuard<'_, State> {
    self.state.lock().unwrap_or_else(PoisonError::into_inner)
  }

  fn generate_id(&self, collection: &str) -> String {
    let n = self.next_id.fetch_add(1, AtomicOrdering::SeqCst) + 1;
    format!("{}-{}", collection, n)
  }

  /// Count the call, simulate latency and pop an injected failure.
  async fn begin(&self, op: Op) -> RecordResult<()> {
    if let Some(latency) = self.latency {
      tokio::time::sleep(latency).await;
    }
    let mut state = self.lock();
    *state.calls.entry(op).or_default() += 1;
    match state.failures.get_mut(&op).and_then(VecDeque::pop_front) {
      Some(err) => {
        debug!(?op, error = %err, "Injected backend failure");
        Err(err)
      }
      None => Ok(()),
    }
  }
}

#[async_trait]
impl RecordAccess for MemoryBackend {
  async fn list(&self, collection: &str, query: &ListQuery) -> RecordResult<Page<Record>> {
    self.begin(Op::List).await?;
    let state = self.lock();
    let rows: Vec<Record> = state
      .collections
      .get(collection)
      .map(|t| t.values().cloned().collect())
      .unwrap_or_default();
    drop(state);

    Ok(run_query(rows, query))
  }

  async fn get_by_id(&self, collection: &str, id: &str) -> RecordResult<Record> {
    self.begin(Op::Get).await?;
    self
      .lock()
      .collections
      .get(collection)
      .and_then(|t| t.get(id))
      .cloned()
      .ok_or_else(|| RecordError::not_found(collection, id))
  }

  async fn create(&self, collection: &str, mut data: Record) -> RecordResult<Record> {
    self.begin(Op::Create).await?;
    let id = match data.get("id").and_then(id_string) {
      Some(id) => id,
      None => self.generate_id(collection),
    };
    let now = Value::String(Utc::now().to_rfc3339());
    data.insert("id".into(), Value::String(id.clone()));
    data.insert("created_at".into(), now.clone());
    data.insert("updated_at".into(), now);

    let mut state = self.lock();
    let table = state.collections.entry(collection.to_string()).or_default();
    if table.contains_key(&id) {
      return Err(RecordError::Validation(format!(
        "duplicate id {} in {}",
        id, collection
      )));
    }
    table.insert(id, data.clone());
    Ok(data)
  }

  async fn update(&self, collection: &str, id: &str, patch: Record) -> RecordResult<Record> {
    self.begin(Op::Update).await?;
    let mut state = self.lock();
    let existing = state
      .collections
      .get_mut(collection)
      .and_then(|t| t.get_mut(id))
      .ok_or_else(|| RecordError::not_found(collection, id))?;

    for (field, value) in patch {
      if field == "id" {
        continue;
      }
      existing.insert(field, value);
    }
    existing.insert(
      "updated_at".into(),
      Value::String(Utc::now().to_rfc3339()),
    );
    Ok(existing.clone())
  }

  async fn delete(&self, collection: &str, id: &str) -> RecordResult<()> {
    self.begin(Op::Delete).await?;
    self
      .lock()
      .collections
      .get_mut(collection)
      .and_then(|t| t.remove(id))
      .map(|_| ())
      .ok_or_else(|| RecordError::not_found(collection, id))
  }

  async fn upload_file(
    &self,
    bucket: &str,
    name: Option<&str>,
    bytes: Vec<u8>,
  ) -> RecordResult<StoredFile> {
    self.begin(Op::Upload).await?;
    if bytes.is_empty() {
      return Err(RecordError::Validation("empty upload".into()));
    }
    let path = match name {
      Some(n) => n.to_string(),
      None => format!("{}-{}", Utc::now().timestamp_millis(), self.generate_id("file")),
    };
    Ok(StoredFile {
      url: format!("memory://{}/{}", bucket, path),
      path,
    })
  }
}

fn id_string(v: &Value) -> Option<String> {
  match v {
    Value::String(s) if !s.is_empty() => Some(s.clone()),
    Value::Number(n) => Some(n.to_string()),
    _ => None,
  }
}

/// Apply filters, search, sort and pagination to `rows`.
fn run_query(mut rows: Vec<Record>, query: &ListQuery) -> Page<Record> {
  rows.retain(|row| {
    query
      .filters
      .iter()
      .all(|(field, want)| matches_filter(row.get(field), want))
  });

  if let Some(term) = query.search.as_deref().filter(|t| !t.is_empty()) {
    let term = term.to_lowercase();
    rows.retain(|row| {
      query.search_columns.iter().any(|col| {
        row
          .get(col)
          .map(|v| display_value(v).to_lowercase().contains(&term))
          .unwrap_or(false)
      })
    });
  }

  if let Some(sort) = &query.sort {
    rows.sort_by(|a, b| {
      let ord = compare_values(a.get(sort), b.get(sort));
      match query.order {
        Order::Asc => ord,
        Order::Desc => ord.reverse(),
      }
    });
  }

  let total = rows.len();
  let page = query.page.unwrap_or(1).max(1);
  let page_size = query
    .page_size
    .unwrap_or(DEFAULT_PAGE_SIZE)
    .clamp(1, MAX_PAGE_SIZE);
  let from = ((page - 1) as usize).saturating_mul(page_size as usize);
  let items: Vec<Record> = rows.into_iter().skip(from).take(page_size as usize).collect();

  Page {
    items,
    total,
    page,
    page_size,
    has_next: (page as usize) * (page_size as usize) < total,
    has_previous: page > 1,
  }
}

fn matches_filter(field: Option<&Value>, want: &FilterValue) -> bool {
  let field = match field {
    Some(v) => v,
    None => return false,
  };
  match want {
    FilterValue::Bool(b) => field.as_bool() == Some(*b),
    FilterValue::Int(n) => field.as_i64() == Some(*n),
    FilterValue::Text(t) if t.is_empty() => true,
    FilterValue::Text(t) if t.contains('*') => glob_match(t, &display_value(field)),
    FilterValue::Text(t) => match field {
      Value::String(s) => s == t,
      other => display_value(other) == *t,
    },
    FilterValue::AnyOf(options) => options.iter().any(|o| matches_filter(Some(field), o)),
  }
}

fn display_value(v: &Value) -> String {
  match v {
    Value::String(s) => s.clone(),
    other => other.to_string(),
  }
}

/// Case-insensitive match where `*` stands for any run of characters.
fn glob_match(pattern: &str, text: &str) -> bool {
  let pattern = pattern.to_lowercase();
  let text = text.to_lowercase();
  let parts: Vec<&str> = pattern.split('*').collect();

  let mut rest = text.as_str();
  for (i, part) in parts.iter().enumerate() {
    if part.is_empty() {
      continue;
    }
    if i == 0 {
      match rest.strip_prefix(part) {
        Some(r) => rest = r,
        None => return false,
      }
    } else if i == parts.len() - 1 {
      return rest.ends_with(part);
    } else {
      match rest.find(part) {
        Some(pos) => rest = &rest[pos + part.len()..],
        None => return false,
      }
    }
  }
  true
}

fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
  match (a, b) {
    (None, None) => Ordering::Equal,
    (None, Some(_)) => Ordering::Less,
    (Some(_), None) => Ordering::Greater,
    (Some(a), Some(b)) => match (a, b) {
      (Value::Number(x), Value::Number(y)) => x
        .as_f64()
        .partial_cmp(&y.as_f64())
        .unwrap_or(Ordering::Equal),
      (Value::String(x), Value::String(y)) => x.cmp(y),
      (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
      (Value::Null, Value::Null) => Ordering::Equal,
      (Value::Null, _) => Ordering::Less,
      (_, Value::Null) => Ordering::Greater,
      (x, y) => display_value(x).cmp(&display_value(y)),
    },
  }
}
