//! Error types shared by the record layer and the cache.

use std::fmt;
use thiserror::Error;

/// Result type alias for record access calls
pub type RecordResult<T> = Result<T, RecordError>;

/// Classification of a record access failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
  NotFound,
  Unauthorized,
  Validation,
  Transient,
  Unknown,
}

impl fmt::Display for ErrorKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      ErrorKind::NotFound => "NOT_FOUND",
      ErrorKind::Unauthorized => "UNAUTHORIZED",
      ErrorKind::Validation => "VALIDATION_ERROR",
      ErrorKind::Transient => "TRANSIENT_ERROR",
      ErrorKind::Unknown => "UNKNOWN_ERROR",
    };
    f.write_str(s)
  }
}

/// Errors returned by a [`RecordAccess`](crate::record::RecordAccess) backend.
///
/// `Clone` so a single failed load can be handed to every waiter of a
/// coalesced fetch.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RecordError {
  #[error("Record not found: {0}")]
  NotFound(String),

  #[error("Unauthorized access: {0}")]
  Unauthorized(String),

  #[error("Invalid data provided: {0}")]
  Validation(String),

  #[error("Temporary backend failure: {0}")]
  Transient(String),

  #[error("Unknown error: {0}")]
  Unknown(String),
}

impl RecordError {
  pub fn kind(&self) -> ErrorKind {
    match self {
      RecordError::NotFound(_) => ErrorKind::NotFound,
      RecordError::Unauthorized(_) => ErrorKind::Unauthorized,
      RecordError::Validation(_) => ErrorKind::Validation,
      RecordError::Transient(_) => ErrorKind::Transient,
      RecordError::Unknown(_) => ErrorKind::Unknown,
    }
  }

  /// Whether the record layer may retry this failure.
  pub fn is_retryable(&self) -> bool {
    self.kind() == ErrorKind::Transient
  }

  pub fn not_found(collection: &str, id: &str) -> Self {
    RecordError::NotFound(format!("{}/{}", collection, id))
  }
}

/// Errors surfaced by cache reads and optimistic mutations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
  /// The loader or remote write failed
  #[error(transparent)]
  Record(#[from] RecordError),

  /// A cached value did not have the shape the caller asked for
  #[error("Failed to decode cached value for {key}: {message}")]
  Decode { key: String, message: String },
}

impl CacheError {
  /// Classification of the underlying record failure, if any.
  pub fn kind(&self) -> ErrorKind {
    match self {
      CacheError::Record(e) => e.kind(),
      CacheError::Decode { .. } => ErrorKind::Unknown,
    }
  }
}
