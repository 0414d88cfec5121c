//! Remote data cache.
//!
//! This module provides a backend-agnostic query cache that:
//! - Keys results by structured, prefix-nested query keys
//! - Tracks freshness per entry and evicts unobserved entries after a
//!   retention window
//! - Shares one loader call between concurrent requests for the same key
//! - Applies optimistic writes and rolls them back when the backend rejects
//!   them
//! - Serves the previous value when a reload fails

mod entry;
pub mod key;
mod optimistic;
mod store;
mod traits;

pub use entry::{EntrySnapshot, FetchOptions, LoadFuture, Loader};
pub use key::{key_for, KeySegment, ListParams, QueryKey, SortSpec};
pub use optimistic::{MutationState, OptimisticMutation, Updater};
pub use store::{CacheStats, CacheStore, Subscription};
pub(crate) use store::{decode, typed_loader};
pub use traits::{CacheResult, CacheSource, Cacheable};
