//! Remote data cache for a music team's collaboration backend.
//!
//! Reads are keyed by hierarchical [`cache::QueryKey`]s and coalesced in a
//! shared [`cache::CacheStore`]. Writes go through
//! [`cache::OptimisticMutation`], which applies them locally first, rolls
//! back on failure and fans invalidation out to related keys on success.

pub mod cache;
pub mod config;
pub mod error;
pub mod logging;
pub mod music;
pub mod query;
pub mod record;
