//! Music team domain: record types, the key registry, the backend client and
//! its cached wrapper.

pub mod cached_client;
pub mod client;
pub mod fanout;
pub mod keys;
pub mod types;

pub use cached_client::CachedMusicClient;
pub use client::MusicClient;
pub use fanout::{Change, ChangeKind};
