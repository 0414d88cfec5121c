//! Invalidation fan-out.
//!
//! One confirmed change usually affects more than the entity's own entry:
//! lists that contain it, aggregates on the dashboard, relation keys on a
//! parent. This table maps each kind of change to the key prefixes that must
//! be marked stale.

use crate::cache::QueryKey;

use super::keys;

/// What happened to the entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
  Created,
  Updated,
  Deleted,
}

/// A confirmed change, carrying the ids its fan-out depends on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change {
  /// `artist_ids` holds every artist the song belonged to before or after
  /// the change
  Song {
    kind: ChangeKind,
    artist_ids: Vec<String>,
  },
  Artist {
    kind: ChangeKind,
    id: String,
  },
  Playlist {
    kind: ChangeKind,
    id: String,
  },
  /// A song was added to, removed from, or moved within a playlist
  Membership {
    playlist_id: String,
  },
  CalendarEvent {
    kind: ChangeKind,
    artist_ids: Vec<String>,
  },
  Profile {
    user_id: String,
  },
}

impl Change {
  pub fn song(kind: ChangeKind, artist_ids: impl IntoIterator<Item = String>) -> Self {
    Change::Song {
      kind,
      artist_ids: dedup(artist_ids),
    }
  }

  pub fn calendar_event(kind: ChangeKind, artist_ids: impl IntoIterator<Item = String>) -> Self {
    Change::CalendarEvent {
      kind,
      artist_ids: dedup(artist_ids),
    }
  }

  /// Prefixes to mark stale once the change is confirmed.
  pub fn prefixes(&self) -> Vec<QueryKey> {
    match self {
      Change::Song { artist_ids, .. } => {
        let mut prefixes = vec![keys::songs::lists(), keys::songs::recent(), keys::dashboard::all()];
        prefixes.extend(artist_ids.iter().map(|id| keys::artists::songs(id)));
        prefixes
      }
      Change::Artist { .. } => vec![keys::artists::all(), keys::dashboard::all()],
      Change::Playlist { kind, id } => match kind {
        ChangeKind::Created => vec![keys::playlists::lists()],
        ChangeKind::Updated | ChangeKind::Deleted => {
          vec![keys::playlists::lists(), keys::playlists::detail(id)]
        }
      },
      Change::Membership { playlist_id } => vec![
        keys::playlists::detail(playlist_id),
        keys::playlists::songs(playlist_id),
        keys::playlists::lists(),
      ],
      Change::CalendarEvent { artist_ids, .. } => {
        let mut prefixes = vec![keys::calendar::all()];
        prefixes.extend(artist_ids.iter().map(|id| keys::artists::events(id)));
        prefixes
      }
      Change::Profile { user_id } => vec![keys::user::profile(user_id)],
    }
  }
}

fn dedup(ids: impl IntoIterator<Item = String>) -> Vec<String> {
  let mut ids: Vec<String> = ids.into_iter().collect();
  ids.sort();
  ids.dedup();
  ids
}
