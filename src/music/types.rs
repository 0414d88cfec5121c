use serde::{Deserialize, Serialize};

use crate::cache::{Cacheable, QueryKey};

use super::keys;

/// Team member profile
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
  pub id: String,
  #[serde(default)]
  pub email: Option<String>,
  #[serde(default)]
  pub full_name: Option<String>,
  #[serde(default)]
  pub avatar_url: Option<String>,
  #[serde(default)]
  pub updated_at: Option<String>,
}

/// Artist on the roster
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artist {
  pub id: String,
  pub name: String,
  #[serde(default)]
  pub slug: Option<String>,
  #[serde(default)]
  pub genre: Option<String>,
  #[serde(default)]
  pub bio: Option<String>,
  #[serde(default)]
  pub avatar_url: Option<String>,
  #[serde(default)]
  pub created_at: Option<String>,
  #[serde(default)]
  pub updated_at: Option<String>,
}

/// Song, optionally attached to an artist
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Song {
  pub id: String,
  pub title: String,
  #[serde(default)]
  pub artist_id: Option<String>,
  #[serde(default)]
  pub genre: Option<String>,
  /// Length in seconds
  #[serde(default)]
  pub duration: u32,
  #[serde(default)]
  pub cover_url: Option<String>,
  #[serde(default)]
  pub audio_url: Option<String>,
  #[serde(default)]
  pub created_at: Option<String>,
  #[serde(default)]
  pub updated_at: Option<String>,
}

/// Playlist with denormalized aggregates
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Playlist {
  pub id: String,
  pub name: String,
  #[serde(default)]
  pub description: Option<String>,
  #[serde(default)]
  pub cover_url: Option<String>,
  #[serde(default)]
  pub is_public: bool,
  #[serde(default)]
  pub user_id: Option<String>,
  #[serde(default)]
  pub song_count: u32,
  /// Sum of song durations in seconds
  #[serde(default)]
  pub total_duration: u64,
  #[serde(default)]
  pub created_at: Option<String>,
  #[serde(default)]
  pub updated_at: Option<String>,
}

/// Membership row linking a song into a playlist
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaylistEntry {
  pub id: String,
  pub playlist_id: String,
  pub song_id: String,
  pub position: u32,
  #[serde(default)]
  pub created_at: Option<String>,
}

/// Playlist entry joined with its song
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaylistTrack {
  pub entry: PlaylistEntry,
  /// `None` when the song was deleted after being added
  pub song: Option<Song>,
}

/// Calendar event (session, gig, release)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalendarEvent {
  pub id: String,
  pub title: String,
  pub starts_at: String,
  #[serde(default)]
  pub ends_at: Option<String>,
  #[serde(default)]
  pub artist_id: Option<String>,
  #[serde(default)]
  pub location: Option<String>,
  #[serde(default)]
  pub created_at: Option<String>,
  #[serde(default)]
  pub updated_at: Option<String>,
}

/// Counts shown on the dashboard
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DashboardStats {
  pub artists: usize,
  pub songs: usize,
  pub playlists: usize,
  pub events: usize,
}

// ============================================================================
// Write payloads
// ============================================================================

#[derive(Debug, Clone, Default, Serialize)]
pub struct NewArtist {
  pub name: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub slug: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub genre: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub bio: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ArtistPatch {
  #[serde(skip_serializing_if = "Option::is_none")]
  pub name: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub slug: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub genre: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub bio: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub avatar_url: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct NewSong {
  pub title: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub artist_id: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub genre: Option<String>,
  pub duration: u32,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SongPatch {
  #[serde(skip_serializing_if = "Option::is_none")]
  pub title: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub artist_id: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub genre: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub duration: Option<u32>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub cover_url: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub audio_url: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct NewPlaylist {
  pub name: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub description: Option<String>,
  pub is_public: bool,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub user_id: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PlaylistPatch {
  #[serde(skip_serializing_if = "Option::is_none")]
  pub name: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub description: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub is_public: Option<bool>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub cover_url: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct NewEvent {
  pub title: String,
  pub starts_at: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub ends_at: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub artist_id: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub location: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct EventPatch {
  #[serde(skip_serializing_if = "Option::is_none")]
  pub title: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub starts_at: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub ends_at: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub artist_id: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub location: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ProfilePatch {
  #[serde(skip_serializing_if = "Option::is_none")]
  pub full_name: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub avatar_url: Option<String>,
}

// ============================================================================
// Cacheable implementations
// ============================================================================

impl Cacheable for UserProfile {
  fn cache_id(&self) -> &str {
    &self.id
  }

  fn detail_key(&self) -> QueryKey {
    keys::user::profile(&self.id)
  }
}

impl Cacheable for Artist {
  fn cache_id(&self) -> &str {
    &self.id
  }

  fn detail_key(&self) -> QueryKey {
    keys::artists::detail(&self.id)
  }
}

impl Cacheable for Song {
  fn cache_id(&self) -> &str {
    &self.id
  }

  fn detail_key(&self) -> QueryKey {
    keys::songs::detail(&self.id)
  }
}

impl Cacheable for Playlist {
  fn cache_id(&self) -> &str {
    &self.id
  }

  fn detail_key(&self) -> QueryKey {
    keys::playlists::detail(&self.id)
  }
}

impl Cacheable for CalendarEvent {
  fn cache_id(&self) -> &str {
    &self.id
  }

  fn detail_key(&self) -> QueryKey {
    keys::calendar::event(&self.id)
  }
}
