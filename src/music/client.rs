//! Typed access to the music collections.

use serde::{de::DeserializeOwned, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::cache::ListParams;
use crate::error::{RecordError, RecordResult};
use crate::record::memory::MAX_PAGE_SIZE;
use crate::record::{FilterValue, ListQuery, Order, Page, Record, RecordAccess};

use super::types::{
  Artist, ArtistPatch, CalendarEvent, DashboardStats, EventPatch, NewArtist, NewEvent,
  NewPlaylist, NewSong, Playlist, PlaylistEntry, PlaylistPatch, PlaylistTrack, ProfilePatch,
  Song, SongPatch, UserProfile,
};

pub const USER_PROFILES: &str = "user_profiles";
pub const ARTISTS: &str = "artists";
pub const SONGS: &str = "songs";
pub const PLAYLISTS: &str = "playlists";
pub const PLAYLIST_SONGS: &str = "playlist_songs";
pub const CALENDAR_EVENTS: &str = "calendar_events";

const ARTIST_SEARCH: &[&str] = &["name", "bio"];
const SONG_SEARCH: &[&str] = &["title", "genre"];
const PLAYLIST_SEARCH: &[&str] = &["name", "description"];
const EVENT_SEARCH: &[&str] = &["title", "location"];

/// Music service over a record backend
#[derive(Clone)]
pub struct MusicClient {
  records: Arc<dyn RecordAccess>,
}

impl MusicClient {
  pub fn new(records: Arc<dyn RecordAccess>) -> Self {
    Self { records }
  }

  // ==========================================================================
  // Artists
  // ==========================================================================

  pub async fn list_artists(&self, params: &ListParams) -> RecordResult<Page<Artist>> {
    let query = params.to_list_query(ARTIST_SEARCH, Some(("name", Order::Asc)));
    self.list(ARTISTS, &query).await
  }

  pub async fn get_artist(&self, id: &str) -> RecordResult<Artist> {
    self.get(ARTISTS, id).await
  }

  /// Look an artist up by its URL slug
  pub async fn get_artist_by_slug(&self, slug: &str) -> RecordResult<Artist> {
    let query = ListParams::new()
      .filter("slug", slug)
      .page(1, 1)
      .to_list_query(&[], None);
    let page: Page<Artist> = self.list(ARTISTS, &query).await?;
    page
      .items
      .into_iter()
      .next()
      .ok_or_else(|| RecordError::NotFound(format!("artists/slug/{}", slug)))
  }

  pub async fn create_artist(&self, artist: &NewArtist) -> RecordResult<Artist> {
    self.create(ARTISTS, artist).await
  }

  pub async fn update_artist(&self, id: &str, patch: &ArtistPatch) -> RecordResult<Artist> {
    self.update(ARTISTS, id, patch).await
  }

  pub async fn delete_artist(&self, id: &str) -> RecordResult<()> {
    self.records.delete(ARTISTS, id).await
  }

  pub async fn artist_songs(&self, artist_id: &str, params: &ListParams) -> RecordResult<Page<Song>> {
    let query = params
      .clone()
      .filter("artist_id", artist_id)
      .to_list_query(SONG_SEARCH, Some(("created_at", Order::Desc)));
    self.list(SONGS, &query).await
  }

  pub async fn artist_events(
    &self,
    artist_id: &str,
    params: &ListParams,
  ) -> RecordResult<Page<CalendarEvent>> {
    let query = params
      .clone()
      .filter("artist_id", artist_id)
      .to_list_query(EVENT_SEARCH, Some(("starts_at", Order::Asc)));
    self.list(CALENDAR_EVENTS, &query).await
  }

  /// Most recently touched artists
  pub async fn recent_artists(&self, limit: u32) -> RecordResult<Vec<Artist>> {
    let query = ListParams::new()
      .sort("updated_at", Order::Desc)
      .page(1, limit)
      .to_list_query(&[], None);
    let page: Page<Artist> = self.list(ARTISTS, &query).await?;
    Ok(page.items)
  }

  // ==========================================================================
  // Songs
  // ==========================================================================

  pub async fn list_songs(&self, params: &ListParams) -> RecordResult<Page<Song>> {
    let query = params.to_list_query(SONG_SEARCH, Some(("created_at", Order::Desc)));
    self.list(SONGS, &query).await
  }

  pub async fn get_song(&self, id: &str) -> RecordResult<Song> {
    self.get(SONGS, id).await
  }

  pub async fn create_song(&self, song: &NewSong) -> RecordResult<Song> {
    self.create(SONGS, song).await
  }

  pub async fn update_song(&self, id: &str, patch: &SongPatch) -> RecordResult<Song> {
    self.update(SONGS, id, patch).await
  }

  pub async fn delete_song(&self, id: &str) -> RecordResult<()> {
    self.records.delete(SONGS, id).await
  }

  pub async fn recent_songs(&self, limit: u32) -> RecordResult<Vec<Song>> {
    let query = ListParams::new()
      .sort("created_at", Order::Desc)
      .page(1, limit)
      .to_list_query(&[], None);
    let page: Page<Song> = self.list(SONGS, &query).await?;
    Ok(page.items)
  }

  // ==========================================================================
  // Playlists
  // ==========================================================================

  pub async fn list_playlists(&self, params: &ListParams) -> RecordResult<Page<Playlist>> {
    let query = params.to_list_query(PLAYLIST_SEARCH, Some(("updated_at", Order::Desc)));
    self.list(PLAYLISTS, &query).await
  }

  pub async fn get_playlist(&self, id: &str) -> RecordResult<Playlist> {
    self.get(PLAYLISTS, id).await
  }

  /// Create an empty playlist; aggregates start at zero
  pub async fn create_playlist(&self, playlist: &NewPlaylist) -> RecordResult<Playlist> {
    let mut data = to_record(playlist)?;
    data.insert("song_count".into(), json!(0));
    data.insert("total_duration".into(), json!(0));
    let record = self.records.create(PLAYLISTS, data).await?;
    from_record(PLAYLISTS, record)
  }

  pub async fn update_playlist(&self, id: &str, patch: &PlaylistPatch) -> RecordResult<Playlist> {
    self.update(PLAYLISTS, id, patch).await
  }

  pub async fn delete_playlist(&self, id: &str) -> RecordResult<()> {
    self.records.delete(PLAYLISTS, id).await
  }

  /// Entries of a playlist in position order, joined with their songs
  pub async fn playlist_tracks(&self, playlist_id: &str) -> RecordResult<Vec<PlaylistTrack>> {
    let entries = self.playlist_entries(playlist_id).await?;
    if entries.is_empty() {
      return Ok(Vec::new());
    }

    let ids: Vec<FilterValue> = entries
      .iter()
      .map(|e| FilterValue::Text(e.song_id.clone()))
      .collect();
    let query = ListQuery {
      filters: [("id".to_string(), FilterValue::AnyOf(ids))].into_iter().collect(),
      ..ListQuery::default()
    };
    let mut songs: HashMap<String, Song> = self
      .list_all::<Song>(SONGS, query)
      .await?
      .into_iter()
      .map(|s| (s.id.clone(), s))
      .collect();

    Ok(
      entries
        .into_iter()
        .map(|entry| {
          let song = songs.remove(&entry.song_id);
          PlaylistTrack { entry, song }
        })
        .collect(),
    )
  }

  /// Append a song, or insert it at `position` when given
  pub async fn add_song_to_playlist(
    &self,
    playlist_id: &str,
    song_id: &str,
    position: Option<u32>,
  ) -> RecordResult<PlaylistEntry> {
    let position = match position {
      Some(p) => p,
      None => self
        .playlist_entries(playlist_id)
        .await?
        .iter()
        .map(|e| e.position + 1)
        .max()
        .unwrap_or(0),
    };

    let data = json!({
      "playlist_id": playlist_id,
      "song_id": song_id,
      "position": position,
    });
    let record = self.records.create(PLAYLIST_SONGS, object(data)).await?;
    debug!(playlist_id, song_id, position, "Added song to playlist");
    from_record(PLAYLIST_SONGS, record)
  }

  /// Remove every entry of `song_id` from the playlist
  pub async fn remove_song_from_playlist(&self, playlist_id: &str, song_id: &str) -> RecordResult<()> {
    let entries = self.playlist_entries(playlist_id).await?;
    let matching: Vec<&PlaylistEntry> = entries.iter().filter(|e| e.song_id == song_id).collect();
    if matching.is_empty() {
      return Err(RecordError::NotFound(format!(
        "playlists/{}/songs/{}",
        playlist_id, song_id
      )));
    }
    for entry in matching {
      self.records.delete(PLAYLIST_SONGS, &entry.id).await?;
    }
    Ok(())
  }

  /// Rewrite positions so songs appear in the order of `song_ids`
  pub async fn reorder_playlist(
    &self,
    playlist_id: &str,
    song_ids: &[String],
  ) -> RecordResult<Vec<PlaylistEntry>> {
    let entries = self.playlist_entries(playlist_id).await?;
    let mut by_song: HashMap<&str, &PlaylistEntry> =
      entries.iter().map(|e| (e.song_id.as_str(), e)).collect();

    let mut reordered = Vec::with_capacity(song_ids.len());
    for (position, song_id) in song_ids.iter().enumerate() {
      let entry = by_song.remove(song_id.as_str()).ok_or_else(|| {
        RecordError::Validation(format!("song {} is not in playlist {}", song_id, playlist_id))
      })?;
      let position = position as u32;
      if entry.position == position {
        reordered.push(entry.clone());
        continue;
      }
      let record = self
        .records
        .update(PLAYLIST_SONGS, &entry.id, object(json!({ "position": position })))
        .await?;
      reordered.push(from_record(PLAYLIST_SONGS, record)?);
    }
    Ok(reordered)
  }

  /// Recompute `song_count` and `total_duration` and write them back
  pub async fn update_playlist_stats(&self, playlist_id: &str) -> RecordResult<Playlist> {
    let tracks = self.playlist_tracks(playlist_id).await?;
    let song_count = tracks.len() as u32;
    let total_duration: u64 = tracks
      .iter()
      .filter_map(|t| t.song.as_ref())
      .map(|s| u64::from(s.duration))
      .sum();

    debug!(playlist_id, song_count, total_duration, "Recomputed playlist stats");
    let patch = json!({
      "song_count": song_count,
      "total_duration": total_duration,
    });
    let record = self
      .records
      .update(PLAYLISTS, playlist_id, object(patch))
      .await?;
    from_record(PLAYLISTS, record)
  }

  async fn playlist_entries(&self, playlist_id: &str) -> RecordResult<Vec<PlaylistEntry>> {
    let query = ListQuery {
      filters: [("playlist_id".to_string(), FilterValue::from(playlist_id))]
        .into_iter()
        .collect(),
      sort: Some("position".into()),
      order: Order::Asc,
      ..ListQuery::default()
    };
    self.list_all(PLAYLIST_SONGS, query).await
  }

  // ==========================================================================
  // Calendar
  // ==========================================================================

  pub async fn list_events(&self, params: &ListParams) -> RecordResult<Page<CalendarEvent>> {
    let query = params.to_list_query(EVENT_SEARCH, Some(("starts_at", Order::Asc)));
    self.list(CALENDAR_EVENTS, &query).await
  }

  pub async fn get_event(&self, id: &str) -> RecordResult<CalendarEvent> {
    self.get(CALENDAR_EVENTS, id).await
  }

  pub async fn create_event(&self, event: &NewEvent) -> RecordResult<CalendarEvent> {
    self.create(CALENDAR_EVENTS, event).await
  }

  pub async fn update_event(&self, id: &str, patch: &EventPatch) -> RecordResult<CalendarEvent> {
    self.update(CALENDAR_EVENTS, id, patch).await
  }

  pub async fn delete_event(&self, id: &str) -> RecordResult<()> {
    self.records.delete(CALENDAR_EVENTS, id).await
  }

  // ==========================================================================
  // Users and dashboard
  // ==========================================================================

  pub async fn get_profile(&self, user_id: &str) -> RecordResult<UserProfile> {
    self.get(USER_PROFILES, user_id).await
  }

  pub async fn update_profile(&self, user_id: &str, patch: &ProfilePatch) -> RecordResult<UserProfile> {
    self.update(USER_PROFILES, user_id, patch).await
  }

  /// Row counts per collection, read from one-item pages
  pub async fn dashboard_stats(&self) -> RecordResult<DashboardStats> {
    let query = ListQuery {
      page_size: Some(1),
      ..ListQuery::default()
    };
    let (artists, songs, playlists, events) = futures::try_join!(
      self.records.list(ARTISTS, &query),
      self.records.list(SONGS, &query),
      self.records.list(PLAYLISTS, &query),
      self.records.list(CALENDAR_EVENTS, &query),
    )?;
    Ok(DashboardStats {
      artists: artists.total,
      songs: songs.total,
      playlists: playlists.total,
      events: events.total,
    })
  }

  // ==========================================================================
  // Helpers
  // ==========================================================================

  async fn list<T: DeserializeOwned>(&self, collection: &str, query: &ListQuery) -> RecordResult<Page<T>> {
    let page = self.records.list(collection, query).await?;
    page.try_map(|record| from_record(collection, record))
  }

  /// Walk every page of a query
  async fn list_all<T: DeserializeOwned>(&self, collection: &str, mut query: ListQuery) -> RecordResult<Vec<T>> {
    let mut all = Vec::new();
    let mut page = 1u32;
    query.page_size = Some(MAX_PAGE_SIZE);

    loop {
      query.page = Some(page);
      let response: Page<T> = self.list(collection, &query).await?;
      let has_next = response.has_next;
      all.extend(response.items);

      if !has_next {
        break;
      }
      page += 1;
    }

    Ok(all)
  }

  async fn get<T: DeserializeOwned>(&self, collection: &str, id: &str) -> RecordResult<T> {
    let record = self.records.get_by_id(collection, id).await?;
    from_record(collection, record)
  }

  async fn create<T: DeserializeOwned, D: Serialize>(&self, collection: &str, data: &D) -> RecordResult<T> {
    let record = self.records.create(collection, to_record(data)?).await?;
    from_record(collection, record)
  }

  async fn update<T: DeserializeOwned, D: Serialize>(
    &self,
    collection: &str,
    id: &str,
    patch: &D,
  ) -> RecordResult<T> {
    let patch = to_record(patch)?;
    if patch.is_empty() {
      return Err(RecordError::Validation(format!("empty update for {}/{}", collection, id)));
    }
    let record = self.records.update(collection, id, patch).await?;
    from_record(collection, record)
  }
}

/// Serialize a write payload into a record.
pub fn to_record<T: Serialize>(data: &T) -> RecordResult<Record> {
  match serde_json::to_value(data) {
    Ok(Value::Object(map)) => Ok(map),
    Ok(other) => Err(RecordError::Validation(format!(
      "expected an object, got {}",
      other
    ))),
    Err(e) => Err(RecordError::Unknown(format!("Failed to encode record: {}", e))),
  }
}

fn from_record<T: DeserializeOwned>(collection: &str, record: Record) -> RecordResult<T> {
  serde_json::from_value(Value::Object(record))
    .map_err(|e| RecordError::Unknown(format!("Failed to parse {} record: {}", collection, e)))
}

fn object(value: Value) -> Record {
  match value {
    Value::Object(map) => map,
    _ => Record::new(),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::record::MemoryBackend;

  fn record(value: Value) -> Record {
    object(value)
  }

  fn seeded() -> (MemoryBackend, MusicClient) {
    let backend = MemoryBackend::new();
    backend.seed(
      ARTISTS,
      [
        record(json!({"id": "A1", "name": "Nova", "slug": "nova", "updated_at": "2026-01-02"})),
        record(json!({"id": "A2", "name": "Echo", "slug": "echo", "updated_at": "2026-03-01"})),
      ],
    );
    backend.seed(
      SONGS,
      [
        record(json!({"id": "S1", "title": "Intro", "artist_id": "A1", "duration": 90, "created_at": "2026-01-01"})),
        record(json!({"id": "S2", "title": "Bridge", "artist_id": "A1", "duration": 200, "created_at": "2026-02-01"})),
        record(json!({"id": "S3", "title": "Outro", "artist_id": "A2", "duration": 150, "created_at": "2026-03-01"})),
      ],
    );
    backend.seed(
      PLAYLISTS,
      [record(json!({"id": "P1", "name": "Road Trip", "song_count": 0, "total_duration": 0}))],
    );
    let client = MusicClient::new(Arc::new(backend.clone()));
    (backend, client)
  }

  #[tokio::test]
  async fn test_artist_songs_filters_and_sorts_newest_first() {
    let (_, client) = seeded();
    let page = client.artist_songs("A1", &ListParams::new()).await.unwrap();
    let titles: Vec<&str> = page.items.iter().map(|s| s.title.as_str()).collect();
    assert_eq!(titles, vec!["Bridge", "Intro"]);
    assert_eq!(page.total, 2);
  }

  #[tokio::test]
  async fn test_artist_by_slug() {
    let (_, client) = seeded();
    assert_eq!(client.get_artist_by_slug("echo").await.unwrap().id, "A2");
    let err = client.get_artist_by_slug("missing").await.unwrap_err();
    assert!(matches!(err, RecordError::NotFound(_)));
  }

  #[tokio::test]
  async fn test_membership_recomputes_aggregates() {
    let (_, client) = seeded();
    let first = client.add_song_to_playlist("P1", "S1", None).await.unwrap();
    let second = client.add_song_to_playlist("P1", "S2", None).await.unwrap();
    assert_eq!(first.position, 0);
    assert_eq!(second.position, 1);

    let playlist = client.update_playlist_stats("P1").await.unwrap();
    assert_eq!(playlist.song_count, 2);
    assert_eq!(playlist.total_duration, 290);

    client.remove_song_from_playlist("P1", "S1").await.unwrap();
    let playlist = client.update_playlist_stats("P1").await.unwrap();
    assert_eq!(playlist.song_count, 1);
    assert_eq!(playlist.total_duration, 200);
  }

  #[tokio::test]
  async fn test_reorder_and_tracks() {
    let (_, client) = seeded();
    for id in ["S1", "S2", "S3"] {
      client.add_song_to_playlist("P1", id, None).await.unwrap();
    }
    client
      .reorder_playlist("P1", &["S3".to_string(), "S1".to_string(), "S2".to_string()])
      .await
      .unwrap();

    let tracks = client.playlist_tracks("P1").await.unwrap();
    let order: Vec<&str> = tracks.iter().map(|t| t.entry.song_id.as_str()).collect();
    assert_eq!(order, vec!["S3", "S1", "S2"]);
    assert!(tracks.iter().all(|t| t.song.is_some()));

    let err = client
      .reorder_playlist("P1", &["S9".to_string()])
      .await
      .unwrap_err();
    assert!(matches!(err, RecordError::Validation(_)));
  }

  #[tokio::test]
  async fn test_create_playlist_starts_empty() {
    let (_, client) = seeded();
    let playlist = client
      .create_playlist(&NewPlaylist {
        name: "Focus".into(),
        is_public: true,
        ..NewPlaylist::default()
      })
      .await
      .unwrap();
    assert_eq!(playlist.song_count, 0);
    assert_eq!(playlist.total_duration, 0);
    assert!(playlist.created_at.is_some());
  }

  #[tokio::test]
  async fn test_dashboard_counts() {
    let (_, client) = seeded();
    let stats = client.dashboard_stats().await.unwrap();
    assert_eq!(
      stats,
      DashboardStats {
        artists: 2,
        songs: 3,
        playlists: 1,
        events: 0,
      }
    );
  }

  #[tokio::test]
  async fn test_empty_patch_is_rejected() {
    let (backend, client) = seeded();
    let err = client
      .update_song("S1", &SongPatch::default())
      .await
      .unwrap_err();
    assert!(matches!(err, RecordError::Validation(_)));
    assert_eq!(backend.calls(crate::record::memory::Op::Update), 0);
  }
}
