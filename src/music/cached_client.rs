//! Cached music client that wraps MusicClient with transparent caching.

use serde::{de::DeserializeOwned, Serialize};
use serde_json::{json, Value};
use std::future::Future;
use std::sync::Arc;
use tracing::warn;

use crate::cache::{CacheStore, Cacheable, FetchOptions, ListParams, OptimisticMutation, QueryKey};
use crate::config::{CacheConfig, Config};
use crate::error::{CacheError, ErrorKind, RecordResult};
use crate::record::{Page, RecordAccess, Retrying};

use super::client::{to_record, MusicClient};
use super::fanout::{Change, ChangeKind};
use super::keys;
use super::types::{
  Artist, ArtistPatch, CalendarEvent, DashboardStats, EventPatch, NewArtist, NewEvent,
  NewPlaylist, NewSong, Playlist, PlaylistEntry, PlaylistPatch, PlaylistTrack, ProfilePatch,
  Song, SongPatch, UserProfile,
};

const RECENT_SONGS: u32 = 50;

/// Music client with transparent caching support.
///
/// Reads go through the shared [`CacheStore`]; a failed reload serves the
/// previous value when one is resident. Writes update the cache
/// optimistically, roll back when the backend rejects them, and fan out
/// invalidation to related keys once confirmed.
#[derive(Clone)]
pub struct CachedMusicClient {
  inner: MusicClient,
  cache: CacheStore,
  options: CacheConfig,
}

impl CachedMusicClient {
  pub fn new(inner: MusicClient, cache: CacheStore, options: CacheConfig) -> Self {
    Self {
      inner,
      cache,
      options,
    }
  }

  /// Wrap `records` with the configured retry policies and a fresh cache.
  pub fn from_config<A: RecordAccess + 'static>(records: A, config: &Config) -> Self {
    let records = Retrying::new(records, config.retry).with_mutation_policy(config.mutation_retry);
    let inner = MusicClient::new(Arc::new(records));
    let cache = CacheStore::new(config.cache.default);
    Self::new(inner, cache, config.cache)
  }

  pub fn cache(&self) -> &CacheStore {
    &self.cache
  }

  pub fn inner(&self) -> &MusicClient {
    &self.inner
  }

  fn list_options(&self, params: &ListParams, base: FetchOptions) -> FetchOptions {
    if params.search.is_some() {
      self.options.search
    } else {
      base
    }
  }

  // ==========================================================================
  // Artists
  // ==========================================================================

  pub async fn artists(&self, params: &ListParams) -> Result<Page<Artist>, CacheError> {
    let options = self.list_options(params, self.options.lists);
    let params = params.clone();
    self
      .read(keys::artists::list(params.clone()), options, move |c| {
        let params = params.clone();
        async move { c.list_artists(&params).await }
      })
      .await
  }

  pub async fn artist(&self, id: &str) -> Result<Artist, CacheError> {
    let id = id.to_string();
    self
      .read(keys::artists::detail(&id), self.options.details, move |c| {
        let id = id.clone();
        async move { c.get_artist(&id).await }
      })
      .await
  }

  /// Load an artist into the cache ahead of navigation. Errors are dropped.
  pub async fn prefetch_artist(&self, id: &str) {
    let id = id.to_string();
    self
      .warm(keys::artists::detail(&id), self.options.details, move |c| {
        let id = id.clone();
        async move { c.get_artist(&id).await }
      })
      .await
  }

  pub async fn artist_by_slug(&self, slug: &str) -> Result<Artist, CacheError> {
    let slug = slug.to_string();
    self
      .read(keys::artists::by_slug(&slug), self.options.details, move |c| {
        let slug = slug.clone();
        async move { c.get_artist_by_slug(&slug).await }
      })
      .await
  }

  pub async fn artist_songs(&self, artist_id: &str) -> Result<Page<Song>, CacheError> {
    let id = artist_id.to_string();
    self
      .read(keys::artists::songs(&id), self.options.song_lists, move |c| {
        let id = id.clone();
        async move { c.artist_songs(&id, &ListParams::new()).await }
      })
      .await
  }

  pub async fn artist_events(&self, artist_id: &str) -> Result<Page<CalendarEvent>, CacheError> {
    let id = artist_id.to_string();
    self
      .read(keys::artists::events(&id), self.options.lists, move |c| {
        let id = id.clone();
        async move { c.artist_events(&id, &ListParams::new()).await }
      })
      .await
  }

  pub async fn recent_artists(&self, limit: u32) -> Result<Vec<Artist>, CacheError> {
    self
      .read(keys::artists::recent(limit), self.options.recent, move |c| async move {
        c.recent_artists(limit).await
      })
      .await
  }

  pub async fn create_artist(&self, artist: NewArtist) -> Result<Artist, CacheError> {
    let inner = self.inner.clone();
    let change = Change::Artist {
      kind: ChangeKind::Created,
      id: String::new(),
    };
    let result = OptimisticMutation::new(&self.cache, "create artist")
      .on_commit(|store, artist: &Artist| write(store, artist))
      .invalidate_all_on_commit(change.prefixes())
      .run(async move { inner.create_artist(&artist).await })
      .await;
    self.settle(result)
  }

  pub async fn update_artist(&self, id: &str, patch: ArtistPatch) -> Result<Artist, CacheError> {
    let fields = payload(&patch)?;
    let inner = self.inner.clone();
    let target = id.to_string();
    let change = Change::Artist {
      kind: ChangeKind::Updated,
      id: id.to_string(),
    };
    let result = OptimisticMutation::new(&self.cache, "update artist")
      .patch(keys::artists::detail(id), merged(fields.clone()))
      .patch_matching(keys::artists::lists(), page_item_patched(id, fields))
      .on_commit(|store, artist: &Artist| write(store, artist))
      .invalidate_all_on_commit(change.prefixes())
      .run(async move { inner.update_artist(&target, &patch).await })
      .await;
    self.settle(result)
  }

  pub async fn delete_artist(&self, id: &str) -> Result<(), CacheError> {
    let inner = self.inner.clone();
    let target = id.to_string();
    let change = Change::Artist {
      kind: ChangeKind::Deleted,
      id: id.to_string(),
    };
    let result = OptimisticMutation::new(&self.cache, "delete artist")
      .evict(keys::artists::detail(id))
      .patch_matching(keys::artists::lists(), page_item_removed(id))
      .invalidate_all_on_commit(change.prefixes())
      .run(async move { inner.delete_artist(&target).await })
      .await;
    self.settle(result)
  }

  // ==========================================================================
  // Songs
  // ==========================================================================

  pub async fn songs(&self, params: &ListParams) -> Result<Page<Song>, CacheError> {
    let options = self.list_options(params, self.options.song_lists);
    let params = params.clone();
    self
      .read(keys::songs::list(params.clone()), options, move |c| {
        let params = params.clone();
        async move { c.list_songs(&params).await }
      })
      .await
  }

  pub async fn search_songs(&self, query: &str, params: &ListParams) -> Result<Page<Song>, CacheError> {
    let params = params.clone().search(query);
    self
      .read(
        keys::songs::search(query, params.clone()),
        self.options.search,
        move |c| {
          let params = params.clone();
          async move { c.list_songs(&params).await }
        },
      )
      .await
  }

  pub async fn songs_by_genre(&self, genre: &str, params: &ListParams) -> Result<Page<Song>, CacheError> {
    let options = self.list_options(params, self.options.song_lists);
    let key = keys::songs::by_genre(genre, params.clone());
    let params = params.clone().filter("genre", genre);
    self
      .read(key, options, move |c| {
        let params = params.clone();
        async move { c.list_songs(&params).await }
      })
      .await
  }

  pub async fn songs_by_artist(&self, artist_id: &str, params: &ListParams) -> Result<Page<Song>, CacheError> {
    let options = self.list_options(params, self.options.song_lists);
    let key = keys::songs::by_artist(artist_id, params.clone());
    let id = artist_id.to_string();
    let params = params.clone();
    self
      .read(key, options, move |c| {
        let id = id.clone();
        let params = params.clone();
        async move { c.artist_songs(&id, &params).await }
      })
      .await
  }

  pub async fn song(&self, id: &str) -> Result<Song, CacheError> {
    let id = id.to_string();
    self
      .read(keys::songs::detail(&id), self.options.details, move |c| {
        let id = id.clone();
        async move { c.get_song(&id).await }
      })
      .await
  }

  pub async fn prefetch_song(&self, id: &str) {
    let id = id.to_string();
    self
      .warm(keys::songs::detail(&id), self.options.details, move |c| {
        let id = id.clone();
        async move { c.get_song(&id).await }
      })
      .await
  }

  pub async fn recent_songs(&self) -> Result<Vec<Song>, CacheError> {
    self
      .read(keys::songs::recent(), self.options.recent, |c| async move {
        c.recent_songs(RECENT_SONGS).await
      })
      .await
  }

  pub async fn create_song(&self, song: NewSong) -> Result<Song, CacheError> {
    let inner = self.inner.clone();
    let change = Change::song(ChangeKind::Created, song.artist_id.clone());
    let result = OptimisticMutation::new(&self.cache, "create song")
      .on_commit(|store, song: &Song| write(store, song))
      .invalidate_all_on_commit(change.prefixes())
      .run(async move { inner.create_song(&song).await })
      .await;
    self.settle(result)
  }

  pub async fn update_song(&self, id: &str, patch: SongPatch) -> Result<Song, CacheError> {
    let fields = payload(&patch)?;
    let previous_artist = self.cached_song_artist(id);
    let change = Change::song(
      ChangeKind::Updated,
      previous_artist.into_iter().chain(patch.artist_id.clone()),
    );
    let inner = self.inner.clone();
    let target = id.to_string();
    let result = OptimisticMutation::new(&self.cache, "update song")
      .patch(keys::songs::detail(id), merged(fields.clone()))
      .patch_matching(keys::songs::lists(), page_item_patched(id, fields))
      .on_commit(|store, song: &Song| write(store, song))
      .invalidate_all_on_commit(change.prefixes())
      .run(async move { inner.update_song(&target, &patch).await })
      .await;
    self.settle(result)
  }

  pub async fn delete_song(&self, id: &str) -> Result<(), CacheError> {
    // The cached detail is the only place the artist is known once deleted
    let change = Change::song(ChangeKind::Deleted, self.cached_song_artist(id));
    let inner = self.inner.clone();
    let target = id.to_string();
    let result = OptimisticMutation::new(&self.cache, "delete song")
      .evict(keys::songs::detail(id))
      .patch_matching(keys::songs::lists(), page_item_removed(id))
      .invalidate_all_on_commit(change.prefixes())
      .run(async move { inner.delete_song(&target).await })
      .await;
    self.settle(result)
  }

  fn cached_song_artist(&self, id: &str) -> Option<String> {
    self
      .cache
      .get_data::<Song>(&keys::songs::detail(id))
      .ok()
      .flatten()
      .and_then(|s| s.artist_id)
  }

  // ==========================================================================
  // Playlists
  // ==========================================================================

  pub async fn playlists(&self, params: &ListParams) -> Result<Page<Playlist>, CacheError> {
    let options = self.list_options(params, self.options.lists);
    let params = params.clone();
    self
      .read(keys::playlists::list(params.clone()), options, move |c| {
        let params = params.clone();
        async move { c.list_playlists(&params).await }
      })
      .await
  }

  pub async fn playlist(&self, id: &str) -> Result<Playlist, CacheError> {
    let id = id.to_string();
    self
      .read(keys::playlists::detail(&id), self.options.details, move |c| {
        let id = id.clone();
        async move { c.get_playlist(&id).await }
      })
      .await
  }

  pub async fn prefetch_playlist(&self, id: &str) {
    let id = id.to_string();
    self
      .warm(keys::playlists::detail(&id), self.options.details, move |c| {
        let id = id.clone();
        async move { c.get_playlist(&id).await }
      })
      .await
  }

  pub async fn playlist_tracks(&self, id: &str) -> Result<Vec<PlaylistTrack>, CacheError> {
    let id = id.to_string();
    self
      .read(keys::playlists::songs(&id), self.options.details, move |c| {
        let id = id.clone();
        async move { c.playlist_tracks(&id).await }
      })
      .await
  }

  pub async fn create_playlist(&self, playlist: NewPlaylist) -> Result<Playlist, CacheError> {
    let inner = self.inner.clone();
    let change = Change::Playlist {
      kind: ChangeKind::Created,
      id: String::new(),
    };
    let result = OptimisticMutation::new(&self.cache, "create playlist")
      .on_commit(|store, playlist: &Playlist| write(store, playlist))
      .invalidate_all_on_commit(change.prefixes())
      .run(async move { inner.create_playlist(&playlist).await })
      .await;
    self.settle(result)
  }

  pub async fn update_playlist(&self, id: &str, patch: PlaylistPatch) -> Result<Playlist, CacheError> {
    let fields = payload(&patch)?;
    let inner = self.inner.clone();
    let target = id.to_string();
    let change = Change::Playlist {
      kind: ChangeKind::Updated,
      id: id.to_string(),
    };
    let result = OptimisticMutation::new(&self.cache, "update playlist")
      .patch(keys::playlists::detail(id), merged(fields.clone()))
      .patch_matching(keys::playlists::lists(), page_item_patched(id, fields))
      .on_commit(|store, playlist: &Playlist| write(store, playlist))
      .invalidate_all_on_commit(change.prefixes())
      .run(async move { inner.update_playlist(&target, &patch).await })
      .await;
    self.settle(result)
  }

  pub async fn delete_playlist(&self, id: &str) -> Result<(), CacheError> {
    let inner = self.inner.clone();
    let target = id.to_string();
    let change = Change::Playlist {
      kind: ChangeKind::Deleted,
      id: id.to_string(),
    };
    let result = OptimisticMutation::new(&self.cache, "delete playlist")
      .evict(keys::playlists::detail(id))
      .evict(keys::playlists::songs(id))
      .patch_matching(keys::playlists::lists(), page_item_removed(id))
      .invalidate_all_on_commit(change.prefixes())
      .run(async move { inner.delete_playlist(&target).await })
      .await;
    self.settle(result)
  }

  /// Append a song. Aggregates are adjusted right away and recomputed by the
  /// backend before the playlist keys are invalidated.
  pub async fn add_song_to_playlist(&self, playlist_id: &str, song_id: &str) -> Result<Playlist, CacheError> {
    let duration = self.cached_song_duration(song_id);
    let inner = self.inner.clone();
    let (pid, sid) = (playlist_id.to_string(), song_id.to_string());
    let change = Change::Membership {
      playlist_id: playlist_id.to_string(),
    };
    let result = OptimisticMutation::new(&self.cache, "add song to playlist")
      .patch(keys::playlists::detail(playlist_id), aggregates_adjusted(1, duration))
      .on_commit(|store, playlist: &Playlist| write(store, playlist))
      .invalidate_all_on_commit(change.prefixes())
      .run(async move {
        inner.add_song_to_playlist(&pid, &sid, None).await?;
        inner.update_playlist_stats(&pid).await
      })
      .await;
    self.settle(result)
  }

  pub async fn remove_song_from_playlist(
    &self,
    playlist_id: &str,
    song_id: &str,
  ) -> Result<Playlist, CacheError> {
    let duration = self.cached_song_duration(song_id);
    let inner = self.inner.clone();
    let (pid, sid) = (playlist_id.to_string(), song_id.to_string());
    let change = Change::Membership {
      playlist_id: playlist_id.to_string(),
    };
    let result = OptimisticMutation::new(&self.cache, "remove song from playlist")
      .patch(keys::playlists::detail(playlist_id), aggregates_adjusted(-1, -duration))
      .patch(keys::playlists::songs(playlist_id), track_removed(song_id))
      .on_commit(|store, playlist: &Playlist| write(store, playlist))
      .invalidate_all_on_commit(change.prefixes())
      .run(async move {
        inner.remove_song_from_playlist(&pid, &sid).await?;
        inner.update_playlist_stats(&pid).await
      })
      .await;
    self.settle(result)
  }

  pub async fn reorder_playlist(
    &self,
    playlist_id: &str,
    song_ids: Vec<String>,
  ) -> Result<Vec<PlaylistEntry>, CacheError> {
    let inner = self.inner.clone();
    let pid = playlist_id.to_string();
    let change = Change::Membership {
      playlist_id: playlist_id.to_string(),
    };
    let result = OptimisticMutation::new(&self.cache, "reorder playlist")
      .patch(keys::playlists::songs(playlist_id), tracks_reordered(song_ids.clone()))
      .invalidate_all_on_commit(change.prefixes())
      .run(async move { inner.reorder_playlist(&pid, &song_ids).await })
      .await;
    self.settle(result)
  }

  fn cached_song_duration(&self, song_id: &str) -> i64 {
    self
      .cache
      .get_data::<Song>(&keys::songs::detail(song_id))
      .ok()
      .flatten()
      .map(|s| i64::from(s.duration))
      .unwrap_or(0)
  }

  // ==========================================================================
  // Calendar
  // ==========================================================================

  pub async fn events(&self, params: &ListParams) -> Result<Page<CalendarEvent>, CacheError> {
    let options = self.list_options(params, self.options.lists);
    let params = params.clone();
    self
      .read(keys::calendar::events(params.clone()), options, move |c| {
        let params = params.clone();
        async move { c.list_events(&params).await }
      })
      .await
  }

  pub async fn event(&self, id: &str) -> Result<CalendarEvent, CacheError> {
    let id = id.to_string();
    self
      .read(keys::calendar::event(&id), self.options.details, move |c| {
        let id = id.clone();
        async move { c.get_event(&id).await }
      })
      .await
  }

  pub async fn create_event(&self, event: NewEvent) -> Result<CalendarEvent, CacheError> {
    let inner = self.inner.clone();
    let change = Change::calendar_event(ChangeKind::Created, event.artist_id.clone());
    let result = OptimisticMutation::new(&self.cache, "create event")
      .on_commit(|store, event: &CalendarEvent| write(store, event))
      .invalidate_all_on_commit(change.prefixes())
      .run(async move { inner.create_event(&event).await })
      .await;
    self.settle(result)
  }

  pub async fn update_event(&self, id: &str, patch: EventPatch) -> Result<CalendarEvent, CacheError> {
    let fields = payload(&patch)?;
    let previous_artist = self
      .cache
      .get_data::<CalendarEvent>(&keys::calendar::event(id))
      .ok()
      .flatten()
      .and_then(|e| e.artist_id);
    let change = Change::calendar_event(
      ChangeKind::Updated,
      previous_artist.into_iter().chain(patch.artist_id.clone()),
    );
    let inner = self.inner.clone();
    let target = id.to_string();
    let result = OptimisticMutation::new(&self.cache, "update event")
      .patch(keys::calendar::event(id), merged(fields))
      .on_commit(|store, event: &CalendarEvent| write(store, event))
      .invalidate_all_on_commit(change.prefixes())
      .run(async move { inner.update_event(&target, &patch).await })
      .await;
    self.settle(result)
  }

  pub async fn delete_event(&self, id: &str) -> Result<(), CacheError> {
    let previous_artist = self
      .cache
      .get_data::<CalendarEvent>(&keys::calendar::event(id))
      .ok()
      .flatten()
      .and_then(|e| e.artist_id);
    let change = Change::calendar_event(ChangeKind::Deleted, previous_artist);
    let inner = self.inner.clone();
    let target = id.to_string();
    let result = OptimisticMutation::new(&self.cache, "delete event")
      .evict(keys::calendar::event(id))
      .invalidate_all_on_commit(change.prefixes())
      .run(async move { inner.delete_event(&target).await })
      .await;
    self.settle(result)
  }

  // ==========================================================================
  // Users and dashboard
  // ==========================================================================

  pub async fn profile(&self, user_id: &str) -> Result<UserProfile, CacheError> {
    let id = user_id.to_string();
    self
      .read(keys::user::profile(&id), self.options.details, move |c| {
        let id = id.clone();
        async move { c.get_profile(&id).await }
      })
      .await
  }

  pub async fn update_profile(&self, user_id: &str, patch: ProfilePatch) -> Result<UserProfile, CacheError> {
    let fields = payload(&patch)?;
    let inner = self.inner.clone();
    let target = user_id.to_string();
    let change = Change::Profile {
      user_id: user_id.to_string(),
    };
    let result = OptimisticMutation::new(&self.cache, "update profile")
      .patch(keys::user::profile(user_id), merged(fields))
      .on_commit(|store, profile: &UserProfile| write(store, profile))
      .invalidate_all_on_commit(change.prefixes())
      .run(async move { inner.update_profile(&target, &patch).await })
      .await;
    self.settle(result)
  }

  pub async fn dashboard_stats(&self) -> Result<DashboardStats, CacheError> {
    self
      .read(keys::dashboard::stats(), self.options.lists, |c| async move {
        c.dashboard_stats().await
      })
      .await
  }

  // ==========================================================================
  // Helpers
  // ==========================================================================

  /// Cached read; serves the resident value when the reload fails.
  async fn read<T, F, Fut>(&self, key: QueryKey, options: FetchOptions, load: F) -> Result<T, CacheError>
  where
    T: Serialize + DeserializeOwned,
    F: Fn(MusicClient) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = RecordResult<T>> + Send + 'static,
  {
    let inner = self.inner.clone();
    let result = self
      .cache
      .fetch_or_stale(&key, options, move || load(inner.clone()))
      .await
      .map_err(|e| self.check(e))?;

    if let Some(error) = result.error {
      if error.kind() == ErrorKind::Unauthorized {
        return Err(self.check(error));
      }
    }
    Ok(result.data)
  }

  fn settle<T>(&self, result: Result<T, CacheError>) -> Result<T, CacheError> {
    result.map_err(|e| self.check(e))
  }

  async fn warm<T, F, Fut>(&self, key: QueryKey, options: FetchOptions, load: F)
  where
    T: Serialize,
    F: Fn(MusicClient) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = RecordResult<T>> + Send + 'static,
  {
    let inner = self.inner.clone();
    self
      .cache
      .prefetch(&key, options, move || load(inner.clone()))
      .await
  }

  /// A rejected session invalidates everything this client has seen.
  fn check(&self, error: CacheError) -> CacheError {
    if error.kind() == ErrorKind::Unauthorized {
      warn!(error = %error, "Backend rejected credentials, clearing cache");
      self.cache.clear();
    }
    error
  }
}

/// Store the confirmed server copy under its detail key.
fn write<T: Cacheable>(store: &CacheStore, record: &T) {
  let key = record.detail_key();
  if let Err(e) = store.set_data(&key, record) {
    warn!(%key, id = record.cache_id(), error = %e, "Failed to cache server response");
  }
}

/// Serialize a patch payload for speculative merging.
fn payload<T: Serialize>(patch: &T) -> Result<Value, CacheError> {
  Ok(Value::Object(to_record(patch)?))
}

fn merge_fields(target: &mut Value, fields: &Value) -> Option<()> {
  let target = target.as_object_mut()?;
  for (field, value) in fields.as_object()? {
    target.insert(field.clone(), value.clone());
  }
  Some(())
}

/// Overlay `fields` on a cached record.
fn merged(fields: Value) -> impl Fn(&Value) -> Option<Value> + Send + Sync + 'static {
  move |current| {
    let mut next = current.clone();
    merge_fields(&mut next, &fields)?;
    Some(next)
  }
}

/// Overlay `fields` on the item with `id` inside a cached page.
fn page_item_patched(id: &str, fields: Value) -> impl Fn(&Value) -> Option<Value> + Send + Sync + 'static {
  let id = id.to_string();
  move |page| {
    let mut page = page.clone();
    let item = page
      .get_mut("items")?
      .as_array_mut()?
      .iter_mut()
      .find(|item| item["id"] == id.as_str())?;
    merge_fields(item, &fields)?;
    Some(page)
  }
}

/// Drop the item with `id` from a cached page.
fn page_item_removed(id: &str) -> impl Fn(&Value) -> Option<Value> + Send + Sync + 'static {
  let id = id.to_string();
  move |page| {
    let mut page = page.clone();
    let items = page.get_mut("items")?.as_array_mut()?;
    let before = items.len();
    items.retain(|item| item["id"] != id.as_str());
    let removed = before - items.len();
    if removed == 0 {
      return None;
    }

    let fields = page.as_object_mut()?;
    if let Some(total) = fields.get("total").and_then(Value::as_u64) {
      fields.insert("total".into(), json!(total.saturating_sub(removed as u64)));
    }
    Some(page)
  }
}

fn aggregates_adjusted(count: i64, duration: i64) -> impl Fn(&Value) -> Option<Value> + Send + Sync + 'static {
  move |playlist| {
    let mut next = playlist.clone();
    let fields = next.as_object_mut()?;
    let song_count = fields.get("song_count").and_then(Value::as_i64).unwrap_or(0);
    let total = fields.get("total_duration").and_then(Value::as_i64).unwrap_or(0);
    fields.insert("song_count".into(), json!((song_count + count).max(0)));
    fields.insert("total_duration".into(), json!((total + duration).max(0)));
    Some(next)
  }
}

fn track_removed(song_id: &str) -> impl Fn(&Value) -> Option<Value> + Send + Sync + 'static {
  let song_id = song_id.to_string();
  move |tracks| {
    let mut tracks = tracks.as_array()?.clone();
    tracks.retain(|t| t["entry"]["song_id"] != song_id.as_str());
    Some(Value::Array(tracks))
  }
}

/// Order cached tracks like `song_ids`; unknown songs go last.
fn tracks_reordered(song_ids: Vec<String>) -> impl Fn(&Value) -> Option<Value> + Send + Sync + 'static {
  move |tracks| {
    let mut tracks = tracks.as_array()?.clone();
    tracks.sort_by_key(|t| {
      let song_id = t["entry"]["song_id"].as_str();
      song_ids
        .iter()
        .position(|id| Some(id.as_str()) == song_id)
        .unwrap_or(usize::MAX)
    });
    for (position, track) in tracks.iter_mut().enumerate() {
      if let Some(entry) = track.get_mut("entry").and_then(Value::as_object_mut) {
        entry.insert("position".into(), json!(position));
      }
    }
    Some(Value::Array(tracks))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::error::RecordError;
  use crate::record::memory::Op;
  use crate::record::{MemoryBackend, Record};
  use std::time::Duration;

  fn record(value: Value) -> Record {
    match value {
      Value::Object(map) => map,
      _ => Record::new(),
    }
  }

  fn setup() -> (MemoryBackend, CachedMusicClient) {
    let backend = MemoryBackend::new();
    backend.seed(
      "artists",
      [record(json!({"id": "A1", "name": "Nova", "slug": "nova"}))],
    );
    backend.seed(
      "songs",
      [
        record(json!({"id": "S1", "title": "Intro", "artist_id": "A1", "duration": 90})),
        record(json!({"id": "S2", "title": "Bridge", "artist_id": "A1", "duration": 200})),
      ],
    );
    backend.seed(
      "playlists",
      [record(json!({"id": "P1", "name": "Road Trip", "song_count": 0, "total_duration": 0}))],
    );
    backend.seed(
      "user_profiles",
      [record(json!({"id": "U1", "full_name": "Sam"}))],
    );

    let client = CachedMusicClient::new(
      MusicClient::new(Arc::new(backend.clone())),
      CacheStore::new(CacheConfig::default().default),
      CacheConfig::default(),
    );
    (backend, client)
  }

  #[tokio::test(start_paused = true)]
  async fn test_detail_fetch_within_stale_window_hits_cache() {
    let (backend, client) = setup();

    let first = client.song("S1").await.unwrap();
    tokio::time::sleep(Duration::from_secs(60)).await;
    let second = client.song("S1").await.unwrap();

    assert_eq!(first, second);
    assert_eq!(backend.calls(Op::Get), 1);
    assert_eq!(client.cache().stats().hits, 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_configured_client_retries_reads_and_writes_separately() {
    let (backend, _) = setup();
    let client = CachedMusicClient::from_config(backend.clone(), &Config::default());
    for _ in 0..2 {
      backend.fail_next(Op::Get, RecordError::Transient("timeout".into()));
      backend.fail_next(Op::Create, RecordError::Transient("timeout".into()));
    }

    assert_eq!(client.song("S1").await.unwrap().title, "Intro");
    assert_eq!(backend.calls(Op::Get), 3);

    let err = client
      .create_song(NewSong {
        title: "Outro".into(),
        duration: 150,
        ..NewSong::default()
      })
      .await
      .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Transient);
    assert_eq!(backend.calls(Op::Create), 2);
  }

  #[tokio::test(start_paused = true)]
  async fn test_prefetched_details_are_served_from_cache() {
    let (backend, client) = setup();
    client.prefetch_artist("A1").await;
    client.prefetch_song("S1").await;
    client.prefetch_playlist("P1").await;
    client.prefetch_song("missing").await;
    assert_eq!(backend.calls(Op::Get), 4);

    let artist = client.artist("A1").await.unwrap();
    let song = client.song("S1").await.unwrap();
    let playlist = client.playlist("P1").await.unwrap();

    assert_eq!(artist.name, "Nova");
    assert_eq!(song.title, "Intro");
    assert_eq!(playlist.name, "Road Trip");
    assert_eq!(backend.calls(Op::Get), 4);
    assert_eq!(client.cache().stats().hits, 3);
    assert!(client.cache().get(&keys::songs::detail("missing")).is_none());
  }

  #[tokio::test(start_paused = true)]
  async fn test_song_create_fans_out_to_lists_and_artist() {
    let (_, client) = setup();
    client.songs(&ListParams::new()).await.unwrap();
    client.artist_songs("A1").await.unwrap();
    client.artist("A1").await.unwrap();

    let list_key = keys::songs::list(ListParams::new());
    let artist_songs_key = keys::artists::songs("A1");
    assert_eq!(list_key.to_string(), r#"["songs","list",{}]"#);
    assert_eq!(artist_songs_key.to_string(), r#"["artists","detail","A1","songs"]"#);
    assert!(!client.cache().get(&list_key).unwrap().is_stale);

    let song = client
      .create_song(NewSong {
        title: "Outro".into(),
        artist_id: Some("A1".into()),
        duration: 150,
        ..NewSong::default()
      })
      .await
      .unwrap();

    assert!(client.cache().get(&list_key).unwrap().is_stale);
    assert!(client.cache().get(&artist_songs_key).unwrap().is_stale);
    assert!(!client.cache().get(&keys::artists::detail("A1")).unwrap().is_stale);

    let detail = client.cache().get(&keys::songs::detail(&song.id)).unwrap();
    assert_eq!(detail.decode::<Song>().unwrap(), song);

    // Next read reloads and includes the new song
    let songs = client.artist_songs("A1").await.unwrap();
    assert_eq!(songs.total, 3);
  }

  #[tokio::test(start_paused = true)]
  async fn test_playlist_rename_rolls_back_on_validation_error() {
    let (backend, client) = setup();
    client.playlist("P1").await.unwrap();
    client.playlists(&ListParams::new()).await.unwrap();
    let detail_key = keys::playlists::detail("P1");
    let list_key = keys::playlists::list(ListParams::new());
    let detail_before = client.cache().get(&detail_key).unwrap().value;
    let list_before = client.cache().get(&list_key).unwrap().value;

    backend.fail_next(Op::Update, RecordError::Validation("name taken".into()));
    let err = client
      .update_playlist(
        "P1",
        PlaylistPatch {
          name: Some("New Name".into()),
          ..PlaylistPatch::default()
        },
      )
      .await
      .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Validation);
    assert_eq!(client.cache().get(&detail_key).unwrap().value, detail_before);
    assert_eq!(client.cache().get(&list_key).unwrap().value, list_before);
    assert_eq!(client.playlist("P1").await.unwrap().name, "Road Trip");
  }

  #[tokio::test(start_paused = true)]
  async fn test_playlist_rename_commits_server_value() {
    let (_, client) = setup();
    client.playlist("P1").await.unwrap();

    let saved = client
      .update_playlist(
        "P1",
        PlaylistPatch {
          name: Some("Night Drive".into()),
          ..PlaylistPatch::default()
        },
      )
      .await
      .unwrap();

    let cached: Playlist = client
      .cache()
      .get_data(&keys::playlists::detail("P1"))
      .unwrap()
      .unwrap();
    assert_eq!(cached, saved);
    assert!(cached.updated_at.is_some());
  }

  #[tokio::test(start_paused = true)]
  async fn test_membership_writes_recomputed_aggregates() {
    let (backend, client) = setup();
    client.playlist("P1").await.unwrap();
    client.song("S2").await.unwrap();

    let playlist = client.add_song_to_playlist("P1", "S2").await.unwrap();
    assert_eq!(playlist.song_count, 1);
    assert_eq!(playlist.total_duration, 200);

    let snapshot = client.cache().get(&keys::playlists::detail("P1")).unwrap();
    assert_eq!(snapshot.decode::<Playlist>().unwrap(), playlist);
    assert!(snapshot.is_stale);

    let stored = backend.calls(Op::Get);
    assert_eq!(client.playlist("P1").await.unwrap().song_count, 1);
    assert_eq!(backend.calls(Op::Get), stored + 1);

    let tracks = client.playlist_tracks("P1").await.unwrap();
    assert_eq!(tracks.len(), 1);
    assert_eq!(tracks[0].song.as_ref().map(|s| s.duration), Some(200));

    let playlist = client.remove_song_from_playlist("P1", "S2").await.unwrap();
    assert_eq!(playlist.song_count, 0);
    assert_eq!(playlist.total_duration, 0);
    assert!(client.playlist_tracks("P1").await.unwrap().is_empty());
  }

  #[tokio::test(start_paused = true)]
  async fn test_failed_membership_restores_aggregates() {
    let (backend, client) = setup();
    client.playlist("P1").await.unwrap();
    client.song("S1").await.unwrap();

    backend.fail_next(Op::Create, RecordError::Transient("timeout".into()));
    assert!(client.add_song_to_playlist("P1", "S1").await.is_err());

    let cached: Playlist = client
      .cache()
      .get_data(&keys::playlists::detail("P1"))
      .unwrap()
      .unwrap();
    assert_eq!(cached.song_count, 0);
    assert_eq!(cached.total_duration, 0);
  }

  #[tokio::test(start_paused = true)]
  async fn test_delete_song_drops_it_from_cached_lists() {
    let (_, client) = setup();
    client.song("S1").await.unwrap();
    let before = client.songs(&ListParams::new()).await.unwrap();
    assert_eq!(before.total, 2);

    client.delete_song("S1").await.unwrap();

    assert!(client.cache().get(&keys::songs::detail("S1")).is_none());
    let cached: Page<Song> = client
      .cache()
      .get_data(&keys::songs::list(ListParams::new()))
      .unwrap()
      .unwrap();
    assert_eq!(cached.total, 1);
    assert!(cached.items.iter().all(|s| s.id != "S1"));
  }

  #[tokio::test(start_paused = true)]
  async fn test_failed_reload_serves_previous_value() {
    let (backend, client) = setup();
    client.artist("A1").await.unwrap();
    client.cache().invalidate(&keys::artists::all());

    backend.fail_next(Op::Get, RecordError::Transient("offline".into()));
    let artist = client.artist("A1").await.unwrap();
    assert_eq!(artist.name, "Nova");
    assert!(client.cache().get(&keys::artists::detail("A1")).unwrap().is_stale);
  }

  #[tokio::test(start_paused = true)]
  async fn test_unauthorized_clears_cache() {
    let (backend, client) = setup();
    client.artist("A1").await.unwrap();
    client.song("S1").await.unwrap();
    assert_eq!(client.cache().len(), 2);

    backend.fail_next(Op::Get, RecordError::Unauthorized("session expired".into()));
    let err = client.playlist("P1").await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Unauthorized);
    assert!(client.cache().is_empty());
  }

  #[tokio::test(start_paused = true)]
  async fn test_profile_update_is_optimistic() {
    let (_, client) = setup();
    client.profile("U1").await.unwrap();

    let profile = client
      .update_profile(
        "U1",
        ProfilePatch {
          full_name: Some("Sam Rivera".into()),
          ..ProfilePatch::default()
        },
      )
      .await
      .unwrap();

    assert_eq!(profile.full_name.as_deref(), Some("Sam Rivera"));
    let cached: UserProfile = client
      .cache()
      .get_data(&keys::user::profile("U1"))
      .unwrap()
      .unwrap();
    assert_eq!(cached.full_name.as_deref(), Some("Sam Rivera"));
  }
}
