//! Query key registry.
//!
//! Every readable resource gets its key from here, so identical requests
//! always produce equal keys and detail keys sit under their namespace.

use crate::cache::{key_for, ListParams, QueryKey};

pub mod user {
  use super::*;

  pub fn all() -> QueryKey {
    QueryKey::root("user")
  }

  pub fn profile(user_id: &str) -> QueryKey {
    all().child("profile").child(user_id)
  }
}

pub mod artists {
  use super::*;

  pub fn all() -> QueryKey {
    QueryKey::root("artists")
  }

  pub fn lists() -> QueryKey {
    key_for("artists", "list", None)
  }

  pub fn list(params: ListParams) -> QueryKey {
    key_for("artists", "list", Some(params.into()))
  }

  pub fn details() -> QueryKey {
    key_for("artists", "detail", None)
  }

  pub fn detail(id: &str) -> QueryKey {
    key_for("artists", "detail", Some(id.into()))
  }

  /// Kept beside `detail` so invalidating one artist never matches a slug.
  pub fn by_slug(slug: &str) -> QueryKey {
    all().child("slug").child(slug)
  }

  pub fn songs(id: &str) -> QueryKey {
    detail(id).child("songs")
  }

  pub fn events(id: &str) -> QueryKey {
    detail(id).child("events")
  }

  pub fn recent(limit: u32) -> QueryKey {
    all().child("recent").child(u64::from(limit))
  }
}

pub mod songs {
  use super::*;

  pub fn all() -> QueryKey {
    QueryKey::root("songs")
  }

  pub fn lists() -> QueryKey {
    key_for("songs", "list", None)
  }

  pub fn list(params: ListParams) -> QueryKey {
    key_for("songs", "list", Some(params.into()))
  }

  pub fn search(query: &str, params: ListParams) -> QueryKey {
    lists().child("search").child(query.trim()).child(params)
  }

  pub fn by_genre(genre: &str, params: ListParams) -> QueryKey {
    lists().child("genre").child(genre).child(params)
  }

  pub fn by_artist(artist_id: &str, params: ListParams) -> QueryKey {
    lists().child("artist").child(artist_id).child(params)
  }

  pub fn details() -> QueryKey {
    key_for("songs", "detail", None)
  }

  pub fn detail(id: &str) -> QueryKey {
    key_for("songs", "detail", Some(id.into()))
  }

  pub fn recent() -> QueryKey {
    all().child("recent")
  }
}

pub mod playlists {
  use super::*;

  pub fn all() -> QueryKey {
    QueryKey::root("playlists")
  }

  pub fn lists() -> QueryKey {
    key_for("playlists", "list", None)
  }

  pub fn list(params: ListParams) -> QueryKey {
    key_for("playlists", "list", Some(params.into()))
  }

  pub fn details() -> QueryKey {
    key_for("playlists", "detail", None)
  }

  pub fn detail(id: &str) -> QueryKey {
    key_for("playlists", "detail", Some(id.into()))
  }

  pub fn songs(id: &str) -> QueryKey {
    detail(id).child("songs")
  }
}

pub mod dashboard {
  use super::*;

  pub fn all() -> QueryKey {
    QueryKey::root("dashboard")
  }

  pub fn stats() -> QueryKey {
    all().child("stats")
  }
}

pub mod calendar {
  use super::*;

  pub fn all() -> QueryKey {
    QueryKey::root("calendar")
  }

  pub fn events(params: ListParams) -> QueryKey {
    all().child("events").child(params)
  }

  pub fn event(id: &str) -> QueryKey {
    all().child("event").child(id)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::record::Order;

  #[test]
  fn test_song_list_key_shape() {
    assert_eq!(
      songs::list(ListParams::new()).to_string(),
      r#"["songs","list",{}]"#
    );
    assert_eq!(
      artists::songs("A1").to_string(),
      r#"["artists","detail","A1","songs"]"#
    );
  }

  #[test]
  fn test_same_request_same_key() {
    let a = songs::list(ListParams::new().sort("title", Order::Asc).filter("genre", "pop"));
    let b = songs::list(ListParams::new().filter("genre", "pop").sort("title", Order::Asc));
    assert_eq!(a, b);
  }

  #[test]
  fn test_relations_nest_under_detail() {
    assert!(artists::songs("A1").starts_with(&artists::detail("A1")));
    assert!(artists::events("A1").starts_with(&artists::details()));
    assert!(playlists::songs("P1").starts_with(&playlists::all()));
    assert!(songs::by_artist("A1", ListParams::new()).starts_with(&songs::lists()));
    assert!(calendar::event("E1").starts_with(&calendar::all()));
    assert!(!songs::detail("S1").starts_with(&songs::lists()));
  }

  #[test]
  fn test_slug_keys_sit_beside_details() {
    assert_eq!(artists::by_slug("nova").to_string(), r#"["artists","slug","nova"]"#);
    assert!(!artists::by_slug("nova").starts_with(&artists::detail("slug")));
    assert!(!artists::by_slug("nova").starts_with(&artists::details()));
    assert!(artists::by_slug("nova").starts_with(&artists::all()));
  }
}
