use clap::{Parser, Subcommand, ValueEnum};
use color_eyre::{eyre::eyre, Result};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

use setlist::cache::{ListParams, QueryKey};
use setlist::config::Config;
use setlist::music::{keys, CachedMusicClient};
use setlist::record::{MemoryBackend, Record};

#[derive(Parser, Debug)]
#[command(name = "setlist")]
#[command(about = "Query cache with optimistic updates for a music team backend")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/setlist/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Increase log verbosity (-v debug, -vv trace)
  #[arg(short, long, action = clap::ArgAction::Count)]
  verbose: u8,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Print the cache key for an entity and its stable fingerprint
  Key {
    #[arg(value_enum)]
    entity: Entity,
    /// Entity id; omit for the default list key
    id: Option<String>,
  },
  /// Load a JSON seed into an in-memory backend and read it back through
  /// the cache twice
  Replay {
    /// File of the form {"songs": [{...}], "artists": [...]}
    seed: PathBuf,
    /// Simulated round trip per backend call, in milliseconds
    #[arg(long, default_value_t = 0)]
    latency: u64,
  },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Entity {
  Artist,
  Song,
  Playlist,
  Event,
  Profile,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = Config::load(args.config.as_deref())?;
  let _guard = setlist::logging::init(&config.log, args.verbose)?;

  match args.command {
    Command::Key { entity, id } => {
      let key = key_of(entity, id.as_deref())?;
      println!("{}\t{}", key, key.fingerprint());
    }
    Command::Replay { seed, latency } => replay(&config, &seed, latency).await?,
  }

  Ok(())
}

fn key_of(entity: Entity, id: Option<&str>) -> Result<QueryKey> {
  let key = match (entity, id) {
    (Entity::Artist, Some(id)) => keys::artists::detail(id),
    (Entity::Artist, None) => keys::artists::list(ListParams::new()),
    (Entity::Song, Some(id)) => keys::songs::detail(id),
    (Entity::Song, None) => keys::songs::list(ListParams::new()),
    (Entity::Playlist, Some(id)) => keys::playlists::detail(id),
    (Entity::Playlist, None) => keys::playlists::list(ListParams::new()),
    (Entity::Event, Some(id)) => keys::calendar::event(id),
    (Entity::Event, None) => keys::calendar::events(ListParams::new()),
    (Entity::Profile, Some(id)) => keys::user::profile(id),
    (Entity::Profile, None) => return Err(eyre!("A profile key needs a user id")),
  };
  Ok(key)
}

async fn replay(config: &Config, seed: &Path, latency: u64) -> Result<()> {
  let contents = std::fs::read_to_string(seed)
    .map_err(|e| eyre!("Failed to read seed file {}: {}", seed.display(), e))?;
  let collections: BTreeMap<String, Vec<Value>> = serde_json::from_str(&contents)
    .map_err(|e| eyre!("Failed to parse seed file {}: {}", seed.display(), e))?;

  let mut backend = MemoryBackend::new();
  if latency > 0 {
    backend = backend.with_latency(Duration::from_millis(latency));
  }
  for (collection, rows) in collections {
    let records: Vec<Record> = rows
      .into_iter()
      .filter_map(|row| match row {
        Value::Object(record) => Some(record),
        _ => None,
      })
      .collect();
    info!(collection = %collection, count = records.len(), "Seeded collection");
    backend.seed(&collection, records);
  }

  let client = CachedMusicClient::from_config(backend, config);
  for pass in 1..=2 {
    let params = ListParams::new();
    let (artists, songs, playlists, events, stats) = futures::try_join!(
      client.artists(&params),
      client.songs(&params),
      client.playlists(&params),
      client.events(&params),
      client.dashboard_stats(),
    )?;
    println!(
      "pass {}: {} artists, {} songs, {} playlists, {} events (dashboard: {:?})",
      pass, artists.total, songs.total, playlists.total, events.total, stats
    );
  }

  let stats = client.cache().stats();
  println!("{:#?}", stats);
  Ok(())
}
