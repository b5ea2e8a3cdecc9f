use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use url::Url;

use swcache::cache::{CacheStorage, Caches, MemoryStorage, SqliteStorage};
use swcache::config::Config;
use swcache::net::{HttpFetcher, Request};
use swcache::worker::{OfflineCacheManager, Registration};

#[derive(Parser, Debug)]
#[command(name = "swcache")]
#[command(about = "Offline stale-while-revalidate cache for a static site")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/swcache/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Cache database path
  #[arg(long, conflicts_with = "ephemeral")]
  db: Option<PathBuf>,

  /// Keep the cache in memory for this run only
  #[arg(long)]
  ephemeral: bool,

  /// Site origin for the precache manifest
  #[arg(short, long)]
  origin: Option<String>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Run URLs through the cache manager
  Fetch {
    #[arg(required = true)]
    urls: Vec<String>,
    /// Print response bodies
    #[arg(long)]
    body: bool,
  },
  /// Seed the precache manifest now
  Precache,
  /// List cached entries
  List,
  /// Evict one cached URL
  Delete { url: String },
  /// Evict every entry of the store
  Clear,
  /// Print the resolved precache manifest
  Manifest,
  /// List cache store names
  Stores,
}

fn init_logging(log_file: Option<&Path>) -> Result<Option<WorkerGuard>> {
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("swcache=info"));

  let (file_layer, guard) = match log_file {
    Some(path) => {
      let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(Path::new("."));
      let name = path
        .file_name()
        .ok_or_else(|| eyre!("Invalid log file path: {}", path.display()))?;
      std::fs::create_dir_all(dir)
        .map_err(|e| eyre!("Failed to create log directory {}: {}", dir.display(), e))?;

      let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::never(dir, name));
      (Some(fmt::layer().with_writer(writer).with_ansi(false)), Some(guard))
    }
    None => (None, None),
  };

  tracing_subscriber::registry()
    .with(fmt::layer().with_writer(std::io::stderr))
    .with(file_layer)
    .with(filter)
    .init();

  Ok(guard)
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let mut config = Config::load(args.config.as_deref())?;

  // Command line wins over file and environment
  if let Some(origin) = args.origin {
    config.origin = Some(origin);
  }
  if let Some(db) = args.db {
    config.database = Some(db);
  }

  let _guard = init_logging(config.log_file.as_deref())?;

  let fetcher = HttpFetcher::new(config.user_agent.as_deref(), config.timeout())?;

  if args.ephemeral {
    let manager = build_manager(MemoryStorage::new(), fetcher, &config)?;
    run(manager, args.command, &config).await
  } else {
    let storage = SqliteStorage::open(config.database.as_deref())?;
    let manager = build_manager(storage, fetcher, &config)?;
    run(manager, args.command, &config).await
  }
}

fn build_manager<S: CacheStorage>(
  storage: S,
  fetcher: HttpFetcher,
  config: &Config,
) -> Result<OfflineCacheManager<S, HttpFetcher>> {
  Ok(
    OfflineCacheManager::new(Caches::new(storage), fetcher)
      .with_cache_name(&config.cache_name)
      .with_manifest(config.precache.clone())
      .with_origin(config.origin_url()?),
  )
}

async fn run<S: CacheStorage>(
  manager: OfflineCacheManager<S, HttpFetcher>,
  command: Command,
  config: &Config,
) -> Result<()> {
  match command {
    Command::Fetch { urls, body } => fetch_all(&manager, &urls, body).await,
    Command::Precache => {
      let origin = required_origin(config)?;
      let count = manager.precache(&origin).await?;
      println!("precached {} entries into '{}'", count, manager.cache_name());
      Ok(())
    }
    Command::List => {
      let entries = manager.cache()?.entries()?;
      for (key, response) in &entries {
        println!(
          "{:<6} {:<60} {} {:>8}B  {}",
          key.method,
          key.url,
          response.status,
          response.body.len(),
          response.cached_at.format("%Y-%m-%d %H:%M:%S")
        );
      }
      println!("{} entries in '{}'", entries.len(), manager.cache_name());
      Ok(())
    }
    Command::Delete { url } => {
      let removed = manager.cache()?.delete(&Request::get(&url)?)?;
      if removed {
        println!("deleted {}", url);
      } else {
        println!("not cached: {}", url);
      }
      Ok(())
    }
    Command::Clear => {
      manager.cache()?.clear()?;
      println!("cleared '{}'", manager.cache_name());
      Ok(())
    }
    Command::Stores => {
      for name in manager.caches().names()? {
        println!("{}", name);
      }
      Ok(())
    }
    Command::Manifest => {
      let origin = required_origin(config)?;
      for request in manager.manifest().resolve(&origin)? {
        println!("{}", request.url);
      }
      Ok(())
    }
  }
}

fn required_origin(config: &Config) -> Result<Url> {
  config
    .origin_url()?
    .ok_or_else(|| eyre!("No site origin configured. Pass --origin or set SWCACHE_ORIGIN."))
}

/// Install the manager, run every URL through it concurrently, and wait for
/// background cache work before returning.
async fn fetch_all<S: CacheStorage>(
  manager: &OfflineCacheManager<S, HttpFetcher>,
  urls: &[String],
  print_body: bool,
) -> Result<()> {
  let mut registration = Registration::new();
  registration.install(env!("CARGO_PKG_VERSION"), manager);

  let mut events = Vec::with_capacity(urls.len());
  for url in urls {
    events.push(manager.dispatch_fetch(Request::get(url)?)?);
  }

  let mut failures = 0;
  for event in &mut events {
    let url = event.request().url.clone();
    match event.response().await {
      None => println!("{}  passed through", url),
      Some(Ok(result)) => {
        println!(
          "{}  {} {} ({} bytes, {}, {})",
          url,
          result.data.status,
          result.data.status_text,
          result.data.body.len(),
          result.data.header("content-type").unwrap_or("-"),
          result.source
        );
        if print_body {
          let mut stdout = std::io::stdout();
          stdout.write_all(&result.data.body)?;
          writeln!(stdout)?;
        }
      }
      Some(Err(e)) => {
        failures += 1;
        println!("{}  failed: {}", url, e);
      }
    }
  }

  for event in &events {
    event.settled().await;
  }

  if failures > 0 {
    return Err(eyre!("{} of {} requests failed", failures, urls.len()));
  }
  Ok(())
}
