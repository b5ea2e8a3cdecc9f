use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::worker::{PrecacheManifest, DEFAULT_CACHE_NAME};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
  /// Site origin the precache manifest is resolved against
  pub origin: Option<String>,
  /// Name of the cache store
  pub cache_name: String,
  /// Paths to seed when the network is unreachable
  pub precache: PrecacheManifest,
  /// Cache database (default: $XDG_DATA_HOME/swcache/cache.db)
  pub database: Option<PathBuf>,
  pub user_agent: Option<String>,
  /// Per-request network timeout; unset means wait indefinitely
  pub timeout_secs: Option<u64>,
  /// Also write logs to this file
  pub log_file: Option<PathBuf>,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      origin: None,
      cache_name: DEFAULT_CACHE_NAME.to_string(),
      precache: PrecacheManifest::default(),
      database: None,
      user_agent: None,
      timeout_secs: None,
      log_file: None,
    }
  }
}

impl Config {
  /// Load configuration from file, falling back to defaults.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./swcache.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/swcache/config.yaml
  ///
  /// `SWCACHE_ORIGIN` and `SWCACHE_DB` override the file.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    let config = match path {
      Some(p) => Self::load_from_path(&p)?,
      None => Self::default(),
    };

    config.with_env_overrides().validated()
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("swcache.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("swcache").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents).map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  fn parse(contents: &str) -> Result<Self> {
    // An empty file is valid and means "all defaults"
    if contents.trim().is_empty() {
      return Ok(Self::default());
    }
    serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))
  }

  fn with_env_overrides(mut self) -> Self {
    if let Ok(origin) = std::env::var("SWCACHE_ORIGIN") {
      self.origin = Some(origin);
    }
    if let Ok(db) = std::env::var("SWCACHE_DB") {
      self.database = Some(PathBuf::from(db));
    }
    self
  }

  fn validated(self) -> Result<Self> {
    if self.cache_name.trim().is_empty() {
      return Err(eyre!("cache_name must not be empty"));
    }
    self.origin_url()?;
    Ok(self)
  }

  /// The configured origin as a URL.
  pub fn origin_url(&self) -> Result<Option<Url>> {
    self
      .origin
      .as_deref()
      .map(|o| Url::parse(o).map_err(|e| eyre!("Invalid origin '{}': {}", o, e)))
      .transpose()
  }

  pub fn timeout(&self) -> Option<Duration> {
    self.timeout_secs.map(Duration::from_secs)
  }
}
