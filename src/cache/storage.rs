//! Cache storage trait with SQLite and in-memory implementations.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::traits::{CachedResponse, RequestKey};

/// Trait for cache storage backends.
///
/// A backend holds any number of named caches. Implementations lock
/// internally, so overlapping request handlers can share one instance.
pub trait CacheStorage: Send + Sync + 'static {
  /// Create the named cache if it does not exist yet.
  fn create_cache(&self, cache: &str) -> Result<()>;

  /// Whether the named cache exists.
  fn has_cache(&self, cache: &str) -> Result<bool>;

  /// Delete a named cache and all of its entries.
  fn delete_cache(&self, cache: &str) -> Result<bool>;

  /// Names of all existing caches, in creation order.
  fn cache_names(&self) -> Result<Vec<String>>;

  /// Look up one entry.
  fn match_entry(&self, cache: &str, key: &RequestKey) -> Result<Option<CachedResponse>>;

  /// Insert or replace entries. Either all of them are stored or none.
  fn put_entries(&self, cache: &str, entries: &[(RequestKey, CachedResponse)]) -> Result<()>;

  /// Remove one entry. Returns whether it existed.
  fn delete_entry(&self, cache: &str, key: &RequestKey) -> Result<bool>;

  /// All entries of a cache, in insertion order.
  fn entries(&self, cache: &str) -> Result<Vec<(RequestKey, CachedResponse)>>;
}

/// SQLite-based cache storage implementation.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open the store at `path`, or at the default location.
  pub fn open(path: Option<&Path>) -> Result<Self> {
    let path = match path {
      Some(p) => p.to_path_buf(),
      None => Self::default_path()?,
    };

    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(&path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::with_connection(conn)
  }

  /// Open a private in-memory database.
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory cache database: {}", e))?;
    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    let storage = Self {
      conn: Mutex::new(conn),
    };
    storage.run_migrations()?;
    Ok(storage)
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("swcache").join("cache.db"))
  }

  fn run_migrations(&self) -> Result<()> {
    let conn = self.lock()?;
    conn
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;
    Ok(())
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
    self.conn.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS caches (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- One row per request identity; INSERT OR REPLACE keeps it that way
CREATE TABLE IF NOT EXISTS entries (
    cache_name TEXT NOT NULL,
    key_hash TEXT NOT NULL,
    method TEXT NOT NULL,
    url TEXT NOT NULL,
    status INTEGER NOT NULL,
    status_text TEXT NOT NULL,
    response_url TEXT NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    cached_at TEXT NOT NULL,
    seq INTEGER NOT NULL,
    PRIMARY KEY (cache_name, key_hash)
);

CREATE INDEX IF NOT EXISTS idx_entries_seq ON entries(cache_name, seq);
"#;

impl CacheStorage for SqliteStorage {
  fn create_cache(&self, cache: &str) -> Result<()> {
    let conn = self.lock()?;
    conn
      .execute(
        "INSERT OR IGNORE INTO caches (name) VALUES (?)",
        params![cache],
      )
      .map_err(|e| eyre!("Failed to create cache '{}': {}", cache, e))?;
    Ok(())
  }

  fn has_cache(&self, cache: &str) -> Result<bool> {
    let conn = self.lock()?;
    let found: Option<i64> = conn
      .query_row(
        "SELECT id FROM caches WHERE name = ?",
        params![cache],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to look up cache '{}': {}", cache, e))?;
    Ok(found.is_some())
  }

  fn delete_cache(&self, cache: &str) -> Result<bool> {
    let mut conn = self.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute("DELETE FROM entries WHERE cache_name = ?", params![cache])
      .map_err(|e| eyre!("Failed to delete entries of '{}': {}", cache, e))?;
    let removed = tx
      .execute("DELETE FROM caches WHERE name = ?", params![cache])
      .map_err(|e| eyre!("Failed to delete cache '{}': {}", cache, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(removed > 0)
  }

  fn cache_names(&self) -> Result<Vec<String>> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare("SELECT name FROM caches ORDER BY id")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list caches: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read cache name: {}", e))?;

    Ok(names)
  }

  fn match_entry(&self, cache: &str, key: &RequestKey) -> Result<Option<CachedResponse>> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare(
        "SELECT status, status_text, response_url, headers, body, cached_at FROM entries
         WHERE cache_name = ? AND key_hash = ?",
      )
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let row = stmt
      .query_row(params![cache, key.cache_hash()], read_row)
      .optional()
      .map_err(|e| eyre!("Failed to look up {}: {}", key, e))?;

    row.map(RawEntry::decode).transpose()
  }

  fn put_entries(&self, cache: &str, entries: &[(RequestKey, CachedResponse)]) -> Result<()> {
    let mut conn = self.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute(
      "INSERT OR IGNORE INTO caches (name) VALUES (?)",
      params![cache],
    )
    .map_err(|e| eyre!("Failed to create cache '{}': {}", cache, e))?;

    for (key, response) in entries {
      let headers = serde_json::to_string(&response.headers)
        .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

      tx.execute(
        "INSERT OR REPLACE INTO entries
           (cache_name, key_hash, method, url, status, status_text, response_url, headers, body, cached_at, seq)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?,
           (SELECT COALESCE(MAX(seq), 0) + 1 FROM entries WHERE cache_name = ?))",
        params![
          cache,
          key.cache_hash(),
          key.method,
          key.url,
          response.status,
          response.status_text,
          response.url,
          headers,
          response.body,
          response.cached_at.to_rfc3339(),
          cache,
        ],
      )
      .map_err(|e| eyre!("Failed to store {}: {}", key, e))?;
    }

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(())
  }

  fn delete_entry(&self, cache: &str, key: &RequestKey) -> Result<bool> {
    let conn = self.lock()?;
    let removed = conn
      .execute(
        "DELETE FROM entries WHERE cache_name = ? AND key_hash = ?",
        params![cache, key.cache_hash()],
      )
      .map_err(|e| eyre!("Failed to delete {}: {}", key, e))?;
    Ok(removed > 0)
  }

  fn entries(&self, cache: &str) -> Result<Vec<(RequestKey, CachedResponse)>> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare(
        "SELECT status, status_text, response_url, headers, body, cached_at, method, url
         FROM entries WHERE cache_name = ? ORDER BY seq",
      )
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let rows = stmt
      .query_map(params![cache], |row| {
        let raw = read_row(row)?;
        let key = RequestKey {
          method: row.get(6)?,
          url: row.get(7)?,
        };
        Ok((key, raw))
      })
      .map_err(|e| eyre!("Failed to query entries: {}", e))?
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(|e| eyre!("Failed to read entry: {}", e))?;

    rows
      .into_iter()
      .map(|(key, raw)| Ok((key, raw.decode()?)))
      .collect()
  }
}

/// Columns of an entry row before decoding.
struct RawEntry {
  status: u16,
  status_text: String,
  url: String,
  headers: String,
  body: Vec<u8>,
  cached_at: String,
}

fn read_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawEntry> {
  Ok(RawEntry {
    status: row.get(0)?,
    status_text: row.get(1)?,
    url: row.get(2)?,
    headers: row.get(3)?,
    body: row.get(4)?,
    cached_at: row.get(5)?,
  })
}

impl RawEntry {
  fn decode(self) -> Result<CachedResponse> {
    let headers = serde_json::from_str(&self.headers)
      .map_err(|e| eyre!("Failed to deserialize headers: {}", e))?;
    Ok(CachedResponse {
      status: self.status,
      status_text: self.status_text,
      url: self.url,
      headers,
      body: self.body,
      cached_at: parse_datetime(&self.cached_at)?,
    })
  }
}

/// Parse an RFC 3339 timestamp as written by `put_entries`.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}

/// Process-local storage. Nothing survives the process.
#[derive(Default)]
pub struct MemoryStorage {
  caches: Mutex<Vec<(String, MemoryCache)>>,
}

#[derive(Default)]
struct MemoryCache {
  entries: HashMap<RequestKey, (u64, CachedResponse)>,
  next_seq: u64,
}

impl MemoryStorage {
  pub fn new() -> Self {
    Self::default()
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, Vec<(String, MemoryCache)>>> {
    self.caches.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

fn find<'a>(caches: &'a [(String, MemoryCache)], name: &str) -> Option<&'a MemoryCache> {
  caches.iter().find(|(n, _)| n == name).map(|(_, c)| c)
}

fn find_or_create<'a>(caches: &'a mut Vec<(String, MemoryCache)>, name: &str) -> &'a mut MemoryCache {
  let index = match caches.iter().position(|(n, _)| n == name) {
    Some(i) => i,
    None => {
      caches.push((name.to_string(), MemoryCache::default()));
      caches.len() - 1
    }
  };
  &mut caches[index].1
}

impl CacheStorage for MemoryStorage {
  fn create_cache(&self, cache: &str) -> Result<()> {
    let mut caches = self.lock()?;
    find_or_create(&mut caches, cache);
    Ok(())
  }

  fn has_cache(&self, cache: &str) -> Result<bool> {
    Ok(find(&self.lock()?, cache).is_some())
  }

  fn delete_cache(&self, cache: &str) -> Result<bool> {
    let mut caches = self.lock()?;
    let before = caches.len();
    caches.retain(|(n, _)| n != cache);
    Ok(caches.len() != before)
  }

  fn cache_names(&self) -> Result<Vec<String>> {
    Ok(self.lock()?.iter().map(|(n, _)| n.clone()).collect())
  }

  fn match_entry(&self, cache: &str, key: &RequestKey) -> Result<Option<CachedResponse>> {
    let caches = self.lock()?;
    Ok(
      find(&caches, cache)
        .and_then(|c| c.entries.get(key))
        .map(|(_, r)| r.clone()),
    )
  }

  fn put_entries(&self, cache: &str, entries: &[(RequestKey, CachedResponse)]) -> Result<()> {
    let mut caches = self.lock()?;
    let target = find_or_create(&mut caches, cache);
    for (key, response) in entries {
      target.next_seq += 1;
      target
        .entries
        .insert(key.clone(), (target.next_seq, response.clone()));
    }
    Ok(())
  }

  fn delete_entry(&self, cache: &str, key: &RequestKey) -> Result<bool> {
    let mut caches = self.lock()?;
    Ok(
      caches
        .iter_mut()
        .find(|(n, _)| n == cache)
        .map(|(_, c)| c.entries.remove(key).is_some())
        .unwrap_or(false),
    )
  }

  fn entries(&self, cache: &str) -> Result<Vec<(RequestKey, CachedResponse)>> {
    let caches = self.lock()?;
    let Some(c) = find(&caches, cache) else {
      return Ok(Vec::new());
    };
    let ordered: BTreeMap<u64, (RequestKey, CachedResponse)> = c
      .entries
      .iter()
      .map(|(k, (seq, r))| (*seq, (k.clone(), r.clone())))
      .collect();
    Ok(ordered.into_values().collect())
  }
}
