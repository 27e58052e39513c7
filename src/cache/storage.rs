//! Cache storage trait and SQLite implementation.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// A stored response snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedEntry {
  /// Hash of the request identity (see `NamespaceManager`)
  pub key: String,
  pub method: String,
  pub url: String,
  pub status: u16,
  pub headers: Vec<(String, String)>,
  pub body: Vec<u8>,
  /// When the entry was written
  pub cached_at: DateTime<Utc>,
}

/// Trait for cache storage backends.
///
/// A backend holds any number of named namespaces, each a map from request key
/// to response snapshot that remembers insertion order.
pub trait CacheStorage: Send + Sync {
  /// Create the namespace if it does not exist.
  fn open(&self, namespace: &str) -> Result<()>;

  /// Names of every existing namespace.
  fn namespaces(&self) -> Result<Vec<String>>;

  /// Delete a namespace and all of its entries. Returns whether it existed.
  fn delete(&self, namespace: &str) -> Result<bool>;

  /// Look up an entry.
  fn get(&self, namespace: &str, key: &str) -> Result<Option<CachedEntry>>;

  /// Insert or overwrite an entry, creating the namespace if needed.
  /// An overwritten entry becomes the most recent one.
  fn put(&self, namespace: &str, entry: &CachedEntry) -> Result<()>;

  /// Remove a single entry. Returns whether it existed.
  fn remove(&self, namespace: &str, key: &str) -> Result<bool>;

  /// Number of entries in a namespace.
  fn count(&self, namespace: &str) -> Result<usize>;

  /// Keep only the `max_entries` most recent entries. Returns how many were evicted.
  fn trim(&self, namespace: &str, max_entries: usize) -> Result<usize>;
}

/// Storage implementation that doesn't cache anything.
/// Used when the cache database is unavailable - every lookup misses.
pub struct NoopStorage;

impl CacheStorage for NoopStorage {
  fn open(&self, _namespace: &str) -> Result<()> {
    Ok(())
  }

  fn namespaces(&self) -> Result<Vec<String>> {
    Ok(Vec::new())
  }

  fn delete(&self, _namespace: &str) -> Result<bool> {
    Ok(false)
  }

  fn get(&self, _namespace: &str, _key: &str) -> Result<Option<CachedEntry>> {
    Ok(None) // Always miss
  }

  fn put(&self, _namespace: &str, _entry: &CachedEntry) -> Result<()> {
    Ok(()) // Discard
  }

  fn remove(&self, _namespace: &str, _key: &str) -> Result<bool> {
    Ok(false)
  }

  fn count(&self, _namespace: &str) -> Result<usize> {
    Ok(0)
  }

  fn trim(&self, _namespace: &str, _max_entries: usize) -> Result<usize> {
    Ok(0)
  }
}

/// SQLite-based cache storage implementation.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open (or create) the cache database at `path`.
  pub fn open(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(path)
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

    Ok(data_dir.join("expense-sw").join("cache.db"))
  }

  /// Run database migrations for cache tables.
  fn run_migrations(&self) -> Result<()> {
    let conn = self.lock()?;

    conn
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(())
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS cache_namespaces (
    name TEXT PRIMARY KEY,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- seq orders entries by insertion; REPLACE on conflict assigns a fresh seq
CREATE TABLE IF NOT EXISTS cache_entries (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    namespace TEXT NOT NULL,
    key_hash TEXT NOT NULL,
    method TEXT NOT NULL,
    url TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    cached_at TEXT NOT NULL,
    UNIQUE (namespace, key_hash)
);

CREATE INDEX IF NOT EXISTS idx_cache_entries_namespace
    ON cache_entries(namespace, seq);
"#;

impl CacheStorage for SqliteStorage {
  fn open(&self, namespace: &str) -> Result<()> {
    let conn = self.lock()?;
    conn
      .execute(
        "INSERT OR IGNORE INTO cache_namespaces (name) VALUES (?)",
        params![namespace],
      )
      .map_err(|e| eyre!("Failed to open namespace {}: {}", namespace, e))?;
    Ok(())
  }

  fn namespaces(&self) -> Result<Vec<String>> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare("SELECT name FROM cache_namespaces ORDER BY name")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list namespaces: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read namespace name: {}", e))?;

    Ok(names)
  }

  fn delete(&self, namespace: &str) -> Result<bool> {
    let mut conn = self.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute(
      "DELETE FROM cache_entries WHERE namespace = ?",
      params![namespace],
    )
    .map_err(|e| eyre!("Failed to delete entries of {}: {}", namespace, e))?;

    let removed = tx
      .execute(
        "DELETE FROM cache_namespaces WHERE name = ?",
        params![namespace],
      )
      .map_err(|e| eyre!("Failed to delete namespace {}: {}", namespace, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(removed > 0)
  }

  fn get(&self, namespace: &str, key: &str) -> Result<Option<CachedEntry>> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare(
        "SELECT method, url, status, headers, body, cached_at FROM cache_entries
         WHERE namespace = ? AND key_hash = ?",
      )
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let row: Option<(String, String, u16, String, Vec<u8>, String)> = stmt
      .query_row(params![namespace, key], |row| {
        Ok((
          row.get(0)?,
          row.get(1)?,
          row.get(2)?,
          row.get(3)?,
          row.get(4)?,
          row.get(5)?,
        ))
      })
      .optional()
      .map_err(|e| eyre!("Failed to read cache entry: {}", e))?;

    match row {
      Some((method, url, status, headers, body, cached_at)) => {
        let headers = serde_json::from_str(&headers)
          .map_err(|e| eyre!("Failed to deserialize headers for {}: {}", url, e))?;
        let cached_at = parse_datetime(&cached_at)?;
        Ok(Some(CachedEntry {
          key: key.to_string(),
          method,
          url,
          status,
          headers,
          body,
          cached_at,
        }))
      }
      None => Ok(None),
    }
  }

  fn put(&self, namespace: &str, entry: &CachedEntry) -> Result<()> {
    let mut conn = self.lock()?;
    let headers = serde_json::to_string(&entry.headers)
      .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;
    let cached_at = format_datetime(&entry.cached_at);

    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute(
      "INSERT OR IGNORE INTO cache_namespaces (name) VALUES (?)",
      params![namespace],
    )
    .map_err(|e| eyre!("Failed to open namespace {}: {}", namespace, e))?;

    tx.execute(
      "INSERT OR REPLACE INTO cache_entries
         (namespace, key_hash, method, url, status, headers, body, cached_at)
       VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
      params![
        namespace,
        entry.key,
        entry.method,
        entry.url,
        entry.status,
        headers,
        entry.body,
        cached_at
      ],
    )
    .map_err(|e| eyre!("Failed to store entry for {}: {}", entry.url, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(())
  }

  fn remove(&self, namespace: &str, key: &str) -> Result<bool> {
    let conn = self.lock()?;
    let removed = conn
      .execute(
        "DELETE FROM cache_entries WHERE namespace = ? AND key_hash = ?",
        params![namespace, key],
      )
      .map_err(|e| eyre!("Failed to remove cache entry: {}", e))?;
    Ok(removed > 0)
  }

  fn count(&self, namespace: &str) -> Result<usize> {
    let conn = self.lock()?;
    let count: i64 = conn
      .query_row(
        "SELECT COUNT(*) FROM cache_entries WHERE namespace = ?",
        params![namespace],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to count entries of {}: {}", namespace, e))?;
    Ok(count as usize)
  }

  fn trim(&self, namespace: &str, max_entries: usize) -> Result<usize> {
    let conn = self.lock()?;
    let evicted = conn
      .execute(
        "DELETE FROM cache_entries
         WHERE namespace = ?1 AND seq NOT IN (
           SELECT seq FROM cache_entries WHERE namespace = ?1 ORDER BY seq DESC LIMIT ?2
         )",
        params![namespace, max_entries as i64],
      )
      .map_err(|e| eyre!("Failed to trim namespace {}: {}", namespace, e))?;
    Ok(evicted)
  }
}

const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

fn format_datetime(dt: &DateTime<Utc>) -> String {
  dt.format(DATETIME_FORMAT).to_string()
}

/// Parse a datetime string from SQLite format.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  // SQLite stores as "YYYY-MM-DD HH:MM:SS"
  chrono::NaiveDateTime::parse_from_str(s, DATETIME_FORMAT)
    .map(|dt| dt.and_utc())
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}
