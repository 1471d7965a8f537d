//! Durable backing store for cache entries.
//!
//! The store only exists to warm the in-memory cache across restarts;
//! last-write-wins is fine and nothing here is transactional.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection};
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use super::entry::CacheEntry;

/// Backing store for cache entries.
pub trait CacheStore: Send + Sync {
  /// Load every persisted entry, for warm start.
  fn load_all(&self) -> Result<Vec<CacheEntry>>;

  /// Persist a single entry (upsert by key).
  fn put(&self, entry: &CacheEntry) -> Result<()>;

  /// Discard every persisted entry.
  fn drop_all(&self) -> Result<()>;
}

/// SQLite-backed store.
pub struct SqliteStore {
  conn: Mutex<Connection>,
}

/// Schema for the cache table.
const CACHE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS cache (
    key TEXT PRIMARY KEY,
    value BLOB NOT NULL,
    expires_at TEXT
);
"#;

impl SqliteStore {
  /// Open or create the store at the given path.
  pub fn open(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    let store = Self {
      conn: Mutex::new(conn),
    };
    store.run_migrations()?;

    Ok(store)
  }

  /// Open an in-memory store (used by tests).
  #[cfg(test)]
  pub fn open_in_memory() -> Result<Self> {
    let conn =
      Connection::open_in_memory().map_err(|e| eyre!("Failed to open cache database: {}", e))?;

    let store = Self {
      conn: Mutex::new(conn),
    };
    store.run_migrations()?;

    Ok(store)
  }

  fn run_migrations(&self) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(())
  }
}

impl CacheStore for SqliteStore {
  fn load_all(&self) -> Result<Vec<CacheEntry>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let mut stmt = conn
      .prepare("SELECT key, value, expires_at FROM cache")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let rows: Vec<(String, Vec<u8>, Option<String>)> = stmt
      .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))
      .map_err(|e| eyre!("Failed to query cache entries: {}", e))?
      .filter_map(|r| r.ok())
      .collect();

    let mut entries = Vec::with_capacity(rows.len());
    for (key, value, expires_at) in rows {
      // Skip rows that no longer deserialize rather than failing the
      // whole warm start
      let value: Value = match serde_json::from_slice(&value) {
        Ok(v) => v,
        Err(e) => {
          tracing::warn!(key = %key, error = %e, "Dropping undecodable cache row");
          continue;
        }
      };
      let expires_at = match expires_at {
        Some(s) => Some(parse_datetime(&s)?),
        None => None,
      };
      entries.push(CacheEntry {
        key,
        value,
        expires_at,
      });
    }

    Ok(entries)
  }

  fn put(&self, entry: &CacheEntry) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let value =
      serde_json::to_vec(&entry.value).map_err(|e| eyre!("Failed to serialize entry: {}", e))?;
    let expires_at = entry.expires_at.map(|t| t.to_rfc3339());

    conn
      .execute(
        "INSERT OR REPLACE INTO cache (key, value, expires_at) VALUES (?, ?, ?)",
        params![entry.key, value, expires_at],
      )
      .map_err(|e| eyre!("Failed to store cache entry: {}", e))?;

    Ok(())
  }

  fn drop_all(&self) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute("DELETE FROM cache", [])
      .map_err(|e| eyre!("Failed to truncate cache: {}", e))?;

    Ok(())
  }
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}

/// In-memory store. Used when durable warm start isn't wanted, and by
/// tests that need to inspect what got persisted.
#[derive(Clone, Default)]
pub struct MemoryStore {
  entries: Arc<Mutex<HashMap<String, CacheEntry>>>,
}

impl MemoryStore {
  pub fn new() -> Self {
    Self::default()
  }

  /// Snapshot of the persisted keys, in no particular order.
  pub fn keys(&self) -> Vec<String> {
    self
      .entries
      .lock()
      .map(|map| map.keys().cloned().collect())
      .unwrap_or_default()
  }
}

impl CacheStore for MemoryStore {
  fn load_all(&self) -> Result<Vec<CacheEntry>> {
    let entries = self
      .entries
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    Ok(entries.values().cloned().collect())
  }

  fn put(&self, entry: &CacheEntry) -> Result<()> {
    let mut entries = self
      .entries
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    entries.insert(entry.key.clone(), entry.clone());
    Ok(())
  }

  fn drop_all(&self) -> Result<()> {
    let mut entries = self
      .entries
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    entries.clear();
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::Duration;

  #[test]
  fn test_sqlite_roundtrip() {
    let store = SqliteStore::open_in_memory().unwrap();

    let entry = CacheEntry {
      key: "memberships:eng@example.com".to_string(),
      value: serde_json::json!([{"email": "all@example.com"}]),
      expires_at: Some(Utc::now() + Duration::hours(1)),
    };
    store.put(&entry).unwrap();

    let loaded = store.load_all().unwrap();
    assert_eq!(loaded.len(), 1);
    assert_eq!(loaded[0].key, entry.key);
    assert_eq!(loaded[0].value, entry.value);
    assert_eq!(
      loaded[0].expires_at.map(|t| t.timestamp()),
      entry.expires_at.map(|t| t.timestamp())
    );
  }

  #[test]
  fn test_sqlite_drop_all() {
    let store = SqliteStore::open_in_memory().unwrap();

    store
      .put(&CacheEntry {
        key: "k".to_string(),
        value: Value::Null,
        expires_at: None,
      })
      .unwrap();
    store.drop_all().unwrap();

    assert!(store.load_all().unwrap().is_empty());
  }
}
