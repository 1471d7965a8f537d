//! Local group directory and sync state, backed by SQLite.

mod group;

pub use group::GroupRecord;

use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;

/// Schema for the group directory tables.
const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS groups (
    email TEXT PRIMARY KEY,
    description TEXT NOT NULL DEFAULT '',
    direct_members_count TEXT NOT NULL DEFAULT '',
    category TEXT NOT NULL DEFAULT '',
    deleted INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_groups_deleted ON groups(deleted);

CREATE TABLE IF NOT EXISTS state (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

/// Database connection wrapper for group records and sync state.
pub struct Database {
  conn: Mutex<Connection>,
}

impl Database {
  /// Open or create the database at the given path.
  pub fn open(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create database directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open database at {}: {}", path.display(), e))?;

    let db = Self {
      conn: Mutex::new(conn),
    };
    db.run_migrations()?;

    Ok(db)
  }

  /// Open an in-memory database (used by tests).
  #[cfg(test)]
  pub fn open_in_memory() -> Result<Self> {
    let conn =
      Connection::open_in_memory().map_err(|e| eyre!("Failed to open database: {}", e))?;

    let db = Self {
      conn: Mutex::new(conn),
    };
    db.run_migrations()?;

    Ok(db)
  }

  fn run_migrations(&self) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute_batch(SCHEMA)
      .map_err(|e| eyre!("Failed to run migrations: {}", e))?;

    Ok(())
  }

  /// Insert or update a group record by address.
  pub fn upsert_group(&self, record: &GroupRecord) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute(
        "INSERT OR REPLACE INTO groups (email, description, direct_members_count, category, deleted)
         VALUES (?, ?, ?, ?, ?)",
        params![
          record.email,
          record.description,
          record.direct_members_count,
          record.category,
          record.deleted
        ],
      )
      .map_err(|e| eyre!("Failed to upsert group: {}", e))?;

    Ok(())
  }

  /// Fetch one group by address.
  pub fn get_group(&self, email: &str) -> Result<Option<GroupRecord>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .query_row(
        "SELECT email, description, direct_members_count, category, deleted
         FROM groups WHERE email = ?",
        params![email],
        row_to_group,
      )
      .optional()
      .map_err(|e| eyre!("Failed to query group: {}", e))
  }

  /// All groups without a tombstone, ordered by address.
  pub fn live_groups(&self) -> Result<Vec<GroupRecord>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let mut stmt = conn
      .prepare(
        "SELECT email, description, direct_members_count, category, deleted
         FROM groups WHERE deleted = 0 ORDER BY email",
      )
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let groups = stmt
      .query_map([], row_to_group)
      .map_err(|e| eyre!("Failed to query groups: {}", e))?
      .filter_map(|r| r.ok())
      .collect();

    Ok(groups)
  }

  /// Set the tombstone flag on a group.
  pub fn mark_deleted(&self, email: &str) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute("UPDATE groups SET deleted = 1 WHERE email = ?", params![email])
      .map_err(|e| eyre!("Failed to tombstone group: {}", e))?;

    Ok(())
  }

  /// Whether the very first full sync has completed.
  pub fn initialized(&self) -> Result<bool> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let value: Option<String> = conn
      .query_row(
        "SELECT value FROM state WHERE key = 'initialized'",
        [],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to query state: {}", e))?;

    Ok(value.as_deref() == Some("true"))
  }

  /// Record that the first full sync has completed.
  pub fn mark_initialized(&self) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute(
        "INSERT OR REPLACE INTO state (key, value) VALUES ('initialized', 'true')",
        [],
      )
      .map_err(|e| eyre!("Failed to update state: {}", e))?;

    Ok(())
  }
}

fn row_to_group(row: &rusqlite::Row<'_>) -> rusqlite::Result<GroupRecord> {
  Ok(GroupRecord {
    email: row.get(0)?,
    description: row.get(1)?,
    direct_members_count: row.get(2)?,
    category: row.get(3)?,
    deleted: row.get(4)?,
  })
}

#[cfg(test)]
mod tests {
  use super::*;

  fn record(email: &str) -> GroupRecord {
    GroupRecord {
      email: email.to_string(),
      description: "desc".to_string(),
      direct_members_count: "2".to_string(),
      category: "eng".to_string(),
      deleted: false,
    }
  }

  #[test]
  fn test_upsert_and_get() {
    let db = Database::open_in_memory().unwrap();
    db.upsert_group(&record("eng@example.com")).unwrap();

    let loaded = db.get_group("eng@example.com").unwrap().unwrap();
    assert_eq!(loaded, record("eng@example.com"));
    assert!(db.get_group("nope@example.com").unwrap().is_none());
  }

  #[test]
  fn test_tombstone_excludes_from_live() {
    let db = Database::open_in_memory().unwrap();
    db.upsert_group(&record("a@example.com")).unwrap();
    db.upsert_group(&record("b@example.com")).unwrap();

    db.mark_deleted("a@example.com").unwrap();

    let live = db.live_groups().unwrap();
    assert_eq!(live.len(), 1);
    assert_eq!(live[0].email, "b@example.com");

    // Row still exists, only tombstoned
    let dead = db.get_group("a@example.com").unwrap().unwrap();
    assert!(dead.deleted);
  }

  #[test]
  fn test_initialized_flag() {
    let db = Database::open_in_memory().unwrap();
    assert!(!db.initialized().unwrap());

    db.mark_initialized().unwrap();
    assert!(db.initialized().unwrap());
  }
}
