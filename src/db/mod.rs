pub mod schema;

use color_eyre::{eyre::eyre, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

/// The durable store shared by the cache, the queue and the key-value slots.
///
/// One connection behind a mutex; every statement runs to completion while
/// the lock is held, so single-statement updates are atomic per entry.
pub struct Database {
  conn: Mutex<Connection>,
}

impl Database {
  /// Open or create the database at `path`, or at the default location.
  pub fn open(path: Option<&Path>) -> Result<Self> {
    let path = match path {
      Some(p) => p.to_path_buf(),
      None => Self::default_path()?,
    };

    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create database directory: {}", e))?;
    }

    let conn = Connection::open(&path)
      .map_err(|e| eyre!("Failed to open database at {}: {}", path.display(), e))?;
    conn
      .pragma_update(None, "journal_mode", "WAL")
      .map_err(|e| eyre!("Failed to enable WAL: {}", e))?;

    tracing::info!(path = %path.display(), "Opened offline store");
    Self::with_connection(conn)
  }

  /// Database that lives only as long as this value.
  pub fn open_in_memory() -> Result<Self> {
    let conn =
      Connection::open_in_memory().map_err(|e| eyre!("Failed to open in-memory database: {}", e))?;
    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    let db = Self {
      conn: Mutex::new(conn),
    };
    db.run_migrations()?;
    Ok(db)
  }

  /// Get the default database path
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("lessonsw").join("lessonsw.db"))
  }

  /// Run database migrations
  fn run_migrations(&self) -> Result<()> {
    self
      .conn()?
      .execute_batch(schema::SCHEMA)
      .map_err(|e| eyre!("Failed to run migrations: {}", e))?;
    Ok(())
  }

  /// Lock the connection.
  pub fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
    self.conn.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  /// Read a key-value slot together with the time it was written.
  pub fn get_slot(&self, key: &str) -> Result<Option<(String, DateTime<Utc>)>> {
    let conn = self.conn()?;
    let row: Option<(String, i64)> = conn
      .query_row(
        "SELECT value, updated_at FROM kv WHERE key = ?",
        params![key],
        |row| Ok((row.get(0)?, row.get(1)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read slot {}: {}", key, e))?;

    Ok(row.map(|(value, millis)| (value, from_millis(millis))))
  }

  /// Overwrite a key-value slot.
  pub fn put_slot(&self, key: &str, value: &str, at: DateTime<Utc>) -> Result<()> {
    self
      .conn()?
      .execute(
        "INSERT OR REPLACE INTO kv (key, value, updated_at) VALUES (?, ?, ?)",
        params![key, value, at.timestamp_millis()],
      )
      .map_err(|e| eyre!("Failed to write slot {}: {}", key, e))?;
    Ok(())
  }
}

/// Timestamps are stored as unix milliseconds.
pub fn from_millis(millis: i64) -> DateTime<Utc> {
  DateTime::<Utc>::from_timestamp_millis(millis).unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_migrations_create_tables() {
    let db = Database::open_in_memory().unwrap();
    let conn = db.conn().unwrap();
    let count: i64 = conn
      .query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table'
         AND name IN ('cache_entries', 'mutations', 'kv')",
        [],
        |row| row.get(0),
      )
      .unwrap();
    assert_eq!(count, 3);
  }

  #[test]
  fn test_slot_roundtrip_keeps_timestamp() {
    let db = Database::open_in_memory().unwrap();
    assert!(db.get_slot("missing").unwrap().is_none());

    let at = from_millis(1_700_000_000_123);
    db.put_slot("active_version", "v2", at).unwrap();
    assert_eq!(
      db.get_slot("active_version").unwrap(),
      Some(("v2".to_string(), at))
    );
  }

  #[test]
  fn test_open_on_disk_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("store.db");
    {
      let db = Database::open(Some(path.as_path())).unwrap();
      db.conn()
        .unwrap()
        .execute(
          "INSERT INTO kv (key, value, updated_at) VALUES ('k', 'v', 0)",
          [],
        )
        .unwrap();
    }
    let db = Database::open(Some(path.as_path())).unwrap();
    let value: String = db
      .conn()
      .unwrap()
      .query_row("SELECT value FROM kv WHERE key = 'k'", [], |row| row.get(0))
      .unwrap();
    assert_eq!(value, "v");
  }
}
