//! Cache storage trait and SQLite implementation.

use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, OptionalExtension};
use std::sync::Arc;

use super::traits::{CachedResponse, Strategy};
use crate::db::{from_millis, Database};
use crate::http::Headers;

/// Trait for cache storage backends.
///
/// Entries are addressed by `(cache_name, url)`. Operations on one cache name
/// never touch another.
pub trait CacheStorage: Send + Sync + 'static {
  /// Store (or overwrite) the entry for `entry.url`.
  fn put(&self, cache_name: &str, entry: &CachedResponse) -> Result<()>;

  /// Get the entry for a URL.
  fn get(&self, cache_name: &str, url: &str) -> Result<Option<CachedResponse>>;

  /// Delete one entry. Returns whether it existed.
  fn delete(&self, cache_name: &str, url: &str) -> Result<bool>;

  /// URLs stored under a cache name.
  fn keys(&self, cache_name: &str) -> Result<Vec<String>>;

  /// All cache names that hold at least one entry.
  fn cache_names(&self) -> Result<Vec<String>>;

  /// Drop a whole cache. Returns the number of entries removed.
  fn delete_cache(&self, cache_name: &str) -> Result<usize>;
}

/// SQLite-based cache storage implementation.
#[derive(Clone)]
pub struct SqliteStorage {
  db: Arc<Database>,
}

impl SqliteStorage {
  pub fn new(db: Arc<Database>) -> Self {
    Self { db }
  }
}

impl CacheStorage for SqliteStorage {
  fn put(&self, cache_name: &str, entry: &CachedResponse) -> Result<()> {
    let headers = serde_json::to_string(&entry.headers)
      .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

    self
      .db
      .conn()?
      .execute(
        "INSERT OR REPLACE INTO cache_entries (cache_name, url, strategy, status, headers, body, stored_at)
         VALUES (?, ?, ?, ?, ?, ?, ?)",
        params![
          cache_name,
          entry.url,
          entry.strategy.as_str(),
          entry.status,
          headers,
          entry.body,
          entry.stored_at.timestamp_millis()
        ],
      )
      .map_err(|e| eyre!("Failed to store cache entry {}: {}", entry.url, e))?;

    Ok(())
  }

  fn get(&self, cache_name: &str, url: &str) -> Result<Option<CachedResponse>> {
    let conn = self.db.conn()?;

    let row: Option<(String, u16, String, Vec<u8>, i64)> = conn
      .query_row(
        "SELECT strategy, status, headers, body, stored_at FROM cache_entries
         WHERE cache_name = ? AND url = ?",
        params![cache_name, url],
        |row| {
          Ok((
            row.get(0)?,
            row.get(1)?,
            row.get(2)?,
            row.get(3)?,
            row.get(4)?,
          ))
        },
      )
      .optional()
      .map_err(|e| eyre!("Failed to query cache entry {}: {}", url, e))?;

    match row {
      Some((strategy, status, headers, body, stored_at)) => {
        let strategy = Strategy::parse(&strategy)
          .ok_or_else(|| eyre!("Unknown cache strategy '{}' for {}", strategy, url))?;
        let headers: Headers = serde_json::from_str(&headers)
          .map_err(|e| eyre!("Failed to deserialize headers for {}: {}", url, e))?;
        Ok(Some(CachedResponse {
          url: url.to_string(),
          strategy,
          status,
          headers,
          body,
          stored_at: from_millis(stored_at),
        }))
      }
      None => Ok(None),
    }
  }

  fn delete(&self, cache_name: &str, url: &str) -> Result<bool> {
    let removed = self
      .db
      .conn()?
      .execute(
        "DELETE FROM cache_entries WHERE cache_name = ? AND url = ?",
        params![cache_name, url],
      )
      .map_err(|e| eyre!("Failed to delete cache entry {}: {}", url, e))?;
    Ok(removed > 0)
  }

  fn keys(&self, cache_name: &str) -> Result<Vec<String>> {
    let conn = self.db.conn()?;
    let mut stmt = conn
      .prepare("SELECT url FROM cache_entries WHERE cache_name = ? ORDER BY url")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let urls = stmt
      .query_map(params![cache_name], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list cache {}: {}", cache_name, e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read cache keys: {}", e))?;

    Ok(urls)
  }

  fn cache_names(&self) -> Result<Vec<String>> {
    let conn = self.db.conn()?;
    let mut stmt = conn
      .prepare("SELECT DISTINCT cache_name FROM cache_entries ORDER BY cache_name")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list caches: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read cache names: {}", e))?;

    Ok(names)
  }

  fn delete_cache(&self, cache_name: &str) -> Result<usize> {
    let removed = self
      .db
      .conn()?
      .execute(
        "DELETE FROM cache_entries WHERE cache_name = ?",
        params![cache_name],
      )
      .map_err(|e| eyre!("Failed to delete cache {}: {}", cache_name, e))?;
    Ok(removed)
  }
}
