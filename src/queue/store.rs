//! Durable storage for queued mutations.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, OptionalExtension, Row};
use std::sync::Arc;

use super::record::{NewMutation, QueuedMutation};
use crate::db::{from_millis, Database};
use crate::http::{Headers, Method};

/// Trait for mutation queue backends.
///
/// Every method is a single atomic operation on the store; entries are
/// enumerated in insertion (id) order.
pub trait MutationStore: Send + Sync {
  /// Persist a new entry and return it with its assigned id.
  fn insert(&self, mutation: &NewMutation) -> Result<QueuedMutation>;

  /// Entries whose retention deadline is after `now`, oldest first.
  fn live(&self, now: DateTime<Utc>) -> Result<Vec<QueuedMutation>>;

  /// Oldest entry whose retention deadline is after `now`.
  fn oldest_live(&self, now: DateTime<Utc>) -> Result<Option<QueuedMutation>>;

  /// Entries whose retention deadline is at or before `now`, oldest first.
  fn expired(&self, now: DateTime<Utc>) -> Result<Vec<QueuedMutation>>;

  /// Number of live entries whose ordering key is `key`. Entries without a
  /// session share the empty key.
  fn count_live_for(&self, key: &str, now: DateTime<Utc>) -> Result<usize>;

  /// Whether an entry with this id is still stored.
  fn contains(&self, id: i64) -> Result<bool>;

  /// Delete an entry. Returns whether this call removed it.
  fn remove(&self, id: i64) -> Result<bool>;

  /// Increment the attempt counter, returning the new value if the entry exists.
  fn increment_attempts(&self, id: i64) -> Result<Option<u32>>;

  fn count(&self) -> Result<usize>;
}

/// SQLite-backed queue table.
#[derive(Clone)]
pub struct SqliteMutationStore {
  db: Arc<Database>,
}

impl SqliteMutationStore {
  pub fn new(db: Arc<Database>) -> Self {
    Self { db }
  }

  fn query(&self, sql: &str, now: DateTime<Utc>) -> Result<Vec<QueuedMutation>> {
    let conn = self.db.conn()?;
    let mut stmt = conn
      .prepare(sql)
      .map_err(|e| eyre!("Failed to prepare queue query: {}", e))?;

    let rows = stmt
      .query_map(params![now.timestamp_millis()], RawMutation::from_row)
      .map_err(|e| eyre!("Failed to query queue: {}", e))?
      .collect::<rusqlite::Result<Vec<RawMutation>>>()
      .map_err(|e| eyre!("Failed to read queue row: {}", e))?;

    rows.into_iter().map(RawMutation::into_mutation).collect()
  }
}

const COLUMNS: &str =
  "id, method, url, headers, body, session_id, enqueued_at, attempt_count, retention_deadline";

/// Row as stored, before decoding method and headers.
struct RawMutation {
  id: i64,
  method: String,
  url: String,
  headers: String,
  body: Vec<u8>,
  session_id: Option<String>,
  enqueued_at: i64,
  attempt_count: u32,
  retention_deadline: i64,
}

impl RawMutation {
  fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      id: row.get(0)?,
      method: row.get(1)?,
      url: row.get(2)?,
      headers: row.get(3)?,
      body: row.get(4)?,
      session_id: row.get(5)?,
      enqueued_at: row.get(6)?,
      attempt_count: row.get(7)?,
      retention_deadline: row.get(8)?,
    })
  }

  fn into_mutation(self) -> Result<QueuedMutation> {
    let method: Method = self.method.parse()?;
    let headers: Headers = serde_json::from_str(&self.headers)
      .map_err(|e| eyre!("Failed to decode headers of mutation {}: {}", self.id, e))?;

    Ok(QueuedMutation {
      id: self.id,
      method,
      url: self.url,
      headers,
      body: self.body,
      session_id: self.session_id,
      enqueued_at: from_millis(self.enqueued_at),
      attempt_count: self.attempt_count,
      retention_deadline: from_millis(self.retention_deadline),
    })
  }
}

impl MutationStore for SqliteMutationStore {
  fn insert(&self, mutation: &NewMutation) -> Result<QueuedMutation> {
    let headers = serde_json::to_string(&mutation.headers)
      .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

    let conn = self.db.conn()?;
    conn
      .execute(
        "INSERT INTO mutations (method, url, headers, body, session_id, enqueued_at, attempt_count, retention_deadline)
         VALUES (?, ?, ?, ?, ?, ?, 0, ?)",
        params![
          mutation.method.as_str(),
          mutation.url,
          headers,
          mutation.body,
          mutation.session_id,
          mutation.enqueued_at.timestamp_millis(),
          mutation.retention_deadline.timestamp_millis()
        ],
      )
      .map_err(|e| eyre!("Failed to enqueue mutation for {}: {}", mutation.url, e))?;

    Ok(QueuedMutation {
      id: conn.last_insert_rowid(),
      method: mutation.method,
      url: mutation.url.clone(),
      headers: mutation.headers.clone(),
      body: mutation.body.clone(),
      session_id: mutation.session_id.clone(),
      enqueued_at: mutation.enqueued_at,
      attempt_count: 0,
      retention_deadline: mutation.retention_deadline,
    })
  }

  fn live(&self, now: DateTime<Utc>) -> Result<Vec<QueuedMutation>> {
    self.query(
      &format!("SELECT {COLUMNS} FROM mutations WHERE retention_deadline > ? ORDER BY id"),
      now,
    )
  }

  fn oldest_live(&self, now: DateTime<Utc>) -> Result<Option<QueuedMutation>> {
    let conn = self.db.conn()?;
    let raw = conn
      .query_row(
        &format!(
          "SELECT {COLUMNS} FROM mutations WHERE retention_deadline > ? ORDER BY id LIMIT 1"
        ),
        params![now.timestamp_millis()],
        RawMutation::from_row,
      )
      .optional()
      .map_err(|e| eyre!("Failed to read queue head: {}", e))?;

    raw.map(RawMutation::into_mutation).transpose()
  }

  fn expired(&self, now: DateTime<Utc>) -> Result<Vec<QueuedMutation>> {
    self.query(
      &format!("SELECT {COLUMNS} FROM mutations WHERE retention_deadline <= ? ORDER BY id"),
      now,
    )
  }

  fn count_live_for(&self, key: &str, now: DateTime<Utc>) -> Result<usize> {
    let count: i64 = self
      .db
      .conn()?
      .query_row(
        "SELECT COUNT(*) FROM mutations WHERE COALESCE(session_id, '') = ? AND retention_deadline > ?",
        params![key, now.timestamp_millis()],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to count queued writes for session {}: {}", key, e))?;
    Ok(count as usize)
  }

  fn contains(&self, id: i64) -> Result<bool> {
    let found = self
      .db
      .conn()?
      .query_row("SELECT 1 FROM mutations WHERE id = ?", params![id], |_| Ok(()))
      .optional()
      .map_err(|e| eyre!("Failed to look up mutation {}: {}", id, e))?;
    Ok(found.is_some())
  }

  fn remove(&self, id: i64) -> Result<bool> {
    let removed = self
      .db
      .conn()?
      .execute("DELETE FROM mutations WHERE id = ?", params![id])
      .map_err(|e| eyre!("Failed to remove mutation {}: {}", id, e))?;
    Ok(removed > 0)
  }

  fn increment_attempts(&self, id: i64) -> Result<Option<u32>> {
    self
      .db
      .conn()?
      .query_row(
        "UPDATE mutations SET attempt_count = attempt_count + 1 WHERE id = ? RETURNING attempt_count",
        params![id],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to record attempt for mutation {}: {}", id, e))
  }

  fn count(&self) -> Result<usize> {
    let count: i64 = self
      .db
      .conn()?
      .query_row("SELECT COUNT(*) FROM mutations", [], |row| row.get(0))
      .map_err(|e| eyre!("Failed to count queue: {}", e))?;
    Ok(count as usize)
  }
}
