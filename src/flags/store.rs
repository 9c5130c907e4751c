use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use std::sync::Arc;

use super::FeatureFlag;
use crate::db::Database;

const SNAPSHOT_SLOT: &str = "feature_flags";

/// The full flag set from one successful fetch.
#[derive(Debug, Clone, PartialEq)]
pub struct FlagSnapshot {
  pub flags: Vec<FeatureFlag>,
  pub fetched_at: DateTime<Utc>,
}

/// Persistent slot holding the last flag snapshot.
pub trait FlagStore: Send + Sync {
  fn load(&self) -> Result<Option<FlagSnapshot>>;
  fn save(&self, snapshot: &FlagSnapshot) -> Result<()>;
}

pub struct SqliteFlagStore {
  db: Arc<Database>,
}

impl SqliteFlagStore {
  pub fn new(db: Arc<Database>) -> Self {
    Self { db }
  }
}

impl FlagStore for SqliteFlagStore {
  fn load(&self) -> Result<Option<FlagSnapshot>> {
    match self.db.get_slot(SNAPSHOT_SLOT)? {
      Some((json, fetched_at)) => {
        let flags: Vec<FeatureFlag> = serde_json::from_str(&json)
          .map_err(|e| eyre!("Failed to decode flag snapshot: {}", e))?;
        Ok(Some(FlagSnapshot { flags, fetched_at }))
      }
      None => Ok(None),
    }
  }

  fn save(&self, snapshot: &FlagSnapshot) -> Result<()> {
    let json = serde_json::to_string(&snapshot.flags)
      .map_err(|e| eyre!("Failed to encode flag snapshot: {}", e))?;
    self.db.put_slot(SNAPSHOT_SLOT, &json, snapshot.fetched_at)
  }
}
