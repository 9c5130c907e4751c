//! Remotely configured feature toggles with a TTL-bound local snapshot.

mod cache;
mod source;
mod store;

pub use cache::FlagCache;
pub use source::{FlagSource, HttpFlagSource};
pub use store::{FlagSnapshot, FlagStore, SqliteFlagStore};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::http::FetchError;

/// One flag as served by the flag endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureFlag {
  pub flag_key: String,
  pub enabled: bool,
  /// Opaque parameters for the flag
  #[serde(default)]
  pub config: Map<String, Value>,
}

/// Notifications to flag cache subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum FlagEvent {
  /// The in-memory flag set was replaced
  Updated { count: usize },
  /// A fetch failed; the previous flags stay in effect
  FetchFailed { error: FlagError },
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FlagError {
  #[error("flag fetch failed: {0}")]
  Fetch(#[from] FetchError),
  #[error("flag endpoint returned HTTP {0}")]
  Status(u16),
  #[error("invalid flag payload: {0}")]
  Decode(String),
  #[error("flag snapshot store: {0}")]
  Store(String),
}
