//! Queue entry and outcome types.

use chrono::{DateTime, Utc};
use color_eyre::Result;
use serde::{Deserialize, Serialize};

use crate::http::{Headers, Method, Request};

/// A write waiting to be replayed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueuedMutation {
  /// Monotonic insertion order
  pub id: i64,
  pub method: Method,
  pub url: String,
  pub headers: Headers,
  #[serde(skip)]
  pub body: Vec<u8>,
  /// Session the write belongs to, when the route captures one
  pub session_id: Option<String>,
  pub enqueued_at: DateTime<Utc>,
  pub attempt_count: u32,
  pub retention_deadline: DateTime<Utc>,
}

impl QueuedMutation {
  pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
    now >= self.retention_deadline
  }

  /// Entries sharing a key must replay in id order.
  pub fn ordering_key(&self) -> &str {
    self.session_id.as_deref().unwrap_or("")
  }

  /// Rebuild the original request for replay.
  pub fn to_request(&self) -> Result<Request> {
    let mut request = Request::new(self.method, &self.url)?.with_body(self.body.clone());
    request.headers = self.headers.clone();
    Ok(request)
  }
}

/// Data for a new entry; the store assigns the id.
#[derive(Debug, Clone)]
pub struct NewMutation {
  pub method: Method,
  pub url: String,
  pub headers: Headers,
  pub body: Vec<u8>,
  pub session_id: Option<String>,
  pub enqueued_at: DateTime<Utc>,
  pub retention_deadline: DateTime<Utc>,
}

/// Terminal result of a queued write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum MutationOutcome {
  Success,
  /// The server already holds this write; reconcile instead of resubmitting
  Conflict,
  Failed { reason: FailureReason },
}

impl MutationOutcome {
  pub fn failed(reason: FailureReason) -> Self {
    Self::Failed { reason }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureReason {
  /// Server refused the request permanently (4xx other than conflict)
  Rejected { status: u16 },
  /// Retention deadline passed before the write could be delivered
  Expired,
  /// Stored entry could not be turned back into a request
  Invalid,
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_outcome_wire_format() {
    assert_eq!(
      serde_json::to_value(MutationOutcome::Conflict).unwrap(),
      json!({"outcome": "conflict"})
    );
    assert_eq!(
      serde_json::to_value(MutationOutcome::failed(FailureReason::Expired)).unwrap(),
      json!({"outcome": "failed", "reason": {"kind": "expired"}})
    );
    assert_eq!(
      serde_json::to_value(MutationOutcome::failed(FailureReason::Rejected { status: 422 }))
        .unwrap(),
      json!({"outcome": "failed", "reason": {"kind": "rejected", "status": 422}})
    );
  }
}
