//! Mapping replay responses to queue verdicts.

use serde::Deserialize;

use super::record::{FailureReason, MutationOutcome};
use crate::http::Response;

/// Application error code meaning the server already recorded this write.
pub const ALREADY_RECORDED: &str = "already_recorded";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplayVerdict {
  /// Remove the entry and report this outcome
  Resolved(MutationOutcome),
  /// Keep the entry for the next pass
  Retry,
}

#[derive(Deserialize)]
struct ErrorBody {
  code: Option<String>,
}

/// Statuses worth trying again later: server errors, request timeout, rate limiting.
pub fn is_transient_status(status: u16) -> bool {
  status >= 500 || status == 408 || status == 429
}

fn is_already_recorded(response: &Response) -> bool {
  serde_json::from_slice::<ErrorBody>(&response.body)
    .ok()
    .and_then(|b| b.code)
    .is_some_and(|code| code == ALREADY_RECORDED)
}

/// Classify the server's answer to a replayed write.
pub fn classify_response(response: &Response) -> ReplayVerdict {
  let status = response.status;

  if response.is_success() {
    return ReplayVerdict::Resolved(MutationOutcome::Success);
  }
  if status == 409 || ((400..500).contains(&status) && is_already_recorded(response)) {
    return ReplayVerdict::Resolved(MutationOutcome::Conflict);
  }
  if is_transient_status(status) {
    return ReplayVerdict::Retry;
  }

  ReplayVerdict::Resolved(MutationOutcome::failed(FailureReason::Rejected {
    status,
  }))
}
