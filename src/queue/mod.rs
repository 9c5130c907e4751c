//! Durable queue of writes that could not reach the server.
//!
//! Entries are persisted before `enqueue` returns, replayed oldest first by the
//! sync coordinator, and removed only once a terminal outcome is known. Every
//! removal reports exactly one outcome on the signal bus.

mod classify;
mod record;
mod store;

pub use classify::{classify_response, is_transient_status, ReplayVerdict, ALREADY_RECORDED};
pub use record::{FailureReason, MutationOutcome, NewMutation, QueuedMutation};
pub use store::{MutationStore, SqliteMutationStore};

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::http::Request;
use crate::signal::{Signal, SignalBus};

/// Header the server uses to deduplicate repeated submissions.
pub const IDEMPOTENCY_HEADER: &str = "idempotency-key";

pub struct MutationQueue {
  store: Arc<dyn MutationStore>,
  bus: SignalBus,
  clock: Arc<dyn Clock>,
  retention: chrono::Duration,
  /// Entries currently being sent by a replay pass
  in_flight: Mutex<HashSet<i64>>,
}

/// Marks one entry as being delivered until dropped. Expiry never removes
/// an entry while it is marked.
pub struct Delivery<'a> {
  queue: &'a MutationQueue,
  id: i64,
}

impl Drop for Delivery<'_> {
  fn drop(&mut self) {
    self.queue.in_flight().remove(&self.id);
  }
}

impl MutationQueue {
  pub fn new(
    store: Arc<dyn MutationStore>,
    bus: SignalBus,
    clock: Arc<dyn Clock>,
    retention: Duration,
  ) -> Result<Self> {
    let retention = chrono::Duration::from_std(retention)
      .map_err(|e| eyre!("Invalid retention window: {}", e))?;
    Ok(Self {
      store,
      bus,
      clock,
      retention,
      in_flight: Mutex::new(HashSet::new()),
    })
  }

  pub fn now(&self) -> DateTime<Utc> {
    self.clock.now()
  }

  /// Persist a write for later replay. Never touches the network.
  ///
  /// An idempotency key is attached when the caller did not send one, so a
  /// replay that races a delivered original is deduplicated by the server.
  pub fn enqueue(&self, request: &Request, session_id: Option<String>) -> Result<QueuedMutation> {
    let enqueued_at = self.clock.now();

    let mut headers = request.headers.clone();
    if request.header(IDEMPOTENCY_HEADER).is_none() {
      headers.push((
        IDEMPOTENCY_HEADER.to_string(),
        idempotency_key(request, enqueued_at),
      ));
    }

    let mutation = self.store.insert(&NewMutation {
      method: request.method,
      url: request.url.to_string(),
      headers,
      body: request.body.clone(),
      session_id,
      enqueued_at,
      retention_deadline: enqueued_at + self.retention,
    })?;

    info!(
      id = mutation.id,
      url = %mutation.url,
      session = mutation.session_id.as_deref().unwrap_or("-"),
      "Queued mutation"
    );
    Ok(mutation)
  }

  /// Oldest entry that has not passed its retention deadline.
  pub fn dequeue_next(&self, now: DateTime<Utc>) -> Result<Option<QueuedMutation>> {
    self.store.oldest_live(now)
  }

  /// All live entries in enqueue order.
  pub fn pending(&self, now: DateTime<Utc>) -> Result<Vec<QueuedMutation>> {
    self.store.live(now)
  }

  /// Whether a live entry with this ordering key is queued. A new write for
  /// the same session must queue behind it.
  pub fn has_pending_for(&self, ordering_key: &str, now: DateTime<Utc>) -> Result<bool> {
    Ok(self.store.count_live_for(ordering_key, now)? > 0)
  }

  /// Mark an entry as being delivered. Returns `None` when the entry is
  /// already gone, in which case it must not be sent.
  pub fn begin_delivery(&self, id: i64) -> Result<Option<Delivery<'_>>> {
    let mut in_flight = self.in_flight();
    if !self.store.contains(id)? {
      return Ok(None);
    }
    in_flight.insert(id);
    Ok(Some(Delivery { queue: self, id }))
  }

  fn in_flight(&self) -> MutexGuard<'_, HashSet<i64>> {
    self.in_flight.lock().unwrap_or_else(|e| e.into_inner())
  }

  /// Delete an entry without reporting an outcome.
  pub fn remove(&self, id: i64) -> Result<bool> {
    self.store.remove(id)
  }

  /// Remove an entry and report its outcome. The outcome is emitted only if
  /// this call was the one that removed the entry.
  pub fn resolve(&self, id: i64, outcome: MutationOutcome) -> Result<bool> {
    if !self.store.remove(id)? {
      return Ok(false);
    }

    info!(id, outcome = ?outcome, "Mutation resolved");
    self.bus.emit(Signal::MutationResolved { id, outcome });
    Ok(true)
  }

  /// Count one more failed delivery attempt.
  pub fn record_attempt(&self, id: i64) -> Result<Option<u32>> {
    let attempts = self.store.increment_attempts(id)?;
    if let Some(n) = attempts {
      warn!(id, attempts = n, "Mutation delivery failed, will retry");
    }
    Ok(attempts)
  }

  /// Drop entries past their retention deadline, reporting each as failed.
  /// Entries being delivered are left for the replay pass to resolve.
  pub fn purge_expired(&self, now: DateTime<Utc>) -> Result<Vec<i64>> {
    let in_flight = self.in_flight();
    let mut purged = Vec::new();
    for mutation in self.store.expired(now)? {
      if in_flight.contains(&mutation.id) {
        debug!(id = mutation.id, "Expired mutation is being delivered, not purging");
        continue;
      }
      if self.resolve(mutation.id, MutationOutcome::failed(FailureReason::Expired))? {
        warn!(
          id = mutation.id,
          url = %mutation.url,
          attempts = mutation.attempt_count,
          "Mutation expired before delivery"
        );
        purged.push(mutation.id);
      }
    }
    Ok(purged)
  }

  pub fn len(&self) -> Result<usize> {
    self.store.count()
  }

  pub fn is_empty(&self) -> Result<bool> {
    Ok(self.len()? == 0)
  }
}

/// Stable key for one submission: same request content at the same enqueue time.
fn idempotency_key(request: &Request, enqueued_at: DateTime<Utc>) -> String {
  let mut hasher = Sha256::new();
  hasher.update(request.method.as_str().as_bytes());
  hasher.update(b" ");
  hasher.update(request.url.as_str().as_bytes());
  hasher.update(b"\n");
  hasher.update(&request.body);
  hasher.update(enqueued_at.timestamp_millis().to_be_bytes());
  hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::clock::ManualClock;
  use crate::db::{from_millis, Database};

  fn setup() -> (MutationQueue, Arc<ManualClock>, SignalBus) {
    let db = Arc::new(Database::open_in_memory().unwrap());
    let clock = Arc::new(ManualClock::new(from_millis(1_760_000_000_000)));
    let bus = SignalBus::new();
    let queue = MutationQueue::new(
      Arc::new(SqliteMutationStore::new(db)),
      bus.clone(),
      clock.clone(),
      Duration::from_secs(24 * 3600),
    )
    .unwrap();
    (queue, clock, bus)
  }

  fn answer(session: &str, answer: &str) -> Request {
    Request::post_json(
      &format!("https://lessons.test/api/v1/sessions/{}/answers", session),
      &serde_json::json!({ "answer": answer }),
    )
    .unwrap()
  }

  #[test]
  fn test_enqueue_attaches_idempotency_key() {
    let (queue, _, _) = setup();
    let entry = queue.enqueue(&answer("s1", "42"), Some("s1".into())).unwrap();
    let key = entry
      .headers
      .iter()
      .find(|(k, _)| k == IDEMPOTENCY_HEADER)
      .map(|(_, v)| v.clone())
      .unwrap();
    assert_eq!(key.len(), 64);
  }

  #[test]
  fn test_enqueue_keeps_caller_idempotency_key() {
    let (queue, _, _) = setup();
    let request = answer("s1", "42").with_header("Idempotency-Key", "client-key");
    let entry = queue.enqueue(&request, Some("s1".into())).unwrap();
    let keys: Vec<_> = entry
      .headers
      .iter()
      .filter(|(k, _)| k.eq_ignore_ascii_case(IDEMPOTENCY_HEADER))
      .collect();
    assert_eq!(keys.len(), 1);
    assert_eq!(keys[0].1, "client-key");
  }

  #[test]
  fn test_retention_deadline_is_24h_after_enqueue() {
    let (queue, clock, _) = setup();
    let entry = queue.enqueue(&answer("s1", "a"), Some("s1".into())).unwrap();
    assert_eq!(entry.enqueued_at, clock.now());
    assert_eq!(
      entry.retention_deadline - entry.enqueued_at,
      chrono::Duration::hours(24)
    );
  }

  #[test]
  fn test_dequeue_next_is_fifo_and_skips_expired() {
    let (queue, clock, _) = setup();
    let first = queue.enqueue(&answer("s1", "a"), Some("s1".into())).unwrap();
    clock.advance(chrono::Duration::hours(23));
    let second = queue.enqueue(&answer("s1", "b"), Some("s1".into())).unwrap();

    assert_eq!(queue.dequeue_next(clock.now()).unwrap().unwrap().id, first.id);
    clock.advance(chrono::Duration::hours(2));
    assert_eq!(queue.dequeue_next(clock.now()).unwrap().unwrap().id, second.id);
  }

  #[test]
  fn test_resolve_emits_exactly_once() {
    let (queue, _, bus) = setup();
    let mut rx = bus.subscribe();
    let entry = queue.enqueue(&answer("s1", "a"), Some("s1".into())).unwrap();

    assert!(queue.resolve(entry.id, MutationOutcome::Success).unwrap());
    assert!(!queue.resolve(entry.id, MutationOutcome::Success).unwrap());

    match rx.try_recv().unwrap() {
      Signal::MutationResolved { id, outcome } => {
        assert_eq!(id, entry.id);
        assert_eq!(outcome, MutationOutcome::Success);
      }
      other => panic!("unexpected signal {:?}", other),
    }
    assert!(rx.try_recv().is_err());
    assert!(queue.is_empty().unwrap());
  }

  #[test]
  fn test_purge_expired_reports_failed() {
    let (queue, clock, bus) = setup();
    let mut rx = bus.subscribe();
    let stale = queue.enqueue(&answer("s1", "a"), Some("s1".into())).unwrap();
    clock.advance(chrono::Duration::hours(12));
    let fresh = queue.enqueue(&answer("s2", "b"), Some("s2".into())).unwrap();
    clock.advance(chrono::Duration::hours(13));

    assert_eq!(queue.purge_expired(clock.now()).unwrap(), vec![stale.id]);
    match rx.try_recv().unwrap() {
      Signal::MutationResolved { id, outcome } => {
        assert_eq!(id, stale.id);
        assert_eq!(outcome, MutationOutcome::failed(FailureReason::Expired));
      }
      other => panic!("unexpected signal {:?}", other),
    }
    assert_eq!(queue.pending(clock.now()).unwrap()[0].id, fresh.id);
    assert_eq!(queue.len().unwrap(), 1);
  }

  #[test]
  fn test_purge_leaves_entry_being_delivered() {
    let (queue, clock, bus) = setup();
    let mut rx = bus.subscribe();
    let entry = queue.enqueue(&answer("s1", "a"), Some("s1".into())).unwrap();

    let delivery = queue.begin_delivery(entry.id).unwrap().unwrap();
    clock.advance(chrono::Duration::hours(25));
    assert!(queue.purge_expired(clock.now()).unwrap().is_empty());
    assert!(rx.try_recv().is_err());

    // The pass resolves it with what the server said
    assert!(queue.resolve(entry.id, MutationOutcome::Success).unwrap());
    drop(delivery);
    assert!(queue.is_empty().unwrap());
  }

  #[test]
  fn test_purged_entry_cannot_be_delivered() {
    let (queue, clock, _) = setup();
    let entry = queue.enqueue(&answer("s1", "a"), Some("s1".into())).unwrap();
    clock.advance(chrono::Duration::hours(25));
    assert_eq!(queue.purge_expired(clock.now()).unwrap(), vec![entry.id]);
    assert!(queue.begin_delivery(entry.id).unwrap().is_none());
  }

  #[test]
  fn test_delivery_mark_released_on_drop() {
    let (queue, clock, _) = setup();
    let entry = queue.enqueue(&answer("s1", "a"), Some("s1".into())).unwrap();
    drop(queue.begin_delivery(entry.id).unwrap().unwrap());
    clock.advance(chrono::Duration::hours(25));
    assert_eq!(queue.purge_expired(clock.now()).unwrap(), vec![entry.id]);
  }

  #[test]
  fn test_has_pending_for_session() {
    let (queue, clock, _) = setup();
    let entry = queue.enqueue(&answer("s1", "a"), Some("s1".into())).unwrap();
    assert!(queue.has_pending_for("s1", clock.now()).unwrap());
    assert!(!queue.has_pending_for("s2", clock.now()).unwrap());

    queue.remove(entry.id).unwrap();
    assert!(!queue.has_pending_for("s1", clock.now()).unwrap());
  }
}
