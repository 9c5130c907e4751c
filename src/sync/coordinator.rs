//! Replays the mutation queue when connectivity returns or on request.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use super::backoff::Backoff;
use super::connectivity::{ConnectivityMonitor, ConnectivityState};
use crate::http::{fetch_with_timeout, FetchError, Fetcher};
use crate::queue::{
  classify_response, FailureReason, MutationOutcome, MutationQueue, QueuedMutation, ReplayVerdict,
};

/// Why a replay pass was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayReason {
  ConnectivityRestored,
  ManualFlush,
  Backoff,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplayTrigger {
  Completed(ReplaySummary),
  /// Another pass holds the replay guard; this request did nothing
  AlreadyRunning,
  /// Automatic trigger while offline; nothing attempted
  Offline,
}

/// Counts from one replay pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplaySummary {
  pub succeeded: usize,
  pub conflicted: usize,
  /// Rejected, invalid, or expired
  pub failed: usize,
  /// Left queued for the next pass
  pub retrying: usize,
  /// Skipped because an earlier entry of the same session is still queued
  pub blocked: usize,
}

impl ReplaySummary {
  fn record(&mut self, outcome: &MutationOutcome) {
    match outcome {
      MutationOutcome::Success => self.succeeded += 1,
      MutationOutcome::Conflict => self.conflicted += 1,
      MutationOutcome::Failed { .. } => self.failed += 1,
    }
  }

  /// Whether entries remain that a later pass should try again.
  pub fn needs_retry(&self) -> bool {
    self.retrying > 0 || self.blocked > 0
  }
}

pub struct SyncCoordinator {
  queue: Arc<MutationQueue>,
  fetcher: Arc<dyn Fetcher>,
  connectivity: ConnectivityMonitor,
  replay_timeout: Duration,
  backoff: Backoff,
  /// Held for the duration of a pass
  running: AtomicBool,
  idle: Notify,
  consecutive_failures: AtomicU32,
  retry_wanted: Notify,
}

/// Releases the exclusive replay flag on every exit path.
struct PassGuard<'a> {
  coordinator: &'a SyncCoordinator,
}

impl Drop for PassGuard<'_> {
  fn drop(&mut self) {
    self.coordinator.running.store(false, Ordering::Release);
    self.coordinator.idle.notify_waiters();
  }
}

impl SyncCoordinator {
  pub fn new(
    queue: Arc<MutationQueue>,
    fetcher: Arc<dyn Fetcher>,
    connectivity: ConnectivityMonitor,
    replay_timeout: Duration,
    backoff: Backoff,
  ) -> Self {
    Self {
      queue,
      fetcher,
      connectivity,
      replay_timeout,
      backoff,
      running: AtomicBool::new(false),
      idle: Notify::new(),
      consecutive_failures: AtomicU32::new(0),
      retry_wanted: Notify::new(),
    }
  }

  fn try_begin(&self) -> Option<PassGuard<'_>> {
    self
      .running
      .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
      .ok()
      .map(|_| PassGuard { coordinator: self })
  }

  pub fn is_running(&self) -> bool {
    self.running.load(Ordering::Acquire)
  }

  /// Wait until no pass is running.
  pub async fn wait_idle(&self) {
    loop {
      let notified = self.idle.notified();
      tokio::pin!(notified);
      notified.as_mut().enable();
      if !self.is_running() {
        return;
      }
      notified.await;
    }
  }

  /// Run one replay pass unless one is already running.
  pub async fn trigger(&self, reason: ReplayReason) -> ReplayTrigger {
    if reason != ReplayReason::ManualFlush && !self.connectivity.is_online() {
      debug!(?reason, "Skipping replay while offline");
      return ReplayTrigger::Offline;
    }

    let Some(_guard) = self.try_begin() else {
      debug!(?reason, "Replay already in progress");
      return ReplayTrigger::AlreadyRunning;
    };

    info!(?reason, "Replay pass started");
    let summary = self.run_pass().await;
    info!(?summary, "Replay pass finished");

    if summary.needs_retry() {
      self.consecutive_failures.fetch_add(1, Ordering::AcqRel);
      self.retry_wanted.notify_one();
    } else {
      self.consecutive_failures.store(0, Ordering::Release);
    }

    ReplayTrigger::Completed(summary)
  }

  /// Resolves after a pass that left entries queued.
  pub async fn retry_wanted(&self) {
    self.retry_wanted.notified().await
  }

  /// How long to wait before the next retry pass.
  pub fn backoff_delay(&self) -> Duration {
    self
      .backoff
      .delay(self.consecutive_failures.load(Ordering::Acquire))
  }

  async fn run_pass(&self) -> ReplaySummary {
    let mut summary = ReplaySummary::default();

    match self.queue.purge_expired(self.queue.now()) {
      Ok(purged) => summary.failed += purged.len(),
      Err(e) => warn!(error = %e, "Failed to purge expired mutations"),
    }

    // Sessions with an entry still queued; their later entries must wait
    let mut blocked: HashSet<String> = HashSet::new();
    let mut seen: HashSet<i64> = HashSet::new();

    // Writes queued behind an entry of this pass are picked up by the next round
    loop {
      let entries: Vec<QueuedMutation> = match self.queue.pending(self.queue.now()) {
        Ok(entries) => entries.into_iter().filter(|e| !seen.contains(&e.id)).collect(),
        Err(e) => {
          error!(error = %e, "Failed to read mutation queue");
          return summary;
        }
      };
      if entries.is_empty() {
        break;
      }

      for entry in entries {
        seen.insert(entry.id);
        if blocked.contains(entry.ordering_key()) {
          summary.blocked += 1;
          continue;
        }
        if !self.deliver(&entry, &mut summary).await {
          blocked.insert(entry.ordering_key().to_string());
        }
      }
    }

    summary
  }

  /// Replay one entry and record what happened. Returns false when the entry
  /// stays queued, so later entries of its session must wait.
  async fn deliver(&self, entry: &QueuedMutation, summary: &mut ReplaySummary) -> bool {
    if entry.is_expired(self.queue.now()) {
      let outcome = MutationOutcome::failed(FailureReason::Expired);
      match self.queue.resolve(entry.id, outcome.clone()) {
        Ok(true) => summary.record(&outcome),
        Ok(false) => {}
        Err(e) => error!(id = entry.id, error = %e, "Failed to resolve expired mutation"),
      }
      return true;
    }

    let _delivery = match self.queue.begin_delivery(entry.id) {
      Ok(Some(delivery)) => delivery,
      Ok(None) => {
        debug!(id = entry.id, "Mutation already resolved");
        return true;
      }
      Err(e) => {
        error!(id = entry.id, error = %e, "Failed to mark mutation for delivery");
        summary.retrying += 1;
        return false;
      }
    };

    match self.replay(entry).await {
      ReplayVerdict::Resolved(outcome) => match self.queue.resolve(entry.id, outcome.clone()) {
        Ok(true) => {
          summary.record(&outcome);
          true
        }
        Ok(false) => {
          debug!(id = entry.id, "Mutation already resolved");
          true
        }
        Err(e) => {
          error!(id = entry.id, error = %e, "Failed to resolve mutation");
          summary.retrying += 1;
          false
        }
      },
      ReplayVerdict::Retry => {
        if let Err(e) = self.queue.record_attempt(entry.id) {
          error!(id = entry.id, error = %e, "Failed to record attempt");
        }
        summary.retrying += 1;
        false
      }
    }
  }

  async fn replay(&self, entry: &QueuedMutation) -> ReplayVerdict {
    let request = match entry.to_request() {
      Ok(request) => request,
      Err(e) => {
        error!(id = entry.id, error = %e, "Stored mutation is not a valid request");
        return ReplayVerdict::Resolved(MutationOutcome::failed(FailureReason::Invalid));
      }
    };

    match fetch_with_timeout(self.fetcher.as_ref(), &request, self.replay_timeout).await {
      Ok(response) => {
        self.connectivity.set(ConnectivityState::Online);
        let verdict = classify_response(&response);
        debug!(id = entry.id, status = response.status, ?verdict, "Replayed mutation");
        verdict
      }
      Err(e) => {
        warn!(id = entry.id, error = %e, "Replay failed at the network layer");
        if matches!(e, FetchError::Network(_)) {
          self.connectivity.set(ConnectivityState::Offline);
        }
        ReplayVerdict::Retry
      }
    }
  }
}
