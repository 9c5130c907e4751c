//! One-directional notification channel from the background context to the UI.

use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

use crate::queue::MutationOutcome;
use crate::sync::ConnectivityState;

const BUS_CAPACITY: usize = 256;

/// Events delivered to the UI.
///
/// Fire-and-forget: a subscriber only sees events emitted while it is
/// subscribed. A UI that reconnects must poll state instead.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum Signal {
  /// A new version is installed and waiting
  #[serde(rename = "sw-update-available")]
  UpdateAvailable {
    version: String,
    #[serde(skip)]
    activation: ActivationHandle,
  },
  /// The first version finished precaching; the app works offline
  #[serde(rename = "sw-offline-ready")]
  OfflineReady { version: String },
  /// A queued write reached a terminal outcome
  #[serde(rename = "sw-queue-status")]
  MutationResolved {
    id: i64,
    #[serde(flatten)]
    outcome: MutationOutcome,
  },
  #[serde(rename = "sw-connectivity")]
  ConnectivityChanged { state: ConnectivityState },
}

impl Signal {
  /// Event name on the wire.
  pub fn name(&self) -> &'static str {
    match self {
      Self::UpdateAvailable { .. } => "sw-update-available",
      Self::OfflineReady { .. } => "sw-offline-ready",
      Self::MutationResolved { .. } => "sw-queue-status",
      Self::ConnectivityChanged { .. } => "sw-connectivity",
    }
  }
}

/// Messages from the UI to the background context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
  /// Take over with the waiting version now
  ActivatePendingUpdate { version: String },
  /// Replay the queue now
  Flush,
  /// Platform connectivity signal
  SetConnectivity { state: ConnectivityState },
}

/// Callback carried by [`Signal::UpdateAvailable`]; invoking it asks the
/// background context to activate the waiting version.
#[derive(Clone)]
pub struct ActivationHandle {
  version: String,
  control: mpsc::UnboundedSender<ControlMessage>,
}

impl ActivationHandle {
  pub fn new(version: &str, control: mpsc::UnboundedSender<ControlMessage>) -> Self {
    Self {
      version: version.to_string(),
      control,
    }
  }

  pub fn version(&self) -> &str {
    &self.version
  }

  /// Post the activation request. Returns false if the background context is gone.
  pub fn activate(&self) -> bool {
    self
      .control
      .send(ControlMessage::ActivatePendingUpdate {
        version: self.version.clone(),
      })
      .is_ok()
  }
}

impl fmt::Debug for ActivationHandle {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ActivationHandle")
      .field("version", &self.version)
      .finish()
  }
}

/// Single-producer, multi-consumer broadcast of [`Signal`]s.
#[derive(Clone)]
pub struct SignalBus {
  tx: broadcast::Sender<Signal>,
}

impl SignalBus {
  pub fn new() -> Self {
    let (tx, _) = broadcast::channel(BUS_CAPACITY);
    Self { tx }
  }

  /// Emit to current subscribers. Returns how many received it; zero is not an error.
  pub fn emit(&self, signal: Signal) -> usize {
    let name = signal.name();
    match self.tx.send(signal) {
      Ok(n) => {
        debug!(signal = name, receivers = n, "Signal emitted");
        n
      }
      Err(_) => {
        debug!(signal = name, "Signal dropped, no subscribers");
        0
      }
    }
  }

  pub fn subscribe(&self) -> broadcast::Receiver<Signal> {
    self.tx.subscribe()
  }
}

impl Default for SignalBus {
  fn default() -> Self {
    Self::new()
  }
}

/// Receive the next signal, skipping over any the receiver lagged behind on.
pub async fn next_signal(rx: &mut broadcast::Receiver<Signal>) -> Option<Signal> {
  loop {
    match rx.recv().await {
      Ok(signal) => return Some(signal),
      Err(broadcast::error::RecvError::Lagged(n)) => {
        warn!(missed = n, "Signal subscriber lagged");
      }
      Err(broadcast::error::RecvError::Closed) => return None,
    }
  }
}
