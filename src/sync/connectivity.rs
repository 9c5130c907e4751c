//! Process-wide online/offline state.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info};
use url::Url;

use crate::http::{fetch_with_timeout, Destination, Fetcher, Method, Request};
use crate::signal::{Signal, SignalBus};
use crate::timer::TimerHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectivityState {
  Online,
  Offline,
}

impl fmt::Display for ConnectivityState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(match self {
      Self::Online => "online",
      Self::Offline => "offline",
    })
  }
}

/// Holder of the current [`ConnectivityState`].
///
/// Every transition is announced on the signal bus, in order, before `set`
/// returns. Observers that only need the latest value can `subscribe`.
#[derive(Clone)]
pub struct ConnectivityMonitor {
  state: Arc<watch::Sender<ConnectivityState>>,
  bus: SignalBus,
}

impl ConnectivityMonitor {
  pub fn new(initial: ConnectivityState, bus: SignalBus) -> Self {
    let (tx, _) = watch::channel(initial);
    Self {
      state: Arc::new(tx),
      bus,
    }
  }

  pub fn current(&self) -> ConnectivityState {
    *self.state.borrow()
  }

  pub fn is_online(&self) -> bool {
    self.current() == ConnectivityState::Online
  }

  /// Record a connectivity observation. Returns whether the state changed.
  pub fn set(&self, state: ConnectivityState) -> bool {
    let changed = self.state.send_if_modified(|current| {
      if *current == state {
        false
      } else {
        *current = state;
        true
      }
    });

    if changed {
      info!(%state, "Connectivity changed");
      self.bus.emit(Signal::ConnectivityChanged { state });
    }
    changed
  }

  pub fn subscribe(&self) -> watch::Receiver<ConnectivityState> {
    self.state.subscribe()
  }
}

/// Periodically probe `health_url` and feed the result into `monitor`.
///
/// Any HTTP response counts as online; a fetch error or timeout counts as
/// offline.
pub fn spawn_health_probe(
  fetcher: Arc<dyn Fetcher>,
  health_url: Url,
  monitor: ConnectivityMonitor,
  interval: Duration,
  timeout: Duration,
) -> TimerHandle {
  let probe = Request {
    method: Method::Get,
    url: health_url,
    headers: Vec::new(),
    body: Vec::new(),
    destination: Destination::Empty,
  };

  TimerHandle::every("health-probe", interval, move || {
    let fetcher = fetcher.clone();
    let monitor = monitor.clone();
    let request = probe.clone();
    async move {
      let state = match fetch_with_timeout(fetcher.as_ref(), &request, timeout).await {
        Ok(_) => ConnectivityState::Online,
        Err(e) => {
          debug!(error = %e, "Health probe failed");
          ConnectivityState::Offline
        }
      };
      monitor.set(state);
    }
  })
}
