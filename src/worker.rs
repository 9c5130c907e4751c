//! The background context: one object that owns every component and the
//! timers driving them.

use color_eyre::Result;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::cache::{CacheLayer, RouteTable, Router, RouterSettings, SqliteStorage};
use crate::clock::Clock;
use crate::config::Config;
use crate::db::Database;
use crate::flags::{FlagCache, HttpFlagSource, SqliteFlagStore};
use crate::http::{Fetcher, Request, Response};
use crate::lifecycle::{InstallOutcome, Lifecycle, PrecacheManifest};
use crate::queue::{MutationQueue, SqliteMutationStore};
use crate::signal::{ControlMessage, Signal, SignalBus};
use crate::sync::{
  spawn_health_probe, ConnectivityMonitor, ConnectivityState, ReplayReason, ReplayTrigger,
  SyncCoordinator,
};
use crate::timer::TimerHandle;

/// Upper bound for fetching one precache URL.
const PRECACHE_TIMEOUT: Duration = Duration::from_secs(30);

/// Periods of the timers started by [`Worker::start`].
#[derive(Debug, Clone)]
struct TimerSettings {
  purge_interval: Duration,
  health_url: Url,
  probe_interval: Duration,
  probe_timeout: Duration,
  flag_refresh: Duration,
}

pub struct Worker {
  router: Router<SqliteStorage>,
  queue: Arc<MutationQueue>,
  coordinator: Arc<SyncCoordinator>,
  lifecycle: Lifecycle<SqliteStorage>,
  flags: FlagCache,
  bus: SignalBus,
  connectivity: ConnectivityMonitor,
  control_tx: mpsc::UnboundedSender<ControlMessage>,
  control_rx: Mutex<Option<mpsc::UnboundedReceiver<ControlMessage>>>,
  timers: Mutex<Vec<TimerHandle>>,
  timer_settings: TimerSettings,
}

impl Worker {
  /// Wire every component from configuration over one shared database.
  pub fn from_config(
    config: &Config,
    db: Arc<Database>,
    fetcher: Arc<dyn Fetcher>,
    clock: Arc<dyn Clock>,
  ) -> Result<Arc<Self>> {
    let bus = SignalBus::new();
    let connectivity = ConnectivityMonitor::new(ConnectivityState::Online, bus.clone());

    let navigation_timeout = Duration::from_secs(config.cache.navigation_timeout_secs);
    let api_timeout = Duration::from_secs(config.cache.api_timeout_secs);
    let replay_timeout = Duration::from_secs(config.queue.replay_timeout_secs);

    let storage = Arc::new(SqliteStorage::new(db.clone()));
    let layer = CacheLayer::new(storage, fetcher.clone(), clock.clone());

    let queue = Arc::new(MutationQueue::new(
      Arc::new(SqliteMutationStore::new(db.clone())),
      bus.clone(),
      clock.clone(),
      config.retention(),
    )?);
    let coordinator = Arc::new(SyncCoordinator::new(
      queue.clone(),
      fetcher.clone(),
      connectivity.clone(),
      replay_timeout,
      config.backoff(),
    ));

    let (control_tx, control_rx) = mpsc::unbounded_channel();
    let lifecycle = Lifecycle::new(
      layer.clone(),
      db.clone(),
      clock.clone(),
      bus.clone(),
      control_tx.clone(),
      config.base_url()?,
      PRECACHE_TIMEOUT,
    )?;

    let router = Router::new(
      RouteTable::new(&config.api.prefix, &config.api.protected_writes),
      layer,
      queue.clone(),
      connectivity.clone(),
      lifecycle.subscribe_active(),
      RouterSettings {
        navigation_timeout,
        api_timeout,
        write_timeout: replay_timeout,
        shell_document: config.cache.shell_document.clone(),
      },
    );

    let source = HttpFlagSource::new(
      fetcher,
      config.endpoint(&config.flags.endpoint)?,
      api_timeout,
    )
    .with_user(config.flags.user_id.clone(), config.flags.group_id.clone());
    let flags = FlagCache::new(
      Arc::new(source),
      Arc::new(SqliteFlagStore::new(db)),
      clock,
      Duration::from_secs(config.flags.ttl_secs),
    )?;

    let timer_settings = TimerSettings {
      purge_interval: Duration::from_secs(config.queue.purge_interval_secs),
      health_url: config.endpoint(&config.api.health_path)?,
      probe_interval: Duration::from_secs(config.connectivity.probe_interval_secs),
      probe_timeout: api_timeout,
      flag_refresh: Duration::from_secs(config.flags.refresh_interval_secs),
    };

    Ok(Arc::new(Self {
      router,
      queue,
      coordinator,
      lifecycle,
      flags,
      bus,
      connectivity,
      control_tx,
      control_rx: Mutex::new(Some(control_rx)),
      timers: Mutex::new(Vec::new()),
      timer_settings,
    }))
  }

  pub fn queue(&self) -> &Arc<MutationQueue> {
    &self.queue
  }

  pub fn coordinator(&self) -> &Arc<SyncCoordinator> {
    &self.coordinator
  }

  pub fn lifecycle(&self) -> &Lifecycle<SqliteStorage> {
    &self.lifecycle
  }

  pub fn flags(&self) -> &FlagCache {
    &self.flags
  }

  pub fn connectivity(&self) -> &ConnectivityMonitor {
    &self.connectivity
  }

  pub fn subscribe(&self) -> broadcast::Receiver<Signal> {
    self.bus.subscribe()
  }

  /// Channel the UI posts [`ControlMessage`]s on.
  pub fn control_sender(&self) -> mpsc::UnboundedSender<ControlMessage> {
    self.control_tx.clone()
  }

  /// Answer an intercepted request.
  pub async fn handle_fetch(&self, request: Request) -> Response {
    self.router.handle(request).await
  }

  pub async fn install(&self, manifest: &PrecacheManifest) -> Result<InstallOutcome> {
    self.lifecycle.install(manifest).await
  }

  /// Platform connectivity signal. A transition to online starts a replay
  /// pass once timers are running.
  pub fn set_connectivity(&self, state: ConnectivityState) -> bool {
    self.connectivity.set(state)
  }

  /// Replay the queue now, online or not.
  pub async fn flush(&self) -> ReplayTrigger {
    self.coordinator.trigger(ReplayReason::ManualFlush).await
  }

  pub async fn handle_control(&self, message: ControlMessage) {
    debug!(?message, "Control message");
    match message {
      ControlMessage::ActivatePendingUpdate { version } => {
        if let Err(e) = self.lifecycle.activate_pending(&version) {
          error!(version = %version, error = %e, "Activation failed");
        }
      }
      ControlMessage::Flush => {
        if let ReplayTrigger::Completed(summary) = self.flush().await {
          info!(?summary, "Manual flush finished");
        }
      }
      ControlMessage::SetConnectivity { state } => {
        self.set_connectivity(state);
      }
    }
  }

  /// Start the background timers. Calling it again while they run does
  /// nothing.
  pub fn start(self: &Arc<Self>) {
    let mut timers = self.timers.lock().unwrap_or_else(|e| e.into_inner());
    if !timers.is_empty() {
      warn!("Worker already started");
      return;
    }
    let settings = &self.timer_settings;

    let queue = self.queue.clone();
    timers.push(TimerHandle::every(
      "retention-purge",
      settings.purge_interval,
      move || {
        let queue = queue.clone();
        async move {
          if let Err(e) = queue.purge_expired(queue.now()) {
            warn!(error = %e, "Retention purge failed");
          }
        }
      },
    ));

    let coordinator = self.coordinator.clone();
    timers.push(TimerHandle::spawn("replay-backoff", move |mut shutdown| async move {
      loop {
        tokio::select! {
          _ = shutdown.requested() => break,
          _ = coordinator.retry_wanted() => {}
        }
        let delay = coordinator.backoff_delay();
        debug!(?delay, "Retry pass scheduled");
        tokio::select! {
          _ = shutdown.requested() => break,
          _ = tokio::time::sleep(delay) => {}
        }
        coordinator.trigger(ReplayReason::Backoff).await;
      }
    }));

    let coordinator = self.coordinator.clone();
    let mut states = self.connectivity.subscribe();
    timers.push(TimerHandle::spawn("connectivity-watch", move |mut shutdown| async move {
      loop {
        // Entries left by a previous run replay as soon as we are online
        let state = *states.borrow_and_update();
        if state == ConnectivityState::Online {
          coordinator.trigger(ReplayReason::ConnectivityRestored).await;
        }
        tokio::select! {
          _ = shutdown.requested() => break,
          changed = states.changed() => {
            if changed.is_err() {
              break;
            }
          }
        }
      }
    }));

    let taken = self
      .control_rx
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .take();
    if let Some(mut control_rx) = taken {
      let worker = Arc::clone(self);
      timers.push(TimerHandle::spawn("control", move |mut shutdown| async move {
        loop {
          tokio::select! {
            _ = shutdown.requested() => break,
            message = control_rx.recv() => match message {
              Some(message) => worker.handle_control(message).await,
              None => break,
            },
          }
        }
        // Hand the receiver back so a restart keeps listening
        *worker.control_rx.lock().unwrap_or_else(|e| e.into_inner()) = Some(control_rx);
      }));
    }

    timers.push(spawn_health_probe(
      self.router.layer().fetcher().clone(),
      settings.health_url.clone(),
      self.connectivity.clone(),
      settings.probe_interval,
      settings.probe_timeout,
    ));

    timers.push(self.flags.spawn_refresh(settings.flag_refresh));

    info!(timers = timers.len(), "Background timers started");
  }

  /// Stop every timer and wait for in-flight cache refreshes.
  pub async fn shutdown(&self) {
    let timers = std::mem::take(&mut *self.timers.lock().unwrap_or_else(|e| e.into_inner()));
    for timer in timers {
      let name = timer.name();
      timer.stop().await;
      debug!(timer = name, "Stopped");
    }
    self.router.layer().settle().await;
    info!("Worker stopped");
  }
}
