use chrono::{DateTime, Duration, Utc};
use color_eyre::eyre::eyre;
use futures::future::{BoxFuture, FutureExt, Shared};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::source::FlagSource;
use super::store::{FlagSnapshot, FlagStore};
use super::{FeatureFlag, FlagError, FlagEvent};
use crate::clock::Clock;
use crate::timer::TimerHandle;

type InFlight = Shared<BoxFuture<'static, Result<(), FlagError>>>;

/// Flags currently in effect. Always one whole snapshot, never a merge.
#[derive(Default)]
struct FlagState {
  flags: HashMap<String, FeatureFlag>,
  fetched_at: Option<DateTime<Utc>>,
}

impl FlagState {
  fn from_flags(flags: Vec<FeatureFlag>, fetched_at: DateTime<Utc>) -> Self {
    Self {
      flags: flags
        .into_iter()
        .map(|f| (f.flag_key.clone(), f))
        .collect(),
      fetched_at: Some(fetched_at),
    }
  }
}

struct Inner {
  source: Arc<dyn FlagSource>,
  store: Arc<dyn FlagStore>,
  clock: Arc<dyn Clock>,
  ttl: Duration,
  state: RwLock<FlagState>,
  in_flight: Mutex<Option<InFlight>>,
  events: broadcast::Sender<FlagEvent>,
}

/// Client-side cache of feature flags.
///
/// Reads are synchronous against the in-memory set. `fetch_all` replaces the
/// set wholesale and persists it; a failed fetch keeps whatever is loaded.
#[derive(Clone)]
pub struct FlagCache {
  inner: Arc<Inner>,
}

impl FlagCache {
  pub fn new(
    source: Arc<dyn FlagSource>,
    store: Arc<dyn FlagStore>,
    clock: Arc<dyn Clock>,
    ttl: std::time::Duration,
  ) -> color_eyre::Result<Self> {
    let ttl = Duration::from_std(ttl).map_err(|e| eyre!("Invalid flag TTL: {}", e))?;
    let (events, _) = broadcast::channel(32);
    Ok(Self {
      inner: Arc::new(Inner {
        source,
        store,
        clock,
        ttl,
        state: RwLock::new(FlagState::default()),
        in_flight: Mutex::new(None),
        events,
      }),
    })
  }

  /// Whether `key` is enabled. Absent flags are disabled.
  pub fn is_enabled(&self, key: &str) -> bool {
    self
      .inner
      .read_state(|state| state.flags.get(key).is_some_and(|f| f.enabled))
  }

  /// Configuration of `key`, empty if absent.
  pub fn get_config(&self, key: &str) -> Map<String, Value> {
    self.inner.read_state(|state| {
      state
        .flags
        .get(key)
        .map(|f| f.config.clone())
        .unwrap_or_default()
    })
  }

  /// All flags currently in effect, sorted by key.
  pub fn flags(&self) -> Vec<FeatureFlag> {
    let mut flags: Vec<FeatureFlag> = self
      .inner
      .read_state(|state| state.flags.values().cloned().collect());
    flags.sort_by(|a, b| a.flag_key.cmp(&b.flag_key));
    flags
  }

  pub fn fetched_at(&self) -> Option<DateTime<Utc>> {
    self.inner.read_state(|state| state.fetched_at)
  }

  /// True when nothing is loaded or the loaded set is older than the TTL.
  pub fn is_stale(&self) -> bool {
    match self.fetched_at() {
      Some(at) => self.inner.clock.now() - at > self.inner.ttl,
      None => true,
    }
  }

  pub fn subscribe(&self) -> broadcast::Receiver<FlagEvent> {
    self.inner.events.subscribe()
  }

  /// Warm start from the persisted snapshot if it is within the TTL.
  /// Returns whether flags were loaded.
  pub fn load_persisted(&self) -> Result<bool, FlagError> {
    let snapshot = self
      .inner
      .store
      .load()
      .map_err(|e| FlagError::Store(e.to_string()))?;

    match snapshot {
      Some(snapshot) if self.inner.clock.now() - snapshot.fetched_at <= self.inner.ttl => {
        debug!(count = snapshot.flags.len(), "Loaded flag snapshot");
        self.inner.replace(snapshot.flags, snapshot.fetched_at);
        Ok(true)
      }
      Some(_) => {
        debug!("Flag snapshot expired");
        Ok(false)
      }
      None => Ok(false),
    }
  }

  /// Fetch the full flag set.
  ///
  /// Only one fetch runs at a time: a call made while another is outstanding
  /// waits for that one and returns its result.
  pub async fn fetch_all(&self) -> Result<(), FlagError> {
    let fetch = {
      let mut slot = self.inner.in_flight.lock().unwrap_or_else(|e| e.into_inner());
      match slot.as_ref() {
        Some(fetch) => fetch.clone(),
        None => {
          let inner = Arc::clone(&self.inner);
          let fetch = async move { inner.fetch_and_replace().await }.boxed().shared();
          *slot = Some(fetch.clone());
          fetch
        }
      }
    };

    let result = fetch.clone().await;

    let mut slot = self.inner.in_flight.lock().unwrap_or_else(|e| e.into_inner());
    if slot.as_ref().is_some_and(|current| current.ptr_eq(&fetch)) {
      *slot = None;
    }
    result
  }

  /// Fetch only if the loaded set is stale. Reads keep serving the old set
  /// while the fetch runs.
  pub async fn refresh_if_stale(&self) -> Result<(), FlagError> {
    if self.is_stale() {
      self.fetch_all().await
    } else {
      Ok(())
    }
  }

  /// Refresh every `interval`. Failures are logged and never propagate.
  pub fn spawn_refresh(&self, interval: std::time::Duration) -> TimerHandle {
    let cache = self.clone();
    TimerHandle::every("flag-refresh", interval, move || {
      let cache = cache.clone();
      async move {
        if let Err(e) = cache.fetch_all().await {
          warn!(error = %e, "Periodic flag refresh failed");
        }
      }
    })
  }
}

impl Inner {
  fn read_state<T>(&self, f: impl FnOnce(&FlagState) -> T) -> T {
    let state = self.state.read().unwrap_or_else(|e| e.into_inner());
    f(&state)
  }

  fn replace(&self, flags: Vec<FeatureFlag>, fetched_at: DateTime<Utc>) {
    let next = FlagState::from_flags(flags, fetched_at);
    *self.state.write().unwrap_or_else(|e| e.into_inner()) = next;
  }

  fn notify(&self, event: FlagEvent) {
    // No subscribers is fine
    let _ = self.events.send(event);
  }

  async fn fetch_and_replace(self: Arc<Self>) -> Result<(), FlagError> {
    match self.source.fetch_flags().await {
      Ok(flags) => {
        let snapshot = FlagSnapshot {
          flags,
          fetched_at: self.clock.now(),
        };
        let count = snapshot.flags.len();
        self.replace(snapshot.flags.clone(), snapshot.fetched_at);
        if let Err(e) = self.store.save(&snapshot) {
          warn!(error = %e, "Failed to persist flag snapshot");
        }
        info!(count, "Feature flags updated");
        self.notify(FlagEvent::Updated { count });
        Ok(())
      }
      Err(error) => {
        warn!(error = %error, "Feature flag fetch failed, keeping current flags");
        self.fall_back_to_snapshot();
        self.notify(FlagEvent::FetchFailed {
          error: error.clone(),
        });
        Err(error)
      }
    }
  }

  /// With nothing loaded, any persisted snapshot beats no flags, whatever its age.
  fn fall_back_to_snapshot(&self) {
    if self.read_state(|state| state.fetched_at.is_some()) {
      return;
    }
    match self.store.load() {
      Ok(Some(snapshot)) => {
        info!(
          count = snapshot.flags.len(),
          fetched_at = %snapshot.fetched_at,
          "Using last flag snapshot"
        );
        self.replace(snapshot.flags, snapshot.fetched_at);
      }
      Ok(None) => {}
      Err(e) => warn!(error = %e, "Failed to read flag snapshot"),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::clock::ManualClock;
  use crate::db::{from_millis, Database};
  use crate::flags::SqliteFlagStore;
  use crate::http::FetchError;
  use async_trait::async_trait;
  use std::collections::VecDeque;
  use std::sync::atomic::{AtomicUsize, Ordering};

  /// Returns scripted results in order, counting calls.
  struct ScriptedSource {
    results: Mutex<VecDeque<Result<Vec<FeatureFlag>, FlagError>>>,
    calls: AtomicUsize,
    delay: std::time::Duration,
  }

  impl ScriptedSource {
    fn new(results: Vec<Result<Vec<FeatureFlag>, FlagError>>) -> Arc<Self> {
      Arc::new(Self {
        results: Mutex::new(results.into()),
        calls: AtomicUsize::new(0),
        delay: std::time::Duration::from_millis(50),
      })
    }
  }

  #[async_trait]
  impl FlagSource for ScriptedSource {
    async fn fetch_flags(&self) -> Result<Vec<FeatureFlag>, FlagError> {
      self.calls.fetch_add(1, Ordering::SeqCst);
      tokio::time::sleep(self.delay).await;
      self
        .results
        .lock()
        .unwrap()
        .pop_front()
        .unwrap_or(Err(FlagError::Fetch(FetchError::Network("script exhausted".into()))))
    }
  }

  fn flag(key: &str, enabled: bool) -> FeatureFlag {
    let mut config = Map::new();
    config.insert("variant".into(), Value::String(format!("{}-cfg", key)));
    FeatureFlag {
      flag_key: key.to_string(),
      enabled,
      config,
    }
  }

  fn offline() -> Result<Vec<FeatureFlag>, FlagError> {
    Err(FlagError::Fetch(FetchError::Network("offline".into())))
  }

  struct Fixture {
    cache: FlagCache,
    source: Arc<ScriptedSource>,
    store: Arc<SqliteFlagStore>,
    clock: Arc<ManualClock>,
  }

  fn fixture(results: Vec<Result<Vec<FeatureFlag>, FlagError>>) -> Fixture {
    let source = ScriptedSource::new(results);
    let store = Arc::new(SqliteFlagStore::new(Arc::new(
      Database::open_in_memory().unwrap(),
    )));
    let clock = Arc::new(ManualClock::new(from_millis(1_760_000_000_000)));
    let cache = FlagCache::new(
      source.clone(),
      store.clone(),
      clock.clone(),
      std::time::Duration::from_secs(300),
    )
    .unwrap();
    Fixture {
      cache,
      source,
      store,
      clock,
    }
  }

  #[tokio::test(start_paused = true)]
  async fn test_absent_flag_defaults() {
    let f = fixture(vec![Ok(vec![flag("a", true)])]);
    f.cache.fetch_all().await.unwrap();
    assert!(!f.cache.is_enabled("missing"));
    assert!(f.cache.get_config("missing").is_empty());
    assert_eq!(f.cache.get_config("a")["variant"], "a-cfg");
  }

  #[tokio::test(start_paused = true)]
  async fn test_failed_fetch_keeps_existing_flags() {
    let f = fixture(vec![Ok(vec![flag("A", true)]), offline()]);
    let mut events = f.cache.subscribe();

    f.cache.fetch_all().await.unwrap();
    assert!(f.cache.is_enabled("A"));

    assert!(f.cache.fetch_all().await.is_err());
    assert!(f.cache.is_enabled("A"));

    assert_eq!(events.recv().await.unwrap(), FlagEvent::Updated { count: 1 });
    assert!(matches!(
      events.recv().await.unwrap(),
      FlagEvent::FetchFailed { .. }
    ));
  }

  #[tokio::test(start_paused = true)]
  async fn test_successful_fetch_replaces_whole_set() {
    let f = fixture(vec![
      Ok(vec![flag("a", true), flag("b", true)]),
      Ok(vec![flag("b", false)]),
    ]);
    f.cache.fetch_all().await.unwrap();
    f.cache.fetch_all().await.unwrap();

    assert!(!f.cache.is_enabled("a"));
    assert!(!f.cache.is_enabled("b"));
    assert_eq!(f.cache.flags().len(), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_concurrent_fetches_collapse() {
    let f = fixture(vec![Ok(vec![flag("a", true)])]);
    let (r1, r2, r3) = tokio::join!(
      f.cache.fetch_all(),
      f.cache.fetch_all(),
      f.cache.fetch_all()
    );
    assert!(r1.is_ok() && r2.is_ok() && r3.is_ok());
    assert_eq!(f.source.calls.load(Ordering::SeqCst), 1);

    // A later call starts a fresh fetch
    let _ = f.cache.fetch_all().await;
    assert_eq!(f.source.calls.load(Ordering::SeqCst), 2);
  }

  #[tokio::test(start_paused = true)]
  async fn test_concurrent_waiters_share_failure() {
    let f = fixture(vec![offline()]);
    let (r1, r2) = tokio::join!(f.cache.fetch_all(), f.cache.fetch_all());
    assert_eq!(r1, r2);
    assert!(r1.is_err());
    assert_eq!(f.source.calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_fetch_persists_snapshot_for_warm_start() {
    let f = fixture(vec![Ok(vec![flag("a", true)])]);
    f.cache.fetch_all().await.unwrap();

    let restarted = FlagCache::new(
      ScriptedSource::new(vec![]),
      f.store.clone(),
      f.clock.clone(),
      std::time::Duration::from_secs(300),
    )
    .unwrap();
    f.clock.advance(Duration::minutes(4));
    assert!(restarted.load_persisted().unwrap());
    assert!(restarted.is_enabled("a"));
    assert!(!restarted.is_stale());
  }

  #[tokio::test(start_paused = true)]
  async fn test_expired_snapshot_not_loaded_but_used_on_failure() {
    let f = fixture(vec![Ok(vec![flag("a", true)])]);
    f.cache.fetch_all().await.unwrap();
    f.clock.advance(Duration::hours(3));

    let restarted = FlagCache::new(
      ScriptedSource::new(vec![offline()]),
      f.store.clone(),
      f.clock.clone(),
      std::time::Duration::from_secs(300),
    )
    .unwrap();
    assert!(!restarted.load_persisted().unwrap());
    assert!(!restarted.is_enabled("a"));

    assert!(restarted.fetch_all().await.is_err());
    assert!(restarted.is_enabled("a"));
    assert_eq!(restarted.get_config("a")["variant"], "a-cfg");
  }

  #[tokio::test(start_paused = true)]
  async fn test_refresh_if_stale() {
    let f = fixture(vec![Ok(vec![flag("a", true)]), Ok(vec![flag("a", false)])]);
    f.cache.refresh_if_stale().await.unwrap();
    f.cache.refresh_if_stale().await.unwrap();
    assert_eq!(f.source.calls.load(Ordering::SeqCst), 1);

    f.clock.advance(Duration::minutes(6));
    assert!(f.cache.is_stale());
    f.cache.refresh_if_stale().await.unwrap();
    assert!(!f.cache.is_enabled("a"));
  }

  #[tokio::test(start_paused = true)]
  async fn test_periodic_refresh_survives_failures() {
    let f = fixture(vec![offline(), Ok(vec![flag("a", true)])]);
    let timer = f.cache.spawn_refresh(std::time::Duration::from_secs(60));

    tokio::time::sleep(std::time::Duration::from_secs(61)).await;
    assert!(!f.cache.is_enabled("a"));
    tokio::time::sleep(std::time::Duration::from_secs(60)).await;
    assert!(f.cache.is_enabled("a"));

    timer.stop().await;
    assert_eq!(f.source.calls.load(Ordering::SeqCst), 2);
  }

  #[test]
  fn test_out_of_range_ttl_rejected() {
    let f = fixture(vec![]);
    let built = FlagCache::new(
      ScriptedSource::new(vec![]),
      f.store.clone(),
      f.clock.clone(),
      std::time::Duration::from_secs(u64::MAX),
    );
    assert!(built.is_err());
  }
}
