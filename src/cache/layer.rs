//! Cache layer that orchestrates caching strategies with network fetching.

use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use super::storage::CacheStorage;
use super::traits::{CacheResult, CachedResponse, Strategy};
use crate::clock::Clock;
use crate::http::{fetch_with_timeout, FetchError, Fetcher, Request, Response};

/// Upper bound for a background revalidation fetch.
const REVALIDATE_TIMEOUT: Duration = Duration::from_secs(30);

/// Cache layer that manages caching strategies and network fetching.
///
/// This layer sits between the router and the network, storing successful
/// responses into named caches and serving them when the network fails.
pub struct CacheLayer<S: CacheStorage> {
  storage: Arc<S>,
  fetcher: Arc<dyn Fetcher>,
  clock: Arc<dyn Clock>,
  /// Background refreshes started by stale-while-revalidate
  revalidations: Arc<Mutex<JoinSet<()>>>,
}

impl<S: CacheStorage> CacheLayer<S> {
  /// Create a new cache layer with the given storage backend.
  pub fn new(storage: Arc<S>, fetcher: Arc<dyn Fetcher>, clock: Arc<dyn Clock>) -> Self {
    Self {
      storage,
      fetcher,
      clock,
      revalidations: Arc::new(Mutex::new(JoinSet::new())),
    }
  }

  pub fn storage(&self) -> &Arc<S> {
    &self.storage
  }

  pub fn fetcher(&self) -> &Arc<dyn Fetcher> {
    &self.fetcher
  }

  /// Look up a cached entry. Storage errors count as a miss.
  pub fn lookup(&self, cache_name: &str, url: &str) -> Option<CachedResponse> {
    match self.storage.get(cache_name, url) {
      Ok(entry) => entry,
      Err(e) => {
        warn!(cache = cache_name, url, error = %e, "Cache read failed");
        None
      }
    }
  }

  fn store(&self, cache_name: &str, strategy: Strategy, url: &str, response: &Response) {
    let entry = CachedResponse::from_response(url, strategy, response, self.clock.now());
    if let Err(e) = self.storage.put(cache_name, &entry) {
      warn!(cache = cache_name, url, error = %e, "Cache write failed");
    }
  }

  /// Network-first with a bounded timeout.
  ///
  /// 1. Fetch from network; a 2xx response overwrites the cache entry
  /// 2. On failure or timeout, serve the cached entry unchanged (offline mode)
  /// 3. With nothing cached, report the fetch error
  ///
  /// Non-2xx responses are passed through but never cached.
  pub async fn network_first(
    &self,
    cache_name: &str,
    request: &Request,
    timeout: Duration,
  ) -> Result<CacheResult<Response>, FetchError> {
    let url = request.url.as_str();

    match fetch_with_timeout(self.fetcher.as_ref(), request, timeout).await {
      Ok(response) => {
        if response.is_success() {
          self.store(cache_name, Strategy::NetworkFirst, url, &response);
        }
        Ok(CacheResult::from_network(response))
      }
      Err(err) => {
        debug!(cache = cache_name, url, error = %err, "Network failed, trying cache");
        match self.lookup(cache_name, url) {
          Some(cached) => Ok(CacheResult::offline(cached.to_response(), cached.stored_at)),
          None => Err(err),
        }
      }
    }
  }

  /// Stale-while-revalidate.
  ///
  /// A cached copy is served immediately and refreshed in the background. On a
  /// miss the network response is awaited and stored.
  pub async fn stale_while_revalidate(
    &self,
    cache_name: &str,
    request: &Request,
  ) -> Result<CacheResult<Response>, FetchError> {
    let url = request.url.as_str();

    if let Some(cached) = self.lookup(cache_name, url) {
      self.spawn_revalidate(cache_name, request);
      return Ok(CacheResult::from_cache(cached.to_response(), cached.stored_at));
    }

    let response = fetch_with_timeout(self.fetcher.as_ref(), request, REVALIDATE_TIMEOUT).await?;
    if response.is_success() {
      self.store(cache_name, Strategy::StaleWhileRevalidate, url, &response);
    }
    Ok(CacheResult::from_network(response))
  }

  fn spawn_revalidate(&self, cache_name: &str, request: &Request) {
    let layer = self.clone();
    let cache_name = cache_name.to_string();
    let request = request.clone();

    let mut tasks = self.revalidations.lock().unwrap_or_else(|e| e.into_inner());
    // Reap finished refreshes so the set does not grow without bound
    while tasks.try_join_next().is_some() {}

    tasks.spawn(async move {
      let url = request.url.as_str();
      match fetch_with_timeout(layer.fetcher.as_ref(), &request, REVALIDATE_TIMEOUT).await {
        Ok(response) if response.is_success() => {
          layer.store(&cache_name, Strategy::StaleWhileRevalidate, url, &response);
          debug!(cache = %cache_name, url, "Revalidated cache entry");
        }
        Ok(response) => {
          debug!(cache = %cache_name, url, status = response.status, "Revalidation not cached")
        }
        Err(e) => debug!(cache = %cache_name, url, error = %e, "Revalidation failed"),
      }
    });
  }

  /// Wait for every background refresh started so far.
  pub async fn settle(&self) {
    let mut tasks = {
      let mut guard = self.revalidations.lock().unwrap_or_else(|e| e.into_inner());
      std::mem::take(&mut *guard)
    };
    while tasks.join_next().await.is_some() {}
  }

  /// Store a response fetched ahead of time (precache).
  pub fn precache(&self, cache_name: &str, url: &str, response: &Response) -> color_eyre::Result<()> {
    let entry = CachedResponse::from_response(url, Strategy::Precache, response, self.clock.now());
    self.storage.put(cache_name, &entry)
  }
}

impl<S: CacheStorage> Clone for CacheLayer<S> {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
      fetcher: Arc::clone(&self.fetcher),
      clock: Arc::clone(&self.clock),
      revalidations: Arc::clone(&self.revalidations),
    }
  }
}
