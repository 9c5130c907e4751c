//! Entry point for intercepted requests: classify, then apply a strategy.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, warn};

use super::layer::CacheLayer;
use super::routes::{RouteKind, RouteTable};
use super::storage::CacheStorage;
use super::traits::{CacheResult, CacheSource, Partition};
use crate::http::{fetch_with_timeout, FetchError, Request, Response};
use crate::queue::{is_transient_status, MutationQueue};
use crate::sync::{ConnectivityMonitor, ConnectivityState};

/// Header on the synthetic response for a write that was queued.
pub const QUEUED_HEADER: &str = "x-lessonsw-queued";

/// Timeouts and fallbacks applied by the router.
#[derive(Debug, Clone)]
pub struct RouterSettings {
  pub navigation_timeout: Duration,
  pub api_timeout: Duration,
  pub write_timeout: Duration,
  /// Path of the shell document served for any failed navigation
  pub shell_document: String,
}

impl Default for RouterSettings {
  fn default() -> Self {
    Self {
      navigation_timeout: Duration::from_secs(5),
      api_timeout: Duration::from_secs(3),
      write_timeout: Duration::from_secs(10),
      shell_document: "/index.html".to_string(),
    }
  }
}

pub struct Router<S: CacheStorage> {
  routes: RouteTable,
  layer: CacheLayer<S>,
  queue: Arc<MutationQueue>,
  connectivity: ConnectivityMonitor,
  /// Active deployable version, names the shell and asset caches
  version: watch::Receiver<Option<String>>,
  settings: RouterSettings,
}

impl<S: CacheStorage> Router<S> {
  pub fn new(
    routes: RouteTable,
    layer: CacheLayer<S>,
    queue: Arc<MutationQueue>,
    connectivity: ConnectivityMonitor,
    version: watch::Receiver<Option<String>>,
    settings: RouterSettings,
  ) -> Self {
    Self {
      routes,
      layer,
      queue,
      connectivity,
      version,
      settings,
    }
  }

  pub fn layer(&self) -> &CacheLayer<S> {
    &self.layer
  }

  pub fn classify(&self, request: &Request) -> RouteKind {
    self.routes.classify(request)
  }

  fn cache_name(&self, partition: Partition) -> String {
    partition.cache_name(self.version.borrow().as_deref())
  }

  /// Answer an intercepted request. Never fails: the terminal fallback is the
  /// cached shell for navigations and a generic error response otherwise.
  pub async fn handle(&self, request: Request) -> Response {
    let kind = self.classify(&request);
    debug!(url = %request.url, ?kind, "Routing request");

    let result = match &kind {
      RouteKind::Navigation => {
        let cache = self.cache_name(Partition::Shell);
        self
          .layer
          .network_first(&cache, &request, self.settings.navigation_timeout)
          .await
      }
      RouteKind::ApiRead => {
        let cache = self.cache_name(Partition::Api);
        self
          .layer
          .network_first(&cache, &request, self.settings.api_timeout)
          .await
      }
      RouteKind::StaticAsset => {
        let cache = self.cache_name(Partition::Asset);
        self.layer.stale_while_revalidate(&cache, &request).await
      }
      RouteKind::ProtectedWrite { session_id } => {
        return self.handle_write(&request, session_id.clone()).await;
      }
      RouteKind::Passthrough => self
        .layer
        .fetcher()
        .fetch(&request)
        .await
        .map(CacheResult::from_network),
    };

    match result {
      Ok(served) => {
        self.observe(served.source, None);
        served.data
      }
      Err(err) => {
        self.observe(CacheSource::Offline, Some(&err));
        self.fallback(&request, &kind, err)
      }
    }
  }

  /// Feed what the network did into the connectivity state.
  fn observe(&self, source: CacheSource, err: Option<&FetchError>) {
    match (source, err) {
      (CacheSource::Network, _) => {
        self.connectivity.set(ConnectivityState::Online);
      }
      (_, Some(FetchError::Network(_))) => {
        self.connectivity.set(ConnectivityState::Offline);
      }
      _ => {}
    }
  }

  fn fallback(&self, request: &Request, kind: &RouteKind, err: FetchError) -> Response {
    if *kind == RouteKind::Navigation {
      if let Ok(shell_url) = request.url.join(&self.settings.shell_document) {
        let cache = self.cache_name(Partition::Shell);
        if let Some(shell) = self.layer.lookup(&cache, shell_url.as_str()) {
          debug!(url = %request.url, "Serving cached shell for failed navigation");
          return shell.to_response();
        }
      }
    }

    warn!(url = %request.url, error = %err, "No network and nothing cached");
    Response::network_error()
  }

  /// Try a protected write once; queue it if the network is unavailable.
  /// A write whose session still has queued entries goes straight to the
  /// queue so the server sees the session's writes in order.
  async fn handle_write(&self, request: &Request, session_id: Option<String>) -> Response {
    let ordering_key = session_id.as_deref().unwrap_or("");
    let behind_queued = self
      .queue
      .has_pending_for(ordering_key, self.queue.now())
      .unwrap_or_else(|e| {
        warn!(url = %request.url, error = %e, "Could not check queued writes, queueing");
        true
      });
    if behind_queued {
      debug!(url = %request.url, session = ordering_key, "Earlier writes queued, queueing behind them");
      return self.queue_write(request, session_id);
    }

    let network_error = match fetch_with_timeout(
      self.layer.fetcher().as_ref(),
      request,
      self.settings.write_timeout,
    )
    .await
    {
      Ok(response) if !is_transient_status(response.status) => {
        self.connectivity.set(ConnectivityState::Online);
        return response;
      }
      Ok(response) => {
        debug!(url = %request.url, status = response.status, "Server unavailable, queueing write");
        None
      }
      Err(err) => {
        debug!(url = %request.url, error = %err, "Network failed, queueing write");
        Some(err)
      }
    };

    if let Some(err) = &network_error {
      self.observe(CacheSource::Offline, Some(err));
    }

    self.queue_write(request, session_id)
  }

  fn queue_write(&self, request: &Request, session_id: Option<String>) -> Response {
    match self.queue.enqueue(request, session_id) {
      Ok(entry) => {
        let body = serde_json::json!({ "queued": true, "id": entry.id }).to_string();
        Response::new(202, body)
          .with_header("content-type", "application/json")
          .with_header(QUEUED_HEADER, &entry.id.to_string())
      }
      Err(e) => {
        error!(url = %request.url, error = %e, "Failed to queue write");
        Response::network_error()
      }
    }
  }
}
