mod common;

use std::time::Duration;

use common::{answer, harness, url, Step};
use lessonsw::cache::{CacheStorage, SqliteStorage, QUEUED_HEADER};
use lessonsw::http::{Destination, FetchError, Method, Request, Response};
use lessonsw::lifecycle::PrecacheManifest;
use lessonsw::sync::ConnectivityState;

const LESSONS: &str = "/api/v1/lessons";

#[tokio::test(start_paused = true)]
async fn test_slow_api_read_serves_cached_copy() {
  let h = harness();
  h.fetcher.on(
    Method::Get,
    LESSONS,
    vec![
      Step::status(200, "lessons v1"),
      Step::Delay(Duration::from_secs(10), Response::new(200, "lessons v2")),
    ],
  );

  let fresh = h.worker.handle_fetch(Request::get(&url(LESSONS)).unwrap()).await;
  assert_eq!(fresh.text(), "lessons v1");

  let started = tokio::time::Instant::now();
  let served = h.worker.handle_fetch(Request::get(&url(LESSONS)).unwrap()).await;
  assert_eq!(served.text(), "lessons v1");
  assert!(started.elapsed() >= Duration::from_secs(3));
  assert!(started.elapsed() < Duration::from_secs(10));

  // The timed-out response never reached the cache
  let storage = SqliteStorage::new(h.db.clone());
  let entry = storage.get("api-runtime", &url(LESSONS)).unwrap().unwrap();
  assert_eq!(entry.body, b"lessons v1");
  // A timeout alone says nothing about connectivity
  assert_eq!(
    h.worker.connectivity().current(),
    ConnectivityState::Online
  );
}

#[tokio::test]
async fn test_api_error_status_is_not_cached() {
  let h = harness();
  h.fetcher.on(
    Method::Get,
    LESSONS,
    vec![Step::status(200, "good"), Step::status(500, "broken")],
  );

  h.worker.handle_fetch(Request::get(&url(LESSONS)).unwrap()).await;
  let response = h.worker.handle_fetch(Request::get(&url(LESSONS)).unwrap()).await;
  assert_eq!(response.status, 500);

  h.fetcher.set_offline(true);
  let offline = h.worker.handle_fetch(Request::get(&url(LESSONS)).unwrap()).await;
  assert_eq!(offline.text(), "good");
  assert_eq!(
    h.worker.connectivity().current(),
    ConnectivityState::Offline
  );
}

#[tokio::test]
async fn test_static_asset_served_cached_then_refreshed() {
  let h = harness();
  h.fetcher.on(
    Method::Get,
    "/app.js",
    vec![Step::status(200, "js-1"), Step::status(200, "js-2")],
  );
  let script = || {
    Request::get(&url("/app.js"))
      .unwrap()
      .with_destination(Destination::Script)
  };

  assert_eq!(h.worker.handle_fetch(script()).await.text(), "js-1");
  // Cached copy first, refresh in the background
  assert_eq!(h.worker.handle_fetch(script()).await.text(), "js-1");
  h.worker.shutdown().await;
  assert_eq!(h.worker.handle_fetch(script()).await.text(), "js-2");
  h.worker.shutdown().await;
  assert_eq!(h.fetcher.requests_to(Method::Get, "/app.js").len(), 3);
}

#[tokio::test]
async fn test_failed_navigation_falls_back_to_shell() {
  let h = harness();
  h.fetcher.on(Method::Get, "/index.html", vec![Step::status(200, "<html>shell</html>")]);
  h.worker
    .install(&PrecacheManifest {
      version: "v1".into(),
      shell: vec!["/index.html".into()],
      assets: vec![],
    })
    .await
    .unwrap();

  h.fetcher.set_offline(true);
  let page = h
    .worker
    .handle_fetch(Request::navigate(&url("/lessons/42")).unwrap())
    .await;
  assert_eq!(page.status, 200);
  assert_eq!(page.text(), "<html>shell</html>");

  let api = h.worker.handle_fetch(Request::get(&url(LESSONS)).unwrap()).await;
  assert_eq!(api.status, 503);
  assert_eq!(api.text(), "Network error");
}

#[tokio::test]
async fn test_navigation_without_shell_is_generic_error() {
  let h = harness();
  h.fetcher.on(
    Method::Get,
    "/lessons/42",
    vec![Step::Fail(FetchError::Network("dns".into()))],
  );
  let page = h
    .worker
    .handle_fetch(Request::navigate(&url("/lessons/42")).unwrap())
    .await;
  assert_eq!(page.status, 503);
}

#[tokio::test]
async fn test_protected_write_queued_on_server_unavailable() {
  let h = harness();
  h.fetcher.on(
    Method::Post,
    "/api/v1/sessions/s1/answers",
    vec![Step::status(503, "maintenance")],
  );

  let response = h.worker.handle_fetch(answer("s1", 7)).await;
  assert_eq!(response.status, 202);
  let body: serde_json::Value = serde_json::from_slice(&response.body).unwrap();
  assert_eq!(body["queued"], true);
  let id = body["id"].as_i64().unwrap();
  assert_eq!(response.header(QUEUED_HEADER), Some(id.to_string().as_str()));

  let queue = h.worker.queue();
  let pending = queue.pending(queue.now()).unwrap();
  assert_eq!(pending.len(), 1);
  assert_eq!(pending[0].id, id);
  assert_eq!(pending[0].session_id.as_deref(), Some("s1"));
}

#[tokio::test]
async fn test_rejected_write_passes_through() {
  let h = harness();
  h.fetcher.on(
    Method::Post,
    "/api/v1/sessions/s1/hints",
    vec![Step::status(400, "no hints left")],
  );

  let hint = Request::post_json(
    &url("/api/v1/sessions/s1/hints"),
    &serde_json::json!({ "step": 2 }),
  )
  .unwrap();
  let response = h.worker.handle_fetch(hint).await;
  assert_eq!(response.status, 400);
  assert_eq!(response.text(), "no hints left");
  assert!(h.worker.queue().is_empty().unwrap());
}

#[tokio::test]
async fn test_unprotected_write_is_never_queued() {
  let h = harness();
  h.fetcher.set_offline(true);

  let request = Request::post_json(
    &url("/api/v1/profile"),
    &serde_json::json!({ "name": "x" }),
  )
  .unwrap();
  let response = h.worker.handle_fetch(request).await;
  assert_eq!(response.status, 503);
  assert!(h.worker.queue().is_empty().unwrap());
}
