//! Shared fixtures: a scripted network and a worker over in-memory SQLite.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, watch};

use lessonsw::clock::ManualClock;
use lessonsw::config::Config;
use lessonsw::db::Database;
use lessonsw::http::{FetchError, Fetcher, Method, Request, Response};
use lessonsw::queue::MutationOutcome;
use lessonsw::signal::Signal;
use lessonsw::Worker;

pub const ORIGIN: &str = "https://lessons.test";

pub fn url(path: &str) -> String {
  format!("{}{}", ORIGIN, path)
}

/// What the network does for one request.
#[derive(Debug, Clone)]
pub enum Step {
  Respond(Response),
  Fail(FetchError),
  /// Respond after a delay
  Delay(Duration, Response),
}

impl Step {
  pub fn status(status: u16, body: &str) -> Self {
    Self::Respond(Response::new(status, body))
  }

  pub fn json(status: u16, body: serde_json::Value) -> Self {
    Self::Respond(
      Response::new(status, body.to_string()).with_header("content-type", "application/json"),
    )
  }
}

/// Network stand-in. Steps are scripted per method and path and consumed in
/// order; the last step for a route repeats. Unscripted routes return 404.
pub struct ScriptedFetcher {
  routes: Mutex<HashMap<(Method, String), VecDeque<Step>>>,
  log: Mutex<Vec<Request>>,
  offline: AtomicBool,
  gate: watch::Sender<bool>,
}

impl ScriptedFetcher {
  pub fn new() -> Arc<Self> {
    let (gate, _) = watch::channel(true);
    Arc::new(Self {
      routes: Mutex::new(HashMap::new()),
      log: Mutex::new(Vec::new()),
      offline: AtomicBool::new(false),
      gate,
    })
  }

  pub fn on(&self, method: Method, path: &str, steps: Vec<Step>) {
    self
      .routes
      .lock()
      .unwrap()
      .insert((method, path.to_string()), steps.into());
  }

  /// Every request fails at the network layer while offline.
  pub fn set_offline(&self, offline: bool) {
    self.offline.store(offline, Ordering::SeqCst);
  }

  /// Hold every request after it is logged until [`open`] is called.
  pub fn close(&self) {
    self.gate.send_replace(false);
  }

  pub fn open(&self) {
    self.gate.send_replace(true);
  }

  pub fn requests(&self) -> Vec<Request> {
    self.log.lock().unwrap().clone()
  }

  pub fn requests_to(&self, method: Method, path: &str) -> Vec<Request> {
    self
      .requests()
      .into_iter()
      .filter(|r| r.method == method && r.url.path() == path)
      .collect()
  }

  fn next_step(&self, method: Method, path: &str) -> Step {
    let mut routes = self.routes.lock().unwrap();
    match routes.get_mut(&(method, path.to_string())) {
      Some(steps) if steps.len() > 1 => steps.pop_front().unwrap(),
      Some(steps) => steps.front().cloned().unwrap_or(Step::status(404, "")),
      None => Step::status(404, ""),
    }
  }
}

#[async_trait]
impl Fetcher for ScriptedFetcher {
  async fn fetch(&self, request: &Request) -> Result<Response, FetchError> {
    self.log.lock().unwrap().push(request.clone());

    let mut gate = self.gate.subscribe();
    while !*gate.borrow_and_update() {
      if gate.changed().await.is_err() {
        break;
      }
    }

    if self.offline.load(Ordering::SeqCst) {
      return Err(FetchError::Network("connection refused".into()));
    }

    match self.next_step(request.method, request.url.path()) {
      Step::Respond(response) => Ok(response),
      Step::Fail(err) => Err(err),
      Step::Delay(delay, response) => {
        tokio::time::sleep(delay).await;
        Ok(response)
      }
    }
  }
}

pub fn config() -> Config {
  Config::parse(
    r#"
api:
  base_url: https://lessons.test
queue:
  backoff:
    base_secs: 1
    max_secs: 4
    jitter_ms: 0
"#,
  )
  .unwrap()
}

pub fn start_time() -> DateTime<Utc> {
  DateTime::<Utc>::from_timestamp_millis(1_760_000_000_000).unwrap()
}

pub struct Harness {
  pub worker: Arc<Worker>,
  pub fetcher: Arc<ScriptedFetcher>,
  pub clock: Arc<ManualClock>,
  pub db: Arc<Database>,
  pub signals: broadcast::Receiver<Signal>,
}

pub fn harness() -> Harness {
  let fetcher = ScriptedFetcher::new();
  let clock = Arc::new(ManualClock::new(start_time()));
  let db = Arc::new(Database::open_in_memory().unwrap());
  let worker = Worker::from_config(&config(), db.clone(), fetcher.clone(), clock.clone()).unwrap();
  let signals = worker.subscribe();
  Harness {
    worker,
    fetcher,
    clock,
    db,
    signals,
  }
}

pub fn answer(session: &str, answer: u32) -> Request {
  Request::post_json(
    &url(&format!("/api/v1/sessions/{}/answers", session)),
    &serde_json::json!({ "answer": answer }),
  )
  .unwrap()
}

pub fn body_json(request: &Request) -> serde_json::Value {
  serde_json::from_slice(&request.body).unwrap()
}

/// Next queue outcome on the bus, skipping other signals.
pub async fn next_resolved(rx: &mut broadcast::Receiver<Signal>) -> (i64, MutationOutcome) {
  tokio::time::timeout(Duration::from_secs(5), async {
    loop {
      if let Signal::MutationResolved { id, outcome } = rx.recv().await.unwrap() {
        return (id, outcome);
      }
    }
  })
  .await
  .expect("no queue outcome within 5s")
}

/// Signals already delivered, without waiting.
pub fn drain(rx: &mut broadcast::Receiver<Signal>) -> Vec<Signal> {
  std::iter::from_fn(|| rx.try_recv().ok()).collect()
}
