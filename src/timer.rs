//! Cancellable background tasks (purge, refresh, probe, retry loops).

use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;

/// Stop signal handed to a timer task.
#[derive(Clone)]
pub struct Shutdown(watch::Receiver<bool>);

impl Shutdown {
  /// Resolves once stop has been requested or the handle was dropped.
  pub async fn requested(&mut self) {
    while !*self.0.borrow_and_update() {
      if self.0.changed().await.is_err() {
        return;
      }
    }
  }
}

/// Owner of a spawned background task. `stop` ends it cleanly; dropping the
/// handle aborts it.
pub struct TimerHandle {
  name: &'static str,
  stop: watch::Sender<bool>,
  task: Option<JoinHandle<()>>,
}

impl TimerHandle {
  /// Spawn `body` with a [`Shutdown`] it must watch.
  pub fn spawn<F, Fut>(name: &'static str, body: F) -> Self
  where
    F: FnOnce(Shutdown) -> Fut,
    Fut: Future<Output = ()> + Send + 'static,
  {
    let (stop, rx) = watch::channel(false);
    let task = tokio::spawn(body(Shutdown(rx)));
    debug!(timer = name, "Timer started");
    Self {
      name,
      stop,
      task: Some(task),
    }
  }

  /// Run `tick` every `period`, starting one period from now.
  pub fn every<F, Fut>(name: &'static str, period: Duration, mut tick: F) -> Self
  where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
  {
    Self::spawn(name, move |mut shutdown| async move {
      let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
      interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
      loop {
        tokio::select! {
          _ = shutdown.requested() => break,
          _ = interval.tick() => tick().await,
        }
      }
    })
  }

  pub fn name(&self) -> &'static str {
    self.name
  }

  /// Request stop and wait for the task to finish its current tick.
  pub async fn stop(mut self) {
    let _ = self.stop.send(true);
    if let Some(task) = self.task.take() {
      let _ = task.await;
    }
    debug!(timer = self.name, "Timer stopped");
  }
}

impl Drop for TimerHandle {
  fn drop(&mut self) {
    if let Some(task) = self.task.take() {
      task.abort();
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::sync::Arc;

  #[tokio::test(start_paused = true)]
  async fn test_every_ticks_until_stopped() {
    let ticks = Arc::new(AtomicUsize::new(0));
    let counter = ticks.clone();
    let timer = TimerHandle::every("test", Duration::from_secs(10), move || {
      let counter = counter.clone();
      async move {
        counter.fetch_add(1, Ordering::SeqCst);
      }
    });

    tokio::time::sleep(Duration::from_secs(35)).await;
    timer.stop().await;
    assert_eq!(ticks.load(Ordering::SeqCst), 3);

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(ticks.load(Ordering::SeqCst), 3);
  }

  #[tokio::test]
  async fn test_drop_aborts_task() {
    let (tx, rx) = tokio::sync::oneshot::channel::<()>();
    let timer = TimerHandle::spawn("hold", move |_shutdown| async move {
      let _tx = tx;
      futures::future::pending::<()>().await;
    });
    drop(timer);
    // Sender is dropped once the aborted task is torn down
    assert!(rx.await.is_err());
  }
}
