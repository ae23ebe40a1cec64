use chrono::Utc;
use http::header::{HeaderValue, CONTENT_TYPE};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, Notify};
use tracing::{debug, error, info, warn};
use url::Url;
use uuid::Uuid;

use super::queue::{SyncAction, SyncQueue, SyncQueueItem, SyncStatus};
use super::retry::{classify, Failure, RetryPolicy, Sleeper};
use crate::connectivity::{ConnectivityMonitor, ConnectivityState};
use crate::event::{EngineEvent, EventBus};
use crate::http::Request;
use crate::network::TimedNetwork;

/// Outcome of one drain.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
  pub succeeded: usize,
  /// Transient failures that went back to pending
  pub retried: usize,
  /// Items that ended up failed during this drain
  pub failed: usize,
  /// Drain stopped early: connectivity was lost or shutdown was requested
  pub interrupted: bool,
}

/// What the drain does after one attempt.
#[derive(Debug, PartialEq, Eq)]
enum Next {
  Continue,
  Backoff(Duration),
  /// The API is gone; the item waits for the next online transition
  Offline,
}

/// Replays queued mutations against the API, one at a time, oldest first.
pub struct SyncCoordinator {
  queue: Arc<SyncQueue>,
  network: TimedNetwork,
  base_url: Url,
  health_url: Url,
  policy: RetryPolicy,
  sleeper: Arc<dyn Sleeper>,
  connectivity: ConnectivityMonitor,
  events: EventBus,
  idempotency_keys: bool,
  /// Held for the whole of a drain so triggers never overlap
  drain_lock: Mutex<()>,
  nudge: Notify,
}

impl SyncCoordinator {
  #[allow(clippy::too_many_arguments)]
  pub fn new(
    queue: Arc<SyncQueue>,
    network: TimedNetwork,
    base_url: Url,
    health_url: Url,
    policy: RetryPolicy,
    sleeper: Arc<dyn Sleeper>,
    connectivity: ConnectivityMonitor,
    events: EventBus,
    idempotency_keys: bool,
  ) -> Self {
    Self {
      queue,
      network,
      base_url,
      health_url,
      policy,
      sleeper,
      connectivity,
      events,
      idempotency_keys,
      drain_lock: Mutex::new(()),
      nudge: Notify::new(),
    }
  }

  pub fn queue(&self) -> &Arc<SyncQueue> {
    &self.queue
  }

  /// Ask the background loop to drain soon.
  pub fn nudge(&self) {
    self.nudge.notify_one();
  }

  /// Drain the queue until it is empty, everything left has failed, or
  /// connectivity is lost. Concurrent callers wait for the running drain.
  pub async fn drain(&self) -> DrainReport {
    self.drain_until(None).await
  }

  /// Same as `drain`, but also stops as soon as `shutdown` turns true,
  /// including in the middle of a backoff.
  async fn drain_until(&self, mut shutdown: Option<watch::Receiver<bool>>) -> DrainReport {
    let _guard = self.drain_lock.lock().await;
    let mut report = DrainReport::default();

    loop {
      if !self.connectivity.is_online() || stop_requested(&shutdown) {
        report.interrupted = true;
        break;
      }

      let item = match self.queue.dequeue_next() {
        Ok(Some(item)) => item,
        Ok(None) => break,
        Err(e) => {
          error!(error = %e, "Failed to read sync queue");
          break;
        }
      };

      if let Err(e) = self.queue.mark_in_flight(item.id) {
        error!(id = %item.id, error = %e, "Failed to claim sync item");
        break;
      }

      let next = self.replay(&item, &mut report).await;
      self.publish_counts();

      match next {
        Next::Continue => {}
        Next::Offline => {
          report.interrupted = true;
          break;
        }
        Next::Backoff(delay) => {
          if !self.connectivity.is_online() {
            report.interrupted = true;
            break;
          }
          debug!(id = %item.id, delay = ?delay, "Backing off before next attempt");
          if !self.pause(delay, shutdown.as_mut()).await {
            report.interrupted = true;
            break;
          }
        }
      }
    }

    if report != DrainReport::default() {
      info!(
        succeeded = report.succeeded,
        retried = report.retried,
        failed = report.failed,
        interrupted = report.interrupted,
        "Sync drain finished"
      );
    }
    report
  }

  /// Wait out a backoff. Returns false when shutdown came first.
  async fn pause(&self, delay: Duration, shutdown: Option<&mut watch::Receiver<bool>>) -> bool {
    match shutdown {
      Some(shutdown) => {
        tokio::select! {
          _ = self.sleeper.sleep(delay) => true,
          _ = shutdown.wait_for(|stop| *stop) => false,
        }
      }
      None => {
        self.sleeper.sleep(delay).await;
        true
      }
    }
  }

  /// Send one item and record the outcome.
  async fn replay(&self, item: &SyncQueueItem, report: &mut DrainReport) -> Next {
    let outcome = match self.build_request(item) {
      Ok(request) => classify(&self.network.fetch(&request).await),
      Err(reason) => Some(Failure::Permanent(reason)),
    };

    match outcome {
      None => {
        if let Err(e) = self.queue.mark_done(item.id) {
          error!(id = %item.id, error = %e, "Failed to remove synced item");
          return Next::Continue;
        }
        if let Err(e) = self.queue.set_last_synced_at(Utc::now()) {
          warn!(error = %e, "Failed to record sync time");
        }
        info!(id = %item.id, endpoint = %item.endpoint, "Synced queued mutation");
        report.succeeded += 1;
        self.events.emit(EngineEvent::SyncItemSucceeded { id: item.id });
        Next::Continue
      }
      Some(Failure::Permanent(reason)) => {
        error!(id = %item.id, endpoint = %item.endpoint, reason = %reason, "Mutation rejected");
        if let Err(e) = self.queue.mark_permanently_failed(item.id, &reason) {
          error!(id = %item.id, error = %e, "Failed to record rejection");
          return Next::Continue;
        }
        report.failed += 1;
        self.notify_failed(item.id, reason);
        Next::Continue
      }
      Some(Failure::Unreachable(reason)) => {
        // Retries are only spent while the API is reachable
        if self.connectivity.probe(&self.network, &self.health_url).await {
          return self.record_transient(item, reason, report);
        }
        warn!(id = %item.id, reason = %reason, "API unreachable, pausing sync");
        if let Err(e) = self.queue.release(item.id, &reason) {
          error!(id = %item.id, error = %e, "Failed to release sync item");
        }
        Next::Offline
      }
      Some(Failure::Transient(reason)) => self.record_transient(item, reason, report),
    }
  }

  fn record_transient(&self, item: &SyncQueueItem, reason: String, report: &mut DrainReport) -> Next {
    match self.queue.mark_failed(item.id, &reason) {
      Ok(SyncStatus::Failed) => {
        error!(id = %item.id, reason = %reason, "Retries exhausted");
        report.failed += 1;
        self.notify_failed(item.id, reason);
        Next::Continue
      }
      Ok(_) => {
        debug!(id = %item.id, reason = %reason, "Transient sync failure");
        report.retried += 1;
        Next::Backoff(self.policy.backoff(item.retry_count + 1))
      }
      Err(e) => {
        error!(id = %item.id, error = %e, "Failed to record sync failure");
        Next::Continue
      }
    }
  }

  fn build_request(&self, item: &SyncQueueItem) -> Result<Request, String> {
    let url = self
      .base_url
      .join(&item.endpoint)
      .map_err(|e| format!("Invalid endpoint '{}': {}", item.endpoint, e))?;

    let mut request = Request::get(url).with_method(item.method.clone());
    request.headers = item.headers.clone();
    if let Some(payload) = &item.payload {
      if !request.headers.contains_key(CONTENT_TYPE) {
        request = request.with_header(CONTENT_TYPE, HeaderValue::from_static("application/json"));
      }
      request = request.with_body(payload.clone());
    }
    if self.idempotency_keys && item.action == SyncAction::Create {
      let key = HeaderValue::from_str(&item.id.to_string())
        .map_err(|e| format!("Invalid idempotency key: {}", e))?;
      request = request.with_header("idempotency-key", key);
    }
    Ok(request)
  }

  fn notify_failed(&self, id: Uuid, error: String) {
    self
      .events
      .emit(EngineEvent::SyncItemPermanentlyFailed { id, error });
  }

  /// Broadcast the current queue size to pages.
  pub fn publish_counts(&self) {
    match self.queue.counts() {
      Ok(counts) => self.events.emit(EngineEvent::SyncQueueChanged {
        pending: counts.queued(),
        failed: counts.failed,
      }),
      Err(e) => warn!(error = %e, "Failed to count sync queue"),
    }
  }

  /// Background loop: drain on reconnect, on nudge, and periodically while
  /// online. Returns when `shutdown` flips to true.
  pub async fn run(self: Arc<Self>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut connectivity = self.connectivity.subscribe();
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
      if *shutdown.borrow() {
        break;
      }

      tokio::select! {
        changed = connectivity.changed() => {
          if changed.is_err() {
            break;
          }
          let state = *connectivity.borrow_and_update();
          if state == ConnectivityState::Online {
            info!("Back online, draining sync queue");
            self.drain_until(Some(shutdown.clone())).await;
          }
        }
        _ = self.nudge.notified() => {
          if self.connectivity.is_online() {
            self.drain_until(Some(shutdown.clone())).await;
          }
        }
        _ = ticker.tick() => {
          if self.connectivity.is_online() {
            self.drain_until(Some(shutdown.clone())).await;
          }
        }
        changed = shutdown.changed() => {
          if changed.is_err() || *shutdown.borrow() {
            break;
          }
        }
      }
    }
    debug!("Sync loop stopped");
  }
}

fn stop_requested(shutdown: &Option<watch::Receiver<bool>>) -> bool {
  shutdown.as_ref().is_some_and(|rx| *rx.borrow())
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::db::Database;
  use crate::error::FetchError;
  use crate::http::{Method, Response};
  use crate::sync::{Mutation, TokioSleeper};
  use crate::testing::{RecordingSleeper, ScriptedNetwork};
  use serde_json::json;

  struct Harness {
    coordinator: Arc<SyncCoordinator>,
    network: Arc<ScriptedNetwork>,
    sleeper: Arc<RecordingSleeper>,
    connectivity: ConnectivityMonitor,
    events: EventBus,
  }

  impl Harness {
    fn new(max_retries: u32) -> Self {
      let sleeper = Arc::new(RecordingSleeper::default());
      Self::build(max_retries, sleeper.clone(), sleeper, Duration::from_secs(1))
    }

    /// Backoff goes to `waiter` instead of the recording sleeper.
    fn with_sleeper(max_retries: u32, waiter: Arc<dyn Sleeper>, base_delay: Duration) -> Self {
      Self::build(max_retries, waiter, Arc::new(RecordingSleeper::default()), base_delay)
    }

    fn build(
      max_retries: u32,
      waiter: Arc<dyn Sleeper>,
      sleeper: Arc<RecordingSleeper>,
      base_delay: Duration,
    ) -> Self {
      let queue = Arc::new(SyncQueue::open(Database::open_in_memory().unwrap(), max_retries).unwrap());
      let network = Arc::new(ScriptedNetwork::new());
      let connectivity = ConnectivityMonitor::new(true);
      let events = EventBus::default();
      let policy = RetryPolicy {
        max_retries,
        base_delay,
        max_delay: Duration::from_secs(3600),
        multiplier: 2.0,
      };
      let coordinator = Arc::new(SyncCoordinator::new(
        queue,
        TimedNetwork::new(network.clone(), Duration::from_secs(5)),
        Url::parse("https://api.example.org").unwrap(),
        Url::parse("https://api.example.org/health").unwrap(),
        policy,
        waiter,
        connectivity.clone(),
        events.clone(),
        true,
      ));
      Self {
        coordinator,
        network,
        sleeper,
        connectivity,
        events,
      }
    }

    fn queue(&self) -> &SyncQueue {
      self.coordinator.queue()
    }

    fn enqueue(&self, action: SyncAction, endpoint: &str) -> Uuid {
      self
        .queue()
        .enqueue(Mutation::new(action, endpoint).with_json(&json!({"x": 1})))
        .unwrap()
    }
  }

  fn drain_events(rx: &mut tokio::sync::broadcast::Receiver<EngineEvent>) -> Vec<EngineEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
      events.push(event);
    }
    events
  }

  #[tokio::test]
  async fn test_drain_replays_in_order() {
    let h = Harness::new(3);
    h.enqueue(SyncAction::Create, "/bookings");
    h.enqueue(SyncAction::Update, "/bookings/9");
    h.enqueue(SyncAction::Delete, "/bookings/4");
    h.network.respond(Response::new(201, ""));
    h.network.respond(Response::new(200, ""));
    h.network.respond(Response::new(204, ""));

    let report = h.coordinator.drain().await;

    assert_eq!(report.succeeded, 3);
    assert_eq!(
      h.network.calls(),
      vec!["POST /bookings", "PUT /bookings/9", "DELETE /bookings/4"]
    );
    assert!(h.queue().list(None).unwrap().is_empty());
    assert!(h.queue().last_synced_at().unwrap().is_some());
  }

  #[tokio::test]
  async fn test_create_carries_idempotency_key() {
    let h = Harness::new(3);
    let id = h.enqueue(SyncAction::Create, "/bookings");
    h.network.respond(Response::new(201, ""));

    h.coordinator.drain().await;

    let request = &h.network.requests()[0];
    assert_eq!(request.headers["idempotency-key"], id.to_string());
    assert_eq!(request.headers[CONTENT_TYPE], "application/json");
    assert_eq!(request.url.as_str(), "https://api.example.org/bookings");
  }

  #[tokio::test]
  async fn test_permanent_failure_is_not_retried() {
    let h = Harness::new(3);
    let mut rx = h.events.subscribe();
    let id = h.enqueue(SyncAction::Update, "/bookings/9");
    h.network.respond(Response::new(404, ""));

    let report = h.coordinator.drain().await;

    assert_eq!(report.failed, 1);
    assert_eq!(h.network.call_count(), 1);
    let item = h.queue().get(id).unwrap().unwrap();
    assert_eq!(item.status, SyncStatus::Failed);
    assert_eq!(item.retry_count, 0);
    assert!(drain_events(&mut rx).contains(&EngineEvent::SyncItemPermanentlyFailed {
      id,
      error: "HTTP 404".to_string(),
    }));
  }

  #[tokio::test]
  async fn test_transient_failures_back_off_then_fail() {
    let h = Harness::new(3);
    let mut rx = h.events.subscribe();
    let id = h.enqueue(SyncAction::Create, "/bookings");
    h.network.set_fallback(Ok(Response::new(503, "")));

    let report = h.coordinator.drain().await;

    assert_eq!(h.network.call_count(), 3);
    assert_eq!(report.retried, 2);
    assert_eq!(report.failed, 1);
    assert_eq!(
      h.sleeper.delays(),
      vec![Duration::from_secs(1), Duration::from_secs(2)]
    );
    let item = h.queue().get(id).unwrap().unwrap();
    assert_eq!(item.status, SyncStatus::Failed);
    assert_eq!(item.retry_count, 3);
    assert!(drain_events(&mut rx)
      .iter()
      .any(|e| matches!(e, EngineEvent::SyncItemPermanentlyFailed { id: failed, .. } if *failed == id)));
  }

  #[tokio::test]
  async fn test_transient_then_success() {
    let h = Harness::new(5);
    let id = h.enqueue(SyncAction::Create, "/bookings");
    h.network.fail(FetchError::Timeout(Duration::from_secs(10)));
    // Health check after the timeout: the API is still there
    h.network.respond(Response::new(204, ""));
    h.network.respond(Response::new(429, ""));
    h.network.respond(Response::new(201, ""));

    let report = h.coordinator.drain().await;

    assert_eq!(report.succeeded, 1);
    assert_eq!(report.retried, 2);
    assert_eq!(
      h.network.calls(),
      vec!["POST /bookings", "GET /health", "POST /bookings", "POST /bookings"]
    );
    assert!(h.queue().get(id).unwrap().is_none());
  }

  #[tokio::test]
  async fn test_lost_link_pauses_drain_without_spending_retries() {
    let h = Harness::new(5);
    let id = h.enqueue(SyncAction::Create, "/bookings");
    let later = h.enqueue(SyncAction::Update, "/bookings/9");

    // Nothing scripted: every fetch, the health check included, fails
    let report = h.coordinator.drain().await;

    assert!(report.interrupted);
    assert_eq!(report.retried, 0);
    assert_eq!(report.failed, 0);
    assert_eq!(h.network.calls(), vec!["POST /bookings", "GET /health"]);
    assert!(!h.connectivity.is_online());
    assert!(h.sleeper.delays().is_empty());
    let item = h.queue().get(id).unwrap().unwrap();
    assert_eq!(item.status, SyncStatus::Pending);
    assert_eq!(item.retry_count, 0);

    // Back online: resumes from the same item
    h.network.respond(Response::new(201, ""));
    h.network.respond(Response::new(200, ""));
    h.connectivity.set_platform_online(true);
    let report = h.coordinator.drain().await;

    assert_eq!(report.succeeded, 2);
    assert_eq!(
      &h.network.calls()[2..],
      &["POST /bookings".to_string(), "PUT /bookings/9".to_string()]
    );
    assert!(h.queue().get(id).unwrap().is_none());
    assert!(h.queue().get(later).unwrap().is_none());
  }

  #[tokio::test]
  async fn test_manual_retry_replays_exhausted_item() {
    let h = Harness::new(2);
    let id = h.enqueue(SyncAction::Create, "/bookings");
    h.network.set_fallback(Ok(Response::new(503, "")));
    h.coordinator.drain().await;
    assert_eq!(h.queue().get(id).unwrap().unwrap().status, SyncStatus::Failed);
    assert_eq!(h.network.call_count(), 2);

    // Exhausted items are skipped until retried by hand
    h.coordinator.drain().await;
    assert_eq!(h.network.call_count(), 2);

    h.queue().retry(id).unwrap();
    h.network.set_fallback(Ok(Response::new(201, "")));
    let report = h.coordinator.drain().await;

    assert_eq!(report.succeeded, 1);
    assert_eq!(h.network.call_count(), 3);
    assert!(h.queue().get(id).unwrap().is_none());
  }

  #[tokio::test]
  async fn test_failed_item_does_not_block_later_items() {
    let h = Harness::new(3);
    h.enqueue(SyncAction::Update, "/bookings/1");
    let second = h.enqueue(SyncAction::Create, "/bookings");
    h.network.respond(Response::new(400, ""));
    h.network.respond(Response::new(201, ""));

    let report = h.coordinator.drain().await;

    assert_eq!(report.failed, 1);
    assert_eq!(report.succeeded, 1);
    assert!(h.queue().get(second).unwrap().is_none());
  }

  #[tokio::test]
  async fn test_offline_drain_is_a_noop() {
    let h = Harness::new(3);
    h.enqueue(SyncAction::Create, "/bookings");
    h.connectivity.set_platform_online(false);

    let report = h.coordinator.drain().await;

    assert!(report.interrupted);
    assert_eq!(h.network.call_count(), 0);
    assert_eq!(h.queue().counts().unwrap().pending, 1);
  }

  #[tokio::test]
  async fn test_invalid_endpoint_fails_permanently() {
    let h = Harness::new(3);
    let id = h
      .queue()
      .enqueue(Mutation::new(SyncAction::Delete, "http://[::1").with_method(Method::DELETE))
      .unwrap();

    let report = h.coordinator.drain().await;

    assert_eq!(report.failed, 1);
    assert_eq!(h.network.call_count(), 0);
    assert_eq!(h.queue().get(id).unwrap().unwrap().status, SyncStatus::Failed);
  }

  #[tokio::test]
  async fn test_concurrent_drains_do_not_overlap() {
    let h = Harness::new(3);
    h.enqueue(SyncAction::Create, "/bookings");
    h.network.respond(Response::new(201, ""));

    let (a, b) = tokio::join!(h.coordinator.drain(), h.coordinator.drain());

    assert_eq!(a.succeeded + b.succeeded, 1);
    assert_eq!(h.network.call_count(), 1);
  }

  #[tokio::test]
  async fn test_run_drains_on_reconnect() {
    let h = Harness::new(3);
    h.connectivity.set_platform_online(false);
    let id = h.enqueue(SyncAction::Create, "/bookings");
    h.network.respond(Response::new(201, ""));
    let mut rx = h.events.subscribe();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(h.coordinator.clone().run(Duration::from_secs(3600), shutdown_rx));

    h.connectivity.set_platform_online(true);
    let event = tokio::time::timeout(Duration::from_secs(5), async {
      loop {
        match rx.recv().await {
          Ok(EngineEvent::SyncItemSucceeded { id }) => return id,
          Ok(_) => continue,
          Err(e) => panic!("event channel closed: {e}"),
        }
      }
    })
    .await
    .unwrap();

    assert_eq!(event, id);
    shutdown_tx.send(true).unwrap();
    handle.await.unwrap();
  }

  #[tokio::test]
  async fn test_shutdown_cuts_backoff_short() {
    let h = Harness::with_sleeper(3, Arc::new(TokioSleeper), Duration::from_secs(3600));
    let id = h.enqueue(SyncAction::Create, "/bookings");
    h.network.set_fallback(Ok(Response::new(503, "")));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(h.coordinator.clone().run(Duration::from_secs(3600), shutdown_rx));

    tokio::time::timeout(Duration::from_secs(5), async {
      while h.network.call_count() == 0 {
        tokio::task::yield_now().await;
      }
    })
    .await
    .unwrap();
    shutdown_tx.send(true).unwrap();

    tokio::time::timeout(Duration::from_secs(5), handle)
      .await
      .expect("sync loop kept backing off after shutdown")
      .unwrap();
    let item = h.queue().get(id).unwrap().unwrap();
    assert_eq!(item.status, SyncStatus::Pending);
    assert_eq!(item.retry_count, 1);
    assert_eq!(h.network.call_count(), 1);
  }
}
