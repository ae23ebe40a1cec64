//! The engine: one long-lived object owning the interceptor, the sync queue
//! and the background loops, with the operations pages call.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, info};
use url::Url;
use uuid::Uuid;

use crate::cache::{CacheStorage, NoopStorage, Served, SqliteStorage};
use crate::config::Config;
use crate::connectivity::ConnectivityMonitor;
use crate::db::Database;
use crate::error::QueueError;
use crate::event::{EngineEvent, EventBus};
use crate::http::Request;
use crate::interceptor::{Registration, Worker, WorkerState};
use crate::network::{Network, TimedNetwork};
use crate::push::{LogNotifier, Notifier, PushHook};
use crate::sync::{
  DrainReport, Mutation, RetryPolicy, Sleeper, SyncCoordinator, SyncQueue, SyncQueueItem,
  SyncStatus, TokioSleeper,
};

/// Snapshot returned by [`Engine::status`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineStatus {
  /// Pending and in-flight items
  pub queue_size: usize,
  pub failed_count: usize,
  pub last_successful_sync: Option<DateTime<Utc>>,
  pub online: bool,
  pub active_version: Option<String>,
}

/// Collaborators that tests and embedders may replace.
pub struct EngineOptions {
  pub sleeper: Arc<dyn Sleeper>,
  pub notifier: Arc<dyn Notifier>,
  pub initially_online: bool,
}

impl Default for EngineOptions {
  fn default() -> Self {
    Self {
      sleeper: Arc::new(TokioSleeper),
      notifier: Arc::new(LogNotifier),
      initially_online: true,
    }
  }
}

pub struct Engine {
  config: Config,
  events: EventBus,
  connectivity: ConnectivityMonitor,
  network: TimedNetwork,
  storage: Arc<dyn CacheStorage>,
  registration: Registration,
  coordinator: Arc<SyncCoordinator>,
  push: PushHook,
  health_url: Url,
  shutdown: watch::Sender<bool>,
  tasks: Mutex<JoinSet<()>>,
}

impl Engine {
  pub fn new(config: Config, db: Database, network: Arc<dyn Network>) -> Result<Self> {
    Self::with_options(config, db, network, EngineOptions::default())
  }

  pub fn with_options(
    config: Config,
    db: Database,
    network: Arc<dyn Network>,
    options: EngineOptions,
  ) -> Result<Self> {
    config.validate()?;

    let events = EventBus::default();
    let network = TimedNetwork::new(network, config.network.timeout);
    let connectivity = ConnectivityMonitor::new(options.initially_online);

    let storage: Arc<dyn CacheStorage> = if config.cache.enabled {
      Arc::new(SqliteStorage::new(db.clone()))
    } else {
      info!("Response cache disabled");
      Arc::new(NoopStorage)
    };

    let health_url = config
      .api
      .base_url
      .join(&config.api.health_path)
      .map_err(|e| eyre!("Invalid health path '{}': {}", config.api.health_path, e))?;

    let queue = Arc::new(SyncQueue::open(db, config.sync.max_retries)?);
    let coordinator = Arc::new(SyncCoordinator::new(
      queue,
      network.clone(),
      config.api.base_url.clone(),
      health_url.clone(),
      RetryPolicy::from_config(&config.sync),
      options.sleeper,
      connectivity.clone(),
      events.clone(),
      config.sync.idempotency_keys,
    ));

    let push = PushHook::new(config.push.clone(), options.notifier, events.clone());
    let (shutdown, _) = watch::channel(false);

    Ok(Self {
      registration: Registration::new(network.clone()),
      config,
      events,
      connectivity,
      network,
      storage,
      coordinator,
      push,
      health_url,
      shutdown,
      tasks: Mutex::new(JoinSet::new()),
    })
  }

  /// Install the interceptor version described by the configuration.
  pub async fn install(&self) -> Result<WorkerState> {
    let worker = Worker::new(
      &self.config,
      Arc::clone(&self.storage),
      self.network.clone(),
      self.events.clone(),
    )?;
    Ok(self.registration.register(worker).await?)
  }

  /// Spawn the sync loop and the connectivity probe.
  pub async fn start(&self) {
    let mut tasks = self.tasks.lock().await;

    tasks.spawn(
      Arc::clone(&self.coordinator).run(self.config.sync.interval, self.shutdown.subscribe()),
    );
    tasks.spawn(self.connectivity.clone().run_probe(
      self.network.clone(),
      self.health_url.clone(),
      self.config.connectivity.probe_interval,
      self.shutdown.subscribe(),
    ));

    self.coordinator.publish_counts();
    info!(base_url = %self.config.api.base_url, "Engine started");
  }

  /// Stop background loops and wait for pending cache writes.
  pub async fn shutdown(&self) {
    self.shutdown.send_replace(true);

    let mut tasks = self.tasks.lock().await;
    while let Some(result) = tasks.join_next().await {
      if let Err(e) = result {
        debug!(error = %e, "Background task ended abnormally");
      }
    }
    drop(tasks);

    self.settle().await;
    info!("Engine stopped");
  }

  /// Serve a page request. Never fails: offline requests get a cached copy,
  /// the offline document, or a synthetic error response.
  pub async fn fetch(&self, request: Request) -> Served {
    self.registration.handle(request).await
  }

  /// Queue a mutation for replay and nudge the sync loop.
  pub async fn submit(&self, mutation: Mutation) -> Result<Uuid, QueueError> {
    let id = self.coordinator.queue().enqueue(mutation)?;
    self.coordinator.publish_counts();
    self.coordinator.nudge();
    Ok(id)
  }

  /// Drain the queue now, waiting for any drain already running.
  pub async fn force_sync(&self) -> DrainReport {
    self.coordinator.drain().await
  }

  /// Remove queued items, all of them or only those with `status`.
  pub fn clear_queue(&self, status: Option<SyncStatus>) -> Result<usize, QueueError> {
    let removed = self.coordinator.queue().clear(status)?;
    self.coordinator.publish_counts();
    Ok(removed)
  }

  /// Give a failed item a fresh set of retries.
  pub fn retry_item(&self, id: Uuid) -> Result<(), QueueError> {
    self.coordinator.queue().retry(id)?;
    self.coordinator.publish_counts();
    self.coordinator.nudge();
    Ok(())
  }

  pub fn queue_items(&self, status: Option<SyncStatus>) -> Result<Vec<SyncQueueItem>, QueueError> {
    self.coordinator.queue().list(status)
  }

  pub async fn status(&self) -> Result<EngineStatus, QueueError> {
    let queue = self.coordinator.queue();
    let counts = queue.counts()?;
    Ok(EngineStatus {
      queue_size: counts.queued(),
      failed_count: counts.failed,
      last_successful_sync: queue.last_synced_at()?,
      online: self.connectivity.is_online(),
      active_version: self
        .registration
        .active()
        .await
        .map(|worker| worker.version().to_string()),
    })
  }

  pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
    self.events.subscribe()
  }

  /// Platform online/offline signal.
  pub fn set_online(&self, online: bool) {
    self.connectivity.set_platform_online(online);
  }

  /// Probe the API health endpoint once.
  pub async fn probe(&self) -> bool {
    self.connectivity.probe(&self.network, &self.health_url).await
  }

  pub async fn attach_page(&self) {
    self.registration.attach_page().await;
  }

  pub async fn detach_page(&self) -> Result<()> {
    Ok(self.registration.detach_page().await?)
  }

  /// A page asked the waiting version to take over immediately.
  pub async fn skip_waiting(&self) -> Result<bool> {
    Ok(self.registration.skip_waiting().await?)
  }

  pub fn push(&self) -> &PushHook {
    &self.push
  }

  /// Wait for background revalidations of the active version.
  pub async fn settle(&self) {
    if let Some(worker) = self.registration.active().await {
      worker.executor().settle().await;
    }
  }
}
