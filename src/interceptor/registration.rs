use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::lifecycle::{Effect, LifecycleEvent, WorkerState};
use super::worker::Worker;
use crate::cache::Served;
use crate::error::LifecycleError;
use crate::http::Request;
use crate::network::TimedNetwork;

#[derive(Default)]
struct Slots {
  active: Option<Arc<Worker>>,
  waiting: Option<Arc<Worker>>,
  /// Open pages served by the active worker
  pages: usize,
}

/// Effects owed by a transition, carried out once the slots are released.
type Pending = Vec<(Arc<Worker>, Vec<Effect>)>;

/// Tracks which interceptor version serves requests and hands control from
/// one version to the next.
pub struct Registration {
  slots: Mutex<Slots>,
  network: TimedNetwork,
}

impl Registration {
  /// `network` serves requests while no version is active.
  pub fn new(network: TimedNetwork) -> Self {
    Self {
      slots: Mutex::new(Slots::default()),
      network,
    }
  }

  /// Install a new version. It becomes active at once when no page is held
  /// by the current version, otherwise it waits.
  pub async fn register(&self, worker: Worker) -> Result<WorkerState, LifecycleError> {
    info!(version = worker.version(), "Installing interceptor");
    let worker = Arc::new(worker);

    // Install outside the lock so requests keep flowing to the active version
    if let Err(e) = Self::carry_out(&worker, worker.install_effects()).await {
      warn!(version = worker.version(), error = %e, "Install failed");
      let effects = worker.apply(LifecycleEvent::InstallFailed)?;
      Self::carry_out(&worker, effects).await?;
      return Err(e);
    }

    let mut pending = Pending::new();
    {
      let mut slots = self.slots.lock().await;

      if let Some(previous) = slots.waiting.take() {
        let effects = previous.apply(LifecycleEvent::Superseded)?;
        pending.push((previous, effects));
      }

      let predecessor_has_pages = slots.active.is_some() && slots.pages > 0;
      let effects = worker.apply(LifecycleEvent::Installed {
        predecessor_has_pages,
      })?;

      if worker.state() == WorkerState::Active {
        Self::activate(&mut slots, worker.clone(), effects, &mut pending)?;
      } else {
        info!(
          version = worker.version(),
          pages = slots.pages,
          "Interceptor waiting for open pages to close"
        );
        slots.waiting = Some(worker.clone());
      }
    }

    Self::finish(pending).await?;
    Ok(worker.state())
  }

  /// A page asked the waiting version to take over now.
  pub async fn skip_waiting(&self) -> Result<bool, LifecycleError> {
    let mut pending = Pending::new();
    {
      let mut slots = self.slots.lock().await;
      let Some(waiting) = slots.waiting.take() else {
        return Ok(false);
      };
      let effects = waiting.apply(LifecycleEvent::SkipWaiting)?;
      Self::activate(&mut slots, waiting, effects, &mut pending)?;
    }

    Self::finish(pending).await?;
    Ok(true)
  }

  pub async fn attach_page(&self) {
    let mut slots = self.slots.lock().await;
    slots.pages += 1;
  }

  /// A page closed. When the last one goes, a waiting version activates.
  pub async fn detach_page(&self) -> Result<(), LifecycleError> {
    let mut pending = Pending::new();
    {
      let mut slots = self.slots.lock().await;
      slots.pages = slots.pages.saturating_sub(1);

      if slots.pages == 0 {
        if let Some(waiting) = slots.waiting.take() {
          let effects = waiting.apply(LifecycleEvent::PredecessorReleased)?;
          Self::activate(&mut slots, waiting, effects, &mut pending)?;
        }
      }
    }

    Self::finish(pending).await
  }

  /// Swap the active version. The retired version's effects are queued
  /// ahead of the new one's, so its revalidations land before stale
  /// partitions are removed.
  fn activate(
    slots: &mut Slots,
    worker: Arc<Worker>,
    effects: Vec<Effect>,
    pending: &mut Pending,
  ) -> Result<(), LifecycleError> {
    if let Some(previous) = slots.active.take() {
      let retired = previous.apply(LifecycleEvent::Superseded)?;
      pending.push((previous, retired));
    }

    info!(version = worker.version(), "Interceptor active");
    slots.active = Some(worker.clone());
    pending.push((worker, effects));
    Ok(())
  }

  async fn finish(pending: Pending) -> Result<(), LifecycleError> {
    for (worker, effects) in pending {
      Self::carry_out(&worker, effects).await?;
    }
    Ok(())
  }

  async fn carry_out(worker: &Worker, effects: Vec<Effect>) -> Result<(), LifecycleError> {
    for effect in effects {
      match effect {
        Effect::Precache => worker.precache().await?,
        Effect::DeleteStalePartitions => {
          worker.delete_stale_partitions().await;
        }
        Effect::ClaimPages => {
          debug!(version = worker.version(), "Claimed open pages");
        }
        Effect::Discard => {
          worker.executor().settle().await;
          debug!(version = worker.version(), "Discarded interceptor");
        }
      }
    }
    Ok(())
  }

  pub async fn active(&self) -> Option<Arc<Worker>> {
    self.slots.lock().await.active.clone()
  }

  pub async fn waiting(&self) -> Option<Arc<Worker>> {
    self.slots.lock().await.waiting.clone()
  }

  /// Serve a request through the active version, or straight from the
  /// network when none is active yet.
  pub async fn handle(&self, request: Request) -> Served {
    match self.active().await {
      Some(worker) => worker.handle(request).await,
      None => Worker::passthrough(&self.network, &request).await,
    }
  }
}
