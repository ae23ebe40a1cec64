use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;
use uuid::Uuid;

/// Notifications delivered from the engine to pages.
///
/// Serialises as `{"type": "sync-item-succeeded", "payload": {...}}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "kebab-case")]
pub enum EngineEvent {
  /// Queue contents changed (enqueue, drain step, clear)
  SyncQueueChanged { pending: usize, failed: usize },
  /// A queued mutation was replayed successfully and removed
  SyncItemSucceeded { id: Uuid },
  /// A queued mutation was rejected or ran out of retries
  SyncItemPermanentlyFailed { id: Uuid, error: String },
  /// A cache entry was written from the network
  CacheUpdated { partition: String, key: String },
  /// A notification was clicked; the page should navigate
  Navigate { url: String },
}

/// Fan-out channel from the background context to every subscribed page.
#[derive(Debug, Clone)]
pub struct EventBus {
  tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
  /// Create a bus that buffers up to `capacity` events per lagging subscriber
  pub fn new(capacity: usize) -> Self {
    let (tx, _rx) = broadcast::channel(capacity);
    Self { tx }
  }

  /// Send an event. Having no subscribers is not an error.
  pub fn emit(&self, event: EngineEvent) {
    if self.tx.send(event).is_err() {
      trace!("No subscribers for engine event");
    }
  }

  pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
    self.tx.subscribe()
  }
}

impl Default for EventBus {
  fn default() -> Self {
    Self::new(256)
  }
}
