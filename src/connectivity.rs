//! Online/offline tracking.
//!
//! The engine is online only when the platform reports a network and the
//! last health probe reached the API. Transitions are published on a watch
//! channel so the sync loop can drain as soon as the API comes back.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info};
use url::Url;

use crate::http::Request;
use crate::network::TimedNetwork;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityState {
  Online,
  Offline,
}

impl ConnectivityState {
  pub fn as_str(&self) -> &'static str {
    match self {
      ConnectivityState::Online => "online",
      ConnectivityState::Offline => "offline",
    }
  }
}

#[derive(Clone)]
pub struct ConnectivityMonitor {
  platform_online: Arc<AtomicBool>,
  api_reachable: Arc<AtomicBool>,
  tx: Arc<watch::Sender<ConnectivityState>>,
}

impl ConnectivityMonitor {
  /// Start in the given state; both signals are assumed to agree.
  pub fn new(initially_online: bool) -> Self {
    let state = if initially_online {
      ConnectivityState::Online
    } else {
      ConnectivityState::Offline
    };
    let (tx, _rx) = watch::channel(state);
    Self {
      platform_online: Arc::new(AtomicBool::new(initially_online)),
      api_reachable: Arc::new(AtomicBool::new(initially_online)),
      tx: Arc::new(tx),
    }
  }

  pub fn state(&self) -> ConnectivityState {
    *self.tx.borrow()
  }

  pub fn is_online(&self) -> bool {
    self.state() == ConnectivityState::Online
  }

  pub fn subscribe(&self) -> watch::Receiver<ConnectivityState> {
    self.tx.subscribe()
  }

  /// Platform online/offline signal.
  pub fn set_platform_online(&self, online: bool) {
    self.platform_online.store(online, Ordering::SeqCst);
    if online {
      // Trust the platform until the next probe says otherwise
      self.api_reachable.store(true, Ordering::SeqCst);
    }
    self.recompute();
  }

  /// Result of a health probe against the API.
  pub fn record_probe(&self, reachable: bool) {
    self.api_reachable.store(reachable, Ordering::SeqCst);
    self.recompute();
  }

  fn recompute(&self) {
    let online =
      self.platform_online.load(Ordering::SeqCst) && self.api_reachable.load(Ordering::SeqCst);
    let next = if online {
      ConnectivityState::Online
    } else {
      ConnectivityState::Offline
    };

    let changed = self.tx.send_if_modified(|state| {
      if *state == next {
        false
      } else {
        *state = next;
        true
      }
    });
    if changed {
      info!(state = next.as_str(), "Connectivity changed");
    }
  }

  /// Probe the health endpoint once. Any response below 500 counts as reachable.
  pub async fn probe(&self, network: &TimedNetwork, health_url: &Url) -> bool {
    let reachable = match network.fetch(&Request::get(health_url.clone())).await {
      Ok(response) => response.status < 500,
      Err(e) => {
        debug!(error = %e, "Health probe failed");
        false
      }
    };
    self.record_probe(reachable);
    reachable
  }

  /// Probe periodically until `shutdown` flips to true.
  pub async fn run_probe(
    self,
    network: TimedNetwork,
    health_url: Url,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
  ) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
      tokio::select! {
        _ = ticker.tick() => {
          // Skip the round trip while the platform says there is no link
          if self.platform_online.load(Ordering::SeqCst) {
            self.probe(&network, &health_url).await;
          }
        }
        changed = shutdown.changed() => {
          if changed.is_err() || *shutdown.borrow() {
            break;
          }
        }
      }
    }
    debug!("Connectivity probe stopped");
  }
}
