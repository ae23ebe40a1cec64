use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};
use url::Url;

use super::lifecycle::{self, Effect, LifecycleEvent, WorkerState};
use crate::cache::{CacheEntry, CachePartition, CacheStorage, Served};
use crate::config::Config;
use crate::error::{ConfigError, FetchError, LifecycleError};
use crate::event::EventBus;
use crate::http::Request;
use crate::network::TimedNetwork;
use crate::strategy::{Strategy, StrategyExecutor, StrategySelector, PAGES_PARTITION};

const STATIC_PARTITION: &str = "static";

/// One deployed version of the request interceptor.
pub struct Worker {
  version: String,
  state: Mutex<WorkerState>,
  selector: StrategySelector,
  executor: StrategyExecutor,
  network: TimedNetwork,
  partitions: HashMap<String, CachePartition>,
  precache: Vec<Url>,
  offline_document: Option<Url>,
  /// Effects of entering `Installing`
  install: Vec<Effect>,
}

impl Worker {
  pub fn new(
    config: &Config,
    storage: Arc<dyn CacheStorage>,
    network: TimedNetwork,
    events: EventBus,
  ) -> Result<Self, ConfigError> {
    let version = config.cache.version.clone();
    let base = &config.api.base_url;
    let resolve = |path: &str| {
      base
        .join(path)
        .map_err(|e| ConfigError::Invalid(format!("bad resource path {}: {}", path, e)))
    };

    let partitions = config
      .cache
      .partitions
      .iter()
      .map(|p| (p.name.clone(), CachePartition::from_config(p, &version)))
      .collect();
    let precache = config
      .cache
      .precache
      .iter()
      .map(|p| resolve(p.as_str()))
      .collect::<Result<Vec<_>, _>>()?;
    let offline_document = config
      .cache
      .offline_document
      .as_deref()
      .map(resolve)
      .transpose()?;

    let (state, install) = lifecycle::start();

    Ok(Self {
      version,
      state: Mutex::new(state),
      selector: StrategySelector::from_config(config)?,
      executor: StrategyExecutor::new(storage, events),
      network,
      partitions,
      precache,
      offline_document,
      install,
    })
  }

  pub fn version(&self) -> &str {
    &self.version
  }

  pub fn state(&self) -> WorkerState {
    match self.state.lock() {
      Ok(state) => *state,
      Err(_) => WorkerState::Redundant,
    }
  }

  /// Work to carry out before the version can be marked installed.
  pub fn install_effects(&self) -> Vec<Effect> {
    self.install.clone()
  }

  pub fn executor(&self) -> &StrategyExecutor {
    &self.executor
  }

  /// Move the lifecycle forward and return the effects to carry out.
  pub fn apply(&self, event: LifecycleEvent) -> Result<Vec<Effect>, LifecycleError> {
    let mut state = self
      .state
      .lock()
      .map_err(|_| LifecycleError::InvalidTransition {
        state: WorkerState::Redundant.as_str(),
        event: "lock-poisoned",
      })?;
    let (next, effects) = lifecycle::transition(*state, event)?;
    debug!(version = %self.version, from = state.as_str(), to = next.as_str(), "Lifecycle transition");
    *state = next;
    Ok(effects)
  }

  /// Fetch every critical resource, then store them together. Nothing is
  /// stored unless every fetch succeeds.
  ///
  /// The offline document goes to the pages partition, the rest to static.
  pub async fn precache(&self) -> Result<(), LifecycleError> {
    let mut targets: Vec<(&Url, &str)> = self
      .precache
      .iter()
      .filter(|url| Some(*url) != self.offline_document.as_ref())
      .map(|url| (url, STATIC_PARTITION))
      .collect();
    if let Some(url) = &self.offline_document {
      targets.push((url, PAGES_PARTITION));
    }

    let mut fetched = Vec::with_capacity(targets.len());
    for (url, partition) in targets {
      let request = Request::get(url.clone());
      let response = self
        .network
        .fetch(&request)
        .await
        .map_err(|e| install_failed(url, e.to_string()))?;
      if !response.is_success() {
        return Err(install_failed(url, format!("HTTP {}", response.status)));
      }
      fetched.push((partition, request, response));
    }

    let count = fetched.len();
    for (name, request, response) in fetched {
      let partition = self
        .partitions
        .get(name)
        .ok_or_else(|| install_failed(&request.url, format!("no {} partition", name)))?;
      let entry = CacheEntry::from_response(request.identity(), &response);
      self
        .executor
        .storage()
        .put(partition, entry)
        .await
        .map_err(|e| install_failed(&request.url, e.to_string()))?;
    }

    info!(version = %self.version, count, "Precached critical resources");
    Ok(())
  }

  /// Remove every stored partition that does not belong to this version.
  pub async fn delete_stale_partitions(&self) -> usize {
    let current: BTreeSet<String> = self.partitions.values().map(CachePartition::id).collect();

    let stored = match self.executor.storage().partitions().await {
      Ok(stored) => stored,
      Err(e) => {
        warn!(error = %e, "Failed to list cache partitions");
        return 0;
      }
    };

    let mut deleted = 0;
    for id in stored.into_iter().filter(|id| !current.contains(id)) {
      match self.executor.storage().delete_partition(&id).await {
        Ok(entries) => {
          info!(partition = %id, entries, "Deleted stale cache partition");
          deleted += 1;
        }
        Err(e) => warn!(partition = %id, error = %e, "Failed to delete stale partition"),
      }
    }
    deleted
  }

  /// Serve an intercepted request. Always produces a response.
  pub async fn handle(&self, request: Request) -> Served {
    let route = self.selector.classify(&request);
    let partition = route
      .partition
      .as_deref()
      .and_then(|name| self.partitions.get(name));

    let network = self.network.clone();
    let owned = request.clone();
    let fetcher = move || network.fetch_owned(owned);

    let result = match (route.strategy, partition) {
      (Strategy::NetworkOnly, _) | (_, None) => StrategyExecutor::network_only(fetcher).await,
      (strategy, Some(partition)) => {
        self
          .executor
          .execute(strategy, &request.identity(), partition, fetcher)
          .await
      }
    };

    match result {
      Ok(served) => served,
      Err(e) => self.fallback(&request, e).await,
    }
  }

  async fn fallback(&self, request: &Request, error: FetchError) -> Served {
    if request.navigation {
      if let Some(entry) = self.offline_entry().await {
        debug!(url = %request.url, error = %error, "Serving offline document");
        return Served::offline_document(&entry);
      }
    }
    debug!(url = %request.url, error = %error, "No response available");
    Served::synthetic(&error.to_string())
  }

  async fn offline_entry(&self) -> Option<CacheEntry> {
    let url = self.offline_document.as_ref()?;
    let partition = self.partitions.get(PAGES_PARTITION)?;
    self
      .executor
      .lookup(partition, &Request::get(url.clone()).identity())
      .await
  }

  /// Pass-through used before any version is active.
  pub async fn passthrough(network: &TimedNetwork, request: &Request) -> Served {
    match network.fetch(request).await {
      Ok(response) => Served::from_network(response),
      Err(e) => Served::synthetic(&e.to_string()),
    }
  }
}

fn install_failed(url: &Url, reason: String) -> LifecycleError {
  LifecycleError::InstallFailed {
    url: url.to_string(),
    reason,
  }
}
