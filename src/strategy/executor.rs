//! Strategy executors: cache-first, network-first, stale-while-revalidate and
//! network-only, applied against the cache store and a network fetcher.

use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, warn};

use super::Strategy;
use crate::cache::{CacheEntry, CachePartition, CacheStorage, Served};
use crate::error::FetchError;
use crate::event::{EngineEvent, EventBus};
use crate::http::{RequestIdentity, Response};

/// Applies caching strategies.
///
/// Storage failures are never surfaced: a failed read is a miss and a failed
/// write is logged and dropped.
#[derive(Clone)]
pub struct StrategyExecutor {
  storage: Arc<dyn CacheStorage>,
  events: EventBus,
  /// Background revalidations; not cancelled when the requesting page leaves
  revalidations: Arc<Mutex<JoinSet<()>>>,
}

impl StrategyExecutor {
  pub fn new(storage: Arc<dyn CacheStorage>, events: EventBus) -> Self {
    Self {
      storage,
      events,
      revalidations: Arc::new(Mutex::new(JoinSet::new())),
    }
  }

  pub fn storage(&self) -> &Arc<dyn CacheStorage> {
    &self.storage
  }

  /// Run `strategy` for `key`. The fetcher is invoked at most once.
  pub async fn execute<F, Fut>(
    &self,
    strategy: Strategy,
    key: &RequestIdentity,
    partition: &CachePartition,
    fetcher: F,
  ) -> Result<Served, FetchError>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Response, FetchError>> + Send + 'static,
  {
    match strategy {
      Strategy::CacheFirst => self.cache_first(key, partition, fetcher).await,
      Strategy::NetworkFirst => self.network_first(key, partition, fetcher).await,
      Strategy::StaleWhileRevalidate => self.stale_while_revalidate(key, partition, fetcher).await,
      Strategy::NetworkOnly => Self::network_only(fetcher).await,
    }
  }

  /// 1. Return the cached entry if present (network untouched)
  /// 2. Otherwise fetch, store a 2xx response, and return it
  /// 3. Fetch errors propagate; the caller supplies a fallback
  pub async fn cache_first<F, Fut>(
    &self,
    key: &RequestIdentity,
    partition: &CachePartition,
    fetcher: F,
  ) -> Result<Served, FetchError>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Response, FetchError>>,
  {
    if let Some(cached) = self.lookup(partition, key).await {
      debug!(%key, "Cache hit");
      return Ok(Served::from_cache(&cached));
    }

    let response = fetcher().await?;
    store_response(&self.storage, &self.events, partition, key, &response).await;
    Ok(Served::from_network(response))
  }

  /// 1. Fetch; on success store and return the fresh response
  /// 2. On fetch failure or a 5xx, fall back to the cached entry if present
  /// 3. Otherwise propagate the error (or return the upstream error response)
  pub async fn network_first<F, Fut>(
    &self,
    key: &RequestIdentity,
    partition: &CachePartition,
    fetcher: F,
  ) -> Result<Served, FetchError>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Response, FetchError>>,
  {
    match fetcher().await {
      Ok(response) if response.status < 500 => {
        store_response(&self.storage, &self.events, partition, key, &response).await;
        Ok(Served::from_network(response))
      }
      Ok(response) => match self.lookup(partition, key).await {
        Some(cached) => {
          debug!(%key, status = response.status, "Upstream error, serving cached copy");
          Ok(Served::offline(&cached))
        }
        None => Ok(Served::from_network(response)),
      },
      Err(e) => match self.lookup(partition, key).await {
        Some(cached) => {
          debug!(%key, error = %e, "Network failed, serving cached copy");
          Ok(Served::offline(&cached))
        }
        None => Err(e),
      },
    }
  }

  /// 1. With a cached entry: return it now and revalidate in the background
  ///    (stored on success, discarded on failure)
  /// 2. Without one: await the network and store on success
  pub async fn stale_while_revalidate<F, Fut>(
    &self,
    key: &RequestIdentity,
    partition: &CachePartition,
    fetcher: F,
  ) -> Result<Served, FetchError>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Response, FetchError>> + Send + 'static,
  {
    if let Some(cached) = self.lookup(partition, key).await {
      debug!(%key, "Cache hit, revalidating in background");
      self.revalidate(key.clone(), partition.clone(), fetcher());
      return Ok(Served::from_cache(&cached));
    }

    let response = fetcher().await?;
    store_response(&self.storage, &self.events, partition, key, &response).await;
    Ok(Served::from_network(response))
  }

  /// No cache interaction at all.
  pub async fn network_only<F, Fut>(fetcher: F) -> Result<Served, FetchError>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Response, FetchError>>,
  {
    fetcher().await.map(Served::from_network)
  }

  /// Wait for all background revalidations started so far.
  pub async fn settle(&self) {
    let mut pending = match self.revalidations.lock() {
      Ok(mut set) => std::mem::take(&mut *set),
      Err(_) => return,
    };
    while pending.join_next().await.is_some() {}
  }

  /// Read from the cache, treating any storage error as a miss.
  pub async fn lookup(&self, partition: &CachePartition, key: &RequestIdentity) -> Option<CacheEntry> {
    match self.storage.get(partition, key).await {
      Ok(entry) => entry,
      Err(e) => {
        warn!(partition = %partition.id(), %key, error = %e, "Cache read failed, treating as miss");
        None
      }
    }
  }

  fn revalidate<Fut>(&self, key: RequestIdentity, partition: CachePartition, fetch: Fut)
  where
    Fut: Future<Output = Result<Response, FetchError>> + Send + 'static,
  {
    let storage = Arc::clone(&self.storage);
    let events = self.events.clone();

    let task = async move {
      match fetch.await {
        Ok(response) => store_response(&storage, &events, &partition, &key, &response).await,
        Err(e) => debug!(%key, error = %e, "Background revalidation failed, keeping cached copy"),
      }
    };

    match self.revalidations.lock() {
      Ok(mut set) => {
        // Reap finished revalidations so the set does not grow unbounded
        while set.try_join_next().is_some() {}
        set.spawn(task);
      }
      Err(_) => {
        tokio::spawn(task);
      }
    }
  }
}

/// Store a successful response; anything outside 2xx is never cached.
async fn store_response(
  storage: &Arc<dyn CacheStorage>,
  events: &EventBus,
  partition: &CachePartition,
  key: &RequestIdentity,
  response: &Response,
) {
  if !response.is_success() {
    return;
  }

  let entry = CacheEntry::from_response(key.clone(), response);
  match storage.put(partition, entry).await {
    Ok(_) => events.emit(EngineEvent::CacheUpdated {
      partition: partition.name.clone(),
      key: key.to_string(),
    }),
    Err(e) => warn!(partition = %partition.id(), %key, error = %e, "Cache write failed"),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::SqliteStorage;
  use crate::db::Database;
  use crate::testing::{FailingStorage, ScriptedNetwork};
  use std::time::Duration;

  struct Harness {
    executor: StrategyExecutor,
    network: Arc<ScriptedNetwork>,
    partition: CachePartition,
    key: RequestIdentity,
  }

  impl Harness {
    fn new() -> Self {
      let storage = SqliteStorage::new(Database::open_in_memory().unwrap());
      Self::with_storage(Arc::new(storage))
    }

    fn with_storage(storage: Arc<dyn CacheStorage>) -> Self {
      Self {
        executor: StrategyExecutor::new(storage, EventBus::default()),
        network: Arc::new(ScriptedNetwork::new()),
        partition: CachePartition::new("api", "v1", 10),
        key: RequestIdentity::from_key("GET https://app.example.org/activities"),
      }
    }

    async fn seed(&self, body: &str) {
      let entry = CacheEntry::from_response(self.key.clone(), &Response::new(200, body.to_string()));
      self.executor.storage().put(&self.partition, entry).await.unwrap();
    }

    async fn cached(&self) -> Option<String> {
      self
        .executor
        .lookup(&self.partition, &self.key)
        .await
        .map(|e| String::from_utf8(e.payload.to_vec()).unwrap())
    }

    async fn run(&self, strategy: Strategy) -> Result<Served, FetchError> {
      let network = Arc::clone(&self.network);
      let request = crate::http::Request::get(
        url::Url::parse("https://app.example.org/activities").unwrap(),
      );
      self
        .executor
        .execute(strategy, &self.key, &self.partition, move || async move {
          network.fetch(&request).await
        })
        .await
    }
  }

  use crate::network::Network;

  #[tokio::test]
  async fn test_cache_first_hit_skips_network() {
    let h = Harness::new();
    h.seed("cached").await;

    let served = h.run(Strategy::CacheFirst).await.unwrap();

    assert_eq!(served.source, crate::cache::CacheSource::Cache);
    assert_eq!(served.response.body, "cached");
    assert_eq!(h.network.call_count(), 0);
  }

  #[tokio::test]
  async fn test_cache_first_miss_fetches_and_stores() {
    let h = Harness::new();
    h.network.respond(Response::new(200, "fresh"));

    let served = h.run(Strategy::CacheFirst).await.unwrap();

    assert_eq!(served.source, crate::cache::CacheSource::Network);
    assert_eq!(h.cached().await.as_deref(), Some("fresh"));
  }

  #[tokio::test]
  async fn test_cache_first_miss_propagates_fetch_error() {
    let h = Harness::new();
    let err = h.run(Strategy::CacheFirst).await.unwrap_err();
    assert!(matches!(err, FetchError::NetworkUnavailable(_)));
  }

  #[tokio::test]
  async fn test_upstream_errors_are_never_cached() {
    let h = Harness::new();
    h.network.respond(Response::new(404, "missing"));

    let served = h.run(Strategy::CacheFirst).await.unwrap();

    assert_eq!(served.response.status, 404);
    assert!(h.cached().await.is_none());
  }

  #[tokio::test]
  async fn test_network_first_prefers_network() {
    let h = Harness::new();
    h.seed("old").await;
    h.network.respond(Response::new(200, "new"));

    let served = h.run(Strategy::NetworkFirst).await.unwrap();

    assert_eq!(served.response.body, "new");
    assert_eq!(h.cached().await.as_deref(), Some("new"));
  }

  #[tokio::test]
  async fn test_network_first_falls_back_on_failure() {
    let h = Harness::new();
    h.seed("old").await;
    h.network.fail(FetchError::Timeout(Duration::from_secs(8)));

    let served = h.run(Strategy::NetworkFirst).await.unwrap();

    assert_eq!(served.source, crate::cache::CacheSource::CacheFallback);
    assert_eq!(served.response.body, "old");
  }

  #[tokio::test]
  async fn test_network_first_falls_back_on_server_error() {
    let h = Harness::new();
    h.seed("old").await;
    h.network.respond(Response::new(502, "bad gateway"));

    let served = h.run(Strategy::NetworkFirst).await.unwrap();

    assert_eq!(served.response.body, "old");
    assert_eq!(h.cached().await.as_deref(), Some("old"));
  }

  #[tokio::test]
  async fn test_network_first_without_cache_propagates() {
    let h = Harness::new();
    let err = h.run(Strategy::NetworkFirst).await.unwrap_err();
    assert!(matches!(err, FetchError::NetworkUnavailable(_)));
  }

  #[tokio::test]
  async fn test_swr_returns_cached_without_awaiting_network() {
    let h = Harness::new();
    h.seed("stale").await;
    h.network.pause();
    h.network.respond(Response::new(200, "revalidated"));

    let served = h.run(Strategy::StaleWhileRevalidate).await.unwrap();
    assert_eq!(served.response.body, "stale");
    assert_eq!(h.cached().await.as_deref(), Some("stale"));

    h.network.resume();
    h.executor.settle().await;

    assert_eq!(h.network.call_count(), 1);
    assert_eq!(h.cached().await.as_deref(), Some("revalidated"));
  }

  #[tokio::test]
  async fn test_swr_background_failure_keeps_cache() {
    let h = Harness::new();
    h.seed("stale").await;
    h.network.fail(FetchError::NetworkUnavailable("offline".to_string()));

    let served = h.run(Strategy::StaleWhileRevalidate).await.unwrap();
    h.executor.settle().await;

    assert_eq!(served.response.body, "stale");
    assert_eq!(h.cached().await.as_deref(), Some("stale"));
  }

  #[tokio::test]
  async fn test_swr_miss_awaits_network() {
    let h = Harness::new();
    h.network.respond(Response::new(200, "first"));

    let served = h.run(Strategy::StaleWhileRevalidate).await.unwrap();

    assert_eq!(served.source, crate::cache::CacheSource::Network);
    assert_eq!(h.cached().await.as_deref(), Some("first"));
  }

  #[tokio::test]
  async fn test_network_only_never_touches_cache() {
    let h = Harness::new();
    h.seed("cached").await;
    h.network.respond(Response::new(200, "live"));

    let served = h.run(Strategy::NetworkOnly).await.unwrap();
    assert_eq!(served.response.body, "live");
    assert_eq!(h.cached().await.as_deref(), Some("cached"));

    let err = h.run(Strategy::NetworkOnly).await.unwrap_err();
    assert!(matches!(err, FetchError::NetworkUnavailable(_)));
  }

  #[tokio::test]
  async fn test_storage_failure_degrades_to_network() {
    let h = Harness::with_storage(Arc::new(FailingStorage));
    h.network.respond(Response::new(200, "live"));

    let served = h.run(Strategy::CacheFirst).await.unwrap();

    assert_eq!(served.source, crate::cache::CacheSource::Network);
    assert_eq!(served.response.body, "live");
  }

  #[tokio::test]
  async fn test_store_emits_cache_updated() {
    let h = Harness::new();
    let mut events = h.executor.events.subscribe();
    h.network.respond(Response::new(200, "fresh"));

    h.run(Strategy::NetworkFirst).await.unwrap();

    assert_eq!(
      events.recv().await.unwrap(),
      EngineEvent::CacheUpdated {
        partition: "api".to_string(),
        key: h.key.to_string(),
      }
    );
  }
}
