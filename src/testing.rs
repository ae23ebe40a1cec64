//! Test doubles shared by unit tests.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;

use crate::cache::{CacheEntry, CachePartition, CacheStorage};
use crate::error::{FetchError, StorageError};
use crate::http::{Request, RequestIdentity, Response};
use crate::network::Network;
use crate::sync::Sleeper;

struct Scripted {
  delay: Option<Duration>,
  result: Result<Response, FetchError>,
}

/// Network double that replays queued outcomes and records every call.
pub struct ScriptedNetwork {
  script: Mutex<VecDeque<Scripted>>,
  fallback: Mutex<Result<Response, FetchError>>,
  calls: Mutex<Vec<Request>>,
  gate: Mutex<Option<Arc<Semaphore>>>,
}

impl ScriptedNetwork {
  /// With nothing queued every fetch fails as if offline.
  pub fn new() -> Self {
    Self {
      script: Mutex::new(VecDeque::new()),
      fallback: Mutex::new(Err(FetchError::NetworkUnavailable("offline".to_string()))),
      calls: Mutex::new(Vec::new()),
      gate: Mutex::new(None),
    }
  }

  pub fn push(&self, result: Result<Response, FetchError>) {
    self
      .script
      .lock()
      .unwrap()
      .push_back(Scripted { delay: None, result });
  }

  pub fn respond(&self, response: Response) {
    self.push(Ok(response));
  }

  pub fn fail(&self, error: FetchError) {
    self.push(Err(error));
  }

  pub fn respond_after(&self, delay: Duration, response: Response) {
    self.script.lock().unwrap().push_back(Scripted {
      delay: Some(delay),
      result: Ok(response),
    });
  }

  /// Outcome used once the queue is empty.
  pub fn set_fallback(&self, result: Result<Response, FetchError>) {
    *self.fallback.lock().unwrap() = result;
  }

  /// Block every fetch until `resume` is called.
  pub fn pause(&self) {
    *self.gate.lock().unwrap() = Some(Arc::new(Semaphore::new(0)));
  }

  pub fn resume(&self) {
    if let Some(gate) = self.gate.lock().unwrap().take() {
      gate.add_permits(Semaphore::MAX_PERMITS / 2);
    }
  }

  /// Calls so far as "METHOD path".
  pub fn calls(&self) -> Vec<String> {
    self
      .calls
      .lock()
      .unwrap()
      .iter()
      .map(|r| format!("{} {}", r.method, r.url.path()))
      .collect()
  }

  pub fn requests(&self) -> Vec<Request> {
    self.calls.lock().unwrap().clone()
  }

  pub fn call_count(&self) -> usize {
    self.calls.lock().unwrap().len()
  }
}

#[async_trait]
impl Network for ScriptedNetwork {
  async fn fetch(&self, request: &Request) -> Result<Response, FetchError> {
    self.calls.lock().unwrap().push(request.clone());
    let next = self.script.lock().unwrap().pop_front();
    let gate = self.gate.lock().unwrap().clone();

    if let Some(gate) = gate {
      if let Ok(permit) = gate.acquire().await {
        permit.forget();
      }
    }

    match next {
      Some(scripted) => {
        if let Some(delay) = scripted.delay {
          tokio::time::sleep(delay).await;
        }
        scripted.result
      }
      None => self.fallback.lock().unwrap().clone(),
    }
  }
}

/// Sleeper that records requested delays and returns immediately.
#[derive(Default)]
pub struct RecordingSleeper {
  delays: Mutex<Vec<Duration>>,
}

impl RecordingSleeper {
  pub fn delays(&self) -> Vec<Duration> {
    self.delays.lock().unwrap().clone()
  }
}

#[async_trait]
impl Sleeper for RecordingSleeper {
  async fn sleep(&self, duration: Duration) {
    self.delays.lock().unwrap().push(duration);
    tokio::task::yield_now().await;
  }
}

/// Storage whose every operation fails.
pub struct FailingStorage;

#[async_trait]
impl CacheStorage for FailingStorage {
  async fn get(
    &self,
    _partition: &CachePartition,
    _key: &RequestIdentity,
  ) -> Result<Option<CacheEntry>, StorageError> {
    Err(StorageError::Corrupt("disk on fire".to_string()))
  }

  async fn put(
    &self,
    _partition: &CachePartition,
    _entry: CacheEntry,
  ) -> Result<usize, StorageError> {
    Err(StorageError::QuotaExceeded("full".to_string()))
  }

  async fn delete(
    &self,
    _partition: &CachePartition,
    _key: &RequestIdentity,
  ) -> Result<bool, StorageError> {
    Err(StorageError::LockPoisoned)
  }

  async fn keys(&self, _partition: &CachePartition) -> Result<Vec<RequestIdentity>, StorageError> {
    Err(StorageError::LockPoisoned)
  }

  async fn delete_partition(&self, _partition_id: &str) -> Result<usize, StorageError> {
    Err(StorageError::LockPoisoned)
  }

  async fn partitions(&self) -> Result<Vec<String>, StorageError> {
    Err(StorageError::LockPoisoned)
  }
}
