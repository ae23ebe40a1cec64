//! Error types for the cache and sync engine.
//!
//! A cache miss is not represented here: lookups return `Option`. Upstream
//! error statuses are ordinary `Response`s and are classified where needed.

use std::time::Duration;
use thiserror::Error;

/// Failure of the persistent backend behind the cache store or the sync queue.
#[derive(Error, Debug)]
pub enum StorageError {
  #[error("Storage backend error: {0}")]
  Backend(#[from] rusqlite::Error),

  #[error("Serialization error: {0}")]
  Serialization(#[from] serde_json::Error),

  #[error("Storage lock poisoned")]
  LockPoisoned,

  #[error("Storage quota exceeded: {0}")]
  QuotaExceeded(String),

  #[error("Corrupt record: {0}")]
  Corrupt(String),
}

/// A network fetch that never produced a response.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
  /// The request could not be sent or the connection dropped.
  #[error("Network unavailable: {0}")]
  NetworkUnavailable(String),

  /// No response within the configured bound.
  #[error("Request timed out after {0:?}")]
  Timeout(Duration),
}

/// Errors from the sync queue.
#[derive(Error, Debug)]
pub enum QueueError {
  #[error(transparent)]
  Storage(#[from] StorageError),

  #[error("Queue item {0} not found")]
  NotFound(uuid::Uuid),

  #[error("Queue item {0} is already in flight")]
  AlreadyInFlight(uuid::Uuid),

  #[error("Queue item {id} cannot move from {from} to {to}")]
  InvalidTransition {
    id: uuid::Uuid,
    from: &'static str,
    to: &'static str,
  },
}

impl From<rusqlite::Error> for QueueError {
  fn from(e: rusqlite::Error) -> Self {
    QueueError::Storage(StorageError::Backend(e))
  }
}

/// Errors from the interceptor lifecycle.
#[derive(Error, Debug)]
pub enum LifecycleError {
  #[error("Event {event} is not valid in state {state}")]
  InvalidTransition {
    state: &'static str,
    event: &'static str,
  },

  #[error("Install failed while precaching {url}: {reason}")]
  InstallFailed { url: String, reason: String },
}

/// Configuration errors detected after parsing.
#[derive(Error, Debug)]
pub enum ConfigError {
  #[error("Invalid route pattern {pattern}: {source}")]
  InvalidPattern {
    pattern: String,
    #[source]
    source: regex::Error,
  },

  #[error("Invalid configuration: {0}")]
  Invalid(String),
}
