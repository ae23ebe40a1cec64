//! Core types for the response cache.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use http::header::{HeaderValue, CONTENT_TYPE};

use crate::config::PartitionConfig;
use crate::http::{HeaderMap, RequestIdentity, Response};

/// A stored response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
  pub key: RequestIdentity,
  pub status: u16,
  pub payload: Bytes,
  pub content_type: String,
  pub headers: HeaderMap,
  pub stored_at: DateTime<Utc>,
}

impl CacheEntry {
  /// Capture a network response for storage.
  pub fn from_response(key: RequestIdentity, response: &Response) -> Self {
    Self {
      key,
      status: response.status,
      payload: response.body.clone(),
      content_type: response.content_type().to_string(),
      headers: response.headers.clone(),
      stored_at: Utc::now(),
    }
  }

  pub fn to_response(&self) -> Response {
    let mut headers = self.headers.clone();
    if !headers.contains_key(CONTENT_TYPE) {
      if let Ok(value) = HeaderValue::from_str(&self.content_type) {
        headers.insert(CONTENT_TYPE, value);
      }
    }
    Response {
      status: self.status,
      headers,
      body: self.payload.clone(),
    }
  }
}

/// A named, versioned container of cache entries.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CachePartition {
  pub name: String,
  pub version: String,
  /// Upper bound enforced after every put
  pub max_entries: usize,
}

impl CachePartition {
  pub fn new(name: impl Into<String>, version: impl Into<String>, max_entries: usize) -> Self {
    Self {
      name: name.into(),
      version: version.into(),
      max_entries,
    }
  }

  pub fn from_config(config: &PartitionConfig, version: &str) -> Self {
    Self::new(config.name.clone(), version, config.max_entries)
  }

  /// Storage id; two versions of the same name never share entries.
  pub fn id(&self) -> String {
    format!("{}-{}", self.name, self.version)
  }
}

/// Result of serving a request, including where the response came from.
#[derive(Debug, Clone)]
pub struct Served {
  pub response: Response,
  pub source: CacheSource,
  /// When the response was cached (if from cache)
  pub stored_at: Option<DateTime<Utc>>,
}

impl Served {
  /// Fresh data from the network.
  pub fn from_network(response: Response) -> Self {
    Self {
      response,
      source: CacheSource::Network,
      stored_at: None,
    }
  }

  /// Served from the cache without consulting the network first.
  pub fn from_cache(entry: &CacheEntry) -> Self {
    Self {
      response: entry.to_response(),
      source: CacheSource::Cache,
      stored_at: Some(entry.stored_at),
    }
  }

  /// Network failed, serving a cached copy instead.
  pub fn offline(entry: &CacheEntry) -> Self {
    Self {
      source: CacheSource::CacheFallback,
      ..Self::from_cache(entry)
    }
  }

  pub fn offline_document(entry: &CacheEntry) -> Self {
    Self {
      source: CacheSource::OfflineDocument,
      ..Self::from_cache(entry)
    }
  }

  pub fn synthetic(reason: &str) -> Self {
    Self {
      response: Response::synthetic_error(reason),
      source: CacheSource::Synthetic,
      stored_at: None,
    }
  }
}

/// Indicates where a served response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh response from the network
  Network,
  /// Cached response served by a cache-first or stale-while-revalidate strategy
  Cache,
  /// Network unavailable, serving cached data
  CacheFallback,
  /// Navigation fell back to the offline document
  OfflineDocument,
  /// Nothing available; a generated error response
  Synthetic,
}

impl CacheSource {
  pub fn as_str(&self) -> &'static str {
    match self {
      CacheSource::Network => "network",
      CacheSource::Cache => "cache",
      CacheSource::CacheFallback => "cache-fallback",
      CacheSource::OfflineDocument => "offline-document",
      CacheSource::Synthetic => "synthetic",
    }
  }
}
