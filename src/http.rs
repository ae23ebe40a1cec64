//! Request and response values passed between pages, the interceptor and the network.

use bytes::Bytes;
use http::header::{HeaderValue, IntoHeaderName, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use url::Url;

pub use http::{HeaderMap, Method};

/// Only GET and HEAD are eligible for caching strategies.
pub fn is_cacheable(method: &Method) -> bool {
  *method == Method::GET || *method == Method::HEAD
}

/// Header map as stored in SQLite text columns.
#[derive(Serialize, Deserialize)]
struct StoredHeaders(#[serde(with = "http_serde::header_map")] HeaderMap);

pub fn headers_to_json(headers: &HeaderMap) -> serde_json::Result<String> {
  serde_json::to_string(&StoredHeaders(headers.clone()))
}

pub fn headers_from_json(json: &str) -> serde_json::Result<HeaderMap> {
  serde_json::from_str::<StoredHeaders>(json).map(|stored| stored.0)
}

/// An outgoing request issued by a page.
#[derive(Debug, Clone)]
pub struct Request {
  pub method: Method,
  pub url: Url,
  pub headers: HeaderMap,
  pub body: Option<Bytes>,
  /// Top-level page load (as opposed to a subresource or API call)
  pub navigation: bool,
}

impl Request {
  pub fn get(url: Url) -> Self {
    Self {
      method: Method::GET,
      url,
      headers: HeaderMap::new(),
      body: None,
      navigation: false,
    }
  }

  /// A top-level page load.
  pub fn navigate(url: Url) -> Self {
    Self {
      navigation: true,
      ..Self::get(url)
    }
  }

  pub fn with_method(mut self, method: Method) -> Self {
    self.method = method;
    self
  }

  pub fn with_header<K: IntoHeaderName>(mut self, name: K, value: HeaderValue) -> Self {
    self.headers.insert(name, value);
    self
  }

  pub fn is_cacheable(&self) -> bool {
    is_cacheable(&self.method)
  }

  pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
    self.body = Some(body.into());
    self
  }

  pub fn identity(&self) -> RequestIdentity {
    RequestIdentity::of(self)
  }
}

/// A response, either from the network, the cache, or synthesised.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
  pub status: u16,
  pub headers: HeaderMap,
  pub body: Bytes,
}

impl Response {
  pub fn new(status: u16, body: impl Into<Bytes>) -> Self {
    Self {
      status,
      headers: HeaderMap::new(),
      body: body.into(),
    }
  }

  pub fn with_header<K: IntoHeaderName>(mut self, name: K, value: HeaderValue) -> Self {
    self.headers.insert(name, value);
    self
  }

  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }

  pub fn content_type(&self) -> &str {
    self
      .headers
      .get(CONTENT_TYPE)
      .and_then(|value| value.to_str().ok())
      .unwrap_or("application/octet-stream")
  }

  /// Response returned when no strategy could produce anything.
  pub fn synthetic_error(reason: &str) -> Self {
    let body = serde_json::json!({ "error": "offline", "message": reason });
    Self::new(503, body.to_string())
      .with_header(CONTENT_TYPE, HeaderValue::from_static("application/json"))
  }
}

/// Cache key of a request: method plus normalized URL, and a body digest for
/// requests that carry one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestIdentity(String);

impl RequestIdentity {
  pub fn of(request: &Request) -> Self {
    let mut key = format!("{} {}", request.method, normalize_url(&request.url));
    if let Some(body) = request.body.as_ref().filter(|b| !b.is_empty()) {
      let mut hasher = Sha256::new();
      hasher.update(body);
      key.push('#');
      key.push_str(&hex::encode(hasher.finalize()));
    }
    Self(key)
  }

  pub fn from_key(key: impl Into<String>) -> Self {
    Self(key.into())
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl fmt::Display for RequestIdentity {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

/// Normalize a URL for consistent cache keys.
/// Drops the fragment and sorts query parameters; scheme and host are already
/// lowercased by the parser.
pub fn normalize_url(url: &Url) -> String {
  let mut url = url.clone();
  url.set_fragment(None);

  let mut pairs: Vec<(String, String)> = url
    .query_pairs()
    .map(|(k, v)| (k.into_owned(), v.into_owned()))
    .collect();
  if pairs.is_empty() {
    url.set_query(None);
  } else {
    pairs.sort();
    url.query_pairs_mut().clear().extend_pairs(pairs);
  }

  url.to_string()
}
