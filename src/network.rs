//! Access to the remote API.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::error::FetchError;
use crate::http::{Request, Response};

/// Something that can perform a request against the remote API.
///
/// An error means no response was obtained; any HTTP status, including
/// 4xx and 5xx, is returned as `Ok`.
#[async_trait]
pub trait Network: Send + Sync {
  async fn fetch(&self, request: &Request) -> std::result::Result<Response, FetchError>;
}

/// reqwest-backed network client
#[derive(Clone)]
pub struct HttpNetwork {
  client: reqwest::Client,
  timeout: Duration,
}

impl HttpNetwork {
  pub fn new(timeout: Duration) -> Result<Self> {
    let client = reqwest::Client::builder()
      .timeout(timeout)
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { client, timeout })
  }
}

#[async_trait]
impl Network for HttpNetwork {
  async fn fetch(&self, request: &Request) -> std::result::Result<Response, FetchError> {
    let mut builder = self
      .client
      .request(request.method.clone(), request.url.clone())
      .headers(request.headers.clone());
    if let Some(body) = &request.body {
      builder = builder.body(body.clone());
    }

    let response = builder.send().await.map_err(|e| self.classify(e))?;

    let status = response.status().as_u16();
    let headers = response.headers().clone();
    let body = response.bytes().await.map_err(|e| self.classify(e))?;

    debug!(method = %request.method, url = %request.url, status, "Fetched");

    Ok(Response {
      status,
      headers,
      body,
    })
  }
}

impl HttpNetwork {
  fn classify(&self, e: reqwest::Error) -> FetchError {
    if e.is_timeout() {
      FetchError::Timeout(self.timeout)
    } else {
      FetchError::NetworkUnavailable(e.to_string())
    }
  }
}

/// Wraps any `Network` with a hard upper bound on each fetch.
#[derive(Clone)]
pub struct TimedNetwork {
  inner: Arc<dyn Network>,
  timeout: Duration,
}

impl TimedNetwork {
  pub fn new(inner: Arc<dyn Network>, timeout: Duration) -> Self {
    Self { inner, timeout }
  }

  pub async fn fetch(&self, request: &Request) -> std::result::Result<Response, FetchError> {
    match tokio::time::timeout(self.timeout, self.inner.fetch(request)).await {
      Ok(result) => result,
      Err(_) => Err(FetchError::Timeout(self.timeout)),
    }
  }

  /// Owned variant for futures that outlive the caller, such as background
  /// revalidation.
  pub fn fetch_owned(
    &self,
    request: Request,
  ) -> impl Future<Output = std::result::Result<Response, FetchError>> + Send + 'static {
    let this = self.clone();
    async move { this.fetch(&request).await }
  }
}
