use async_trait::async_trait;
use std::time::Duration;

use crate::config::SyncConfig;
use crate::error::FetchError;
use crate::http::Response;

/// Exponential backoff with a cap.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
  pub max_retries: u32,
  pub base_delay: Duration,
  pub max_delay: Duration,
  pub multiplier: f64,
}

impl RetryPolicy {
  pub fn from_config(config: &SyncConfig) -> Self {
    Self {
      max_retries: config.max_retries,
      base_delay: config.base_delay,
      max_delay: config.max_delay,
      multiplier: config.multiplier,
    }
  }

  /// Delay before the next attempt, given how many attempts have failed.
  ///
  /// `base * multiplier^(failures - 1)`, never above `max_delay`.
  pub fn backoff(&self, failures: u32) -> Duration {
    if failures == 0 {
      return Duration::ZERO;
    }
    let exponent = (failures - 1).min(63) as i32;
    let secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
    if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
      self.max_delay
    } else {
      Duration::from_secs_f64(secs)
    }
  }
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self::from_config(&SyncConfig::default())
  }
}

/// Waits between retries. Swapped out in tests so backoff costs no time.
#[async_trait]
pub trait Sleeper: Send + Sync {
  async fn sleep(&self, duration: Duration);
}

pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
  async fn sleep(&self, duration: Duration) {
    tokio::time::sleep(duration).await;
  }
}

/// Why a replay attempt did not succeed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Failure {
  /// No response at all: timeouts and network loss. Retried, but the link
  /// itself may be gone.
  Unreachable(String),
  /// The server answered with throttling or an error worth retrying
  Transient(String),
  /// The server rejected the mutation
  Permanent(String),
}

/// Classify a replay outcome. `None` means success (2xx or 3xx).
pub fn classify(result: &Result<Response, FetchError>) -> Option<Failure> {
  match result {
    Err(e) => Some(Failure::Unreachable(e.to_string())),
    Ok(response) => match response.status {
      s if s < 400 => None,
      408 | 429 => Some(Failure::Transient(format!("HTTP {}", response.status))),
      s if s >= 500 => Some(Failure::Transient(format!("HTTP {}", s))),
      s => Some(Failure::Permanent(format!("HTTP {}", s))),
    },
  }
}
