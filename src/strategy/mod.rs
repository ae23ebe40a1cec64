//! Routing of intercepted requests to caching strategies.
//!
//! The selector is a pure function over static rules; the executor applies a
//! chosen strategy against the cache store and the network.

mod executor;
mod selector;

use serde::{Deserialize, Serialize};
use std::fmt;

pub use executor::StrategyExecutor;
pub use selector::{Matcher, Route, Rule, StrategySelector, PAGES_PARTITION};

/// Policy governing whether a request is served from cache, network, or both.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
  CacheFirst,
  NetworkFirst,
  StaleWhileRevalidate,
  NetworkOnly,
}

impl fmt::Display for Strategy {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      Strategy::CacheFirst => "cache-first",
      Strategy::NetworkFirst => "network-first",
      Strategy::StaleWhileRevalidate => "stale-while-revalidate",
      Strategy::NetworkOnly => "network-only",
    };
    f.write_str(name)
  }
}
