use regex::Regex;
use url::{Origin, Url};

use super::Strategy;
use crate::config::{Config, RouteConfig};
use crate::error::ConfigError;
use crate::http::Request;

/// Partition used for same-origin navigations that match no rule.
pub const PAGES_PARTITION: &str = "pages";

/// How a rule recognises a request.
///
/// Prefix and suffix rules look at the path of same-origin requests; regex
/// rules look at the whole URL of any origin.
#[derive(Debug, Clone)]
pub enum Matcher {
  Prefix(String),
  Suffix(String),
  Regex(Regex),
}

impl Matcher {
  fn matches(&self, url: &Url, same_origin: bool) -> bool {
    match self {
      Matcher::Prefix(prefix) => same_origin && url.path().starts_with(prefix.as_str()),
      Matcher::Suffix(suffix) => same_origin && url.path().ends_with(suffix.as_str()),
      Matcher::Regex(re) => re.is_match(url.as_str()),
    }
  }
}

#[derive(Debug, Clone)]
pub struct Rule {
  pub matcher: Matcher,
  pub strategy: Strategy,
  pub partition: Option<String>,
}

impl Rule {
  pub fn new(matcher: Matcher, strategy: Strategy, partition: Option<&str>) -> Self {
    Self {
      matcher,
      strategy,
      partition: partition.map(String::from),
    }
  }

  fn from_config(route: &RouteConfig) -> Result<Self, ConfigError> {
    let matcher = match (&route.prefix, &route.suffix, &route.regex) {
      (Some(prefix), None, None) => Matcher::Prefix(prefix.clone()),
      (None, Some(suffix), None) => Matcher::Suffix(suffix.clone()),
      (None, None, Some(pattern)) => {
        Matcher::Regex(Regex::new(pattern).map_err(|source| ConfigError::InvalidPattern {
          pattern: pattern.clone(),
          source,
        })?)
      }
      _ => {
        return Err(ConfigError::Invalid(
          "each route needs exactly one of prefix, suffix or regex".to_string(),
        ))
      }
    };

    Ok(Self {
      matcher,
      strategy: route.strategy,
      partition: route.partition.clone(),
    })
  }
}

/// Outcome of classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
  pub strategy: Strategy,
  /// Partition name; `None` only for network-only routes
  pub partition: Option<String>,
}

impl Route {
  pub fn network_only() -> Self {
    Self {
      strategy: Strategy::NetworkOnly,
      partition: None,
    }
  }
}

/// Ordered rule list, first match wins.
#[derive(Debug, Clone)]
pub struct StrategySelector {
  origin: Origin,
  rules: Vec<Rule>,
  /// Whether same-origin navigations get stale-while-revalidate by default
  pages_partition: bool,
}

impl StrategySelector {
  pub fn new(origin: &Url, rules: Vec<Rule>, pages_partition: bool) -> Self {
    Self {
      origin: origin.origin(),
      rules,
      pages_partition,
    }
  }

  /// Compile the route table from configuration.
  pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
    let rules = config
      .routes
      .iter()
      .map(Rule::from_config)
      .collect::<Result<Vec<_>, _>>()?;
    let pages_partition = config
      .cache
      .partitions
      .iter()
      .any(|p| p.name == PAGES_PARTITION);

    Ok(Self::new(&config.api.base_url, rules, pages_partition))
  }

  /// Pick a strategy for a request. Evaluated per request, never memoised.
  pub fn classify(&self, request: &Request) -> Route {
    if !request.is_cacheable() {
      return Route::network_only();
    }

    let same_origin = request.url.origin() == self.origin;

    if let Some(rule) = self
      .rules
      .iter()
      .find(|rule| rule.matcher.matches(&request.url, same_origin))
    {
      return Route {
        strategy: rule.strategy,
        partition: rule.partition.clone(),
      };
    }

    if same_origin && request.navigation && self.pages_partition {
      return Route {
        strategy: Strategy::StaleWhileRevalidate,
        partition: Some(PAGES_PARTITION.to_string()),
      };
    }

    Route::network_only()
  }
}
