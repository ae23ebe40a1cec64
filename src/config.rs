use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::error::ConfigError;
use crate::strategy::Strategy;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub api: ApiConfig,
  #[serde(default)]
  pub network: NetworkConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  /// Ordered routing rules, first match wins
  #[serde(default)]
  pub routes: Vec<RouteConfig>,
  #[serde(default)]
  pub sync: SyncConfig,
  #[serde(default)]
  pub connectivity: ConnectivityConfig,
  #[serde(default)]
  pub logging: LoggingConfig,
  #[serde(default)]
  pub push: PushConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
  /// Origin shared by the pages and the remote API
  pub base_url: Url,
  /// Path probed to confirm the API is reachable
  #[serde(default = "default_health_path")]
  pub health_path: String,
}

fn default_health_path() -> String {
  "/".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct NetworkConfig {
  #[serde(default = "default_timeout", with = "humantime_serde")]
  pub timeout: Duration,
}

fn default_timeout() -> Duration {
  Duration::from_secs(8)
}

impl Default for NetworkConfig {
  fn default() -> Self {
    Self {
      timeout: default_timeout(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
  /// When false every strategy degrades to network-only
  #[serde(default = "default_true")]
  pub enabled: bool,
  /// Version tag shared by all partitions of this deployment
  #[serde(default = "default_version")]
  pub version: String,
  #[serde(default = "default_partitions")]
  pub partitions: Vec<PartitionConfig>,
  /// Critical resources stored into the static partition on install
  #[serde(default)]
  pub precache: Vec<String>,
  /// Served from the pages partition when a navigation cannot be satisfied
  #[serde(default)]
  pub offline_document: Option<String>,
}

fn default_true() -> bool {
  true
}

fn default_version() -> String {
  "v1".to_string()
}

fn default_partitions() -> Vec<PartitionConfig> {
  vec![
    PartitionConfig {
      name: "static".to_string(),
      max_entries: 60,
    },
    PartitionConfig {
      name: "api".to_string(),
      max_entries: 100,
    },
    PartitionConfig {
      name: "pages".to_string(),
      max_entries: 30,
    },
  ]
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      enabled: true,
      version: default_version(),
      partitions: default_partitions(),
      precache: Vec::new(),
      offline_document: None,
    }
  }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct PartitionConfig {
  pub name: String,
  pub max_entries: usize,
}

/// A routing rule. Exactly one of `prefix`, `suffix` or `regex` must be set.
#[derive(Debug, Clone, Deserialize)]
pub struct RouteConfig {
  #[serde(default)]
  pub prefix: Option<String>,
  #[serde(default)]
  pub suffix: Option<String>,
  #[serde(default)]
  pub regex: Option<String>,
  pub strategy: Strategy,
  /// Partition used by caching strategies; ignored for network-only
  #[serde(default)]
  pub partition: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
  #[serde(default = "default_max_retries")]
  pub max_retries: u32,
  #[serde(default = "default_base_delay", with = "humantime_serde")]
  pub base_delay: Duration,
  #[serde(default = "default_max_delay", with = "humantime_serde")]
  pub max_delay: Duration,
  #[serde(default = "default_multiplier")]
  pub multiplier: f64,
  /// Periodic drain while online
  #[serde(default = "default_interval", with = "humantime_serde")]
  pub interval: Duration,
  #[serde(default = "default_true")]
  pub idempotency_keys: bool,
}

fn default_max_retries() -> u32 {
  5
}

fn default_base_delay() -> Duration {
  Duration::from_secs(1)
}

fn default_max_delay() -> Duration {
  Duration::from_secs(60)
}

fn default_multiplier() -> f64 {
  2.0
}

fn default_interval() -> Duration {
  Duration::from_secs(300)
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      max_retries: default_max_retries(),
      base_delay: default_base_delay(),
      max_delay: default_max_delay(),
      multiplier: default_multiplier(),
      interval: default_interval(),
      idempotency_keys: true,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConnectivityConfig {
  #[serde(default = "default_probe_interval", with = "humantime_serde")]
  pub probe_interval: Duration,
}

fn default_probe_interval() -> Duration {
  Duration::from_secs(30)
}

impl Default for ConnectivityConfig {
  fn default() -> Self {
    Self {
      probe_interval: default_probe_interval(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
  #[serde(default = "default_level")]
  pub level: String,
  /// Directory for daily-rotated log files; stderr only when unset
  #[serde(default)]
  pub directory: Option<PathBuf>,
}

fn default_level() -> String {
  "info".to_string()
}

impl Default for LoggingConfig {
  fn default() -> Self {
    Self {
      level: default_level(),
      directory: None,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PushConfig {
  #[serde(default = "default_push_title")]
  pub default_title: String,
  #[serde(default = "default_push_url")]
  pub default_url: String,
}

fn default_push_title() -> String {
  "Agri Training".to_string()
}

fn default_push_url() -> String {
  "/".to_string()
}

impl Default for PushConfig {
  fn default() -> Self {
    Self {
      default_title: default_push_title(),
      default_url: default_push_url(),
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./agrisync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/agrisync/config.yaml
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Err(eyre!(
        "No configuration file found. Create one at ~/.config/agrisync/config.yaml\n\
                 See agrisync.example.yaml for the format."
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("agrisync.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("agrisync").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    let config = Self::from_yaml(&contents)
      .map_err(|e| eyre!("Failed to load config file {}: {}", path.display(), e))?;

    Ok(config)
  }

  /// Parse and validate a YAML document.
  pub fn from_yaml(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    config.validate()?;
    Ok(config)
  }

  /// Minimal config pointing at `base_url`, everything else defaulted.
  pub fn for_origin(base_url: Url) -> Self {
    Self {
      api: ApiConfig {
        base_url,
        health_path: default_health_path(),
      },
      network: NetworkConfig::default(),
      cache: CacheConfig::default(),
      routes: Vec::new(),
      sync: SyncConfig::default(),
      connectivity: ConnectivityConfig::default(),
      logging: LoggingConfig::default(),
      push: PushConfig::default(),
    }
  }

  /// Check cross-field constraints serde cannot express.
  pub fn validate(&self) -> std::result::Result<(), ConfigError> {
    let declared: BTreeSet<&str> = self
      .cache
      .partitions
      .iter()
      .map(|p| p.name.as_str())
      .collect();

    if declared.len() != self.cache.partitions.len() {
      return Err(ConfigError::Invalid(
        "partition names must be unique".to_string(),
      ));
    }

    if let Some(p) = self.cache.partitions.iter().find(|p| p.max_entries == 0) {
      return Err(ConfigError::Invalid(format!(
        "partition {} must allow at least one entry",
        p.name
      )));
    }

    if !self.cache.precache.is_empty() && !declared.contains("static") {
      return Err(ConfigError::Invalid(
        "precache requires a static partition".to_string(),
      ));
    }

    if self.cache.offline_document.is_some() && !declared.contains("pages") {
      return Err(ConfigError::Invalid(
        "offline_document requires a pages partition".to_string(),
      ));
    }

    for route in &self.routes {
      let patterns = [&route.prefix, &route.suffix, &route.regex]
        .iter()
        .filter(|p| p.is_some())
        .count();
      if patterns != 1 {
        return Err(ConfigError::Invalid(
          "each route needs exactly one of prefix, suffix or regex".to_string(),
        ));
      }
      if let Some(partition) = &route.partition {
        if !declared.contains(partition.as_str()) {
          return Err(ConfigError::Invalid(format!(
            "route refers to undeclared partition {}",
            partition
          )));
        }
      } else if route.strategy != Strategy::NetworkOnly {
        return Err(ConfigError::Invalid(format!(
          "{} route needs a partition",
          route.strategy
        )));
      }
    }

    if self.sync.multiplier < 1.0 {
      return Err(ConfigError::Invalid(
        "sync.multiplier must be at least 1.0".to_string(),
      ));
    }

    Ok(())
  }
}
