use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::jobs::{EstimatorConfig, PollerConfig};
use crate::queue::PoolConfig;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
  #[serde(default)]
  pub remote: RemoteConfig,
  #[serde(default)]
  pub store: StoreConfig,
  #[serde(default)]
  pub sync: SyncConfig,
  #[serde(default)]
  pub queue: QueueConfig,
  #[serde(default)]
  pub jobs: JobsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteConfig {
  /// Base URL of the attendance service
  pub url: String,
  #[serde(default = "default_request_timeout")]
  pub request_timeout_secs: u64,
}

impl Default for RemoteConfig {
  fn default() -> Self {
    Self {
      url: "http://localhost:8080".to_string(),
      request_timeout_secs: default_request_timeout(),
    }
  }
}

fn default_request_timeout() -> u64 {
  30
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StoreConfig {
  /// Database file (defaults to $XDG_DATA_HOME/rollcall/store.db)
  pub path: Option<PathBuf>,
  /// Upper bound on database pages, for quota-limited devices
  pub max_pages: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
  /// Minimum gap between governed queries of the same scope
  pub cooldown_minutes: u64,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self { cooldown_minutes: 10 }
  }
}

impl SyncConfig {
  pub fn cooldown(&self) -> Duration {
    Duration::from_secs(self.cooldown_minutes * 60)
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
  pub concurrency: usize,
  pub max_retries: u32,
  pub retry_delay_ms: u64,
  /// Start draining as soon as the client is opened
  pub auto_start: bool,
  pub idle_interval_secs: u64,
}

impl Default for QueueConfig {
  fn default() -> Self {
    Self {
      concurrency: 2,
      max_retries: 3,
      retry_delay_ms: 2000,
      auto_start: false,
      idle_interval_secs: 30,
    }
  }
}

impl QueueConfig {
  pub fn pool_config(&self) -> PoolConfig {
    PoolConfig {
      concurrency: self.concurrency,
      max_retries: self.max_retries,
      retry_delay: Duration::from_millis(self.retry_delay_ms),
      auto_start: self.auto_start,
      idle_interval: Duration::from_secs(self.idle_interval_secs),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct JobsConfig {
  pub min_generation_delay_secs: u64,
  pub poll_interval_secs: u64,
  /// Stop polling after this long. Unset polls until the job finishes.
  pub max_wait_secs: Option<u64>,
  pub per_month_secs: u64,
  pub multi_month_percent: u64,
  pub per_unit_secs: u64,
  pub per_day_secs: u64,
  pub full_breadth_units: u64,
}

impl Default for JobsConfig {
  fn default() -> Self {
    let est = EstimatorConfig::default();
    Self {
      min_generation_delay_secs: est.min_generation_delay_secs,
      poll_interval_secs: est.poll_interval_secs,
      max_wait_secs: None,
      per_month_secs: est.per_month_secs,
      multi_month_percent: est.multi_month_percent,
      per_unit_secs: est.per_unit_secs,
      per_day_secs: est.per_day_secs,
      full_breadth_units: est.full_breadth_units,
    }
  }
}

impl JobsConfig {
  pub fn poller_config(&self) -> PollerConfig {
    PollerConfig {
      min_generation_delay: Duration::from_secs(self.min_generation_delay_secs),
      poll_interval: Duration::from_secs(self.poll_interval_secs),
      max_wait: self.max_wait_secs.map(Duration::from_secs),
    }
  }

  pub fn estimator_config(&self) -> EstimatorConfig {
    EstimatorConfig {
      min_generation_delay_secs: self.min_generation_delay_secs,
      poll_interval_secs: self.poll_interval_secs,
      per_month_secs: self.per_month_secs,
      multi_month_percent: self.multi_month_percent,
      per_unit_secs: self.per_unit_secs,
      per_day_secs: self.per_day_secs,
      full_breadth_units: self.full_breadth_units,
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./rollcall.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/rollcall/config.yaml
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
        "No configuration file found. Create one at ~/.config/rollcall/config.yaml\n\
                 See config.example.yaml for the format."
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("rollcall.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("rollcall").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents).map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  fn parse(contents: &str) -> std::result::Result<Self, serde_yaml::Error> {
    serde_yaml::from_str(contents)
  }

  /// Database path: the configured one, else the platform data directory.
  pub fn store_path(&self) -> Result<PathBuf> {
    self
      .store
      .path
      .clone()
      .or_else(crate::db::Database::default_path)
      .ok_or_else(|| eyre!("Could not determine a data directory. Set store.path in the config."))
  }

  /// Get the API token from the environment.
  ///
  /// Reads ROLLCALL_API_TOKEN. Missing is not an error: the service may not
  /// require auth.
  pub fn get_api_token() -> Option<String> {
    std::env::var("ROLLCALL_API_TOKEN")
      .ok()
      .filter(|t| !t.trim().is_empty())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_empty_file_uses_defaults() {
    let config = Config::parse("{}").unwrap();
    assert_eq!(config.sync.cooldown_minutes, 10);
    assert_eq!(config.queue.pool_config(), PoolConfig::default());
    assert_eq!(config.jobs.estimator_config(), EstimatorConfig::default());
    assert_eq!(config.jobs.poller_config(), PollerConfig::default());
  }

  #[test]
  fn test_partial_sections() {
    let config = Config::parse(
      r#"
remote:
  url: https://school.example.org
store:
  max_pages: 4096
queue:
  concurrency: 4
  retry_delay_ms: 250
jobs:
  max_wait_secs: 600
"#,
    )
    .unwrap();

    assert_eq!(config.remote.url, "https://school.example.org");
    assert_eq!(config.remote.request_timeout_secs, 30);
    assert_eq!(config.store.max_pages, Some(4096));
    assert!(config.store.path.is_none());

    let pool = config.queue.pool_config();
    assert_eq!(pool.concurrency, 4);
    assert_eq!(pool.max_retries, 3);
    assert_eq!(pool.retry_delay, Duration::from_millis(250));
    assert_eq!(config.jobs.poller_config().max_wait, Some(Duration::from_secs(600)));
  }

  #[test]
  fn test_missing_explicit_path_is_an_error() {
    let err = Config::load(Some(Path::new("/nonexistent/rollcall.yaml"))).unwrap_err();
    assert!(err.to_string().contains("Config file not found"));
  }
}
