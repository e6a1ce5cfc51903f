use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cache::{parse_ttl, CacheStrategy};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_PERIODIC_INTERVAL: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
  pub data: DataConfig,
  /// Per-prefix fetch policies; the longest matching prefix wins
  pub routes: BTreeMap<String, RouteConfig>,
  /// URLs pre-cached by `Harbor::warm_app_shell`
  pub app_shell: Vec<String>,
  pub network: NetworkConfig,
  pub queue: QueueConfig,
  pub storage: StorageConfig,
  pub plugins: PluginsConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DataConfig {
  pub default_policy: Option<CacheStrategy>,
  /// Duration string such as "5m"
  pub default_ttl: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RouteConfig {
  pub strategy: CacheStrategy,
  #[serde(default)]
  pub max_age: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
  /// Per-request timeout, e.g. "30s"
  pub timeout: Option<String>,
  pub user_agent: Option<String>,
}

impl NetworkConfig {
  pub fn timeout(&self) -> Duration {
    duration_or(self.timeout.as_deref(), DEFAULT_TIMEOUT)
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
  /// Failed attempts after which a mutation is dead-lettered (unset = retry forever)
  pub max_attempts: Option<u32>,
  /// How often the foreground flush runs, e.g. "5m"
  pub periodic_interval: Option<String>,
}

impl QueueConfig {
  pub fn periodic_interval(&self) -> Duration {
    duration_or(self.periodic_interval.as_deref(), DEFAULT_PERIODIC_INTERVAL)
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
  /// Database file (defaults to $XDG_DATA_HOME/harbor/store.db)
  pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PluginsConfig {
  pub logger: bool,
  pub analytics: Option<AnalyticsConfig>,
  pub server_sync: Option<ServerSyncConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AnalyticsConfig {
  pub endpoint: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerSyncConfig {
  pub endpoint: String,
}

/// Malformed or zero durations fall back to the default.
fn duration_or(input: Option<&str>, default: Duration) -> Duration {
  input
    .and_then(parse_ttl)
    .filter(|ms| *ms > 0)
    .map(Duration::from_millis)
    .unwrap_or(default)
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./harbor.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/harbor/config.yaml
  ///
  /// With no file found, the defaults are used.
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
      None => Ok(Self::default()),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("harbor.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("harbor").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  pub fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::from_yaml(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn from_yaml(contents: &str) -> Result<Self, serde_yaml::Error> {
    serde_yaml::from_str(contents)
  }

  /// Route whose prefix is the longest match for `url`.
  pub fn route_for(&self, url: &str) -> Option<&RouteConfig> {
    self
      .routes
      .iter()
      .filter(|(prefix, _)| url.starts_with(prefix.as_str()))
      .max_by_key(|(prefix, _)| prefix.len())
      .map(|(_, route)| route)
  }
}
