use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::sync::Backoff;

/// Upper bound for every configured period.
const MAX_PERIOD_SECS: u64 = 365 * 24 * 3600;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub api: ApiConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub queue: QueueConfig,
  #[serde(default)]
  pub flags: FlagsConfig,
  #[serde(default)]
  pub connectivity: ConnectivityConfig,
  /// Precache manifest for the version to install on `run`
  pub manifest: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
  /// Origin the application is served from
  pub base_url: String,
  #[serde(default = "default_api_prefix")]
  pub prefix: String,
  #[serde(default = "default_health_path")]
  pub health_path: String,
  /// Path templates of writes queued when offline. `{session}` names the
  /// ordering key.
  #[serde(default = "default_protected_writes")]
  pub protected_writes: Vec<String>,
}

fn default_api_prefix() -> String {
  "/api/".to_string()
}

fn default_health_path() -> String {
  "/health".to_string()
}

fn default_protected_writes() -> Vec<String> {
  vec![
    "/api/v1/sessions/{session}/answers".to_string(),
    "/api/v1/sessions/{session}/hints".to_string(),
  ]
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  pub shell_document: String,
  pub navigation_timeout_secs: u64,
  pub api_timeout_secs: u64,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      shell_document: "/index.html".to_string(),
      navigation_timeout_secs: 5,
      api_timeout_secs: 3,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
  pub retention_hours: u64,
  pub replay_timeout_secs: u64,
  pub purge_interval_secs: u64,
  pub backoff: BackoffConfig,
}

impl Default for QueueConfig {
  fn default() -> Self {
    Self {
      retention_hours: 24,
      replay_timeout_secs: 10,
      purge_interval_secs: 60,
      backoff: BackoffConfig::default(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
  pub base_secs: u64,
  pub max_secs: u64,
  /// Zero disables jitter
  pub jitter_ms: u64,
}

impl Default for BackoffConfig {
  fn default() -> Self {
    Self {
      base_secs: 2,
      max_secs: 300,
      jitter_ms: 1000,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FlagsConfig {
  pub endpoint: String,
  pub ttl_secs: u64,
  pub refresh_interval_secs: u64,
  pub user_id: Option<String>,
  pub group_id: Option<String>,
}

impl Default for FlagsConfig {
  fn default() -> Self {
    Self {
      endpoint: "/api/feature-flags".to_string(),
      ttl_secs: 300,
      refresh_interval_secs: 300,
      user_id: None,
      group_id: None,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConnectivityConfig {
  pub probe_interval_secs: u64,
}

impl Default for ConnectivityConfig {
  fn default() -> Self {
    Self {
      probe_interval_secs: 15,
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./lessonsw.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/lessonsw/config.yaml
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
        "No configuration file found. Create one at ~/.config/lessonsw/config.yaml\n\
                 See config.example.yaml for the format."
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("lessonsw.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("lessonsw").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    let mut config = Self::parse(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))?;

    // A relative manifest path is relative to the config file
    let resolved = match (&config.manifest, path.parent()) {
      (Some(manifest), Some(dir)) if manifest.is_relative() => Some(dir.join(manifest)),
      _ => None,
    };
    if resolved.is_some() {
      config.manifest = resolved;
    }

    Ok(config)
  }

  /// Parse and validate a YAML document.
  pub fn parse(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))?;
    config.validate()?;
    Ok(config)
  }

  fn validate(&self) -> Result<()> {
    self.base_url()?;
    if !self.api.prefix.starts_with('/') {
      return Err(eyre!("api.prefix must start with '/': {}", self.api.prefix));
    }
    if self.queue.retention_hours == 0 {
      return Err(eyre!("queue.retention_hours must be positive"));
    }
    if self.queue.retention_hours.saturating_mul(3600) > MAX_PERIOD_SECS {
      return Err(eyre!(
        "queue.retention_hours must be at most {}",
        MAX_PERIOD_SECS / 3600
      ));
    }
    for (name, secs) in [
      ("flags.ttl_secs", self.flags.ttl_secs),
      ("queue.backoff.base_secs", self.queue.backoff.base_secs),
      ("queue.backoff.max_secs", self.queue.backoff.max_secs),
      ("queue.backoff.jitter_ms", self.queue.backoff.jitter_ms / 1000),
    ] {
      if secs > MAX_PERIOD_SECS {
        return Err(eyre!("{} is too large", name));
      }
    }
    for (name, secs) in [
      ("cache.navigation_timeout_secs", self.cache.navigation_timeout_secs),
      ("cache.api_timeout_secs", self.cache.api_timeout_secs),
      ("queue.replay_timeout_secs", self.queue.replay_timeout_secs),
      ("queue.purge_interval_secs", self.queue.purge_interval_secs),
      ("flags.refresh_interval_secs", self.flags.refresh_interval_secs),
      ("connectivity.probe_interval_secs", self.connectivity.probe_interval_secs),
    ] {
      if secs == 0 {
        return Err(eyre!("{} must be positive", name));
      }
      if secs > MAX_PERIOD_SECS {
        return Err(eyre!("{} is too large", name));
      }
    }
    Ok(())
  }

  pub fn base_url(&self) -> Result<Url> {
    Url::parse(&self.api.base_url)
      .map_err(|e| eyre!("Invalid api.base_url {}: {}", self.api.base_url, e))
  }

  /// Resolve a path from the config against the base URL.
  pub fn endpoint(&self, path: &str) -> Result<Url> {
    self
      .base_url()?
      .join(path)
      .map_err(|e| eyre!("Invalid endpoint path {}: {}", path, e))
  }

  pub fn retention(&self) -> Duration {
    Duration::from_secs(self.queue.retention_hours.saturating_mul(3600))
  }

  pub fn backoff(&self) -> Backoff {
    let b = &self.queue.backoff;
    Backoff {
      base: Duration::from_secs(b.base_secs),
      max: Duration::from_secs(b.max_secs),
      jitter_max: (b.jitter_ms > 0).then(|| Duration::from_millis(b.jitter_ms)),
    }
  }

  /// Get the API bearer token from the environment, if any.
  ///
  /// Reads LESSONSW_TOKEN. The token is opaque and only ever forwarded.
  pub fn get_api_token() -> Option<String> {
    std::env::var("LESSONSW_TOKEN")
      .ok()
      .filter(|t| !t.trim().is_empty())
  }
}
