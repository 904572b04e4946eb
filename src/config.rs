use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cache::DEFAULT_STALE_TIME;

const APP_NAME: &str = "tracker-cache";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// How long successful data is served without refetching
  pub stale_time_ms: u64,
  /// Per-resource stale time overrides, keyed by resource type (e.g. "comments")
  #[serde(deserialize_with = "deserialize_lowercase_keys")]
  pub resources: BTreeMap<String, u64>,
  /// Refetch observed entries as soon as they are invalidated
  pub refetch_on_invalidate: bool,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      stale_time_ms: DEFAULT_STALE_TIME.as_millis() as u64,
      resources: BTreeMap::new(),
      refetch_on_invalidate: true,
    }
  }
}

impl CacheConfig {
  /// Stale time for `resource`, falling back to the global setting.
  pub fn stale_time_for(&self, resource: &str) -> Duration {
    let ms = self
      .resources
      .get(&resource.to_lowercase())
      .copied()
      .unwrap_or(self.stale_time_ms);
    Duration::from_millis(ms)
  }
}

fn deserialize_lowercase_keys<'de, D>(deserializer: D) -> Result<BTreeMap<String, u64>, D::Error>
where
  D: serde::Deserializer<'de>,
{
  let m: BTreeMap<String, u64> = BTreeMap::deserialize(deserializer)?;
  Ok(m.into_iter().map(|(k, v)| (k.to_lowercase(), v)).collect())
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
  /// Default filter directive, overridden by TRACKER_CACHE_LOG
  pub level: String,
  /// Directory for a daily-rotated log file; stderr only when unset
  pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
  fn default() -> Self {
    Self {
      level: "info".to_string(),
      file: None,
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./tracker-cache.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/tracker-cache/config.yaml
  ///
  /// Without any file the defaults are used.
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
    let local = PathBuf::from(format!("{APP_NAME}.yaml"));
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join(APP_NAME).join("config.yaml");
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

  pub fn parse(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    Ok(config)
  }
}
