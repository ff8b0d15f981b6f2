use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::transport::RetryPolicy;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub api: ApiConfig,
  #[serde(default)]
  pub retry: RetryConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub prefetch: PrefetchConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
  /// Base origin every request path is resolved against
  pub url: String,
  /// Per-attempt request timeout
  #[serde(default = "default_timeout_secs")]
  pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
  30
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
  pub max_retries: u32,
  pub base_delay_ms: u64,
}

impl Default for RetryConfig {
  fn default() -> Self {
    Self {
      max_retries: 3,
      base_delay_ms: 1000,
    }
  }
}

impl RetryConfig {
  pub fn policy(&self) -> RetryPolicy {
    RetryPolicy::new(self.max_retries, Duration::from_millis(self.base_delay_ms))
  }
}

/// Staleness windows per resource family, in seconds.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// Window for families without a specific entry
  pub default_stale_secs: u64,
  /// Overrides keyed by family name (case-insensitive)
  #[serde(deserialize_with = "deserialize_lowercase_map")]
  pub stale_secs: BTreeMap<String, u64>,
}

/// Built-in windows, used unless overridden.
const DEFAULT_STALE_SECS: &[(&str, u64)] = &[
  ("banners", 30 * 60),
  ("categories", 30 * 60),
  ("brands", 15 * 60),
  ("product", 10 * 60),
  ("products", 5 * 60),
  ("orders", 0),
];

impl CacheConfig {
  pub fn stale_time(&self, family: &str) -> Duration {
    let family = family.to_lowercase();
    let secs = self
      .stale_secs
      .get(&family)
      .copied()
      .or_else(|| {
        DEFAULT_STALE_SECS
          .iter()
          .find(|(name, _)| *name == family)
          .map(|(_, secs)| *secs)
      })
      .unwrap_or(self.default_stale_secs);
    Duration::from_secs(secs)
  }
}

fn deserialize_lowercase_map<'de, D>(deserializer: D) -> Result<BTreeMap<String, u64>, D::Error>
where
  D: serde::Deserializer<'de>,
{
  let m: BTreeMap<String, u64> = BTreeMap::deserialize(deserializer)?;
  Ok(m.into_iter().map(|(k, v)| (k.to_lowercase(), v)).collect())
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PrefetchConfig {
  /// Maximum simultaneous asset downloads
  pub concurrency: usize,
  /// How long below-the-fold images wait after the first screen
  pub low_priority_delay_ms: u64,
  /// Ceiling on downloaded image bytes kept in memory
  pub max_cache_bytes: usize,
}

impl Default for PrefetchConfig {
  fn default() -> Self {
    Self {
      concurrency: 4,
      low_priority_delay_ms: 1000,
      max_cache_bytes: crate::prefetch::DEFAULT_MAX_BYTES,
    }
  }
}

impl PrefetchConfig {
  pub fn low_priority_delay(&self) -> Duration {
    Duration::from_millis(self.low_priority_delay_ms)
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./storefront.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/storefront/config.yaml
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
        "No configuration file found. Create one at ~/.config/storefront/config.yaml\n\
                 with at least `api: {{ url: https://... }}`."
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("storefront.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("storefront").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::from_yaml(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn from_yaml(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    config.base_url()?;
    Ok(config)
  }

  /// The validated base URL.
  pub fn base_url(&self) -> Result<Url> {
    let url = Url::parse(&self.api.url)
      .map_err(|e| eyre!("Invalid api.url '{}': {}", self.api.url, e))?;
    if !matches!(url.scheme(), "http" | "https") {
      return Err(eyre!("api.url must be http(s), got '{}'", self.api.url));
    }
    Ok(url)
  }

  pub fn timeout(&self) -> Duration {
    Duration::from_secs(self.api.timeout_secs)
  }

  /// Get a bearer token from the environment, if one was provided.
  ///
  /// Checks STOREFRONT_TOKEN.
  pub fn get_api_token() -> Option<String> {
    std::env::var("STOREFRONT_TOKEN")
      .ok()
      .filter(|t| !t.trim().is_empty())
  }
}
