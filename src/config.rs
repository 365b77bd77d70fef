use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Deserializer};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_API_BASE: &str = "https://www.googleapis.com/drive/v3/files";

/// Scopes the site has historically cached under; swept by a full clear.
const KNOWN_SCOPES: &[&str] = &[
  "drive", "1ST", "2ND", "3RD", "4TH", "5TH", "6TH", "7TH", "8TH", "MBA-1ST", "MBA-2ND",
];

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
  pub drive: DriveConfig,
  /// Limiter used by interactive listing and search
  #[serde(deserialize_with = "deserialize_foreground")]
  pub foreground: LimiterConfig,
  /// Limiter used by the background preloader
  #[serde(deserialize_with = "deserialize_background")]
  pub background: LimiterConfig,
  pub cache: CacheConfig,
  pub search: SearchSettings,
  pub preload: PreloadSettings,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      drive: DriveConfig::default(),
      foreground: LimiterConfig::foreground(),
      background: LimiterConfig::background(),
      cache: CacheConfig::default(),
      search: SearchSettings::default(),
      preload: PreloadSettings::default(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DriveConfig {
  /// Endpoint of the `files.list` call
  pub api_base: String,
  pub api_keys: Vec<String>,
}

impl Default for DriveConfig {
  fn default() -> Self {
    Self {
      api_base: DEFAULT_API_BASE.to_string(),
      api_keys: Vec::new(),
    }
  }
}

/// Concurrency and retry policy for one rate limiter instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LimiterConfig {
  pub max_concurrent: usize,
  pub inter_start_delay: Duration,
  /// Lower bound of the randomized wait after a 429
  pub backoff_min: Duration,
  /// Upper bound (exclusive) of the randomized wait after a 429
  pub backoff_max: Duration,
  /// Number of 429 responses tolerated before giving up on a request
  pub max_throttle_retries: u32,
  /// Deadline for a single attempt
  pub request_timeout: Duration,
}

impl LimiterConfig {
  pub fn foreground() -> Self {
    Self {
      max_concurrent: 200,
      inter_start_delay: Duration::from_millis(2),
      backoff_min: Duration::from_millis(1000),
      backoff_max: Duration::from_millis(3000),
      max_throttle_retries: 8,
      request_timeout: Duration::from_secs(30),
    }
  }

  pub fn background() -> Self {
    Self {
      max_concurrent: 2,
      inter_start_delay: Duration::from_millis(300),
      ..Self::foreground()
    }
  }
}

/// Partial limiter section; unset fields keep the base profile's values.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct LimiterOverrides {
  max_concurrent: Option<usize>,
  inter_start_delay_ms: Option<u64>,
  backoff_min_ms: Option<u64>,
  backoff_max_ms: Option<u64>,
  max_throttle_retries: Option<u32>,
  request_timeout_secs: Option<u64>,
}

impl LimiterOverrides {
  fn apply(self, base: LimiterConfig) -> LimiterConfig {
    LimiterConfig {
      max_concurrent: self.max_concurrent.unwrap_or(base.max_concurrent).max(1),
      inter_start_delay: self
        .inter_start_delay_ms
        .map(Duration::from_millis)
        .unwrap_or(base.inter_start_delay),
      backoff_min: self
        .backoff_min_ms
        .map(Duration::from_millis)
        .unwrap_or(base.backoff_min),
      backoff_max: self
        .backoff_max_ms
        .map(Duration::from_millis)
        .unwrap_or(base.backoff_max),
      max_throttle_retries: self
        .max_throttle_retries
        .unwrap_or(base.max_throttle_retries),
      request_timeout: self
        .request_timeout_secs
        .map(Duration::from_secs)
        .unwrap_or(base.request_timeout),
    }
  }
}

fn deserialize_foreground<'de, D>(deserializer: D) -> Result<LimiterConfig, D::Error>
where
  D: Deserializer<'de>,
{
  Ok(LimiterOverrides::deserialize(deserializer)?.apply(LimiterConfig::foreground()))
}

fn deserialize_background<'de, D>(deserializer: D) -> Result<LimiterConfig, D::Error>
where
  D: Deserializer<'de>,
{
  Ok(LimiterOverrides::deserialize(deserializer)?.apply(LimiterConfig::background()))
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// SQLite database path (default: $XDG_DATA_HOME/drivecrawl/cache.db)
  pub path: Option<PathBuf>,
  pub ttl_hours: i64,
  /// Scopes cleared by a full clear in addition to the prefix sweep
  pub scopes: Vec<String>,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      path: None,
      ttl_hours: 24,
      scopes: KNOWN_SCOPES.iter().map(|s| s.to_string()).collect(),
    }
  }
}

impl CacheConfig {
  pub fn ttl(&self) -> chrono::Duration {
    chrono::Duration::hours(self.ttl_hours)
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SearchSettings {
  /// Crawl roots processed concurrently per batch
  pub batch_size: usize,
  /// Stop taking new batches once more results than this are collected
  pub result_limit: usize,
  pub max_depth: u32,
  /// Scope used when the caller does not name one
  pub scope: String,
}

impl Default for SearchSettings {
  fn default() -> Self {
    Self {
      batch_size: 5,
      result_limit: 500,
      max_depth: 3,
      scope: "drive".to_string(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PreloadSettings {
  /// Folder-mapping document: a local path or an http(s) URL
  pub mapping: Option<String>,
  pub scope: String,
  pub max_depth: u32,
  pub landing_delay_secs: u64,
  pub page_delay_secs: u64,
}

impl Default for PreloadSettings {
  fn default() -> Self {
    Self {
      mapping: None,
      scope: "preload".to_string(),
      max_depth: 4,
      landing_delay_secs: 10,
      page_delay_secs: 2,
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided (must exist)
  /// 2. ./drivecrawl.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/drivecrawl/config.yaml
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
    let local = PathBuf::from("drivecrawl.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("drivecrawl").join("config.yaml");
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
    // An empty document deserializes as null rather than an empty mapping
    if contents.trim().is_empty() {
      return Ok(Self::default());
    }
    serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))
  }

  /// API keys, taken from DRIVECRAWL_API_KEYS (comma-separated) when set,
  /// otherwise from the config file.
  pub fn api_keys(&self) -> Vec<String> {
    match std::env::var("DRIVECRAWL_API_KEYS") {
      Ok(value) if !value.trim().is_empty() => value.split(',').map(String::from).collect(),
      _ => self.drive.api_keys.clone(),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_empty_document_uses_defaults() {
    let config = Config::from_yaml("").unwrap();
    assert_eq!(config.foreground, LimiterConfig::foreground());
    assert_eq!(config.background, LimiterConfig::background());
    assert_eq!(config.search.batch_size, 5);
    assert_eq!(config.search.result_limit, 500);
    assert_eq!(config.preload.max_depth, 4);
    assert_eq!(config.cache.ttl(), chrono::Duration::hours(24));
    assert!(config.cache.scopes.iter().any(|s| s == "MBA-2ND"));
  }

  #[test]
  fn test_partial_background_keeps_background_profile() {
    let config = Config::from_yaml(
      r#"
background:
  max_concurrent: 4
foreground:
  inter_start_delay_ms: 10
  max_throttle_retries: 2
"#,
    )
    .unwrap();

    assert_eq!(config.background.max_concurrent, 4);
    assert_eq!(config.background.inter_start_delay, Duration::from_millis(300));
    assert_eq!(config.foreground.max_concurrent, 200);
    assert_eq!(config.foreground.inter_start_delay, Duration::from_millis(10));
    assert_eq!(config.foreground.max_throttle_retries, 2);
  }

  #[test]
  fn test_zero_concurrency_clamped() {
    let config = Config::from_yaml("foreground:\n  max_concurrent: 0\n").unwrap();
    assert_eq!(config.foreground.max_concurrent, 1);
  }

  #[test]
  fn test_drive_and_preload_sections() {
    let config = Config::from_yaml(
      r#"
drive:
  api_keys: ["k1", "k2"]
preload:
  mapping: ./assets/drive-mapping.json
  scope: background
"#,
    )
    .unwrap();

    assert_eq!(config.drive.api_base, DEFAULT_API_BASE);
    assert_eq!(config.drive.api_keys, vec!["k1", "k2"]);
    assert_eq!(
      config.preload.mapping.as_deref(),
      Some("./assets/drive-mapping.json")
    );
    assert_eq!(config.preload.scope, "background");
    assert_eq!(config.preload.landing_delay_secs, 10);
  }

  #[test]
  fn test_missing_explicit_path_is_error() {
    assert!(Config::load(Some(Path::new("/nonexistent/drivecrawl.yaml"))).is_err());
  }
}
