use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use url::Url;

use crate::db::Database;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  /// Origin the worker is registered for (scope is the whole origin)
  #[serde(default = "default_origin")]
  pub origin: String,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub network: NetworkConfig,
  #[serde(default)]
  pub sync: SyncConfig,
  #[serde(default)]
  pub lifecycle: LifecycleConfig,
  #[serde(default)]
  pub kyc: KycConfig,
  /// Directory for the database and logs (defaults to $XDG_DATA_HOME/cipsw)
  pub data_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
  /// Build identifier naming the current cache generation
  #[serde(default = "default_cache_version")]
  pub version: String,
  /// When false, nothing is ever written to or read from the cache stores
  #[serde(default = "default_true")]
  pub enabled: bool,
  /// Paths fetched and stored at install time
  #[serde(default = "default_precache")]
  pub precache: Vec<String>,
  /// Page served when a navigation fails and has no cached copy
  #[serde(default = "default_page")]
  pub default_page: String,
  /// Path substrings that mark a request as API data, besides `/api/`
  #[serde(default = "default_api_patterns")]
  pub api_patterns: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NetworkConfig {
  #[serde(default = "default_timeout_secs")]
  pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
  /// Periodic drain interval in watch mode
  #[serde(default = "default_sync_interval_secs")]
  pub interval_secs: u64,
  /// Path probed to detect connectivity changes
  #[serde(default = "default_probe_path")]
  pub probe_path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LifecycleConfig {
  /// Activate right after a successful install instead of waiting
  #[serde(default = "default_true")]
  pub skip_waiting: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct KycConfig {
  /// Sections that require a verified identity
  #[serde(default = "default_gated_sections")]
  pub gated_sections: Vec<String>,
}

fn default_origin() -> String {
  "http://localhost:5000".to_string()
}

fn default_cache_version() -> String {
  "v1.0.0".to_string()
}

fn default_true() -> bool {
  true
}

fn default_precache() -> Vec<String> {
  [
    "/",
    "/user/dashboard",
    "/user/search",
    "/user/new-project",
    "/user/portfolio",
    "/user/profile",
    "/assets/css/style.css",
    "/assets/css/mobile-optimizations.css",
    "/assets/css/output.css",
    "/assets/css/brand-colors.css",
    "/assets/js/app.js",
    "/assets/manifest.json",
    "/assets/icons/icon-192x192.png",
    "/assets/icons/icon-512x512.png",
  ]
  .into_iter()
  .map(String::from)
  .collect()
}

fn default_page() -> String {
  "/user/dashboard".to_string()
}

fn default_api_patterns() -> Vec<String> {
  vec!["portfolio/".to_string()]
}

fn default_timeout_secs() -> u64 {
  30
}

fn default_sync_interval_secs() -> u64 {
  300
}

fn default_probe_path() -> String {
  "/".to_string()
}

fn default_gated_sections() -> Vec<String> {
  vec![
    "/user/new-project".to_string(),
    "/user/portfolio".to_string(),
    "/user/projects".to_string(),
  ]
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      version: default_cache_version(),
      enabled: true,
      precache: default_precache(),
      default_page: default_page(),
      api_patterns: default_api_patterns(),
    }
  }
}

impl Default for NetworkConfig {
  fn default() -> Self {
    Self {
      timeout_secs: default_timeout_secs(),
    }
  }
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      interval_secs: default_sync_interval_secs(),
      probe_path: default_probe_path(),
    }
  }
}

impl Default for LifecycleConfig {
  fn default() -> Self {
    Self { skip_waiting: true }
  }
}

impl Default for KycConfig {
  fn default() -> Self {
    Self {
      gated_sections: default_gated_sections(),
    }
  }
}

impl Default for Config {
  fn default() -> Self {
    Self {
      origin: default_origin(),
      cache: CacheConfig::default(),
      network: NetworkConfig::default(),
      sync: SyncConfig::default(),
      lifecycle: LifecycleConfig::default(),
      kyc: KycConfig::default(),
      data_dir: None,
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./cipsw.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/cipsw/config.yaml
  ///
  /// Falls back to the built-in defaults when no file exists.
  /// `CIPSW_ORIGIN` overrides the configured origin.
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

    let mut config = match path {
      Some(p) => Self::load_from_path(&p)?,
      None => Config::default(),
    };

    if let Ok(origin) = std::env::var("CIPSW_ORIGIN") {
      config.origin = origin;
    }

    config.validate()?;
    Ok(config)
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("cipsw.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("cipsw").join("config.yaml");
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
    let config: Config = serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))?;
    Ok(config)
  }

  fn validate(&self) -> Result<()> {
    let origin = self.origin_url()?;
    if !matches!(origin.scheme(), "http" | "https") {
      return Err(eyre!("Origin must be an http(s) URL: {}", self.origin));
    }
    if self.cache.version.trim().is_empty() {
      return Err(eyre!("cache.version must not be empty"));
    }
    Ok(())
  }

  pub fn origin_url(&self) -> Result<Url> {
    Url::parse(&self.origin).map_err(|e| eyre!("Invalid origin {}: {}", self.origin, e))
  }

  /// Resolve a path (or absolute URL) against the origin.
  pub fn resolve(&self, path: &str) -> Result<Url> {
    self
      .origin_url()?
      .join(path)
      .map_err(|e| eyre!("Invalid URL {}: {}", path, e))
  }

  /// Directory holding the database and log files.
  pub fn data_dir(&self) -> Result<PathBuf> {
    match &self.data_dir {
      Some(dir) => Ok(dir.clone()),
      None => Database::default_data_dir(),
    }
  }
}
