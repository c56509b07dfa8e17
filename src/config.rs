use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::cache::{CacheVersion, EngineConfig};
use crate::lifecycle::Precache;
use crate::service::ServiceSettings;
use crate::sync::RetryPolicy;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  /// Origin that relative precache paths resolve against
  pub origin: Url,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub precache: PrecacheConfig,
  #[serde(default)]
  pub sync: SyncConfig,
  #[serde(default)]
  pub log: LogConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
  /// Prefix of the cache name reported to clients
  #[serde(default = "default_cache_name")]
  pub name: String,
  /// Version installed and activated on startup
  #[serde(default = "default_version")]
  pub version: String,
  /// Database file (defaults to $XDG_DATA_HOME/offsync/cache.db)
  pub database: Option<PathBuf>,
  #[serde(default = "default_network_timeout")]
  pub network_timeout_secs: u64,
  /// Page served to HTML navigations when offline and uncached
  pub offline_page: Option<String>,
  /// Request headers that split cache keys (case-insensitive)
  #[serde(default)]
  pub vary_headers: Vec<String>,
  #[serde(default = "default_true")]
  pub dedupe_inflight: bool,
  /// Activate a freshly installed version without waiting for skip-waiting
  #[serde(default = "default_true")]
  pub auto_activate: bool,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      name: default_cache_name(),
      version: default_version(),
      database: None,
      network_timeout_secs: default_network_timeout(),
      offline_page: None,
      vary_headers: Vec::new(),
      dedupe_inflight: true,
      auto_activate: true,
    }
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PrecacheConfig {
  /// Core files; failing to cache any of them fails the install
  #[serde(default)]
  pub required: Vec<String>,
  /// External resources cached on a best-effort basis
  #[serde(default)]
  pub optional: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
  /// Remote endpoint that accepts queued operations
  pub endpoint: Option<Url>,
  #[serde(default = "default_retry_base")]
  pub retry_base_secs: u64,
  #[serde(default = "default_retry_max")]
  pub retry_max_secs: u64,
  /// Drain all channels on this interval when set
  pub periodic_secs: Option<u64>,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      endpoint: None,
      retry_base_secs: default_retry_base(),
      retry_max_secs: default_retry_max(),
      periodic_secs: None,
    }
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LogConfig {
  /// Default filter when RUST_LOG is unset
  pub level: Option<String>,
  /// Write logs to this file instead of stderr
  pub file: Option<PathBuf>,
}

fn default_cache_name() -> String {
  "offsync".to_string()
}

fn default_version() -> String {
  "v1".to_string()
}

fn default_network_timeout() -> u64 {
  10
}

fn default_retry_base() -> u64 {
  5
}

fn default_retry_max() -> u64 {
  300
}

fn default_true() -> bool {
  true
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./offsync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/offsync/config.yaml
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
        "No configuration file found. Create one at ~/.config/offsync/config.yaml\n\
                 with at least an `origin` URL."
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("offsync.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("offsync").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn parse(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    // Surface bad precache entries at load time rather than at install.
    config.precache()?;
    Ok(config)
  }

  /// Get the sync endpoint bearer token from the environment, if set.
  pub fn get_sync_token() -> Option<String> {
    std::env::var("OFFSYNC_SYNC_TOKEN").ok()
  }

  pub fn version(&self) -> CacheVersion {
    CacheVersion::new(self.cache.version.clone())
  }

  pub fn database_path(&self) -> Option<&Path> {
    self.cache.database.as_deref()
  }

  pub fn network_timeout(&self) -> Duration {
    Duration::from_secs(self.cache.network_timeout_secs)
  }

  /// Resolve precache entries against the origin.
  pub fn precache(&self) -> Result<Precache> {
    Ok(Precache {
      required: self.resolve_all(&self.precache.required)?,
      optional: self.resolve_all(&self.precache.optional)?,
    })
  }

  /// Resolve a path or absolute URL against the origin.
  pub fn resolve(&self, entry: &str) -> Result<Url> {
    self
      .origin
      .join(entry)
      .map_err(|e| eyre!("Invalid URL '{}': {}", entry, e))
  }

  fn resolve_all(&self, entries: &[String]) -> Result<Vec<Url>> {
    entries.iter().map(|entry| self.resolve(entry)).collect()
  }

  pub fn engine_config(&self) -> Result<EngineConfig> {
    let offline_page = self
      .cache
      .offline_page
      .as_deref()
      .map(|page| self.resolve(page))
      .transpose()?;

    Ok(EngineConfig {
      network_timeout: self.network_timeout(),
      vary_headers: self.cache.vary_headers.clone(),
      offline_page,
      dedupe_inflight: self.cache.dedupe_inflight,
    })
  }

  pub fn retry_policy(&self) -> RetryPolicy {
    RetryPolicy {
      base: Duration::from_secs(self.sync.retry_base_secs),
      max: Duration::from_secs(self.sync.retry_max_secs),
      periodic: self.sync.periodic_secs.map(Duration::from_secs),
    }
  }

  pub fn service_settings(&self) -> Result<ServiceSettings> {
    Ok(ServiceSettings {
      cache_name: self.cache.name.clone(),
      version: self.version(),
      precache: self.precache()?,
      engine: self.engine_config()?,
      retry: self.retry_policy(),
      auto_activate: self.cache.auto_activate,
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  const FULL: &str = r#"
origin: https://app.example/
cache:
  name: notes
  version: "2024-06-01"
  offline_page: /offline.html
  vary_headers: [Accept-Language]
precache:
  required: ["/", "/index.html"]
  optional: ["https://cdn.example/lib.js"]
sync:
  endpoint: https://api.example/sync
  retry_base_secs: 2
  periodic_secs: 60
log:
  level: debug
"#;

  #[test]
  fn test_minimal_config_uses_defaults() {
    let config = Config::parse("origin: https://app.example/").unwrap();

    assert_eq!(config.cache.name, "offsync");
    assert_eq!(config.version(), CacheVersion::from("v1"));
    assert_eq!(config.network_timeout(), Duration::from_secs(10));
    assert!(config.cache.dedupe_inflight);
    assert!(config.sync.endpoint.is_none());
    assert_eq!(config.retry_policy(), RetryPolicy::default());
  }

  #[test]
  fn test_precache_resolves_against_origin() {
    let config = Config::parse(FULL).unwrap();
    let precache = config.precache().unwrap();

    assert_eq!(
      precache.required,
      vec![
        Url::parse("https://app.example/").unwrap(),
        Url::parse("https://app.example/index.html").unwrap(),
      ]
    );
    assert_eq!(
      precache.optional,
      vec![Url::parse("https://cdn.example/lib.js").unwrap()]
    );
  }

  #[test]
  fn test_cache_name_and_engine_config() {
    let config = Config::parse(FULL).unwrap();

    assert_eq!(config.version().cache_name(&config.cache.name), "notes-2024-06-01");
    let engine = config.engine_config().unwrap();
    assert_eq!(
      engine.offline_page,
      Some(Url::parse("https://app.example/offline.html").unwrap())
    );
    assert_eq!(engine.vary_headers, vec!["Accept-Language".to_string()]);
    assert_eq!(
      config.retry_policy().periodic,
      Some(Duration::from_secs(60))
    );
  }

  #[test]
  fn test_missing_origin_is_an_error() {
    assert!(Config::parse("cache:\n  name: x\n").is_err());
  }

  #[test]
  fn test_explicit_missing_path_is_an_error() {
    let err = Config::load(Some(Path::new("/nonexistent/offsync.yaml"))).unwrap_err();
    assert!(err.to_string().contains("Config file not found"));
  }

  #[test]
  fn test_load_from_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("offsync.yaml");
    std::fs::write(&path, FULL).unwrap();

    let config = Config::load(Some(&path)).unwrap();
    assert_eq!(config.log.level.as_deref(), Some("debug"));
  }

  #[test]
  fn test_service_settings() {
    let config = Config::parse("origin: https://app.example/\ncache:\n  auto_activate: false\n").unwrap();
    let settings = config.service_settings().unwrap();

    assert_eq!(settings.cache_name, "offsync");
    assert_eq!(settings.version, CacheVersion::from("v1"));
    assert!(settings.precache.required.is_empty());
    assert!(!settings.auto_activate);
  }
}
