use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub directory: DirectoryConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub sync: SyncConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DirectoryConfig {
  /// Hosted domain whose groups we sync (e.g. "example.com")
  pub domain: String,
  /// Base URL of the directory API
  #[serde(default = "default_api_base")]
  pub api_base: String,
}

fn default_api_base() -> String {
  "https://www.googleapis.com/admin/directory/v1".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
  /// Number of concurrent refresh/fan-out workers
  #[serde(default = "default_pool_size")]
  pub pool_size: usize,
  /// Whether lookups may return a stale-but-present value instead of
  /// waiting for the in-flight refresh
  #[serde(default = "default_allow_stale")]
  pub allow_stale: bool,
  /// Base time-to-live for cache entries, in seconds
  #[serde(default = "default_ttl_secs")]
  pub ttl_secs: u64,
  /// Random jitter added on top of the TTL, in seconds, so entries
  /// don't all expire at once
  #[serde(default = "default_jitter_secs")]
  pub jitter_secs: u64,
  /// Override for the cache database location
  pub db_path: Option<PathBuf>,
}

fn default_pool_size() -> usize {
  10
}

fn default_allow_stale() -> bool {
  true
}

fn default_ttl_secs() -> u64 {
  3600
}

fn default_jitter_secs() -> u64 {
  60
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      pool_size: default_pool_size(),
      allow_stale: default_allow_stale(),
      ttl_secs: default_ttl_secs(),
      jitter_secs: default_jitter_secs(),
      db_path: None,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
  /// Seconds between background refreshes of the full group directory
  #[serde(default = "default_interval_secs")]
  pub interval_secs: u64,
}

fn default_interval_secs() -> u64 {
  600
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      interval_secs: default_interval_secs(),
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./memberd.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/memberd/config.yaml
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
        "No configuration file found. Create one at ~/.config/memberd/config.yaml\n\
                 See config.example.yaml for the format."
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("memberd.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("memberd").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    let config: Config = serde_yaml::from_str(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))?;

    Ok(config)
  }

  /// Get the directory API token from environment variables.
  ///
  /// Checks MEMBERD_API_TOKEN first, then DIRECTORY_API_TOKEN as fallback.
  pub fn get_api_token() -> Result<String> {
    std::env::var("MEMBERD_API_TOKEN")
      .or_else(|_| std::env::var("DIRECTORY_API_TOKEN"))
      .map_err(|_| {
        eyre!(
          "Directory API token not found. Set MEMBERD_API_TOKEN or DIRECTORY_API_TOKEN environment variable."
        )
      })
  }

  /// Get the default data directory for databases and logs.
  pub fn data_dir() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("memberd"))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_defaults_from_minimal_config() {
    let config: Config = serde_yaml::from_str("directory:\n  domain: example.com\n").unwrap();

    assert_eq!(config.directory.domain, "example.com");
    assert_eq!(
      config.directory.api_base,
      "https://www.googleapis.com/admin/directory/v1"
    );
    assert_eq!(config.cache.pool_size, 10);
    assert!(config.cache.allow_stale);
    assert_eq!(config.cache.ttl_secs, 3600);
    assert_eq!(config.cache.jitter_secs, 60);
    assert_eq!(config.sync.interval_secs, 600);
  }

  #[test]
  fn test_overrides() {
    let config: Config = serde_yaml::from_str(
      "directory:\n  domain: example.com\ncache:\n  pool_size: 2\n  allow_stale: false\nsync:\n  interval_secs: 30\n",
    )
    .unwrap();

    assert_eq!(config.cache.pool_size, 2);
    assert!(!config.cache.allow_stale);
    assert_eq!(config.sync.interval_secs, 30);
  }
}
