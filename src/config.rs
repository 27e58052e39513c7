use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::cache::{CacheNames, Role, RoleLimits, SqliteStorage};
use crate::precache::PrecacheEntry;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
  /// Origin of the hosted app; only requests to this origin are intercepted
  pub origin: Url,
  /// Product prefix shared by every cache namespace name
  pub cache_prefix: String,
  /// Build version tag for all namespaces
  pub version: String,
  /// Per-role version overrides
  pub versions: BTreeMap<Role, String>,
  /// Path prefix of data requests
  pub api_prefix: String,
  /// Path segment holding icon assets
  pub icon_path: String,
  /// Cross-origin hosts whose responses go to the font namespace
  pub font_hosts: Vec<String>,
  /// Bound on network-first fetches; `null` waits indefinitely
  pub network_timeout_secs: Option<u64>,
  /// Offline document served to navigations when the network is down
  pub offline_page: Option<String>,
  /// Per-role expiration limits (unbounded when absent)
  pub limits: BTreeMap<Role, LimitsConfig>,
  /// Assets cached during install
  pub precache: Vec<PrecacheEntry>,
  /// JSON manifest with more precache entries, generated at build time
  pub precache_manifest: Option<PathBuf>,
  /// Background sync tags and the resource each one refetches
  pub sync: Vec<SyncTask>,
  /// Cache database location (default: $XDG_DATA_HOME/expense-sw/cache.db)
  pub database: Option<PathBuf>,
  /// Also write logs to this file
  pub log_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
pub struct LimitsConfig {
  pub max_entries: Option<usize>,
  pub max_age_secs: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct SyncTask {
  pub tag: String,
  /// Path relative to the origin
  pub path: String,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      origin: Url::parse("http://localhost:5173").expect("static URL is valid"),
      cache_prefix: "expense-tracker".to_string(),
      version: "v1".to_string(),
      versions: BTreeMap::new(),
      api_prefix: "/api/".to_string(),
      icon_path: "/icons/".to_string(),
      font_hosts: Vec::new(),
      network_timeout_secs: Some(10),
      offline_page: Some("/offline.html".to_string()),
      limits: BTreeMap::new(),
      precache: Vec::new(),
      precache_manifest: None,
      sync: vec![SyncTask {
        tag: "sync-expenses".to_string(),
        path: "/api/expenses".to_string(),
      }],
      database: None,
      log_file: None,
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./expense-sw.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/expense-sw/config.yaml
  ///
  /// Built-in defaults apply when no file is found.
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
    let local = PathBuf::from("expense-sw.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("expense-sw").join("config.yaml");
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
    config.role_limits()?;
    Ok(config)
  }

  /// Role → current cache name mapping for this build.
  pub fn cache_names(&self) -> CacheNames {
    CacheNames::new(&self.cache_prefix, &self.version, &self.versions)
  }

  /// Per-role limits, rejecting values no namespace can honor.
  pub fn role_limits(&self) -> Result<BTreeMap<Role, RoleLimits>> {
    self
      .limits
      .iter()
      .map(|(role, limits)| {
        if limits.max_entries == Some(0) {
          return Err(eyre!("limits.{}.max_entries must be at least 1", role));
        }

        let max_age = limits
          .max_age_secs
          .map(|secs| {
            i64::try_from(secs)
              .ok()
              .and_then(chrono::Duration::try_seconds)
              .ok_or_else(|| eyre!("limits.{}.max_age_secs is out of range: {}", role, secs))
          })
          .transpose()?;

        Ok((
          *role,
          RoleLimits {
            max_entries: limits.max_entries,
            max_age,
          },
        ))
      })
      .collect()
  }

  pub fn network_timeout(&self) -> Option<Duration> {
    self.network_timeout_secs.map(Duration::from_secs)
  }

  /// Resolve a path against the origin.
  pub fn resolve(&self, path: &str) -> Result<Url> {
    self
      .origin
      .join(path)
      .map_err(|e| eyre!("Invalid path {}: {}", path, e))
  }

  pub fn offline_page_url(&self) -> Result<Option<Url>> {
    self.offline_page.as_deref().map(|p| self.resolve(p)).transpose()
  }

  pub fn database_path(&self) -> Result<PathBuf> {
    match &self.database {
      Some(path) => Ok(path.clone()),
      None => SqliteStorage::default_path(),
    }
  }

  /// Inline precache entries followed by those of the manifest file, if any.
  pub fn precache_entries(&self) -> Result<Vec<PrecacheEntry>> {
    let mut entries = self.precache.clone();

    if let Some(path) = &self.precache_manifest {
      let contents = std::fs::read_to_string(path)
        .map_err(|e| eyre!("Failed to read precache manifest {}: {}", path.display(), e))?;
      let manifest: Vec<PrecacheEntry> = serde_json::from_str(&contents)
        .map_err(|e| eyre!("Failed to parse precache manifest {}: {}", path.display(), e))?;
      entries.extend(manifest);
    }

    Ok(entries)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_defaults_without_file() {
    let config = Config::from_yaml("{}").unwrap();
    assert_eq!(config.cache_prefix, "expense-tracker");
    assert_eq!(config.network_timeout(), Some(Duration::from_secs(10)));
    assert_eq!(config.sync[0].tag, "sync-expenses");
    assert_eq!(config.cache_names().name(Role::Api), "expense-tracker-api-v1");
  }

  #[test]
  fn test_parse_full_config() {
    let yaml = r#"
origin: https://expenses.example.com
cache_prefix: app
version: v3
versions:
  api: v4
font_hosts: [fonts.gstatic.com]
network_timeout_secs: null
limits:
  image:
    max_entries: 60
    max_age_secs: 2592000
precache:
  - url: /index.html
    revision: abc
sync:
  - tag: sync-budgets
    path: /api/budgets
"#;
    let config = Config::from_yaml(yaml).unwrap();
    assert_eq!(config.origin.as_str(), "https://expenses.example.com/");
    assert_eq!(config.network_timeout(), None);
    assert_eq!(config.cache_names().name(Role::Api), "app-api-v4");
    assert_eq!(config.cache_names().name(Role::Static), "app-static-v3");
    assert_eq!(config.precache[0].revision.as_deref(), Some("abc"));
    assert_eq!(config.sync.len(), 1);

    let limits = config.role_limits().unwrap();
    assert_eq!(limits[&Role::Image].max_entries, Some(60));
    assert_eq!(
      limits[&Role::Image].max_age,
      Some(chrono::Duration::days(30))
    );
  }

  #[test]
  fn test_out_of_range_limits_rejected() {
    let err = Config::from_yaml("limits:\n  api:\n    max_age_secs: 10000000000000000\n")
      .unwrap_err();
    assert!(err.to_string().contains("max_age_secs"));

    assert!(Config::from_yaml("limits:\n  api:\n    max_age_secs: 18446744073709551615\n").is_err());

    let err = Config::from_yaml("limits:\n  image:\n    max_entries: 0\n").unwrap_err();
    assert!(err.to_string().contains("max_entries"));
  }

  #[test]
  fn test_unknown_role_rejected() {
    assert!(Config::from_yaml("versions:\n  videos: v2\n").is_err());
  }

  #[test]
  fn test_resolve_against_origin() {
    let config = Config::default();
    assert_eq!(
      config.offline_page_url().unwrap().unwrap().as_str(),
      "http://localhost:5173/offline.html"
    );
  }

  #[test]
  fn test_missing_explicit_file_errors() {
    assert!(Config::load(Some(Path::new("/nonexistent/expense-sw.yaml"))).is_err());
  }
}
