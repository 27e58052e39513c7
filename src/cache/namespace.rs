//! Namespace manager: versioned cache partitions on top of a storage backend.

use chrono::{Duration, Utc};
use color_eyre::Result;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

use super::names::{CacheNames, Role};
use super::storage::{CacheStorage, CachedEntry};
use crate::http::{Request, Response, ResponseSource};

/// Stored alongside precached entries; never returned to the page.
pub const REVISION_HEADER: &str = "x-precache-revision";

/// Expiration settings for one role's namespace.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RoleLimits {
  /// Keep at most this many entries; the oldest are evicted first
  pub max_entries: Option<usize>,
  /// Entries older than this are treated as missing
  pub max_age: Option<Duration>,
}

/// Handle to an opened namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamespaceHandle {
  pub role: Role,
  pub name: String,
}

/// A namespace and how many entries it holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamespaceInfo {
  pub name: String,
  pub entries: usize,
  pub current: bool,
}

/// Owns the named, versioned cache partitions.
///
/// Storage failures never escape lookups or writes: they are logged and the
/// caller sees a miss, so a broken cache degrades to network-only behavior.
pub struct NamespaceManager {
  storage: Box<dyn CacheStorage>,
  names: CacheNames,
  limits: BTreeMap<Role, RoleLimits>,
}

impl NamespaceManager {
  pub fn new(storage: Box<dyn CacheStorage>, names: CacheNames) -> Self {
    Self {
      storage,
      names,
      limits: BTreeMap::new(),
    }
  }

  pub fn with_limits(mut self, limits: BTreeMap<Role, RoleLimits>) -> Self {
    self.limits = limits;
    self
  }

  pub fn names(&self) -> &CacheNames {
    &self.names
  }

  /// Open the current namespace for `role`, creating it if absent.
  pub fn open(&self, role: Role) -> Result<NamespaceHandle> {
    let name = self.names.name(role).to_string();
    self.storage.open(&name)?;
    Ok(NamespaceHandle { role, name })
  }

  /// Look up `request` in the current namespace for `role`.
  pub fn match_request(&self, role: Role, request: &Request) -> Option<Response> {
    let entry = self.lookup(role, request)?;
    let headers = entry
      .headers
      .into_iter()
      .filter(|(name, _)| !name.eq_ignore_ascii_case(REVISION_HEADER))
      .collect();

    Some(Response {
      status: entry.status,
      headers,
      body: entry.body,
      source: ResponseSource::Cache,
    })
  }

  /// Precache revision recorded with the cached copy of `request`, if any.
  pub fn revision(&self, role: Role, request: &Request) -> Option<String> {
    self
      .lookup(role, request)?
      .headers
      .into_iter()
      .find(|(name, _)| name.eq_ignore_ascii_case(REVISION_HEADER))
      .map(|(_, value)| value)
  }

  fn lookup(&self, role: Role, request: &Request) -> Option<CachedEntry> {
    let name = self.names.name(role);
    let key = cache_key(request);

    let entry = match self.storage.get(name, &key) {
      Ok(entry) => entry?,
      Err(e) => {
        warn!(namespace = name, url = %request.url, error = %e, "cache lookup failed");
        return None;
      }
    };

    if self.is_expired(role, &entry) {
      debug!(namespace = name, url = %entry.url, "cache entry expired");
      if let Err(e) = self.storage.remove(name, &key) {
        warn!(namespace = name, error = %e, "failed to remove expired entry");
      }
      return None;
    }

    Some(entry)
  }

  /// Look up `request` across every current namespace.
  pub fn match_any(&self, request: &Request) -> Option<Response> {
    Role::ALL
      .iter()
      .find_map(|role| self.match_request(*role, request))
  }

  /// Store a copy of `response` for `request`.
  ///
  /// Only GET requests with successful responses are written; anything else is
  /// silently skipped. Returns whether the entry was stored.
  pub fn put(&self, role: Role, request: &Request, response: &Response) -> bool {
    if request.method != reqwest::Method::GET || !response.is_success() {
      debug!(url = %request.url, status = response.status, "response not cacheable");
      return false;
    }

    let name = self.names.name(role);
    let entry = CachedEntry {
      key: cache_key(request),
      method: request.method.to_string(),
      url: request.cache_url(),
      status: response.status,
      headers: response.headers.clone(),
      body: response.body.clone(),
      cached_at: Utc::now(),
    };

    if let Err(e) = self.storage.put(name, &entry) {
      warn!(namespace = name, url = %entry.url, error = %e, "cache write failed");
      return false;
    }

    if let Some(max_entries) = self.limits(role).max_entries {
      match self.storage.trim(name, max_entries) {
        Ok(0) => {}
        Ok(evicted) => debug!(namespace = name, evicted, "evicted old entries"),
        Err(e) => warn!(namespace = name, error = %e, "failed to trim namespace"),
      }
    }

    true
  }

  /// Delete every namespace with this product's prefix that is not current in `current`.
  pub fn purge_stale(&self, current: &CacheNames) -> Result<Vec<String>> {
    let mut purged = Vec::new();
    for name in self.storage.namespaces()? {
      if current.is_owned(&name) && !current.is_current(&name) {
        self.storage.delete(&name)?;
        info!(namespace = %name, "deleted stale cache namespace");
        purged.push(name);
      }
    }
    Ok(purged)
  }

  /// Delete every namespace owned by this product, current ones included.
  pub fn clear_all(&self) -> Result<Vec<String>> {
    let mut cleared = Vec::new();
    for name in self.storage.namespaces()? {
      if self.names.is_owned(&name) {
        self.storage.delete(&name)?;
        cleared.push(name);
      }
    }
    info!(count = cleared.len(), "cleared cache namespaces");
    Ok(cleared)
  }

  /// List existing namespaces with entry counts.
  pub fn list(&self) -> Result<Vec<NamespaceInfo>> {
    self
      .storage
      .namespaces()?
      .into_iter()
      .map(|name| {
        let entries = self.storage.count(&name)?;
        let current = self.names.is_current(&name);
        Ok(NamespaceInfo {
          name,
          entries,
          current,
        })
      })
      .collect()
  }

  fn limits(&self, role: Role) -> RoleLimits {
    self.limits.get(&role).copied().unwrap_or_default()
  }

  fn is_expired(&self, role: Role, entry: &CachedEntry) -> bool {
    match self.limits(role).max_age {
      Some(max_age) => Utc::now() - entry.cached_at > max_age,
      None => false,
    }
  }
}

/// Stable, fixed-length key for a request: SHA-256 of method and URL.
fn cache_key(request: &Request) -> String {
  let mut hasher = Sha256::new();
  hasher.update(request.method.as_str().as_bytes());
  hasher.update(b" ");
  hasher.update(request.cache_url().as_bytes());
  hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::SqliteStorage;
  use url::Url;

  fn names(version: &str) -> CacheNames {
    CacheNames::new("app", version, &BTreeMap::new())
  }

  fn manager(version: &str) -> NamespaceManager {
    let storage = SqliteStorage::open_in_memory().unwrap();
    NamespaceManager::new(Box::new(storage), names(version))
  }

  fn request(path: &str) -> Request {
    Request::get(Url::parse("https://app.test").unwrap().join(path).unwrap())
  }

  #[test]
  fn test_put_then_match() {
    let cache = manager("v1");
    let response = Response::new(200, "body").with_header("content-type", "text/css");

    assert!(cache.put(Role::Static, &request("/a.css"), &response));

    let hit = cache.match_request(Role::Static, &request("/a.css")).unwrap();
    assert_eq!(hit.status, 200);
    assert_eq!(hit.body, b"body");
    assert_eq!(hit.header("content-type"), Some("text/css"));
    assert_eq!(hit.source, ResponseSource::Cache);

    // Only the role's own namespace is consulted
    assert!(cache.match_request(Role::Image, &request("/a.css")).is_none());
    assert!(cache.match_any(&request("/a.css")).is_some());
  }

  #[test]
  fn test_put_leaves_response_untouched() {
    let cache = manager("v1");
    let response = Response::new(200, "body");
    cache.put(Role::Static, &request("/a.css"), &response);
    assert_eq!(response.body, b"body");
    assert_eq!(response.source, ResponseSource::Network);
  }

  #[test]
  fn test_uncacheable_responses_skipped() {
    let cache = manager("v1");
    assert!(!cache.put(Role::Api, &request("/api/x"), &Response::new(500, "err")));
    assert!(!cache.put(Role::Api, &request("/api/x"), &Response::new(404, "nope")));

    let post = request("/api/x").with_method(reqwest::Method::POST);
    assert!(!cache.put(Role::Api, &post, &Response::new(200, "ok")));
    assert!(cache.match_request(Role::Api, &request("/api/x")).is_none());
  }

  #[test]
  fn test_open_creates_namespace() {
    let cache = manager("v1");
    let handle = cache.open(Role::Font).unwrap();
    assert_eq!(handle.name, "app-font-v1");
    assert_eq!(cache.open(Role::Font).unwrap(), handle);

    let listed = cache.list().unwrap();
    assert_eq!(listed.len(), 1);
    assert!(listed[0].current);
  }

  #[test]
  fn test_purge_stale_keeps_current_versions() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    for name in ["app-static-v1", "app-api-v1", "app-static-v2", "other-static-v1"] {
      storage.open(name).unwrap();
    }
    let cache = NamespaceManager::new(Box::new(storage), names("v2"));

    let mut purged = cache.purge_stale(&names("v2")).unwrap();
    purged.sort();
    assert_eq!(purged, vec!["app-api-v1", "app-static-v1"]);

    let remaining: Vec<String> = cache.list().unwrap().into_iter().map(|n| n.name).collect();
    assert_eq!(remaining, vec!["app-static-v2", "other-static-v1"]);
  }

  #[test]
  fn test_clear_all() {
    let cache = manager("v1");
    cache.put(Role::Static, &request("/a.css"), &Response::new(200, "a"));
    cache.put(Role::Api, &request("/api/x"), &Response::new(200, "x"));

    assert_eq!(cache.clear_all().unwrap().len(), 2);
    assert!(cache.match_any(&request("/a.css")).is_none());
    assert!(cache.match_any(&request("/api/x")).is_none());
  }

  #[test]
  fn test_max_entries_evicts_oldest() {
    let limits = BTreeMap::from([(
      Role::Image,
      RoleLimits {
        max_entries: Some(2),
        max_age: None,
      },
    )]);
    let cache = manager("v1").with_limits(limits);

    for path in ["/1.png", "/2.png", "/3.png"] {
      cache.put(Role::Image, &request(path), &Response::new(200, path));
    }

    assert!(cache.match_request(Role::Image, &request("/1.png")).is_none());
    assert!(cache.match_request(Role::Image, &request("/2.png")).is_some());
    assert!(cache.match_request(Role::Image, &request("/3.png")).is_some());
  }

  #[test]
  fn test_max_age_expires_entries() {
    let limits = BTreeMap::from([(
      Role::Api,
      RoleLimits {
        max_entries: None,
        max_age: Some(Duration::seconds(-1)),
      },
    )]);
    let cache = manager("v1").with_limits(limits);
    cache.put(Role::Api, &request("/api/x"), &Response::new(200, "x"));

    assert!(cache.match_request(Role::Api, &request("/api/x")).is_none());
  }

  #[test]
  fn test_key_depends_on_method_and_url() {
    let get = request("/a");
    let head = request("/a").with_method(reqwest::Method::HEAD);
    assert_ne!(cache_key(&get), cache_key(&head));
    assert_eq!(cache_key(&get), cache_key(&request("/a#frag")));
    assert_eq!(cache_key(&get).len(), 64);
  }
}
