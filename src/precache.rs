//! Install-time precaching of the build manifest.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use sha2::{Digest, Sha256, Sha384, Sha512};
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::{NamespaceManager, Role, REVISION_HEADER};
use crate::http::{Network, Request};

/// One asset of the precache manifest.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct PrecacheEntry {
  /// URL or path relative to the origin
  pub url: String,
  /// Build revision; an already cached asset with the same revision is not refetched
  #[serde(default)]
  pub revision: Option<String>,
  /// Subresource integrity string, e.g. `sha256-<base64 digest>`
  #[serde(default)]
  pub integrity: Option<String>,
}

/// Outcome of an install-time precache pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrecacheReport {
  pub cached: Vec<String>,
  /// Assets already present at the same revision
  pub skipped: Vec<String>,
  /// Failed assets with the reason
  pub failed: Vec<(String, String)>,
}

/// Fetch every manifest entry into the static namespace.
///
/// Entries are fetched concurrently. A failing entry is logged and recorded in
/// the report; it never aborts the others.
pub async fn precache<N: Network>(
  cache: &NamespaceManager,
  network: &N,
  origin: &Url,
  entries: &[PrecacheEntry],
) -> PrecacheReport {
  let outcomes = futures::future::join_all(
    entries
      .iter()
      .map(|entry| precache_one(cache, network, origin, entry)),
  )
  .await;

  let mut report = PrecacheReport::default();
  for (entry, outcome) in entries.iter().zip(outcomes) {
    match outcome {
      Ok(true) => report.cached.push(entry.url.clone()),
      Ok(false) => report.skipped.push(entry.url.clone()),
      Err(e) => {
        warn!(url = %entry.url, error = %e, "failed to precache asset");
        report.failed.push((entry.url.clone(), e.to_string()));
      }
    }
  }

  info!(
    cached = report.cached.len(),
    skipped = report.skipped.len(),
    failed = report.failed.len(),
    "precache finished"
  );
  report
}

/// Returns `Ok(false)` when the asset was already cached at this revision.
async fn precache_one<N: Network>(
  cache: &NamespaceManager,
  network: &N,
  origin: &Url,
  entry: &PrecacheEntry,
) -> Result<bool> {
  let url = origin
    .join(&entry.url)
    .map_err(|e| eyre!("Invalid precache URL {}: {}", entry.url, e))?;
  let request = Request::get(url);

  if let Some(revision) = &entry.revision {
    if cache.revision(Role::Static, &request).as_deref() == Some(revision.as_str()) {
      debug!(url = %entry.url, revision, "precached asset up to date");
      return Ok(false);
    }
  }

  let mut response = network.fetch(&request).await?;
  if !response.is_success() {
    return Err(eyre!("Unexpected status {}", response.status));
  }

  if let Some(integrity) = &entry.integrity {
    verify_integrity(&response.body, integrity)?;
  }

  if let Some(revision) = &entry.revision {
    response = response.with_header(REVISION_HEADER, revision);
  }

  if !cache.put(Role::Static, &request, &response) {
    return Err(eyre!("Cache write failed"));
  }
  Ok(true)
}

/// Check `body` against a subresource integrity string.
///
/// Several space-separated hashes may be given; matching any one of them passes.
pub fn verify_integrity(body: &[u8], integrity: &str) -> Result<()> {
  let mut supported = false;

  for token in integrity.split_whitespace() {
    let Some((algorithm, expected)) = token.split_once('-') else {
      continue;
    };
    let digest = match algorithm {
      "sha256" => Sha256::digest(body).to_vec(),
      "sha384" => Sha384::digest(body).to_vec(),
      "sha512" => Sha512::digest(body).to_vec(),
      _ => continue,
    };
    supported = true;

    // Options such as `?ct=...` may follow the digest
    let expected = expected.split('?').next().unwrap_or_default();
    if STANDARD.encode(&digest) == expected {
      return Ok(());
    }
  }

  if supported {
    Err(eyre!("Integrity mismatch"))
  } else {
    Err(eyre!("No supported hash in integrity '{}'", integrity))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{CacheNames, SqliteStorage};
  use crate::http::Response;
  use crate::testing::MockNetwork;
  use std::collections::BTreeMap;

  fn manager() -> NamespaceManager {
    let storage = SqliteStorage::open_in_memory().unwrap();
    NamespaceManager::new(
      Box::new(storage),
      CacheNames::new("app", "v1", &BTreeMap::new()),
    )
  }

  fn origin() -> Url {
    Url::parse("https://app.test").unwrap()
  }

  fn entry(url: &str) -> PrecacheEntry {
    PrecacheEntry {
      url: url.to_string(),
      revision: None,
      integrity: None,
    }
  }

  fn sri(body: &[u8]) -> String {
    format!("sha256-{}", STANDARD.encode(Sha256::digest(body)))
  }

  #[test]
  fn test_verify_integrity() {
    assert!(verify_integrity(b"hello", &sri(b"hello")).is_ok());
    assert!(verify_integrity(b"hello", &sri(b"other")).is_err());
    assert!(verify_integrity(b"hello", &format!("{} {}", sri(b"x"), sri(b"hello"))).is_ok());
    assert!(verify_integrity(b"hello", "md5-abc").is_err());
  }

  #[tokio::test]
  async fn test_partial_failure_does_not_abort() {
    let cache = manager();
    let network = MockNetwork::new();
    network.respond("https://app.test/index.html", Response::new(200, "<html>"));
    network.respond("https://app.test/app.js", Response::new(200, "js"));
    network.respond("https://app.test/gone.css", Response::new(404, ""));

    let entries = [entry("/index.html"), entry("/gone.css"), entry("/app.js"), entry("/missing.png")];
    let report = precache(&cache, &network, &origin(), &entries).await;

    assert_eq!(report.cached, vec!["/index.html", "/app.js"]);
    assert_eq!(report.failed.len(), 2);

    let index = Request::get(origin().join("/index.html").unwrap());
    assert_eq!(cache.match_request(Role::Static, &index).unwrap().body, b"<html>");
  }

  #[tokio::test]
  async fn test_integrity_mismatch_is_failure() {
    let cache = manager();
    let network = MockNetwork::new();
    network.respond("https://app.test/app.js", Response::new(200, "tampered"));

    let entries = [PrecacheEntry {
      integrity: Some(sri(b"original")),
      ..entry("/app.js")
    }];
    let report = precache(&cache, &network, &origin(), &entries).await;

    assert!(report.cached.is_empty());
    assert_eq!(report.failed[0].0, "/app.js");
    assert!(cache
      .match_request(Role::Static, &Request::get(origin().join("/app.js").unwrap()))
      .is_none());
  }

  #[tokio::test]
  async fn test_same_revision_skipped() {
    let cache = manager();
    let network = MockNetwork::new();
    network.respond("https://app.test/app.js", Response::new(200, "js"));

    let entries = [PrecacheEntry {
      revision: Some("r1".to_string()),
      ..entry("/app.js")
    }];
    let first = precache(&cache, &network, &origin(), &entries).await;
    let second = precache(&cache, &network, &origin(), &entries).await;

    assert_eq!(first.cached, vec!["/app.js"]);
    assert_eq!(second.skipped, vec!["/app.js"]);
    assert_eq!(network.calls(), 1);
  }

  #[tokio::test]
  async fn test_revision_not_visible_to_page() {
    let cache = manager();
    let network = MockNetwork::new();
    network.respond(
      "https://app.test/app.js",
      Response::new(200, "js").with_header("content-type", "text/javascript"),
    );

    let entries = [PrecacheEntry {
      revision: Some("r1".to_string()),
      ..entry("/app.js")
    }];
    precache(&cache, &network, &origin(), &entries).await;

    let request = Request::get(origin().join("/app.js").unwrap());
    let hit = cache.match_request(Role::Static, &request).unwrap();
    assert_eq!(hit.header(REVISION_HEADER), None);
    assert_eq!(hit.header("content-type"), Some("text/javascript"));
    assert_eq!(cache.revision(Role::Static, &request).as_deref(), Some("r1"));
  }
}
