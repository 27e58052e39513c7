//! Strategy executor: cache-first, network-first, stale-while-revalidate and
//! navigation handling, plus offline fallback synthesis.
//!
//! Every strategy returns a `Response`. Network and cache failures are absorbed
//! here and turned into a cached entry or a synthesized offline response.

use color_eyre::{eyre::eyre, Result};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info};
use url::Url;

use crate::cache::{NamespaceManager, Role};
use crate::http::{Network, Request, Response, ResponseSource};
use crate::router::{Route, Strategy};

/// Runs caching strategies against a namespace manager and a network.
pub struct Executor<N> {
  cache: Arc<NamespaceManager>,
  network: Arc<N>,
  /// Bound on network-first fetches
  network_timeout: Option<Duration>,
  /// Cached document served to navigations while offline
  offline_page: Option<Url>,
  /// Background cache refreshes still in flight
  revalidations: Mutex<Vec<JoinHandle<Option<Response>>>>,
}

impl<N: Network + 'static> Executor<N> {
  pub fn new(cache: Arc<NamespaceManager>, network: Arc<N>) -> Self {
    Self {
      cache,
      network,
      network_timeout: None,
      offline_page: None,
      revalidations: Mutex::new(Vec::new()),
    }
  }

  pub fn with_network_timeout(mut self, timeout: Option<Duration>) -> Self {
    self.network_timeout = timeout;
    self
  }

  pub fn with_offline_page(mut self, url: Option<Url>) -> Self {
    self.offline_page = url;
    self
  }

  pub fn cache(&self) -> &Arc<NamespaceManager> {
    &self.cache
  }

  pub fn network(&self) -> &Arc<N> {
    &self.network
  }

  pub async fn execute(&self, route: Route, request: &Request) -> Response {
    match route.strategy {
      Strategy::CacheFirst => self.cache_first(request, route.role).await,
      Strategy::NetworkFirst => self.network_first(request, route.role).await,
      Strategy::StaleWhileRevalidate => self.stale_while_revalidate(request, route.role).await,
      Strategy::Navigation => self.navigate(request, route.role).await,
    }
  }

  /// Serve from cache when present; otherwise fetch and populate.
  pub async fn cache_first(&self, request: &Request, role: Role) -> Response {
    if let Some(cached) = self.cache.match_request(role, request) {
      debug!(url = %request.url, %role, "cache hit");
      return cached;
    }

    match fetch_and_store(&self.cache, self.network.as_ref(), request, role).await {
      Ok(response) => response,
      Err(e) => {
        debug!(url = %request.url, error = %e, "cache miss and network failed");
        self.offline_fallback(request, role)
      }
    }
  }

  /// Prefer the network, bounded by the configured timeout; fall back to cache.
  pub async fn network_first(&self, request: &Request, role: Role) -> Response {
    let fetch = fetch_and_store(&self.cache, self.network.as_ref(), request, role);
    let fetched = match self.network_timeout {
      Some(limit) => match tokio::time::timeout(limit, fetch).await {
        Ok(result) => result,
        Err(_) => Err(eyre!("Network timeout after {:?}", limit)),
      },
      None => fetch.await,
    };

    match fetched {
      Ok(response) => response,
      Err(e) => {
        debug!(url = %request.url, error = %e, "network failed, trying cache");
        self
          .cache
          .match_request(role, request)
          .unwrap_or_else(|| self.offline_fallback(request, role))
      }
    }
  }

  /// Serve the cached entry immediately and refresh it in the background.
  ///
  /// The refresh runs as its own task: dropping the returned future does not
  /// cancel it. Without a cached entry the caller waits for that same task.
  pub async fn stale_while_revalidate(&self, request: &Request, role: Role) -> Response {
    let cached = self.cache.match_request(role, request);
    let refresh = self.spawn_refresh(request.clone(), role);

    if let Some(cached) = cached {
      debug!(url = %request.url, %role, "serving stale entry, revalidating");
      self.track(refresh);
      return cached;
    }

    match refresh.await {
      Ok(Some(response)) => response,
      _ => self.offline_fallback(request, role),
    }
  }

  /// Full page loads: network, then any cached copy of the page, then the offline document.
  pub async fn navigate(&self, request: &Request, role: Role) -> Response {
    match fetch_and_store(&self.cache, self.network.as_ref(), request, role).await {
      Ok(response) => response,
      Err(e) => {
        debug!(url = %request.url, error = %e, "navigation failed, trying cache");
        self
          .cache
          .match_any(request)
          .unwrap_or_else(|| self.offline_document())
      }
    }
  }

  /// Wait for every background refresh started so far.
  pub async fn settle(&self) {
    let pending = match self.revalidations.lock() {
      Ok(mut handles) => std::mem::take(&mut *handles),
      Err(_) => return,
    };

    for handle in pending {
      let _ = handle.await;
    }
  }

  /// Synthesized response for a request nothing could answer.
  pub fn offline_fallback(&self, request: &Request, role: Role) -> Response {
    info!(url = %request.url, %role, "serving offline fallback");
    if role == Role::Api {
      offline_json()
    } else if request.is_navigation() {
      self.offline_document()
    } else {
      offline_text()
    }
  }

  fn offline_document(&self) -> Response {
    self
      .offline_page
      .as_ref()
      .and_then(|url| self.cache.match_any(&Request::get(url.clone())))
      .map(|page| page.with_source(ResponseSource::Offline))
      .unwrap_or_else(offline_text)
  }

  fn spawn_refresh(&self, request: Request, role: Role) -> JoinHandle<Option<Response>> {
    let cache = Arc::clone(&self.cache);
    let network = Arc::clone(&self.network);

    tokio::spawn(async move {
      match fetch_and_store(&cache, network.as_ref(), &request, role).await {
        Ok(response) => {
          debug!(url = %request.url, status = response.status, "revalidated");
          Some(response)
        }
        Err(e) => {
          debug!(url = %request.url, error = %e, "revalidation failed");
          None
        }
      }
    })
  }

  fn track(&self, handle: JoinHandle<Option<Response>>) {
    if let Ok(mut handles) = self.revalidations.lock() {
      handles.retain(|h| !h.is_finished());
      handles.push(handle);
    }
  }
}

/// Fetch `request` and store a copy of a successful response.
async fn fetch_and_store<N: Network>(
  cache: &NamespaceManager,
  network: &N,
  request: &Request,
  role: Role,
) -> Result<Response> {
  let response = network.fetch(request).await?;
  cache.put(role, request, &response);
  Ok(response)
}

fn offline_json() -> Response {
  let body = serde_json::json!({ "error": "offline", "offline": true }).to_string();
  Response::new(503, body)
    .with_header("content-type", "application/json")
    .with_source(ResponseSource::Offline)
}

fn offline_text() -> Response {
  Response::new(503, "Offline")
    .with_header("content-type", "text/plain")
    .with_source(ResponseSource::Offline)
}
