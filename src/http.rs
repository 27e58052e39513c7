//! Request and response model shared by the classifier, the strategies and the cache.

use color_eyre::Result;
use reqwest::Method;
use std::future::Future;
use url::Url;

/// How the page issued the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequestMode {
  /// Full page load
  Navigate,
  #[default]
  SameOrigin,
  Cors,
  NoCors,
}

/// A request intercepted from the page.
#[derive(Debug, Clone)]
pub struct Request {
  pub method: Method,
  pub url: Url,
  pub mode: RequestMode,
}

impl Request {
  pub fn get(url: Url) -> Self {
    Self {
      method: Method::GET,
      url,
      mode: RequestMode::SameOrigin,
    }
  }

  pub fn navigate(url: Url) -> Self {
    Self {
      mode: RequestMode::Navigate,
      ..Self::get(url)
    }
  }

  pub fn with_method(mut self, method: Method) -> Self {
    self.method = method;
    self
  }

  pub fn is_navigation(&self) -> bool {
    self.mode == RequestMode::Navigate
  }

  /// URL used as cache identity. Fragments never reach the server, so they are dropped.
  pub fn cache_url(&self) -> String {
    let mut url = self.url.clone();
    url.set_fragment(None);
    url.to_string()
  }
}

/// Where a response handed back to the page came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
  /// Live network response
  Network,
  /// Served from a cache namespace
  Cache,
  /// Synthesized because neither network nor cache could answer
  Offline,
}

/// A response snapshot.
///
/// Bodies are fully buffered, so storing a copy in the cache is a plain `clone()`
/// and never consumes what the page receives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
  pub status: u16,
  pub headers: Vec<(String, String)>,
  pub body: Vec<u8>,
  pub source: ResponseSource,
}

impl Response {
  pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
    Self {
      status,
      headers: Vec::new(),
      body: body.into(),
      source: ResponseSource::Network,
    }
  }

  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self.headers.push((name.to_string(), value.to_string()));
    self
  }

  pub fn with_source(mut self, source: ResponseSource) -> Self {
    self.source = source;
    self
  }

  /// 2xx status.
  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }

  /// Case-insensitive header lookup.
  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .iter()
      .find(|(n, _)| n.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }
}

/// The network seam: everything the strategies need from a real fetch.
pub trait Network: Send + Sync {
  /// Perform the request. Any `Err` is a network failure (offline, DNS, refused).
  /// HTTP error statuses are `Ok` responses.
  fn fetch(&self, request: &Request) -> impl Future<Output = Result<Response>> + Send;
}
