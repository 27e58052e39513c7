//! Request classification: which strategy and namespace answer a request.
//!
//! Classification is purely syntactic. It looks at the method, the origin, the
//! path and the request mode, never at anything the server would say.

use reqwest::Method;
use url::{Origin, Url};

use crate::cache::Role;
use crate::config::Config;
use crate::http::Request;

const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "svg", "gif", "webp", "ico"];
const STATIC_EXTENSIONS: &[&str] = &["js", "css", "woff", "woff2", "ttf", "eot"];

/// Caching algorithm applied to a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
  CacheFirst,
  NetworkFirst,
  StaleWhileRevalidate,
  /// Network, then cached page, then offline document
  Navigation,
}

/// Strategy plus the namespace it reads and writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route {
  pub strategy: Strategy,
  pub role: Role,
}

impl Route {
  const fn new(strategy: Strategy, role: Role) -> Self {
    Self { strategy, role }
  }
}

/// Outcome of classifying a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
  /// Leave the request to normal browser handling
  Ignore,
  Handle(Route),
}

#[derive(Debug, Clone)]
enum Matcher {
  PathPrefix(String),
  Extensions(&'static [&'static str]),
  PathSegment(String),
  RootDocument,
  Navigation,
  Any,
}

impl Matcher {
  fn matches(&self, request: &Request) -> bool {
    let path = request.url.path();
    match self {
      Self::PathPrefix(prefix) => path.starts_with(prefix.as_str()),
      Self::Extensions(extensions) => {
        extension(&request.url).is_some_and(|ext| extensions.contains(&ext.as_str()))
      }
      Self::PathSegment(segment) => path.contains(segment.as_str()),
      Self::RootDocument => path == "/" || path == "/index.html",
      Self::Navigation => request.is_navigation(),
      Self::Any => true,
    }
  }
}

/// An ordered predicate → route binding.
#[derive(Debug, Clone)]
struct RoutingRule {
  name: &'static str,
  matchers: Vec<Matcher>,
  route: Route,
}

impl RoutingRule {
  fn matches(&self, request: &Request) -> bool {
    self.matchers.iter().any(|m| m.matches(request))
  }
}

/// Maps requests to routes. Rules are fixed at construction and evaluated in order;
/// the first match wins.
#[derive(Debug, Clone)]
pub struct Router {
  origin: Origin,
  font_hosts: Vec<String>,
  rules: Vec<RoutingRule>,
}

impl Router {
  pub fn new(config: &Config) -> Self {
    let rules = vec![
      RoutingRule {
        name: "api",
        matchers: vec![Matcher::PathPrefix(config.api_prefix.clone())],
        route: Route::new(Strategy::NetworkFirst, Role::Api),
      },
      RoutingRule {
        name: "image",
        matchers: vec![
          Matcher::Extensions(IMAGE_EXTENSIONS),
          Matcher::PathSegment(config.icon_path.clone()),
        ],
        route: Route::new(Strategy::CacheFirst, Role::Image),
      },
      RoutingRule {
        name: "static",
        matchers: vec![Matcher::Extensions(STATIC_EXTENSIONS), Matcher::RootDocument],
        route: Route::new(Strategy::CacheFirst, Role::Static),
      },
      RoutingRule {
        name: "navigation",
        matchers: vec![Matcher::Navigation],
        route: Route::new(Strategy::Navigation, Role::Static),
      },
      RoutingRule {
        name: "fallback",
        matchers: vec![Matcher::Any],
        route: Route::new(Strategy::StaleWhileRevalidate, Role::Misc),
      },
    ];

    Self {
      origin: config.origin.origin(),
      font_hosts: config.font_hosts.clone(),
      rules,
    }
  }

  pub fn classify(&self, request: &Request) -> Decision {
    if request.method != Method::GET {
      return Decision::Ignore;
    }

    if request.url.origin() != self.origin {
      // Allow-listed font hosts are the only cross-origin requests we answer
      return match request.url.host_str() {
        Some(host) if self.font_hosts.iter().any(|h| h == host) => {
          Decision::Handle(Route::new(Strategy::CacheFirst, Role::Font))
        }
        _ => Decision::Ignore,
      };
    }

    self
      .rules
      .iter()
      .find(|rule| rule.matches(request))
      .map(|rule| {
        tracing::trace!(rule = rule.name, url = %request.url, "matched routing rule");
        Decision::Handle(rule.route)
      })
      .unwrap_or(Decision::Ignore)
  }
}

/// Lowercased extension of the last path segment.
fn extension(url: &Url) -> Option<String> {
  let segment = url.path_segments()?.next_back()?;
  let (_, ext) = segment.rsplit_once('.')?;
  Some(ext.to_ascii_lowercase())
}
