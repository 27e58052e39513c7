//! Control channel: page commands and background sync triggers.

use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use tracing::{debug, info, warn};

use super::{Activation, ServiceWorker, WorkerState};
use crate::http::{Network, Request};
use crate::router::Decision;

/// Command posted by the page, e.g. `{ "type": "SKIP_WAITING" }`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlMessage {
  /// Activate the waiting worker without waiting for open pages to close
  SkipWaiting,
  /// Delete every namespace owned by this worker
  ClearCache,
}

impl ControlMessage {
  pub fn parse(json: &str) -> Result<Self> {
    serde_json::from_str(json).map_err(|e| eyre!("Unrecognized message {}: {}", json, e))
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageOutcome {
  /// Recorded; takes effect once installation finishes
  Acknowledged,
  Activated { purged: Vec<String> },
  Cleared { namespaces: Vec<String> },
}

/// A one-shot or periodic background sync trigger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncEvent {
  pub tag: String,
  pub periodic: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
  Refreshed { url: String, status: u16 },
  /// The server answered but the response was not cacheable
  NotStored { url: String, status: u16 },
  /// The refetch failed; nothing is rescheduled
  Failed { url: String },
  /// The path resolves to a request this worker never intercepts
  OutOfScope { url: String },
  UnknownTag,
}

impl<N: Network + 'static> ServiceWorker<N> {
  pub fn on_message(&self, message: ControlMessage) -> Result<MessageOutcome> {
    match message {
      ControlMessage::SkipWaiting => {
        let ready = {
          let mut lifecycle = self.lifecycle()?;
          lifecycle.skip_waiting();
          lifecycle.state() == WorkerState::Installed
        };

        if !ready {
          debug!("skip waiting recorded");
          return Ok(MessageOutcome::Acknowledged);
        }

        match self.on_activate()? {
          Activation::Activated { purged } => Ok(MessageOutcome::Activated { purged }),
          Activation::Waiting => Ok(MessageOutcome::Acknowledged),
        }
      }
      ControlMessage::ClearCache => {
        let namespaces = self.cache().clear_all()?;
        Ok(MessageOutcome::Cleared { namespaces })
      }
    }
  }

  /// Refetch the resource bound to the sync tag.
  ///
  /// Failures are logged and swallowed; retrying is left to the platform's
  /// sync scheduling.
  pub async fn on_sync(&self, event: &SyncEvent) -> SyncOutcome {
    let Some(task) = self.sync_tasks.iter().find(|t| t.tag == event.tag) else {
      debug!(tag = %event.tag, "ignoring unknown sync tag");
      return SyncOutcome::UnknownTag;
    };

    let url = match self.origin.join(&task.path) {
      Ok(url) => url,
      Err(e) => {
        warn!(tag = %task.tag, path = %task.path, error = %e, "invalid sync path");
        return SyncOutcome::Failed {
          url: task.path.clone(),
        };
      }
    };
    let request = Request::get(url);

    let role = match self.router.classify(&request) {
      Decision::Handle(route) => route.role,
      Decision::Ignore => {
        warn!(tag = %task.tag, url = %request.url, "sync path is outside the worker's scope");
        return SyncOutcome::OutOfScope {
          url: request.url.to_string(),
        };
      }
    };

    match self.network().fetch(&request).await {
      Ok(response) if self.cache().put(role, &request, &response) => {
        info!(
          tag = %task.tag,
          periodic = event.periodic,
          status = response.status,
          "background sync completed"
        );
        SyncOutcome::Refreshed {
          url: request.url.to_string(),
          status: response.status,
        }
      }
      Ok(response) => {
        warn!(tag = %task.tag, status = response.status, "background sync response not stored");
        SyncOutcome::NotStored {
          url: request.url.to_string(),
          status: response.status,
        }
      }
      Err(e) => {
        warn!(tag = %task.tag, error = %e, "background sync failed");
        SyncOutcome::Failed {
          url: request.url.to_string(),
        }
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{NamespaceManager, Role, SqliteStorage};
  use crate::config::{Config, SyncTask};
  use crate::http::Response;
  use crate::testing::MockNetwork;
  use url::Url;

  fn worker() -> ServiceWorker<MockNetwork> {
    worker_with(Config {
      origin: Url::parse("https://app.test").unwrap(),
      ..Config::default()
    })
  }

  fn worker_with(config: Config) -> ServiceWorker<MockNetwork> {
    let storage = SqliteStorage::open_in_memory().unwrap();
    let cache = NamespaceManager::new(Box::new(storage), config.cache_names());
    ServiceWorker::new(&config, cache, MockNetwork::new()).unwrap()
  }

  fn request(path: &str) -> Request {
    Request::get(Url::parse("https://app.test").unwrap().join(path).unwrap())
  }

  #[test]
  fn test_parse_messages() {
    assert_eq!(
      ControlMessage::parse(r#"{"type":"SKIP_WAITING"}"#).unwrap(),
      ControlMessage::SkipWaiting
    );
    assert_eq!(
      ControlMessage::parse(r#"{ "type": "CLEAR_CACHE" }"#).unwrap(),
      ControlMessage::ClearCache
    );
    assert!(ControlMessage::parse(r#"{"type":"RELOAD"}"#).is_err());
    assert!(ControlMessage::parse("not json").is_err());
  }

  #[tokio::test]
  async fn test_skip_waiting_before_install_completes() {
    let worker = worker();
    worker.client_opened().unwrap();

    assert_eq!(
      worker.on_message(ControlMessage::SkipWaiting).unwrap(),
      MessageOutcome::Acknowledged
    );
    assert_eq!(worker.state().unwrap(), WorkerState::Installing);

    // Activation follows install directly
    worker.on_install().await.unwrap();
    assert!(worker.is_active());
  }

  #[tokio::test]
  async fn test_skip_waiting_while_waiting() {
    let worker = worker();
    worker.client_opened().unwrap();
    worker.on_install().await.unwrap();
    assert!(!worker.is_active());

    let outcome = worker.on_message(ControlMessage::SkipWaiting).unwrap();
    assert!(matches!(outcome, MessageOutcome::Activated { .. }));
    assert!(worker.is_active());
  }

  #[tokio::test]
  async fn test_clear_cache_then_lookup_misses() {
    let worker = worker();
    worker.on_install().await.unwrap();
    worker.on_activate().unwrap();

    worker
      .cache()
      .put(Role::Api, &request("/api/expenses"), &Response::new(200, "[]"));
    worker
      .cache()
      .put(Role::Image, &request("/logo.png"), &Response::new(200, "png"));

    let outcome = worker.on_message(ControlMessage::ClearCache).unwrap();
    let MessageOutcome::Cleared { namespaces } = outcome else {
      panic!("expected clear");
    };
    assert!(namespaces.len() >= 2);

    assert!(worker.cache().match_any(&request("/api/expenses")).is_none());
    assert!(worker.cache().match_any(&request("/logo.png")).is_none());
  }

  #[tokio::test]
  async fn test_sync_refreshes_resource() {
    let worker = worker();
    worker
      .network()
      .respond("https://app.test/api/expenses", Response::new(200, "[1]"));

    let outcome = worker
      .on_sync(&SyncEvent {
        tag: "sync-expenses".to_string(),
        periodic: true,
      })
      .await;

    assert_eq!(
      outcome,
      SyncOutcome::Refreshed {
        url: "https://app.test/api/expenses".to_string(),
        status: 200
      }
    );
    let cached = worker
      .cache()
      .match_request(Role::Api, &request("/api/expenses"))
      .unwrap();
    assert_eq!(cached.body, b"[1]");
  }

  #[tokio::test]
  async fn test_sync_failure_swallowed() {
    let worker = worker();
    worker.network().set_offline(true);

    let outcome = worker
      .on_sync(&SyncEvent {
        tag: "sync-expenses".to_string(),
        periodic: false,
      })
      .await;
    assert!(matches!(outcome, SyncOutcome::Failed { .. }));
    assert_eq!(worker.network().calls(), 1);
  }

  #[tokio::test]
  async fn test_unknown_sync_tag() {
    let worker = worker();
    let outcome = worker
      .on_sync(&SyncEvent {
        tag: "sync-photos".to_string(),
        periodic: true,
      })
      .await;
    assert_eq!(outcome, SyncOutcome::UnknownTag);
    assert_eq!(worker.network().calls(), 0);
  }

  #[tokio::test]
  async fn test_sync_never_leaves_origin() {
    let worker = worker_with(Config {
      origin: Url::parse("https://app.test").unwrap(),
      sync: vec![SyncTask {
        tag: "sync-expenses".to_string(),
        path: "https://other.test/api/expenses".to_string(),
      }],
      ..Config::default()
    });
    worker
      .network()
      .respond("https://other.test/api/expenses", Response::new(200, "foreign"));

    let outcome = worker
      .on_sync(&SyncEvent {
        tag: "sync-expenses".to_string(),
        periodic: true,
      })
      .await;

    assert_eq!(
      outcome,
      SyncOutcome::OutOfScope {
        url: "https://other.test/api/expenses".to_string()
      }
    );
    assert_eq!(worker.network().calls(), 0);
    let foreign = Request::get(Url::parse("https://other.test/api/expenses").unwrap());
    assert!(worker.cache().match_any(&foreign).is_none());
  }

  #[tokio::test]
  async fn test_sync_error_status_not_reported_as_refreshed() {
    let worker = worker();
    worker
      .network()
      .respond("https://app.test/api/expenses", Response::new(500, "boom"));

    let outcome = worker
      .on_sync(&SyncEvent {
        tag: "sync-expenses".to_string(),
        periodic: false,
      })
      .await;

    assert_eq!(
      outcome,
      SyncOutcome::NotStored {
        url: "https://app.test/api/expenses".to_string(),
        status: 500
      }
    );
    assert!(worker
      .cache()
      .match_request(Role::Api, &request("/api/expenses"))
      .is_none());
  }
}
