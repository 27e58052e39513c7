//! The worker: one handler per event kind behind a single dispatcher.
//!
//! ## Lifecycle
//! 1. **Install**: precache the manifest into the static namespace
//! 2. **Activate**: purge stale namespaces, claim open pages
//! 3. **Fetch**: classify and answer intercepted requests
//!
//! A worker that is not activated declines every fetch, so no request is ever
//! answered while namespaces of two versions coexist.

mod control;
mod lifecycle;

pub use control::{ControlMessage, MessageOutcome, SyncEvent, SyncOutcome};
pub use lifecycle::{Lifecycle, WorkerState};

use color_eyre::{eyre::eyre, Result};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{info, warn};
use url::Url;

use crate::cache::{NamespaceManager, Role};
use crate::config::{Config, SyncTask};
use crate::http::{Network, Request, Response};
use crate::precache::{precache, PrecacheEntry, PrecacheReport};
use crate::router::{Decision, Router};
use crate::strategy::Executor;

/// Events delivered to the worker.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
  Install,
  Activate,
  Fetch(Request),
  Message(ControlMessage),
  Sync(SyncEvent),
}

/// Result of dispatching one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
  /// The request is not intercepted; the page fetches it normally
  NotHandled,
  Response(Response),
  Installed(PrecacheReport),
  Activation(Activation),
  Message(MessageOutcome),
  Sync(SyncOutcome),
  /// A lifecycle event arrived in the wrong state
  Rejected(String),
}

/// Outcome of an activation attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Activation {
  Activated { purged: Vec<String> },
  /// Pages are still open and SKIP_WAITING was not received
  Waiting,
}

pub struct ServiceWorker<N> {
  router: Router,
  executor: Executor<N>,
  lifecycle: Mutex<Lifecycle>,
  origin: Url,
  precache: Vec<PrecacheEntry>,
  sync_tasks: Vec<SyncTask>,
}

impl<N: Network + 'static> ServiceWorker<N> {
  pub fn new(config: &Config, cache: NamespaceManager, network: N) -> Result<Self> {
    let executor = Executor::new(Arc::new(cache), Arc::new(network))
      .with_network_timeout(config.network_timeout())
      .with_offline_page(config.offline_page_url()?);

    Ok(Self {
      router: Router::new(config),
      executor,
      lifecycle: Mutex::new(Lifecycle::new()),
      origin: config.origin.clone(),
      precache: config.precache_entries()?,
      sync_tasks: config.sync.clone(),
    })
  }

  pub fn cache(&self) -> &NamespaceManager {
    self.executor.cache().as_ref()
  }

  pub fn network(&self) -> &N {
    self.executor.network().as_ref()
  }

  pub fn state(&self) -> Result<WorkerState> {
    Ok(self.lifecycle()?.state())
  }

  pub fn is_active(&self) -> bool {
    self.lifecycle().is_ok_and(|l| l.is_active())
  }

  pub fn client_opened(&self) -> Result<()> {
    self.lifecycle()?.client_opened();
    Ok(())
  }

  pub fn client_closed(&self) -> Result<()> {
    self.lifecycle()?.client_closed();
    Ok(())
  }

  pub fn controlled_clients(&self) -> Result<usize> {
    Ok(self.lifecycle()?.controlled_clients())
  }

  pub async fn dispatch(&self, event: WorkerEvent) -> Dispatch {
    match event {
      WorkerEvent::Install => match self.on_install().await {
        Ok(report) => Dispatch::Installed(report),
        Err(e) => rejected(e),
      },
      WorkerEvent::Activate => match self.on_activate() {
        Ok(activation) => Dispatch::Activation(activation),
        Err(e) => rejected(e),
      },
      WorkerEvent::Fetch(request) => match self.on_fetch(&request).await {
        Some(response) => Dispatch::Response(response),
        None => Dispatch::NotHandled,
      },
      WorkerEvent::Message(message) => match self.on_message(message) {
        Ok(outcome) => Dispatch::Message(outcome),
        Err(e) => rejected(e),
      },
      WorkerEvent::Sync(event) => Dispatch::Sync(self.on_sync(&event).await),
    }
  }

  /// Precache the manifest, then wait for activation.
  ///
  /// Individual asset failures never fail the install. If SKIP_WAITING arrived
  /// while installing, activation follows immediately.
  pub async fn on_install(&self) -> Result<PrecacheReport> {
    let state = self.state()?;
    if state != WorkerState::Installing {
      return Err(eyre!("Install event in state {:?}", state));
    }

    if let Err(e) = self.cache().open(Role::Static) {
      warn!(error = %e, "failed to open static namespace");
    }

    let report = precache(self.cache(), self.network(), &self.origin, &self.precache).await;

    let skip_waiting = {
      let mut lifecycle = self.lifecycle()?;
      lifecycle.install_complete()?;
      lifecycle.skip_waiting_requested()
    };

    if skip_waiting {
      self.on_activate()?;
    }

    Ok(report)
  }

  /// Purge stale namespaces and claim open pages.
  pub fn on_activate(&self) -> Result<Activation> {
    {
      let mut lifecycle = self.lifecycle()?;
      if lifecycle.state() == WorkerState::Installed && !lifecycle.can_activate() {
        info!("waiting for open pages to close before activating");
        return Ok(Activation::Waiting);
      }
      lifecycle.begin_activation()?;
    }

    let cache = self.cache();
    let purged = match cache.purge_stale(cache.names()) {
      Ok(purged) => purged,
      Err(e) => {
        warn!(error = %e, "failed to purge stale namespaces");
        Vec::new()
      }
    };

    let mut lifecycle = self.lifecycle()?;
    lifecycle.finish_activation()?;
    info!(
      purged = purged.len(),
      claimed = lifecycle.controlled_clients(),
      "worker activated"
    );

    Ok(Activation::Activated { purged })
  }

  /// Answer an intercepted request, or `None` to let it through untouched.
  pub async fn on_fetch(&self, request: &Request) -> Option<Response> {
    if !self.is_active() {
      return None;
    }

    match self.router.classify(request) {
      Decision::Ignore => None,
      Decision::Handle(route) => Some(self.executor.execute(route, request).await),
    }
  }

  /// Wait for background cache refreshes to finish.
  pub async fn settle(&self) {
    self.executor.settle().await;
  }

  fn lifecycle(&self) -> Result<MutexGuard<'_, Lifecycle>> {
    self
      .lifecycle
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

fn rejected(e: color_eyre::Report) -> Dispatch {
  warn!(error = %e, "event rejected");
  Dispatch::Rejected(e.to_string())
}
