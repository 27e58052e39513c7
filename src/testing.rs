//! Scripted in-process network for tests.

use color_eyre::{eyre::eyre, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::watch;

use crate::http::{Network, Request, Response};

/// Answers from a fixed URL → response table. Unknown URLs fail like an
/// unreachable host.
pub struct MockNetwork {
  responses: Mutex<HashMap<String, Response>>,
  offline: AtomicBool,
  calls: AtomicUsize,
  delay: Mutex<Option<Duration>>,
  gate: watch::Sender<bool>,
}

impl MockNetwork {
  pub fn new() -> Self {
    let (gate, _) = watch::channel(true);
    Self {
      responses: Mutex::new(HashMap::new()),
      offline: AtomicBool::new(false),
      calls: AtomicUsize::new(0),
      delay: Mutex::new(None),
      gate,
    }
  }

  pub fn respond(&self, url: &str, response: Response) {
    self
      .responses
      .lock()
      .unwrap()
      .insert(url.to_string(), response);
  }

  pub fn set_offline(&self, offline: bool) {
    self.offline.store(offline, Ordering::SeqCst);
  }

  pub fn set_delay(&self, delay: Duration) {
    *self.delay.lock().unwrap() = Some(delay);
  }

  /// Block every fetch until `release` is called.
  pub fn hold(&self) {
    self.gate.send_replace(false);
  }

  pub fn release(&self) {
    self.gate.send_replace(true);
  }

  /// Number of fetches started so far.
  pub fn calls(&self) -> usize {
    self.calls.load(Ordering::SeqCst)
  }
}

impl Network for MockNetwork {
  async fn fetch(&self, request: &Request) -> Result<Response> {
    self.calls.fetch_add(1, Ordering::SeqCst);

    let mut gate = self.gate.subscribe();
    gate
      .wait_for(|open| *open)
      .await
      .map_err(|e| eyre!("gate closed: {}", e))?;

    let delay = *self.delay.lock().unwrap();
    if let Some(delay) = delay {
      tokio::time::sleep(delay).await;
    }

    if self.offline.load(Ordering::SeqCst) {
      return Err(eyre!("network unreachable"));
    }

    self
      .responses
      .lock()
      .unwrap()
      .get(request.url.as_str())
      .cloned()
      .ok_or_else(|| eyre!("connection refused: {}", request.url))
  }
}
