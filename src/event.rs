use color_eyre::{eyre::eyre, Result};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

use crate::http::Network;
use crate::worker::{Dispatch, ServiceWorker, WorkerEvent};

struct Envelope {
  event: WorkerEvent,
  reply: oneshot::Sender<Dispatch>,
}

/// Event loop that feeds worker events to independent tasks.
///
/// Each event runs on its own task, so a slow fetch never delays a message
/// or another fetch. Dropping a reply receiver does not cancel the task.
pub struct EventHandler {
  tx: mpsc::UnboundedSender<Envelope>,
}

impl EventHandler {
  pub fn new<N: Network + 'static>(worker: Arc<ServiceWorker<N>>) -> Self {
    let (tx, mut rx) = mpsc::unbounded_channel::<Envelope>();

    tokio::spawn(async move {
      while let Some(envelope) = rx.recv().await {
        let worker = Arc::clone(&worker);
        tokio::spawn(async move {
          let outcome = worker.dispatch(envelope.event).await;
          let _ = envelope.reply.send(outcome);
        });
      }
    });

    Self { tx }
  }

  /// Deliver an event and wait for its outcome.
  pub async fn send(&self, event: WorkerEvent) -> Result<Dispatch> {
    let (reply, rx) = oneshot::channel();
    self
      .tx
      .send(Envelope { event, reply })
      .map_err(|_| eyre!("Worker event loop stopped"))?;

    rx.await.map_err(|_| eyre!("Worker dropped the event"))
  }
}
