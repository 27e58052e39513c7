//! Worker lifecycle state machine.

use color_eyre::{eyre::eyre, Result};

/// Worker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
  /// Install event running (precaching).
  Installing,
  /// Installed, waiting for the activation gate.
  Installed,
  /// Activate event running (purge, claim).
  Activating,
  /// Active and controlling pages until a newer version takes over.
  Activated,
}

/// Tracks the worker's state and the pages it may control.
#[derive(Debug)]
pub struct Lifecycle {
  state: WorkerState,
  skip_waiting: bool,
  open_clients: usize,
  controlled_clients: usize,
}

impl Lifecycle {
  pub fn new() -> Self {
    Self {
      state: WorkerState::Installing,
      skip_waiting: false,
      open_clients: 0,
      controlled_clients: 0,
    }
  }

  pub fn state(&self) -> WorkerState {
    self.state
  }

  pub fn is_active(&self) -> bool {
    self.state == WorkerState::Activated
  }

  fn set_state(&mut self, state: WorkerState) {
    tracing::info!(from = ?self.state, to = ?state, "worker state change");
    self.state = state;
  }

  /// Installing → Installed.
  pub fn install_complete(&mut self) -> Result<()> {
    if self.state != WorkerState::Installing {
      return Err(eyre!("Cannot finish install in state {:?}", self.state));
    }
    self.set_state(WorkerState::Installed);
    Ok(())
  }

  /// Request activation without waiting for open pages to close.
  pub fn skip_waiting(&mut self) {
    self.skip_waiting = true;
  }

  pub fn skip_waiting_requested(&self) -> bool {
    self.skip_waiting
  }

  /// Whether the waiting worker may activate now.
  pub fn can_activate(&self) -> bool {
    self.state == WorkerState::Installed && (self.skip_waiting || self.open_clients == 0)
  }

  /// Installed → Activating, if the gate is open.
  pub fn begin_activation(&mut self) -> Result<()> {
    if !self.can_activate() {
      return Err(eyre!(
        "Cannot activate in state {:?} with {} open page(s)",
        self.state,
        self.open_clients
      ));
    }
    self.set_state(WorkerState::Activating);
    Ok(())
  }

  /// Activating → Activated, taking control of every open page.
  pub fn finish_activation(&mut self) -> Result<()> {
    if self.state != WorkerState::Activating {
      return Err(eyre!("Cannot finish activation in state {:?}", self.state));
    }
    self.controlled_clients = self.open_clients;
    self.set_state(WorkerState::Activated);
    Ok(())
  }

  pub fn client_opened(&mut self) {
    self.open_clients += 1;
    if self.is_active() {
      self.controlled_clients += 1;
    }
  }

  pub fn client_closed(&mut self) {
    self.open_clients = self.open_clients.saturating_sub(1);
    self.controlled_clients = self.controlled_clients.min(self.open_clients);
  }

  pub fn controlled_clients(&self) -> usize {
    self.controlled_clients
  }
}

impl Default for Lifecycle {
  fn default() -> Self {
    Self::new()
  }
}
