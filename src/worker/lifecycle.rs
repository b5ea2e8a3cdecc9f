//! Worker registration: install, waiting and activation.

use tracing::{debug, info};

use super::event::InstallEvent;

/// State of one worker version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
  Parsed,
  Installing,
  /// Installed and waiting for the active worker to release its clients
  Installed,
  Activating,
  Activated,
  /// Replaced by a newer version
  Redundant,
}

/// Something that reacts to the install event of its own version.
pub trait InstallHandler {
  fn on_install(&self, event: &InstallEvent);
}

#[derive(Debug, Clone)]
pub struct WorkerVersion {
  pub label: String,
  pub state: WorkerState,
}

/// Tracks which worker version controls the site's clients.
#[derive(Debug, Default)]
pub struct Registration {
  active: Option<WorkerVersion>,
  waiting: Option<WorkerVersion>,
  retired: Vec<WorkerVersion>,
  clients: usize,
}

impl Registration {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn active(&self) -> Option<&WorkerVersion> {
    self.active.as_ref()
  }

  pub fn waiting(&self) -> Option<&WorkerVersion> {
    self.waiting.as_ref()
  }

  /// Versions that were replaced, oldest first.
  pub fn retired(&self) -> &[WorkerVersion] {
    &self.retired
  }

  pub fn clients(&self) -> usize {
    self.clients
  }

  /// A page under the active worker's control was opened.
  pub fn open_client(&mut self) {
    self.clients += 1;
  }

  /// Pages closed. A waiting worker takes over once none are left.
  pub fn release_clients(&mut self, count: usize) {
    self.clients = self.clients.saturating_sub(count);
    if self.clients == 0 {
      if let Some(waiting) = self.waiting.take() {
        debug!(version = %waiting.label, "Clients released, activating waiting worker");
        self.activate(waiting);
      }
    }
  }

  /// Install a new worker version and activate it when allowed.
  ///
  /// The new version becomes active right away if its install handler
  /// called `skip_waiting`, or if the current active worker controls no
  /// clients. Otherwise it waits, replacing any previously waiting version.
  pub fn install<H: InstallHandler>(&mut self, label: &str, handler: &H) -> WorkerState {
    let mut version = WorkerVersion {
      label: label.to_string(),
      state: WorkerState::Parsed,
    };

    version.state = WorkerState::Installing;
    let event = InstallEvent::new();
    handler.on_install(&event);
    version.state = WorkerState::Installed;

    let must_wait = self.active.is_some() && self.clients > 0 && !event.skipped_waiting();
    if must_wait {
      info!(version = %version.label, clients = self.clients, "Worker installed, waiting to activate");
      if let Some(mut previous) = self.waiting.replace(version) {
        previous.state = WorkerState::Redundant;
        self.retired.push(previous);
      }
      return WorkerState::Installed;
    }

    if let Some(mut previous) = self.waiting.take() {
      previous.state = WorkerState::Redundant;
      self.retired.push(previous);
    }
    self.activate(version);
    WorkerState::Activated
  }

  fn activate(&mut self, mut version: WorkerVersion) {
    version.state = WorkerState::Activating;
    if let Some(mut previous) = self.active.take() {
      previous.state = WorkerState::Redundant;
      self.retired.push(previous);
    }
    version.state = WorkerState::Activated;
    info!(version = %version.label, "Worker activated");
    self.active = Some(version);
  }
}
