use std::fmt;

use crate::error::LifecycleError;

/// Lifecycle of one interceptor version.
///
/// ```text
///   Installing --install failed--> Redundant
///   Installing --installed, predecessor has no pages--> Active
///   Installing --installed, predecessor has pages--> Waiting
///   Waiting --predecessor released | skip waiting--> Active
///   Waiting | Active --superseded--> Redundant
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
  Installing,
  Waiting,
  Active,
  Redundant,
}

impl WorkerState {
  pub fn as_str(&self) -> &'static str {
    match self {
      WorkerState::Installing => "installing",
      WorkerState::Waiting => "waiting",
      WorkerState::Active => "active",
      WorkerState::Redundant => "redundant",
    }
  }
}

impl fmt::Display for WorkerState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
  /// Precache finished
  Installed { predecessor_has_pages: bool },
  InstallFailed,
  /// The last page controlled by the predecessor went away
  PredecessorReleased,
  /// A page asked for immediate takeover
  SkipWaiting,
  /// A newer version activated
  Superseded,
}

impl LifecycleEvent {
  fn as_str(&self) -> &'static str {
    match self {
      LifecycleEvent::Installed { .. } => "installed",
      LifecycleEvent::InstallFailed => "install-failed",
      LifecycleEvent::PredecessorReleased => "predecessor-released",
      LifecycleEvent::SkipWaiting => "skip-waiting",
      LifecycleEvent::Superseded => "superseded",
    }
  }
}

/// Side effects the owner must carry out after a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
  /// Fetch critical resources into the static partition
  Precache,
  /// Remove partitions that belong to other versions
  DeleteStalePartitions,
  /// Start serving every open page
  ClaimPages,
  /// Drop the worker
  Discard,
}

const ACTIVATE: &[Effect] = &[Effect::DeleteStalePartitions, Effect::ClaimPages];

/// State and effects of a freshly registered version.
pub fn start() -> (WorkerState, Vec<Effect>) {
  (WorkerState::Installing, vec![Effect::Precache])
}

/// Apply `event` to `state`.
pub fn transition(
  state: WorkerState,
  event: LifecycleEvent,
) -> Result<(WorkerState, Vec<Effect>), LifecycleError> {
  use LifecycleEvent::*;
  use WorkerState::*;

  let next = match (state, event) {
    (Installing, InstallFailed) => (Redundant, vec![Effect::Discard]),
    (Installing, Installed { predecessor_has_pages: false }) => (Active, ACTIVATE.to_vec()),
    (Installing, Installed { predecessor_has_pages: true }) => (Waiting, Vec::new()),
    (Waiting, PredecessorReleased) | (Waiting, SkipWaiting) => (Active, ACTIVATE.to_vec()),
    (Waiting, Superseded) | (Active, Superseded) => (Redundant, vec![Effect::Discard]),
    // Asking an active worker to skip waiting is harmless
    (Active, SkipWaiting) => (Active, Vec::new()),
    (state, event) => {
      return Err(LifecycleError::InvalidTransition {
        state: state.as_str(),
        event: event.as_str(),
      })
    }
  };
  Ok(next)
}
