//! Completion handles returned by evaluation requests.

use super::ExecutionModel;
use crate::error::ExecutionError;
use crate::event::NodeEvalState;
use crate::ids::{ModelId, NodeUuid};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// State a target has to reach for a [`FutureEvaluated`] to succeed.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum TargetState {
  /// The target must end up `Valid`.
  Valid,
  /// Any terminal state (`Valid` or `Invalid`) will do.
  Terminal,
}

/// Aggregated progress of a [`FutureEvaluated`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FutureStatus {
  /// At least one target has not reached a terminal state.
  Pending,
  /// Every target reached its required state.
  Succeeded,
  /// Every target is terminal, and at least one failed or was deleted.
  Failed,
}

/// Handle on a set of evaluation targets of one [`ExecutionModel`].
///
/// The handle holds no reference to the model; every operation takes the
/// model explicitly, so it can be stored, joined and moved freely.
#[derive(Clone, Debug, PartialEq, Eq)]
#[must_use = "a future does nothing unless waited on, detached or chained"]
pub struct FutureEvaluated {
  model: ModelId,
  targets: Vec<(NodeUuid, TargetState)>,
}

impl FutureEvaluated {
  pub(crate) fn new(model: ModelId, targets: Vec<(NodeUuid, TargetState)>) -> Self {
    Self { model, targets }
  }

  /// Model the targets belong to.
  pub fn model(&self) -> ModelId {
    self.model
  }

  /// Targets and the state each must reach.
  pub fn targets(&self) -> &[(NodeUuid, TargetState)] {
    &self.targets
  }

  /// Requires only a terminal state from every target.
  pub fn any_terminal(mut self) -> Self {
    for (_, required) in &mut self.targets {
      *required = TargetState::Terminal;
    }
    self
  }

  /// Current progress. A target deleted from the graph counts as failed.
  pub fn status(&self, model: &ExecutionModel) -> FutureStatus {
    if model.id() != self.model {
      warn!(future = %self.model, model = %model.id(), "future queried against a foreign model");
      return FutureStatus::Failed;
    }
    let mut failed = false;
    for (uuid, required) in &self.targets {
      let Some(entry) = model.entries.get(uuid) else {
        failed = true;
        continue;
      };
      match entry.state {
        NodeEvalState::Valid => {}
        NodeEvalState::Invalid => failed |= *required == TargetState::Valid,
        NodeEvalState::Outdated | NodeEvalState::Evaluating | NodeEvalState::Paused => {
          return FutureStatus::Pending;
        }
      }
    }
    if failed {
      FutureStatus::Failed
    } else {
      FutureStatus::Succeeded
    }
  }

  /// Drives `model` until every target is terminal or `timeout` elapses.
  ///
  /// Returns `true` if every target reached its required state. Returns
  /// `false` on failure, on timeout, and as soon as the model stalls or runs
  /// out of work with targets still outdated. A timeout does not cancel
  /// evaluations in flight.
  ///
  /// Must not be called from inside an asynchronous context.
  pub fn wait(&self, model: &mut ExecutionModel, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
      model.process_events();
      match self.status(model) {
        FutureStatus::Succeeded => return true,
        FutureStatus::Failed => return false,
        FutureStatus::Pending => {}
      }
      if model.is_stalled() || model.is_idle() {
        debug!(model = %self.model, stalled = model.is_stalled(), "wait abandoned, no progress possible");
        return false;
      }
      let now = Instant::now();
      if now >= deadline {
        debug!(model = %self.model, "wait timed out");
        return false;
      }
      let slice = (deadline - now).min(model.config().idle_poll_interval);
      model.wait_for_activity(slice);
    }
  }

  /// Lets the evaluation run on. Returns `false` only if it already failed.
  pub fn detach(self, model: &ExecutionModel) -> bool {
    self.status(model) != FutureStatus::Failed
  }

  /// Calls `callback` once every target is terminal, with `true` on success.
  ///
  /// Runs immediately if that is already the case, otherwise from a later
  /// [`ExecutionModel::process_events`].
  pub fn then<F>(self, model: &mut ExecutionModel, callback: F)
  where
    F: FnOnce(bool) + Send + 'static,
  {
    match self.status(model) {
      FutureStatus::Pending => model.register_callback(self, Box::new(callback)),
      status => callback(status == FutureStatus::Succeeded),
    }
  }

  /// Merges the targets of two futures of the same model. A node required to
  /// be `Valid` by either future stays so.
  ///
  /// # Errors
  ///
  /// [`ExecutionError::ModelMismatch`] if the futures belong to different models.
  pub fn join(mut self, other: FutureEvaluated) -> Result<Self, ExecutionError> {
    if self.model != other.model {
      return Err(ExecutionError::ModelMismatch);
    }
    for (uuid, required) in other.targets {
      match self.targets.iter_mut().find(|(existing, _)| *existing == uuid) {
        Some((_, current)) => {
          if required == TargetState::Valid {
            *current = TargetState::Valid;
          }
        }
        None => self.targets.push((uuid, required)),
      }
    }
    Ok(self)
  }
}
