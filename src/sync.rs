//! # Exclusivity Synchronization
//!
//! Process-wide coordination between execution models. Every dispatch asks the
//! [`Synchronization`] object for a slot and gives it back once the result has
//! been committed:
//!
//! - an **exclusive** node gets a slot only while no node of any model is running;
//! - any other node gets a slot only while no exclusive node is running.
//!
//! A granted slot is held by a [`SlotGuard`] that travels with the evaluation
//! and releases the slot when dropped, so a slot outlives the model that took
//! it for as long as the evaluation runs.
//!
//! Counters are kept per model behind one mutex. Releasing a slot bumps a
//! generation counter published through a `tokio::sync::watch` channel, which
//! wakes models whose dispatch was refused.

use crate::ids::ModelId;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use tokio::sync::watch;
use tracing::{error, trace};

#[derive(Clone, Copy, Debug, Default)]
struct Counters {
  running: usize,
  exclusive_running: bool,
}

/// Shared running-node counters.
#[derive(Debug)]
pub struct Synchronization {
  counters: Mutex<HashMap<ModelId, Counters>>,
  wake: watch::Sender<u64>,
}

static GLOBAL: OnceLock<Arc<Synchronization>> = OnceLock::new();

impl Default for Synchronization {
  fn default() -> Self {
    Self::new()
  }
}

impl Synchronization {
  /// Creates a coordination object independent from the global one.
  pub fn new() -> Self {
    let (wake, _) = watch::channel(0);
    Self {
      counters: Mutex::new(HashMap::new()),
      wake,
    }
  }

  /// The process-wide instance used by models that were not given their own.
  pub fn global() -> Arc<Synchronization> {
    Arc::clone(GLOBAL.get_or_init(|| Arc::new(Synchronization::new())))
  }

  /// Tries to take a running slot for `model`.
  ///
  /// Returns `false` without side effects when the slot cannot be granted.
  pub fn try_acquire(&self, model: ModelId, exclusive: bool) -> bool {
    let mut counters = self.counters.lock().unwrap_or_else(PoisonError::into_inner);
    let allowed = if exclusive {
      counters.values().all(|c| c.running == 0)
    } else {
      counters.values().all(|c| !c.exclusive_running)
    };
    if allowed {
      let entry = counters.entry(model).or_default();
      entry.running += 1;
      entry.exclusive_running |= exclusive;
    }
    trace!(%model, exclusive, allowed, "slot requested");
    allowed
  }

  /// Like [`Synchronization::try_acquire`], but returns a guard that releases
  /// the slot when dropped.
  pub fn acquire(self: &Arc<Self>, model: ModelId, exclusive: bool) -> Option<SlotGuard> {
    self.try_acquire(model, exclusive).then(|| SlotGuard {
      sync: Arc::clone(self),
      model,
      exclusive,
    })
  }

  /// Gives back a slot taken with [`Synchronization::try_acquire`].
  pub fn release(&self, model: ModelId, exclusive: bool) {
    let idle = {
      let mut counters = self.counters.lock().unwrap_or_else(PoisonError::into_inner);
      let Some(entry) = counters.get_mut(&model) else {
        error!(%model, "released a slot that was never acquired");
        return;
      };
      if entry.running == 0 {
        error!(%model, "released more slots than were acquired");
        return;
      }
      entry.running -= 1;
      if exclusive {
        entry.exclusive_running = false;
      }
      let idle = entry.running == 0;
      if idle {
        counters.remove(&model);
      }
      idle
    };
    trace!(%model, exclusive, idle, "slot released");
    self.wake.send_modify(|generation| *generation = generation.wrapping_add(1));
  }

  /// Number of nodes `model` currently runs.
  pub fn running(&self, model: ModelId) -> usize {
    self
      .counters
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .get(&model)
      .map_or(0, |c| c.running)
  }

  /// Number of nodes running across all models.
  pub fn total_running(&self) -> usize {
    self
      .counters
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .values()
      .map(|c| c.running)
      .sum()
  }

  /// Returns `true` while an exclusive node runs in any model.
  pub fn exclusive_running(&self) -> bool {
    self
      .counters
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .values()
      .any(|c| c.exclusive_running)
  }

  /// Receiver notified whenever a slot is released.
  pub fn subscribe(&self) -> watch::Receiver<u64> {
    self.wake.subscribe()
  }
}

/// A running slot taken with [`Synchronization::acquire`].
#[derive(Debug)]
#[must_use = "the slot is released as soon as the guard is dropped"]
pub struct SlotGuard {
  sync: Arc<Synchronization>,
  model: ModelId,
  exclusive: bool,
}

impl SlotGuard {
  /// Model the slot was granted to.
  pub fn model(&self) -> ModelId {
    self.model
  }

  /// Returns `true` for an exclusive slot.
  pub fn is_exclusive(&self) -> bool {
    self.exclusive
  }
}

impl Drop for SlotGuard {
  fn drop(&mut self) {
    self.sync.release(self.model, self.exclusive);
  }
}
