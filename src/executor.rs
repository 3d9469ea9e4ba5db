//! # Executors
//!
//! Strategies that invoke a node's behaviour. The execution model never calls
//! [`NodeBehavior::eval`] itself: it copies what the evaluation needs into a
//! [`NodeSnapshot`] and hands it to the [`Executor`] matching the node's
//! [`EvalMode`].
//!
//! - [`SequentialExecutor`] evaluates in place, on the calling thread, and
//!   returns the result immediately. Used for [`EvalMode::Blocking`] nodes,
//!   groups and boundary providers.
//! - [`ParallelExecutor`] moves the snapshot onto a [`WorkerPool`] thread and
//!   sends the result back as a [`Completion`] message through a channel the
//!   model drains on its own thread. Used for [`EvalMode::Exclusive`] and
//!   [`EvalMode::Detached`] nodes.
//!
//! A snapshot owns copies of the node's port values and a clone of its
//! behaviour, so edits to the live node cannot reach an evaluation in flight.
//! It also carries the node's [`SlotGuard`], which moves on into the
//! [`Completion`]: the slot stays taken until the result is committed or
//! thrown away, even if the model itself is gone by then.

use crate::config::ExecutionConfig;
use crate::data::NodeData;
use crate::error::{EvalError, ExecutionError};
use crate::ids::{NodeUuid, PortId};
use crate::node::{EvalContext, EvalMode, NodeBehavior};
use crate::sync::SlotGuard;
use std::any::Any;
use std::future::Future;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::runtime::{Builder, Runtime};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

/// Values committed by one evaluation, one entry per output port.
pub type EvalOutputs = Vec<(PortId, Option<NodeData>)>;

/// Everything one evaluation needs, detached from the live graph.
pub struct NodeSnapshot {
  /// Evaluated node.
  pub uuid: NodeUuid,
  /// Caption of the node at dispatch time.
  pub caption: String,
  /// Mode the node was dispatched with.
  pub mode: EvalMode,
  /// Input values in port order.
  pub inputs: Vec<(PortId, Option<NodeData>)>,
  /// Previously committed output values in port order.
  pub outputs: Vec<(PortId, Option<NodeData>)>,
  /// Clone of the node's behaviour.
  pub behavior: Box<dyn NodeBehavior>,
  /// Synchronization slot held for the duration of the evaluation.
  pub slot: Option<SlotGuard>,
}

impl NodeSnapshot {
  /// Runs the behaviour once per output port (once with `None` for nodes
  /// without outputs). A panic is reported as [`EvalError::Panicked`].
  pub fn evaluate(&self) -> Result<EvalOutputs, EvalError> {
    let ctx = EvalContext::new(self.uuid, &self.caption, &self.inputs, &self.outputs);
    let run = || -> Result<EvalOutputs, EvalError> {
      if self.outputs.is_empty() {
        self.behavior.eval(&ctx, None)?;
        return Ok(Vec::new());
      }
      self
        .outputs
        .iter()
        .map(|(port, _)| Ok((*port, self.behavior.eval(&ctx, Some(*port))?)))
        .collect()
    };
    catch_unwind(AssertUnwindSafe(run))
      .unwrap_or_else(|payload| Err(EvalError::Panicked(panic_message(payload.as_ref()))))
  }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
  if let Some(message) = payload.downcast_ref::<&str>() {
    (*message).to_string()
  } else if let Some(message) = payload.downcast_ref::<String>() {
    message.clone()
  } else {
    "unknown panic payload".to_string()
  }
}

/// Result of one evaluation, sent back to the owning model.
#[derive(Debug)]
pub struct Completion {
  /// Evaluated node.
  pub node: NodeUuid,
  /// Mode the node was dispatched with.
  pub mode: EvalMode,
  /// Committed outputs, or the failure.
  pub result: Result<EvalOutputs, EvalError>,
  /// Synchronization slot, released when the completion is dropped.
  pub slot: Option<SlotGuard>,
}

/// Outcome of handing a snapshot to an executor.
#[derive(Debug)]
pub enum Dispatch {
  /// The evaluation already finished.
  Completed(Completion),
  /// The evaluation runs elsewhere; its [`Completion`] arrives through the channel.
  Launched,
}

/// A strategy for running node evaluations.
pub trait Executor: Send + Sync {
  /// Starts evaluating `snapshot`.
  fn launch(&self, snapshot: NodeSnapshot) -> Dispatch;
}

/// Evaluates in place on the calling thread.
#[derive(Clone, Copy, Debug, Default)]
pub struct SequentialExecutor;

impl Executor for SequentialExecutor {
  fn launch(&self, mut snapshot: NodeSnapshot) -> Dispatch {
    trace!(node = %snapshot.uuid, "evaluating in place");
    let result = snapshot.evaluate();
    Dispatch::Completed(Completion {
      node: snapshot.uuid,
      mode: snapshot.mode,
      result,
      slot: snapshot.slot.take(),
    })
  }
}

/// Worker threads for background evaluations.
///
/// Wraps a tokio multi-thread runtime; evaluations run as blocking tasks,
/// bounded by the configured number of worker threads. The runtime also drives
/// the timers used while a model waits for completions.
///
/// A pool must not be dropped from inside an asynchronous context.
pub struct WorkerPool {
  runtime: Runtime,
  threads: usize,
  closed: AtomicBool,
}

impl WorkerPool {
  /// Starts a pool sized by `config.worker_threads`.
  ///
  /// # Errors
  ///
  /// [`ExecutionError::Config`] for an invalid configuration and
  /// [`ExecutionError::Runtime`] if the threads cannot be started.
  pub fn new(config: &ExecutionConfig) -> Result<Self, ExecutionError> {
    config.validate()?;
    let runtime = Builder::new_multi_thread()
      .worker_threads(1)
      .max_blocking_threads(config.worker_threads)
      .thread_name(config.thread_name.clone())
      .enable_time()
      .build()
      .map_err(|err| ExecutionError::Runtime(err.to_string()))?;
    debug!(threads = config.worker_threads, name = %config.thread_name, "worker pool started");
    Ok(Self {
      runtime,
      threads: config.worker_threads,
      closed: AtomicBool::new(false),
    })
  }

  /// Maximum number of concurrent evaluations.
  pub fn threads(&self) -> usize {
    self.threads
  }

  /// Refuses every later job. Jobs already started run to completion.
  pub fn close(&self) {
    if !self.closed.swap(true, Ordering::AcqRel) {
      debug!("worker pool closed");
    }
  }

  /// Returns `true` once [`WorkerPool::close`] was called.
  pub fn is_closed(&self) -> bool {
    self.closed.load(Ordering::Acquire)
  }

  /// Runs `job` on a worker thread.
  ///
  /// # Errors
  ///
  /// [`EvalError::LaunchFailed`] once the pool is closed.
  pub fn spawn<F>(&self, job: F) -> Result<(), EvalError>
  where
    F: FnOnce() + Send + 'static,
  {
    if self.is_closed() {
      return Err(EvalError::LaunchFailed("worker pool is closed".to_string()));
    }
    drop(self.runtime.spawn_blocking(job));
    Ok(())
  }

  /// Drives `future` to completion on the calling thread.
  pub(crate) fn block_on<F: Future>(&self, future: F) -> F::Output {
    self.runtime.block_on(future)
  }
}

impl std::fmt::Debug for WorkerPool {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("WorkerPool")
      .field("threads", &self.threads)
      .field("closed", &self.is_closed())
      .finish()
  }
}

/// Evaluates on a [`WorkerPool`] and reports through a channel.
pub struct ParallelExecutor {
  pool: Arc<WorkerPool>,
  completions: mpsc::UnboundedSender<Completion>,
}

impl ParallelExecutor {
  /// Creates an executor running on `pool` and reporting to `completions`.
  pub fn new(pool: Arc<WorkerPool>, completions: mpsc::UnboundedSender<Completion>) -> Self {
    Self { pool, completions }
  }

  /// The pool evaluations run on.
  pub fn pool(&self) -> &Arc<WorkerPool> {
    &self.pool
  }
}

impl Executor for ParallelExecutor {
  fn launch(&self, snapshot: NodeSnapshot) -> Dispatch {
    let node = snapshot.uuid;
    let mode = snapshot.mode;
    if self.pool.is_closed() {
      let err = EvalError::LaunchFailed("worker pool is closed".to_string());
      warn!(node = %node, error = %err, "could not launch evaluation");
      return Dispatch::Completed(Completion {
        node,
        mode,
        result: Err(err),
        slot: snapshot.slot,
      });
    }
    let completions = self.completions.clone();
    let job = move || {
      let mut snapshot = snapshot;
      trace!(node = %snapshot.uuid, "evaluating on worker");
      let result = snapshot.evaluate();
      let completion = Completion {
        node: snapshot.uuid,
        mode: snapshot.mode,
        result,
        slot: snapshot.slot.take(),
      };
      if completions.send(completion).is_err() {
        trace!(node = %node, "execution model gone before completion, slot released");
      }
    };
    match self.pool.spawn(job) {
      Ok(()) => Dispatch::Launched,
      Err(err) => {
        warn!(node = %node, error = %err, "could not launch evaluation");
        Dispatch::Completed(Completion {
          node,
          mode,
          result: Err(err),
          slot: None,
        })
      }
    }
  }
}
