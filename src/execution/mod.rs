//! # Execution Model
//!
//! One [`ExecutionModel`] drives the evaluation of one root [`Graph`]. It owns
//! the per-node, per-port data cache and the evaluation state machine:
//!
//! ```text
//! Outdated --(inputs ready)--> Evaluating --> Valid | Invalid
//!     ^                                            |
//!     +------------- upstream change --------------+
//! ```
//!
//! ## Scheduling
//!
//! Two sets of targets are tracked: *single-shot* targets, dropped once they
//! reach a terminal state, and *auto* targets, kept evaluated whenever a
//! dependency changes. After every change the model computes the dependency
//! closure of all targets over the global connection model, sorts the nodes
//! still waiting with Kahn's algorithm, queues those whose inputs are ready and
//! hands them one by one to the executor selected by their [`EvalMode`].
//!
//! ## Threading
//!
//! The model itself is single-threaded: all state lives on the thread that owns
//! it. Background executors receive a [`NodeSnapshot`] and report through a
//! channel; results are committed when the owner calls
//! [`ExecutionModel::process_events`], directly or through
//! [`FutureEvaluated::wait`].
//!
//! ## Example
//!
//! ```rust
//! use nodeweave::{EvalMode, ExecutionModel, Graph, Node, NodeData, NodeIdPolicy, Port, PortId, from_fn};
//! use std::time::Duration;
//!
//! let mut model = ExecutionModel::new(Graph::new())?;
//! let (source, sink) = {
//!   let mut graph = model.modify();
//!   let source = graph
//!     .append_node(Node::new("source", from_fn(|_, _| Ok(None))).with_output(Port::new("int", "out")), NodeIdPolicy::Update)?
//!     .id();
//!   let sink = graph
//!     .append_node(
//!       Node::new("sink", from_fn(|ctx, _| Ok(ctx.input(PortId(0)).cloned())))
//!         .with_input(Port::new("int", "in"))
//!         .with_output(Port::new("int", "out"))
//!         .with_eval_mode(EvalMode::Blocking),
//!       NodeIdPolicy::Update,
//!     )?
//!     .id();
//!   graph.append_connection(nodeweave::ConnectionId::new(source, PortId(0), sink, PortId(0)))?;
//!   (graph.find_node(source).map(|n| n.uuid()), graph.find_node(sink).map(|n| n.uuid()))
//! };
//! let (source, sink) = (source.ok_or("missing source")?, sink.ok_or("missing sink")?);
//!
//! model.set_node_data(source, PortId(0), Some(NodeData::new(42_i64)))?;
//! let future = model.evaluate_node(sink)?;
//! assert!(future.wait(&mut model, Duration::from_secs(5)));
//! let value = model.node_data(sink, PortId(1))?;
//! assert_eq!(value.and_then(|v| v.value::<i64>().copied()), Some(42));
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

mod entry;
mod future;
mod scheduler;

#[cfg(test)]
mod scheduler_test;

pub use entry::{PortEntry, PortState};
pub use future::{FutureEvaluated, FutureStatus, TargetState};

use crate::config::ExecutionConfig;
use crate::data::NodeData;
use crate::error::ExecutionError;
use crate::event::{EventBus, ExecEvent, GraphEvent, NodeEvalState};
use crate::executor::{Completion, ParallelExecutor, SequentialExecutor, WorkerPool};
use crate::graph::Graph;
use crate::ids::{ModelId, NodeUuid, PortId};
use crate::node::{EvalMode, Node, NodeRole};
use crate::sync::Synchronization;
use entry::NodeEntry;
use std::collections::{HashMap, HashSet, VecDeque};
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace};

type Callback = Box<dyn FnOnce(bool) + Send + 'static>;

/// Evaluation engine of one root graph.
pub struct ExecutionModel {
  id: ModelId,
  graph: Graph,
  config: ExecutionConfig,
  entries: HashMap<NodeUuid, NodeEntry>,
  targets: HashSet<NodeUuid>,
  auto_nodes: HashSet<NodeUuid>,
  auto_graphs: HashSet<Option<NodeUuid>>,
  pending: HashSet<NodeUuid>,
  queue: VecDeque<NodeUuid>,
  evaluating: HashMap<NodeUuid, EvalMode>,
  sequential: SequentialExecutor,
  parallel: ParallelExecutor,
  sync: Arc<Synchronization>,
  wake: watch::Receiver<u64>,
  completions: mpsc::UnboundedReceiver<Completion>,
  inbox: VecDeque<Completion>,
  graph_events: mpsc::UnboundedReceiver<GraphEvent>,
  events: EventBus<ExecEvent>,
  callbacks: Vec<(FutureEvaluated, Callback)>,
  blocked_on_sync: bool,
  stalled: bool,
}

impl ExecutionModel {
  /// Creates a model for `graph` with the default configuration, its own
  /// worker pool and the process-wide [`Synchronization`].
  ///
  /// # Errors
  ///
  /// [`ExecutionError::Runtime`] if the worker pool cannot be started.
  pub fn new(graph: Graph) -> Result<Self, ExecutionError> {
    Self::builder().graph(graph).build()
  }

  /// Creates a model for `graph` with `config`.
  ///
  /// # Errors
  ///
  /// [`ExecutionError::Config`] for an invalid configuration and
  /// [`ExecutionError::Runtime`] if the worker pool cannot be started.
  pub fn with_config(graph: Graph, config: ExecutionConfig) -> Result<Self, ExecutionError> {
    Self::builder().graph(graph).config(config).build()
  }

  /// Starts a builder.
  pub fn builder() -> ExecutionModelBuilder {
    ExecutionModelBuilder::default()
  }

  fn from_parts(
    graph: Graph,
    config: ExecutionConfig,
    pool: Arc<WorkerPool>,
    sync: Arc<Synchronization>,
  ) -> Self {
    let (completions_tx, completions) = mpsc::unbounded_channel();
    let graph_events = graph.subscribe();
    let wake = sync.subscribe();
    let mut model = Self {
      id: ModelId::next(),
      graph,
      config,
      entries: HashMap::new(),
      targets: HashSet::new(),
      auto_nodes: HashSet::new(),
      auto_graphs: HashSet::new(),
      pending: HashSet::new(),
      queue: VecDeque::new(),
      evaluating: HashMap::new(),
      sequential: SequentialExecutor,
      parallel: ParallelExecutor::new(pool, completions_tx),
      sync,
      wake,
      completions,
      inbox: VecDeque::new(),
      graph_events,
      events: EventBus::new(),
      callbacks: Vec::new(),
      blocked_on_sync: false,
      stalled: false,
    };
    model.sync_entries();
    debug!(model = %model.id, nodes = model.entries.len(), "execution model created");
    model
  }

  /// Process-unique id of this model.
  pub fn id(&self) -> ModelId {
    self.id
  }

  /// The root graph.
  ///
  /// A scope opened with [`Graph::begin_modification`] through this reference
  /// is picked up by the next [`ExecutionModel::process_events`] once closed;
  /// prefer [`ExecutionModel::modify`], which reschedules on drop.
  pub fn graph(&self) -> &Graph {
    &self.graph
  }

  /// Opens a modification scope on the root graph.
  ///
  /// The returned guard dereferences to the graph. Dispatch is paused while it
  /// lives; dropping it applies the accumulated changes and reschedules.
  pub fn modify(&mut self) -> ModificationScope<'_> {
    self.graph.begin_modification();
    ModificationScope { model: self }
  }

  /// Active configuration.
  pub fn config(&self) -> &ExecutionConfig {
    &self.config
  }

  /// Synchronization object shared with other models.
  pub fn synchronization(&self) -> &Arc<Synchronization> {
    &self.sync
  }

  /// Worker pool background nodes run on.
  pub fn worker_pool(&self) -> &Arc<WorkerPool> {
    self.parallel.pool()
  }

  /// Subscribes to evaluation events.
  pub fn subscribe(&self) -> mpsc::UnboundedReceiver<ExecEvent> {
    self.events.subscribe()
  }

  // ==========================================================================
  // Targets
  // ==========================================================================

  /// Evaluates node `uuid` once. `Invalid` nodes among its dependencies are
  /// reset so they are retried.
  ///
  /// # Errors
  ///
  /// [`ExecutionError::UnknownNode`].
  pub fn evaluate_node(&mut self, uuid: NodeUuid) -> Result<FutureEvaluated, ExecutionError> {
    self.reconcile();
    self.require(uuid)?;
    self.reset_failed([uuid]);
    self.targets.insert(uuid);
    debug!(node = %uuid, "evaluation requested");
    self.reschedule();
    Ok(FutureEvaluated::new(self.id, vec![(uuid, TargetState::Valid)]))
  }

  /// Evaluates every active node of the graph owned by group `group` once
  /// (`None` for the root graph).
  ///
  /// # Errors
  ///
  /// [`ExecutionError::UnknownNode`] if `group` does not name a group.
  pub fn evaluate_graph(&mut self, group: Option<NodeUuid>) -> Result<FutureEvaluated, ExecutionError> {
    self.reconcile();
    let nodes = self.graph_members(group)?;
    self.reset_failed(nodes.iter().copied());
    self.targets.extend(nodes.iter().copied());
    debug!(group = ?group, nodes = nodes.len(), "graph evaluation requested");
    self.reschedule();
    Ok(FutureEvaluated::new(
      self.id,
      nodes
        .into_iter()
        .map(|uuid| (uuid, TargetState::Valid))
        .collect(),
    ))
  }

  /// Keeps node `uuid` evaluated until [`ExecutionModel::stop_auto_evaluating_node`].
  ///
  /// # Errors
  ///
  /// [`ExecutionError::UnknownNode`].
  pub fn auto_evaluate_node(&mut self, uuid: NodeUuid) -> Result<(), ExecutionError> {
    self.reconcile();
    self.require(uuid)?;
    self.auto_nodes.insert(uuid);
    debug!(node = %uuid, "auto evaluation enabled");
    self.reschedule();
    Ok(())
  }

  /// Stops keeping node `uuid` evaluated.
  pub fn stop_auto_evaluating_node(&mut self, uuid: NodeUuid) {
    if self.auto_nodes.remove(&uuid) {
      debug!(node = %uuid, "auto evaluation disabled");
      self.reschedule();
    }
  }

  /// Keeps every active node of the graph owned by `group` evaluated, including
  /// nodes appended later.
  ///
  /// # Errors
  ///
  /// [`ExecutionError::UnknownNode`] if `group` does not name a group.
  pub fn auto_evaluate_graph(&mut self, group: Option<NodeUuid>) -> Result<(), ExecutionError> {
    self.reconcile();
    self.graph_members(group)?;
    self.auto_graphs.insert(group);
    debug!(group = ?group, "graph auto evaluation enabled");
    self.reschedule();
    Ok(())
  }

  /// Stops keeping the graph owned by `group` evaluated.
  pub fn stop_auto_evaluating_graph(&mut self, group: Option<NodeUuid>) {
    if self.auto_graphs.remove(&group) {
      debug!(group = ?group, "graph auto evaluation disabled");
      self.reschedule();
    }
  }

  /// Returns `true` if node `uuid` is kept evaluated, directly or through its graph.
  pub fn is_auto_evaluating(&self, uuid: NodeUuid) -> bool {
    if self.auto_nodes.contains(&uuid) {
      return true;
    }
    let parent = self.graph.global_model().scope(uuid).map(|scope| scope.parent);
    parent.is_some_and(|parent| self.auto_graphs.contains(&parent))
  }

  // ==========================================================================
  // State and data
  // ==========================================================================

  /// Marks node `uuid` and everything downstream of it outdated.
  ///
  /// # Errors
  ///
  /// [`ExecutionError::UnknownNode`].
  pub fn invalidate_node(&mut self, uuid: NodeUuid) -> Result<(), ExecutionError> {
    self.reconcile();
    self.require(uuid)?;
    self.invalidate_input_side(uuid);
    self.reschedule();
    Ok(())
  }

  /// Evaluation state of node `uuid`.
  ///
  /// An outdated node reports [`NodeEvalState::Paused`] while it is inactive,
  /// or while it waits for evaluation during a modification scope.
  ///
  /// # Errors
  ///
  /// [`ExecutionError::UnknownNode`].
  pub fn node_eval_state(&self, uuid: NodeUuid) -> Result<NodeEvalState, ExecutionError> {
    let entry = self.entries.get(&uuid).ok_or(ExecutionError::UnknownNode(uuid))?;
    if entry.state != NodeEvalState::Outdated {
      return Ok(entry.state);
    }
    let active = self.graph.find_node_by_uuid(uuid).is_some_and(Node::is_active);
    let suspended = self.graph.is_modifying() && self.pending.contains(&uuid);
    Ok(if !active || suspended {
      NodeEvalState::Paused
    } else {
      NodeEvalState::Outdated
    })
  }

  /// Cached value of port `port` of node `uuid`.
  ///
  /// # Errors
  ///
  /// [`ExecutionError::UnknownNode`] or [`ExecutionError::UnknownPort`].
  pub fn node_data(&self, uuid: NodeUuid, port: PortId) -> Result<Option<NodeData>, ExecutionError> {
    let entry = self.entries.get(&uuid).ok_or(ExecutionError::UnknownNode(uuid))?;
    entry
      .port(port)
      .map(|entry| entry.data.clone())
      .ok_or(ExecutionError::UnknownPort { node: uuid, port })
  }

  /// Freshness of port `port` of node `uuid`.
  ///
  /// # Errors
  ///
  /// [`ExecutionError::UnknownNode`] or [`ExecutionError::UnknownPort`].
  pub fn port_state(&self, uuid: NodeUuid, port: PortId) -> Result<PortState, ExecutionError> {
    let entry = self.entries.get(&uuid).ok_or(ExecutionError::UnknownNode(uuid))?;
    entry
      .port(port)
      .map(|entry| entry.state)
      .ok_or(ExecutionError::UnknownPort { node: uuid, port })
  }

  /// Writes `data` to port `port` of node `uuid`.
  ///
  /// On an output port the value is committed as up to date and copied to
  /// every connected input; downstream nodes become outdated. A node whose
  /// outputs are then all up to date becomes `Valid`. On an input port the
  /// value is stored and the node becomes outdated.
  ///
  /// # Errors
  ///
  /// [`ExecutionError::UnknownNode`] or [`ExecutionError::UnknownPort`].
  pub fn set_node_data(
    &mut self,
    uuid: NodeUuid,
    port: PortId,
    data: Option<NodeData>,
  ) -> Result<(), ExecutionError> {
    self.reconcile();
    let entry = self
      .entries
      .get_mut(&uuid)
      .ok_or(ExecutionError::UnknownNode(uuid))?;
    if let Some(output) = entry.output_mut(port) {
      output.data = data.clone();
      output.state = PortState::Valid;
      let complete = entry.state != NodeEvalState::Evaluating && entry.all_outputs_valid();
      trace!(node = %uuid, port = %port, "output written");
      if complete {
        self.set_state(uuid, NodeEvalState::Valid);
      }
      self.propagate_output(uuid, port, data);
    } else if let Some(input) = entry.input_mut(port) {
      input.data = data;
      input.state = PortState::Valid;
      trace!(node = %uuid, port = %port, "input written");
      self.invalidate_input_side(uuid);
    } else {
      return Err(ExecutionError::UnknownPort { node: uuid, port });
    }
    self.reschedule();
    Ok(())
  }

  /// Resets every node to `Outdated` and drops all cached values.
  pub fn rebuild(&mut self) {
    self.reconcile();
    self.entries.clear();
    self.sync_entries();
    debug!(model = %self.id, nodes = self.entries.len(), "execution model rebuilt");
    self.reschedule();
  }

  // ==========================================================================
  // Owner loop
  // ==========================================================================

  /// Applies graph changes, commits finished evaluations and dispatches what
  /// became ready. Does nothing while a modification scope is open.
  pub fn process_events(&mut self) {
    if self.graph.is_modifying() {
      return;
    }
    self.reconcile();
    while let Some(completion) = self.inbox.pop_front() {
      self.commit(completion);
    }
    while let Ok(completion) = self.completions.try_recv() {
      self.commit(completion);
    }
    if self.wake.has_changed().unwrap_or(false) {
      self.wake.borrow_and_update();
    }
    self.reschedule();
    self.fire_callbacks();
  }

  /// Processes events until nothing is evaluating and every target is either
  /// satisfied or stalled. Returns `false` on timeout.
  pub fn run_until_idle(&mut self, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
      self.process_events();
      if self.evaluating.is_empty() && (self.pending.is_empty() || self.stalled) {
        return true;
      }
      let now = Instant::now();
      if now >= deadline {
        return false;
      }
      self.wait_for_activity((deadline - now).min(self.config.idle_poll_interval));
    }
  }

  /// Returns `true` if targets are pending but no node can be dispatched.
  pub fn is_stalled(&self) -> bool {
    self.stalled
  }

  /// Nodes of the target closure still waiting for evaluation, sorted.
  pub fn pending_nodes(&self) -> Vec<NodeUuid> {
    let mut pending: Vec<NodeUuid> = self.pending.iter().copied().collect();
    pending.sort();
    pending
  }

  /// Nodes currently evaluating, sorted.
  pub fn evaluating_nodes(&self) -> Vec<NodeUuid> {
    let mut evaluating: Vec<NodeUuid> = self.evaluating.keys().copied().collect();
    evaluating.sort();
    evaluating
  }

  /// Blocks until a completion arrives, another model releases a slot, or
  /// `timeout` elapses.
  pub(crate) fn wait_for_activity(&mut self, timeout: Duration) {
    let pool = Arc::clone(self.parallel.pool());
    let completions = &mut self.completions;
    let wake = &mut self.wake;
    let received = pool.block_on(async {
      tokio::select! {
        completion = completions.recv() => completion,
        _ = wake.changed() => None,
        _ = tokio::time::sleep(timeout) => None,
      }
    });
    if let Some(completion) = received {
      self.inbox.push_back(completion);
    }
  }

  pub(crate) fn register_callback(&mut self, future: FutureEvaluated, callback: Callback) {
    self.callbacks.push((future, callback));
  }

  fn fire_callbacks(&mut self) {
    let callbacks = std::mem::take(&mut self.callbacks);
    for (future, callback) in callbacks {
      match future.status(self) {
        FutureStatus::Pending => self.callbacks.push((future, callback)),
        status => callback(status == FutureStatus::Succeeded),
      }
    }
  }

  fn require(&self, uuid: NodeUuid) -> Result<(), ExecutionError> {
    if self.entries.contains_key(&uuid) {
      Ok(())
    } else {
      Err(ExecutionError::UnknownNode(uuid))
    }
  }

  /// Active nodes held by the graph owned by `group`.
  fn graph_members(&self, group: Option<NodeUuid>) -> Result<Vec<NodeUuid>, ExecutionError> {
    let members = {
      let global = self.graph.global_model();
      if let Some(group) = group {
        let is_group = global
          .scope(group)
          .is_some_and(|scope| scope.role == NodeRole::Group);
        if !is_group {
          return Err(ExecutionError::UnknownNode(group));
        }
      }
      global.nodes_in(group)
    };
    Ok(
      members
        .into_iter()
        .filter(|uuid| self.graph.find_node_by_uuid(*uuid).is_some_and(Node::is_active))
        .collect(),
    )
  }
}

impl Drop for ExecutionModel {
  fn drop(&mut self) {
    for node in self.evaluating.keys() {
      trace!(node = %node, "abandoning evaluation, its slot is held until the job returns");
    }
  }
}

/// Builder for [`ExecutionModel`].
#[derive(Default)]
pub struct ExecutionModelBuilder {
  graph: Option<Graph>,
  config: ExecutionConfig,
  pool: Option<Arc<WorkerPool>>,
  sync: Option<Arc<Synchronization>>,
}

impl ExecutionModelBuilder {
  /// Root graph of the model (default: an empty graph).
  pub fn graph(mut self, graph: Graph) -> Self {
    self.graph = Some(graph);
    self
  }

  /// Configuration of the model.
  pub fn config(mut self, config: ExecutionConfig) -> Self {
    self.config = config;
    self
  }

  /// Shares an existing worker pool instead of starting one.
  pub fn worker_pool(mut self, pool: Arc<WorkerPool>) -> Self {
    self.pool = Some(pool);
    self
  }

  /// Uses `sync` instead of the process-wide synchronization object.
  pub fn synchronization(mut self, sync: Arc<Synchronization>) -> Self {
    self.sync = Some(sync);
    self
  }

  /// Builds the model.
  ///
  /// # Errors
  ///
  /// [`ExecutionError::Config`] for an invalid configuration and
  /// [`ExecutionError::Runtime`] if the worker pool cannot be started.
  pub fn build(self) -> Result<ExecutionModel, ExecutionError> {
    self.config.validate()?;
    let pool = match self.pool {
      Some(pool) => pool,
      None => Arc::new(WorkerPool::new(&self.config)?),
    };
    let sync = self.sync.unwrap_or_else(Synchronization::global);
    Ok(ExecutionModel::from_parts(
      self.graph.unwrap_or_default(),
      self.config,
      pool,
      sync,
    ))
  }
}

/// Modification scope on the root graph of an [`ExecutionModel`].
///
/// Dereferences to the [`Graph`]. Dropping the scope closes it; once no scope
/// is open the model applies the changes and reschedules.
pub struct ModificationScope<'a> {
  model: &'a mut ExecutionModel,
}

impl Deref for ModificationScope<'_> {
  type Target = Graph;

  fn deref(&self) -> &Graph {
    &self.model.graph
  }
}

impl DerefMut for ModificationScope<'_> {
  fn deref_mut(&mut self) -> &mut Graph {
    &mut self.model.graph
  }
}

impl Drop for ModificationScope<'_> {
  fn drop(&mut self) {
    self.model.graph.end_modification();
    if !self.model.graph.is_modifying() {
      self.model.process_events();
    }
  }
}
