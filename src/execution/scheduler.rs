//! Dependency-ordered dispatch, invalidation and commit.
//!
//! Everything here runs on the thread owning the [`ExecutionModel`]. The
//! global model's read lock is only ever held for the duration of a single
//! lookup, never across a call back into the [`Graph`](crate::Graph).

use super::ExecutionModel;
use super::entry::{NodeEntry, PortState};
use crate::connection_model::Edge;
use crate::data::NodeData;
use crate::event::{ExecEvent, GraphEvent, NodeEvalState};
use crate::executor::{Completion, Dispatch, Executor, NodeSnapshot};
use crate::ids::{NodeUuid, PortId};
use crate::node::{EvalMode, NodeBehavior, NodeKind, NodeRole, PassThrough};
use crate::port::PortDirection;
use std::collections::{HashSet, VecDeque};
use tracing::{debug, error, trace, warn};

impl ExecutionModel {
  // ==========================================================================
  // Graph changes
  // ==========================================================================

  /// Applies queued graph notifications. Deferred while the graph is modified.
  pub(super) fn reconcile(&mut self) {
    if self.graph.is_modifying() {
      return;
    }
    let mut events = Vec::new();
    while let Ok(event) = self.graph_events.try_recv() {
      events.push(event);
    }
    if events.is_empty() {
      return;
    }
    trace!(events = events.len(), "reconciling graph changes");
    self.sync_entries();
    for event in events {
      self.react(event);
    }
  }

  /// Creates entries for new nodes, drops entries and targets of deleted
  /// nodes and realigns port lists.
  pub(super) fn sync_entries(&mut self) {
    let uuids = self.graph.global_model().uuids();
    let live: HashSet<NodeUuid> = uuids.iter().copied().collect();
    self.entries.retain(|uuid, _| live.contains(uuid));
    self.targets.retain(|uuid| live.contains(uuid));
    self.auto_nodes.retain(|uuid| live.contains(uuid));
    self
      .auto_graphs
      .retain(|group| group.is_none_or(|group| live.contains(&group)));

    for uuid in uuids {
      let Some(node) = self.graph.find_node_by_uuid(uuid) else {
        error!(node = %uuid, "global model names a node missing from the hierarchy");
        continue;
      };
      match self.entries.get_mut(&uuid) {
        Some(entry) => {
          if entry.sync_ports(node) {
            trace!(node = %uuid, "port entries realigned");
          }
        }
        None => {
          self.entries.insert(uuid, NodeEntry::new(node));
        }
      }
    }
  }

  fn react(&mut self, event: GraphEvent) {
    match event {
      GraphEvent::ConnectionAppended { connection } => {
        let target = connection.target_node;
        self.invalidate_input_side(target);
        let edge = Edge::data(
          connection.source_node,
          connection.source_port,
          target,
          connection.target_port,
        );
        let source = self.entries.get(&connection.source_node);
        let source_failed = source.is_some_and(|entry| entry.state == NodeEvalState::Invalid);
        let cached = source
          .and_then(|entry| entry.output(connection.source_port))
          .map(|output| (output.data.clone(), output.state));
        if let Some((data, state)) = cached {
          let value = self.carry(&edge, data);
          if let Some(input) = self
            .entries
            .get_mut(&target)
            .and_then(|entry| entry.input_mut(connection.target_port))
          {
            input.data = value;
            input.state = state;
          }
        }
        if source_failed {
          self.propagate_failure(connection.source_node);
        }
      }
      GraphEvent::ConnectionDeleted { connection } => {
        let target = connection.target_node;
        if let Some(input) = self
          .entries
          .get_mut(&target)
          .and_then(|entry| entry.input_mut(connection.target_port))
        {
          input.data = None;
          input.state = PortState::Outdated;
        }
        self.invalidate_input_side(target);
      }
      GraphEvent::PortInserted { node, .. } | GraphEvent::PortDeleted { node, .. } => {
        self.invalidate_input_side(node);
      }
      GraphEvent::NodeMoved { node, .. } => self.invalidate(node),
      event => trace!(?event, "graph event without effect on evaluation state"),
    }
  }

  // ==========================================================================
  // State propagation
  // ==========================================================================

  pub(super) fn set_state(&mut self, uuid: NodeUuid, state: NodeEvalState) {
    let Some(entry) = self.entries.get_mut(&uuid) else {
      return;
    };
    if entry.state == state {
      return;
    }
    entry.state = state;
    trace!(node = %uuid, ?state, "evaluation state changed");
    self
      .events
      .publish(ExecEvent::NodeEvalStateChanged { node: uuid, state });
  }

  /// Invalidates `uuid` and, for a group, its input provider.
  pub(super) fn invalidate_input_side(&mut self, uuid: NodeUuid) {
    self.invalidate(uuid);
    let boundary = self.graph.global_model().boundary(uuid);
    if let Some(boundary) = boundary {
      self.invalidate(boundary.input);
    }
  }

  /// Marks `root` and everything reachable from it outdated.
  ///
  /// The walk stops at nodes that are already outdated with no valid output.
  /// A node evaluating right now is flagged stale so its result is dropped.
  pub(super) fn invalidate(&mut self, root: NodeUuid) {
    let mut visited = HashSet::new();
    let mut stack = vec![root];
    while let Some(uuid) = stack.pop() {
      if !visited.insert(uuid) {
        continue;
      }
      let Some(entry) = self.entries.get_mut(&uuid) else {
        continue;
      };
      let settled =
        entry.state == NodeEvalState::Outdated && !entry.outputs.iter().any(|output| output.is_valid());
      if settled && uuid != root {
        continue;
      }
      let previous = entry.state;
      match previous {
        NodeEvalState::Evaluating => {
          entry.stale = true;
          entry.poisoned = false;
        }
        NodeEvalState::Valid | NodeEvalState::Invalid => entry.state = NodeEvalState::Outdated,
        NodeEvalState::Outdated | NodeEvalState::Paused => {}
      }
      entry.outdate_outputs();
      if entry.state != previous {
        trace!(node = %uuid, "invalidated");
        self.events.publish(ExecEvent::NodeEvalStateChanged {
          node: uuid,
          state: NodeEvalState::Outdated,
        });
      }

      let successors: Vec<Edge<NodeUuid>> = self.graph.global_model().connections().successors(uuid).to_vec();
      for edge in successors {
        if edge.is_data()
          && let Some(input) = self
            .entries
            .get_mut(&edge.target)
            .and_then(|entry| entry.input_mut(edge.target_port))
        {
          input.state = PortState::Outdated;
        }
        stack.push(edge.target);
      }
    }
  }

  /// Copies a committed output value along every data edge leaving it and
  /// invalidates everything downstream.
  pub(super) fn propagate_output(&mut self, uuid: NodeUuid, port: PortId, data: Option<NodeData>) {
    let edges: Vec<Edge<NodeUuid>> = self
      .graph
      .global_model()
      .connections()
      .successors(uuid)
      .iter()
      .filter(|edge| edge.source_port == port)
      .copied()
      .collect();
    for edge in edges {
      self.invalidate(edge.target);
      if !edge.is_data() {
        continue;
      }
      let value = self.carry(&edge, data.clone());
      if let Some(input) = self
        .entries
        .get_mut(&edge.target)
        .and_then(|entry| entry.input_mut(edge.target_port))
      {
        trace!(node = %edge.target, port = %edge.target_port, "input updated");
        input.data = value;
        input.state = PortState::Valid;
      }
    }
  }

  /// Marks everything downstream of the failed node `root` invalid.
  fn propagate_failure(&mut self, root: NodeUuid) {
    let mut visited = HashSet::from([root]);
    let mut queue: VecDeque<Edge<NodeUuid>> =
      self.graph.global_model().connections().successors(root).iter().copied().collect();
    while let Some(edge) = queue.pop_front() {
      let uuid = edge.target;
      if edge.is_data()
        && let Some(input) = self
          .entries
          .get_mut(&uuid)
          .and_then(|entry| entry.input_mut(edge.target_port))
      {
        input.state = PortState::Outdated;
      }
      if !visited.insert(uuid) {
        continue;
      }
      let Some(entry) = self.entries.get_mut(&uuid) else {
        continue;
      };
      if entry.state == NodeEvalState::Evaluating {
        entry.stale = true;
        entry.poisoned = true;
      } else {
        entry.outdate_outputs();
        self.set_state(uuid, NodeEvalState::Invalid);
      }
      queue.extend(self.graph.global_model().connections().successors(uuid).iter().copied());
    }
  }

  /// Gives failed nodes of the closure of `roots` another chance.
  pub(super) fn reset_failed(&mut self, roots: impl IntoIterator<Item = NodeUuid>) {
    let closure = self.closure(roots);
    let mut failed: Vec<NodeUuid> = closure
      .into_iter()
      .filter(|uuid| {
        self
          .entries
          .get(uuid)
          .is_some_and(|entry| entry.state == NodeEvalState::Invalid)
      })
      .collect();
    failed.sort();
    for uuid in failed {
      debug!(node = %uuid, "retrying failed node");
      self.invalidate(uuid);
    }
  }

  /// Converts `data` from the source port type of `edge` to its target port type.
  fn carry(&self, edge: &Edge<NodeUuid>, data: Option<NodeData>) -> Option<NodeData> {
    let data = data?;
    let source = self.graph.find_node_by_uuid(edge.source)?.port(edge.source_port)?;
    let target = self.graph.find_node_by_uuid(edge.target)?.port(edge.target_port)?;
    let converted = self.graph.convert(&source.type_id, &target.type_id, &data);
    if converted.is_none() {
      warn!(
        node = %edge.target,
        port = %edge.target_port,
        from = %source.type_id,
        to = %target.type_id,
        "value rejected by type conversion"
      );
    }
    converted
  }

  // ==========================================================================
  // Commit
  // ==========================================================================

  /// Applies the result of one evaluation.
  pub(super) fn commit(&mut self, completion: Completion) {
    let Completion { node, result, slot, .. } = completion;
    drop(slot);
    self.evaluating.remove(&node);
    let Some(entry) = self.entries.get_mut(&node) else {
      debug!(node = %node, "dropping result of deleted node");
      return;
    };
    if entry.state != NodeEvalState::Evaluating {
      trace!(node = %node, state = ?entry.state, "dropping unexpected result");
      return;
    }
    if entry.stale {
      let state = if entry.poisoned {
        NodeEvalState::Invalid
      } else {
        NodeEvalState::Outdated
      };
      entry.stale = false;
      entry.poisoned = false;
      debug!(node = %node, ?state, "discarding stale result");
      self.set_state(node, state);
      return;
    }

    match result {
      Ok(outputs) => {
        for (port, data) in &outputs {
          if let Some(output) = entry.output_mut(*port) {
            output.data = data.clone();
            output.state = PortState::Valid;
          }
        }
        debug!(node = %node, outputs = outputs.len(), "node evaluated");
        self.set_state(node, NodeEvalState::Valid);
        self.events.publish(ExecEvent::NodeEvaluated { node });
        for (port, data) in outputs {
          self.propagate_output(node, port, data);
        }
      }
      Err(err) => {
        entry.outdate_outputs();
        warn!(node = %node, error = %err, "node evaluation failed");
        self.set_state(node, NodeEvalState::Invalid);
        self.events.publish(ExecEvent::NodeEvaluationFailed {
          node,
          reason: err.to_string(),
        });
        self.propagate_failure(node);
      }
    }
  }

  // ==========================================================================
  // Scheduling
  // ==========================================================================

  /// Recomputes the queue and dispatches until no synchronous evaluation
  /// changes the picture any more.
  pub(super) fn reschedule(&mut self) {
    if self.graph.is_modifying() {
      self.queue.clear();
      return;
    }
    loop {
      self.retire_targets();
      self.rebuild_queue();
      if !self.evaluate_next_in_queue() {
        break;
      }
    }
    self.detect_stall();
  }

  fn retire_targets(&mut self) {
    if self.targets.is_empty() {
      return;
    }
    let entries = &self.entries;
    self
      .targets
      .retain(|uuid| entries.get(uuid).is_some_and(|entry| !entry.state.is_terminal()));
    if self.targets.is_empty() {
      debug!(model = %self.id, "targets satisfied");
      self.events.publish(ExecEvent::TargetsSatisfied);
    }
  }

  /// Single-shot targets, auto nodes and the active members of auto graphs.
  fn roots(&self) -> Vec<NodeUuid> {
    let mut roots: Vec<NodeUuid> = self.targets.iter().chain(&self.auto_nodes).copied().collect();
    if !self.auto_graphs.is_empty() {
      let members: Vec<NodeUuid> = {
        let global = self.graph.global_model();
        self
          .auto_graphs
          .iter()
          .flat_map(|group| global.nodes_in(*group))
          .collect()
      };
      roots.extend(
        members
          .into_iter()
          .filter(|uuid| self.graph.find_node_by_uuid(*uuid).is_some_and(|node| node.is_active())),
      );
    }
    roots
  }

  /// Dependency closure of `roots`. A group pulls in its output provider even
  /// when no output port links the two.
  fn closure(&self, roots: impl IntoIterator<Item = NodeUuid>) -> HashSet<NodeUuid> {
    let global = self.graph.global_model();
    let mut roots: Vec<NodeUuid> = roots.into_iter().collect();
    loop {
      let closure = global.connections().dependency_closure(roots.iter().copied());
      let missing: Vec<NodeUuid> = closure
        .iter()
        .filter_map(|uuid| global.boundary(*uuid))
        .map(|boundary| boundary.output)
        .filter(|provider| !closure.contains(provider))
        .collect();
      if missing.is_empty() {
        return closure;
      }
      roots.extend(missing);
    }
  }

  fn rebuild_queue(&mut self) {
    self.queue.clear();
    self.blocked_on_sync = false;
    let closure = self.closure(self.roots());
    let entries = &self.entries;
    self.pending = closure
      .into_iter()
      .filter(|uuid| {
        entries.get(uuid).is_some_and(|entry| {
          matches!(entry.state, NodeEvalState::Outdated | NodeEvalState::Evaluating)
        })
      })
      .collect();
    if self.pending.is_empty() {
      return;
    }

    let sorted = self.graph.global_model().connections().topological_sort(&self.pending);
    let order = match sorted {
      Ok(order) => order,
      Err(rest) => {
        error!(nodes = rest.len(), "global connection model is cyclic");
        return;
      }
    };
    for uuid in order {
      if self.is_dispatchable(uuid) {
        self.queue.push_back(uuid);
      }
    }
    trace!(pending = self.pending.len(), queued = self.queue.len(), "queue rebuilt");
  }

  fn is_dispatchable(&self, uuid: NodeUuid) -> bool {
    let outdated = self
      .entries
      .get(&uuid)
      .is_some_and(|entry| entry.state == NodeEvalState::Outdated);
    let active = self.graph.find_node_by_uuid(uuid).is_some_and(|node| node.is_active());
    outdated && active && self.is_ready(uuid)
  }

  /// Returns `true` if every input `uuid` needs is available.
  fn is_ready(&self, uuid: NodeUuid) -> bool {
    let (scope, boundary) = {
      let global = self.graph.global_model();
      (global.scope(uuid), global.boundary(uuid))
    };
    let Some(scope) = scope else {
      return false;
    };
    match scope.role {
      NodeRole::Group => boundary
        .and_then(|boundary| self.entries.get(&boundary.output))
        .is_some_and(|entry| entry.state == NodeEvalState::Valid),
      NodeRole::InputProvider => scope.parent.is_some_and(|group| self.inputs_ready(group, false)),
      NodeRole::OutputProvider => self.inputs_ready(uuid, true),
      NodeRole::Regular => self.inputs_ready(uuid, false),
    }
  }

  /// A connected input must be up to date, and carry data unless optional.
  /// An unconnected required input must have been given data explicitly.
  /// `lenient` treats every port as optional.
  fn inputs_ready(&self, uuid: NodeUuid, lenient: bool) -> bool {
    let (Some(node), Some(entry)) = (self.graph.find_node_by_uuid(uuid), self.entries.get(&uuid)) else {
      return false;
    };
    node.ports(PortDirection::In).iter().all(|port| {
      let Some(input) = entry.input(port.id) else {
        return false;
      };
      let optional = port.optional || lenient;
      let connected = self
        .graph
        .global_model()
        .connections()
        .incoming(uuid, port.id)
        .is_some();
      if connected {
        input.is_valid() && (optional || input.data.is_some())
      } else {
        optional || (input.is_valid() && input.data.is_some())
      }
    })
  }

  fn eval_mode_of(&self, uuid: NodeUuid) -> EvalMode {
    self
      .graph
      .find_node_by_uuid(uuid)
      .and_then(|node| node.explicit_eval_mode())
      .unwrap_or(self.config.default_eval_mode)
  }

  /// Dispatches queued nodes in order. Returns `true` if a synchronous
  /// evaluation was committed, after which the queue must be rebuilt.
  fn evaluate_next_in_queue(&mut self) -> bool {
    while let Some(uuid) = self.queue.pop_front() {
      if !self.is_dispatchable(uuid) {
        trace!(node = %uuid, "no longer dispatchable");
        continue;
      }
      let mode = self.eval_mode_of(uuid);
      let exclusive = mode == EvalMode::Exclusive;
      let Some(slot) = self.sync.acquire(self.id, exclusive) else {
        debug!(node = %uuid, ?mode, "dispatch deferred by exclusivity");
        self.blocked_on_sync = true;
        self.queue.clear();
        return false;
      };
      let Some(mut snapshot) = self.snapshot(uuid, mode) else {
        error!(node = %uuid, "could not snapshot queued node");
        continue;
      };
      snapshot.slot = Some(slot);
      self.evaluating.insert(uuid, mode);
      if let Some(entry) = self.entries.get_mut(&uuid) {
        entry.stale = false;
        entry.poisoned = false;
      }
      self.set_state(uuid, NodeEvalState::Evaluating);
      debug!(node = %uuid, ?mode, "dispatching");

      let dispatch = if mode.is_background() {
        self.parallel.launch(snapshot)
      } else {
        self.sequential.launch(snapshot)
      };
      if let Dispatch::Completed(completion) = dispatch {
        self.commit(completion);
        return true;
      }
    }
    false
  }

  /// Copies what an evaluation of `uuid` needs out of the live model.
  ///
  /// Groups read the values collected by their output provider, input
  /// providers the values arriving at their group.
  fn snapshot(&self, uuid: NodeUuid, mode: EvalMode) -> Option<NodeSnapshot> {
    let node = self.graph.find_node_by_uuid(uuid)?;
    let entry = self.entries.get(&uuid)?;
    let (inputs, behavior): (_, Box<dyn NodeBehavior>) = match node.kind() {
      NodeKind::Behavior(behavior) => (entry.input_values(), behavior.clone()),
      NodeKind::Group(_) => {
        let provider = self.graph.global_model().boundary(uuid)?.output;
        (self.entries.get(&provider)?.input_values(), Box::new(PassThrough))
      }
      NodeKind::InputProvider => {
        let group = self.graph.global_model().scope(uuid)?.parent?;
        (self.entries.get(&group)?.input_values(), Box::new(PassThrough))
      }
      NodeKind::OutputProvider => (entry.input_values(), Box::new(PassThrough)),
    };
    Some(NodeSnapshot {
      uuid,
      caption: node.caption().to_string(),
      mode,
      inputs,
      outputs: entry.output_values(),
      behavior,
      slot: None,
    })
  }

  fn detect_stall(&mut self) {
    let stalled = !self.pending.is_empty()
      && self.evaluating.is_empty()
      && self.queue.is_empty()
      && !self.blocked_on_sync;
    if stalled && !self.stalled {
      let pending = self.pending_nodes();
      warn!(model = %self.id, pending = pending.len(), "evaluation stalled");
      self.events.publish(ExecEvent::GraphStalled { pending });
    }
    self.stalled = stalled;
  }

  /// Returns `true` when nothing is evaluating, waiting or queued.
  pub(crate) fn is_idle(&self) -> bool {
    self.evaluating.is_empty() && self.pending.is_empty() && self.inbox.is_empty()
  }
}
