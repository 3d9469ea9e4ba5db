//! # Graph
//!
//! A [`Graph`] owns a set of [`Node`]s and the connections between their ports,
//! and enforces the structural invariants every other part of the crate relies
//! on:
//!
//! - a connection leads from an output port to an input port of two distinct
//!   nodes whose port types are convertible;
//! - an input port has at most one incoming connection;
//! - the connections of the whole hierarchy, flattened across group
//!   boundaries, form a DAG.
//!
//! ## Two scopes, one invariant
//!
//! Every graph level keeps a *local* [`ConnectionModel`] keyed by [`NodeId`].
//! All graphs of a hierarchy additionally share one [`GlobalModel`] keyed by
//! [`NodeUuid`], which flattens group boundaries so dependencies can be followed
//! without walking the tree. Both are only ever changed together, by the
//! operations of this module; nothing else mutates either one.
//!
//! ## Groups
//!
//! A group node `G` owns a nested graph holding two synthetic provider nodes:
//! the *input provider* whose output ports mirror `G`'s input ports, and the
//! *output provider* whose input ports mirror `G`'s output ports. Port ids are
//! identical on both sides. In the global model:
//!
//! - a connection `(A, a) -> (G, b)` is a data edge plus a boundary edge
//!   `(A, a) -> (input provider, b)`;
//! - every output port `y` of `G` has a boundary edge
//!   `(output provider, y) -> (G, y)`.
//!
//! ## Example
//!
//! ```rust
//! use nodeweave::{ConnectionId, Graph, Node, NodeIdPolicy, Port, from_fn};
//!
//! let mut graph = Graph::new();
//! let source = graph
//!   .append_node(
//!     Node::new("source", from_fn(|_, _| Ok(None))).with_output(Port::new("int", "out")),
//!     NodeIdPolicy::Update,
//!   )?
//!   .id();
//! let sink = graph
//!   .append_node(
//!     Node::new("sink", from_fn(|_, _| Ok(None))).with_input(Port::new("int", "in")),
//!     NodeIdPolicy::Update,
//!   )?
//!   .id();
//!
//! let connection = ConnectionId::new(source, nodeweave::PortId(0), sink, nodeweave::PortId(0));
//! graph.append_connection(connection)?;
//! assert_eq!(graph.connection_ids(), vec![connection]);
//! # Ok::<(), nodeweave::GraphError>(())
//! ```

use crate::arena::{Arena, Handle};
use crate::connection::Connection;
use crate::connection_model::{ConnectionModel, Edge};
use crate::data::NodeData;
use crate::error::GraphError;
use crate::event::{EventBus, GraphEvent};
use crate::ids::{ConnectionId, ConnectionUuid, NodeId, NodeUuid, PortId};
use crate::node::{Node, NodeRole};
use crate::port::{Port, PortDirection, TypeConversions};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::mpsc;
use tracing::{debug, error, trace, warn};

/// How [`Graph::append_node`] treats a requested node id that is already taken.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum NodeIdPolicy {
  /// Reuse the requested id; fail with [`GraphError::DuplicateNodeId`] if it is taken.
  Keep,
  /// Reuse the requested id when free, otherwise assign a new one.
  #[default]
  Update,
}

/// Selects the connections returned by [`Graph::find_connections`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PortQuery {
  /// Every connection of the node.
  All,
  /// Connections on ports of one direction.
  Direction(PortDirection),
  /// Connections on one port.
  Port(PortId),
}

impl From<PortDirection> for PortQuery {
  fn from(direction: PortDirection) -> Self {
    PortQuery::Direction(direction)
  }
}

impl From<PortId> for PortQuery {
  fn from(port: PortId) -> Self {
    PortQuery::Port(port)
  }
}

/// Where a node lives in the hierarchy.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct NodeScope {
  /// Uuid of the group whose nested graph holds the node, `None` at the root.
  pub parent: Option<NodeUuid>,
  /// Structural role of the node.
  pub role: NodeRole,
}

/// The boundary providers of a group.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Boundary {
  /// Input provider uuid.
  pub input: NodeUuid,
  /// Output provider uuid.
  pub output: NodeUuid,
}

/// Connection model of a whole hierarchy, keyed by uuid.
#[derive(Debug, Default)]
pub struct GlobalModel {
  connections: ConnectionModel<NodeUuid>,
  scopes: HashMap<NodeUuid, NodeScope>,
  boundaries: HashMap<NodeUuid, Boundary>,
}

impl GlobalModel {
  /// Flattened adjacency of the hierarchy.
  pub fn connections(&self) -> &ConnectionModel<NodeUuid> {
    &self.connections
  }

  /// Returns `true` if `uuid` names a node of the hierarchy.
  pub fn contains(&self, uuid: NodeUuid) -> bool {
    self.scopes.contains_key(&uuid)
  }

  /// Scope of `uuid`.
  pub fn scope(&self, uuid: NodeUuid) -> Option<NodeScope> {
    self.scopes.get(&uuid).copied()
  }

  /// Boundary providers of group `group`.
  pub fn boundary(&self, group: NodeUuid) -> Option<Boundary> {
    self.boundaries.get(&group).copied()
  }

  /// Every node of the hierarchy, sorted.
  pub fn uuids(&self) -> Vec<NodeUuid> {
    let mut uuids: Vec<NodeUuid> = self.scopes.keys().copied().collect();
    uuids.sort();
    uuids
  }

  /// Nodes held directly by the graph owned by `parent` (`None` for the root), sorted.
  pub fn nodes_in(&self, parent: Option<NodeUuid>) -> Vec<NodeUuid> {
    let mut uuids: Vec<NodeUuid> = self
      .scopes
      .iter()
      .filter(|(_, scope)| scope.parent == parent)
      .map(|(uuid, _)| *uuid)
      .collect();
    uuids.sort();
    uuids
  }

  fn register(&mut self, uuid: NodeUuid, scope: NodeScope) {
    self.connections.insert_node(uuid);
    self.scopes.insert(uuid, scope);
  }

  fn unregister(&mut self, uuid: NodeUuid) {
    let edges: Vec<Edge<NodeUuid>> = self
      .connections
      .predecessors(uuid)
      .iter()
      .chain(self.connections.successors(uuid))
      .copied()
      .collect();
    for edge in &edges {
      self.connections.remove_edge(edge);
    }
    self.connections.remove_node(uuid);
    self.boundaries.remove(&uuid);
    self.scopes.remove(&uuid);
  }

  fn absorb(&mut self, other: GlobalModel, group: NodeUuid) {
    self.connections.merge(other.connections);
    for (uuid, mut scope) in other.scopes {
      if scope.parent.is_none() {
        scope.parent = Some(group);
      }
      self.scopes.insert(uuid, scope);
    }
    self.boundaries.extend(other.boundaries);
  }
}

/// State shared by every graph of one hierarchy.
#[derive(Default)]
pub(crate) struct GraphContext {
  global: RwLock<GlobalModel>,
  events: EventBus<GraphEvent>,
  modification: AtomicUsize,
  conversions: RwLock<TypeConversions>,
}

impl GraphContext {
  fn with_conversions(conversions: TypeConversions) -> Self {
    Self {
      conversions: RwLock::new(conversions),
      ..Self::default()
    }
  }

  pub(crate) fn global(&self) -> RwLockReadGuard<'_, GlobalModel> {
    self.global.read().unwrap_or_else(PoisonError::into_inner)
  }

  fn global_mut(&self) -> RwLockWriteGuard<'_, GlobalModel> {
    self.global.write().unwrap_or_else(PoisonError::into_inner)
  }

  fn conversions(&self) -> RwLockReadGuard<'_, TypeConversions> {
    self.conversions.read().unwrap_or_else(PoisonError::into_inner)
  }

  fn conversions_mut(&self) -> RwLockWriteGuard<'_, TypeConversions> {
    self.conversions.write().unwrap_or_else(PoisonError::into_inner)
  }

  fn publish(&self, event: GraphEvent) {
    trace!(?event, "graph event");
    self.events.publish(event);
  }
}

fn rejected(err: GraphError) -> GraphError {
  warn!(error = %err, "graph operation rejected");
  err
}

fn local_edge(id: ConnectionId) -> Edge<NodeId> {
  Edge::data(id.source_node, id.source_port, id.target_node, id.target_port)
}

/// A container of nodes and connections. May itself be wrapped in a group node.
pub struct Graph {
  ctx: Arc<GraphContext>,
  owner: Option<NodeUuid>,
  nodes: Arena<Node>,
  index: HashMap<NodeId, Handle>,
  by_uuid: HashMap<NodeUuid, NodeId>,
  local: ConnectionModel<NodeId>,
  next_node_id: u32,
  input_provider: Option<NodeId>,
  output_provider: Option<NodeId>,
}

impl Default for Graph {
  fn default() -> Self {
    Self::new()
  }
}

impl Graph {
  /// Creates an empty graph heading its own hierarchy.
  pub fn new() -> Self {
    Self::with_context(Arc::new(GraphContext::default()))
  }

  /// Creates an empty graph using `conversions` as its type conversion table.
  pub fn with_conversions(conversions: TypeConversions) -> Self {
    Self::with_context(Arc::new(GraphContext::with_conversions(conversions)))
  }

  fn with_context(ctx: Arc<GraphContext>) -> Self {
    Self {
      ctx,
      owner: None,
      nodes: Arena::new(),
      index: HashMap::new(),
      by_uuid: HashMap::new(),
      local: ConnectionModel::new(),
      next_node_id: 0,
      input_provider: None,
      output_provider: None,
    }
  }

  /// Uuid of the group node wrapping this graph, `None` for a root graph.
  pub fn owner(&self) -> Option<NodeUuid> {
    self.owner
  }

  /// Number of nodes at this level.
  pub fn len(&self) -> usize {
    self.nodes.len()
  }

  /// Returns `true` if this level holds no node.
  pub fn is_empty(&self) -> bool {
    self.nodes.is_empty()
  }

  /// Subscribes to the structural events of the whole hierarchy.
  ///
  /// Subscriptions taken on a graph that is later nested into a group stop
  /// receiving events: the nested graph joins its parent's event bus.
  pub fn subscribe(&self) -> mpsc::UnboundedReceiver<GraphEvent> {
    self.ctx.events.subscribe()
  }

  /// Read access to the global connection model.
  pub fn global_model(&self) -> RwLockReadGuard<'_, GlobalModel> {
    self.ctx.global()
  }

  pub(crate) fn context(&self) -> &Arc<GraphContext> {
    &self.ctx
  }

  // ==========================================================================
  // Type conversions
  // ==========================================================================

  /// Declares port type `from` connectable to port type `to`, passing data unchanged.
  pub fn register_conversion(&self, from: impl Into<String>, to: impl Into<String>) {
    self.ctx.conversions_mut().register(from, to);
  }

  /// Declares port type `from` connectable to port type `to` through `converter`.
  pub fn register_conversion_with<F>(&self, from: impl Into<String>, to: impl Into<String>, converter: F)
  where
    F: Fn(&NodeData) -> Option<NodeData> + Send + Sync + 'static,
  {
    self.ctx.conversions_mut().register_with(from, to, converter);
  }

  /// Returns `true` if an output of type `from` may feed an input of type `to`.
  pub fn can_convert(&self, from: &str, to: &str) -> bool {
    self.ctx.conversions().can_convert(from, to)
  }

  pub(crate) fn convert(&self, from: &str, to: &str, data: &NodeData) -> Option<NodeData> {
    self.ctx.conversions().convert(from, to, data)
  }

  // ==========================================================================
  // Modification scope
  // ==========================================================================

  /// Enters a modification scope. Scopes nest; while any is open the execution
  /// model does not react to changes.
  ///
  /// Closing the last scope only publishes [`GraphEvent::ModificationFinished`].
  /// A model owning this graph reschedules on its next
  /// [`ExecutionModel::process_events`](crate::ExecutionModel::process_events)
  /// (or `wait`); [`ExecutionModel::modify`](crate::ExecutionModel::modify)
  /// returns a guard that does this when dropped.
  pub fn begin_modification(&self) {
    if self.ctx.modification.fetch_add(1, Ordering::AcqRel) == 0 {
      debug!("modification started");
      self.ctx.publish(GraphEvent::ModificationStarted);
    }
  }

  /// Leaves a modification scope. Does not reschedule an owning model by
  /// itself, see [`Graph::begin_modification`].
  pub fn end_modification(&self) {
    let previous = self
      .ctx
      .modification
      .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| count.checked_sub(1));
    match previous {
      Ok(1) => {
        debug!("modification finished");
        self.ctx.publish(GraphEvent::ModificationFinished);
      }
      Ok(_) => {}
      Err(_) => warn!("end_modification called without a matching begin_modification"),
    }
  }

  /// Returns `true` while a modification scope is open anywhere in the hierarchy.
  pub fn is_modifying(&self) -> bool {
    self.ctx.modification.load(Ordering::Acquire) > 0
  }

  // ==========================================================================
  // Nodes
  // ==========================================================================

  /// Appends `node` to this graph.
  ///
  /// The requested node id is resolved according to `policy`. A node of a
  /// unique kind is refused if one of the same type already exists at this
  /// level. Appending a group merges its nested hierarchy into this one and
  /// creates the group's boundary providers.
  ///
  /// # Errors
  ///
  /// [`GraphError::DuplicateNodeId`], [`GraphError::UniqueNodeViolated`] or
  /// [`GraphError::HierarchyAppend`]. The graph is unchanged on error.
  pub fn append_node(&mut self, mut node: Node, policy: NodeIdPolicy) -> Result<&Node, GraphError> {
    let id = self.resolve_node_id(node.id, policy).map_err(rejected)?;
    if node.is_unique() && self.nodes().any(|other| other.type_name() == node.type_name()) {
      return Err(rejected(GraphError::UniqueNodeViolated(
        node.type_name().to_string(),
      )));
    }
    node.id = id;
    if self.ctx.global().contains(node.uuid) {
      let fresh = NodeUuid::new();
      debug!(old = %node.uuid, new = %fresh, "node uuid already in use, regenerated");
      node.uuid = fresh;
    }
    let uuid = node.uuid;
    if let Some(child) = node.as_group_mut() {
      self.adopt(child, uuid).map_err(rejected)?;
    }
    let is_group = node.is_group();
    let id = self.insert_node(node);
    if is_group {
      self.attach_boundary(id);
    }
    self.find_node(id).ok_or(GraphError::NodeNotFound(id))
  }

  /// Deletes node `id` and every connection attached to it. Deleting a group
  /// deletes its whole nested hierarchy.
  ///
  /// # Errors
  ///
  /// [`GraphError::NodeNotFound`], or [`GraphError::BoundaryNode`] for providers.
  pub fn delete_node(&mut self, id: NodeId) -> Result<(), GraphError> {
    let Some(node) = self.find_node(id) else {
      return Err(rejected(GraphError::NodeNotFound(id)));
    };
    if node.role().is_provider() {
      return Err(rejected(GraphError::BoundaryNode(id)));
    }
    for connection in self.find_connections(id, PortQuery::All) {
      self.remove_connection_entry(connection);
    }
    let Some(node) = self.take_node(id) else {
      return Err(rejected(GraphError::NodeNotFound(id)));
    };

    let mut removed = Vec::new();
    if let Some(child) = node.as_group() {
      child.collect_scope(&mut removed);
    }
    removed.push((node.uuid, self.owner));
    {
      let mut global = self.ctx.global_mut();
      for (uuid, _) in &removed {
        global.unregister(*uuid);
      }
    }
    debug!(node = %node.uuid, id = %id, nested = removed.len() - 1, "node deleted");
    for (uuid, parent) in removed {
      self.ctx.publish(GraphEvent::NodeDeleted { node: uuid, parent });
    }
    Ok(())
  }

  /// Node `id` at this level.
  pub fn find_node(&self, id: NodeId) -> Option<&Node> {
    self.index.get(&id).and_then(|handle| self.nodes.get(*handle))
  }

  /// Node `id` at this level, mutably.
  pub fn find_node_mut(&mut self, id: NodeId) -> Option<&mut Node> {
    let handle = *self.index.get(&id)?;
    self.nodes.get_mut(handle)
  }

  /// Node `uuid` anywhere below this graph, nested groups included.
  pub fn find_node_by_uuid(&self, uuid: NodeUuid) -> Option<&Node> {
    let path = self.scope_path(uuid)?;
    let mut graph = self;
    for group in path {
      graph = graph.local_by_uuid(group)?.as_group()?;
    }
    graph.local_by_uuid(uuid)
  }

  fn local_by_uuid(&self, uuid: NodeUuid) -> Option<&Node> {
    self.by_uuid.get(&uuid).and_then(|id| self.find_node(*id))
  }

  /// Groups between this graph and `uuid`, outermost first. `None` if `uuid`
  /// is not below this graph.
  fn scope_path(&self, uuid: NodeUuid) -> Option<Vec<NodeUuid>> {
    let global = self.ctx.global();
    let mut path = Vec::new();
    let mut current = global.scope(uuid)?.parent;
    while current != self.owner {
      let group = current?;
      path.push(group);
      current = global.scope(group)?.parent;
    }
    path.reverse();
    Some(path)
  }

  /// Nested graph of group `id`.
  ///
  /// # Errors
  ///
  /// [`GraphError::NodeNotFound`] or [`GraphError::NotAGroup`].
  pub fn group(&self, id: NodeId) -> Result<&Graph, GraphError> {
    let node = self.find_node(id).ok_or(GraphError::NodeNotFound(id))?;
    node.as_group().ok_or(GraphError::NotAGroup(id))
  }

  /// Nested graph of group `id`, mutably.
  ///
  /// # Errors
  ///
  /// [`GraphError::NodeNotFound`] or [`GraphError::NotAGroup`].
  pub fn group_mut(&mut self, id: NodeId) -> Result<&mut Graph, GraphError> {
    let node = self.find_node_mut(id).ok_or(GraphError::NodeNotFound(id))?;
    node.as_group_mut().ok_or(GraphError::NotAGroup(id))
  }

  /// Id of this graph's input provider, if it is a group's nested graph.
  pub fn input_provider(&self) -> Option<NodeId> {
    self.input_provider
  }

  /// Id of this graph's output provider, if it is a group's nested graph.
  pub fn output_provider(&self) -> Option<NodeId> {
    self.output_provider
  }

  /// Nodes at this level, in storage order.
  pub fn nodes(&self) -> impl Iterator<Item = &Node> {
    self.nodes.iter().map(|(_, node)| node)
  }

  /// Ids of the nodes at this level, sorted.
  pub fn node_ids(&self) -> Vec<NodeId> {
    let mut ids: Vec<NodeId> = self.index.keys().copied().collect();
    ids.sort();
    ids
  }

  /// Activates or deactivates node `id`.
  ///
  /// # Errors
  ///
  /// [`GraphError::NodeNotFound`].
  pub fn set_node_active(&mut self, id: NodeId, active: bool) -> Result<(), GraphError> {
    let Some(handle) = self.index.get(&id).copied() else {
      return Err(rejected(GraphError::NodeNotFound(id)));
    };
    let Some(node) = self.nodes.get_mut(handle) else {
      return Err(rejected(GraphError::NodeNotFound(id)));
    };
    if node.active != active {
      node.active = active;
      debug!(node = %node.uuid, active, "node activity changed");
      self.ctx.publish(GraphEvent::NodeActivityChanged {
        node: node.uuid,
        active,
      });
    }
    Ok(())
  }

  /// Inserts `port` on node `node` at position `index` of `direction` (or at
  /// the end). On a group the mirrored provider port is inserted too.
  ///
  /// # Errors
  ///
  /// [`GraphError::NodeNotFound`], [`GraphError::BoundaryNode`] for providers,
  /// or [`GraphError::PortIdsExhausted`] when the node has no free port id.
  pub fn add_port(
    &mut self,
    node: NodeId,
    direction: PortDirection,
    port: Port,
    index: Option<usize>,
  ) -> Result<PortId, GraphError> {
    let Some(handle) = self.index.get(&node).copied() else {
      return Err(rejected(GraphError::NodeNotFound(node)));
    };
    let Some(target) = self.nodes.get_mut(handle) else {
      return Err(rejected(GraphError::NodeNotFound(node)));
    };
    if target.role().is_provider() {
      return Err(rejected(GraphError::BoundaryNode(node)));
    }
    let Some(port_id) = target.insert_port(direction, port, index) else {
      return Err(rejected(GraphError::PortIdsExhausted(node)));
    };
    let uuid = target.uuid;
    let mirror = target.port(port_id).cloned();
    if let (Some(mirror), Some(child)) = (mirror, target.as_group_mut()) {
      if let Some(provider) = child.mirror_port(direction, mirror, index) {
        if direction == PortDirection::Out {
          self
            .ctx
            .global_mut()
            .connections
            .insert_edge(Edge::boundary(provider, port_id, uuid, port_id));
        }
      }
    }
    debug!(node = %uuid, port = %port_id, %direction, "port inserted");
    self.ctx.publish(GraphEvent::PortInserted {
      node: uuid,
      port: port_id,
      direction,
    });
    Ok(port_id)
  }

  /// Removes port `port` from node `node`, deleting its connections first.
  ///
  /// # Errors
  ///
  /// [`GraphError::NodeNotFound`], [`GraphError::PortNotFound`], or
  /// [`GraphError::BoundaryNode`] for providers.
  pub fn remove_port(&mut self, node: NodeId, port: PortId) -> Result<Port, GraphError> {
    let Some(target) = self.find_node(node) else {
      return Err(rejected(GraphError::NodeNotFound(node)));
    };
    if target.role().is_provider() {
      return Err(rejected(GraphError::BoundaryNode(node)));
    }
    let Some(direction) = target.port_direction(port) else {
      return Err(rejected(GraphError::PortNotFound { node, port }));
    };
    let uuid = target.uuid;

    self
      .ctx
      .publish(GraphEvent::PortAboutToBeDeleted { node: uuid, port });
    for connection in self.find_connections(node, PortQuery::Port(port)) {
      self.remove_connection_entry(connection);
    }

    let Some(handle) = self.index.get(&node).copied() else {
      return Err(rejected(GraphError::NodeNotFound(node)));
    };
    let Some(target) = self.nodes.get_mut(handle) else {
      return Err(rejected(GraphError::NodeNotFound(node)));
    };
    if let Some(child) = target.as_group_mut() {
      if let Some(provider) = child.unmirror_port(direction, port) {
        if direction == PortDirection::Out {
          self
            .ctx
            .global_mut()
            .connections
            .remove_edge(&Edge::boundary(provider, port, uuid, port));
        }
      }
    }
    let Some((_, removed)) = target.take_port(port) else {
      return Err(rejected(GraphError::PortNotFound { node, port }));
    };
    debug!(node = %uuid, port = %port, "port deleted");
    self.ctx.publish(GraphEvent::PortDeleted { node: uuid, port });
    Ok(removed)
  }

  // ==========================================================================
  // Connections
  // ==========================================================================

  /// Validates connection `id` without changing anything.
  ///
  /// Checks run in order: id validity, distinct endpoints, no duplicate, both
  /// nodes exist, both ports exist, output-to-input direction, convertible
  /// types, free target port, and finally that the connection closes no cycle
  /// in the global model.
  ///
  /// # Errors
  ///
  /// The first failed check.
  pub fn check_connection(&self, id: ConnectionId) -> Result<(), GraphError> {
    if !id.is_valid() {
      return Err(GraphError::InvalidConnectionId(id));
    }
    if id.source_node == id.target_node {
      return Err(GraphError::SelfConnection(id));
    }
    if self.local.contains_edge(&local_edge(id)) {
      return Err(GraphError::DuplicateConnection(id));
    }
    let source = self
      .find_node(id.source_node)
      .ok_or(GraphError::NodeNotFound(id.source_node))?;
    let target = self
      .find_node(id.target_node)
      .ok_or(GraphError::NodeNotFound(id.target_node))?;
    let source_port = source.port(id.source_port).ok_or(GraphError::PortNotFound {
      node: id.source_node,
      port: id.source_port,
    })?;
    let target_port = target.port(id.target_port).ok_or(GraphError::PortNotFound {
      node: id.target_node,
      port: id.target_port,
    })?;
    if source.port_direction(id.source_port) != Some(PortDirection::Out)
      || target.port_direction(id.target_port) != Some(PortDirection::In)
    {
      return Err(GraphError::SameDirection(id));
    }
    if !self.can_convert(&source_port.type_id, &target_port.type_id) {
      return Err(GraphError::IncompatibleTypes {
        id,
        source_type: source_port.type_id.clone(),
        target_type: target_port.type_id.clone(),
      });
    }
    if self.local.incoming(id.target_node, id.target_port).is_some() {
      return Err(GraphError::TargetPortConnected(id));
    }

    let global = self.ctx.global();
    let connections = global.connections();
    let closes_cycle = connections.is_reachable(target.uuid, source.uuid)
      || global
        .boundary(target.uuid)
        .is_some_and(|boundary| connections.is_reachable(boundary.input, source.uuid));
    if closes_cycle {
      return Err(GraphError::CycleDetected(id));
    }
    Ok(())
  }

  /// Returns `true` if [`Graph::append_connection`] would accept `id`.
  pub fn can_append_connection(&self, id: ConnectionId) -> bool {
    self.check_connection(id).is_ok()
  }

  /// Appends a connection after validating it with [`Graph::check_connection`].
  ///
  /// # Errors
  ///
  /// The first failed validation check. The graph is unchanged on error.
  pub fn append_connection(&mut self, id: impl Into<ConnectionId>) -> Result<ConnectionId, GraphError> {
    let id = id.into();
    if let Err(err) = self.check_connection(id) {
      warn!(connection = %id, error = %err, "connection rejected");
      return Err(err);
    }
    let Some(connection) = self.connection_uuid(id) else {
      return Err(rejected(GraphError::ConnectionNotFound(id)));
    };

    self.local.insert_edge(local_edge(id));
    {
      let mut global = self.ctx.global_mut();
      global.connections.insert_edge(Edge::data(
        connection.source_node,
        connection.source_port,
        connection.target_node,
        connection.target_port,
      ));
      if let Some(boundary) = global.boundary(connection.target_node) {
        global.connections.insert_edge(Edge::boundary(
          connection.source_node,
          connection.source_port,
          boundary.input,
          connection.target_port,
        ));
      }
    }

    debug!(connection = %id, "connection appended");
    self.ctx.publish(GraphEvent::ConnectionAppended { connection });
    self.ctx.publish(GraphEvent::PortConnected {
      node: connection.source_node,
      port: connection.source_port,
    });
    self.ctx.publish(GraphEvent::PortConnected {
      node: connection.target_node,
      port: connection.target_port,
    });
    Ok(id)
  }

  /// Deletes connection `id`.
  ///
  /// # Errors
  ///
  /// [`GraphError::ConnectionNotFound`].
  pub fn delete_connection(&mut self, id: ConnectionId) -> Result<(), GraphError> {
    if !self.local.contains_edge(&local_edge(id)) {
      return Err(rejected(GraphError::ConnectionNotFound(id)));
    }
    self.remove_connection_entry(id);
    Ok(())
  }

  /// Connections of node `node` matching `query`, sorted. Empty for unknown nodes.
  pub fn find_connections(&self, node: NodeId, query: impl Into<PortQuery>) -> Vec<ConnectionId> {
    let query = query.into();
    let incoming = self
      .local
      .predecessors(node)
      .iter()
      .filter(|edge| match query {
        PortQuery::All | PortQuery::Direction(PortDirection::In) => true,
        PortQuery::Direction(PortDirection::Out) => false,
        PortQuery::Port(port) => edge.target_port == port,
      });
    let outgoing = self
      .local
      .successors(node)
      .iter()
      .filter(|edge| match query {
        PortQuery::All | PortQuery::Direction(PortDirection::Out) => true,
        PortQuery::Direction(PortDirection::In) => false,
        PortQuery::Port(port) => edge.source_port == port,
      });
    let mut connections: Vec<ConnectionId> = incoming
      .chain(outgoing)
      .map(|edge| ConnectionId::new(edge.source, edge.source_port, edge.target, edge.target_port))
      .collect();
    connections.sort();
    connections
  }

  /// Every connection at this level, sorted.
  pub fn connection_ids(&self) -> Vec<ConnectionId> {
    let mut connections: Vec<ConnectionId> = self
      .local
      .edges()
      .map(|edge| ConnectionId::new(edge.source, edge.source_port, edge.target, edge.target_port))
      .collect();
    connections.sort();
    connections
  }

  /// Connection `id`, if it exists at this level.
  pub fn find_connection(&self, id: ConnectionId) -> Option<Connection> {
    self
      .local
      .contains_edge(&local_edge(id))
      .then(|| Connection::from(id))
  }

  /// Global endpoints of connection `id`.
  pub fn connection_uuid(&self, id: ConnectionId) -> Option<ConnectionUuid> {
    Some(ConnectionUuid {
      source_node: self.find_node(id.source_node)?.uuid,
      source_port: id.source_port,
      target_node: self.find_node(id.target_node)?.uuid,
      target_port: id.target_port,
    })
  }

  // ==========================================================================
  // Graph algorithms
  // ==========================================================================

  /// All ancestors of `id` at this level.
  pub fn find_dependencies(&self, id: NodeId) -> Vec<NodeId> {
    self.local.find_dependencies(id)
  }

  /// All descendants of `id` at this level.
  pub fn find_dependent_nodes(&self, id: NodeId) -> Vec<NodeId> {
    self.local.find_dependents(id)
  }

  /// Cycle evidence at this level; empty when the level is acyclic.
  pub fn cyclic_nodes(&self) -> Vec<NodeId> {
    self.local.cyclic_nodes()
  }

  // ==========================================================================
  // Moving nodes between levels
  // ==========================================================================

  /// Moves nodes `ids` into the nested graph of group `group`.
  ///
  /// Uuids are kept. Connections among the moved nodes move with them;
  /// connections between a moved and a non-moved node are deleted. Node ids
  /// are kept when free in the group, otherwise reassigned. Returns the new
  /// ids in the order of `ids`.
  ///
  /// # Errors
  ///
  /// [`GraphError::NodeNotFound`], [`GraphError::NotAGroup`],
  /// [`GraphError::BoundaryNode`], [`GraphError::UniqueNodeViolated`] or
  /// [`GraphError::HierarchyAppend`] when `group` is among `ids`. Nothing is
  /// moved on error.
  pub fn move_nodes_into_group(&mut self, ids: &[NodeId], group: NodeId) -> Result<Vec<NodeId>, GraphError> {
    let group_graph = self.group(group).map_err(rejected)?;
    let group_uuid = self
      .find_node(group)
      .map(Node::uuid)
      .ok_or(GraphError::NodeNotFound(group))?;

    let mut moved: Vec<NodeId> = Vec::with_capacity(ids.len());
    let mut unique_types: HashSet<&str> = group_graph
      .nodes()
      .filter(|node| node.is_unique())
      .map(Node::type_name)
      .collect();
    for id in ids {
      if moved.contains(id) {
        continue;
      }
      if *id == group {
        return Err(rejected(GraphError::HierarchyAppend(format!(
          "group {group} cannot be moved into itself"
        ))));
      }
      let node = self
        .find_node(*id)
        .ok_or_else(|| rejected(GraphError::NodeNotFound(*id)))?;
      if node.role().is_provider() {
        return Err(rejected(GraphError::BoundaryNode(*id)));
      }
      if node.is_unique() && !unique_types.insert(node.type_name()) {
        return Err(rejected(GraphError::UniqueNodeViolated(
          node.type_name().to_string(),
        )));
      }
      moved.push(*id);
    }

    let moved_set: HashSet<NodeId> = moved.iter().copied().collect();
    let mut attached = BTreeSet::new();
    let mut internal = BTreeSet::new();
    for id in &moved {
      for connection in self.find_connections(*id, PortQuery::All) {
        if moved_set.contains(&connection.source_node) && moved_set.contains(&connection.target_node) {
          internal.insert(connection);
        }
        attached.insert(connection);
      }
    }
    for connection in &attached {
      self.remove_connection_entry(*connection);
    }

    let taken: Vec<Node> = moved.iter().filter_map(|id| self.take_node(*id)).collect();
    let from = self.owner;
    let child = self.group_mut(group)?;
    let mut remap: HashMap<NodeId, NodeId> = HashMap::with_capacity(taken.len());
    for mut node in taken {
      let old = node.id;
      node.id = child.resolve_node_id(old, NodeIdPolicy::Update)?;
      remap.insert(old, node.id);
      let uuid = node.uuid;
      child.place_node(node);
      debug!(node = %uuid, from = ?from, to = %group_uuid, "node moved");
      child.ctx.publish(GraphEvent::NodeMoved {
        node: uuid,
        from,
        to: Some(group_uuid),
      });
    }
    for connection in internal {
      let (Some(source), Some(target)) = (
        remap.get(&connection.source_node),
        remap.get(&connection.target_node),
      ) else {
        continue;
      };
      let moved_connection =
        ConnectionId::new(*source, connection.source_port, *target, connection.target_port);
      if let Err(err) = child.append_connection(moved_connection) {
        error!(connection = %moved_connection, error = %err, "could not restore moved connection");
        debug_assert!(false, "moving nodes broke an internal connection: {err}");
      }
    }

    Ok(
      moved
        .iter()
        .filter_map(|id| remap.get(id).copied())
        .collect(),
    )
  }

  // ==========================================================================
  // Internals
  // ==========================================================================

  fn next_free_id(&mut self) -> NodeId {
    while self.index.contains_key(&NodeId(self.next_node_id)) {
      self.next_node_id += 1;
    }
    NodeId(self.next_node_id)
  }

  fn resolve_node_id(&mut self, requested: NodeId, policy: NodeIdPolicy) -> Result<NodeId, GraphError> {
    if !requested.is_valid() {
      return Ok(self.next_free_id());
    }
    if !self.index.contains_key(&requested) {
      return Ok(requested);
    }
    match policy {
      NodeIdPolicy::Keep => Err(GraphError::DuplicateNodeId(requested)),
      NodeIdPolicy::Update => Ok(self.next_free_id()),
    }
  }

  /// Stores `node` at this level and registers it in both models.
  fn insert_node(&mut self, node: Node) -> NodeId {
    let id = node.id;
    let uuid = node.uuid;
    let role = node.role();
    self.place_node(node);
    self.ctx.global_mut().register(
      uuid,
      NodeScope {
        parent: self.owner,
        role,
      },
    );
    debug!(node = %uuid, id = %id, ?role, "node appended");
    self.ctx.publish(GraphEvent::NodeAppended {
      node: uuid,
      parent: self.owner,
    });
    id
  }

  /// Stores `node` at this level. A node already known to the global model
  /// only has its scope updated.
  fn place_node(&mut self, node: Node) {
    let id = node.id;
    let uuid = node.uuid;
    let handle = self.nodes.insert(node);
    self.index.insert(id, handle);
    self.by_uuid.insert(uuid, id);
    self.local.insert_node(id);
    self.next_node_id = self.next_node_id.max(id.0.saturating_add(1));
    if let Some(scope) = self.ctx.global_mut().scopes.get_mut(&uuid) {
      scope.parent = self.owner;
    }
  }

  /// Removes node `id` from this level. Its connections must be gone.
  fn take_node(&mut self, id: NodeId) -> Option<Node> {
    let handle = self.index.remove(&id)?;
    let node = self.nodes.remove(handle)?;
    self.by_uuid.remove(&node.uuid);
    self.local.remove_node(id);
    Some(node)
  }

  fn remove_connection_entry(&mut self, id: ConnectionId) {
    let connection = self.connection_uuid(id);
    self.local.remove_edge(&local_edge(id));
    let Some(connection) = connection else {
      error!(connection = %id, "connection references a missing node");
      debug_assert!(false, "connection {id} references a missing node");
      return;
    };
    {
      let mut global = self.ctx.global_mut();
      global.connections.remove_edge(&Edge::data(
        connection.source_node,
        connection.source_port,
        connection.target_node,
        connection.target_port,
      ));
      if let Some(boundary) = global.boundary(connection.target_node) {
        global.connections.remove_edge(&Edge::boundary(
          connection.source_node,
          connection.source_port,
          boundary.input,
          connection.target_port,
        ));
      }
    }
    debug!(connection = %id, "connection deleted");
    self.ctx.publish(GraphEvent::ConnectionDeleted { connection });
    self.ctx.publish(GraphEvent::PortDisconnected {
      node: connection.source_node,
      port: connection.source_port,
    });
    self.ctx.publish(GraphEvent::PortDisconnected {
      node: connection.target_node,
      port: connection.target_port,
    });
  }

  /// Merges the hierarchy of `child` into this one, below group `group`.
  fn adopt(&self, child: &mut Graph, group: NodeUuid) -> Result<(), GraphError> {
    if Arc::ptr_eq(&self.ctx, &child.ctx) {
      return Err(GraphError::HierarchyAppend(
        "the graph already belongs to this hierarchy".to_string(),
      ));
    }
    {
      let ours = self.ctx.global();
      let theirs = child.ctx.global();
      if let Some(duplicate) = theirs.scopes.keys().find(|uuid| ours.contains(**uuid)) {
        return Err(GraphError::HierarchyAppend(format!(
          "node {duplicate} is already part of this hierarchy"
        )));
      }
    }
    let theirs = std::mem::take(&mut *child.ctx.global_mut());
    let conversions = child.ctx.conversions().clone();
    self.ctx.global_mut().absorb(theirs, group);
    self.ctx.conversions_mut().merge(conversions);
    child.owner = Some(group);
    child.attach_context(&self.ctx);
    debug!(group = %group, nodes = child.len(), "nested graph attached");
    Ok(())
  }

  fn attach_context(&mut self, ctx: &Arc<GraphContext>) {
    self.ctx = Arc::clone(ctx);
    for (_, node) in self.nodes.iter_mut() {
      if let Some(child) = node.as_group_mut() {
        child.attach_context(ctx);
      }
    }
  }

  /// Creates the providers of group `group` and its output boundary edges.
  fn attach_boundary(&mut self, group: NodeId) {
    let Some(handle) = self.index.get(&group).copied() else {
      return;
    };
    let Some(node) = self.nodes.get_mut(handle) else {
      return;
    };
    let group_uuid = node.uuid;
    let inputs = node.inputs.clone();
    let outputs = node.outputs.clone();
    let Some(child) = node.as_group_mut() else {
      return;
    };
    let input = child.ensure_provider(NodeRole::InputProvider, &inputs);
    let output = child.ensure_provider(NodeRole::OutputProvider, &outputs);

    let mut global = self.ctx.global_mut();
    global
      .boundaries
      .insert(group_uuid, Boundary { input, output });
    for port in &outputs {
      global
        .connections
        .insert_edge(Edge::boundary(output, port.id, group_uuid, port.id));
    }
  }

  fn ensure_provider(&mut self, role: NodeRole, ports: &[Port]) -> NodeUuid {
    let (existing, direction) = match role {
      NodeRole::InputProvider => (self.input_provider, PortDirection::Out),
      _ => (self.output_provider, PortDirection::In),
    };
    if let Some(node) = existing.and_then(|id| self.find_node(id)) {
      return node.uuid;
    }
    let mut node = match role {
      NodeRole::InputProvider => Node::input_provider(),
      _ => Node::output_provider(),
    };
    for port in ports {
      let assigned = node.insert_port(direction, port.clone(), None);
      debug_assert_eq!(assigned, Some(port.id), "provider ports mirror the group's port ids");
    }
    node.id = self.next_free_id();
    let uuid = node.uuid;
    let id = self.insert_node(node);
    match role {
      NodeRole::InputProvider => self.input_provider = Some(id),
      _ => self.output_provider = Some(id),
    }
    uuid
  }

  /// Inserts the provider port mirroring a new group port.
  fn mirror_port(&mut self, direction: PortDirection, port: Port, index: Option<usize>) -> Option<NodeUuid> {
    let provider = match direction {
      PortDirection::In => self.input_provider,
      PortDirection::Out => self.output_provider,
    }?;
    let provider = self.find_node_mut(provider)?;
    let requested = port.id;
    let assigned = provider.insert_port(direction.opposite(), port, index)?;
    debug_assert_eq!(assigned, requested, "provider ports mirror the group's port ids");
    let uuid = provider.uuid;
    self.ctx.publish(GraphEvent::PortInserted {
      node: uuid,
      port: assigned,
      direction: direction.opposite(),
    });
    Some(uuid)
  }

  /// Removes the provider port mirroring a removed group port.
  fn unmirror_port(&mut self, direction: PortDirection, port: PortId) -> Option<NodeUuid> {
    let provider = match direction {
      PortDirection::In => self.input_provider,
      PortDirection::Out => self.output_provider,
    }?;
    let uuid = self.find_node(provider)?.uuid;
    self
      .ctx
      .publish(GraphEvent::PortAboutToBeDeleted { node: uuid, port });
    for connection in self.find_connections(provider, PortQuery::Port(port)) {
      self.remove_connection_entry(connection);
    }
    self.find_node_mut(provider)?.take_port(port);
    self.ctx.publish(GraphEvent::PortDeleted { node: uuid, port });
    Some(uuid)
  }

  /// Every node below this graph with its owning group, nested levels first.
  fn collect_scope(&self, out: &mut Vec<(NodeUuid, Option<NodeUuid>)>) {
    for node in self.nodes() {
      if let Some(child) = node.as_group() {
        child.collect_scope(out);
      }
      out.push((node.uuid, self.owner));
    }
  }
}

impl fmt::Debug for Graph {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Graph")
      .field("owner", &self.owner)
      .field("nodes", &self.node_ids())
      .field("connections", &self.connection_ids())
      .finish()
  }
}
