//! # Error Types
//!
//! Three families of errors, matching the three ways things go wrong:
//!
//! - [`GraphError`]: a structural request was rejected (malformed connection,
//!   duplicate id, missing node or port). The graph is left untouched.
//! - [`EvalError`]: a node failed to produce its outputs. The execution model
//!   records it as node state `Invalid`; it never escapes as an `Err`.
//! - [`ExecutionError`]: the execution model was asked something it cannot
//!   answer (unknown node, futures of different models, bad configuration).

use crate::ids::{ConnectionId, NodeId, NodeUuid, PortId};
use thiserror::Error;

/// A rejected structural operation on a [`Graph`](crate::graph::Graph).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
  /// The requested node id is taken and the id policy forbids regenerating it.
  #[error("node id {0} is already in use")]
  DuplicateNodeId(NodeId),
  /// A node of a unique kind already exists in the graph.
  #[error("a node of unique type '{0}' already exists in this graph")]
  UniqueNodeViolated(String),
  /// No node with this id exists in the graph.
  #[error("node {0} not found")]
  NodeNotFound(NodeId),
  /// No node with this uuid exists in the graph hierarchy.
  #[error("node {0} not found in the graph hierarchy")]
  NodeUuidNotFound(NodeUuid),
  /// The node has no port with this id.
  #[error("node {node} has no port {port}")]
  PortNotFound {
    /// Node that was searched.
    node: NodeId,
    /// Missing port.
    port: PortId,
  },
  /// The connection id contains invalid components.
  #[error("connection {0} is not a valid connection id")]
  InvalidConnectionId(ConnectionId),
  /// Source and target are the same node.
  #[error("connection {0} connects a node to itself")]
  SelfConnection(ConnectionId),
  /// The exact same connection already exists.
  #[error("connection {0} already exists")]
  DuplicateConnection(ConnectionId),
  /// The connection does not exist.
  #[error("connection {0} not found")]
  ConnectionNotFound(ConnectionId),
  /// The source is not an output port or the target is not an input port.
  #[error("connection {0} does not lead from an output port to an input port")]
  SameDirection(ConnectionId),
  /// The port type ids are not convertible.
  #[error("cannot connect '{source_type}' to '{target_type}' ({id})")]
  IncompatibleTypes {
    /// Rejected connection.
    id: ConnectionId,
    /// Type id of the output port.
    source_type: String,
    /// Type id of the input port.
    target_type: String,
  },
  /// The target input port already has an incoming connection.
  #[error("input port of connection {0} is already connected")]
  TargetPortConnected(ConnectionId),
  /// Appending the connection would close a cycle.
  #[error("connection {0} would introduce a cycle")]
  CycleDetected(ConnectionId),
  /// The node exists but is not a group node.
  #[error("node {0} is not a group")]
  NotAGroup(NodeId),
  /// Nested graph could not be attached to its parent.
  #[error("could not append sub-graph: {0}")]
  HierarchyAppend(String),
  /// Boundary provider nodes are managed by their group and cannot be edited directly.
  #[error("node {0} is a boundary provider and is managed by its group")]
  BoundaryNode(NodeId),
  /// Every port id of the node is taken.
  #[error("node {0} has no free port id left")]
  PortIdsExhausted(NodeId),
}

/// Failure reported by a node evaluation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EvalError {
  /// The behaviour reported a failure.
  #[error("evaluation failed: {0}")]
  Failed(String),
  /// A required input had no data at evaluation time.
  #[error("missing data on input port {0}")]
  MissingInput(PortId),
  /// Input data had an unexpected type.
  #[error("input port {port} expected a value of type {expected}")]
  TypeMismatch {
    /// Offending port.
    port: PortId,
    /// Expected Rust type.
    expected: String,
  },
  /// The behaviour panicked.
  #[error("evaluation panicked: {0}")]
  Panicked(String),
  /// The executor could not start the evaluation.
  #[error("executor failed to launch evaluation: {0}")]
  LaunchFailed(String),
}

impl EvalError {
  /// Shorthand for [`EvalError::Failed`].
  pub fn failed(message: impl Into<String>) -> Self {
    EvalError::Failed(message.into())
  }
}

/// Misuse of the [`ExecutionModel`](crate::execution::ExecutionModel) API.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecutionError {
  /// No node with this uuid is known to the model.
  #[error("node {0} is not part of this execution model")]
  UnknownNode(NodeUuid),
  /// The node has no port with this id.
  #[error("node {node} has no port {port}")]
  UnknownPort {
    /// Node that was searched.
    node: NodeUuid,
    /// Missing port.
    port: PortId,
  },
  /// Two futures referencing different execution models were joined.
  #[error("futures belong to different execution models")]
  ModelMismatch,
  /// Invalid configuration input.
  #[error("invalid configuration: {0}")]
  Config(String),
  /// The worker pool could not be started.
  #[error("could not start worker pool: {0}")]
  Runtime(String),
}

impl From<serde_json::Error> for ExecutionError {
  fn from(err: serde_json::Error) -> Self {
    ExecutionError::Config(err.to_string())
  }
}
