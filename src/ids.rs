//! # Identifiers
//!
//! Strongly-typed handles for nodes, ports and connections.
//!
//! Two key spaces coexist:
//!
//! - **Local** ids ([`NodeId`], [`ConnectionId`]) are assigned by the graph level
//!   that owns the node. They are small integers and only unique within one graph.
//! - **Global** ids ([`NodeUuid`], [`ConnectionUuid`]) are stable for the lifetime
//!   of a node, survive moving a node between nested sub-graphs, and key the
//!   flattened global connection model.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

/// Local identifier of a node inside one graph level.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct NodeId(pub u32);

impl NodeId {
  /// Sentinel for "no id assigned yet". Appending a node carrying this id always
  /// generates a fresh one.
  pub const INVALID: NodeId = NodeId(u32::MAX);

  /// Returns `true` unless this is [`NodeId::INVALID`].
  #[inline]
  pub const fn is_valid(self) -> bool {
    self.0 != u32::MAX
  }
}

impl fmt::Display for NodeId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "#{}", self.0)
  }
}

/// Identifier of a port, unique among all ports (inputs and outputs) of one node.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct PortId(pub u32);

impl PortId {
  /// Sentinel for "no port assigned yet".
  pub const INVALID: PortId = PortId(u32::MAX);

  /// Returns `true` unless this is [`PortId::INVALID`].
  #[inline]
  pub const fn is_valid(self) -> bool {
    self.0 != u32::MAX
  }
}

impl fmt::Display for PortId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "p{}", self.0)
  }
}

/// Stable identifier of a node across its lifetime and across sub-graph membership.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct NodeUuid(pub Uuid);

impl NodeUuid {
  /// Generates a new random uuid.
  pub fn new() -> Self {
    Self(Uuid::new_v4())
  }

  /// Returns the wrapped [`Uuid`].
  #[inline]
  pub const fn as_uuid(&self) -> &Uuid {
    &self.0
  }
}

impl Default for NodeUuid {
  fn default() -> Self {
    Self::new()
  }
}

impl fmt::Display for NodeUuid {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    // The first block is enough to tell nodes apart in logs.
    let simple = self.0.simple().to_string();
    write!(f, "{}", &simple[..8])
  }
}

/// Identifier of a connection inside one graph level.
///
/// A connection is fully described by its endpoints, so the id *is* the
/// `(source node, source port, target node, target port)` tuple.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct ConnectionId {
  /// Node owning the output port.
  pub source_node: NodeId,
  /// Output port on the source node.
  pub source_port: PortId,
  /// Node owning the input port.
  pub target_node: NodeId,
  /// Input port on the target node.
  pub target_port: PortId,
}

impl ConnectionId {
  /// Creates a connection id from its four endpoints.
  pub const fn new(
    source_node: NodeId,
    source_port: PortId,
    target_node: NodeId,
    target_port: PortId,
  ) -> Self {
    Self {
      source_node,
      source_port,
      target_node,
      target_port,
    }
  }

  /// Returns `true` when every component is a valid id.
  pub const fn is_valid(&self) -> bool {
    self.source_node.is_valid()
      && self.source_port.is_valid()
      && self.target_node.is_valid()
      && self.target_port.is_valid()
  }

  /// Returns `true` if either endpoint is `node`.
  pub fn touches(&self, node: NodeId) -> bool {
    self.source_node == node || self.target_node == node
  }

  /// Returns the same connection with source and target swapped.
  pub const fn reversed(&self) -> Self {
    Self::new(
      self.target_node,
      self.target_port,
      self.source_node,
      self.source_port,
    )
  }
}

impl fmt::Display for ConnectionId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(
      f,
      "{}:{} -> {}:{}",
      self.source_node, self.source_port, self.target_node, self.target_port
    )
  }
}

/// Identifier of an edge in the global (uuid-keyed) connection model.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct ConnectionUuid {
  /// Uuid of the node the edge leaves.
  pub source_node: NodeUuid,
  /// Port on the source node.
  pub source_port: PortId,
  /// Uuid of the node the edge enters.
  pub target_node: NodeUuid,
  /// Port on the target node.
  pub target_port: PortId,
}

impl fmt::Display for ConnectionUuid {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(
      f,
      "{}:{} -> {}:{}",
      self.source_node, self.source_port, self.target_node, self.target_port
    )
  }
}

/// Identifier of one [`ExecutionModel`](crate::execution::ExecutionModel) instance.
///
/// Used as the key of the per-model counters kept by
/// [`Synchronization`](crate::sync::Synchronization).
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct ModelId(u64);

static NEXT_MODEL_ID: AtomicU64 = AtomicU64::new(1);

impl ModelId {
  /// Allocates a process-unique model id.
  pub fn next() -> Self {
    Self(NEXT_MODEL_ID.fetch_add(1, Ordering::Relaxed))
  }

  /// Returns the raw value.
  #[inline]
  pub const fn as_u64(self) -> u64 {
    self.0
  }
}

impl fmt::Display for ModelId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "model-{}", self.0)
  }
}
