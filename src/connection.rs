//! # Connections
//!
//! A [`Connection`] is an immutable directed edge from an output port of one
//! node to an input port of another node in the same graph level. It is only
//! created by [`Graph::append_connection`](crate::graph::Graph::append_connection),
//! which validates it first.

use crate::ids::{ConnectionId, NodeId, PortId};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A directed edge between two ports.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub struct Connection {
  id: ConnectionId,
}

impl Connection {
  /// Describes a connection from `source_node:source_port` to `target_node:target_port`.
  pub fn new(
    source_node: NodeId,
    source_port: PortId,
    target_node: NodeId,
    target_port: PortId,
  ) -> Self {
    Self {
      id: ConnectionId::new(source_node, source_port, target_node, target_port),
    }
  }

  /// The connection's id.
  pub fn id(&self) -> ConnectionId {
    self.id
  }

  /// Node owning the output port.
  pub fn source_node(&self) -> NodeId {
    self.id.source_node
  }

  /// Output port.
  pub fn source_port(&self) -> PortId {
    self.id.source_port
  }

  /// Node owning the input port.
  pub fn target_node(&self) -> NodeId {
    self.id.target_node
  }

  /// Input port.
  pub fn target_port(&self) -> PortId {
    self.id.target_port
  }
}

impl From<ConnectionId> for Connection {
  fn from(id: ConnectionId) -> Self {
    Self { id }
  }
}

impl From<Connection> for ConnectionId {
  fn from(connection: Connection) -> Self {
    connection.id
  }
}

impl fmt::Display for Connection {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    self.id.fmt(f)
  }
}
