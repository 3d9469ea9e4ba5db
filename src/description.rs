//! # Structural Description
//!
//! A plain, serde-serialisable snapshot of a graph's structure: node types,
//! ids, uuids, captions, ports and connections, nested groups included. It is
//! the surface persistence collaborators serialise against; behaviours and
//! cached data are not part of it.

use crate::graph::Graph;
use crate::ids::{ConnectionId, NodeId, NodeUuid};
use crate::node::{EvalMode, Node, NodeRole};
use crate::port::Port;
use serde::{Deserialize, Serialize};

/// Structure of one graph level.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphDescription {
  /// Nodes, sorted by id.
  pub nodes: Vec<NodeDescription>,
  /// Connections, sorted.
  pub connections: Vec<ConnectionId>,
}

/// Structure of one node.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeDescription {
  /// Local id.
  pub id: NodeId,
  /// Stable uuid.
  pub uuid: NodeUuid,
  /// Type name.
  pub type_name: String,
  /// Caption.
  pub caption: String,
  /// Structural role.
  pub role: NodeRole,
  /// Evaluation mode, if set explicitly.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub eval_mode: Option<EvalMode>,
  /// Activity flag.
  pub active: bool,
  /// Input ports in order.
  pub inputs: Vec<Port>,
  /// Output ports in order.
  pub outputs: Vec<Port>,
  /// Nested graph of a group.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub group: Option<GraphDescription>,
}

impl NodeDescription {
  fn of(node: &Node) -> Self {
    Self {
      id: node.id(),
      uuid: node.uuid(),
      type_name: node.type_name().to_string(),
      caption: node.caption().to_string(),
      role: node.role(),
      eval_mode: node.explicit_eval_mode(),
      active: node.is_active(),
      inputs: node.inputs.clone(),
      outputs: node.outputs.clone(),
      group: node.as_group().map(Graph::describe),
    }
  }
}

impl GraphDescription {
  /// Serialises the description to pretty-printed JSON.
  ///
  /// # Errors
  ///
  /// Returns the serde error if serialisation fails.
  pub fn to_json(&self) -> Result<String, serde_json::Error> {
    serde_json::to_string_pretty(self)
  }

  /// Total number of nodes, nested levels included.
  pub fn node_count(&self) -> usize {
    self
      .nodes
      .iter()
      .map(|node| 1 + node.group.as_ref().map_or(0, GraphDescription::node_count))
      .sum()
  }
}

impl Graph {
  /// Describes the structure of this graph and every nested group.
  pub fn describe(&self) -> GraphDescription {
    let mut nodes: Vec<NodeDescription> = self.nodes().map(NodeDescription::of).collect();
    nodes.sort_by_key(|node| node.id);
    GraphDescription {
      nodes,
      connections: self.connection_ids(),
    }
  }
}
