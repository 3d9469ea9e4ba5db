//! Per-node and per-port cache entries.

use crate::data::NodeData;
use crate::event::NodeEvalState;
use crate::ids::PortId;
use crate::node::Node;
use crate::port::{Port, PortDirection};
use serde::{Deserialize, Serialize};

/// Freshness of one cached port value.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortState {
  /// The value must be recomputed before use.
  #[default]
  Outdated,
  /// The value is up to date.
  Valid,
}

/// Cached value of one port.
#[derive(Clone, Debug)]
pub struct PortEntry {
  /// Port the value belongs to.
  pub port: PortId,
  /// Cached value.
  pub data: Option<NodeData>,
  /// Freshness of the value.
  pub state: PortState,
}

impl PortEntry {
  fn new(port: PortId) -> Self {
    Self {
      port,
      data: None,
      state: PortState::Outdated,
    }
  }

  /// Returns `true` if the value is up to date.
  pub fn is_valid(&self) -> bool {
    self.state == PortState::Valid
  }
}

/// Evaluation state and port cache of one node.
#[derive(Clone, Debug)]
pub(crate) struct NodeEntry {
  pub(crate) state: NodeEvalState,
  /// Set when the node is invalidated while evaluating; the in-flight result is discarded.
  pub(crate) stale: bool,
  /// Set when an upstream node failed while this one was evaluating.
  pub(crate) poisoned: bool,
  pub(crate) inputs: Vec<PortEntry>,
  pub(crate) outputs: Vec<PortEntry>,
}

impl NodeEntry {
  pub(crate) fn new(node: &Node) -> Self {
    Self {
      state: NodeEvalState::Outdated,
      stale: false,
      poisoned: false,
      inputs: node.ports(PortDirection::In).iter().map(|p| PortEntry::new(p.id)).collect(),
      outputs: node.ports(PortDirection::Out).iter().map(|p| PortEntry::new(p.id)).collect(),
    }
  }

  /// Brings the port lists in line with `node`, keeping cached values of
  /// surviving ports. Returns `true` if anything changed.
  pub(crate) fn sync_ports(&mut self, node: &Node) -> bool {
    let inputs = Self::sync_list(&mut self.inputs, node.ports(PortDirection::In));
    let outputs = Self::sync_list(&mut self.outputs, node.ports(PortDirection::Out));
    inputs || outputs
  }

  fn sync_list(entries: &mut Vec<PortEntry>, ports: &[Port]) -> bool {
    let unchanged = entries.len() == ports.len()
      && entries
        .iter()
        .zip(ports)
        .all(|(entry, port)| entry.port == port.id);
    if unchanged {
      return false;
    }
    let mut previous = std::mem::take(entries);
    for port in ports {
      let entry = match previous.iter().position(|entry| entry.port == port.id) {
        Some(index) => previous.swap_remove(index),
        None => PortEntry::new(port.id),
      };
      entries.push(entry);
    }
    true
  }

  pub(crate) fn input(&self, port: PortId) -> Option<&PortEntry> {
    self.inputs.iter().find(|entry| entry.port == port)
  }

  pub(crate) fn input_mut(&mut self, port: PortId) -> Option<&mut PortEntry> {
    self.inputs.iter_mut().find(|entry| entry.port == port)
  }

  pub(crate) fn output(&self, port: PortId) -> Option<&PortEntry> {
    self.outputs.iter().find(|entry| entry.port == port)
  }

  pub(crate) fn output_mut(&mut self, port: PortId) -> Option<&mut PortEntry> {
    self.outputs.iter_mut().find(|entry| entry.port == port)
  }

  pub(crate) fn port(&self, port: PortId) -> Option<&PortEntry> {
    self.input(port).or_else(|| self.output(port))
  }

  pub(crate) fn input_values(&self) -> Vec<(PortId, Option<NodeData>)> {
    Self::values(&self.inputs)
  }

  pub(crate) fn output_values(&self) -> Vec<(PortId, Option<NodeData>)> {
    Self::values(&self.outputs)
  }

  fn values(entries: &[PortEntry]) -> Vec<(PortId, Option<NodeData>)> {
    entries
      .iter()
      .map(|entry| (entry.port, entry.data.clone()))
      .collect()
  }

  pub(crate) fn all_outputs_valid(&self) -> bool {
    self.outputs.iter().all(PortEntry::is_valid)
  }

  pub(crate) fn outdate_outputs(&mut self) {
    for output in &mut self.outputs {
      output.state = PortState::Outdated;
    }
  }
}
