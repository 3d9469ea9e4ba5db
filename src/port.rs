//! # Ports and Type Conversions
//!
//! A [`Port`] is a typed, named slot on a node. Its `type_id` is a string tag
//! naming the concrete type of the data it carries (e.g. `"int"`). Two ports can
//! only be connected if their type ids are identical or the pair has been
//! declared convertible in a [`TypeConversions`] table.

use crate::data::NodeData;
use crate::ids::PortId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Direction of a port relative to its node.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortDirection {
  /// Data flows into the node.
  In,
  /// Data flows out of the node.
  Out,
}

impl PortDirection {
  /// The other direction.
  pub const fn opposite(self) -> Self {
    match self {
      PortDirection::In => PortDirection::Out,
      PortDirection::Out => PortDirection::In,
    }
  }
}

impl fmt::Display for PortDirection {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      PortDirection::In => write!(f, "in"),
      PortDirection::Out => write!(f, "out"),
    }
  }
}

/// A typed slot on a node.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Port {
  /// Id of the port, assigned by the node when the port is added.
  pub id: PortId,
  /// Tag naming the type of the carried data.
  pub type_id: String,
  /// Human readable name.
  pub caption: String,
  /// Optional input ports do not have to carry data for the node to be evaluated.
  pub optional: bool,
}

impl Port {
  /// Creates a required port. Its id is assigned when it is added to a node.
  ///
  /// # Example
  ///
  /// ```rust
  /// use nodeweave::Port;
  ///
  /// let port = Port::new("int", "value").optional();
  /// assert!(port.optional);
  /// ```
  pub fn new(type_id: impl Into<String>, caption: impl Into<String>) -> Self {
    Self {
      id: PortId::INVALID,
      type_id: type_id.into(),
      caption: caption.into(),
      optional: false,
    }
  }

  /// Marks the port as optional.
  pub fn optional(mut self) -> Self {
    self.optional = true;
    self
  }

  /// Requests a specific id. The node still rejects ids that are already taken.
  pub fn with_id(mut self, id: PortId) -> Self {
    self.id = id;
    self
  }
}

/// Converts a value between two port types.
pub type Converter = Arc<dyn Fn(&NodeData) -> Option<NodeData> + Send + Sync>;

/// Table of port type pairs declared convertible.
///
/// Identical type ids are always convertible. A pair registered without a
/// converter passes data through unchanged.
#[derive(Clone, Default)]
pub struct TypeConversions {
  table: HashMap<(String, String), Option<Converter>>,
}

impl TypeConversions {
  /// Creates an empty table.
  pub fn new() -> Self {
    Self::default()
  }

  /// Declares `from -> to` convertible, passing values through unchanged.
  pub fn register(&mut self, from: impl Into<String>, to: impl Into<String>) {
    self.table.insert((from.into(), to.into()), None);
  }

  /// Declares `from -> to` convertible using `converter`.
  pub fn register_with<F>(&mut self, from: impl Into<String>, to: impl Into<String>, converter: F)
  where
    F: Fn(&NodeData) -> Option<NodeData> + Send + Sync + 'static,
  {
    self
      .table
      .insert((from.into(), to.into()), Some(Arc::new(converter)));
  }

  /// Returns `true` if data of type `from` may flow into a port of type `to`.
  pub fn can_convert(&self, from: &str, to: &str) -> bool {
    from == to || self.table.contains_key(&(from.to_string(), to.to_string()))
  }

  /// Converts `data` from type `from` to type `to`.
  ///
  /// Returns the data unchanged for identical types or converter-less pairs, and
  /// `None` if the pair is not convertible or the converter rejects the value.
  pub fn convert(&self, from: &str, to: &str, data: &NodeData) -> Option<NodeData> {
    if from == to {
      return Some(data.clone());
    }
    match self.table.get(&(from.to_string(), to.to_string()))? {
      Some(converter) => converter(data),
      None => Some(data.clone()),
    }
  }

  /// Adds the pairs of `other` that are not declared here yet.
  pub(crate) fn merge(&mut self, other: TypeConversions) {
    for (pair, converter) in other.table {
      self.table.entry(pair).or_insert(converter);
    }
  }
}

impl fmt::Debug for TypeConversions {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_set().entries(self.table.keys()).finish()
  }
}
