//! # Nodes
//!
//! A [`Node`] is a unit of computation with an ordered list of input and output
//! [`Port`]s, an activity flag and an [`EvalMode`]. What a node computes is
//! supplied by a [`NodeBehavior`]: the graph engine never looks inside it, it
//! only calls [`NodeBehavior::eval`] once per output port with the node's
//! current inputs.
//!
//! A node may also be a **group**: it owns a nested [`Graph`] whose synthetic
//! input/output provider nodes mirror the group's own ports and bridge the
//! parent scope with the nested one.
//!
//! ## Example
//!
//! ```rust
//! use nodeweave::{EvalMode, Node, NodeData, Port, from_fn};
//!
//! let doubler = Node::new(
//!   "double",
//!   from_fn(|ctx, _port| {
//!     let value = ctx.input_value::<i64>(nodeweave::PortId(0))?;
//!     Ok(Some(NodeData::new(value * 2)))
//!   }),
//! )
//! .with_input(Port::new("int", "in"))
//! .with_output(Port::new("int", "out"))
//! .with_eval_mode(EvalMode::Blocking);
//!
//! assert_eq!(doubler.ports(nodeweave::PortDirection::Out).len(), 1);
//! ```

use crate::data::NodeData;
use crate::error::EvalError;
use crate::graph::Graph;
use crate::ids::{NodeId, NodeUuid, PortId};
use crate::port::{Port, PortDirection};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use tracing::warn;

/// How a node is executed.
///
/// The mode, not the scheduler, selects the executor used for a node.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvalMode {
  /// Evaluated synchronously on the owning thread. For cheap computations.
  Blocking,
  /// Evaluated on a worker thread while no other node, in any execution
  /// model sharing the same synchronization object, is evaluating.
  Exclusive,
  /// Evaluated on a worker thread against a snapshot of the node.
  #[default]
  Detached,
}

impl EvalMode {
  /// Returns `true` if nodes of this mode run on the worker pool.
  pub const fn is_background(self) -> bool {
    !matches!(self, EvalMode::Blocking)
  }
}

/// Structural role of a node, used by the global model and the scheduler.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeRole {
  /// A plain computation node.
  Regular,
  /// A node wrapping a nested graph.
  Group,
  /// Synthetic node exposing a group's inputs inside the nested graph.
  InputProvider,
  /// Synthetic node collecting a group's outputs inside the nested graph.
  OutputProvider,
}

impl NodeRole {
  /// Returns `true` for the synthetic boundary providers.
  pub const fn is_provider(self) -> bool {
    matches!(self, NodeRole::InputProvider | NodeRole::OutputProvider)
  }
}

/// Read-only view of a node's state handed to [`NodeBehavior::eval`].
///
/// The values are a snapshot: on background executors they were copied out of
/// the execution model before the evaluation started.
pub struct EvalContext<'a> {
  uuid: NodeUuid,
  caption: &'a str,
  inputs: &'a [(PortId, Option<NodeData>)],
  outputs: &'a [(PortId, Option<NodeData>)],
}

impl<'a> EvalContext<'a> {
  pub(crate) fn new(
    uuid: NodeUuid,
    caption: &'a str,
    inputs: &'a [(PortId, Option<NodeData>)],
    outputs: &'a [(PortId, Option<NodeData>)],
  ) -> Self {
    Self {
      uuid,
      caption,
      inputs,
      outputs,
    }
  }

  /// Uuid of the evaluated node.
  pub fn uuid(&self) -> NodeUuid {
    self.uuid
  }

  /// Caption of the evaluated node.
  pub fn caption(&self) -> &str {
    self.caption
  }

  /// Data on input `port`, if any.
  pub fn input(&self, port: PortId) -> Option<&NodeData> {
    self
      .inputs
      .iter()
      .find(|(id, _)| *id == port)
      .and_then(|(_, data)| data.as_ref())
  }

  /// Typed data on input `port`.
  ///
  /// # Errors
  ///
  /// [`EvalError::MissingInput`] if the port carries no data and
  /// [`EvalError::TypeMismatch`] if it carries data of another type.
  pub fn input_value<T: Any>(&self, port: PortId) -> Result<&T, EvalError> {
    let data = self.input(port).ok_or(EvalError::MissingInput(port))?;
    data.value::<T>().ok_or_else(|| EvalError::TypeMismatch {
      port,
      expected: std::any::type_name::<T>().to_string(),
    })
  }

  /// All inputs in port order.
  pub fn inputs(&self) -> &[(PortId, Option<NodeData>)] {
    self.inputs
  }

  /// Data last committed on output `port`, if any.
  pub fn previous_output(&self, port: PortId) -> Option<&NodeData> {
    self
      .outputs
      .iter()
      .find(|(id, _)| *id == port)
      .and_then(|(_, data)| data.as_ref())
  }
}

/// The computation performed by a node.
///
/// Implementations must be cheap to clone: background executors evaluate a
/// clone of the behaviour so that edits to the live node cannot reach an
/// evaluation in flight. Shared state that must be observed from outside (for
/// instance a recorder in tests) belongs behind an `Arc`.
pub trait NodeBehavior: BehaviorClone + Send + Sync + 'static {
  /// Computes the value of output `port`.
  ///
  /// Called once per output port. Nodes without output ports are called once
  /// with `port == None`. Returning `Ok(None)` commits an empty value.
  fn eval(&self, ctx: &EvalContext<'_>, port: Option<PortId>) -> Result<Option<NodeData>, EvalError>;

  /// Unique behaviours may appear at most once per graph level.
  fn is_unique(&self) -> bool {
    false
  }
}

/// Object-safe cloning for [`NodeBehavior`], implemented for every `Clone` behaviour.
pub trait BehaviorClone {
  /// Clones the behaviour into a new box.
  fn clone_box(&self) -> Box<dyn NodeBehavior>;
}

impl<T> BehaviorClone for T
where
  T: NodeBehavior + Clone,
{
  fn clone_box(&self) -> Box<dyn NodeBehavior> {
    Box::new(self.clone())
  }
}

impl Clone for Box<dyn NodeBehavior> {
  fn clone(&self) -> Self {
    self.clone_box()
  }
}

type EvalFn =
  dyn Fn(&EvalContext<'_>, Option<PortId>) -> Result<Option<NodeData>, EvalError> + Send + Sync;

/// A behaviour backed by a closure. Built with [`from_fn`].
#[derive(Clone)]
pub struct FnBehavior {
  eval: Arc<EvalFn>,
  unique: bool,
}

impl FnBehavior {
  /// Marks the behaviour unique.
  pub fn unique(mut self) -> Self {
    self.unique = true;
    self
  }
}

impl NodeBehavior for FnBehavior {
  fn eval(&self, ctx: &EvalContext<'_>, port: Option<PortId>) -> Result<Option<NodeData>, EvalError> {
    (self.eval)(ctx, port)
  }

  fn is_unique(&self) -> bool {
    self.unique
  }
}

/// Builds a [`NodeBehavior`] from a closure.
pub fn from_fn<F>(eval: F) -> FnBehavior
where
  F: Fn(&EvalContext<'_>, Option<PortId>) -> Result<Option<NodeData>, EvalError>
    + Send
    + Sync
    + 'static,
{
  FnBehavior {
    eval: Arc::new(eval),
    unique: false,
  }
}

/// Copies input `p` to output `p`. Used for groups and boundary providers,
/// whose inputs are gathered by the execution model under the output ids.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct PassThrough;

impl NodeBehavior for PassThrough {
  fn eval(&self, ctx: &EvalContext<'_>, port: Option<PortId>) -> Result<Option<NodeData>, EvalError> {
    Ok(port.and_then(|port| ctx.input(port).cloned()))
  }
}

/// What a node is.
pub enum NodeKind {
  /// A computation node.
  Behavior(Box<dyn NodeBehavior>),
  /// A group wrapping a nested graph.
  Group(Box<Graph>),
  /// Boundary node exposing the owning group's inputs.
  InputProvider,
  /// Boundary node collecting the owning group's outputs.
  OutputProvider,
}

impl NodeKind {
  /// The role matching this kind.
  pub fn role(&self) -> NodeRole {
    match self {
      NodeKind::Behavior(_) => NodeRole::Regular,
      NodeKind::Group(_) => NodeRole::Group,
      NodeKind::InputProvider => NodeRole::InputProvider,
      NodeKind::OutputProvider => NodeRole::OutputProvider,
    }
  }
}

/// Type name given to group nodes created by [`Node::group`].
pub const GROUP_TYPE: &str = "nodeweave.group";
/// Type name of input provider nodes.
pub const INPUT_PROVIDER_TYPE: &str = "nodeweave.group_input";
/// Type name of output provider nodes.
pub const OUTPUT_PROVIDER_TYPE: &str = "nodeweave.group_output";

/// A unit of computation in a [`Graph`].
pub struct Node {
  pub(crate) id: NodeId,
  pub(crate) uuid: NodeUuid,
  type_name: String,
  caption: String,
  pub(crate) inputs: Vec<Port>,
  pub(crate) outputs: Vec<Port>,
  pub(crate) active: bool,
  eval_mode: Option<EvalMode>,
  pub(crate) kind: NodeKind,
  next_port_id: u32,
}

impl Node {
  /// Creates a computation node of type `type_name`.
  pub fn new(type_name: impl Into<String>, behavior: impl NodeBehavior) -> Self {
    Self::with_kind(type_name.into(), NodeKind::Behavior(Box::new(behavior)))
  }

  /// Creates a group node wrapping `graph`. Groups are always evaluated in place.
  pub fn group(graph: Graph) -> Self {
    let mut node = Self::with_kind(GROUP_TYPE.to_string(), NodeKind::Group(Box::new(graph)));
    node.eval_mode = Some(EvalMode::Blocking);
    node
  }

  pub(crate) fn input_provider() -> Self {
    Self::provider(INPUT_PROVIDER_TYPE, NodeKind::InputProvider, "Input")
  }

  pub(crate) fn output_provider() -> Self {
    Self::provider(OUTPUT_PROVIDER_TYPE, NodeKind::OutputProvider, "Output")
  }

  fn provider(type_name: &str, kind: NodeKind, caption: &str) -> Self {
    let mut node = Self::with_kind(type_name.to_string(), kind);
    node.caption = caption.to_string();
    node.eval_mode = Some(EvalMode::Blocking);
    node
  }

  fn with_kind(type_name: String, kind: NodeKind) -> Self {
    Self {
      id: NodeId::INVALID,
      uuid: NodeUuid::new(),
      caption: type_name.clone(),
      type_name,
      inputs: Vec::new(),
      outputs: Vec::new(),
      active: true,
      eval_mode: None,
      kind,
      next_port_id: 0,
    }
  }

  /// Requests a local id. Whether it is kept depends on the append policy.
  pub fn with_id(mut self, id: NodeId) -> Self {
    self.id = id;
    self
  }

  /// Sets the caption.
  pub fn with_caption(mut self, caption: impl Into<String>) -> Self {
    self.caption = caption.into();
    self
  }

  /// Sets the evaluation mode.
  pub fn with_eval_mode(mut self, mode: EvalMode) -> Self {
    self.eval_mode = Some(mode);
    self
  }

  /// Sets the initial activity flag.
  pub fn with_active(mut self, active: bool) -> Self {
    self.active = active;
    self
  }

  /// Adds an input port. The port is dropped with a warning once every port
  /// id of the node is taken.
  pub fn with_input(mut self, port: Port) -> Self {
    if self.insert_port(PortDirection::In, port, None).is_none() {
      warn!(node = %self.uuid, "port ids exhausted, input port dropped");
    }
    self
  }

  /// Adds an output port. The port is dropped with a warning once every port
  /// id of the node is taken.
  pub fn with_output(mut self, port: Port) -> Self {
    if self.insert_port(PortDirection::Out, port, None).is_none() {
      warn!(node = %self.uuid, "port ids exhausted, output port dropped");
    }
    self
  }

  /// Local id; [`NodeId::INVALID`] until appended.
  pub fn id(&self) -> NodeId {
    self.id
  }

  /// Stable uuid.
  pub fn uuid(&self) -> NodeUuid {
    self.uuid
  }

  /// Type name of the node.
  pub fn type_name(&self) -> &str {
    &self.type_name
  }

  /// Caption of the node.
  pub fn caption(&self) -> &str {
    &self.caption
  }

  /// Changes the caption.
  pub fn set_caption(&mut self, caption: impl Into<String>) {
    self.caption = caption.into();
  }

  /// Activity flag. Inactive nodes are never evaluated.
  pub fn is_active(&self) -> bool {
    self.active
  }

  /// Evaluation mode, defaulting to [`EvalMode::Detached`].
  pub fn eval_mode(&self) -> EvalMode {
    self.eval_mode.unwrap_or_default()
  }

  /// Evaluation mode if one was set explicitly.
  pub fn explicit_eval_mode(&self) -> Option<EvalMode> {
    self.eval_mode
  }

  /// Structural role.
  pub fn role(&self) -> NodeRole {
    self.kind.role()
  }

  /// The node's kind.
  pub fn kind(&self) -> &NodeKind {
    &self.kind
  }

  /// Returns `true` for group nodes.
  pub fn is_group(&self) -> bool {
    matches!(self.kind, NodeKind::Group(_))
  }

  /// The nested graph of a group node.
  pub fn as_group(&self) -> Option<&Graph> {
    match &self.kind {
      NodeKind::Group(graph) => Some(graph),
      _ => None,
    }
  }

  /// The nested graph of a group node, mutably.
  pub fn as_group_mut(&mut self) -> Option<&mut Graph> {
    match &mut self.kind {
      NodeKind::Group(graph) => Some(graph),
      _ => None,
    }
  }

  /// The behaviour of a computation node.
  pub fn behavior(&self) -> Option<&dyn NodeBehavior> {
    match &self.kind {
      NodeKind::Behavior(behavior) => Some(behavior.as_ref()),
      _ => None,
    }
  }

  /// Returns `true` if a behaviour marked unique drives this node.
  /// Boundary providers are always unique.
  pub fn is_unique(&self) -> bool {
    match &self.kind {
      NodeKind::Behavior(behavior) => behavior.is_unique(),
      NodeKind::Group(_) => false,
      NodeKind::InputProvider | NodeKind::OutputProvider => true,
    }
  }

  /// Ports of one direction, in order.
  pub fn ports(&self, direction: PortDirection) -> &[Port] {
    match direction {
      PortDirection::In => &self.inputs,
      PortDirection::Out => &self.outputs,
    }
  }

  /// Port with id `id` in either direction.
  pub fn port(&self, id: PortId) -> Option<&Port> {
    self
      .inputs
      .iter()
      .chain(self.outputs.iter())
      .find(|port| port.id == id)
  }

  /// Direction of port `id`.
  pub fn port_direction(&self, id: PortId) -> Option<PortDirection> {
    if self.inputs.iter().any(|port| port.id == id) {
      Some(PortDirection::In)
    } else if self.outputs.iter().any(|port| port.id == id) {
      Some(PortDirection::Out)
    } else {
      None
    }
  }

  /// Index of port `id` within its direction.
  pub fn port_index(&self, id: PortId) -> Option<usize> {
    self
      .inputs
      .iter()
      .position(|port| port.id == id)
      .or_else(|| self.outputs.iter().position(|port| port.id == id))
  }

  /// Port at `index` of `direction`.
  pub fn port_at(&self, direction: PortDirection, index: usize) -> Option<&Port> {
    self.ports(direction).get(index)
  }

  /// Inserts `port` at `index` (or at the end). Keeps a requested id when it is
  /// free, otherwise assigns the next unused id. Returns the id, or `None` if
  /// no id is left.
  pub(crate) fn insert_port(
    &mut self,
    direction: PortDirection,
    mut port: Port,
    index: Option<usize>,
  ) -> Option<PortId> {
    if !port.id.is_valid() || self.port(port.id).is_some() {
      port.id = self.allocate_port_id()?;
    }
    self.next_port_id = self.next_port_id.max(port.id.0.saturating_add(1));
    let id = port.id;
    let ports = match direction {
      PortDirection::In => &mut self.inputs,
      PortDirection::Out => &mut self.outputs,
    };
    let index = index.unwrap_or(ports.len()).min(ports.len());
    ports.insert(index, port);
    Some(id)
  }

  /// First free id at or above `next_port_id`, wrapping around to the lowest
  /// free id once the counter reaches [`PortId::INVALID`].
  fn allocate_port_id(&self) -> Option<PortId> {
    let free = |id: &u32| self.port(PortId(*id)).is_none();
    (self.next_port_id..u32::MAX)
      .find(free)
      .or_else(|| (0..self.next_port_id).find(free))
      .map(PortId)
  }

  /// Removes port `id`, returning it with its direction.
  pub(crate) fn take_port(&mut self, id: PortId) -> Option<(PortDirection, Port)> {
    if let Some(index) = self.inputs.iter().position(|port| port.id == id) {
      return Some((PortDirection::In, self.inputs.remove(index)));
    }
    if let Some(index) = self.outputs.iter().position(|port| port.id == id) {
      return Some((PortDirection::Out, self.outputs.remove(index)));
    }
    None
  }
}

impl fmt::Debug for Node {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Node")
      .field("id", &self.id)
      .field("uuid", &self.uuid)
      .field("type_name", &self.type_name)
      .field("caption", &self.caption)
      .field("role", &self.role())
      .field("inputs", &self.inputs)
      .field("outputs", &self.outputs)
      .field("active", &self.active)
      .field("eval_mode", &self.eval_mode())
      .finish()
  }
}
