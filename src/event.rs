//! # Events
//!
//! Typed publish/subscribe channels for structural and evaluation notifications.
//!
//! An [`EventBus`] fans every published event out to all live subscribers
//! through unbounded tokio channels. Subscribers never miss an event and
//! publishers never block; a subscriber that dropped its receiver is pruned on
//! the next publish.
//!
//! Two event families exist:
//!
//! - [`GraphEvent`]: structural changes, published by [`Graph`](crate::Graph)
//!   on the bus shared by a whole graph hierarchy.
//! - [`ExecEvent`]: evaluation progress, published by
//!   [`ExecutionModel`](crate::ExecutionModel).

use crate::ids::{ConnectionUuid, NodeUuid, PortId};
use crate::port::PortDirection;
use std::sync::{Mutex, PoisonError};
use tokio::sync::mpsc;

/// Fan-out channel for events of type `E`.
pub struct EventBus<E> {
  subscribers: Mutex<Vec<mpsc::UnboundedSender<E>>>,
}

impl<E> Default for EventBus<E> {
  fn default() -> Self {
    Self {
      subscribers: Mutex::new(Vec::new()),
    }
  }
}

impl<E: Clone> EventBus<E> {
  /// Creates a bus without subscribers.
  pub fn new() -> Self {
    Self::default()
  }

  /// Registers a new subscriber and returns its receiving end.
  ///
  /// # Example
  ///
  /// ```rust
  /// use nodeweave::event::EventBus;
  ///
  /// let bus = EventBus::<u32>::new();
  /// let mut rx = bus.subscribe();
  /// bus.publish(7);
  /// assert_eq!(rx.try_recv().ok(), Some(7));
  /// ```
  pub fn subscribe(&self) -> mpsc::UnboundedReceiver<E> {
    let (tx, rx) = mpsc::unbounded_channel();
    self
      .subscribers
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .push(tx);
    rx
  }

  /// Sends `event` to every live subscriber.
  pub fn publish(&self, event: E) {
    let mut subscribers = self
      .subscribers
      .lock()
      .unwrap_or_else(PoisonError::into_inner);
    subscribers.retain(|tx| tx.send(event.clone()).is_ok());
  }

  /// Number of live subscribers.
  pub fn subscriber_count(&self) -> usize {
    let mut subscribers = self
      .subscribers
      .lock()
      .unwrap_or_else(PoisonError::into_inner);
    subscribers.retain(|tx| !tx.is_closed());
    subscribers.len()
  }
}

/// Structural change of a graph hierarchy.
///
/// Nodes are named by uuid, so events stay meaningful across nesting levels.
/// `parent` is the uuid of the group whose nested graph holds the node, or
/// `None` at the root level.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GraphEvent {
  /// A node was appended.
  NodeAppended {
    /// Appended node.
    node: NodeUuid,
    /// Owning group.
    parent: Option<NodeUuid>,
  },
  /// A node was deleted.
  NodeDeleted {
    /// Deleted node.
    node: NodeUuid,
    /// Group that owned it.
    parent: Option<NodeUuid>,
  },
  /// A connection was appended.
  ConnectionAppended {
    /// Endpoints of the connection.
    connection: ConnectionUuid,
  },
  /// A connection was deleted.
  ConnectionDeleted {
    /// Endpoints of the connection.
    connection: ConnectionUuid,
  },
  /// A port was inserted into a node.
  PortInserted {
    /// Node owning the port.
    node: NodeUuid,
    /// New port.
    port: PortId,
    /// Direction of the port.
    direction: PortDirection,
  },
  /// A port is about to be removed; its connections are still in place.
  PortAboutToBeDeleted {
    /// Node owning the port.
    node: NodeUuid,
    /// Port being removed.
    port: PortId,
  },
  /// A port was removed.
  PortDeleted {
    /// Node that owned the port.
    node: NodeUuid,
    /// Removed port.
    port: PortId,
  },
  /// A connection was attached to a port.
  PortConnected {
    /// Node owning the port.
    node: NodeUuid,
    /// Connected port.
    port: PortId,
  },
  /// A connection was detached from a port.
  PortDisconnected {
    /// Node owning the port.
    node: NodeUuid,
    /// Disconnected port.
    port: PortId,
  },
  /// A node moved into another graph level.
  NodeMoved {
    /// Moved node.
    node: NodeUuid,
    /// Previous owning group.
    from: Option<NodeUuid>,
    /// New owning group.
    to: Option<NodeUuid>,
  },
  /// The modification counter left zero.
  ModificationStarted,
  /// The modification counter returned to zero.
  ModificationFinished,
  /// A node was activated or deactivated.
  NodeActivityChanged {
    /// Affected node.
    node: NodeUuid,
    /// New activity flag.
    active: bool,
  },
}

/// Evaluation state of a node as reported by the execution model.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeEvalState {
  /// Outputs are up to date.
  Valid,
  /// The last evaluation, or an upstream evaluation, failed.
  Invalid,
  /// Outputs must be recomputed.
  Outdated,
  /// An evaluation is in flight.
  Evaluating,
  /// Outdated, but dispatch is suspended (inactive node or modification in progress).
  Paused,
}

impl NodeEvalState {
  /// Returns `true` for states an evaluation ends in.
  pub const fn is_terminal(self) -> bool {
    matches!(self, NodeEvalState::Valid | NodeEvalState::Invalid)
  }
}

/// Evaluation progress of an execution model.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ExecEvent {
  /// A node committed fresh outputs.
  NodeEvaluated {
    /// Evaluated node.
    node: NodeUuid,
  },
  /// A node failed, or could not be launched.
  NodeEvaluationFailed {
    /// Failed node.
    node: NodeUuid,
    /// Human readable failure reason.
    reason: String,
  },
  /// The evaluation state of a node changed.
  NodeEvalStateChanged {
    /// Affected node.
    node: NodeUuid,
    /// New state.
    state: NodeEvalState,
  },
  /// Targets are pending but no node could be dispatched.
  GraphStalled {
    /// Nodes still waiting for evaluation.
    pending: Vec<NodeUuid>,
  },
  /// Every single-shot target reached a terminal state.
  TargetsSatisfied,
}
