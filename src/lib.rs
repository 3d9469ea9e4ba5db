//! # nodeweave
//!
//! A node-based dataflow engine in pure Rust.
//!
//! Typed computation nodes are assembled into a directed acyclic [`Graph`];
//! an [`ExecutionModel`] evaluates them in dependency order, caches every port
//! value, and keeps the cache consistent as data or structure change.
//!
//! ## Key Features
//!
//! - **Validated structure**: connections are checked for direction, type
//!   convertibility, the single-input rule and cycles before anything changes
//! - **Nested graphs**: group nodes wrap sub-graphs whose dependencies are
//!   flattened into one global connection model
//! - **Cached evaluation**: per-port caches with invalidation propagation, so
//!   no node ever runs on stale data
//! - **Pluggable execution**: blocking, detached and exclusive nodes, the
//!   latter coordinated across every model of the process
//! - **Observable**: structural and evaluation events on typed channels, logs
//!   through `tracing`
//!
//! ## Quick Start
//!
//! ```rust
//! use nodeweave::{ConnectionId, ExecutionModel, Graph, Node, NodeData, NodeIdPolicy, Port, PortId, from_fn};
//! use std::time::Duration;
//!
//! let mut graph = Graph::new();
//! let source = graph
//!   .append_node(
//!     Node::new("number", from_fn(|_, _| Ok(Some(NodeData::new(20_i64))))).with_output(Port::new("int", "out")),
//!     NodeIdPolicy::Update,
//!   )?
//!   .id();
//! let double = graph
//!   .append_node(
//!     Node::new(
//!       "double",
//!       from_fn(|ctx, _| Ok(Some(NodeData::new(ctx.input_value::<i64>(PortId(0))? * 2)))),
//!     )
//!     .with_input(Port::new("int", "in"))
//!     .with_output(Port::new("int", "out")),
//!     NodeIdPolicy::Update,
//!   )?
//!   .id();
//! graph.append_connection(ConnectionId::new(source, PortId(0), double, PortId(0)))?;
//! let double = graph.find_node(double).map(|node| node.uuid()).ok_or("missing node")?;
//!
//! let mut model = ExecutionModel::new(graph)?;
//! let future = model.evaluate_node(double)?;
//! assert!(future.wait(&mut model, Duration::from_secs(5)));
//! let value = model.node_data(double, PortId(1))?;
//! assert_eq!(value.and_then(|v| v.value::<i64>().copied()), Some(40));
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

// Documentation enforcement - treat missing docs as errors
#![deny(missing_docs)]

/// Generation-checked arena backing node storage.
pub mod arena;
/// Execution model configuration.
pub mod config;
/// Connection value type.
pub mod connection;
/// Generic adjacency model and graph algorithms.
pub mod connection_model;
/// Type-erased port values.
pub mod data;
/// Serialisable structural description of graphs.
pub mod description;
/// Error types.
pub mod error;
/// Event bus and event types.
pub mod event;
/// Per-graph evaluation engine.
pub mod execution;
/// Evaluation strategies and the worker pool.
pub mod executor;
/// Graph container, validation and nested groups.
pub mod graph;
/// Local and global identifiers.
pub mod ids;
/// Nodes and node behaviours.
pub mod node;
/// Ports and type conversions.
pub mod port;
/// Cross-model coordination of exclusive nodes.
pub mod sync;

pub use config::ExecutionConfig;
pub use connection::Connection;
pub use data::NodeData;
pub use description::{GraphDescription, NodeDescription};
pub use error::{EvalError, ExecutionError, GraphError};
pub use event::{EventBus, ExecEvent, GraphEvent, NodeEvalState};
pub use execution::{ExecutionModel, FutureEvaluated, FutureStatus, PortState, TargetState};
pub use executor::{Executor, NodeSnapshot, WorkerPool};
pub use graph::{Graph, NodeIdPolicy, PortQuery};
pub use ids::{ConnectionId, ConnectionUuid, ModelId, NodeId, NodeUuid, PortId};
pub use node::{EvalContext, EvalMode, Node, NodeBehavior, NodeKind, NodeRole, from_fn};
pub use port::{Port, PortDirection, TypeConversions};
pub use sync::Synchronization;

#[cfg(test)]
mod config_test;
