//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use nodeweave::{
  ConnectionId, EvalError, ExecutionConfig, ExecutionModel, Graph, Node, NodeData, NodeId, NodeIdPolicy, NodeUuid,
  Port, PortId, Synchronization, from_fn,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

pub const TIMEOUT: Duration = Duration::from_secs(10);

/// Routes `tracing` output through the test harness. Safe to call repeatedly.
pub fn init_tracing() {
  let _ = tracing_subscriber::fmt()
    .with_test_writer()
    .with_max_level(tracing::Level::DEBUG)
    .try_init();
}

/// A model with its own synchronization object, so tests don't share slots.
pub fn isolated_model(graph: Graph, config: ExecutionConfig) -> ExecutionModel {
  ExecutionModel::builder()
    .graph(graph)
    .config(config)
    .synchronization(Arc::new(Synchronization::new()))
    .build()
    .expect("model builds")
}

pub fn append(graph: &mut Graph, node: Node) -> (NodeId, NodeUuid) {
  let node = graph
    .append_node(node, NodeIdPolicy::Update)
    .expect("node appends");
  (node.id(), node.uuid())
}

pub fn link(graph: &mut Graph, from: NodeId, from_port: u32, to: NodeId, to_port: u32) {
  graph
    .append_connection(ConnectionId::new(from, PortId(from_port), to, PortId(to_port)))
    .expect("connection appends");
}

/// Output port 0, written from outside with `set_node_data`.
pub fn source() -> Node {
  Node::new("source", from_fn(|_, _| Ok(None))).with_output(Port::new("int", "out"))
}

/// Input port 0, output port 1. Forwards its input and counts its runs.
pub fn counted_relay(calls: &Arc<AtomicUsize>) -> Node {
  let calls = Arc::clone(calls);
  Node::new(
    "relay",
    from_fn(move |ctx, _| {
      calls.fetch_add(1, Ordering::SeqCst);
      Ok(ctx.input(PortId(0)).cloned())
    }),
  )
  .with_input(Port::new("int", "in"))
  .with_output(Port::new("int", "out"))
}

/// Input port 0, output port 1, computing `f(input)`.
pub fn map(name: &str, f: fn(i64) -> i64) -> Node {
  Node::new(
    name.to_string(),
    from_fn(move |ctx, _| Ok(Some(NodeData::new(f(*ctx.input_value::<i64>(PortId(0))?))))),
  )
  .with_input(Port::new("int", "in"))
  .with_output(Port::new("int", "out"))
}

/// Output port 0. Always fails.
pub fn broken(message: &'static str) -> Node {
  Node::new("broken", from_fn(move |_, _| Err(EvalError::failed(message)))).with_output(Port::new("int", "out"))
}

pub fn int(model: &ExecutionModel, node: NodeUuid, port: u32) -> Option<i64> {
  model
    .node_data(node, PortId(port))
    .expect("known port")
    .and_then(|data| data.value::<i64>().copied())
}

pub fn set(model: &mut ExecutionModel, node: NodeUuid, port: u32, value: i64) {
  model
    .set_node_data(node, PortId(port), Some(NodeData::new(value)))
    .expect("known port");
}
