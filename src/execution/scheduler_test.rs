//! # Execution Model Test Suite
//!
//! Tests for scheduling, caching and invalidation in [`ExecutionModel`].
//!
//! ## Test Coverage
//!
//! - **Caching**: values flow downstream, valid nodes are not re-run
//! - **Invalidation**: downstream-only outdating, stale results discarded
//! - **Failures**: propagation to dependents and explicit retry
//! - **Readiness**: stalls on missing inputs, optional ports, inactive nodes
//! - **Modification scopes**: deferred processing and the `Paused` state
//! - **Groups**: evaluation through the boundary providers
//! - **Futures**: join, callbacks, detach, deleted targets
//! - **Synchronization**: dispatch deferred by a foreign exclusive slot

use super::{ExecutionModel, FutureStatus, PortState, TargetState};
use crate::config::ExecutionConfig;
use crate::data::NodeData;
use crate::error::{EvalError, ExecutionError};
use crate::event::{ExecEvent, NodeEvalState};
use crate::graph::{Graph, NodeIdPolicy};
use crate::ids::{ConnectionId, ModelId, NodeId, NodeUuid, PortId};
use crate::node::{EvalMode, Node, from_fn};
use crate::port::Port;
use crate::sync::Synchronization;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, mpsc};
use std::time::Duration;

const TIMEOUT: Duration = Duration::from_secs(5);

// ============================================================================
// Helpers
// ============================================================================

fn model_for(graph: Graph) -> ExecutionModel {
  model_with_sync(graph, Arc::new(Synchronization::new()))
}

fn model_with_sync(graph: Graph, sync: Arc<Synchronization>) -> ExecutionModel {
  ExecutionModel::builder()
    .graph(graph)
    .config(
      ExecutionConfig::new()
        .with_default_eval_mode(EvalMode::Blocking)
        .with_worker_threads(2),
    )
    .synchronization(sync)
    .build()
    .unwrap()
}

/// Output port 0. Its value is normally written with `set_node_data`.
fn source() -> Node {
  Node::new("source", from_fn(|_, _| Ok(None))).with_output(Port::new("int", "out"))
}

/// Output port 0, always `value`.
fn constant(value: i64) -> Node {
  Node::new("constant", from_fn(move |_, _| Ok(Some(NodeData::new(value))))).with_output(Port::new("int", "out"))
}

/// Input port 0, output port 1. Forwards its input and counts its runs.
fn relay(calls: &Arc<AtomicUsize>) -> Node {
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

/// Input port 0, output port 1.
fn doubler() -> Node {
  Node::new(
    "double",
    from_fn(|ctx, _| Ok(Some(NodeData::new(ctx.input_value::<i64>(PortId(0))? * 2)))),
  )
  .with_input(Port::new("int", "in"))
  .with_output(Port::new("int", "out"))
}

/// Output port 0. Fails while `failing` is set.
fn flaky(failing: &Arc<AtomicBool>) -> Node {
  let failing = Arc::clone(failing);
  Node::new(
    "flaky",
    from_fn(move |_, _| {
      if failing.load(Ordering::SeqCst) {
        Err(EvalError::failed("boom"))
      } else {
        Ok(Some(NodeData::new(1_i64)))
      }
    }),
  )
  .with_output(Port::new("int", "out"))
}

fn append(graph: &mut Graph, node: Node) -> (NodeId, NodeUuid) {
  let node = graph.append_node(node, NodeIdPolicy::Update).unwrap();
  (node.id(), node.uuid())
}

fn link(graph: &mut Graph, from: NodeId, from_port: u32, to: NodeId, to_port: u32) -> ConnectionId {
  graph
    .append_connection(ConnectionId::new(from, PortId(from_port), to, PortId(to_port)))
    .unwrap()
}

fn set(model: &mut ExecutionModel, node: NodeUuid, port: u32, value: i64) {
  model
    .set_node_data(node, PortId(port), Some(NodeData::new(value)))
    .unwrap();
}

fn int(model: &ExecutionModel, node: NodeUuid, port: u32) -> Option<i64> {
  model
    .node_data(node, PortId(port))
    .unwrap()
    .and_then(|data| data.value::<i64>().copied())
}

fn state(model: &ExecutionModel, node: NodeUuid) -> NodeEvalState {
  model.node_eval_state(node).unwrap()
}

fn drain(rx: &mut tokio::sync::mpsc::UnboundedReceiver<ExecEvent>) -> Vec<ExecEvent> {
  let mut events = Vec::new();
  while let Ok(event) = rx.try_recv() {
    events.push(event);
  }
  events
}

// ============================================================================
// Caching
// ============================================================================

#[test]
fn test_value_reaches_sink_and_is_cached() {
  let calls = Arc::new(AtomicUsize::new(0));
  let mut graph = Graph::new();
  let (src, src_uuid) = append(&mut graph, source());
  let (sink, sink_uuid) = append(&mut graph, relay(&calls));
  link(&mut graph, src, 0, sink, 0);
  let mut model = model_for(graph);

  set(&mut model, src_uuid, 0, 42);
  let future = model.evaluate_node(sink_uuid).unwrap();
  assert!(future.wait(&mut model, TIMEOUT));
  assert_eq!(int(&model, sink_uuid, 1), Some(42));
  assert_eq!(state(&model, sink_uuid), NodeEvalState::Valid);

  set(&mut model, src_uuid, 0, 7);
  assert_eq!(state(&model, sink_uuid), NodeEvalState::Outdated);
  assert_eq!(int(&model, sink_uuid, 0), Some(7));
  assert_eq!(model.port_state(sink_uuid, PortId(0)).unwrap(), PortState::Valid);
  assert_eq!(model.port_state(sink_uuid, PortId(1)).unwrap(), PortState::Outdated);
  assert!(model.run_until_idle(TIMEOUT));
  assert_eq!(calls.load(Ordering::SeqCst), 1, "not re-run without a request");

  let future = model.evaluate_node(sink_uuid).unwrap();
  assert!(future.wait(&mut model, TIMEOUT));
  assert_eq!(int(&model, sink_uuid, 1), Some(7));
  assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[test]
fn test_valid_dependencies_are_not_reevaluated() {
  let first = Arc::new(AtomicUsize::new(0));
  let second = Arc::new(AtomicUsize::new(0));
  let mut graph = Graph::new();
  let (a, _) = append(&mut graph, constant(3));
  let (b, b_uuid) = append(&mut graph, relay(&first));
  let (c, c_uuid) = append(&mut graph, relay(&second));
  link(&mut graph, a, 0, b, 0);
  link(&mut graph, b, 1, c, 0);
  let mut model = model_for(graph);
  let mut events = model.subscribe();

  assert!(model.evaluate_node(c_uuid).unwrap().wait(&mut model, TIMEOUT));
  let future = model.evaluate_node(c_uuid).unwrap();
  assert_eq!(future.status(&model), FutureStatus::Succeeded);

  assert_eq!(first.load(Ordering::SeqCst), 1);
  assert_eq!(second.load(Ordering::SeqCst), 1);
  assert_eq!(state(&model, b_uuid), NodeEvalState::Valid);
  let satisfied = drain(&mut events)
    .into_iter()
    .filter(|e| *e == ExecEvent::TargetsSatisfied)
    .count();
  assert_eq!(satisfied, 2);
}

#[test]
fn test_evaluate_graph_runs_every_node() {
  let mut graph = Graph::new();
  let (a, a_uuid) = append(&mut graph, constant(5));
  let (b, b_uuid) = append(&mut graph, doubler());
  let (_, c_uuid) = append(&mut graph, constant(1));
  link(&mut graph, a, 0, b, 0);
  let mut model = model_for(graph);

  let future = model.evaluate_graph(None).unwrap();
  assert_eq!(future.targets().len(), 3);
  assert!(future.wait(&mut model, TIMEOUT));
  for uuid in [a_uuid, b_uuid, c_uuid] {
    assert_eq!(state(&model, uuid), NodeEvalState::Valid);
  }
  assert_eq!(int(&model, b_uuid, 1), Some(10));
}

#[test]
fn test_rebuild_drops_cache() {
  let mut graph = Graph::new();
  let (_, uuid) = append(&mut graph, constant(5));
  let mut model = model_for(graph);
  assert!(model.evaluate_node(uuid).unwrap().wait(&mut model, TIMEOUT));

  model.rebuild();

  assert_eq!(state(&model, uuid), NodeEvalState::Outdated);
  assert_eq!(int(&model, uuid, 0), None);
}

// ============================================================================
// Invalidation
// ============================================================================

#[test]
fn test_invalidation_reaches_downstream_only() {
  let calls = Arc::new(AtomicUsize::new(0));
  let mut graph = Graph::new();
  let (a, a_uuid) = append(&mut graph, constant(1));
  let (b, b_uuid) = append(&mut graph, relay(&calls));
  let (c, c_uuid) = append(&mut graph, relay(&calls));
  let (_, d_uuid) = append(&mut graph, constant(2));
  link(&mut graph, a, 0, b, 0);
  link(&mut graph, b, 1, c, 0);
  let mut model = model_for(graph);
  assert!(model.evaluate_graph(None).unwrap().wait(&mut model, TIMEOUT));

  model.invalidate_node(b_uuid).unwrap();

  assert_eq!(state(&model, a_uuid), NodeEvalState::Valid);
  assert_eq!(state(&model, b_uuid), NodeEvalState::Outdated);
  assert_eq!(state(&model, c_uuid), NodeEvalState::Outdated);
  assert_eq!(state(&model, d_uuid), NodeEvalState::Valid);
  assert_eq!(model.port_state(c_uuid, PortId(0)).unwrap(), PortState::Outdated);
  assert_eq!(int(&model, c_uuid, 1), Some(1), "data survives invalidation");
}

#[test]
fn test_stale_result_is_discarded() {
  let (tx, rx) = mpsc::channel::<()>();
  let gate = Arc::new(Mutex::new(rx));
  let gated = Node::new(
    "gated",
    from_fn(move |ctx, _| {
      gate.lock().unwrap().recv().ok();
      Ok(ctx.input(PortId(0)).cloned())
    }),
  )
  .with_input(Port::new("int", "in"))
  .with_output(Port::new("int", "out"))
  .with_eval_mode(EvalMode::Detached);
  let mut graph = Graph::new();
  let (src, src_uuid) = append(&mut graph, source());
  let (b, b_uuid) = append(&mut graph, gated);
  link(&mut graph, src, 0, b, 0);
  let mut model = model_for(graph);
  let mut events = model.subscribe();

  set(&mut model, src_uuid, 0, 1);
  let future = model.evaluate_node(b_uuid).unwrap();
  assert_eq!(state(&model, b_uuid), NodeEvalState::Evaluating);
  assert_eq!(model.evaluating_nodes(), vec![b_uuid]);

  set(&mut model, src_uuid, 0, 2);
  tx.send(()).unwrap();
  tx.send(()).unwrap();
  assert!(future.wait(&mut model, TIMEOUT));

  assert_eq!(int(&model, b_uuid, 1), Some(2));
  let evaluated = drain(&mut events)
    .into_iter()
    .filter(|e| *e == ExecEvent::NodeEvaluated { node: b_uuid })
    .count();
  assert_eq!(evaluated, 1, "the first result was dropped");
}

// ============================================================================
// Failures
// ============================================================================

#[test]
fn test_failure_propagates_and_retry_recovers() {
  let failing = Arc::new(AtomicBool::new(true));
  let calls = Arc::new(AtomicUsize::new(0));
  let mut graph = Graph::new();
  let (a, a_uuid) = append(&mut graph, flaky(&failing));
  let (b, b_uuid) = append(&mut graph, relay(&calls));
  let (c, c_uuid) = append(&mut graph, relay(&calls));
  link(&mut graph, a, 0, b, 0);
  link(&mut graph, b, 1, c, 0);
  let mut model = model_for(graph);
  let mut events = model.subscribe();

  let future = model.evaluate_node(c_uuid).unwrap();
  assert!(!future.wait(&mut model, TIMEOUT));
  assert_eq!(future.status(&model), FutureStatus::Failed);
  assert!(!future.clone().detach(&model));
  for uuid in [a_uuid, b_uuid, c_uuid] {
    assert_eq!(state(&model, uuid), NodeEvalState::Invalid);
  }
  assert_eq!(calls.load(Ordering::SeqCst), 0);
  let failure = drain(&mut events).into_iter().find_map(|e| match e {
    ExecEvent::NodeEvaluationFailed { node, reason } => Some((node, reason)),
    _ => None,
  });
  let (node, reason) = failure.unwrap();
  assert_eq!(node, a_uuid);
  assert!(reason.contains("boom"));

  failing.store(false, Ordering::SeqCst);
  let retry = model.evaluate_node(c_uuid).unwrap();
  assert!(retry.wait(&mut model, TIMEOUT));
  assert_eq!(int(&model, c_uuid, 1), Some(1));
  assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[test]
fn test_any_terminal_accepts_failure() {
  let failing = Arc::new(AtomicBool::new(true));
  let mut graph = Graph::new();
  let (_, uuid) = append(&mut graph, flaky(&failing));
  let mut model = model_for(graph);

  let future = model.evaluate_node(uuid).unwrap().any_terminal();
  assert!(future.wait(&mut model, TIMEOUT));
  assert_eq!(future.targets(), &[(uuid, TargetState::Terminal)]);
}

// ============================================================================
// Readiness
// ============================================================================

#[test]
fn test_required_unconnected_input_stalls_until_given() {
  let calls = Arc::new(AtomicUsize::new(0));
  let mut graph = Graph::new();
  let (_, needy) = append(&mut graph, relay(&calls));
  let mut model = model_for(graph);
  let mut events = model.subscribe();

  let future = model.evaluate_node(needy).unwrap();
  assert!(model.is_stalled());
  assert!(!future.wait(&mut model, TIMEOUT));
  assert!(drain(&mut events).contains(&ExecEvent::GraphStalled { pending: vec![needy] }));
  assert_eq!(model.pending_nodes(), vec![needy]);

  set(&mut model, needy, 0, 9);
  assert!(future.wait(&mut model, TIMEOUT));
  assert!(!model.is_stalled());
  assert_eq!(int(&model, needy, 1), Some(9));
  assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn test_optional_unconnected_input_does_not_block() {
  let seen = Arc::new(Mutex::new(None));
  let probe = {
    let seen = Arc::clone(&seen);
    Node::new(
      "probe",
      from_fn(move |ctx, _| {
        *seen.lock().unwrap() = Some(ctx.input(PortId(0)).is_none());
        Ok(Some(NodeData::new(0_i64)))
      }),
    )
    .with_input(Port::new("int", "in").optional())
    .with_output(Port::new("int", "out"))
  };
  let mut graph = Graph::new();
  let (_, uuid) = append(&mut graph, probe);
  let mut model = model_for(graph);

  assert!(model.evaluate_node(uuid).unwrap().wait(&mut model, TIMEOUT));
  assert_eq!(*seen.lock().unwrap(), Some(true));
}

#[test]
fn test_inactive_node_is_paused() {
  let mut graph = Graph::new();
  let (id, uuid) = append(&mut graph, constant(4).with_active(false));
  let mut model = model_for(graph);

  let future = model.evaluate_node(uuid).unwrap();
  assert_eq!(state(&model, uuid), NodeEvalState::Paused);
  assert!(model.is_stalled());

  model.modify().set_node_active(id, true).unwrap();
  assert!(future.wait(&mut model, TIMEOUT));
  assert_eq!(int(&model, uuid, 0), Some(4));
}

// ============================================================================
// Graph changes
// ============================================================================

#[test]
fn test_modification_scope_defers_evaluation() {
  let calls = Arc::new(AtomicUsize::new(0));
  let mut graph = Graph::new();
  let (_, needy) = append(&mut graph, relay(&calls));
  let mut model = model_for(graph);
  let future = model.evaluate_node(needy).unwrap();

  model.graph().begin_modification();
  assert_eq!(state(&model, needy), NodeEvalState::Paused);
  set(&mut model, needy, 0, 3);
  model.process_events();
  assert_eq!(calls.load(Ordering::SeqCst), 0);
  assert_eq!(state(&model, needy), NodeEvalState::Paused);

  model.graph().end_modification();
  assert_eq!(calls.load(Ordering::SeqCst), 0, "closing the scope alone does not reschedule");
  model.process_events();
  assert_eq!(calls.load(Ordering::SeqCst), 1);
  assert_eq!(future.status(&model), FutureStatus::Succeeded);
}

#[test]
fn test_modification_guard_reschedules_on_drop() {
  let calls = Arc::new(AtomicUsize::new(0));
  let mut graph = Graph::new();
  let (src, src_uuid) = append(&mut graph, source());
  let (sink, sink_uuid) = append(&mut graph, relay(&calls));
  let mut model = model_for(graph);
  set(&mut model, src_uuid, 0, 4);
  let future = model.evaluate_node(sink_uuid).unwrap();
  assert_eq!(calls.load(Ordering::SeqCst), 0);

  {
    let mut scope = model.modify();
    link(&mut scope, src, 0, sink, 0);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
  }

  assert_eq!(calls.load(Ordering::SeqCst), 1);
  assert_eq!(future.status(&model), FutureStatus::Succeeded);
  assert_eq!(int(&model, sink_uuid, 1), Some(4));
}

#[test]
fn test_new_connection_copies_cached_value() {
  let calls = Arc::new(AtomicUsize::new(0));
  let mut graph = Graph::new();
  let (src, src_uuid) = append(&mut graph, source());
  let (sink, sink_uuid) = append(&mut graph, relay(&calls));
  let mut model = model_for(graph);
  set(&mut model, src_uuid, 0, 5);

  let connection = link(&mut model.modify(), src, 0, sink, 0);
  assert_eq!(int(&model, sink_uuid, 0), Some(5));
  assert_eq!(model.port_state(sink_uuid, PortId(0)).unwrap(), PortState::Valid);
  assert_eq!(state(&model, sink_uuid), NodeEvalState::Outdated);

  model.modify().delete_connection(connection).unwrap();
  assert_eq!(int(&model, sink_uuid, 0), None);
  assert_eq!(model.port_state(sink_uuid, PortId(0)).unwrap(), PortState::Outdated);
}

#[test]
fn test_conversion_applied_when_carrying_values() {
  let mut graph = Graph::new();
  graph.register_conversion_with("int", "text", |data| {
    data.value::<i64>().map(|value| NodeData::new(format!("#{value}")))
  });
  let echo = Node::new("echo", from_fn(|ctx, _| Ok(ctx.input(PortId(0)).cloned())))
    .with_input(Port::new("text", "in"))
    .with_output(Port::new("text", "out"));
  let (src, src_uuid) = append(&mut graph, source());
  let (text, text_uuid) = append(&mut graph, echo);
  link(&mut graph, src, 0, text, 0);
  let mut model = model_for(graph);

  set(&mut model, src_uuid, 0, 7);
  assert!(model.evaluate_node(text_uuid).unwrap().wait(&mut model, TIMEOUT));

  let value = model.node_data(text_uuid, PortId(1)).unwrap().unwrap();
  assert_eq!(value.value::<String>().map(String::as_str), Some("#7"));
}

#[test]
fn test_deleted_target_fails_future() {
  let calls = Arc::new(AtomicUsize::new(0));
  let mut graph = Graph::new();
  let (id, needy) = append(&mut graph, relay(&calls));
  let mut model = model_for(graph);
  let future = model.evaluate_node(needy).unwrap();

  model.modify().delete_node(id).unwrap();

  assert_eq!(future.status(&model), FutureStatus::Failed);
  assert!(!future.wait(&mut model, TIMEOUT));
  assert_eq!(model.node_eval_state(needy), Err(ExecutionError::UnknownNode(needy)));
  assert!(model.pending_nodes().is_empty());
}

// ============================================================================
// Auto evaluation
// ============================================================================

#[test]
fn test_auto_evaluated_node_follows_changes() {
  let calls = Arc::new(AtomicUsize::new(0));
  let mut graph = Graph::new();
  let (src, src_uuid) = append(&mut graph, source());
  let (sink, sink_uuid) = append(&mut graph, relay(&calls));
  link(&mut graph, src, 0, sink, 0);
  let mut model = model_for(graph);
  set(&mut model, src_uuid, 0, 1);

  model.auto_evaluate_node(sink_uuid).unwrap();
  assert!(model.is_auto_evaluating(sink_uuid));
  assert_eq!(int(&model, sink_uuid, 1), Some(1));

  set(&mut model, src_uuid, 0, 2);
  assert_eq!(int(&model, sink_uuid, 1), Some(2));
  assert_eq!(calls.load(Ordering::SeqCst), 2);

  model.stop_auto_evaluating_node(sink_uuid);
  set(&mut model, src_uuid, 0, 3);
  assert_eq!(state(&model, sink_uuid), NodeEvalState::Outdated);
  assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[test]
fn test_auto_evaluated_graph_picks_up_new_nodes() {
  let mut model = model_for(Graph::new());
  model.auto_evaluate_graph(None).unwrap();

  let uuid = {
    let mut graph = model.modify();
    append(&mut graph, constant(8)).1
  };

  assert!(model.is_auto_evaluating(uuid));
  assert_eq!(int(&model, uuid, 0), Some(8));
  model.stop_auto_evaluating_graph(None);
  assert!(!model.is_auto_evaluating(uuid));
}

// ============================================================================
// Groups
// ============================================================================

/// `src -> G -> sink`, where `G` doubles its input through a nested node.
fn grouped(calls: &Arc<AtomicUsize>) -> (Graph, [NodeUuid; 4]) {
  let mut inner = Graph::new();
  let (double, double_uuid) = append(&mut inner, doubler());
  let group = Node::group(inner)
    .with_input(Port::new("int", "in"))
    .with_output(Port::new("int", "out"));
  let mut graph = Graph::new();
  let (src, src_uuid) = append(&mut graph, source());
  let (g, g_uuid) = append(&mut graph, group);
  let (sink, sink_uuid) = append(&mut graph, relay(calls));
  {
    let child = graph.group_mut(g).unwrap();
    let input = child.input_provider().unwrap();
    let output = child.output_provider().unwrap();
    link(child, input, 0, double, 0);
    link(child, double, 1, output, 1);
  }
  link(&mut graph, src, 0, g, 0);
  link(&mut graph, g, 1, sink, 0);
  (graph, [src_uuid, g_uuid, double_uuid, sink_uuid])
}

#[test]
fn test_group_evaluates_through_providers() {
  let calls = Arc::new(AtomicUsize::new(0));
  let (graph, [src, group, double, sink]) = grouped(&calls);
  let mut model = model_for(graph);

  set(&mut model, src, 0, 3);
  assert!(model.evaluate_node(sink).unwrap().wait(&mut model, TIMEOUT));
  assert_eq!(int(&model, group, 1), Some(6));
  assert_eq!(int(&model, sink, 1), Some(6));
  assert_eq!(state(&model, double), NodeEvalState::Valid);

  set(&mut model, src, 0, 4);
  assert_eq!(state(&model, double), NodeEvalState::Outdated);
  assert_eq!(state(&model, group), NodeEvalState::Outdated);
  assert!(model.evaluate_node(sink).unwrap().wait(&mut model, TIMEOUT));
  assert_eq!(int(&model, sink, 1), Some(8));
}

#[test]
fn test_evaluate_nested_graph_only() {
  let calls = Arc::new(AtomicUsize::new(0));
  let (graph, [src, group, double, _]) = grouped(&calls);
  let mut model = model_for(graph);
  set(&mut model, src, 0, 5);

  let future = model.evaluate_graph(Some(group)).unwrap();
  assert_eq!(future.targets().len(), 3, "providers and the nested node");
  assert!(future.wait(&mut model, TIMEOUT));
  assert_eq!(int(&model, double, 1), Some(10));
  assert_eq!(state(&model, group), NodeEvalState::Outdated);
  assert_eq!(
    model.evaluate_graph(Some(src)).unwrap_err(),
    ExecutionError::UnknownNode(src)
  );
}

// ============================================================================
// Futures and errors
// ============================================================================

#[test]
fn test_join_then_and_detach() {
  let calls = Arc::new(AtomicUsize::new(0));
  let mut graph = Graph::new();
  let (_, needy) = append(&mut graph, relay(&calls));
  let (_, ready) = append(&mut graph, constant(1));
  let mut model = model_for(graph);

  let first = model.evaluate_node(needy).unwrap();
  let second = model.evaluate_node(ready).unwrap().any_terminal();
  let joined = first.clone().join(second).unwrap();
  assert_eq!(joined.targets().len(), 2);
  let again = joined.clone().join(first.clone().any_terminal()).unwrap();
  assert!(again.targets().contains(&(needy, TargetState::Valid)));

  let fired = Arc::new(Mutex::new(None));
  let sink = Arc::clone(&fired);
  joined.then(&mut model, move |ok| *sink.lock().unwrap() = Some(ok));
  assert_eq!(*fired.lock().unwrap(), None);
  assert!(first.clone().detach(&model));

  set(&mut model, needy, 0, 2);
  model.process_events();
  assert_eq!(*fired.lock().unwrap(), Some(true));

  let other = model_for(Graph::new());
  let foreign = crate::execution::FutureEvaluated::new(other.id(), Vec::new());
  assert_eq!(first.join(foreign).unwrap_err(), ExecutionError::ModelMismatch);
}

#[test]
fn test_unknown_nodes_and_ports() {
  let mut graph = Graph::new();
  let (_, uuid) = append(&mut graph, constant(1));
  let mut model = model_for(graph);
  let missing = NodeUuid::new();

  assert_eq!(model.evaluate_node(missing).unwrap_err(), ExecutionError::UnknownNode(missing));
  assert_eq!(model.invalidate_node(missing).unwrap_err(), ExecutionError::UnknownNode(missing));
  assert_eq!(
    model.set_node_data(uuid, PortId(9), None).unwrap_err(),
    ExecutionError::UnknownPort { node: uuid, port: PortId(9) }
  );
  assert_eq!(
    model.node_data(uuid, PortId(9)).unwrap_err(),
    ExecutionError::UnknownPort { node: uuid, port: PortId(9) }
  );
}

// ============================================================================
// Synchronization
// ============================================================================

#[test]
fn test_foreign_exclusive_slot_defers_dispatch() {
  let sync = Arc::new(Synchronization::new());
  let mut graph = Graph::new();
  let (_, uuid) = append(&mut graph, constant(6));
  let mut model = model_with_sync(graph, Arc::clone(&sync));
  let foreign = ModelId::next();
  assert!(sync.try_acquire(foreign, true));

  let future = model.evaluate_node(uuid).unwrap();
  assert_eq!(state(&model, uuid), NodeEvalState::Outdated);
  assert!(!model.is_stalled(), "waiting for a slot is not a stall");

  sync.release(foreign, true);
  assert!(future.wait(&mut model, TIMEOUT));
  assert_eq!(int(&model, uuid, 0), Some(6));
  assert_eq!(sync.total_running(), 0);
}
