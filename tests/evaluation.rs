//! # Evaluation Integration Tests
//!
//! End-to-end scenarios through the public API: graphs are built, handed to an
//! execution model and driven to completion.

mod common;

use common::{TIMEOUT, append, broken, counted_relay, init_tracing, int, isolated_model, link, map, set, source};
use nodeweave::{
  EvalMode, ExecEvent, ExecutionConfig, FutureStatus, Graph, Node, NodeData, NodeEvalState, Port, PortId, from_fn,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

fn blocking() -> ExecutionConfig {
  ExecutionConfig::new().with_default_eval_mode(EvalMode::Blocking)
}

// ============================================================================
// Caching
// ============================================================================

#[test]
fn test_source_to_sink_recomputes_only_on_request() {
  init_tracing();
  let calls = Arc::new(AtomicUsize::new(0));
  let mut graph = Graph::new();
  let (src, src_uuid) = append(&mut graph, source());
  let (sink, sink_uuid) = append(&mut graph, counted_relay(&calls));
  link(&mut graph, src, 0, sink, 0);
  let mut model = isolated_model(graph, ExecutionConfig::new());

  set(&mut model, src_uuid, 0, 42);
  let future = model.evaluate_node(sink_uuid).unwrap();
  assert!(future.wait(&mut model, TIMEOUT));
  assert_eq!(int(&model, sink_uuid, 1), Some(42));

  set(&mut model, src_uuid, 0, 7);
  assert_eq!(model.node_eval_state(sink_uuid).unwrap(), NodeEvalState::Outdated);
  assert!(model.run_until_idle(Duration::from_millis(200)));
  assert_eq!(calls.load(Ordering::SeqCst), 1);

  let future = model.evaluate_node(sink_uuid).unwrap();
  assert!(future.wait(&mut model, TIMEOUT));
  assert_eq!(int(&model, sink_uuid, 1), Some(7));
  assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[test]
fn test_chain_invalidation_and_recompute() {
  init_tracing();
  let mut graph = Graph::new();
  let (a, a_uuid) = append(&mut graph, source());
  let (b, b_uuid) = append(&mut graph, map("inc", |v| v + 1));
  let (c, c_uuid) = append(&mut graph, map("square", |v| v * v));
  link(&mut graph, a, 0, b, 0);
  link(&mut graph, b, 1, c, 0);
  let mut model = isolated_model(graph, blocking());

  set(&mut model, a_uuid, 0, 2);
  assert!(model.evaluate_node(c_uuid).unwrap().wait(&mut model, TIMEOUT));
  assert_eq!(int(&model, c_uuid, 1), Some(9));

  set(&mut model, a_uuid, 0, 4);
  assert_eq!(model.node_eval_state(b_uuid).unwrap(), NodeEvalState::Outdated);
  assert_eq!(model.node_eval_state(c_uuid).unwrap(), NodeEvalState::Outdated);
  assert_eq!(int(&model, c_uuid, 1), Some(9), "stale value kept until recomputed");

  assert!(model.evaluate_node(c_uuid).unwrap().wait(&mut model, TIMEOUT));
  assert_eq!(int(&model, b_uuid, 1), Some(5));
  assert_eq!(int(&model, c_uuid, 1), Some(25));
}

#[test]
fn test_progress_events() {
  init_tracing();
  let mut graph = Graph::new();
  let (_, uuid) = append(
    &mut graph,
    Node::new("one", from_fn(|_, _| Ok(Some(NodeData::new(1_i64))))).with_output(Port::new("int", "out")),
  );
  let mut model = isolated_model(graph, ExecutionConfig::new());
  let mut events = model.subscribe();

  assert!(model.evaluate_node(uuid).unwrap().wait(&mut model, TIMEOUT));

  let mut seen = Vec::new();
  while let Ok(event) = events.try_recv() {
    seen.push(event);
  }
  let states: Vec<NodeEvalState> = seen
    .iter()
    .filter_map(|event| match event {
      ExecEvent::NodeEvalStateChanged { node, state } if *node == uuid => Some(*state),
      _ => None,
    })
    .collect();
  assert_eq!(states, vec![NodeEvalState::Evaluating, NodeEvalState::Valid]);
  assert!(seen.contains(&ExecEvent::NodeEvaluated { node: uuid }));
  assert_eq!(seen.last(), Some(&ExecEvent::TargetsSatisfied));
}

// ============================================================================
// Readiness
// ============================================================================

#[test]
fn test_missing_required_input_stalls() {
  init_tracing();
  let calls = Arc::new(AtomicUsize::new(0));
  let mut graph = Graph::new();
  let (_, uuid) = append(&mut graph, counted_relay(&calls));
  let mut model = isolated_model(graph, blocking());

  let future = model.evaluate_node(uuid).unwrap();
  assert!(!future.wait(&mut model, TIMEOUT));
  assert!(model.is_stalled());
  assert_eq!(future.status(&model), FutureStatus::Pending);
  assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[test]
fn test_only_optional_inputs_runs_immediately() {
  init_tracing();
  let mut graph = Graph::new();
  let node = Node::new(
    "fallback",
    from_fn(|ctx, _| Ok(Some(NodeData::new(ctx.input_value::<i64>(PortId(0)).copied().unwrap_or(-1))))),
  )
  .with_input(Port::new("int", "in").optional())
  .with_output(Port::new("int", "out"));
  let (_, uuid) = append(&mut graph, node);
  let mut model = isolated_model(graph, blocking());

  assert!(model.evaluate_node(uuid).unwrap().wait(&mut model, TIMEOUT));
  assert_eq!(int(&model, uuid, 1), Some(-1));
}

// ============================================================================
// Failures
// ============================================================================

#[test]
fn test_failure_reaches_dependents_only() {
  init_tracing();
  let calls = Arc::new(AtomicUsize::new(0));
  let mut graph = Graph::new();
  let (bad, bad_uuid) = append(&mut graph, broken("no data"));
  let (after, after_uuid) = append(&mut graph, counted_relay(&calls));
  let (src, src_uuid) = append(&mut graph, source());
  let (ok, ok_uuid) = append(&mut graph, counted_relay(&calls));
  link(&mut graph, bad, 0, after, 0);
  link(&mut graph, src, 0, ok, 0);
  let mut model = isolated_model(graph, ExecutionConfig::new());
  set(&mut model, src_uuid, 0, 1);

  let future = model.evaluate_graph(None).unwrap();
  assert!(!future.wait(&mut model, TIMEOUT));
  assert_eq!(future.status(&model), FutureStatus::Failed);
  assert_eq!(model.node_eval_state(bad_uuid).unwrap(), NodeEvalState::Invalid);
  assert_eq!(model.node_eval_state(after_uuid).unwrap(), NodeEvalState::Invalid);
  assert_eq!(model.node_eval_state(ok_uuid).unwrap(), NodeEvalState::Valid);
  assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn test_panicking_node_is_invalid() {
  init_tracing();
  let mut graph = Graph::new();
  let node = Node::new("panics", from_fn(|_, _| panic!("exploded"))).with_output(Port::new("int", "out"));
  let (_, uuid) = append(&mut graph, node);
  let mut model = isolated_model(graph, ExecutionConfig::new());
  let mut events = model.subscribe();

  assert!(!model.evaluate_node(uuid).unwrap().wait(&mut model, TIMEOUT));

  assert_eq!(model.node_eval_state(uuid).unwrap(), NodeEvalState::Invalid);
  let mut reason = None;
  while let Ok(event) = events.try_recv() {
    if let ExecEvent::NodeEvaluationFailed { reason: r, .. } = event {
      reason = Some(r);
    }
  }
  assert!(reason.is_some_and(|r| r.contains("exploded")));
}

// ============================================================================
// Groups
// ============================================================================

#[test]
fn test_two_level_groups() {
  init_tracing();
  let mut innermost = Graph::new();
  let (double, double_uuid) = append(&mut innermost, map("double", |v| v * 2));
  let inner = Node::group(innermost)
    .with_input(Port::new("int", "in"))
    .with_output(Port::new("int", "out"));

  let mut middle = Graph::new();
  let (inner_id, _) = append(&mut middle, inner);
  {
    let nested = middle.group_mut(inner_id).unwrap();
    let (input, output) = (nested.input_provider().unwrap(), nested.output_provider().unwrap());
    link(nested, input, 0, double, 0);
    link(nested, double, 1, output, 1);
  }
  let outer = Node::group(middle)
    .with_input(Port::new("int", "in"))
    .with_output(Port::new("int", "out"));

  let mut graph = Graph::new();
  let (src, src_uuid) = append(&mut graph, source());
  let (outer_id, outer_uuid) = append(&mut graph, outer);
  {
    let nested = graph.group_mut(outer_id).unwrap();
    let (input, output) = (nested.input_provider().unwrap(), nested.output_provider().unwrap());
    link(nested, input, 0, inner_id, 0);
    link(nested, inner_id, 1, output, 1);
  }
  link(&mut graph, src, 0, outer_id, 0);
  let mut model = isolated_model(graph, ExecutionConfig::new());

  set(&mut model, src_uuid, 0, 21);
  assert!(model.evaluate_node(outer_uuid).unwrap().wait(&mut model, TIMEOUT));
  assert_eq!(int(&model, outer_uuid, 1), Some(42));
  assert_eq!(int(&model, double_uuid, 1), Some(42));
  assert_eq!(model.graph().describe().node_count(), 8);
}

// ============================================================================
// Background execution
// ============================================================================

#[test]
fn test_detached_branches_overlap() {
  init_tracing();
  let running = Arc::new(AtomicUsize::new(0));
  let peak = Arc::new(AtomicUsize::new(0));
  let slow = |running: &Arc<AtomicUsize>, peak: &Arc<AtomicUsize>| {
    let (running, peak) = (Arc::clone(running), Arc::clone(peak));
    Node::new(
      "slow",
      from_fn(move |ctx, _| {
        let now = running.fetch_add(1, Ordering::SeqCst) + 1;
        peak.fetch_max(now, Ordering::SeqCst);
        thread::sleep(Duration::from_millis(100));
        running.fetch_sub(1, Ordering::SeqCst);
        Ok(Some(NodeData::new(*ctx.input_value::<i64>(PortId(0))? + 1)))
      }),
    )
    .with_input(Port::new("int", "in"))
    .with_output(Port::new("int", "out"))
    .with_eval_mode(EvalMode::Detached)
  };
  let mut graph = Graph::new();
  let (src, src_uuid) = append(&mut graph, source());
  let (left, left_uuid) = append(&mut graph, slow(&running, &peak));
  let (right, right_uuid) = append(&mut graph, slow(&running, &peak));
  link(&mut graph, src, 0, left, 0);
  link(&mut graph, src, 0, right, 0);
  let mut model = isolated_model(graph, ExecutionConfig::new().with_worker_threads(2));
  set(&mut model, src_uuid, 0, 1);

  let future = model
    .evaluate_node(left_uuid)
    .unwrap()
    .join(model.evaluate_node(right_uuid).unwrap())
    .unwrap();
  assert_eq!(model.evaluating_nodes().len(), 2);
  assert!(future.wait(&mut model, TIMEOUT));

  assert_eq!(int(&model, left_uuid, 1), Some(2));
  assert_eq!(int(&model, right_uuid, 1), Some(2));
  assert_eq!(peak.load(Ordering::SeqCst), 2);
}
