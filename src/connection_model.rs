//! # Connection Model
//!
//! Adjacency structure giving, per node, its incoming and outgoing edges.
//!
//! The same generic [`ConnectionModel`] serves both scopes:
//!
//! - the **local** model of one graph level, keyed by [`NodeId`](crate::NodeId);
//! - the **global** model shared by a whole graph hierarchy, keyed by
//!   [`NodeUuid`](crate::NodeUuid), where group boundaries have been flattened so
//!   the scheduler can follow dependencies without walking the hierarchy.
//!
//! Graph algorithms (dependency closures, reachability, cycle detection and
//! Kahn's topological sort) live here so both scopes share one implementation.

use crate::ids::PortId;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt::Debug;
use std::hash::Hash;

/// What an edge stands for.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum EdgeKind {
  /// A user connection; data written to the source port is copied to the target port.
  Data,
  /// A synthetic dependency across a group boundary. It orders evaluation and
  /// carries invalidation, but no data.
  Boundary,
}

/// A directed edge between two ports.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct Edge<K> {
  /// Node the edge leaves.
  pub source: K,
  /// Port on `source`.
  pub source_port: PortId,
  /// Node the edge enters.
  pub target: K,
  /// Port on `target`.
  pub target_port: PortId,
  /// Data or boundary edge.
  pub kind: EdgeKind,
}

impl<K> Edge<K> {
  /// A data edge.
  pub fn data(source: K, source_port: PortId, target: K, target_port: PortId) -> Self {
    Self {
      source,
      source_port,
      target,
      target_port,
      kind: EdgeKind::Data,
    }
  }

  /// A boundary edge.
  pub fn boundary(source: K, source_port: PortId, target: K, target_port: PortId) -> Self {
    Self {
      source,
      source_port,
      target,
      target_port,
      kind: EdgeKind::Boundary,
    }
  }

  /// Returns `true` for data edges.
  pub fn is_data(&self) -> bool {
    self.kind == EdgeKind::Data
  }
}

#[derive(Clone, Debug)]
struct Adjacency<K> {
  predecessors: Vec<Edge<K>>,
  successors: Vec<Edge<K>>,
}

impl<K> Default for Adjacency<K> {
  fn default() -> Self {
    Self {
      predecessors: Vec::new(),
      successors: Vec::new(),
    }
  }
}

/// Per-node predecessor/successor edges.
#[derive(Clone, Debug)]
pub struct ConnectionModel<K> {
  nodes: HashMap<K, Adjacency<K>>,
}

impl<K> Default for ConnectionModel<K> {
  fn default() -> Self {
    Self {
      nodes: HashMap::new(),
    }
  }
}

impl<K> ConnectionModel<K>
where
  K: Copy + Eq + Hash + Ord + Debug,
{
  /// Creates an empty model.
  pub fn new() -> Self {
    Self::default()
  }

  /// Number of registered nodes.
  pub fn len(&self) -> usize {
    self.nodes.len()
  }

  /// Returns `true` if no node is registered.
  pub fn is_empty(&self) -> bool {
    self.nodes.is_empty()
  }

  /// Returns `true` if `node` is registered.
  pub fn contains(&self, node: K) -> bool {
    self.nodes.contains_key(&node)
  }

  /// Registered nodes, sorted.
  pub fn nodes(&self) -> Vec<K> {
    let mut nodes: Vec<K> = self.nodes.keys().copied().collect();
    nodes.sort();
    nodes
  }

  /// Registers `node`. Returns `false` if it was already registered.
  pub fn insert_node(&mut self, node: K) -> bool {
    if self.nodes.contains_key(&node) {
      return false;
    }
    self.nodes.insert(node, Adjacency::default());
    true
  }

  /// Unregisters `node`. Its edges must have been removed first.
  pub fn remove_node(&mut self, node: K) -> bool {
    match self.nodes.remove(&node) {
      Some(adjacency) => {
        debug_assert!(
          adjacency.predecessors.is_empty() && adjacency.successors.is_empty(),
          "node {node:?} removed while still connected"
        );
        true
      }
      None => false,
    }
  }

  /// Adds `edge`. Returns `false` if an endpoint is unknown or the edge exists.
  pub fn insert_edge(&mut self, edge: Edge<K>) -> bool {
    if !self.nodes.contains_key(&edge.source) || !self.nodes.contains_key(&edge.target) {
      return false;
    }
    if self.contains_edge(&edge) {
      return false;
    }
    if let Some(source) = self.nodes.get_mut(&edge.source) {
      source.successors.push(edge);
    }
    if let Some(target) = self.nodes.get_mut(&edge.target) {
      target.predecessors.push(edge);
    }
    true
  }

  /// Removes `edge`. Returns `false` if it did not exist.
  pub fn remove_edge(&mut self, edge: &Edge<K>) -> bool {
    let mut removed = false;
    if let Some(source) = self.nodes.get_mut(&edge.source) {
      let before = source.successors.len();
      source.successors.retain(|e| e != edge);
      removed = before != source.successors.len();
    }
    if let Some(target) = self.nodes.get_mut(&edge.target) {
      target.predecessors.retain(|e| e != edge);
    }
    removed
  }

  /// Returns `true` if `edge` exists.
  pub fn contains_edge(&self, edge: &Edge<K>) -> bool {
    self
      .nodes
      .get(&edge.source)
      .is_some_and(|adjacency| adjacency.successors.contains(edge))
  }

  /// Edges entering `node`.
  pub fn predecessors(&self, node: K) -> &[Edge<K>] {
    self
      .nodes
      .get(&node)
      .map(|adjacency| adjacency.predecessors.as_slice())
      .unwrap_or(&[])
  }

  /// Edges leaving `node`.
  pub fn successors(&self, node: K) -> &[Edge<K>] {
    self
      .nodes
      .get(&node)
      .map(|adjacency| adjacency.successors.as_slice())
      .unwrap_or(&[])
  }

  /// The data edge entering `node` at `port`, if any.
  pub fn incoming(&self, node: K, port: PortId) -> Option<&Edge<K>> {
    self
      .predecessors(node)
      .iter()
      .find(|edge| edge.is_data() && edge.target_port == port)
  }

  /// Data edges leaving `node` at `port`.
  pub fn outgoing(&self, node: K, port: PortId) -> impl Iterator<Item = &Edge<K>> {
    self
      .successors(node)
      .iter()
      .filter(move |edge| edge.is_data() && edge.source_port == port)
  }

  /// Every edge of the model.
  pub fn edges(&self) -> impl Iterator<Item = &Edge<K>> {
    self.nodes.values().flat_map(|adjacency| adjacency.successors.iter())
  }

  /// All ancestors of `node` (recursive closure over predecessor edges),
  /// excluding `node` itself.
  pub fn find_dependencies(&self, node: K) -> Vec<K> {
    self.closure([node], |edge| edge.source, Self::predecessors)
  }

  /// All descendants of `node` (recursive closure over successor edges),
  /// excluding `node` itself.
  pub fn find_dependents(&self, node: K) -> Vec<K> {
    self.closure([node], |edge| edge.target, Self::successors)
  }

  /// `roots` and all their ancestors.
  pub fn dependency_closure(&self, roots: impl IntoIterator<Item = K>) -> HashSet<K> {
    let roots: Vec<K> = roots.into_iter().filter(|root| self.contains(*root)).collect();
    let mut closure: HashSet<K> = roots.iter().copied().collect();
    closure.extend(self.closure(roots, |edge| edge.source, Self::predecessors));
    closure
  }

  fn closure(
    &self,
    roots: impl IntoIterator<Item = K>,
    next: impl Fn(&Edge<K>) -> K,
    edges: impl for<'a> Fn(&'a Self, K) -> &'a [Edge<K>],
  ) -> Vec<K> {
    let roots: Vec<K> = roots.into_iter().collect();
    let mut seen: HashSet<K> = roots.iter().copied().collect();
    let mut queue: VecDeque<K> = roots.iter().copied().collect();
    let mut found = Vec::new();
    while let Some(node) = queue.pop_front() {
      for edge in edges(self, node) {
        let other = next(edge);
        if seen.insert(other) {
          found.push(other);
          queue.push_back(other);
        }
      }
    }
    found.sort();
    found
  }

  /// Returns `true` if `to` can be reached from `from` by following successor edges.
  /// A node reaches itself.
  pub fn is_reachable(&self, from: K, to: K) -> bool {
    if from == to {
      return true;
    }
    let mut seen = HashSet::from([from]);
    let mut stack = vec![from];
    while let Some(node) = stack.pop() {
      for edge in self.successors(node) {
        if edge.target == to {
          return true;
        }
        if seen.insert(edge.target) {
          stack.push(edge.target);
        }
      }
    }
    false
  }

  /// Detects a cycle with a depth-first search.
  ///
  /// `visited` holds nodes fully processed and found acyclic, `pending` the
  /// nodes on the current search path. Reaching a pending node again proves a
  /// cycle, and the pending path is returned as evidence. An empty result means
  /// the model is acyclic.
  pub fn cyclic_nodes(&self) -> Vec<K> {
    let mut visited: HashSet<K> = HashSet::new();
    for start in self.nodes() {
      if visited.contains(&start) {
        continue;
      }
      let mut pending: Vec<K> = vec![start];
      let mut on_path: HashSet<K> = HashSet::from([start]);
      let mut stack: Vec<(K, usize)> = vec![(start, 0)];

      while let Some(&(node, next)) = stack.last() {
        let successors = self.successors(node);
        if next < successors.len() {
          if let Some(top) = stack.last_mut() {
            top.1 += 1;
          }
          let target = successors[next].target;
          if on_path.contains(&target) {
            return pending;
          }
          if !visited.contains(&target) {
            stack.push((target, 0));
            pending.push(target);
            on_path.insert(target);
          }
        } else {
          stack.pop();
          pending.pop();
          on_path.remove(&node);
          visited.insert(node);
        }
      }
    }
    Vec::new()
  }

  /// Sorts `subset` so that every node comes after all of its predecessors in
  /// `subset` (Kahn's algorithm over the predecessor adjacency).
  ///
  /// # Errors
  ///
  /// Returns the nodes that could not be ordered if `subset` contains a cycle.
  pub fn topological_sort(&self, subset: &HashSet<K>) -> Result<Vec<K>, Vec<K>> {
    let mut in_degree: HashMap<K, usize> = subset
      .iter()
      .map(|node| {
        let degree = self
          .predecessors(*node)
          .iter()
          .filter(|edge| subset.contains(&edge.source))
          .count();
        (*node, degree)
      })
      .collect();

    let mut ready: Vec<K> = in_degree
      .iter()
      .filter(|(_, degree)| **degree == 0)
      .map(|(node, _)| *node)
      .collect();
    ready.sort();
    let mut queue: VecDeque<K> = ready.into();

    let mut sorted = Vec::with_capacity(subset.len());
    while let Some(node) = queue.pop_front() {
      sorted.push(node);
      for edge in self.successors(node) {
        if let Some(degree) = in_degree.get_mut(&edge.target) {
          *degree -= 1;
          if *degree == 0 {
            queue.push_back(edge.target);
          }
        }
      }
    }

    if sorted.len() != subset.len() {
      let mut rest: Vec<K> = in_degree
        .into_iter()
        .filter(|(_, degree)| *degree > 0)
        .map(|(node, _)| node)
        .collect();
      rest.sort();
      return Err(rest);
    }
    Ok(sorted)
  }

  /// Moves every node and edge of `other` into `self`.
  pub fn merge(&mut self, other: ConnectionModel<K>) {
    for (node, adjacency) in other.nodes {
      let entry = self.nodes.entry(node).or_default();
      for edge in adjacency.predecessors {
        if !entry.predecessors.contains(&edge) {
          entry.predecessors.push(edge);
        }
      }
      for edge in adjacency.successors {
        if !entry.successors.contains(&edge) {
          entry.successors.push(edge);
        }
      }
    }
  }
}
