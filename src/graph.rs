//! The graph registry: nodes, edges, and the ingress/egress indexes.
//!
//! A [`Graph`] stores nodes keyed by unique string and directed edges
//! keyed by `(from, to)`. Two locks guard it, deliberately separate:
//!
//! - the **registry lock** (`std::sync::RwLock`) protects the topology
//!   maps for fast concurrent reads; it is never held across an await;
//! - the **session lock** (inside [`SessionController`]) is held
//!   exclusively for the whole duration of a run and in shared mode by
//!   every mutator, so no structural mutation interleaves with a run
//!   while idle-time edits stay concurrent.
//!
//! Folding them into one lock would deadlock mutators that also read.
//!
//! Edge removal is soft while convenient: [`Graph::remove_edge`] only
//! marks the edge, [`Graph::purge`] sweeps marked edges and any node
//! left with no incident edges.

use crate::edge::{ChannelCell, Edge, EdgeConfig};
use crate::error::GraphError;
use crate::macros::vlog;
use crate::node::{Node, NodeConfig};
use crate::session::SessionController;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use std::time::Duration;

/// Graph-wide options.
#[derive(Debug, Clone, Copy, Default)]
pub struct GraphConfig {
  pub(crate) verbose: bool,
  pub(crate) ignore_isolated: bool,
  pub(crate) stop_gracetime: Duration,
  pub(crate) prevent_cycles: bool,
}

impl GraphConfig {
  pub fn new() -> Self {
    Self::default()
  }

  /// Logs engine events at `debug` level instead of `trace`.
  pub fn verbose(mut self, on: bool) -> Self {
    self.verbose = on;
    self
  }

  /// Lets nodes with no active incident edges return cleanly instead of
  /// failing the run.
  pub fn ignore_isolated(mut self, on: bool) -> Self {
    self.ignore_isolated = on;
    self
  }

  /// Delays the effect of [`Graph::stop`] by the given duration so
  /// in-flight sends and receives have time to complete.
  pub fn stop_gracetime(mut self, gracetime: Duration) -> Self {
    self.stop_gracetime = gracetime;
    self
  }

  /// Rejects edges that would create a cycle, keeping the graph a DAG.
  pub fn prevent_cycles(mut self, on: bool) -> Self {
    self.prevent_cycles = on;
    self
  }
}

#[derive(Default)]
pub(crate) struct Registry {
  pub(crate) nodes: HashMap<String, Arc<Node>>,
  /// to -> from -> edge
  pub(crate) ingress: HashMap<String, HashMap<String, Arc<Edge>>>,
  /// from -> to -> edge
  pub(crate) egress: HashMap<String, HashMap<String, Arc<Edge>>>,
}

impl Registry {
  fn edge(&self, from: &str, to: &str) -> Option<&Arc<Edge>> {
    self.egress.get(from).and_then(|out| out.get(to))
  }

  fn live_degree(&self, index: &HashMap<String, HashMap<String, Arc<Edge>>>, key: &str) -> usize {
    index
      .get(key)
      .map(|edges| edges.values().filter(|e| !e.is_removed()).count())
      .unwrap_or(0)
  }

  fn is_isolated(&self, key: &str) -> bool {
    self.ingress.get(key).map_or(true, HashMap::is_empty)
      && self.egress.get(key).map_or(true, HashMap::is_empty)
  }

  /// True when `target` is an ancestor of `root`, walking the ingress
  /// index with an explicit stack. Paused and removed edges are still
  /// structurally present, so they participate.
  fn reaches_backward(&self, root: &str, target: &str) -> bool {
    let mut visited: HashSet<&str> = HashSet::new();
    let mut stack: Vec<&str> = vec![root];
    while let Some(key) = stack.pop() {
      if key == target {
        return true;
      }
      if !visited.insert(key) {
        continue;
      }
      if let Some(sources) = self.ingress.get(key) {
        stack.extend(sources.keys().map(String::as_str));
      }
    }
    false
  }
}

/// A directed graph of nodes connected by bounded channels.
///
/// All methods take `&self`; wrap the graph in an `Arc` to drive
/// [`start`](Self::start) and [`stop`](Self::stop) from different
/// tasks. Mutators block while a session is running.
pub struct Graph {
  pub(crate) cfg: GraphConfig,
  pub(crate) reg: RwLock<Registry>,
  pub(crate) session: SessionController,
}

impl Default for Graph {
  fn default() -> Self {
    Self::new(GraphConfig::default())
  }
}

impl Graph {
  pub fn new(cfg: GraphConfig) -> Self {
    Self {
      cfg,
      reg: RwLock::new(Registry::default()),
      session: SessionController::new(),
    }
  }

  /// Adds a node and returns its key.
  ///
  /// Fails with [`GraphError::BadNodeKey`] (no key and no generator),
  /// [`GraphError::NodeAlreadyExists`], [`GraphError::MissingNodeFunc`]
  /// or [`GraphError::TooManyNodeFuncs`].
  pub async fn add_node(&self, config: NodeConfig) -> Result<String, GraphError> {
    let node = config.build()?;
    let key = node.key().to_string();

    let _session = self.session.shared().await;
    let mut reg = self.reg.write().unwrap();
    if reg.nodes.contains_key(&key) {
      return Err(GraphError::NodeAlreadyExists(key));
    }
    vlog!(self.cfg.verbose, node = %key, "node added");
    reg.nodes.insert(key.clone(), Arc::new(node));
    Ok(key)
  }

  /// Looks up a node by key.
  pub fn node(&self, key: &str) -> Result<Arc<Node>, GraphError> {
    self
      .reg
      .read()
      .unwrap()
      .nodes
      .get(key)
      .cloned()
      .ok_or_else(|| GraphError::NodeNotFound(key.to_string()))
  }

  /// Removes a node. Fails while any incident edge remains, including
  /// soft-removed ones awaiting a purge.
  pub async fn remove_node(&self, key: &str) -> Result<(), GraphError> {
    let _session = self.session.shared().await;
    let mut reg = self.reg.write().unwrap();
    if !reg.nodes.contains_key(key) {
      return Err(GraphError::NodeNotFound(key.to_string()));
    }
    if !reg.is_isolated(key) {
      return Err(GraphError::NodeConnected(key.to_string()));
    }
    reg.nodes.remove(key);
    vlog!(self.cfg.verbose, node = %key, "node removed");
    Ok(())
  }

  /// All node keys, sorted.
  pub fn nodes(&self) -> Vec<String> {
    let reg = self.reg.read().unwrap();
    let mut keys: Vec<String> = reg.nodes.keys().cloned().collect();
    keys.sort();
    keys
  }

  /// Keys of nodes with egress but no ingress, counting edges not yet
  /// purged away. Paused edges are structurally present.
  pub fn seeds(&self) -> Vec<String> {
    let reg = self.reg.read().unwrap();
    let mut keys: Vec<String> = reg
      .nodes
      .keys()
      .filter(|k| {
        reg.live_degree(&reg.egress, k) > 0 && reg.live_degree(&reg.ingress, k) == 0
      })
      .cloned()
      .collect();
    keys.sort();
    keys
  }

  /// Keys of nodes with ingress but no egress.
  pub fn terminals(&self) -> Vec<String> {
    let reg = self.reg.read().unwrap();
    let mut keys: Vec<String> = reg
      .nodes
      .keys()
      .filter(|k| {
        reg.live_degree(&reg.ingress, k) > 0 && reg.live_degree(&reg.egress, k) == 0
      })
      .cloned()
      .collect();
    keys.sort();
    keys
  }

  /// Connects `from` to `to`.
  ///
  /// When `from` is a distributor that already has egress, the new edge
  /// joins the existing shared channel and the requested capacity is
  /// ignored; capacity is honored only for the first egress edge.
  ///
  /// Fails with [`GraphError::NeedsPurging`] when re-adding a
  /// soft-removed edge, [`GraphError::EdgeAlreadyExists`],
  /// [`GraphError::NodeNotFound`], or [`GraphError::CyclesNotAllowed`]
  /// when cycle prevention is on (a self-loop always counts as a cycle).
  pub async fn add_edge(&self, from: &str, to: &str, config: EdgeConfig) -> Result<(), GraphError> {
    let _session = self.session.shared().await;
    let mut reg = self.reg.write().unwrap();

    if let Some(edge) = reg.edge(from, to) {
      if edge.is_removed() {
        return Err(GraphError::NeedsPurging);
      }
      return Err(GraphError::EdgeAlreadyExists(from.to_string(), to.to_string()));
    }

    let from_node = reg
      .nodes
      .get(from)
      .cloned()
      .ok_or_else(|| GraphError::NodeNotFound(from.to_string()))?;
    if !reg.nodes.contains_key(to) {
      return Err(GraphError::NodeNotFound(to.to_string()));
    }

    if self.cfg.prevent_cycles && (from == to || reg.reaches_backward(from, to)) {
      return Err(GraphError::CyclesNotAllowed(from.to_string(), to.to_string()));
    }

    let channel = if from_node.is_distributor() {
      reg
        .egress
        .get(from)
        .and_then(|out| out.values().next())
        .map(|edge| edge.channel.clone())
    } else {
      None
    };
    let channel = channel.unwrap_or_else(|| ChannelCell::new(config.capacity));

    let edge = Edge::new(from, to, channel);
    reg
      .egress
      .entry(from.to_string())
      .or_default()
      .insert(to.to_string(), edge.clone());
    reg
      .ingress
      .entry(to.to_string())
      .or_default()
      .insert(from.to_string(), edge);
    vlog!(self.cfg.verbose, from = %from, to = %to, "edge added");
    Ok(())
  }

  /// Looks up the edge between two nodes. Soft-removed edges are not
  /// found.
  pub fn edge(&self, from: &str, to: &str) -> Result<Arc<Edge>, GraphError> {
    let reg = self.reg.read().unwrap();
    match reg.edge(from, to) {
      Some(edge) if !edge.is_removed() => Ok(edge.clone()),
      _ => Err(GraphError::EdgeNotFound(from.to_string(), to.to_string())),
    }
  }

  /// All edges, including paused and soft-removed ones, sorted by
  /// endpoints.
  pub fn edges(&self) -> Vec<Arc<Edge>> {
    let reg = self.reg.read().unwrap();
    let mut edges: Vec<Arc<Edge>> = reg
      .egress
      .values()
      .flat_map(|out| out.values().cloned())
      .collect();
    edges.sort_by(|a, b| (a.from(), a.to()).cmp(&(b.from(), b.to())));
    edges
  }

  /// Edges leading into the node, including paused and soft-removed.
  pub fn ingress(&self, key: &str) -> Vec<Arc<Edge>> {
    let reg = self.reg.read().unwrap();
    reg
      .ingress
      .get(key)
      .map(|edges| edges.values().cloned().collect())
      .unwrap_or_default()
  }

  /// Edges leading out of the node, including paused and soft-removed.
  pub fn egress(&self, key: &str) -> Vec<Arc<Edge>> {
    let reg = self.reg.read().unwrap();
    reg
      .egress
      .get(key)
      .map(|edges| edges.values().cloned().collect())
      .unwrap_or_default()
  }

  /// Marks the edge for deletion. It stays in the registry, ignored by
  /// workers, until [`purge`](Self::purge).
  pub async fn remove_edge(&self, from: &str, to: &str) -> Result<(), GraphError> {
    let _session = self.session.shared().await;
    let reg = self.reg.write().unwrap();
    match reg.edge(from, to) {
      Some(edge) if !edge.is_removed() => {
        edge.set_removed();
        vlog!(self.cfg.verbose, from = %from, to = %to, "edge removed");
        Ok(())
      }
      _ => Err(GraphError::EdgeNotFound(from.to_string(), to.to_string())),
    }
  }

  /// Pauses the edge. Takes effect at the next session; the current
  /// session's workers keep the edge set they started with.
  pub async fn pause_edge(&self, from: &str, to: &str) -> Result<(), GraphError> {
    let _session = self.session.shared().await;
    let reg = self.reg.write().unwrap();
    match reg.edge(from, to) {
      Some(edge) if !edge.is_removed() => {
        if edge.is_paused() {
          return Err(GraphError::EdgeAlreadyPaused(from.to_string(), to.to_string()));
        }
        edge.set_paused(true);
        vlog!(self.cfg.verbose, from = %from, to = %to, "edge paused");
        Ok(())
      }
      _ => Err(GraphError::EdgeNotFound(from.to_string(), to.to_string())),
    }
  }

  /// Resumes a paused edge. Resuming an active edge is a no-op.
  pub async fn resume_edge(&self, from: &str, to: &str) -> Result<(), GraphError> {
    let _session = self.session.shared().await;
    let reg = self.reg.write().unwrap();
    match reg.edge(from, to) {
      Some(edge) if !edge.is_removed() => {
        edge.set_paused(false);
        vlog!(self.cfg.verbose, from = %from, to = %to, "edge resumed");
        Ok(())
      }
      _ => Err(GraphError::EdgeNotFound(from.to_string(), to.to_string())),
    }
  }

  /// Physically drops soft-removed edges, then every node left with no
  /// incident edges.
  pub async fn purge(&self) -> Result<(), GraphError> {
    let _session = self.session.shared().await;
    let mut reg = self.reg.write().unwrap();

    let removed: Vec<(String, String)> = reg
      .egress
      .values()
      .flat_map(|out| out.values())
      .filter(|e| e.is_removed())
      .map(|e| (e.from().to_string(), e.to().to_string()))
      .collect();
    for (from, to) in &removed {
      if let Some(out) = reg.egress.get_mut(from) {
        out.remove(to);
      }
      if let Some(sources) = reg.ingress.get_mut(to) {
        sources.remove(from);
      }
      vlog!(self.cfg.verbose, from = %from, to = %to, "edge purged");
    }

    let isolated: Vec<String> = reg
      .nodes
      .keys()
      .filter(|k| reg.is_isolated(k))
      .cloned()
      .collect();
    for key in isolated {
      reg.nodes.remove(&key);
      vlog!(self.cfg.verbose, node = %key, "isolated node purged");
    }
    Ok(())
  }

  /// True when the graph contains the node.
  pub fn has_node(&self, key: &str) -> bool {
    self.reg.read().unwrap().nodes.contains_key(key)
  }
}
