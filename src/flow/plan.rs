//! Explicit-DAG pipeline builder.

use crate::dot;
use crate::edge::EdgeConfig;
use crate::error::GraphError;
use crate::flow::step::{Step, StepFunc, StepKind};
use crate::graph::{Graph, GraphConfig};
use crate::node::NodeConfig;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// A pipeline declared as keyed steps with explicit upstream
/// connections.
///
/// Steps accumulate; the graph is built once, on the first
/// [`run`](Self::run) or [`render`](Self::render). Construction errors
/// accumulate too and surface as one (possibly
/// [`GraphError::Multiple`]) error instead of failing the first bad
/// step.
pub struct Plan {
  graph: Graph,
  steps: Vec<Step>,
  callbacks: Vec<Arc<dyn Fn() + Send + Sync>>,
  errors: Vec<GraphError>,
  built: bool,
  failed: bool,
}

impl Plan {
  pub fn new(cfg: GraphConfig) -> Self {
    Self {
      graph: Graph::new(cfg),
      steps: Vec::new(),
      callbacks: Vec::new(),
      errors: Vec::new(),
      built: false,
      failed: false,
    }
  }

  /// Declares one step. Plan steps must carry a key.
  pub fn step(mut self, step: Step) -> Self {
    self.steps.push(step);
    self
  }

  /// The underlying graph, for introspection.
  pub fn graph(&self) -> &Graph {
    &self.graph
  }

  /// Construction errors accumulated so far. Building happens on the
  /// first [`run`](Self::run) or [`render`](Self::render), so call
  /// after one of those to see compilation problems.
  pub fn errors(&self) -> &[GraphError] {
    &self.errors
  }

  /// Builds the graph (first call only), runs it to completion, and on
  /// success invokes the terminal steps' callbacks.
  pub async fn run(&mut self, parent: CancellationToken) -> Result<(), GraphError> {
    self.build().await;
    if let Some(e) = self.drain_error() {
      return Err(e);
    }
    self.graph.start(parent).await?;
    for callback in &self.callbacks {
      callback();
    }
    Ok(())
  }

  /// Triggers cancellation of the running pipeline.
  pub fn stop(&self) {
    self.graph.stop();
  }

  /// Duration of the current or last run.
  pub fn uptime(&self) -> std::time::Duration {
    self.graph.uptime()
  }

  /// Builds the graph (first call only) and renders it as Graphviz DOT.
  pub async fn render(&mut self) -> Result<String, GraphError> {
    self.build().await;
    if let Some(e) = self.drain_error() {
      return Err(e);
    }
    Ok(dot::render(&self.graph))
  }

  fn drain_error(&mut self) -> Option<GraphError> {
    if !self.errors.is_empty() {
      self.failed = true;
      let mut errors = std::mem::take(&mut self.errors);
      return Some(if errors.len() == 1 {
        errors.pop().unwrap()
      } else {
        GraphError::Multiple(errors)
      });
    }
    if self.failed {
      return Some(GraphError::Build("pipeline failed to build".to_string()));
    }
    None
  }

  async fn build(&mut self) {
    if self.built {
      return;
    }
    self.built = true;

    let mut kinds: HashMap<String, StepKind> = HashMap::new();
    let mut replicas: HashMap<String, Vec<String>> = HashMap::new();

    // First pass: nodes.
    for step in &self.steps {
      if step.kind.is_linear() && step.replicas != 1 {
        self
          .errors
          .push(GraphError::Build(format!("{} step replicas != 1", step.kind)));
        continue;
      }
      let Some(key) = step.key.clone() else {
        self.errors.push(GraphError::BadNodeKey);
        continue;
      };
      if step.kind == StepKind::Read && !step.connections.is_empty() {
        self
          .errors
          .push(GraphError::Build(format!("{} step cannot have upstream steps", step.kind)));
        continue;
      }

      let mut keys = Vec::with_capacity(step.replicas);
      for replica in 1..=step.replicas {
        let replica_key = if step.replicas > 1 {
          format!("{}-r{}", key, replica)
        } else {
          key.clone()
        };
        let mut config = NodeConfig::new().key(replica_key.clone());
        if step.distributor {
          config = config.distributor();
        }
        config = match &step.func {
          StepFunc::Emit(f) => config.emit_raw(f.clone()),
          StepFunc::Request(f) => config.request_raw(f.clone()),
        };
        match self.graph.add_node(config).await {
          Ok(added) => keys.push(added),
          Err(e) => self.errors.push(e),
        }
      }

      kinds.insert(key.clone(), step.kind);
      replicas.insert(key, keys);

      if let Some(callback) = &step.callback {
        self.callbacks.push(callback.clone());
      }
    }

    // Second pass: edges, every upstream replica to every replica.
    for step in &self.steps {
      let Some(key) = step.key.as_ref() else { continue };
      let Some(step_replicas) = replicas.get(key) else { continue };
      for upstream in &step.connections {
        let Some(upstream_replicas) = replicas.get(upstream) else {
          self
            .errors
            .push(GraphError::Build(format!("{} connects to unknown step {}", key, upstream)));
          continue;
        };
        if kinds.get(upstream).is_some_and(|kind| kind.is_terminal()) {
          self.errors.push(GraphError::Build(format!(
            "can not add {} step after {} step",
            step.kind, kinds[upstream]
          )));
          continue;
        }
        for from in upstream_replicas {
          for to in step_replicas {
            if let Err(e) = self.graph.add_edge(from, to, EdgeConfig::default()).await {
              self.errors.push(e);
            }
          }
        }
      }
    }
  }
}
