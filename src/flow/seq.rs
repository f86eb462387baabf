//! Sequential pipeline builder.

use crate::error::GraphError;
use crate::flow::plan::Plan;
use crate::flow::step::Step;
use crate::graph::{Graph, GraphConfig};
use crate::node::EmitHandle;
use crate::payload::Payload;
use std::cmp::Ordering as CmpOrdering;
use std::future::Future;
use tokio_util::sync::CancellationToken;

/// A pipeline where each step follows the previous one.
///
/// Keys are generated (`stepN-<kind>`) unless a step carries its own,
/// and every step is connected to the one before it (to all of that
/// step's replicas, when it was replicated). A sequential pipeline
/// always prevents cycles.
///
/// ```rust,no_run
/// use weft::flow::Seq;
/// use weft::{payload, CancellationToken, GraphConfig};
///
/// # async fn example() -> Result<(), weft::GraphError> {
/// let mut seq = Seq::new(GraphConfig::default())
///   .read(|_token, emit| async move {
///     for i in 0..100_i64 {
///       emit.emit(payload(i)).await;
///     }
///     Ok(())
///   })
///   .filter(|value| value.downcast_ref::<i64>().map(|n| n % 2 == 0).unwrap_or(false))
///   .count(|n| println!("{n} even numbers"));
/// seq.run(CancellationToken::new()).await
/// # }
/// ```
pub struct Seq {
  plan: Plan,
  counter: usize,
  prev: Option<String>,
}

impl Seq {
  pub fn new(cfg: GraphConfig) -> Self {
    Self {
      plan: Plan::new(cfg.prevent_cycles(true)),
      counter: 0,
      prev: None,
    }
  }

  /// Appends a step, keying it and connecting it to the previous step.
  ///
  /// Sequencing violations (a read anywhere but first, anything after a
  /// terminal step) are accumulated and surface from
  /// [`run`](Self::run).
  pub fn then(mut self, mut step: Step) -> Self {
    self.counter += 1;
    let key = step
      .key
      .take()
      .unwrap_or_else(|| format!("step{}-{}", self.counter, step.kind));

    if let Some(prev_key) = &self.prev {
      step.connections = vec![prev_key.clone()];
    }

    self.prev = Some(key.clone());
    self.plan = self.plan.step(step.key(key));
    self
  }

  /// First step: produce the stream from a source.
  pub fn read<F, Fut>(self, f: F) -> Self
  where
    F: Fn(CancellationToken, EmitHandle) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), GraphError>> + Send + 'static,
  {
    self.then(Step::read(f))
  }

  /// Transforms each element, emitting zero or more outputs.
  pub fn map<F, Fut>(self, f: F) -> Self
  where
    F: Fn(CancellationToken, Payload, EmitHandle) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), GraphError>> + Send + 'static,
  {
    self.then(Step::map(f))
  }

  /// Observes each element without modifying the stream.
  pub fn peek<F>(self, f: F) -> Self
  where
    F: Fn(&Payload) + Send + Sync + 'static,
  {
    self.then(Step::peek(f))
  }

  /// Forwards only the elements the predicate accepts.
  pub fn filter<F>(self, f: F) -> Self
  where
    F: Fn(&Payload) -> bool + Send + Sync + 'static,
  {
    self.then(Step::filter(f))
  }

  /// Merges the previous step's replicas back into one linear stream.
  pub fn combine(self) -> Self {
    self.then(Step::combine())
  }

  /// Consumes each element. Terminal.
  pub fn capture<F, Fut>(self, f: F) -> Self
  where
    F: Fn(CancellationToken, Payload) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), GraphError>> + Send + 'static,
  {
    self.then(Step::capture(f))
  }

  /// Accumulates every element for the callback. Terminal.
  pub fn collect<F>(self, callback: F) -> Self
  where
    F: Fn(Vec<Payload>) + Send + Sync + 'static,
  {
    self.then(Step::collect(callback))
  }

  /// Accumulates every element in comparator order. Terminal.
  pub fn collect_ordered<F, C>(self, callback: F, compare: C) -> Self
  where
    F: Fn(Vec<Payload>) + Send + Sync + 'static,
    C: Fn(&Payload, &Payload) -> CmpOrdering + Send + Sync + 'static,
  {
    self.then(Step::collect_ordered(callback, compare))
  }

  /// Counts the elements for the callback. Terminal.
  pub fn count<F>(self, callback: F) -> Self
  where
    F: Fn(u64) + Send + Sync + 'static,
  {
    self.then(Step::count(callback))
  }

  /// Builds (first call only) and runs the pipeline, then invokes the
  /// terminal callbacks on success.
  pub async fn run(&mut self, parent: CancellationToken) -> Result<(), GraphError> {
    self.plan.run(parent).await
  }

  /// Triggers cancellation of the running pipeline.
  pub fn stop(&self) {
    self.plan.stop();
  }

  /// Duration of the current or last run.
  pub fn uptime(&self) -> std::time::Duration {
    self.plan.uptime()
  }

  /// Builds (first call only) and renders the pipeline as Graphviz DOT.
  pub async fn render(&mut self) -> Result<String, GraphError> {
    self.plan.render().await
  }

  /// Construction errors accumulated so far.
  pub fn errors(&self) -> &[GraphError] {
    self.plan.errors()
  }

  /// The underlying graph, for introspection.
  pub fn graph(&self) -> &Graph {
    self.plan.graph()
  }
}
