//! Pipeline steps and their compilation targets.
//!
//! Each step kind fixes the node function it compiles to: producing and
//! transforming steps become emitter nodes, terminal steps become
//! request/response nodes whose output is discarded. Terminal steps
//! also register an after-run callback that hands the accumulated
//! result (count, collection) back to the caller.

use crate::error::GraphError;
use crate::node::{EmitFn, EmitHandle, RequestFn};
use crate::payload::Payload;
use futures::future::BoxFuture;
use std::cmp::Ordering as CmpOrdering;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

/// The kind of a pipeline step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepKind {
  Read,
  Map,
  Peek,
  Filter,
  Combine,
  Capture,
  Collect,
  Count,
}

impl StepKind {
  /// Linear steps keep the stream single-file and cannot be replicated.
  pub fn is_linear(self) -> bool {
    matches!(
      self,
      StepKind::Read | StepKind::Peek | StepKind::Combine | StepKind::Collect | StepKind::Count
    )
  }

  /// Terminal steps consume the stream; nothing can follow them.
  pub fn is_terminal(self) -> bool {
    matches!(self, StepKind::Capture | StepKind::Collect | StepKind::Count)
  }
}

impl fmt::Display for StepKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      StepKind::Read => "read",
      StepKind::Map => "map",
      StepKind::Peek => "peek",
      StepKind::Filter => "filter",
      StepKind::Combine => "combine",
      StepKind::Capture => "capture",
      StepKind::Collect => "collect",
      StepKind::Count => "count",
    };
    f.write_str(name)
  }
}

pub(crate) enum StepFunc {
  Emit(EmitFn),
  Request(RequestFn),
}

/// One declared pipeline step. Construct with the kind-specific
/// constructors, then refine with the builder methods.
pub struct Step {
  pub(crate) kind: StepKind,
  pub(crate) key: Option<String>,
  pub(crate) replicas: usize,
  pub(crate) distributor: bool,
  pub(crate) connections: Vec<String>,
  pub(crate) func: StepFunc,
  pub(crate) callback: Option<Arc<dyn Fn() + Send + Sync>>,
}

impl Step {
  fn new(kind: StepKind, func: StepFunc) -> Self {
    Self {
      kind,
      key: None,
      replicas: 1,
      distributor: false,
      connections: Vec::new(),
      func,
      callback: None,
    }
  }

  /// Reads data from a source: the function is invoked once with an
  /// emit handle and produces the stream. Always the first step.
  pub fn read<F, Fut>(f: F) -> Self
  where
    F: Fn(CancellationToken, EmitHandle) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), GraphError>> + Send + 'static,
  {
    let func: EmitFn = Arc::new(move |token, _input, emit| Box::pin(f(token, emit)));
    Self::new(StepKind::Read, StepFunc::Emit(func))
  }

  /// Transforms each element, emitting zero or more outputs per input.
  pub fn map<F, Fut>(f: F) -> Self
  where
    F: Fn(CancellationToken, Payload, EmitHandle) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), GraphError>> + Send + 'static,
  {
    let func: EmitFn = Arc::new(move |token, input, emit| {
      let fut: BoxFuture<'static, Result<(), GraphError>> = match input {
        Some(value) => Box::pin(f(token, value, emit)),
        None => Box::pin(std::future::ready(Ok(()))),
      };
      fut
    });
    Self::new(StepKind::Map, StepFunc::Emit(func))
  }

  /// Observes each element without modifying the stream.
  pub fn peek<F>(f: F) -> Self
  where
    F: Fn(&Payload) + Send + Sync + 'static,
  {
    let func: EmitFn = Arc::new(move |_token, input, emit| {
      if let Some(ref value) = input {
        f(value);
      }
      Box::pin(async move {
        if let Some(value) = input {
          emit.emit(value).await;
        }
        Ok(())
      })
    });
    Self::new(StepKind::Peek, StepFunc::Emit(func))
  }

  /// Forwards only the elements the predicate accepts; checks for
  /// cancellation before forwarding.
  pub fn filter<F>(f: F) -> Self
  where
    F: Fn(&Payload) -> bool + Send + Sync + 'static,
  {
    let func: EmitFn = Arc::new(move |token, input, emit| {
      let keep = input.as_ref().map(|value| f(value)).unwrap_or(false);
      Box::pin(async move {
        if keep && !token.is_cancelled() {
          if let Some(value) = input {
            emit.emit(value).await;
          }
        }
        Ok(())
      })
    });
    Self::new(StepKind::Filter, StepFunc::Emit(func))
  }

  /// Merges multiple upstream streams into one linear stream, in
  /// arrival order.
  pub fn combine() -> Self {
    let func: EmitFn = Arc::new(move |_token, input, emit| {
      Box::pin(async move {
        if let Some(value) = input {
          emit.emit(value).await;
        }
        Ok(())
      })
    });
    Self::new(StepKind::Combine, StepFunc::Emit(func))
  }

  /// Consumes each element with the capturing function. Terminal.
  pub fn capture<F, Fut>(f: F) -> Self
  where
    F: Fn(CancellationToken, Payload) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), GraphError>> + Send + 'static,
  {
    let func: RequestFn = Arc::new(move |token, input| {
      let fut: BoxFuture<'static, Result<Option<Payload>, GraphError>> = match input {
        Some(value) => {
          let captured = f(token, value);
          Box::pin(async move { captured.await.map(|_| None) })
        }
        None => Box::pin(std::future::ready(Ok(None))),
      };
      fut
    });
    Self::new(StepKind::Capture, StepFunc::Request(func))
  }

  /// Accumulates every element; the callback receives the collection
  /// after a successful run. Terminal.
  pub fn collect<F>(callback: F) -> Self
  where
    F: Fn(Vec<Payload>) + Send + Sync + 'static,
  {
    Self::collector(callback, None)
  }

  /// Like [`collect`](Self::collect), inserting each element in the
  /// order given by the comparator as it arrives. Terminal.
  pub fn collect_ordered<F, C>(callback: F, compare: C) -> Self
  where
    F: Fn(Vec<Payload>) + Send + Sync + 'static,
    C: Fn(&Payload, &Payload) -> CmpOrdering + Send + Sync + 'static,
  {
    Self::collector(callback, Some(Arc::new(compare)))
  }

  fn collector<F>(
    callback: F,
    compare: Option<Arc<dyn Fn(&Payload, &Payload) -> CmpOrdering + Send + Sync>>,
  ) -> Self
  where
    F: Fn(Vec<Payload>) + Send + Sync + 'static,
  {
    let collected: Arc<Mutex<Vec<Payload>>> = Arc::new(Mutex::new(Vec::new()));

    let sink = collected.clone();
    let func: RequestFn = Arc::new(move |_token, input| {
      if let Some(value) = input {
        let mut items = sink.lock().unwrap();
        match &compare {
          Some(compare) => {
            let at = items
              .iter()
              .position(|existing| compare(existing, &value) == CmpOrdering::Greater)
              .unwrap_or(items.len());
            items.insert(at, value);
          }
          None => items.push(value),
        }
      }
      Box::pin(std::future::ready(Ok(None)))
    });

    let mut step = Self::new(StepKind::Collect, StepFunc::Request(func));
    step.callback = Some(Arc::new(move || {
      callback(collected.lock().unwrap().clone())
    }));
    step
  }

  /// Counts the elements; the callback receives the total after a
  /// successful run. Terminal.
  pub fn count<F>(callback: F) -> Self
  where
    F: Fn(u64) + Send + Sync + 'static,
  {
    let counter = Arc::new(AtomicU64::new(0));

    let tick = counter.clone();
    let func: RequestFn = Arc::new(move |_token, input| {
      if input.is_some() {
        tick.fetch_add(1, Ordering::Relaxed);
      }
      Box::pin(std::future::ready(Ok(None)))
    });

    let mut step = Self::new(StepKind::Count, StepFunc::Request(func));
    step.callback = Some(Arc::new(move || callback(counter.load(Ordering::Relaxed))));
    step
  }

  /// Sets the step key. Required for [`Plan`](super::Plan) steps;
  /// [`Seq`](super::Seq) generates one when absent.
  pub fn key(mut self, key: impl Into<String>) -> Self {
    self.key = Some(key.into());
    self
  }

  /// Runs the step as that many parallel node replicas. Only
  /// non-linear steps may be replicated.
  pub fn replicas(mut self, replicas: usize) -> Self {
    if replicas > 0 {
      self.replicas = replicas;
    }
    self
  }

  /// Distributes the step's output: each value goes to exactly one
  /// downstream replica instead of all of them.
  pub fn distributor(mut self) -> Self {
    self.distributor = true;
    self
  }

  /// Declares upstream steps data flows in from. Used by
  /// [`Plan`](super::Plan); [`Seq`](super::Seq) connects steps itself.
  pub fn upstream<I, S>(mut self, keys: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    self.connections.extend(keys.into_iter().map(Into::into));
    self
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn kinds_classify() {
    assert!(StepKind::Read.is_linear());
    assert!(StepKind::Collect.is_linear());
    assert!(!StepKind::Map.is_linear());
    assert!(!StepKind::Filter.is_linear());
    assert!(StepKind::Capture.is_terminal());
    assert!(StepKind::Count.is_terminal());
    assert!(!StepKind::Peek.is_terminal());
    assert_eq!(StepKind::Combine.to_string(), "combine");
  }

  #[test]
  fn builder_methods_accumulate() {
    let step = Step::map(|_token, _value, _emit| async { Ok(()) })
      .key("m")
      .replicas(3)
      .distributor()
      .upstream(["a", "b"]);
    assert_eq!(step.key.as_deref(), Some("m"));
    assert_eq!(step.replicas, 3);
    assert!(step.distributor);
    assert_eq!(step.connections, vec!["a", "b"]);
  }

  #[test]
  fn zero_replicas_keep_the_default() {
    let step = Step::map(|_token, _value, _emit| async { Ok(()) }).replicas(0);
    assert_eq!(step.replicas, 1);
  }
}
