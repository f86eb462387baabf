//! Nodes: the processing elements of a graph.
//!
//! A node is a user-supplied async function keyed by a unique string.
//! Its role (seed / transit / terminus) is not declared; it falls out of
//! the edges incident on it when a session starts. A node carries exactly
//! one of two function kinds:
//!
//! - **request/response**: invoked once per input (or in a loop for a
//!   seed) and returns at most one output value per invocation;
//! - **emitter**: invoked once per input (or once, for a seed) and
//!   emits any number of output values through an [`EmitHandle`] before
//!   returning.
//!
//! Either kind signals normal termination by returning one of the
//! sentinel errors ([`GraphError::SeedingDone`],
//! [`GraphError::NodeGoingAway`]).

use crate::error::GraphError;
use crate::payload::Payload;
use futures::future::BoxFuture;
use std::future::Future;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// A request/response node function: at most one output per invocation.
/// The input is `None` when the node runs as a seed.
pub type RequestFn = Arc<
  dyn Fn(CancellationToken, Option<Payload>) -> BoxFuture<'static, Result<Option<Payload>, GraphError>>
    + Send
    + Sync,
>;

/// An emitter node function: zero or more outputs per invocation,
/// delivered through the [`EmitHandle`]. The input is `None` when the
/// node runs as a seed.
pub type EmitFn = Arc<
  dyn Fn(CancellationToken, Option<Payload>, EmitHandle) -> BoxFuture<'static, Result<(), GraphError>>
    + Send
    + Sync,
>;

#[derive(Clone)]
pub(crate) enum NodeFunc {
  Request(RequestFn),
  Emit(EmitFn),
}

/// Hands emitted values to the engine.
///
/// Values land in a per-worker buffer that a forwarder task drains
/// toward the egress edges, so emitting is decoupled from downstream
/// backpressure up to the buffer size. `emit` never blocks past
/// cancellation: once the session is cancelled the value is dropped.
#[derive(Clone)]
pub struct EmitHandle {
  tx: mpsc::Sender<Payload>,
  token: CancellationToken,
}

impl EmitHandle {
  pub(crate) fn new(tx: mpsc::Sender<Payload>, token: CancellationToken) -> Self {
    Self { tx, token }
  }

  /// Emits one value downstream.
  pub async fn emit(&self, value: Payload) {
    tokio::select! {
      _ = self.token.cancelled() => {}
      _ = self.tx.send(value) => {}
    }
  }
}

/// Start/stop instants of the current or last session.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct Span {
  started: Option<Instant>,
  stopped: Option<Instant>,
}

impl Span {
  pub(crate) fn start(&mut self) {
    self.started = Some(Instant::now());
    self.stopped = None;
  }

  pub(crate) fn stop(&mut self) {
    self.stopped = Some(Instant::now());
  }

  pub(crate) fn uptime(&self) -> Duration {
    match (self.started, self.stopped) {
      (Some(started), Some(stopped)) => stopped.saturating_duration_since(started),
      (Some(started), None) => started.elapsed(),
      _ => Duration::ZERO,
    }
  }
}

/// A node in a [`Graph`](crate::Graph).
pub struct Node {
  key: String,
  distributor: bool,
  pub(crate) func: NodeFunc,
  span: Mutex<Span>,
}

impl Node {
  /// The node's unique key.
  pub fn key(&self) -> &str {
    &self.key
  }

  /// True when produced values are distributed (each to exactly one
  /// egress consumer) instead of broadcast to every egress edge.
  pub fn is_distributor(&self) -> bool {
    self.distributor
  }

  /// Time this node's worker has been (or was) up in the current or
  /// last session; zero if it never ran.
  pub fn uptime(&self) -> Duration {
    self.span.lock().unwrap().uptime()
  }

  pub(crate) fn mark_started(&self) {
    self.span.lock().unwrap().start();
  }

  pub(crate) fn mark_stopped(&self) {
    self.span.lock().unwrap().stop();
  }
}

impl std::fmt::Debug for Node {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Node")
      .field("key", &self.key)
      .field("distributor", &self.distributor)
      .finish()
  }
}

/// Configuration for [`Graph::add_node`](crate::Graph::add_node).
///
/// A key comes from [`key`](Self::key) or a [`key_fn`](Self::key_fn)
/// generator; exactly one of [`request`](Self::request) /
/// [`emit`](Self::emit) must be set.
#[derive(Default)]
pub struct NodeConfig {
  key: Option<String>,
  key_fn: Option<Box<dyn Fn() -> String + Send + Sync>>,
  distributor: bool,
  request_fn: Option<RequestFn>,
  emit_fn: Option<EmitFn>,
}

impl NodeConfig {
  pub fn new() -> Self {
    Self::default()
  }

  /// Sets the node key.
  pub fn key(mut self, key: impl Into<String>) -> Self {
    self.key = Some(key.into());
    self
  }

  /// Sets a generator used to mint the key when none is given.
  pub fn key_fn<F>(mut self, f: F) -> Self
  where
    F: Fn() -> String + Send + Sync + 'static,
  {
    self.key_fn = Some(Box::new(f));
    self
  }

  /// Puts the node in distribute mode: every produced value goes to
  /// exactly one egress consumer over a shared channel.
  pub fn distributor(mut self) -> Self {
    self.distributor = true;
    self
  }

  /// Sets a request/response function.
  pub fn request<F, Fut>(mut self, f: F) -> Self
  where
    F: Fn(CancellationToken, Option<Payload>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Option<Payload>, GraphError>> + Send + 'static,
  {
    self.request_fn = Some(Arc::new(move |token, input| Box::pin(f(token, input))));
    self
  }

  /// Sets an emitter function.
  pub fn emit<F, Fut>(mut self, f: F) -> Self
  where
    F: Fn(CancellationToken, Option<Payload>, EmitHandle) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), GraphError>> + Send + 'static,
  {
    self.emit_fn = Some(Arc::new(move |token, input, emit| {
      Box::pin(f(token, input, emit))
    }));
    self
  }

  pub(crate) fn request_raw(mut self, f: RequestFn) -> Self {
    self.request_fn = Some(f);
    self
  }

  pub(crate) fn emit_raw(mut self, f: EmitFn) -> Self {
    self.emit_fn = Some(f);
    self
  }

  /// Validates the config and produces the node. Key uniqueness is the
  /// registry's concern, not checked here.
  pub(crate) fn build(self) -> Result<Node, GraphError> {
    let key = match (self.key, &self.key_fn) {
      (Some(key), _) if !key.is_empty() => key,
      (None, Some(key_fn)) => {
        let key = key_fn();
        if key.is_empty() {
          return Err(GraphError::BadNodeKey);
        }
        key
      }
      _ => return Err(GraphError::BadNodeKey),
    };

    let func = match (self.request_fn, self.emit_fn) {
      (Some(f), None) => NodeFunc::Request(f),
      (None, Some(f)) => NodeFunc::Emit(f),
      (None, None) => return Err(GraphError::MissingNodeFunc),
      (Some(_), Some(_)) => return Err(GraphError::TooManyNodeFuncs),
    };

    Ok(Node {
      key,
      distributor: self.distributor,
      func,
      span: Mutex::new(Span::default()),
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn identity() -> NodeConfig {
    NodeConfig::new().request(|_token, input| async move { Ok(input) })
  }

  #[test]
  fn builds_with_literal_key() {
    let node = identity().key("a").build().unwrap();
    assert_eq!(node.key(), "a");
    assert!(!node.is_distributor());
  }

  #[test]
  fn builds_with_key_generator() {
    let node = identity().key_fn(|| "gen-1".to_string()).build().unwrap();
    assert_eq!(node.key(), "gen-1");
  }

  #[test]
  fn rejects_missing_key() {
    assert!(matches!(identity().build(), Err(GraphError::BadNodeKey)));
    assert!(matches!(
      identity().key("").build(),
      Err(GraphError::BadNodeKey)
    ));
  }

  #[test]
  fn rejects_missing_function() {
    assert!(matches!(
      NodeConfig::new().key("a").build(),
      Err(GraphError::MissingNodeFunc)
    ));
  }

  #[test]
  fn rejects_both_functions() {
    let config = identity()
      .key("a")
      .emit(|_token, _input, _emit| async { Ok(()) });
    assert!(matches!(config.build(), Err(GraphError::TooManyNodeFuncs)));
  }

  #[test]
  fn uptime_tracks_span() {
    let node = identity().key("a").build().unwrap();
    assert_eq!(node.uptime(), Duration::ZERO);
    node.mark_started();
    node.mark_stopped();
    assert!(node.uptime() < Duration::from_secs(1));
  }
}
