//! Per-node workers: the execution core of a session.
//!
//! Each node gets one worker task. The worker snapshots the node's
//! *effective* edges at entry (incident edges that are neither paused
//! nor removed) and derives its role from them:
//!
//! - no effective edges: isolated (clean exit or error, per config);
//! - egress only: **seed**, producing values until a sentinel;
//! - both: **transit**, one sub-worker per ingress edge, all under a
//!   child token with first-error-cancels semantics;
//! - ingress only: **terminus**, like transit, minus delivery.
//!
//! Emitter invocations write into a bounded buffer drained by a
//! forwarder task, so one input can fan out into many outputs without
//! tying the node's input side to downstream backpressure.
//!
//! Seeds and transits close their egress channels on exit; downstream
//! workers drain and observe end-of-stream, which is how a finished
//! graph winds itself down. Cancellation is cooperative and never
//! surfaces as an error.

use crate::edge::{Edge, RecvOutcome, SendOutcome};
use crate::error::GraphError;
use crate::macros::vlog;
use crate::node::{EmitHandle, Node, NodeFunc};
use crate::payload::Payload;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

/// Capacity of the emit buffer between an emitter invocation and its
/// forwarder.
const EMIT_BUFFER: usize = 64;

/// Everything a worker needs; snapshotted by the session so the task
/// borrows nothing from the graph.
pub(crate) struct WorkerSpec {
  pub node: Arc<Node>,
  pub ingress: Vec<Arc<Edge>>,
  pub egress: Vec<Arc<Edge>>,
  pub ignore_isolated: bool,
  pub verbose: bool,
}

/// Result of pushing one value downstream.
#[derive(PartialEq, Eq)]
enum Delivery {
  Done,
  /// Cancelled (or the unexpected loss of an egress channel): stop
  /// producing, exit cleanly.
  Interrupted,
}

pub(crate) async fn run(spec: WorkerSpec, token: CancellationToken) -> Result<(), GraphError> {
  let WorkerSpec {
    node,
    ingress,
    egress,
    ignore_isolated,
    verbose,
  } = spec;
  let key = node.key().to_string();

  let ingress: Vec<Arc<Edge>> = ingress.into_iter().filter(|e| e.is_active()).collect();
  let egress: Vec<Arc<Edge>> = egress.into_iter().filter(|e| e.is_active()).collect();

  vlog!(verbose, node = %key, ingress = ingress.len(), egress = egress.len(), "worker up");
  node.mark_started();
  let result = dispatch(&node, &key, ingress, &egress, ignore_isolated, verbose, &token).await;

  // Producers close their egress so consumers drain and see
  // end-of-stream; the close guard makes shared distributor cells
  // close once.
  if !egress.is_empty() {
    if node.is_distributor() {
      egress[0].channel.close();
    } else {
      for edge in &egress {
        edge.channel.close();
      }
    }
    for edge in &egress {
      edge.mark_stopped();
    }
  }

  node.mark_stopped();
  vlog!(verbose, node = %key, "worker down");
  result
}

async fn dispatch(
  node: &Arc<Node>,
  key: &str,
  ingress: Vec<Arc<Edge>>,
  egress: &[Arc<Edge>],
  ignore_isolated: bool,
  verbose: bool,
  token: &CancellationToken,
) -> Result<(), GraphError> {
  match (ingress.is_empty(), egress.is_empty()) {
    (true, true) => {
      if ignore_isolated {
        vlog!(verbose, node = %key, "isolated node ignored");
        Ok(())
      } else {
        Err(GraphError::IsolatedNode(key.to_string()))
      }
    }
    (true, false) => run_seed(node, key, egress, verbose, token).await,
    (false, _) => run_consumers(node, key, ingress, egress, verbose, token).await,
  }
}

/// Seed: produce until a sentinel (or cancellation) ends the loop.
async fn run_seed(
  node: &Arc<Node>,
  key: &str,
  egress: &[Arc<Edge>],
  verbose: bool,
  token: &CancellationToken,
) -> Result<(), GraphError> {
  vlog!(verbose, node = %key, "seed running");
  match node.func.clone() {
    NodeFunc::Request(func) => loop {
      if token.is_cancelled() {
        return Ok(());
      }
      match func(token.clone(), None).await {
        Ok(Some(value)) => {
          if deliver(node, key, egress, value, verbose, token).await == Delivery::Interrupted {
            return Ok(());
          }
        }
        Ok(None) => {}
        Err(e) if e.is_signal() => {
          vlog!(verbose, node = %key, signal = %e, "seed finished");
          return Ok(());
        }
        Err(e) => return Err(e),
      }
    },
    NodeFunc::Emit(func) => {
      let (forwarder, emit) = spawn_forwarder(node, key, egress, verbose, token);
      let result = func(token.clone(), None, emit).await;
      let _ = forwarder.await;
      match result {
        Err(e) if !e.is_signal() => Err(e),
        _ => Ok(()),
      }
    }
  }
}

/// Transit and terminus: one sub-worker per ingress edge under a child
/// token; the first sub-worker error cancels the rest.
async fn run_consumers(
  node: &Arc<Node>,
  key: &str,
  ingress: Vec<Arc<Edge>>,
  egress: &[Arc<Edge>],
  verbose: bool,
  token: &CancellationToken,
) -> Result<(), GraphError> {
  let role = if egress.is_empty() { "terminus" } else { "transit" };
  vlog!(verbose, node = %key, role = role, "node running");

  let child = token.child_token();
  let mut lanes = JoinSet::new();
  for edge in ingress {
    let node = node.clone();
    let key = key.to_string();
    let egress = egress.to_vec();
    let child = child.clone();
    lanes.spawn(async move { run_lane(&node, &key, edge, &egress, verbose, &child).await });
  }

  let mut first_error: Option<GraphError> = None;
  while let Some(joined) = lanes.join_next().await {
    let failure = match joined {
      Ok(Ok(())) => None,
      Ok(Err(e)) => Some(e),
      Err(join_error) => Some(GraphError::user(join_error)),
    };
    if let Some(e) = failure {
      if first_error.is_none() {
        child.cancel();
        first_error = Some(e);
      }
    }
  }

  match first_error {
    Some(e) => Err(e),
    None => Ok(()),
  }
}

/// One ingress lane: receive, invoke, deliver, until end-of-stream.
async fn run_lane(
  node: &Arc<Node>,
  key: &str,
  edge: Arc<Edge>,
  egress: &[Arc<Edge>],
  verbose: bool,
  token: &CancellationToken,
) -> Result<(), GraphError> {
  match node.func.clone() {
    NodeFunc::Request(func) => loop {
      let value = match edge.recv(token, verbose).await {
        RecvOutcome::Value(value) => value,
        RecvOutcome::Closed => {
          vlog!(verbose, node = %key, from = %edge.from(), "lane end of stream");
          return Ok(());
        }
        RecvOutcome::Cancelled => return Ok(()),
      };
      match func(token.clone(), Some(value)).await {
        Ok(Some(out)) => {
          if !egress.is_empty()
            && deliver(node, key, egress, out, verbose, token).await == Delivery::Interrupted
          {
            return Ok(());
          }
        }
        Ok(None) => {}
        Err(GraphError::NodeGoingAway) => {
          vlog!(verbose, node = %key, from = %edge.from(), "lane going away");
          return Ok(());
        }
        Err(e) => return Err(e),
      }
    },
    NodeFunc::Emit(func) => {
      let (forwarder, emit) = spawn_forwarder(node, key, egress, verbose, token);
      let result = loop {
        let value = match edge.recv(token, verbose).await {
          RecvOutcome::Value(value) => value,
          RecvOutcome::Closed => {
            vlog!(verbose, node = %key, from = %edge.from(), "lane end of stream");
            break Ok(());
          }
          RecvOutcome::Cancelled => break Ok(()),
        };
        match func(token.clone(), Some(value), emit.clone()).await {
          Ok(()) => {}
          Err(GraphError::NodeGoingAway) => {
            vlog!(verbose, node = %key, from = %edge.from(), "lane going away");
            break Ok(());
          }
          Err(e) => break Err(e),
        }
      };
      drop(emit);
      let _ = forwarder.await;
      result
    }
  }
}

/// Starts the forwarder that drains an emit buffer toward the egress
/// edges, and hands back the emit side. Dropping every [`EmitHandle`]
/// ends the forwarder once the buffer is drained. With no egress (an
/// emitter terminus) emitted values are discarded.
fn spawn_forwarder(
  node: &Arc<Node>,
  key: &str,
  egress: &[Arc<Edge>],
  verbose: bool,
  token: &CancellationToken,
) -> (JoinHandle<()>, EmitHandle) {
  let (tx, mut rx) = mpsc::channel::<Payload>(EMIT_BUFFER);
  let emit = EmitHandle::new(tx, token.clone());

  let node = node.clone();
  let key = key.to_string();
  let egress = egress.to_vec();
  let token = token.clone();
  let forwarder = tokio::spawn(async move {
    while let Some(value) = rx.recv().await {
      if egress.is_empty() {
        continue;
      }
      if deliver(&node, &key, &egress, value, verbose, &token).await == Delivery::Interrupted {
        break;
      }
    }
  });
  (forwarder, emit)
}

/// Pushes one produced value downstream.
///
/// Broadcast sends it on every egress edge in turn; distribute sends it
/// once on the shared channel and lets consumer fairness pick the
/// receiver. Cancellation mid-delivery aborts without error.
async fn deliver(
  node: &Arc<Node>,
  key: &str,
  egress: &[Arc<Edge>],
  value: Payload,
  verbose: bool,
  token: &CancellationToken,
) -> Delivery {
  if node.is_distributor() {
    let edge = &egress[0];
    vlog!(verbose, node = %key, "distributing value");
    match edge.channel.send(value, token).await {
      SendOutcome::Sent => Delivery::Done,
      SendOutcome::Cancelled | SendOutcome::Closed => Delivery::Interrupted,
    }
  } else {
    for edge in egress {
      vlog!(verbose, node = %key, to = %edge.to(), "sending value");
      match edge.channel.send(value.clone(), token).await {
        SendOutcome::Sent => {}
        SendOutcome::Cancelled | SendOutcome::Closed => return Delivery::Interrupted,
      }
    }
    Delivery::Done
  }
}
