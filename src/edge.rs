//! Edges: directed, bounded channels between two nodes.
//!
//! An edge is identified by its `(from, to)` node pair. The value
//! transport is a [`ChannelCell`]: a bounded tokio mpsc channel that is
//! recreated at every session start and closed exactly once when the
//! producing node's worker exits, so consumers drain the remaining
//! values and then observe end-of-stream.
//!
//! Two details depart from a plain mpsc pair:
//!
//! - **Capacity 0 is a rendezvous.** tokio channels have no zero
//!   capacity, so an unbuffered edge sends `(value, ack)` through a
//!   one-slot channel and the send completes only after the receiver
//!   acknowledges taking the value.
//! - **The receiver is shared.** A distributor node's egress edges all
//!   hold the same cell; the consumers take turns on the receiver behind
//!   an async mutex, which is what partitions the values among them.

use crate::macros::vlog;
use crate::node::Span;
use crate::payload::Payload;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

/// One value in flight, with an acknowledgement slot for rendezvous edges.
type Item = (Payload, Option<oneshot::Sender<()>>);

/// Outcome of a cancellable send.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum SendOutcome {
  Sent,
  Cancelled,
  Closed,
}

/// Outcome of a cancellable receive.
pub(crate) enum RecvOutcome {
  Value(Payload),
  Cancelled,
  Closed,
}

struct CellState {
  tx: Option<mpsc::Sender<Item>>,
  rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Item>>>,
  generation: u64,
}

/// The channel behind one edge (or behind all egress edges of a
/// distributor node). Reopened per session, closed once per session by
/// the producer.
pub(crate) struct ChannelCell {
  capacity: usize,
  state: Mutex<CellState>,
}

impl ChannelCell {
  pub(crate) fn new(capacity: usize) -> Arc<Self> {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    Arc::new(Self {
      capacity,
      state: Mutex::new(CellState {
        tx: Some(tx),
        rx: Arc::new(tokio::sync::Mutex::new(rx)),
        generation: 0,
      }),
    })
  }

  pub(crate) fn capacity(&self) -> usize {
    self.capacity
  }

  /// Recreates the channel for a new session. Shared cells are visited
  /// once per incident edge; the generation guard makes the reopen
  /// happen once.
  pub(crate) fn reopen(&self, generation: u64) {
    let mut state = self.state.lock().unwrap();
    if state.generation == generation {
      return;
    }
    let (tx, rx) = mpsc::channel(self.capacity.max(1));
    state.tx = Some(tx);
    state.rx = Arc::new(tokio::sync::Mutex::new(rx));
    state.generation = generation;
  }

  /// Drops the producer side so consumers see end-of-stream after
  /// draining. Idempotent within a session.
  pub(crate) fn close(&self) {
    self.state.lock().unwrap().tx.take();
  }

  /// Sends one value, blocking on backpressure, unless the token fires
  /// first. On an unbuffered cell the send completes only after a
  /// receiver takes the value.
  pub(crate) async fn send(&self, value: Payload, token: &CancellationToken) -> SendOutcome {
    let tx = match self.state.lock().unwrap().tx.clone() {
      Some(tx) => tx,
      None => return SendOutcome::Closed,
    };

    if self.capacity == 0 {
      let (ack_tx, ack_rx) = oneshot::channel();
      tokio::select! {
        _ = token.cancelled() => SendOutcome::Cancelled,
        sent = tx.send((value, Some(ack_tx))) => {
          if sent.is_err() {
            return SendOutcome::Closed;
          }
          tokio::select! {
            _ = token.cancelled() => SendOutcome::Cancelled,
            // A dropped ack means the receiver took the value and went
            // away before acknowledging; the handoff still happened.
            _ = ack_rx => SendOutcome::Sent,
          }
        }
      }
    } else {
      tokio::select! {
        _ = token.cancelled() => SendOutcome::Cancelled,
        sent = tx.send((value, None)) => {
          if sent.is_err() { SendOutcome::Closed } else { SendOutcome::Sent }
        }
      }
    }
  }

  /// Receives one value, unless the token fires first. Returns
  /// [`RecvOutcome::Closed`] once the producer closed the cell and the
  /// buffer is drained.
  pub(crate) async fn recv(&self, token: &CancellationToken) -> RecvOutcome {
    let rx = self.state.lock().unwrap().rx.clone();
    tokio::select! {
      _ = token.cancelled() => RecvOutcome::Cancelled,
      item = async move { rx.lock().await.recv().await } => {
        match item {
          None => RecvOutcome::Closed,
          Some((value, ack)) => {
            if let Some(ack) = ack {
              let _ = ack.send(());
            }
            RecvOutcome::Value(value)
          }
        }
      }
    }
  }
}

/// Configuration for [`Graph::add_edge`](crate::Graph::add_edge).
#[derive(Debug, Clone, Copy, Default)]
pub struct EdgeConfig {
  pub(crate) capacity: usize,
}

impl EdgeConfig {
  pub fn new() -> Self {
    Self::default()
  }

  /// Channel capacity for the edge. Zero (the default) makes the edge a
  /// rendezvous: sends block until a matching receive.
  pub fn capacity(mut self, capacity: usize) -> Self {
    self.capacity = capacity;
    self
  }
}

/// A directed edge in a [`Graph`](crate::Graph). Data flows from
/// `from` to `to`.
pub struct Edge {
  from: String,
  to: String,
  pub(crate) channel: Arc<ChannelCell>,
  tally: AtomicU64,
  paused: AtomicBool,
  removed: AtomicBool,
  span: Mutex<Span>,
}

impl Edge {
  pub(crate) fn new(from: &str, to: &str, channel: Arc<ChannelCell>) -> Arc<Self> {
    Arc::new(Self {
      from: from.to_string(),
      to: to.to_string(),
      channel,
      tally: AtomicU64::new(0),
      paused: AtomicBool::new(false),
      removed: AtomicBool::new(false),
      span: Mutex::new(Span::default()),
    })
  }

  /// Key of the node this edge leads out of.
  pub fn from(&self) -> &str {
    &self.from
  }

  /// Key of the node this edge leads into.
  pub fn to(&self) -> &str {
    &self.to
  }

  /// Number of values delivered on this edge since the current session
  /// began.
  pub fn tally(&self) -> u64 {
    self.tally.load(Ordering::Relaxed)
  }

  /// True while the edge is paused; a paused edge is ignored by the
  /// next session until resumed.
  pub fn is_paused(&self) -> bool {
    self.paused.load(Ordering::Relaxed)
  }

  /// True once the edge is marked for deletion; it stays ignored until
  /// [`Graph::purge`](crate::Graph::purge) sweeps it.
  pub fn is_removed(&self) -> bool {
    self.removed.load(Ordering::Relaxed)
  }

  /// Time this edge carried (or has been carrying) the current or last
  /// session; zero if it never ran.
  pub fn uptime(&self) -> Duration {
    self.span.lock().unwrap().uptime()
  }

  pub(crate) fn is_active(&self) -> bool {
    !self.is_paused() && !self.is_removed()
  }

  pub(crate) fn set_paused(&self, paused: bool) {
    self.paused.store(paused, Ordering::Relaxed);
  }

  pub(crate) fn set_removed(&self) {
    self.removed.store(true, Ordering::Relaxed);
  }

  pub(crate) fn bump_tally(&self) {
    self.tally.fetch_add(1, Ordering::Relaxed);
  }

  /// Receives one value and counts it. The tally is incremented on the
  /// receive side; distribute-mode consumers race on the shared channel
  /// but each value is tallied on exactly one edge.
  pub(crate) async fn recv(&self, token: &CancellationToken, verbose: bool) -> RecvOutcome {
    let outcome = self.channel.recv(token).await;
    if let RecvOutcome::Value(_) = outcome {
      self.bump_tally();
      vlog!(verbose, from = %self.from, to = %self.to, "edge delivered value");
    }
    outcome
  }

  pub(crate) fn reset_for_session(&self) {
    self.tally.store(0, Ordering::Relaxed);
    self.span.lock().unwrap().start();
  }

  pub(crate) fn mark_stopped(&self) {
    self.span.lock().unwrap().stop();
  }
}

impl std::fmt::Debug for Edge {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Edge")
      .field("from", &self.from)
      .field("to", &self.to)
      .field("tally", &self.tally())
      .field("paused", &self.is_paused())
      .field("removed", &self.is_removed())
      .finish()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::payload::payload;
  use std::time::Duration;
  use tokio::time::{sleep, timeout};

  #[tokio::test]
  async fn buffered_send_completes_without_receiver() {
    let cell = ChannelCell::new(2);
    let token = CancellationToken::new();
    assert_eq!(cell.send(payload(1_i64), &token).await, SendOutcome::Sent);
    assert_eq!(cell.send(payload(2_i64), &token).await, SendOutcome::Sent);
  }

  #[tokio::test]
  async fn rendezvous_send_blocks_until_receive() {
    let cell = ChannelCell::new(0);
    let token = CancellationToken::new();

    let sender = {
      let cell = cell.clone();
      let token = token.clone();
      tokio::spawn(async move { cell.send(payload(7_i64), &token).await })
    };

    sleep(Duration::from_millis(50)).await;
    assert!(!sender.is_finished(), "unbuffered send completed before a receive");

    match cell.recv(&token).await {
      RecvOutcome::Value(v) => assert_eq!(*v.downcast_ref::<i64>().unwrap(), 7),
      _ => panic!("expected a value"),
    }
    assert_eq!(
      timeout(Duration::from_secs(1), sender).await.unwrap().unwrap(),
      SendOutcome::Sent
    );
  }

  #[tokio::test]
  async fn cancellation_unblocks_send_and_recv() {
    let cell = ChannelCell::new(0);
    let token = CancellationToken::new();
    token.cancel();
    assert_eq!(cell.send(payload(1_i64), &token).await, SendOutcome::Cancelled);
    assert!(matches!(cell.recv(&token).await, RecvOutcome::Cancelled));
  }

  #[tokio::test]
  async fn close_yields_end_of_stream_after_drain() {
    let cell = ChannelCell::new(4);
    let token = CancellationToken::new();
    cell.send(payload(1_i64), &token).await;
    cell.close();
    assert!(matches!(cell.recv(&token).await, RecvOutcome::Value(_)));
    assert!(matches!(cell.recv(&token).await, RecvOutcome::Closed));
    assert_eq!(cell.send(payload(2_i64), &token).await, SendOutcome::Closed);
  }

  #[tokio::test]
  async fn reopen_is_guarded_by_generation() {
    let cell = ChannelCell::new(1);
    let token = CancellationToken::new();
    cell.close();
    cell.reopen(1);
    cell.reopen(1);
    assert_eq!(cell.send(payload(1_i64), &token).await, SendOutcome::Sent);
    // Same generation: the open channel (holding one value) is kept.
    cell.reopen(1);
    assert!(matches!(cell.recv(&token).await, RecvOutcome::Value(_)));
  }

  #[tokio::test]
  async fn shared_receiver_partitions_values() {
    let cell = ChannelCell::new(8);
    let token = CancellationToken::new();
    for i in 0..4_i64 {
      cell.send(payload(i), &token).await;
    }
    cell.close();

    let mut seen = Vec::new();
    loop {
      match cell.recv(&token).await {
        RecvOutcome::Value(v) => seen.push(*v.downcast_ref::<i64>().unwrap()),
        RecvOutcome::Closed => break,
        RecvOutcome::Cancelled => panic!("not cancelled"),
      }
    }
    assert_eq!(seen, vec![0, 1, 2, 3]);
  }

  #[tokio::test]
  async fn edge_counts_receives() {
    let cell = ChannelCell::new(2);
    let edge = Edge::new("a", "b", cell.clone());
    let token = CancellationToken::new();
    cell.send(payload(1_i64), &token).await;
    edge.recv(&token, false).await;
    assert_eq!(edge.tally(), 1);
    edge.reset_for_session();
    assert_eq!(edge.tally(), 0);
  }
}
