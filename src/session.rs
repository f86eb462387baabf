//! Session orchestration: a run of the graph bounded by `start`/`stop`.
//!
//! A session holds the session lock exclusively for its whole duration;
//! mutators hold it in shared mode, which is what serializes structural
//! edits against runs. Starting a session derives a child cancellation
//! token from the caller's, reopens every edge channel closed by a
//! prior run, resets the per-session tallies, and launches one worker
//! task per node. The first worker error cancels the derived token and
//! becomes the run's result; workers that exit cleanly after
//! cancellation contribute nothing.

use crate::error::GraphError;
use crate::graph::Graph;
use crate::macros::vlog;
use crate::worker::{self, WorkerSpec};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct SessionState {
  token: Option<CancellationToken>,
  started: Option<Instant>,
  stopped: Option<Instant>,
}

pub(crate) struct SessionController {
  /// Held exclusively by a run, shared by mutators.
  gate: tokio::sync::RwLock<()>,
  state: Mutex<SessionState>,
  generation: AtomicU64,
}

impl SessionController {
  pub(crate) fn new() -> Self {
    Self {
      gate: tokio::sync::RwLock::new(()),
      state: Mutex::new(SessionState::default()),
      generation: AtomicU64::new(0),
    }
  }

  /// Shared acquisition for mutators: blocks while a run is in
  /// progress, free otherwise.
  pub(crate) async fn shared(&self) -> tokio::sync::RwLockReadGuard<'_, ()> {
    self.gate.read().await
  }
}

impl Graph {
  /// Runs the graph until every worker has exited.
  ///
  /// Blocks for the whole session and returns the first real worker
  /// error, if any. A run ends when all seed nodes finish and the
  /// close-of-stream has cascaded to the terminals, when
  /// [`stop`](Self::stop) (or the caller's `parent` token) cancels it,
  /// or when a worker fails.
  ///
  /// Fails immediately with [`GraphError::EmptyGraph`] when there are
  /// no nodes. Structural mutations block until the session ends.
  pub async fn start(&self, parent: CancellationToken) -> Result<(), GraphError> {
    let _run = self.session.gate.write().await;
    vlog!(self.cfg.verbose, "session starting");

    let token = parent.child_token();
    let generation = self.session.generation.fetch_add(1, Ordering::Relaxed) + 1;
    {
      let mut state = self.session.state.lock().unwrap();
      state.token = Some(token.clone());
      state.started = Some(Instant::now());
      state.stopped = None;
    }

    let specs: Vec<WorkerSpec> = {
      let reg = self.reg.read().unwrap();
      if reg.nodes.is_empty() {
        let mut state = self.session.state.lock().unwrap();
        state.token = None;
        state.started = None;
        return Err(GraphError::EmptyGraph);
      }

      // Fresh channels and tallies for this session; shared distributor
      // cells reopen once thanks to the generation guard.
      for out in reg.egress.values() {
        for edge in out.values() {
          edge.reset_for_session();
          edge.channel.reopen(generation);
        }
      }

      reg
        .nodes
        .values()
        .map(|node| WorkerSpec {
          node: node.clone(),
          ingress: reg
            .ingress
            .get(node.key())
            .map(|edges| edges.values().cloned().collect())
            .unwrap_or_default(),
          egress: reg
            .egress
            .get(node.key())
            .map(|edges| edges.values().cloned().collect())
            .unwrap_or_default(),
          ignore_isolated: self.cfg.ignore_isolated,
          verbose: self.cfg.verbose,
        })
        .collect()
    };

    let mut workers = JoinSet::new();
    for spec in specs {
      workers.spawn(worker::run(spec, token.clone()));
    }

    let mut first_error: Option<GraphError> = None;
    while let Some(joined) = workers.join_next().await {
      let failure = match joined {
        Ok(Ok(())) => None,
        Ok(Err(e)) => Some(e),
        Err(join_error) => Some(GraphError::user(join_error)),
      };
      if let Some(e) = failure {
        vlog!(self.cfg.verbose, error = %e, "worker failed, cancelling session");
        if first_error.is_none() {
          token.cancel();
          first_error = Some(e);
        }
      }
    }

    {
      let mut state = self.session.state.lock().unwrap();
      state.stopped = Some(Instant::now());
      state.token = None;
    }
    vlog!(self.cfg.verbose, "session ended");

    match first_error {
      Some(e) => Err(e),
      None => Ok(()),
    }
  }

  /// Triggers cancellation of the running session and returns
  /// immediately. With a configured stop gracetime the actual cancel is
  /// deferred by that duration on a background task. No-op when no
  /// session is running.
  pub fn stop(&self) {
    let token = self.session.state.lock().unwrap().token.clone();
    let Some(token) = token else { return };

    let gracetime = self.cfg.stop_gracetime;
    if gracetime.is_zero() {
      vlog!(self.cfg.verbose, "session going down");
      token.cancel();
    } else {
      vlog!(self.cfg.verbose, gracetime = ?gracetime, "session going down after gracetime");
      tokio::spawn(async move {
        tokio::time::sleep(gracetime).await;
        token.cancel();
      });
    }
  }

  /// Duration of the current session (still running), of the last
  /// session (stopped), or zero if the graph never ran.
  pub fn uptime(&self) -> Duration {
    let state = self.session.state.lock().unwrap();
    match (state.started, state.stopped) {
      (Some(started), Some(stopped)) => stopped.saturating_duration_since(started),
      (Some(started), None) => started.elapsed(),
      _ => Duration::ZERO,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::edge::EdgeConfig;
  use crate::graph::GraphConfig;
  use crate::node::NodeConfig;
  use crate::payload::payload;
  use std::sync::atomic::AtomicUsize;
  use std::sync::Arc;
  use tokio::time::timeout;

  #[tokio::test]
  async fn empty_graph_cannot_start() {
    let graph = Graph::default();
    assert!(matches!(
      graph.start(CancellationToken::new()).await,
      Err(GraphError::EmptyGraph)
    ));
    assert_eq!(graph.uptime(), Duration::ZERO);
  }

  #[tokio::test]
  async fn uptime_is_recorded_per_session() {
    let graph = Arc::new(Graph::new(GraphConfig::default().ignore_isolated(true)));
    graph
      .add_node(
        NodeConfig::new()
          .key("lonely")
          .request(|_token, input| async move { Ok(input) }),
      )
      .await
      .unwrap();
    graph.start(CancellationToken::new()).await.unwrap();
    assert!(graph.uptime() > Duration::ZERO);
  }


  #[tokio::test]
  async fn worker_error_cancels_the_run() {
    let graph = Arc::new(Graph::default());
    let produced = Arc::new(AtomicUsize::new(0));
    graph
      .add_node(NodeConfig::new().key("seed").request(move |_token, _input| {
        let produced = produced.clone();
        async move {
          if produced.fetch_add(1, Ordering::SeqCst) < 2 {
            Ok(Some(payload(1_i64)))
          } else {
            Err(GraphError::user("seed exploded"))
          }
        }
      }))
      .await
      .unwrap();
    graph
      .add_node(
        NodeConfig::new()
          .key("sink")
          .request(|_token, _input| async move { Ok(None) }),
      )
      .await
      .unwrap();
    graph
      .add_edge("seed", "sink", EdgeConfig::new().capacity(1))
      .await
      .unwrap();

    let result = timeout(Duration::from_secs(5), graph.start(CancellationToken::new()))
      .await
      .unwrap();
    match result {
      Err(GraphError::User(e)) => assert!(e.to_string().contains("seed exploded")),
      other => panic!("expected the seed error, got {:?}", other.err()),
    }
  }

  #[tokio::test]
  async fn parent_cancellation_ends_the_run_cleanly() {
    let graph = Arc::new(Graph::default());
    graph
      .add_node(
        NodeConfig::new()
          .key("seed")
          .request(|_token, _input| async move { Ok(Some(payload(1_i64))) }),
      )
      .await
      .unwrap();
    graph
      .add_node(
        NodeConfig::new()
          .key("sink")
          .request(|_token, _input| async move { Ok(None) }),
      )
      .await
      .unwrap();
    graph
      .add_edge("seed", "sink", EdgeConfig::default())
      .await
      .unwrap();

    let parent = CancellationToken::new();
    let handle = {
      let graph = graph.clone();
      let parent = parent.clone();
      tokio::spawn(async move { graph.start(parent).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    parent.cancel();
    let result = timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
    assert!(result.is_ok(), "cancellation must not surface as an error");
  }

  #[tokio::test]
  async fn mutators_wait_for_the_session() {
    let graph = Arc::new(Graph::default());
    graph
      .add_node(
        NodeConfig::new()
          .key("seed")
          .request(|_token, _input| async move { Ok(Some(payload(1_i64))) }),
      )
      .await
      .unwrap();
    graph
      .add_node(
        NodeConfig::new()
          .key("sink")
          .request(|_token, _input| async move { Ok(None) }),
      )
      .await
      .unwrap();
    graph
      .add_edge("seed", "sink", EdgeConfig::default())
      .await
      .unwrap();

    let handle = {
      let graph = graph.clone();
      tokio::spawn(async move { graph.start(CancellationToken::new()).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    // The mutation blocks behind the session lock until stop unblocks it.
    let add = {
      let graph = graph.clone();
      tokio::spawn(async move {
        graph
          .add_node(
            NodeConfig::new()
              .key("late")
              .request(|_token, input| async move { Ok(input) }),
          )
          .await
      })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!add.is_finished(), "mutator ran during the session");

    graph.stop();
    timeout(Duration::from_secs(5), handle).await.unwrap().unwrap().unwrap();
    timeout(Duration::from_secs(5), add).await.unwrap().unwrap().unwrap();
    assert!(graph.has_node("late"));
  }

  #[tokio::test]
  async fn stop_without_session_is_a_no_op() {
    let graph = Graph::default();
    graph.stop();
  }
}
