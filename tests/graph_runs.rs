//! End-to-end runs over hand-built graphs: chains, fan-outs,
//! distribution, cycles with stop, and pause/isolation behavior.

use std::any::Any;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::time::{sleep, timeout};
use weft::{
  payload, CancellationToken, EdgeConfig, Graph, GraphConfig, GraphError, NodeConfig,
};

const RUN_DEADLINE: Duration = Duration::from_secs(5);

/// Run a test with `RUST_LOG=weft=debug` to watch the engine events.
fn init_logs() {
  let _ = tracing_subscriber::fmt::try_init();
}

/// A request/response seed handing out the given values in order, then
/// finishing.
fn seed<T>(key: &str, values: Vec<T>) -> NodeConfig
where
  T: Any + Send + Sync + Clone,
{
  let index = Arc::new(AtomicUsize::new(0));
  NodeConfig::new().key(key).request(move |_token, _input| {
    let index = index.clone();
    let values = values.clone();
    async move {
      match values.get(index.fetch_add(1, Ordering::SeqCst)) {
        Some(value) => Ok(Some(payload(value.clone()))),
        None => Err(GraphError::SeedingDone),
      }
    }
  })
}

/// A transit that forwards its input unchanged.
fn identity(key: &str) -> NodeConfig {
  NodeConfig::new()
    .key(key)
    .request(|_token, input| async move { Ok(input) })
}

/// A terminus appending every input to the shared list.
fn collector<T>(key: &str, sink: Arc<Mutex<Vec<T>>>) -> NodeConfig
where
  T: Any + Send + Sync + Clone,
{
  NodeConfig::new().key(key).request(move |_token, input| {
    let sink = sink.clone();
    async move {
      if let Some(value) = input {
        sink
          .lock()
          .unwrap()
          .push(value.downcast_ref::<T>().unwrap().clone());
      }
      Ok(None)
    }
  })
}

#[tokio::test]
async fn one_way_chain_delivers_in_order() {
  init_logs();
  let graph = Graph::default();
  let received: Arc<Mutex<Vec<i64>>> = Arc::new(Mutex::new(Vec::new()));

  graph.add_node(seed("a", vec![1_i64, 2, 3])).await.unwrap();
  graph.add_node(identity("b")).await.unwrap();
  graph
    .add_node(collector("c", received.clone()))
    .await
    .unwrap();
  graph.add_edge("a", "b", EdgeConfig::default()).await.unwrap();
  graph.add_edge("b", "c", EdgeConfig::default()).await.unwrap();

  timeout(RUN_DEADLINE, graph.start(CancellationToken::new()))
    .await
    .unwrap()
    .unwrap();

  assert_eq!(*received.lock().unwrap(), vec![1, 2, 3]);
  assert_eq!(graph.edge("a", "b").unwrap().tally(), 3);
  assert_eq!(graph.edge("b", "c").unwrap().tally(), 3);
}

#[tokio::test]
async fn broadcast_reaches_every_egress_edge() {
  let graph = Graph::default();
  let left: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
  let right: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

  graph
    .add_node(seed("a", vec!["x".to_string()]))
    .await
    .unwrap();
  graph.add_node(collector("b", left.clone())).await.unwrap();
  graph.add_node(collector("c", right.clone())).await.unwrap();
  graph.add_edge("a", "b", EdgeConfig::default()).await.unwrap();
  graph.add_edge("a", "c", EdgeConfig::default()).await.unwrap();

  timeout(RUN_DEADLINE, graph.start(CancellationToken::new()))
    .await
    .unwrap()
    .unwrap();

  assert_eq!(*left.lock().unwrap(), vec!["x"]);
  assert_eq!(*right.lock().unwrap(), vec!["x"]);
  assert_eq!(graph.edge("a", "b").unwrap().tally(), 1);
  assert_eq!(graph.edge("a", "c").unwrap().tally(), 1);
}

#[tokio::test]
async fn distribute_partitions_values_among_consumers() {
  let graph = Graph::default();
  let left: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
  let right: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

  let values: Vec<String> = ["x", "y", "z"].iter().map(|s| s.to_string()).collect();
  graph
    .add_node(seed("a", values.clone()).distributor())
    .await
    .unwrap();
  graph.add_node(collector("b", left.clone())).await.unwrap();
  graph.add_node(collector("c", right.clone())).await.unwrap();
  graph.add_edge("a", "b", EdgeConfig::default()).await.unwrap();
  graph.add_edge("a", "c", EdgeConfig::default()).await.unwrap();

  timeout(RUN_DEADLINE, graph.start(CancellationToken::new()))
    .await
    .unwrap()
    .unwrap();

  let left = left.lock().unwrap().clone();
  let right = right.lock().unwrap().clone();
  assert_eq!(left.len() + right.len(), 3);
  let mut combined: Vec<String> = left.iter().chain(right.iter()).cloned().collect();
  combined.sort();
  assert_eq!(combined, values);

  let tally_b = graph.edge("a", "b").unwrap().tally();
  let tally_c = graph.edge("a", "c").unwrap().tally();
  assert_eq!(tally_b + tally_c, 3);
  assert_eq!(tally_b as usize, left.len());
  assert_eq!(tally_c as usize, right.len());
}

#[tokio::test]
async fn ping_pong_loop_stops_without_deadlock() {
  init_logs();
  let graph = Arc::new(Graph::default());

  graph
    .add_node(seed("s", vec!["ball".to_string()]))
    .await
    .unwrap();
  graph.add_node(identity("a")).await.unwrap();
  graph.add_node(identity("b")).await.unwrap();
  graph.add_edge("s", "a", EdgeConfig::default()).await.unwrap();
  graph
    .add_edge("a", "b", EdgeConfig::new().capacity(1))
    .await
    .unwrap();
  graph.add_edge("b", "a", EdgeConfig::default()).await.unwrap();

  let run = {
    let graph = graph.clone();
    tokio::spawn(async move { graph.start(CancellationToken::new()).await })
  };

  sleep(Duration::from_millis(300)).await;
  assert_eq!(graph.edge("s", "a").unwrap().tally(), 1);
  let early = graph.edge("b", "a").unwrap().tally();
  assert!(early >= 1, "the ball never came back");

  sleep(Duration::from_millis(200)).await;
  let later = graph.edge("b", "a").unwrap().tally();
  assert!(later >= early);

  graph.stop();
  let result = timeout(RUN_DEADLINE, run).await.unwrap().unwrap();
  assert!(result.is_ok(), "stop must not surface as an error");
}

#[tokio::test]
async fn pause_before_start_isolates_the_seed() {
  let received: Arc<Mutex<Vec<i64>>> = Arc::new(Mutex::new(Vec::new()));

  // B turns into a seed once a->b is paused; with no input it bows out.
  fn pausable_transit(key: &str) -> NodeConfig {
    NodeConfig::new().key(key).request(|_token, input| async move {
      match input {
        Some(value) => Ok(Some(value)),
        None => Err(GraphError::NodeGoingAway),
      }
    })
  }

  async fn build(ignore: bool, sink: Arc<Mutex<Vec<i64>>>) -> Graph {
    let graph = Graph::new(GraphConfig::default().ignore_isolated(ignore));
    graph.add_node(seed("a", vec![1_i64, 2])).await.unwrap();
    graph.add_node(pausable_transit("b")).await.unwrap();
    graph.add_node(collector("c", sink)).await.unwrap();
    graph.add_edge("a", "b", EdgeConfig::default()).await.unwrap();
    graph.add_edge("b", "c", EdgeConfig::default()).await.unwrap();
    graph.pause_edge("a", "b").await.unwrap();
    graph
  }

  let graph = build(false, received.clone()).await;
  let result = timeout(RUN_DEADLINE, graph.start(CancellationToken::new()))
    .await
    .unwrap();
  assert!(matches!(result, Err(GraphError::IsolatedNode(key)) if key == "a"));

  let graph = build(true, received.clone()).await;
  timeout(RUN_DEADLINE, graph.start(CancellationToken::new()))
    .await
    .unwrap()
    .unwrap();
  assert!(received.lock().unwrap().is_empty());
  assert_eq!(graph.edge("a", "b").unwrap().tally(), 0);
  assert_eq!(graph.edge("b", "c").unwrap().tally(), 0);
}

#[tokio::test]
async fn graph_restarts_with_fresh_channels_and_tallies() {
  let graph = Graph::default();
  let received: Arc<Mutex<Vec<i64>>> = Arc::new(Mutex::new(Vec::new()));

  graph.add_node(seed("a", vec![7_i64])).await.unwrap();
  graph
    .add_node(collector("b", received.clone()))
    .await
    .unwrap();
  graph.add_edge("a", "b", EdgeConfig::default()).await.unwrap();

  timeout(RUN_DEADLINE, graph.start(CancellationToken::new()))
    .await
    .unwrap()
    .unwrap();
  assert_eq!(graph.edge("a", "b").unwrap().tally(), 1);

  // The seed is exhausted: the second session ends immediately, with
  // the tally reset and the reopened channel closed again.
  timeout(RUN_DEADLINE, graph.start(CancellationToken::new()))
    .await
    .unwrap()
    .unwrap();
  assert_eq!(graph.edge("a", "b").unwrap().tally(), 0);
  assert_eq!(*received.lock().unwrap(), vec![7]);
}

#[tokio::test]
async fn emitter_transit_fans_out_per_input() {
  let graph = Graph::default();
  let received: Arc<Mutex<Vec<i64>>> = Arc::new(Mutex::new(Vec::new()));

  graph.add_node(seed("a", vec![1_i64, 2])).await.unwrap();
  graph
    .add_node(
      NodeConfig::new()
        .key("b")
        .emit(|_token, input, emit| async move {
          if let Some(value) = input {
            let n = *value.downcast_ref::<i64>().unwrap();
            // Each input fans out into itself and its double.
            emit.emit(payload(n)).await;
            emit.emit(payload(n * 10)).await;
          }
          Ok(())
        }),
    )
    .await
    .unwrap();
  graph
    .add_node(collector("c", received.clone()))
    .await
    .unwrap();
  graph.add_edge("a", "b", EdgeConfig::default()).await.unwrap();
  graph.add_edge("b", "c", EdgeConfig::default()).await.unwrap();

  timeout(RUN_DEADLINE, graph.start(CancellationToken::new()))
    .await
    .unwrap()
    .unwrap();

  let mut got = received.lock().unwrap().clone();
  got.sort();
  assert_eq!(got, vec![1, 2, 10, 20]);
  assert_eq!(graph.edge("b", "c").unwrap().tally(), 4);
}

#[tokio::test]
async fn stop_gracetime_delays_cancellation() {
  let gracetime = Duration::from_millis(200);
  let graph = Arc::new(Graph::new(GraphConfig::default().stop_gracetime(gracetime)));

  graph
    .add_node(
      NodeConfig::new()
        .key("ticker")
        .request(|_token, _input| async move {
          sleep(Duration::from_millis(10)).await;
          Ok(Some(payload(())))
        }),
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
    .add_edge("ticker", "sink", EdgeConfig::default())
    .await
    .unwrap();

  let run = {
    let graph = graph.clone();
    tokio::spawn(async move { graph.start(CancellationToken::new()).await })
  };
  sleep(Duration::from_millis(100)).await;

  let stopped_at = Instant::now();
  graph.stop();
  timeout(RUN_DEADLINE, run).await.unwrap().unwrap().unwrap();
  assert!(
    stopped_at.elapsed() >= gracetime,
    "cancellation fired before the gracetime"
  );
}

#[tokio::test]
async fn user_error_fails_the_run_and_frees_the_graph() {
  let graph = Graph::default();
  graph.add_node(seed("a", vec![1_i64, 2, 3])).await.unwrap();
  graph
    .add_node(
      NodeConfig::new()
        .key("b")
        .request(|_token, _input| async move {
          Err(GraphError::user("b rejects everything"))
        }),
    )
    .await
    .unwrap();
  graph.add_edge("a", "b", EdgeConfig::default()).await.unwrap();

  let result = timeout(RUN_DEADLINE, graph.start(CancellationToken::new()))
    .await
    .unwrap();
  match result {
    Err(GraphError::User(e)) => assert!(e.to_string().contains("b rejects everything")),
    other => panic!("expected the user error, got {:?}", other.err()),
  }

  // The failed run released the session lock; the graph is editable.
  graph.remove_edge("a", "b").await.unwrap();
  graph.purge().await.unwrap();
  assert!(graph.nodes().is_empty());
}

#[tokio::test]
async fn uptime_reflects_the_session() {
  let graph = Graph::new(GraphConfig::default().ignore_isolated(true));
  graph.add_node(identity("only")).await.unwrap();
  assert_eq!(graph.uptime(), Duration::ZERO);
  timeout(RUN_DEADLINE, graph.start(CancellationToken::new()))
    .await
    .unwrap()
    .unwrap();
  assert!(graph.uptime() > Duration::ZERO);
}
