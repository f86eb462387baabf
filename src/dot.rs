//! Graphviz DOT rendering of a graph.
//!
//! A pure formatter over the public accessors; write the output to a
//! `.dot` file or pipe it to `dot -Tsvg` yourself.

use crate::graph::Graph;
use std::fmt::Write;

/// Renders the graph, its nodes, and its edges as a `strict digraph`.
///
/// Distributor nodes with egress are filled; paused edges are gray with
/// no arrowhead, removed edges red. Labels carry per-session uptimes
/// and edge tallies.
pub fn render(graph: &Graph) -> String {
  let mut out = String::new();
  out.push_str("strict digraph {\n");
  out.push_str("  labelloc=\"t\"\n");
  let _ = writeln!(out, "  label=\"uptime: {:?}\"\n", graph.uptime());
  out.push_str("  node [shape=ellipse]\n");

  for key in graph.nodes() {
    let node = match graph.node(&key) {
      Ok(node) => node,
      Err(_) => continue,
    };
    let distributing = node.is_distributor()
      && graph.egress(&key).iter().any(|e| !e.is_removed());
    let (style, fill) = if distributing {
      ("filled", "lightyellow")
    } else {
      ("", "")
    };
    let _ = writeln!(
      out,
      "  \"{}\" [label=\"{}\\n({:?})\", style=\"{}\", fillcolor=\"{}\"];",
      key,
      key,
      node.uptime(),
      style,
      fill
    );
  }

  for edge in graph.edges() {
    let color = if edge.is_removed() {
      "red"
    } else if edge.is_paused() {
      "gray"
    } else {
      "lightblue"
    };
    let arrowhead = if edge.is_paused() || edge.is_removed() {
      "none"
    } else {
      "normal"
    };
    let _ = writeln!(
      out,
      "  \"{}\" -> \"{}\" [label=\"{}\\n({:?})\", color=\"{}\", arrowhead=\"{}\"];",
      edge.from(),
      edge.to(),
      edge.tally(),
      edge.uptime(),
      color,
      arrowhead
    );
  }

  out.push_str("}\n");
  out
}
