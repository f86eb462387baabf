#![doc = include_str!("../README.md")]

pub mod dot;
pub mod edge;
pub mod error;
pub mod flow;
pub mod graph;
mod macros;
pub mod node;
pub mod payload;
mod session;
mod worker;

pub use edge::{Edge, EdgeConfig};
pub use error::GraphError;
pub use graph::{Graph, GraphConfig};
pub use node::{EmitHandle, Node, NodeConfig};
pub use payload::{payload, Payload};

/// Re-exported so callers don't need a direct `tokio-util` dependency
/// to drive [`Graph::start`].
pub use tokio_util::sync::CancellationToken;
