//! Pipeline builders: syntactic sugar over the graph API.
//!
//! [`Plan`] declares an explicit DAG of keyed steps with upstream
//! connections; [`Seq`] chains steps one after another with generated
//! keys. Both compile down to graph nodes and edges in one deferred
//! pass on first run, accumulate construction errors instead of
//! failing fast, and invoke the terminal steps' callbacks after a
//! successful run.

mod plan;
mod seq;
mod step;

pub use plan::Plan;
pub use seq::Seq;
pub use step::{Step, StepKind};
