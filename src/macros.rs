//! Internal logging helper.

/// Engine events go to `debug` when the graph was built verbose,
/// otherwise to `trace`.
macro_rules! vlog {
  ($verbose:expr, $($arg:tt)+) => {
    if $verbose {
      tracing::debug!($($arg)+);
    } else {
      tracing::trace!($($arg)+);
    }
  };
}

pub(crate) use vlog;
