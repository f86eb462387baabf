//! The opaque value flowing over edges.
//!
//! Edges carry type-erased `Arc` values; nodes downcast to the concrete
//! type they expect. Heterogeneous graphs pass an explicit enum as the
//! payload type.

use std::any::Any;
use std::sync::Arc;

/// A type-erased, cheaply clonable value travelling over an edge.
pub type Payload = Arc<dyn Any + Send + Sync>;

/// Wraps a value as a [`Payload`].
pub fn payload<T>(value: T) -> Payload
where
  T: Any + Send + Sync,
{
  Arc::new(value)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn payload_round_trips_through_downcast() {
    let p = payload(41_i64);
    assert_eq!(*p.downcast_ref::<i64>().unwrap(), 41);
    assert!(p.downcast_ref::<String>().is_none());
  }
}
