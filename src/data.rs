//! # Node Data
//!
//! Values flowing through ports are type-erased and shared: a [`NodeData`] wraps
//! an `Arc<dyn Any + Send + Sync>`, so fanning a value out to several downstream
//! ports or handing it to a worker thread is a reference-count increment.
//!
//! Nodes downcast to the concrete type they expect with [`NodeData::value`].

use std::any::{Any, type_name};
use std::fmt;
use std::sync::Arc;

/// A shared, immutable, type-erased port value.
#[derive(Clone)]
pub struct NodeData {
  value: Arc<dyn Any + Send + Sync>,
  type_name: &'static str,
}

impl NodeData {
  /// Wraps `value`.
  ///
  /// # Example
  ///
  /// ```rust
  /// use nodeweave::NodeData;
  ///
  /// let data = NodeData::new(42i64);
  /// assert_eq!(data.value::<i64>(), Some(&42));
  /// assert_eq!(data.value::<f64>(), None);
  /// ```
  pub fn new<T: Any + Send + Sync>(value: T) -> Self {
    Self {
      value: Arc::new(value),
      type_name: type_name::<T>(),
    }
  }

  /// Wraps an already shared value without re-allocating.
  pub fn from_arc<T: Any + Send + Sync>(value: Arc<T>) -> Self {
    Self {
      value,
      type_name: type_name::<T>(),
    }
  }

  /// Downcasts to `T`, returning `None` if the value has another type.
  pub fn value<T: Any>(&self) -> Option<&T> {
    self.value.downcast_ref::<T>()
  }

  /// Returns `true` if the wrapped value is a `T`.
  pub fn is<T: Any>(&self) -> bool {
    self.value.is::<T>()
  }

  /// Rust type name of the wrapped value, for diagnostics.
  pub fn type_name(&self) -> &'static str {
    self.type_name
  }

  /// Returns `true` if both handles share the same allocation.
  pub fn ptr_eq(&self, other: &NodeData) -> bool {
    Arc::ptr_eq(&self.value, &other.value)
  }
}

impl fmt::Debug for NodeData {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_tuple("NodeData").field(&self.type_name).finish()
  }
}
