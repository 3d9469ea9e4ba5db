//! Execution model configuration.
//!
//! Every field has a default, so a configuration document only needs to name
//! what it changes:
//!
//! ```rust
//! use nodeweave::{EvalMode, ExecutionConfig};
//!
//! let config = ExecutionConfig::from_json(r#"{ "worker_threads": 2, "default_eval_mode": "blocking" }"#)?;
//! assert_eq!(config.worker_threads, 2);
//! assert_eq!(config.default_eval_mode, EvalMode::Blocking);
//! # Ok::<(), nodeweave::ExecutionError>(())
//! ```

use crate::error::ExecutionError;
use crate::node::EvalMode;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Settings of an [`ExecutionModel`](crate::ExecutionModel).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
  /// Number of worker threads evaluating background nodes.
  pub worker_threads: usize,
  /// Name prefix of worker threads.
  pub thread_name: String,
  /// Longest single sleep inside a blocking wait before state is re-checked.
  #[serde(with = "duration_ms")]
  pub idle_poll_interval: Duration,
  /// Mode of nodes built without an explicit evaluation mode.
  pub default_eval_mode: EvalMode,
}

impl ExecutionConfig {
  /// Creates the default configuration.
  pub fn new() -> Self {
    Self::default()
  }

  /// Parses a JSON configuration document.
  ///
  /// # Errors
  ///
  /// [`ExecutionError::Config`] if the document is malformed or names a
  /// zero-sized worker pool.
  pub fn from_json(json: &str) -> Result<Self, ExecutionError> {
    let config: Self = serde_json::from_str(json)?;
    config.validate()?;
    Ok(config)
  }

  /// Checks the configuration for values no model can run with.
  ///
  /// # Errors
  ///
  /// [`ExecutionError::Config`] describing the first invalid value.
  pub fn validate(&self) -> Result<(), ExecutionError> {
    if self.worker_threads == 0 {
      return Err(ExecutionError::Config(
        "worker_threads must be at least 1".to_string(),
      ));
    }
    if self.idle_poll_interval.is_zero() {
      return Err(ExecutionError::Config(
        "idle_poll_interval must be positive".to_string(),
      ));
    }
    Ok(())
  }

  /// Sets the worker pool size.
  pub fn with_worker_threads(mut self, n: usize) -> Self {
    self.worker_threads = n;
    self
  }

  /// Sets the worker thread name prefix.
  pub fn with_thread_name(mut self, name: impl Into<String>) -> Self {
    self.thread_name = name.into();
    self
  }

  /// Sets the idle poll interval.
  pub fn with_idle_poll_interval(mut self, d: Duration) -> Self {
    self.idle_poll_interval = d;
    self
  }

  /// Sets the default evaluation mode.
  pub fn with_default_eval_mode(mut self, mode: EvalMode) -> Self {
    self.default_eval_mode = mode;
    self
  }
}

impl Default for ExecutionConfig {
  fn default() -> Self {
    Self {
      worker_threads: std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1),
      thread_name: "nodeweave-worker".to_string(),
      idle_poll_interval: Duration::from_millis(50),
      default_eval_mode: EvalMode::Detached,
    }
  }
}

mod duration_ms {
  use serde::{Deserialize, Deserializer, Serializer};
  use std::time::Duration;

  pub fn serialize<S: Serializer>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
  }

  pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    u64::deserialize(deserializer).map(Duration::from_millis)
  }
}
