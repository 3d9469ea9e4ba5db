//! # Configuration Test Suite
//!
//! Tests for [`ExecutionConfig`]: defaults, builder setters, JSON parsing and
//! validation.

use crate::config::ExecutionConfig;
use crate::error::ExecutionError;
use crate::node::EvalMode;
use std::time::Duration;

#[test]
fn test_defaults() {
  let config = ExecutionConfig::default();

  assert!(config.worker_threads >= 1);
  assert_eq!(config.thread_name, "nodeweave-worker");
  assert_eq!(config.idle_poll_interval, Duration::from_millis(50));
  assert_eq!(config.default_eval_mode, EvalMode::Detached);
  assert!(config.validate().is_ok());
}

#[test]
fn test_builder_setters() {
  let config = ExecutionConfig::new()
    .with_worker_threads(3)
    .with_thread_name("render")
    .with_idle_poll_interval(Duration::from_millis(5))
    .with_default_eval_mode(EvalMode::Exclusive);

  assert_eq!(config.worker_threads, 3);
  assert_eq!(config.thread_name, "render");
  assert_eq!(config.idle_poll_interval, Duration::from_millis(5));
  assert_eq!(config.default_eval_mode, EvalMode::Exclusive);
}

#[test]
fn test_from_json_fills_missing_fields_with_defaults() {
  let config = ExecutionConfig::from_json(r#"{ "idle_poll_interval": 10 }"#).unwrap();

  assert_eq!(config.idle_poll_interval, Duration::from_millis(10));
  assert_eq!(config.thread_name, "nodeweave-worker");
}

#[test]
fn test_json_round_trip_keeps_milliseconds() {
  let config = ExecutionConfig::new().with_idle_poll_interval(Duration::from_millis(125));
  let json = serde_json::to_string(&config).unwrap();

  assert!(json.contains("\"idle_poll_interval\":125"));
  assert_eq!(ExecutionConfig::from_json(&json).unwrap(), config);
}

#[test]
fn test_from_json_rejects_malformed_document() {
  let err = ExecutionConfig::from_json("{ worker_threads: }").unwrap_err();

  assert!(matches!(err, ExecutionError::Config(_)));
}

#[test]
fn test_validate_rejects_zero_values() {
  let err = ExecutionConfig::from_json(r#"{ "worker_threads": 0 }"#).unwrap_err();
  assert_eq!(
    err,
    ExecutionError::Config("worker_threads must be at least 1".to_string())
  );

  let config = ExecutionConfig::new().with_idle_poll_interval(Duration::ZERO);
  assert!(config.validate().is_err());
}
