//! Metrics module for Prometheus-based monitoring.
//!
//! Covers the scheduler tick, acquisition, circuit breakers, Lua scripts,
//! cleanup passes and backlog health.
//!
//! # Example
//!
//! ```ignore
//! use agent_scheduler::metrics::{init_metrics, export_metrics, SchedulerMetrics};
//!
//! init_metrics().expect("Failed to initialize metrics");
//! let metrics = SchedulerMetrics::new();
//! metrics.record_run_failure();
//! let text = export_metrics();
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::{AcquireMode, CleanupKind, SchedulerMetrics};
pub use prometheus::{export_metrics, init_metrics, REGISTRY};
