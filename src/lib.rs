//! agent-scheduler: distributed periodic agent scheduling with at most one
//! owner per agent.
//!
//! Agents are coordinated through two sorted sets in a shared store
//! (Redis in production). See [`scheduler`] for the model and
//! [`scheduler::PriorityAgentScheduler`] for the entry point.

pub mod cli;
pub mod config;
pub mod error;
pub mod metrics;
pub mod scheduler;

pub use error::{ConfigError, SchedulerError, StoreError};
