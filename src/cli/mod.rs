//! Command-line interface for agent-scheduler.
//!
//! Provides commands for running the scheduler and for inspecting or
//! repairing its store.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};
