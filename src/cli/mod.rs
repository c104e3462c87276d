//! Command-line interface for bistro-queue.
//!
//! Provides commands for serving the liveness probe, submitting jobs,
//! following queue events, and reading queue counts.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, BrokerArgs, Cli, Commands};
