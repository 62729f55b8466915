//! Command-line interface for research-orchestrator.
//!
//! Provides commands for running and routing research requests, checking
//! plan files and listing configured capabilities.

mod commands;

pub use commands::{load_plan_file, parse_cli, run, run_with_cli, Cli, Commands};
